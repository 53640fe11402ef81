//! Logging and metrics for the workflow engine
//!
//! Logs go through `tracing`. Metrics are `tracing` events on the `metrics`
//! target, so any subscriber (or none) decides where they end up.

use tracing_subscriber::EnvFilter;

/// Configuration for the telemetry system
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Name of the service
    pub service_name: String,
    /// Enable ANSI console output
    pub enable_console: bool,
    /// Log level or filter directive, overridden by `RUST_LOG`
    pub log_level: String,
    /// Emit JSON lines
    pub json_output: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "agent-flow".to_string(),
            enable_console: true,
            log_level: "info".to_string(),
            json_output: false,
        }
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_telemetry(
    config: TelemetryConfig,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if config.json_output {
        builder.json().try_init()?;
    } else {
        builder.with_ansi(config.enable_console).try_init()?;
    }

    tracing::info!(service = %config.service_name, "Telemetry initialized");
    Ok(())
}

/// Add a single metric with tags to the telemetry system
pub fn add_metric(name: &str, value: f64, tags: &[(&str, String)]) {
    let tags_str = tags
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",");

    tracing::info!(
        target: "metrics",
        metric_name = %name,
        metric_value = %value,
        metric_tags = %tags_str,
        "Recorded metric"
    );
}

/// A span duration tracker for measuring operation durations
pub fn span_duration(name: &'static str) -> impl Drop {
    struct Guard {
        name: &'static str,
        start: std::time::Instant,
    }

    impl Drop for Guard {
        fn drop(&mut self) {
            let duration = self.start.elapsed();
            tracing::debug!(
                target: "metrics",
                duration_ms = duration.as_millis() as f64,
                operation = self.name,
                "Operation completed"
            );
        }
    }

    Guard {
        name,
        start: std::time::Instant::now(),
    }
}
