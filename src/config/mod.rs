use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{FlowError, Result};
use crate::telemetry::TelemetryConfig;
use crate::workflow::WorkflowEngineConfig;

/// Settings for AgentFlow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Workflow engine settings
    #[serde(default)]
    pub engine: WorkflowEngineConfig,

    /// Logger settings
    #[serde(default)]
    pub logger: LoggerSettings,
}

/// Logger settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggerSettings {
    /// Log level or filter directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Telemetry configuration derived from the logger settings
    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            log_level: self.logger.level.clone(),
            json_output: self.logger.json,
            ..TelemetryConfig::default()
        }
    }
}

/// Load settings from a YAML file
pub fn load_settings<P: AsRef<Path>>(path: P) -> Result<Settings> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|e| {
        FlowError::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;

    serde_yaml::from_str(&contents)
        .map_err(|e| FlowError::Config(format!("Failed to parse config file: {}", e)))
}

/// Get settings, optionally from a specific file
pub fn get_settings(config_path: Option<&str>) -> Result<Settings> {
    match config_path {
        Some(path) => load_settings(path),
        None => {
            // Try to find config file in common locations
            let default_paths = [
                "agent_flow.config.yaml",
                "config/agent_flow.config.yaml",
            ];

            for path in default_paths {
                if Path::new(path).exists() {
                    return load_settings(path);
                }
            }

            // Return default settings if no config file is found
            Ok(Settings::default())
        }
    }
}
