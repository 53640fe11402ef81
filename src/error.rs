//! Error types for AgentFlow
//!
//! Only contract violations and I/O surface through [`FlowError`]. Ordinary task
//! failures are captured in task state (see [`crate::workflow::task::TaskError`]).

use thiserror::Error;

/// Result type for AgentFlow operations
pub type Result<T> = std::result::Result<T, FlowError>;

/// AgentFlow error types
#[derive(Debug, Error)]
pub enum FlowError {
    /// I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// A workflow definition that can never be executed as written
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    /// Approval request id not known to the queue
    #[error("Approval request not found: {0}")]
    ApprovalNotFound(String),
}
