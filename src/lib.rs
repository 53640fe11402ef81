#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![deny(rustdoc::missing_crate_level_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![deny(rustdoc::invalid_codeblock_attributes)]
#![deny(rustdoc::invalid_html_tags)]
#![deny(rustdoc::bare_urls)]
#![deny(clippy::missing_panics_doc)]

//! AgentFlow is a workflow engine for multi-agent task orchestration.
//! Tasks declare dependencies, priorities, retry and timeout budgets and
//! optional human approval gates; the engine repeatedly finds the tasks whose
//! dependencies have completed, runs them concurrently on their assigned
//! agents, and settles the workflow as completed or failed.
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agent_flow::workflow::{Context, FnAgent, Task, Workflow, WorkflowEngine, WorkflowStatus};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut engine = WorkflowEngine::new(None);
//!     engine.register_agent(Arc::new(FnAgent::new("writer", |task: Task, _ctx: Context| async move {
//!         Ok(json!({ "text": format!("done: {}", task.name) }))
//!     })));
//!
//!     let workflow = Workflow::new("report")
//!         .with_task(Task::new("draft").with_id("draft").with_agent("writer"))
//!         .with_task(Task::new("review").with_agent("writer").depends_on("draft"));
//!
//!     let workflow = engine.execute(workflow, Context::new()).await;
//!     assert_eq!(workflow.status, WorkflowStatus::Completed);
//! }
//! ```

/// Configuration management
pub mod config;

/// Error types for AgentFlow
pub mod error;

/// Logging and metrics
pub mod telemetry;

/// Workflow engine for orchestrating tasks and managing workflow state
pub mod workflow;

// Re-export error types
pub use error::{FlowError, Result};

// Re-export workflow types
pub use workflow::{
    Agent, ApprovalQueue, ApprovalRequest, ApprovalStatus, Context, FnAgent, Task, TaskPriority,
    TaskStatus, Workflow, WorkflowEngine, WorkflowEngineConfig, WorkflowStatus,
};

/// Re-export telemetry types and functions for easier access
pub use telemetry::{add_metric, init_telemetry, span_duration, TelemetryConfig};
