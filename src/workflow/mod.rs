//! Workflow engine for dependency-driven task orchestration.
//!
//! This module provides:
//!
//! - Task and workflow state machines
//! - A scheduling loop that dispatches every ready task concurrently
//! - Per-attempt timeouts and retry budgets
//! - A human approval gate for sensitive tasks
//! - Deadlock and cycle diagnostics

/// Agent contract and registry
pub mod agent;
/// Human approval queue
pub mod approval;
/// Declarative workflow definitions
pub mod definition;
/// Dependency graph analysis
pub mod dependency;
/// Workflow execution engine
pub mod engine;
/// Workflow model and status
pub mod state;
/// Task model and state machine
pub mod task;

// Re-export key components
pub use agent::{Agent, AgentInfo, AgentRegistry, Context, FnAgent};
pub use approval::{ApprovalOutcome, ApprovalQueue, ApprovalRequest, ApprovalStatus};
pub use definition::{StepDefinition, WorkflowDefinition};
pub use engine::{RetryConfig, WorkflowEngine, WorkflowEngineConfig};
pub use state::{Workflow, WorkflowStatus, WorkflowSummary};
pub use task::{Task, TaskError, TaskPriority, TaskStatus};
