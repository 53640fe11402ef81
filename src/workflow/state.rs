use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::task::{Task, TaskStatus};

/// Default workflow-level retry budget
pub const DEFAULT_WORKFLOW_MAX_RETRIES: u32 = 3;

/// Default workflow-level timeout in seconds
pub const DEFAULT_WORKFLOW_TIMEOUT_SECS: u64 = 300;

/// Execution status of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created, not yet executed
    #[default]
    Pending,
    /// The engine is driving it
    Running,
    /// Every task completed
    Completed,
    /// At least one task ended failed, or the loop stalled
    Failed,
    /// Stopped by the caller
    Cancelled,
    /// Suspended by the caller
    Paused,
}

impl WorkflowStatus {
    /// Snake-case name used in serialized form
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
            WorkflowStatus::Paused => "paused",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ordered collection of tasks and the status of their execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique ID of the workflow
    pub workflow_id: String,

    /// Name of the workflow
    pub name: String,

    /// Description of the workflow
    #[serde(default)]
    pub description: String,

    /// Tasks, in display order
    #[serde(default)]
    pub tasks: Vec<Task>,

    /// Metadata for the workflow
    #[serde(default)]
    pub metadata: Map<String, Value>,

    /// Current status of the workflow
    #[serde(default)]
    pub status: WorkflowStatus,

    /// Workflow-level retry default
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Workflow-level timeout default
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Workflow-level diagnostic (deadlock, cycle, round limit)
    #[serde(default)]
    pub error: Option<String>,

    /// Start time of the last execution
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    /// End time of the last execution
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

fn default_max_retries() -> u32 {
    DEFAULT_WORKFLOW_MAX_RETRIES
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_WORKFLOW_TIMEOUT_SECS
}

impl Workflow {
    /// Create a new empty workflow
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            workflow_id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: String::new(),
            tasks: Vec::new(),
            metadata: Map::new(),
            status: WorkflowStatus::Pending,
            max_retries: DEFAULT_WORKFLOW_MAX_RETRIES,
            timeout_seconds: DEFAULT_WORKFLOW_TIMEOUT_SECS,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Replace the generated id
    pub fn with_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = workflow_id.into();
        self
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Builder form of [`Workflow::add_task`]
    pub fn with_task(mut self, task: Task) -> Self {
        self.add_task(task);
        self
    }

    /// Append a task
    pub fn add_task(&mut self, task: Task) {
        self.tasks.push(task);
    }

    /// Look up a task by id
    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    /// Look up a task by name
    pub fn task_by_name(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Set a single metadata value
    pub fn set_metadata<T: Into<Value>>(&mut self, key: &str, value: T) {
        self.metadata.insert(key.to_string(), value.into());
    }

    /// Update the status of the workflow
    pub fn update_status(&mut self, status: WorkflowStatus) {
        self.status = status;
    }

    /// Whether the engine is done with this workflow
    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    /// Count tasks by status
    pub fn summary(&self) -> WorkflowSummary {
        let count = |status: TaskStatus| self.tasks.iter().filter(|t| t.status == status).count();

        WorkflowSummary {
            workflow_id: self.workflow_id.clone(),
            status: self.status,
            total: self.tasks.len(),
            completed: count(TaskStatus::Completed),
            failed: count(TaskStatus::Failed),
            skipped: count(TaskStatus::Skipped),
            pending: count(TaskStatus::Pending)
                + count(TaskStatus::Running)
                + count(TaskStatus::WaitingApproval),
            duration_ms: match (self.started_at, self.finished_at) {
                (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
                _ => None,
            },
            error: self.error.clone(),
        }
    }
}

impl fmt::Display for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Workflow(name={:?}, status={}, tasks={})",
            self.name,
            self.status,
            self.tasks.len()
        )
    }
}

/// Per-status task counts for a workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    /// ID of the summarized workflow
    pub workflow_id: String,

    /// Workflow status
    pub status: WorkflowStatus,

    /// Number of tasks
    pub total: usize,

    /// Completed tasks
    pub completed: usize,

    /// Failed tasks
    pub failed: usize,

    /// Skipped tasks
    pub skipped: usize,

    /// Tasks that have not reached a terminal state
    pub pending: usize,

    /// Wall-clock duration of the last execution
    pub duration_ms: Option<i64>,

    /// Workflow-level diagnostic
    pub error: Option<String>,
}

impl WorkflowSummary {
    /// Check if the workflow completed
    pub fn is_success(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }
}
