use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Default per-attempt timeout for a task
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 60;

/// Default retry budget for a task
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Execution status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for its dependencies or for a retry
    #[default]
    Pending,
    /// An attempt is in flight
    Running,
    /// Finished successfully
    Completed,
    /// Last attempt failed
    Failed,
    /// Intentionally bypassed by the caller
    Skipped,
    /// Suspended on the approval gate
    WaitingApproval,
}

impl TaskStatus {
    /// Snake-case name used in serialized form
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::WaitingApproval => "waiting_approval",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisory ordering hint among tasks that become ready in the same round.
///
/// Variants are declared lowest first so that `Ord` sorts `Critical` last.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    /// Low priority
    Low,
    /// Medium priority
    #[default]
    Medium,
    /// High priority
    High,
    /// Critical priority
    Critical,
}

/// Why a task attempt (or a task as a whole) failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// Task has no `agent_id`
    #[error("Task {0} has no agent assigned")]
    MissingAgent(String),

    /// `agent_id` does not resolve in the engine's registry
    #[error("No agent found with id: {0}")]
    AgentNotRegistered(String),

    /// The agent returned an error
    #[error("{0}")]
    Execution(String),

    /// The agent did not answer within the task's budget
    #[error("Task {name} timed out after {seconds}s")]
    Timeout {
        /// Task name
        name: String,
        /// Budget that was exceeded
        seconds: u64,
    },

    /// The agent panicked while running
    #[error("Agent panicked: {0}")]
    Panicked(String),

    /// A human rejected the approval request
    #[error("Approval rejected: {0}")]
    ApprovalRejected(String),

    /// Nobody decided on the approval request in time
    #[error("Approval request {0} expired")]
    ApprovalExpired(String),

    /// A dependency ended in `failed` or `skipped` and can never complete
    #[error("Dependency {0} did not complete")]
    DependencyFailed(String),

    /// A dependency names a task that is not part of the workflow
    #[error("Unknown dependency: {0}")]
    UnknownDependency(String),

    /// The task sits on a dependency cycle
    #[error("Dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    /// Two tasks in the workflow share this id
    #[error("Duplicate task id: {0}")]
    DuplicateTaskId(String),

    /// The engine's round circuit breaker tripped before the task ran
    #[error("Workflow stopped after {0} rounds")]
    RoundLimitExceeded(usize),
}

impl TaskError {
    /// Whether a failure of this kind may be followed by another attempt.
    ///
    /// Approval outcomes are final unless the caller resets the task, and
    /// dependency errors cannot be fixed by running the task again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TaskError::MissingAgent(_)
                | TaskError::AgentNotRegistered(_)
                | TaskError::Execution(_)
                | TaskError::Timeout { .. }
                | TaskError::Panicked(_)
        )
    }
}

/// A single unit of work in a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique, immutable identity
    pub task_id: String,

    /// Display name
    pub name: String,

    /// Display description
    #[serde(default)]
    pub description: String,

    /// Worker that must execute this task
    #[serde(default)]
    pub agent_id: Option<String>,

    /// Caller-supplied input
    #[serde(default)]
    pub input_data: Map<String, Value>,

    /// Output, set once on success
    #[serde(default)]
    pub output_data: Option<Map<String, Value>>,

    /// Ids of tasks in the same workflow that must complete first
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Current state
    #[serde(default)]
    pub status: TaskStatus,

    /// Ordering hint
    #[serde(default)]
    pub priority: TaskPriority,

    /// Gate the agent invocation behind the approval queue
    #[serde(default)]
    pub requires_approval: bool,

    /// Retry budget
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Failed attempts so far
    #[serde(default)]
    pub retry_count: u32,

    /// Wall-clock budget for one attempt
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Free-form annotations
    #[serde(default)]
    pub metadata: Map<String, Value>,

    /// Last failure message
    #[serde(default)]
    pub error: Option<String>,

    /// Approval request raised for this task, if any
    #[serde(default)]
    pub approval_request_id: Option<String>,

    /// When the first attempt started
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    /// When the task last reached a terminal state
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_TASK_TIMEOUT_SECS
}

impl Task {
    /// Create a new pending task with a random id
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: String::new(),
            agent_id: None,
            input_data: Map::new(),
            output_data: None,
            dependencies: Vec::new(),
            status: TaskStatus::Pending,
            priority: TaskPriority::Medium,
            requires_approval: false,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_count: 0,
            timeout_seconds: DEFAULT_TASK_TIMEOUT_SECS,
            metadata: Map::new(),
            error: None,
            approval_request_id: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Replace the generated id
    pub fn with_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Assign the task to an agent
    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Set the input mapping
    pub fn with_input(mut self, input: Map<String, Value>) -> Self {
        self.input_data = input;
        self
    }

    /// Add a dependency; duplicates are ignored
    pub fn depends_on(mut self, task_id: impl Into<String>) -> Self {
        let task_id = task_id.into();
        if !self.dependencies.contains(&task_id) {
            self.dependencies.push(task_id);
        }
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Require human approval before the agent runs
    pub fn with_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    /// Set the retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the per-attempt timeout in seconds
    pub fn with_timeout_secs(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Per-attempt timeout as a Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// All dependencies are in `completed_ids`
    pub fn is_ready(&self, completed_ids: &HashSet<String>) -> bool {
        self.dependencies.iter().all(|dep| completed_ids.contains(dep))
    }

    /// Another attempt is allowed by the retry budget
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// `completed`, `failed` and `skipped` are terminal once the engine
    /// has stopped retrying
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    /// Enter `running`
    pub fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Enter `waiting_approval`
    pub fn mark_waiting_approval(&mut self, request_id: impl Into<String>) {
        self.status = TaskStatus::WaitingApproval;
        self.approval_request_id = Some(request_id.into());
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Enter `completed` with the agent's output
    pub fn mark_completed(&mut self, output: Map<String, Value>) {
        self.status = TaskStatus::Completed;
        self.output_data = Some(output);
        self.error = None;
        self.finished_at = Some(Utc::now());
    }

    /// Enter `failed` and count the failure against the retry budget
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        self.retry_count += 1;
        self.finished_at = Some(Utc::now());
    }

    /// Enter `failed` without counting an attempt, used when the task can
    /// never be dispatched
    pub fn mark_blocked(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        self.finished_at = Some(Utc::now());
    }

    /// Enter `skipped`
    pub fn mark_skipped(&mut self) {
        self.status = TaskStatus::Skipped;
        self.finished_at = Some(Utc::now());
    }

    /// Return a failed task to `pending` for another attempt. The last error
    /// stays visible until an attempt succeeds.
    pub fn reset_for_retry(&mut self) {
        self.status = TaskStatus::Pending;
        self.finished_at = None;
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Task(name={:?}, status={}, priority={:?})",
            self.name, self.status, self.priority
        )
    }
}

/// Coerce an agent result into an output mapping. Objects pass through,
/// anything else is wrapped as `{"result": value}`.
pub fn coerce_output(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("result".to_string(), other);
            map
        }
    }
}
