use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use futures::FutureExt;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::agent::{Agent, AgentInfo, AgentRegistry, Context};
use super::approval::{ApprovalQueue, ApprovalStatus, DEFAULT_APPROVAL_TIMEOUT_SECS};
use super::dependency::{diagnose_stall, find_duplicate_id};
use super::state::{Workflow, WorkflowStatus};
use super::task::{coerce_output, Task, TaskError, TaskStatus};
use crate::telemetry::{add_metric, span_duration};

/// Backoff applied before a retried attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry in milliseconds; 0 disables backoff
    pub initial_interval_ms: u64,

    /// Maximum delay between retries in milliseconds
    pub max_interval_ms: u64,

    /// Multiplier for backoff
    pub backoff_coefficient: f64,

    /// Spread each delay by up to ±10%
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 0,
            max_interval_ms: 10000,
            backoff_coefficient: 2.0,
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// Delay before the attempt that follows `failures` failed attempts
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 || self.initial_interval_ms == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_interval_ms as f64
            * self.backoff_coefficient.powi(failures as i32 - 1);
        let mut delay = base_delay.min(self.max_interval_ms as f64);

        if self.jitter {
            delay += (rand::thread_rng().gen_range(0.0..0.2) - 0.1) * delay;
        }

        Duration::from_millis(delay.max(0.0) as u64)
    }
}

/// Configuration for the workflow engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowEngineConfig {
    /// Decision budget for approval requests raised by gated tasks
    pub approval_timeout_secs: u64,

    /// Maximum number of agent invocations in flight at once
    pub max_concurrent_tasks: Option<usize>,

    /// Backoff between attempts of a failing task
    pub retry: RetryConfig,

    /// Override for the round circuit breaker
    pub max_rounds: Option<usize>,
}

impl Default for WorkflowEngineConfig {
    fn default() -> Self {
        Self {
            approval_timeout_secs: DEFAULT_APPROVAL_TIMEOUT_SECS,
            max_concurrent_tasks: None,
            retry: RetryConfig::default(),
            max_rounds: None,
        }
    }
}

/// Engine for executing workflows
#[derive(Debug, Clone)]
pub struct WorkflowEngine {
    /// Unique ID of the workflow engine
    id: String,

    /// Configuration for the workflow engine
    config: Arc<WorkflowEngineConfig>,

    /// Agents tasks can be dispatched to
    agents: AgentRegistry,

    /// Gate for tasks that require approval
    approvals: ApprovalQueue,

    /// Status of workflows currently executing
    running: Arc<RwLock<HashMap<String, WorkflowStatus>>>,
}

impl Default for WorkflowEngine {
    fn default() -> Self {
        Self::new(None)
    }
}

impl WorkflowEngine {
    /// Create a new workflow engine
    pub fn new(config: Option<WorkflowEngineConfig>) -> Self {
        let config = Arc::new(config.unwrap_or_default());

        Self {
            id: Uuid::new_v4().to_string(),
            config,
            agents: AgentRegistry::new(),
            approvals: ApprovalQueue::new(),
            running: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Use an existing approval queue instead of a private one
    pub fn with_approval_queue(mut self, approvals: ApprovalQueue) -> Self {
        self.approvals = approvals;
        self
    }

    /// Get the ID of the workflow engine
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the engine configuration
    pub fn config(&self) -> &WorkflowEngineConfig {
        &self.config
    }

    /// Handle to the approval queue, for resolvers
    pub fn approvals(&self) -> ApprovalQueue {
        self.approvals.clone()
    }

    /// Register an agent, replacing any agent with the same id
    pub fn register_agent(&mut self, agent: Arc<dyn Agent>) {
        info!("Registered agent: {} ({})", agent.name(), agent.id());
        self.agents.register(agent);
    }

    /// List all registered agents
    pub fn list_agents(&self) -> Vec<AgentInfo> {
        self.agents.list()
    }

    /// Status of a workflow while `execute` is driving it
    pub async fn get_workflow_status(&self, workflow_id: &str) -> Option<WorkflowStatus> {
        self.running
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(workflow_id)
            .copied()
    }

    /// Run a workflow until every task is terminal or no task can make
    /// progress, and hand it back with final task and workflow status.
    ///
    /// Task failures never surface as errors here; inspect the returned
    /// workflow instead.
    #[instrument(skip(self, workflow, context), fields(workflow.id = %workflow.workflow_id, workflow.name = %workflow.name))]
    pub async fn execute(&self, mut workflow: Workflow, context: Context) -> Workflow {
        let _span_guard = span_duration("execute_workflow");
        let start = Instant::now();

        info!(
            "Starting workflow: {} ({}) with {} tasks",
            workflow.name,
            workflow.workflow_id,
            workflow.tasks.len()
        );

        workflow.update_status(WorkflowStatus::Running);
        workflow.started_at = Some(Utc::now());
        workflow.finished_at = None;
        workflow.error = None;
        // Dropping `execute` early still clears the entry
        let _running = RunningEntry::insert(&self.running, &workflow.workflow_id);

        let rounds = self.run_rounds(&mut workflow, Arc::new(context)).await;

        let failed = workflow
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .count();
        let completed = workflow
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();

        if failed > 0 || workflow.error.is_some() {
            workflow.update_status(WorkflowStatus::Failed);
            error!(
                "Workflow {} failed - {} tasks failed after {} rounds",
                workflow.name, failed, rounds
            );
        } else {
            workflow.update_status(WorkflowStatus::Completed);
            info!(
                "Workflow {} completed successfully in {} rounds",
                workflow.name, rounds
            );
        }
        workflow.finished_at = Some(Utc::now());

        add_metric("workflow_rounds", rounds as f64, &[]);
        add_metric("workflow_tasks_completed", completed as f64, &[]);
        add_metric("workflow_tasks_failed", failed as f64, &[]);
        add_metric(
            "workflow_duration_ms",
            start.elapsed().as_millis() as f64,
            &[("status", workflow.status.to_string())],
        );

        workflow
    }

    /// The scheduling loop. Returns the number of rounds dispatched.
    async fn run_rounds(&self, workflow: &mut Workflow, context: Arc<Context>) -> usize {
        // Leftovers from an interrupted run go back to pending
        for task in workflow.tasks.iter_mut() {
            if matches!(task.status, TaskStatus::Running | TaskStatus::WaitingApproval) {
                task.status = TaskStatus::Pending;
            }
        }

        if let Some(duplicate) = find_duplicate_id(&workflow.tasks) {
            let err = TaskError::DuplicateTaskId(duplicate);
            error!("Workflow {} rejected: {}", workflow.name, err);
            for task in workflow.tasks.iter_mut().filter(|t| !t.is_terminal()) {
                task.mark_blocked(err.to_string());
            }
            workflow.error = Some(err.to_string());
            return 0;
        }

        let mut completed_ids: HashSet<String> = workflow
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.task_id.clone())
            .collect();
        let mut approved: HashSet<String> = HashSet::new();
        let max_rounds = self
            .config
            .max_rounds
            .unwrap_or_else(|| round_limit(&workflow.tasks));
        let mut round = 0;

        loop {
            let pending: Vec<usize> = (0..workflow.tasks.len())
                .filter(|&i| workflow.tasks[i].status == TaskStatus::Pending)
                .collect();

            if pending.is_empty() {
                break;
            }

            if round >= max_rounds {
                warn!(
                    "Workflow {} hit the round limit ({}) with {} tasks pending",
                    workflow.name,
                    max_rounds,
                    pending.len()
                );
                let err = TaskError::RoundLimitExceeded(round);
                for idx in pending {
                    workflow.tasks[idx].mark_blocked(err.to_string());
                }
                workflow.error = Some(err.to_string());
                break;
            }

            let mut ready: Vec<usize> = pending
                .into_iter()
                .filter(|&i| workflow.tasks[i].is_ready(&completed_ids))
                .collect();

            if ready.is_empty() {
                fail_stalled(workflow);
                break;
            }

            round += 1;
            // Stable sort keeps insertion order within a priority
            ready.sort_by_key(|&i| Reverse(workflow.tasks[i].priority));
            debug!("Round {}: dispatching {} ready tasks", round, ready.len());

            let results = self
                .dispatch_round(workflow, &ready, &context, &approved)
                .await;

            for (idx, attempt) in results {
                let AttemptResult {
                    mut task,
                    error,
                    approved: was_approved,
                } = attempt;

                if was_approved {
                    approved.insert(task.task_id.clone());
                }

                match error {
                    None => {
                        info!("Task completed: {}", task.name);
                        completed_ids.insert(task.task_id.clone());
                    }
                    Some(err) if err.is_retryable() && task.can_retry() => {
                        warn!(
                            "Task {} failed (attempt {}/{}), will retry: {}",
                            task.name,
                            task.retry_count,
                            task.max_retries.max(1),
                            err
                        );
                        task.reset_for_retry();
                    }
                    Some(err) => {
                        error!(
                            "Task {} failed after {} attempts: {}",
                            task.name, task.retry_count, err
                        );
                    }
                }

                workflow.tasks[idx] = task;
            }
        }

        round
    }

    /// Run every ready task concurrently and wait for all of them to settle.
    ///
    /// Attempts live in a `JoinSet`, so dropping the round aborts them.
    async fn dispatch_round(
        &self,
        workflow: &Workflow,
        ready: &[usize],
        context: &Arc<Context>,
        approved: &HashSet<String>,
    ) -> Vec<(usize, AttemptResult)> {
        let limiter = self
            .config
            .max_concurrent_tasks
            .map(|n| Arc::new(Semaphore::new(n.max(1))));

        let mut attempts = JoinSet::new();
        for &idx in ready {
            let task = workflow.tasks[idx].clone();
            let agent = task
                .agent_id
                .as_deref()
                .and_then(|agent_id| self.agents.get(agent_id));
            let gate = (task.requires_approval && !approved.contains(&task.task_id)).then(|| {
                ApprovalGate {
                    queue: self.approvals.clone(),
                    timeout_secs: self.config.approval_timeout_secs,
                }
            });
            let attempt = Attempt {
                backoff: self.config.retry.delay_for(task.retry_count),
                task,
                agent,
                context: Arc::clone(context),
                gate,
                limiter: limiter.clone(),
            };

            attempts.spawn(async move { (idx, attempt.run().await) });
        }

        let mut settled: HashMap<usize, AttemptResult> = HashMap::with_capacity(ready.len());
        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok((idx, result)) => {
                    settled.insert(idx, result);
                }
                Err(join_error) => error!("Task attempt aborted: {}", join_error),
            }
        }

        // Agent panics are caught inside the attempt; anything missing here
        // died in the engine's own bookkeeping
        ready
            .iter()
            .map(|&idx| {
                let result = settled.remove(&idx).unwrap_or_else(|| {
                    let err = TaskError::Panicked("task attempt aborted".to_string());
                    let mut task = workflow.tasks[idx].clone();
                    task.mark_running();
                    task.mark_failed(err.to_string());
                    AttemptResult {
                        task,
                        error: Some(err),
                        approved: false,
                    }
                });
                (idx, result)
            })
            .collect()
    }
}

/// Keeps a workflow in the running map until dropped
struct RunningEntry {
    running: Arc<RwLock<HashMap<String, WorkflowStatus>>>,
    workflow_id: String,
}

impl RunningEntry {
    fn insert(running: &Arc<RwLock<HashMap<String, WorkflowStatus>>>, workflow_id: &str) -> Self {
        running
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(workflow_id.to_string(), WorkflowStatus::Running);
        Self {
            running: Arc::clone(running),
            workflow_id: workflow_id.to_string(),
        }
    }
}

impl Drop for RunningEntry {
    fn drop(&mut self) {
        self.running
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.workflow_id);
    }
}

/// Upper bound on rounds: every round performs at least one attempt and a
/// task gets at most `max(max_retries, 1)` attempts.
fn round_limit(tasks: &[Task]) -> usize {
    tasks
        .iter()
        .map(|t| t.max_retries.max(1) as usize)
        .sum::<usize>()
        + 1
}

/// Mark every task that can no longer become ready as failed and record a
/// workflow-level diagnostic.
fn fail_stalled(workflow: &mut Workflow) {
    let blockers = diagnose_stall(&workflow.tasks);
    let mut details = Vec::new();

    for task in workflow.tasks.iter_mut() {
        if let Some(blocker) = blockers.get(&task.task_id) {
            let err = blocker.clone().into_task_error();
            warn!("Task {} can never become ready: {}", task.name, err);
            details.push(format!("{} ({})", task.task_id, err));
            task.mark_blocked(err.to_string());
        }
    }

    warn!(
        "No ready tasks found in workflow {} - {} tasks blocked",
        workflow.name,
        details.len()
    );
    workflow.error = Some(format!(
        "No ready tasks; {} blocked: {}",
        details.len(),
        details.join(", ")
    ));
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Approval settings handed to an attempt that still needs a decision
#[derive(Debug, Clone)]
struct ApprovalGate {
    queue: ApprovalQueue,
    timeout_secs: u64,
}

/// Everything one task attempt needs, owned so it can run on its own task
struct Attempt {
    task: Task,
    agent: Option<Arc<dyn Agent>>,
    context: Arc<Context>,
    gate: Option<ApprovalGate>,
    limiter: Option<Arc<Semaphore>>,
    backoff: Duration,
}

/// The task after one attempt
#[derive(Debug)]
struct AttemptResult {
    task: Task,
    error: Option<TaskError>,
    approved: bool,
}

impl Attempt {
    #[instrument(skip(self), fields(task.name = %self.task.name, task.id = %self.task.task_id))]
    async fn run(self) -> AttemptResult {
        let Attempt {
            mut task,
            agent,
            context,
            gate,
            limiter,
            backoff,
        } = self;
        let start = Instant::now();

        if !backoff.is_zero() {
            debug!("Backing off {:?} before retrying {}", backoff, task.name);
            sleep(backoff).await;
        }

        let mut approved = false;
        let outcome = match resolve_agent(&task, agent) {
            Err(err) => Err(err),
            Ok(agent) => {
                let decision = match gate {
                    Some(gate) => {
                        let result = request_approval(&mut task, &gate).await;
                        approved = result.is_ok();
                        result
                    }
                    None => Ok(()),
                };

                match decision {
                    Err(err) => Err(err),
                    Ok(()) => {
                        // Closed semaphores are never created, so a failed acquire means no limit
                        let _permit = match &limiter {
                            Some(limiter) => Arc::clone(limiter).acquire_owned().await.ok(),
                            None => None,
                        };
                        invoke(&mut task, agent.as_ref(), &context).await
                    }
                }
            }
        };

        let error = match outcome {
            Ok(output) => {
                task.mark_completed(output);
                None
            }
            Err(err) => {
                if task.status == TaskStatus::Pending {
                    task.mark_running();
                }
                task.mark_failed(err.to_string());
                Some(err)
            }
        };

        add_metric(
            "task_attempt_duration_ms",
            start.elapsed().as_millis() as f64,
            &[
                ("task_name", task.name.clone()),
                ("success", error.is_none().to_string()),
            ],
        );

        AttemptResult {
            task,
            error,
            approved,
        }
    }
}

fn resolve_agent(task: &Task, agent: Option<Arc<dyn Agent>>) -> Result<Arc<dyn Agent>, TaskError> {
    match (&task.agent_id, agent) {
        (None, _) => Err(TaskError::MissingAgent(task.name.clone())),
        (Some(agent_id), None) => Err(TaskError::AgentNotRegistered(agent_id.clone())),
        (Some(_), Some(agent)) => Ok(agent),
    }
}

async fn request_approval(task: &mut Task, gate: &ApprovalGate) -> Result<(), TaskError> {
    let requester = task.agent_id.clone().unwrap_or_default();
    let payload = json!({
        "task_id": task.task_id,
        "description": task.description,
        "input": task.input_data,
    });

    let request = gate
        .queue
        .create_request(
            &task.task_id,
            &requester,
            &task.name,
            payload,
            gate.timeout_secs,
        )
        .await;
    task.mark_waiting_approval(request.id.clone());
    info!("Task {} waiting for approval ({})", task.name, request.id);

    let outcome = gate
        .queue
        .wait(&request.id)
        .await
        .map_err(|_| TaskError::ApprovalExpired(request.id.clone()))?;

    match outcome.status {
        ApprovalStatus::Approved => Ok(()),
        ApprovalStatus::Rejected => Err(TaskError::ApprovalRejected(
            outcome
                .comment
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| "no reason given".to_string()),
        )),
        ApprovalStatus::Expired | ApprovalStatus::Pending => {
            Err(TaskError::ApprovalExpired(request.id))
        }
    }
}

async fn invoke(
    task: &mut Task,
    agent: &dyn Agent,
    context: &Context,
) -> Result<serde_json::Map<String, serde_json::Value>, TaskError> {
    task.mark_running();
    debug!(
        "Executing task (attempt {}/{}): {}",
        task.retry_count + 1,
        task.max_retries.max(1),
        task.name
    );

    let call = AssertUnwindSafe(async { agent.run(task, context).await }).catch_unwind();
    match timeout(task.timeout(), call).await {
        Ok(Ok(Ok(value))) => Ok(coerce_output(value)),
        Ok(Ok(Err(err))) => Err(TaskError::Execution(format!("{:#}", err))),
        Ok(Err(payload)) => Err(TaskError::Panicked(panic_message(payload))),
        Err(_) => Err(TaskError::Timeout {
            name: task.name.clone(),
            seconds: task.timeout_seconds,
        }),
    }
}
