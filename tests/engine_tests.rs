use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_flow::workflow::{
    Agent, Context, FnAgent, Task, TaskPriority, TaskStatus, Workflow, WorkflowEngine,
    WorkflowEngineConfig, WorkflowStatus,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::{sleep, Instant};

/// Shared log of agent start/end events
#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    fn push(&self, event: String) {
        self.0.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn position(&self, event: &str) -> usize {
        self.events()
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("missing event {}", event))
    }
}

fn sleeper(id: &str, delay: Duration, recorder: Recorder) -> Arc<dyn Agent> {
    Arc::new(FnAgent::new(id, move |task: Task, _ctx: Context| {
        let recorder = recorder.clone();
        async move {
            recorder.push(format!("start:{}", task.task_id));
            sleep(delay).await;
            recorder.push(format!("end:{}", task.task_id));
            Ok(json!({ "task": task.task_id }))
        }
    }))
}

fn counting(id: &str, calls: Arc<AtomicUsize>) -> Arc<dyn Agent> {
    Arc::new(FnAgent::new(id, move |_task: Task, _ctx: Context| {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "ok": true }))
        }
    }))
}

fn task(id: &str, agent: &str) -> Task {
    Task::new(id).with_id(id).with_agent(agent)
}

#[derive(Debug)]
struct PanickingAgent;

#[async_trait]
impl Agent for PanickingAgent {
    fn id(&self) -> &str {
        "crasher"
    }

    async fn run(&self, _task: &Task, _context: &Context) -> anyhow::Result<Value> {
        panic!("agent exploded")
    }
}

#[tokio::test(start_paused = true)]
async fn test_fan_out_after_root_completes() {
    let recorder = Recorder::default();
    let mut engine = WorkflowEngine::new(None);
    engine.register_agent(sleeper("worker", Duration::from_millis(50), recorder.clone()));

    let workflow = Workflow::new("fan-out")
        .with_task(task("t1", "worker"))
        .with_task(task("t2", "worker").depends_on("t1"))
        .with_task(task("t3", "worker").depends_on("t1"));

    let workflow = engine.execute(workflow, Context::new()).await;

    assert_eq!(workflow.status, WorkflowStatus::Completed);
    assert!(workflow.tasks.iter().all(|t| t.status == TaskStatus::Completed));
    assert!(workflow.error.is_none());

    let t1_end = recorder.position("end:t1");
    let t2_start = recorder.position("start:t2");
    let t3_start = recorder.position("start:t3");
    assert!(t2_start > t1_end);
    assert!(t3_start > t1_end);
    // Same round: both started before either finished
    assert!(t2_start < recorder.position("end:t3"));
    assert!(t3_start < recorder.position("end:t2"));

    let t2 = workflow.task("t2").unwrap();
    assert_eq!(t2.output_data.as_ref().unwrap().get("task"), Some(&json!("t2")));
    assert!(t2.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_dependencies_complete_before_dependent_starts() {
    let recorder = Recorder::default();
    let mut engine = WorkflowEngine::new(None);
    engine.register_agent(sleeper("fast", Duration::from_millis(10), recorder.clone()));
    engine.register_agent(sleeper("slow", Duration::from_millis(200), recorder.clone()));

    let workflow = Workflow::new("join")
        .with_task(task("c", "fast").depends_on("a").depends_on("b"))
        .with_task(task("a", "fast"))
        .with_task(task("b", "slow"));

    let workflow = engine.execute(workflow, Context::new()).await;

    assert_eq!(workflow.status, WorkflowStatus::Completed);
    let c_start = recorder.position("start:c");
    assert!(c_start > recorder.position("end:a"));
    assert!(c_start > recorder.position("end:b"));
}

#[tokio::test(start_paused = true)]
async fn test_ready_tasks_run_concurrently() {
    let mut engine = WorkflowEngine::new(None);
    engine.register_agent(sleeper("worker", Duration::from_millis(100), Recorder::default()));

    let workflow = Workflow::new("parallel")
        .with_task(task("a", "worker"))
        .with_task(task("b", "worker"));

    let started = Instant::now();
    let workflow = engine.execute(workflow, Context::new()).await;
    let elapsed = started.elapsed();

    assert_eq!(workflow.status, WorkflowStatus::Completed);
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(150), "took {:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_agent_times_out() {
    let mut engine = WorkflowEngine::new(None);
    engine.register_agent(Arc::new(FnAgent::new("hang", |_task: Task, _ctx: Context| async {
        futures::future::pending::<()>().await;
        Ok(Value::Null)
    })));
    engine.register_agent(sleeper("worker", Duration::from_millis(10), Recorder::default()));

    let workflow = Workflow::new("timeout")
        .with_task(task("stuck", "hang").with_timeout_secs(1).with_max_retries(1))
        .with_task(task("sibling", "worker"));

    let started = Instant::now();
    let workflow = engine.execute(workflow, Context::new()).await;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_millis(1500), "took {:?}", elapsed);

    let stuck = workflow.task("stuck").unwrap();
    assert_eq!(stuck.status, TaskStatus::Failed);
    assert_eq!(stuck.retry_count, 1);
    assert_eq!(stuck.error.as_deref(), Some("Task stuck timed out after 1s"));

    // The timeout does not take its sibling down
    assert_eq!(workflow.task("sibling").unwrap().status, TaskStatus::Completed);
    assert_eq!(workflow.status, WorkflowStatus::Failed);
}

#[tokio::test]
async fn test_retry_until_success() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut engine = WorkflowEngine::new(None);
    engine.register_agent(Arc::new(FnAgent::new("flaky", {
        let calls = Arc::clone(&calls);
        move |_task: Task, _ctx: Context| {
            let calls = Arc::clone(&calls);
            async move {
                let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt < 3 {
                    anyhow::bail!("transient failure {}", attempt);
                }
                Ok(json!({ "attempt": attempt }))
            }
        }
    })));

    let workflow = Workflow::new("retry").with_task(task("t", "flaky").with_max_retries(3));
    let workflow = engine.execute(workflow, Context::new()).await;

    let t = workflow.task("t").unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Completed);
    assert_eq!(t.status, TaskStatus::Completed);
    assert_eq!(t.retry_count, 2);
    assert!(t.error.is_none());
    assert_eq!(t.output_data.as_ref().unwrap().get("attempt"), Some(&json!(3)));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_budget_is_respected() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut engine = WorkflowEngine::new(None);
    engine.register_agent(Arc::new(FnAgent::new("broken", {
        let calls = Arc::clone(&calls);
        move |_task: Task, _ctx: Context| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("always broken")
            }
        }
    })));

    let workflow = Workflow::new("exhaust").with_task(task("t", "broken").with_max_retries(2));
    let workflow = engine.execute(workflow, Context::new()).await;

    let t = workflow.task("t").unwrap();
    assert_eq!(t.status, TaskStatus::Failed);
    assert_eq!(t.retry_count, 2);
    assert!(!t.can_retry());
    assert_eq!(t.error.as_deref(), Some("always broken"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(workflow.status, WorkflowStatus::Failed);
}

#[tokio::test]
async fn test_unregistered_agent_is_task_failure() {
    let engine = WorkflowEngine::new(None);

    let workflow = Workflow::new("ghost")
        .with_task(task("t", "ghost").with_max_retries(2))
        .with_task(Task::new("unassigned").with_id("u").with_max_retries(1));
    let workflow = engine.execute(workflow, Context::new()).await;

    assert_eq!(workflow.status, WorkflowStatus::Failed);
    let t = workflow.task("t").unwrap();
    assert_eq!(t.status, TaskStatus::Failed);
    assert_eq!(t.error.as_deref(), Some("No agent found with id: ghost"));
    assert_eq!(t.retry_count, 2);

    let u = workflow.task("u").unwrap();
    assert_eq!(u.error.as_deref(), Some("Task unassigned has no agent assigned"));
}

#[tokio::test]
async fn test_panicking_agent_is_contained() {
    let mut engine = WorkflowEngine::new(None);
    engine.register_agent(Arc::new(PanickingAgent));

    let workflow = Workflow::new("panic").with_task(task("t", "crasher").with_max_retries(1));
    let workflow = engine.execute(workflow, Context::new()).await;

    let t = workflow.task("t").unwrap();
    assert_eq!(t.status, TaskStatus::Failed);
    assert_eq!(t.error.as_deref(), Some("Agent panicked: agent exploded"));
    assert_eq!(workflow.status, WorkflowStatus::Failed);
}

#[tokio::test]
async fn test_cycle_terminates_in_failure() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut engine = WorkflowEngine::new(None);
    engine.register_agent(counting("worker", Arc::clone(&calls)));

    let workflow = Workflow::new("cycle")
        .with_task(task("a", "worker").depends_on("b"))
        .with_task(task("b", "worker").depends_on("a"));
    let workflow = engine.execute(workflow, Context::new()).await;

    assert_eq!(workflow.status, WorkflowStatus::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    for t in &workflow.tasks {
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.retry_count, 0);
        assert!(t.error.as_deref().unwrap().starts_with("Dependency cycle:"));
    }
    assert!(workflow.error.as_deref().unwrap().starts_with("No ready tasks; 2 blocked"));
}

#[tokio::test]
async fn test_failed_dependency_blocks_dependents_only() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut engine = WorkflowEngine::new(None);
    engine.register_agent(counting("worker", Arc::clone(&calls)));

    let workflow = Workflow::new("partial")
        .with_task(task("root", "missing").with_max_retries(1))
        .with_task(task("child", "worker").depends_on("root"))
        .with_task(task("grandchild", "worker").depends_on("child"))
        .with_task(task("orphan", "worker").depends_on("nope"))
        .with_task(task("independent", "worker"));
    let workflow = engine.execute(workflow, Context::new()).await;

    assert_eq!(workflow.status, WorkflowStatus::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(workflow.task("independent").unwrap().status, TaskStatus::Completed);
    assert_eq!(
        workflow.task("child").unwrap().error.as_deref(),
        Some("Dependency root did not complete")
    );
    assert_eq!(
        workflow.task("grandchild").unwrap().error.as_deref(),
        Some("Dependency child did not complete")
    );
    assert_eq!(
        workflow.task("orphan").unwrap().error.as_deref(),
        Some("Unknown dependency: nope")
    );
    assert!(workflow.tasks.iter().all(|t| t.is_terminal()));
}

#[tokio::test]
async fn test_context_and_output_coercion() {
    let mut engine = WorkflowEngine::new(None);
    engine.register_agent(Arc::new(FnAgent::new("scalar", |task: Task, ctx: Context| async move {
        let tenant = ctx.get("tenant").cloned().unwrap_or(Value::Null);
        let amount = task.input_data.get("amount").cloned().unwrap_or(Value::Null);
        Ok(json!(format!("{}:{}", tenant.as_str().unwrap_or("?"), amount)))
    })));

    let mut input = serde_json::Map::new();
    input.insert("amount".to_string(), json!(42));
    let workflow = Workflow::new("ctx").with_task(task("t", "scalar").with_input(input));

    let mut context = Context::new();
    context.insert("tenant".to_string(), json!("acme"));
    let workflow = engine.execute(workflow, context).await;

    let output = workflow.task("t").unwrap().output_data.clone().unwrap();
    assert_eq!(output.get("result"), Some(&json!("acme:42")));
}

#[tokio::test]
async fn test_priority_orders_dispatch_under_concurrency_cap() {
    let recorder = Recorder::default();
    let config = WorkflowEngineConfig {
        max_concurrent_tasks: Some(1),
        ..WorkflowEngineConfig::default()
    };
    let mut engine = WorkflowEngine::new(Some(config));
    engine.register_agent(sleeper("worker", Duration::from_millis(1), recorder.clone()));

    let workflow = Workflow::new("priorities")
        .with_task(task("low", "worker").with_priority(TaskPriority::Low))
        .with_task(task("critical", "worker").with_priority(TaskPriority::Critical))
        .with_task(task("medium", "worker"))
        .with_task(task("high", "worker").with_priority(TaskPriority::High));
    let workflow = engine.execute(workflow, Context::new()).await;

    assert_eq!(workflow.status, WorkflowStatus::Completed);
    let starts: Vec<String> = recorder
        .events()
        .into_iter()
        .filter(|e| e.starts_with("start:"))
        .collect();
    assert_eq!(
        starts,
        vec!["start:critical", "start:high", "start:medium", "start:low"]
    );
}

#[tokio::test]
async fn test_terminal_tasks_are_not_dispatched_again() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut engine = WorkflowEngine::new(None);
    engine.register_agent(counting("worker", Arc::clone(&calls)));

    let mut done = task("done", "worker");
    done.mark_completed(serde_json::Map::new());
    let mut skipped = task("skipped", "worker");
    skipped.mark_skipped();

    let workflow = Workflow::new("resume")
        .with_task(done)
        .with_task(skipped)
        .with_task(task("next", "worker").depends_on("done"));
    let workflow = engine.execute(workflow, Context::new()).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(workflow.task("next").unwrap().status, TaskStatus::Completed);
    assert_eq!(workflow.task("skipped").unwrap().status, TaskStatus::Skipped);
    assert_eq!(workflow.status, WorkflowStatus::Completed);

    let summary = workflow.summary();
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.pending, 0);
    assert!(summary.is_success());
}

#[tokio::test(start_paused = true)]
async fn test_workflow_status_visible_while_running() {
    let mut engine = WorkflowEngine::new(None);
    engine.register_agent(sleeper("worker", Duration::from_millis(100), Recorder::default()));

    let workflow = Workflow::new("observe")
        .with_id("wf-observe")
        .with_task(task("t", "worker"));

    let (workflow, during) = tokio::join!(engine.execute(workflow, Context::new()), async {
        sleep(Duration::from_millis(10)).await;
        engine.get_workflow_status("wf-observe").await
    });

    assert_eq!(during, Some(WorkflowStatus::Running));
    assert_eq!(workflow.status, WorkflowStatus::Completed);
    assert!(workflow.started_at.is_some() && workflow.finished_at.is_some());
    assert_eq!(engine.get_workflow_status("wf-observe").await, None);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_execute_cancels_agents() {
    let finished = Arc::new(AtomicUsize::new(0));
    let mut engine = WorkflowEngine::new(None);
    engine.register_agent(Arc::new(FnAgent::new("slow", {
        let finished = Arc::clone(&finished);
        move |_task: Task, _ctx: Context| {
            let finished = Arc::clone(&finished);
            async move {
                sleep(Duration::from_secs(5)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        }
    })));

    let workflow = Workflow::new("cancelled")
        .with_id("wf-cancelled")
        .with_task(task("a", "slow"))
        .with_task(task("b", "slow"));

    let outcome = tokio::time::timeout(
        Duration::from_secs(1),
        engine.execute(workflow, Context::new()),
    )
    .await;
    assert!(outcome.is_err());

    sleep(Duration::from_secs(10)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 0);
    assert_eq!(engine.get_workflow_status("wf-cancelled").await, None);
}

#[tokio::test]
async fn test_duplicate_task_ids_fail_the_workflow() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut engine = WorkflowEngine::new(None);
    engine.register_agent(counting("worker", Arc::clone(&calls)));

    let workflow = Workflow::new("duplicates")
        .with_task(task("a", "worker"))
        .with_task(task("a", "missing"))
        .with_task(task("b", "worker").depends_on("a"));
    let workflow = engine.execute(workflow, Context::new()).await;

    assert_eq!(workflow.status, WorkflowStatus::Failed);
    assert_eq!(workflow.error.as_deref(), Some("Duplicate task id: a"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    for t in &workflow.tasks {
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.retry_count, 0);
        assert_eq!(t.error.as_deref(), Some("Duplicate task id: a"));
    }
}

#[tokio::test]
async fn test_empty_workflow_completes() {
    let engine = WorkflowEngine::new(None);
    let workflow = engine.execute(Workflow::new("empty"), Context::new()).await;
    assert_eq!(workflow.status, WorkflowStatus::Completed);
}
