//! The worker contract the engine dispatches tasks to.
//!
//! An [`Agent`] receives a task and the caller's context and produces a value
//! or an error. The engine resolves agents by id through an [`AgentRegistry`]
//! that the caller populates; there is no process-wide registry.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::task::Task;

/// Caller-supplied mapping handed to every agent invocation
pub type Context = Map<String, Value>;

/// A worker that can execute tasks
#[async_trait]
pub trait Agent: Send + Sync + fmt::Debug {
    /// Id that tasks reference through `agent_id`
    fn id(&self) -> &str;

    /// Display name
    fn name(&self) -> &str {
        self.id()
    }

    /// Display description
    fn description(&self) -> &str {
        ""
    }

    /// Execute the task. Non-object results are wrapped as `{"result": value}`.
    async fn run(&self, task: &Task, context: &Context) -> Result<Value>;
}

type AgentFn = dyn Fn(Task, Context) -> BoxFuture<'static, Result<Value>> + Send + Sync;

/// An agent backed by an async closure
pub struct FnAgent {
    id: String,
    description: String,
    func: Arc<AgentFn>,
}

impl FnAgent {
    /// Create a new closure-backed agent
    pub fn new<F, Fut>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(Task, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let func: Arc<AgentFn> = Arc::new(
            move |task: Task, context: Context| -> BoxFuture<'static, Result<Value>> {
                Box::pin(f(task, context))
            },
        );

        Self {
            id: id.into(),
            description: String::new(),
            func,
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl fmt::Debug for FnAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnAgent")
            .field("id", &self.id)
            .field("description", &self.description)
            .finish()
    }
}

#[async_trait]
impl Agent for FnAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, task: &Task, context: &Context) -> Result<Value> {
        (self.func)(task.clone(), context.clone()).await
    }
}

/// Serializable description of a registered agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Agent id
    pub agent_id: String,
    /// Display name
    pub name: String,
    /// Display description
    pub description: String,
}

/// Agents keyed by id
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent, replacing any agent with the same id
    pub fn register(&mut self, agent: Arc<dyn Agent>) -> Option<Arc<dyn Agent>> {
        self.agents.insert(agent.id().to_string(), agent)
    }

    /// Resolve an agent by id
    pub fn get(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(agent_id).cloned()
    }

    /// Whether an id is registered
    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// Number of registered agents
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Describe every registered agent, sorted by id
    pub fn list(&self) -> Vec<AgentInfo> {
        let mut infos: Vec<AgentInfo> = self
            .agents
            .values()
            .map(|agent| AgentInfo {
                agent_id: agent.id().to_string(),
                name: agent.name().to_string(),
                description: agent.description().to_string(),
            })
            .collect();
        infos.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        infos
    }
}
