//! Declarative workflow definitions loaded from YAML or JSON.
//!
//! ```yaml
//! name: invoice-processing
//! steps:
//!   - id: extract
//!     name: Extract invoice fields
//!     agent: extractor
//!   - id: pay
//!     name: Pay vendor
//!     agent: payments
//!     depends_on: [extract]
//!     requires_approval: true
//!     priority: critical
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::state::{Workflow, DEFAULT_WORKFLOW_MAX_RETRIES, DEFAULT_WORKFLOW_TIMEOUT_SECS};
use super::task::{Task, TaskPriority, DEFAULT_TASK_TIMEOUT_SECS};
use crate::error::{FlowError, Result};

fn default_version() -> String {
    "1.0".to_string()
}

fn default_max_retries() -> u32 {
    DEFAULT_WORKFLOW_MAX_RETRIES
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_WORKFLOW_TIMEOUT_SECS
}

/// A workflow as written in a definition file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow id; generated when absent
    #[serde(default)]
    pub id: Option<String>,

    /// Name of the workflow
    pub name: String,

    /// Description of the workflow
    #[serde(default)]
    pub description: String,

    /// Definition version
    #[serde(default = "default_version")]
    pub version: String,

    /// Free-form tags, copied into workflow metadata
    #[serde(default)]
    pub tags: Vec<String>,

    /// Retry budget for steps that do not set their own
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Workflow-level timeout, copied onto the workflow. Steps without their
    /// own `timeout_seconds` get the task default, not this value.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Steps, one task each
    pub steps: Vec<StepDefinition>,
}

/// One step of a [`WorkflowDefinition`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step id, used as the task id
    pub id: String,

    /// Display name; defaults to the id
    #[serde(default)]
    pub name: Option<String>,

    /// Agent that runs the step
    pub agent: String,

    /// Display description
    #[serde(default)]
    pub description: String,

    /// Input mapping
    #[serde(default)]
    pub inputs: Map<String, Value>,

    /// Step ids that must complete first
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Ordering hint
    #[serde(default)]
    pub priority: TaskPriority,

    /// Retry budget; the workflow default when absent
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Per-attempt timeout; 60 seconds when absent
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Gate the step behind human approval
    #[serde(default)]
    pub requires_approval: bool,
}

impl WorkflowDefinition {
    /// Parse a YAML definition
    pub fn from_yaml_str(source: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(source)?)
    }

    /// Parse a JSON definition
    pub fn from_json_str(source: &str) -> Result<Self> {
        Ok(serde_json::from_str(source)?)
    }

    /// Load a definition file; `.json` files are parsed as JSON, everything
    /// else as YAML
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&contents),
            _ => Self::from_yaml_str(&contents),
        }
    }

    /// Check the definition is structurally executable: at least one step,
    /// unique step ids, and dependencies that name declared steps.
    /// Cycles are left to the engine, which reports them per task.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(FlowError::InvalidWorkflow(format!(
                "workflow {} must have at least one step",
                self.name
            )));
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(FlowError::InvalidWorkflow(format!(
                    "duplicate step id: {}",
                    step.id
                )));
            }
        }

        for step in &self.steps {
            if let Some(dep) = step.depends_on.iter().find(|d| !ids.contains(d.as_str())) {
                return Err(FlowError::InvalidWorkflow(format!(
                    "step {} depends on unknown step {}",
                    step.id, dep
                )));
            }
        }

        Ok(())
    }

    /// Validate and build the executable workflow
    pub fn into_workflow(self) -> Result<Workflow> {
        self.validate()?;

        let mut workflow = Workflow::new(self.name).with_description(self.description);
        if let Some(id) = self.id {
            workflow = workflow.with_id(id);
        }
        workflow.max_retries = self.max_retries;
        workflow.timeout_seconds = self.timeout_seconds;
        workflow.set_metadata("version", self.version);
        if !self.tags.is_empty() {
            workflow.set_metadata("tags", self.tags);
        }

        for step in self.steps {
            let name = step.name.unwrap_or_else(|| step.id.clone());
            let mut task = Task::new(name)
                .with_id(step.id)
                .with_description(step.description)
                .with_agent(step.agent)
                .with_input(step.inputs)
                .with_priority(step.priority)
                .with_max_retries(step.max_retries.unwrap_or(self.max_retries))
                .with_timeout_secs(step.timeout_seconds.unwrap_or(DEFAULT_TASK_TIMEOUT_SECS));
            for dep in step.depends_on {
                task = task.depends_on(dep);
            }
            if step.requires_approval {
                task = task.with_approval();
            }
            workflow.add_task(task);
        }

        Ok(workflow)
    }
}
