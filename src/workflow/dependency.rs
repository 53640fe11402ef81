//! Dependency analysis for task graphs.
//!
//! The engine discovers stalls at run time (an empty ready set); this module
//! explains them: which dependencies are unknown, which failed, and which
//! tasks sit on a cycle.

use std::collections::{HashMap, HashSet};

use super::task::{Task, TaskError, TaskStatus};

/// Why a task can never become ready
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blocker {
    /// Depends on an id that is not in the workflow
    Unknown(String),
    /// Depends on a task that ended without completing
    Failed(String),
    /// Participates in (or depends on) a cycle
    Cycle(Vec<String>),
    /// Depends on a task that is itself blocked
    Upstream(String),
}

impl Blocker {
    /// The task error recorded for a task stuck behind this blocker
    pub fn into_task_error(self) -> TaskError {
        match self {
            Blocker::Unknown(id) => TaskError::UnknownDependency(id),
            Blocker::Failed(id) | Blocker::Upstream(id) => TaskError::DependencyFailed(id),
            Blocker::Cycle(path) => TaskError::DependencyCycle(path),
        }
    }
}

/// Find a dependency cycle among `tasks`, returned as a closed path
/// (`a -> b -> a`). Unknown dependencies are ignored.
pub fn find_cycle(tasks: &[Task]) -> Option<Vec<String>> {
    let graph: HashMap<&str, Vec<&str>> = tasks
        .iter()
        .map(|t| {
            (
                t.task_id.as_str(),
                t.dependencies.iter().map(String::as_str).collect(),
            )
        })
        .collect();

    let mut visited: HashSet<&str> = HashSet::new();
    for task in tasks {
        let mut stack: Vec<&str> = Vec::new();
        let mut on_stack: HashSet<&str> = HashSet::new();
        if let Some(cycle) = visit(
            task.task_id.as_str(),
            &graph,
            &mut visited,
            &mut stack,
            &mut on_stack,
        ) {
            return Some(cycle);
        }
    }
    None
}

fn visit<'a>(
    node: &'a str,
    graph: &HashMap<&'a str, Vec<&'a str>>,
    visited: &mut HashSet<&'a str>,
    stack: &mut Vec<&'a str>,
    on_stack: &mut HashSet<&'a str>,
) -> Option<Vec<String>> {
    if on_stack.contains(node) {
        let start = stack.iter().position(|n| *n == node).unwrap_or(0);
        let mut cycle: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
        cycle.push(node.to_string());
        return Some(cycle);
    }
    if !visited.insert(node) {
        return None;
    }

    stack.push(node);
    on_stack.insert(node);
    if let Some(deps) = graph.get(node) {
        for dep in deps {
            if graph.contains_key(dep) {
                if let Some(cycle) = visit(*dep, graph, visited, stack, on_stack) {
                    return Some(cycle);
                }
            }
        }
    }
    stack.pop();
    on_stack.remove(node);
    None
}

/// First task id that appears more than once, in task order
pub fn find_duplicate_id(tasks: &[Task]) -> Option<String> {
    let mut seen = HashSet::new();
    tasks
        .iter()
        .find(|t| !seen.insert(t.task_id.as_str()))
        .map(|t| t.task_id.clone())
}

/// Explain why each pending task in `tasks` cannot become ready.
///
/// Only tasks whose status is `pending` are diagnosed. Direct causes
/// (unknown or failed dependency, cycle membership) take precedence; a task
/// that only waits on other blocked tasks is reported as `Upstream`.
pub fn diagnose_stall(tasks: &[Task]) -> HashMap<String, Blocker> {
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.task_id.as_str(), t)).collect();
    let pending: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .collect();

    let mut blockers = HashMap::new();

    // Cycles among the stuck tasks
    let stuck: Vec<Task> = pending.iter().map(|t| (*t).clone()).collect();
    let mut remaining = stuck;
    while let Some(cycle) = find_cycle(&remaining) {
        for id in &cycle {
            blockers
                .entry(id.clone())
                .or_insert_with(|| Blocker::Cycle(cycle.clone()));
        }
        remaining.retain(|t| !cycle.contains(&t.task_id));
    }

    for task in &pending {
        if blockers.contains_key(&task.task_id) {
            continue;
        }
        let direct = task.dependencies.iter().find_map(|dep| match by_id.get(dep.as_str()) {
            None => Some(Blocker::Unknown(dep.clone())),
            Some(t) if matches!(t.status, TaskStatus::Failed | TaskStatus::Skipped) => {
                Some(Blocker::Failed(dep.clone()))
            }
            _ => None,
        });
        let blocker = direct.unwrap_or_else(|| {
            let upstream = task
                .dependencies
                .iter()
                .find(|dep| {
                    by_id
                        .get(dep.as_str())
                        .map(|t| t.status != TaskStatus::Completed)
                        .unwrap_or(false)
                })
                .cloned()
                .unwrap_or_default();
            Blocker::Upstream(upstream)
        });
        blockers.insert(task.task_id.clone(), blocker);
    }

    blockers
}
