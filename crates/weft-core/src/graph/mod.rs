//! Dependency graph engine.
//!
//! Pure functions over a task snapshot: readiness, cycles, depth and
//! critical path. Derived fields (`dependents`, `blocked_by`, ready/blocked
//! status) are recomputed on every call and never read back as truth.

mod critical_path;
mod cycles;
mod snapshot;

pub use snapshot::{DependencyGraph, DerivedStatus, ValidationIssue};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{CoordinationError, Task, TaskId, TaskStatus};

/// A task with its derived fields filled in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub task: Task,

    /// Levels of dependents below this task (leaves are 0).
    pub depth: usize,

    pub on_critical_path: bool,
}

/// Everything derived from one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphView {
    /// One node per distinct task id, in snapshot order.
    pub nodes: Vec<GraphNode>,
    pub ready_to_work: Vec<TaskId>,
    pub blocked: Vec<TaskId>,
    pub cycles: Vec<Vec<TaskId>>,

    /// Empty when `cycles` is not.
    pub critical_path: Vec<TaskId>,

    pub issues: Vec<ValidationIssue>,
}

impl GraphView {
    pub fn node(&self, id: TaskId) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.task.id == id)
    }

    pub fn is_acyclic(&self) -> bool {
        self.cycles.is_empty()
    }

    /// Fail closed on a malformed snapshot.
    pub fn ensure_valid(&self) -> Result<(), CoordinationError> {
        match self.issues.first() {
            None => Ok(()),
            Some(ValidationIssue::UnknownDependency { task, dependency }) => {
                Err(CoordinationError::UnknownDependency {
                    task: *task,
                    dependency: *dependency,
                })
            }
            Some(ValidationIssue::DuplicateTask { task }) => {
                Err(CoordinationError::DuplicateTask(*task))
            }
        }
    }
}

/// Derive the full graph view of `tasks`.
pub fn build_graph(tasks: &[Task]) -> GraphView {
    let graph = DependencyGraph::new(tasks);
    let cycles = graph.detect_cycles();
    let critical_path = if cycles.is_empty() {
        graph.critical_path()
    } else {
        warn!(cycles = cycles.len(), "dependency cycles found, skipping critical path");
        Vec::new()
    };
    let depths = graph.depths();

    let mut view = GraphView {
        nodes: Vec::with_capacity(graph.len()),
        cycles,
        issues: graph.issues().to_vec(),
        ..GraphView::default()
    };

    for node in 0..graph.len() {
        let derived = graph.derive(node);
        let mut task = graph.task(node).clone();
        task.status = derived.status;
        task.blocked_by = derived.blocked_by;
        task.dependents = graph.dependents(task.id);

        match task.status {
            TaskStatus::Ready => view.ready_to_work.push(task.id),
            TaskStatus::Blocked => view.blocked.push(task.id),
            _ => {}
        }

        view.nodes.push(GraphNode {
            on_critical_path: critical_path.contains(&task.id),
            depth: depths[node],
            task,
        });
    }
    view.critical_path = critical_path;

    for issue in &view.issues {
        warn!(?issue, "invalid task snapshot");
    }
    debug!(
        tasks = view.nodes.len(),
        ready = view.ready_to_work.len(),
        blocked = view.blocked.len(),
        "built dependency graph"
    );
    view
}

/// See [`DependencyGraph::detect_cycles`].
pub fn detect_cycles(tasks: &[Task]) -> Vec<Vec<TaskId>> {
    DependencyGraph::new(tasks).detect_cycles()
}

/// See [`DependencyGraph::would_create_cycle`].
pub fn would_create_cycle(tasks: &[Task], task: TaskId, candidate: TaskId) -> bool {
    DependencyGraph::new(tasks).would_create_cycle(task, candidate)
}

/// Critical path of `tasks`, or `None` if the graph has a cycle.
pub fn critical_path(tasks: &[Task]) -> Option<Vec<TaskId>> {
    let graph = DependencyGraph::new(tasks);
    graph
        .detect_cycles()
        .is_empty()
        .then(|| graph.critical_path())
}

/// Make `task` depend on `dependency`.
///
/// Both ids must exist and the new edge must not close a loop; nothing is
/// mutated unless every check passes. Adding an existing edge is a no-op.
pub fn add_dependency(
    tasks: &mut [Task],
    task: TaskId,
    dependency: TaskId,
) -> Result<(), CoordinationError> {
    let position = {
        let graph = DependencyGraph::new(tasks);
        if !graph.contains(dependency) {
            return Err(CoordinationError::TaskNotFound(dependency));
        }
        if graph.would_create_cycle(task, dependency) {
            warn!(%task, %dependency, "rejected dependency that would create a cycle");
            return Err(CoordinationError::CycleDetected { task, dependency });
        }
        tasks
            .iter()
            .position(|t| t.id == task)
            .ok_or(CoordinationError::TaskNotFound(task))?
    };

    tasks[position].depends_on.insert(dependency);
    debug!(%task, %dependency, "added dependency");
    Ok(())
}

/// Remove `task -> dependency`. Removing a missing edge is a no-op.
pub fn remove_dependency(
    tasks: &mut [Task],
    task: TaskId,
    dependency: TaskId,
) -> Result<(), CoordinationError> {
    let target = tasks
        .iter_mut()
        .find(|t| t.id == task)
        .ok_or(CoordinationError::TaskNotFound(task))?;
    target.depends_on.remove(&dependency);
    Ok(())
}
