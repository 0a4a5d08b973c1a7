//! Arena-indexed, read-only view of a task snapshot.
//!
//! Design:
//! - Forward edges: node -> nodes it depends on (waits for)
//! - Reverse edges: node -> nodes that depend on it (waiting nodes)
//! - Both are built once from `depends_on` and never mutated, so they
//!   cannot drift from it.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::domain::{Task, TaskId, TaskStatus};

/// A problem with the snapshot itself.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum ValidationIssue {
    /// `task` lists a dependency id that is not in the snapshot.
    UnknownDependency { task: TaskId, dependency: TaskId },
    /// The same id appears more than once; later copies are ignored.
    DuplicateTask { task: TaskId },
}

/// Derived status of one task plus the dependencies holding it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedStatus {
    pub status: TaskStatus,
    pub blocked_by: BTreeSet<TaskId>,
}

/// Dependency graph over one snapshot.
///
/// Nodes are positions in an arena of borrowed tasks; every edge list holds
/// arena indices in `depends_on` order.
pub struct DependencyGraph<'a> {
    nodes: Vec<&'a Task>,
    index: HashMap<TaskId, usize>,

    /// Forward edges: node -> nodes it depends on (existing ids only).
    edges: Vec<Vec<usize>>,

    /// Reverse edges: node -> nodes that depend on it.
    reverse_edges: Vec<Vec<usize>>,

    /// Dependency ids that resolve to nothing, per node.
    missing: Vec<Vec<TaskId>>,

    issues: Vec<ValidationIssue>,
}

impl<'a> DependencyGraph<'a> {
    pub fn new(tasks: &'a [Task]) -> Self {
        let mut nodes = Vec::with_capacity(tasks.len());
        let mut index = HashMap::with_capacity(tasks.len());
        let mut issues = Vec::new();

        for task in tasks {
            if index.contains_key(&task.id) {
                issues.push(ValidationIssue::DuplicateTask { task: task.id });
                continue;
            }
            index.insert(task.id, nodes.len());
            nodes.push(task);
        }

        let mut edges = vec![Vec::new(); nodes.len()];
        let mut reverse_edges = vec![Vec::new(); nodes.len()];
        let mut missing = vec![Vec::new(); nodes.len()];

        for (node, task) in nodes.iter().enumerate() {
            for dep in &task.depends_on {
                match index.get(dep) {
                    Some(&target) => {
                        edges[node].push(target);
                        reverse_edges[target].push(node);
                    }
                    None => {
                        missing[node].push(*dep);
                        issues.push(ValidationIssue::UnknownDependency {
                            task: task.id,
                            dependency: *dep,
                        });
                    }
                }
            }
        }

        Self {
            nodes,
            index,
            edges,
            reverse_edges,
            missing,
            issues,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn issues(&self) -> &[ValidationIssue] {
        &self.issues
    }

    pub(crate) fn task(&self, node: usize) -> &'a Task {
        self.nodes[node]
    }

    pub(crate) fn node_of(&self, id: TaskId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    pub(crate) fn dependencies_of(&self, node: usize) -> &[usize] {
        &self.edges[node]
    }

    pub(crate) fn dependents_of(&self, node: usize) -> &[usize] {
        &self.reverse_edges[node]
    }

    /// Does this node reference an id that is not in the snapshot?
    pub(crate) fn has_missing_dependencies(&self, node: usize) -> bool {
        !self.missing[node].is_empty()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.index.contains_key(&id)
    }

    /// Ids of the tasks that list `id` in their `depends_on`.
    pub fn dependents(&self, id: TaskId) -> BTreeSet<TaskId> {
        self.node_of(id)
            .map(|node| {
                self.reverse_edges[node]
                    .iter()
                    .map(|&n| self.nodes[n].id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Derive the status of `id` from the snapshot.
    ///
    /// - completed / failed pass through unchanged
    /// - in-progress with a lock stays in-progress
    /// - no dependencies: ready
    /// - otherwise ready iff every dependency is completed
    ///
    /// A dependency id that does not resolve counts as not completed.
    pub fn calculate_status(&self, id: TaskId) -> Option<DerivedStatus> {
        self.node_of(id).map(|node| self.derive(node))
    }

    pub(crate) fn derive(&self, node: usize) -> DerivedStatus {
        let task = self.nodes[node];

        if task.status.is_terminal()
            || (task.status == TaskStatus::InProgress && task.is_locked())
        {
            return DerivedStatus {
                status: task.status,
                blocked_by: BTreeSet::new(),
            };
        }
        self.readiness(node)
    }

    /// Ready/blocked from dependencies alone, ignoring status and lock.
    pub(crate) fn readiness(&self, node: usize) -> DerivedStatus {
        let mut blocked_by: BTreeSet<TaskId> = self.missing[node].iter().copied().collect();
        blocked_by.extend(
            self.edges[node]
                .iter()
                .map(|&dep| self.nodes[dep])
                .filter(|dep| dep.status != TaskStatus::Completed)
                .map(|dep| dep.id),
        );

        let status = if blocked_by.is_empty() {
            TaskStatus::Ready
        } else {
            TaskStatus::Blocked
        };
        DerivedStatus { status, blocked_by }
    }

    /// Would adding the edge `task -> candidate` close a loop?
    ///
    /// True iff `task` is reachable from `candidate` along existing
    /// `depends_on` edges (a self-edge always is). Unknown ids cannot be
    /// reached and yield false.
    pub fn would_create_cycle(&self, task: TaskId, candidate: TaskId) -> bool {
        if task == candidate {
            return true;
        }
        let (Some(target), Some(start)) = (self.node_of(task), self.node_of(candidate)) else {
            return false;
        };

        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([start]);
        visited.insert(start);

        while let Some(node) = queue.pop_front() {
            if node == target {
                return true;
            }
            for &dep in &self.edges[node] {
                if visited.insert(dep) {
                    queue.push_back(dep);
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::testing::{completed, task, tid};

    #[test]
    fn empty_snapshot_has_no_nodes() {
        let graph = DependencyGraph::new(&[]);
        assert!(graph.is_empty());
        assert!(graph.issues().is_empty());
    }

    #[test]
    fn reverse_edges_follow_depends_on() {
        let tasks = vec![task(1, &[]), task(2, &[1]), task(3, &[1])];
        let graph = DependencyGraph::new(&tasks);

        assert_eq!(graph.dependents(tid(1)), BTreeSet::from([tid(2), tid(3)]));
        assert!(graph.dependents(tid(2)).is_empty());
    }

    #[test]
    fn status_without_dependencies_is_ready() {
        let tasks = vec![task(1, &[])];
        let graph = DependencyGraph::new(&tasks);
        assert_eq!(
            graph.calculate_status(tid(1)).unwrap().status,
            TaskStatus::Ready
        );
    }

    #[test]
    fn status_is_blocked_until_every_dependency_completes() {
        let tasks = vec![completed(task(1, &[])), task(2, &[]), task(3, &[1, 2])];
        let graph = DependencyGraph::new(&tasks);

        let derived = graph.calculate_status(tid(3)).unwrap();
        assert_eq!(derived.status, TaskStatus::Blocked);
        assert_eq!(derived.blocked_by, BTreeSet::from([tid(2)]));
    }

    #[test]
    fn calculate_status_is_idempotent() {
        let tasks = vec![completed(task(1, &[])), task(2, &[1]), task(3, &[2])];
        let graph = DependencyGraph::new(&tasks);

        for id in [tid(1), tid(2), tid(3)] {
            assert_eq!(graph.calculate_status(id), graph.calculate_status(id));
        }
    }

    #[test]
    fn locked_in_progress_keeps_its_status() {
        let mut t = task(2, &[1]);
        t.status = TaskStatus::InProgress;
        t.locked_by = Some(crate::domain::WorkerId::from_ulid(ulid::Ulid(9)));
        let tasks = vec![task(1, &[]), t];
        let graph = DependencyGraph::new(&tasks);

        assert_eq!(
            graph.calculate_status(tid(2)).unwrap().status,
            TaskStatus::InProgress
        );
    }

    #[test]
    fn unlocked_in_progress_is_rederived() {
        let mut t = task(1, &[]);
        t.status = TaskStatus::InProgress;
        let tasks = vec![t];
        let graph = DependencyGraph::new(&tasks);

        assert_eq!(
            graph.calculate_status(tid(1)).unwrap().status,
            TaskStatus::Ready
        );
    }

    #[test]
    fn unknown_dependency_blocks_and_is_reported() {
        let tasks = vec![task(1, &[99])];
        let graph = DependencyGraph::new(&tasks);

        let derived = graph.calculate_status(tid(1)).unwrap();
        assert_eq!(derived.status, TaskStatus::Blocked);
        assert_eq!(derived.blocked_by, BTreeSet::from([tid(99)]));
        assert_eq!(
            graph.issues(),
            &[ValidationIssue::UnknownDependency {
                task: tid(1),
                dependency: tid(99),
            }]
        );
    }

    #[test]
    fn duplicate_ids_keep_the_first_copy() {
        let mut second = task(1, &[]);
        second.title = "copy".into();
        let tasks = vec![task(1, &[]), second];
        let graph = DependencyGraph::new(&tasks);

        assert_eq!(graph.len(), 1);
        assert_eq!(graph.task(0).title, "task 1");
        assert_eq!(
            graph.issues(),
            &[ValidationIssue::DuplicateTask { task: tid(1) }]
        );
    }

    #[test]
    fn would_create_cycle_when_task_reachable_from_candidate() {
        // A <- B, A <- C, D depends on B and C
        let tasks = vec![
            task(1, &[]),
            task(2, &[1]),
            task(3, &[1]),
            task(4, &[2, 3]),
        ];
        let graph = DependencyGraph::new(&tasks);

        // A -> D: D already reaches A
        assert!(graph.would_create_cycle(tid(1), tid(4)));
        // D -> A: redundant edge, not a loop
        assert!(!graph.would_create_cycle(tid(4), tid(1)));
        assert!(!graph.would_create_cycle(tid(2), tid(3)));
        assert!(graph.would_create_cycle(tid(2), tid(2)));
    }

    #[test]
    fn would_create_cycle_terminates_on_malformed_input() {
        // 1 <-> 2 already cyclic
        let tasks = vec![task(1, &[2]), task(2, &[1]), task(3, &[])];
        let graph = DependencyGraph::new(&tasks);

        assert!(!graph.would_create_cycle(tid(3), tid(1)));
        assert!(graph.would_create_cycle(tid(1), tid(2)));
    }

    #[test]
    fn would_create_cycle_with_unknown_ids_is_false() {
        let tasks = vec![task(1, &[])];
        let graph = DependencyGraph::new(&tasks);
        assert!(!graph.would_create_cycle(tid(1), tid(42)));
        assert!(!graph.would_create_cycle(tid(42), tid(1)));
    }
}
