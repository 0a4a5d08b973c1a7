//! Work allocation.
//!
//! Proposes which ready task each worker should claim next. Allocation is
//! read-only: the caller turns each assignment into a claim through the
//! registry, and may still lose that claim to a concurrent writer.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::CoordinationConfig;
use crate::domain::{Task, TaskId, TaskStatus, WorkerId, WorkerSession};
use crate::graph::{DependencyGraph, GraphNode, build_graph};
use crate::ports::LivenessProbe;

/// What the allocator needs to know about a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCapacity {
    pub worker_id: WorkerId,

    #[serde(default)]
    pub capabilities: BTreeSet<String>,

    /// `None` falls back to the allocator default.
    #[serde(default)]
    pub max_concurrent_tasks: Option<usize>,
}

impl WorkerCapacity {
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            capabilities: BTreeSet::new(),
            max_concurrent_tasks: None,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = Some(max);
        self
    }

    fn can_run(&self, task: &Task) -> bool {
        task.required_capabilities.is_subset(&self.capabilities)
    }
}

impl From<&WorkerSession> for WorkerCapacity {
    fn from(session: &WorkerSession) -> Self {
        Self {
            worker_id: session.worker_id,
            capabilities: session.capabilities.clone(),
            max_concurrent_tasks: session.max_concurrent_tasks,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub task: TaskId,
    pub worker: WorkerId,
}

/// Why a ready task was not placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "worker", rename_all = "snake_case")]
pub enum UnplacedReason {
    AllWorkersAtCapacity,
    NoCapableWorker,
    NoWorkers,
    HeldByLiveWorker(WorkerId),
}

impl fmt::Display for UnplacedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnplacedReason::AllWorkersAtCapacity => f.write_str("all workers at capacity"),
            UnplacedReason::NoCapableWorker => {
                f.write_str("no worker has the required capabilities")
            }
            UnplacedReason::NoWorkers => f.write_str("no workers available"),
            UnplacedReason::HeldByLiveWorker(w) => write!(f, "held by live worker {w}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationConflict {
    pub task: TaskId,
    pub reason: UnplacedReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationResult {
    pub assignments: Vec<Assignment>,
    /// Blocked tasks.
    pub unassigned: Vec<TaskId>,
    /// Ready tasks that could not be placed.
    pub conflicts: Vec<AllocationConflict>,
}

impl AllocationResult {
    pub fn assigned_to(&self, worker: WorkerId) -> impl Iterator<Item = TaskId> + '_ {
        self.assignments
            .iter()
            .filter(move |a| a.worker == worker)
            .map(|a| a.task)
    }
}

#[derive(Debug, Clone)]
pub struct WorkAllocator {
    default_max_concurrent_tasks: usize,
}

impl Default for WorkAllocator {
    fn default() -> Self {
        Self::from_config(&CoordinationConfig::default())
    }
}

impl WorkAllocator {
    pub fn new(default_max_concurrent_tasks: usize) -> Self {
        Self {
            default_max_concurrent_tasks,
        }
    }

    pub fn from_config(config: &CoordinationConfig) -> Self {
        Self::new(config.default_max_concurrent_tasks)
    }

    fn capacity(&self, worker: &WorkerCapacity) -> usize {
        worker
            .max_concurrent_tasks
            .unwrap_or(self.default_max_concurrent_tasks)
    }

    /// Assign ready tasks across `workers`.
    ///
    /// Candidates are ordered by priority (highest first), then critical path
    /// membership, then depth (more downstream work first), keeping snapshot
    /// order on ties. Workers are visited round-robin in the order given;
    /// tasks a worker already holds count toward its capacity. A task locked
    /// by a holder that is no longer live is offered again if its
    /// dependencies are still met.
    pub fn allocate(
        &self,
        tasks: &[Task],
        workers: &[WorkerCapacity],
        liveness: &dyn LivenessProbe,
    ) -> AllocationResult {
        let view = build_graph(tasks);
        let graph = DependencyGraph::new(tasks);
        let mut result = AllocationResult {
            unassigned: view.blocked.clone(),
            ..AllocationResult::default()
        };

        let mut seen = HashSet::new();
        let workers: Vec<&WorkerCapacity> = workers
            .iter()
            .filter(|w| seen.insert(w.worker_id))
            .collect();

        let mut candidates: Vec<&GraphNode> = Vec::new();
        for node in &view.nodes {
            let task = &node.task;
            let holder = liveness.live_holder(task);
            match task.status {
                TaskStatus::Ready => {
                    if let Some(holder) = holder {
                        result.conflicts.push(AllocationConflict {
                            task: task.id,
                            reason: UnplacedReason::HeldByLiveWorker(holder),
                        });
                        continue;
                    }
                }
                TaskStatus::InProgress if task.is_locked() && holder.is_none() => {
                    let reclaimable = graph
                        .node_of(task.id)
                        .is_some_and(|n| graph.readiness(n).status == TaskStatus::Ready);
                    if !reclaimable {
                        continue;
                    }
                    debug!(task = %task.id, "offering task held by a stale worker");
                }
                _ => continue,
            }
            candidates.push(node);
        }

        candidates.sort_by(|a, b| {
            b.task
                .priority
                .cmp(&a.task.priority)
                .then(b.on_critical_path.cmp(&a.on_critical_path))
                .then(b.depth.cmp(&a.depth))
        });

        let mut load: Vec<usize> = workers
            .iter()
            .map(|w| {
                tasks
                    .iter()
                    .filter(|t| t.locked_by == Some(w.worker_id) && !t.status.is_terminal())
                    .count()
            })
            .collect();

        let mut cursor = 0;
        for node in candidates {
            let task = &node.task;
            let mut capable = false;
            let mut placed = None;

            for step in 0..workers.len() {
                let i = (cursor + step) % workers.len();
                let worker = workers[i];
                if !worker.can_run(task) {
                    continue;
                }
                capable = true;
                if load[i] >= self.capacity(worker) {
                    continue;
                }
                placed = Some(i);
                break;
            }

            match placed {
                Some(i) => {
                    load[i] += 1;
                    cursor = (i + 1) % workers.len();
                    result.assignments.push(Assignment {
                        task: task.id,
                        worker: workers[i].worker_id,
                    });
                }
                None => {
                    let reason = if workers.is_empty() {
                        UnplacedReason::NoWorkers
                    } else if capable {
                        UnplacedReason::AllWorkersAtCapacity
                    } else {
                        UnplacedReason::NoCapableWorker
                    };
                    result.conflicts.push(AllocationConflict {
                        task: task.id,
                        reason,
                    });
                }
            }
        }

        if !result.conflicts.is_empty() {
            warn!(
                unplaced = result.conflicts.len(),
                "some ready tasks could not be allocated"
            );
        }
        debug!(
            assigned = result.assignments.len(),
            unassigned = result.unassigned.len(),
            "allocation computed"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Priority;
    use crate::graph::testing::{completed, task, tid};
    use crate::ports::AllLocksLive;
    use chrono::Utc;
    use rstest::rstest;
    use ulid::Ulid;

    struct NothingLive;

    impl LivenessProbe for NothingLive {
        fn live_holder(&self, _task: &Task) -> Option<WorkerId> {
            None
        }
    }

    fn wid(n: u128) -> WorkerId {
        WorkerId::from_ulid(Ulid(1000 + n))
    }

    fn worker(n: u128) -> WorkerCapacity {
        WorkerCapacity::new(wid(n))
    }

    fn with_duration(mut t: Task, minutes: u64) -> Task {
        t.estimated_duration = Some(minutes);
        t
    }

    #[test]
    fn diamond_after_root_spreads_across_workers() {
        let tasks = vec![
            completed(task(1, &[])),
            task(2, &[1]),
            task(3, &[1]),
            task(4, &[2, 3]),
        ];
        let result = WorkAllocator::default().allocate(&tasks, &[worker(1), worker(2)], &AllLocksLive);

        assert_eq!(
            result.assignments,
            vec![
                Assignment { task: tid(2), worker: wid(1) },
                Assignment { task: tid(3), worker: wid(2) },
            ]
        );
        assert_eq!(result.unassigned, vec![tid(4)]);
        assert!(result.conflicts.is_empty());
    }

    #[test]
    fn higher_priority_goes_first() {
        let tasks = vec![
            task(1, &[]).with_priority(Priority::Low),
            task(2, &[]).with_priority(Priority::Critical),
            task(3, &[]).with_priority(Priority::High),
        ];
        let one = [worker(1).with_max_concurrent_tasks(3)];
        let result = WorkAllocator::default().allocate(&tasks, &one, &AllLocksLive);

        let order: Vec<_> = result.assigned_to(wid(1)).collect();
        assert_eq!(order, vec![tid(2), tid(3), tid(1)]);
    }

    #[test]
    fn critical_path_beats_depth() {
        // 1 -> 2(100) is critical; 3 -> 4 -> 5 is deeper but light
        let tasks = vec![
            task(1, &[]),
            with_duration(task(2, &[1]), 100),
            task(3, &[]),
            with_duration(task(4, &[3]), 1),
            with_duration(task(5, &[4]), 1),
        ];
        let one = [worker(1).with_max_concurrent_tasks(1)];
        let result = WorkAllocator::default().allocate(&tasks, &one, &AllLocksLive);

        assert_eq!(result.assignments[0].task, tid(1));
        assert_eq!(result.conflicts[0].task, tid(3));
    }

    #[test]
    fn depth_breaks_remaining_ties() {
        let tasks = vec![
            task(1, &[]),
            task(3, &[]),
            task(4, &[3]),
            task(5, &[]),
            with_duration(task(6, &[5]), 100),
        ];
        let one = [worker(1).with_max_concurrent_tasks(5)];
        let result = WorkAllocator::default().allocate(&tasks, &one, &AllLocksLive);

        let order: Vec<_> = result.assigned_to(wid(1)).collect();
        assert_eq!(order, vec![tid(5), tid(3), tid(1)]);
    }

    #[test]
    fn capacity_exhaustion_is_reported_not_dropped() {
        let tasks = vec![task(1, &[]), task(2, &[]), task(3, &[])];
        let one = [worker(1).with_max_concurrent_tasks(1)];
        let result = WorkAllocator::default().allocate(&tasks, &one, &AllLocksLive);

        assert_eq!(result.assignments.len(), 1);
        assert_eq!(
            result.conflicts,
            vec![
                AllocationConflict { task: tid(2), reason: UnplacedReason::AllWorkersAtCapacity },
                AllocationConflict { task: tid(3), reason: UnplacedReason::AllWorkersAtCapacity },
            ]
        );
        assert_eq!(result.conflicts[0].reason.to_string(), "all workers at capacity");
    }

    #[test]
    fn held_tasks_count_toward_capacity() {
        let mut held = task(9, &[]);
        held.lock(wid(1), Utc::now());
        let tasks = vec![held, task(1, &[]), task(2, &[])];
        let workers = [worker(1).with_max_concurrent_tasks(1), worker(2).with_max_concurrent_tasks(1)];

        let result = WorkAllocator::default().allocate(&tasks, &workers, &AllLocksLive);
        assert_eq!(result.assignments, vec![Assignment { task: tid(1), worker: wid(2) }]);
        assert_eq!(result.conflicts[0].task, tid(2));
    }

    #[test]
    fn capabilities_are_matched() {
        let tasks = vec![
            task(1, &[]).with_required_capability("gpu"),
            task(2, &[]).with_required_capability("fpga"),
        ];
        let workers = [worker(1), worker(2).with_capability("gpu")];
        let result = WorkAllocator::default().allocate(&tasks, &workers, &AllLocksLive);

        assert_eq!(result.assignments, vec![Assignment { task: tid(1), worker: wid(2) }]);
        assert_eq!(
            result.conflicts,
            vec![AllocationConflict { task: tid(2), reason: UnplacedReason::NoCapableWorker }]
        );
    }

    #[test]
    fn no_workers_means_every_ready_task_conflicts() {
        let tasks = vec![task(1, &[]), task(2, &[1])];
        let result = WorkAllocator::default().allocate(&tasks, &[], &AllLocksLive);

        assert!(result.assignments.is_empty());
        assert_eq!(result.unassigned, vec![tid(2)]);
        assert_eq!(
            result.conflicts,
            vec![AllocationConflict { task: tid(1), reason: UnplacedReason::NoWorkers }]
        );
    }

    #[test]
    fn stale_in_progress_task_is_offered_again() {
        let mut abandoned = task(1, &[]);
        abandoned.lock(wid(7), Utc::now());
        let tasks = vec![abandoned];

        let live = WorkAllocator::default().allocate(&tasks, &[worker(1)], &AllLocksLive);
        assert!(live.assignments.is_empty());
        assert!(live.conflicts.is_empty());

        let stale = WorkAllocator::default().allocate(&tasks, &[worker(1)], &NothingLive);
        assert_eq!(stale.assignments, vec![Assignment { task: tid(1), worker: wid(1) }]);
    }

    #[test]
    fn ready_task_with_a_live_lock_is_a_conflict() {
        let mut t = task(1, &[]);
        t.locked_by = Some(wid(7));
        let result = WorkAllocator::default().allocate(&[t], &[worker(1)], &AllLocksLive);

        assert_eq!(
            result.conflicts,
            vec![AllocationConflict { task: tid(1), reason: UnplacedReason::HeldByLiveWorker(wid(7)) }]
        );
    }

    #[test]
    fn allocation_is_deterministic_and_read_only() {
        let tasks: Vec<Task> = (1..=8).map(|n| task(n, &[])).collect();
        let before = tasks.clone();
        let workers = [worker(1), worker(2), worker(3)];
        let allocator = WorkAllocator::default();

        let a = allocator.allocate(&tasks, &workers, &AllLocksLive);
        let b = allocator.allocate(&tasks, &workers, &AllLocksLive);
        assert_eq!(a, b);
        assert_eq!(tasks, before);
    }

    #[test]
    fn duplicate_workers_are_visited_once() {
        let tasks = vec![task(1, &[]), task(2, &[])];
        let workers = [worker(1).with_max_concurrent_tasks(1), worker(1).with_max_concurrent_tasks(1)];
        let result = WorkAllocator::default().allocate(&tasks, &workers, &AllLocksLive);
        assert_eq!(result.assignments.len(), 1);
    }

    #[rstest]
    #[case(1, 1, 5)]
    #[case(2, 3, 10)]
    #[case(3, 2, 4)]
    #[case(4, 1, 12)]
    fn never_double_assigns_or_exceeds_capacity(
        #[case] workers: u128,
        #[case] max: usize,
        #[case] ready: u128,
    ) {
        let mut tasks: Vec<Task> = (1..=ready).map(|n| task(n, &[])).collect();
        tasks.push(task(100, &[1]));
        let pool: Vec<_> = (1..=workers)
            .map(|n| worker(n).with_max_concurrent_tasks(max))
            .collect();

        let result = WorkAllocator::default().allocate(&tasks, &pool, &AllLocksLive);

        let assigned: Vec<TaskId> = result.assignments.iter().map(|a| a.task).collect();
        let unique: BTreeSet<TaskId> = assigned.iter().copied().collect();
        assert_eq!(unique.len(), assigned.len());
        assert!(!assigned.contains(&tid(100)));
        for w in &pool {
            assert!(result.assigned_to(w.worker_id).count() <= max);
        }
        assert_eq!(
            result.assignments.len() + result.conflicts.len(),
            ready as usize
        );
    }
}
