//! Worker liveness registry.
//!
//! Owns the worker sessions of one project snapshot. Liveness is evaluated
//! against the injected clock at every decision; nothing here runs on a
//! timer. Exclusion is cooperative: two registries built from the same
//! snapshot can both accept a claim, and the store decides which commit wins.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{
    ClaimRejection, CoordinationError, RegisterRequest, Task, TaskId, TaskStatus, WorkerId,
    WorkerSession,
};
use crate::graph::DependencyGraph;
use crate::ports::{Clock, IdGenerator, LivenessProbe, UlidGenerator};

/// What one `sweep_stale` pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Tasks whose lock was cleared.
    pub released: Vec<TaskId>,
    /// Sessions removed for missing their heartbeat.
    pub removed: Vec<WorkerId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.released.is_empty() && self.removed.is_empty()
    }
}

pub struct WorkerRegistry<C> {
    clock: C,
    ids: Box<dyn IdGenerator>,
    timeout: Duration,
    sessions: BTreeMap<WorkerId, WorkerSession>,
}

impl<C: Clock + Clone + 'static> WorkerRegistry<C> {
    pub fn new(clock: C, timeout: Duration) -> Self {
        let ids = Box::new(UlidGenerator::new(clock.clone()));
        Self::with_id_generator(clock, ids, timeout)
    }
}

impl<C: Clock> WorkerRegistry<C> {
    pub fn with_id_generator(clock: C, ids: Box<dyn IdGenerator>, timeout: Duration) -> Self {
        Self {
            clock,
            ids,
            timeout,
            sessions: BTreeMap::new(),
        }
    }

    /// Load sessions read from a snapshot. A later duplicate replaces an
    /// earlier one.
    pub fn with_sessions(mut self, sessions: impl IntoIterator<Item = WorkerSession>) -> Self {
        self.sessions
            .extend(sessions.into_iter().map(|s| (s.worker_id, s)));
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn session(&self, worker: WorkerId) -> Option<&WorkerSession> {
        self.sessions.get(&worker)
    }

    /// All sessions, ordered by worker id.
    pub fn sessions(&self) -> impl Iterator<Item = &WorkerSession> {
        self.sessions.values()
    }

    pub fn into_sessions(self) -> Vec<WorkerSession> {
        self.sessions.into_values().collect()
    }

    pub fn register(&mut self, request: RegisterRequest) -> WorkerSession {
        let now = self.clock.now();
        let session = WorkerSession {
            worker_id: self.ids.generate_worker_id(),
            session_id: self.ids.generate_session_id(),
            name: request.name,
            capabilities: request.capabilities,
            max_concurrent_tasks: request.max_concurrent_tasks,
            registered_at: now,
            last_heartbeat: now,
            claimed_tasks: Default::default(),
        };
        info!(
            worker = %session.worker_id,
            session = %session.session_id,
            name = %session.name,
            "registered worker"
        );
        self.sessions.insert(session.worker_id, session.clone());
        session
    }

    pub fn heartbeat(&mut self, worker: WorkerId) -> Result<&WorkerSession, CoordinationError> {
        let now = self.clock.now();
        let session = self
            .sessions
            .get_mut(&worker)
            .ok_or(CoordinationError::WorkerNotFound(worker))?;
        session.last_heartbeat = now;
        debug!(%worker, "heartbeat");
        Ok(session)
    }

    /// Remove `worker`'s session and release every task it holds.
    pub fn deregister(
        &mut self,
        worker: WorkerId,
        tasks: &mut [Task],
    ) -> Result<Vec<TaskId>, CoordinationError> {
        let now = self.clock.now();
        self.sessions
            .remove(&worker)
            .ok_or(CoordinationError::WorkerNotFound(worker))?;

        let released: Vec<TaskId> = tasks
            .iter_mut()
            .filter(|t| t.locked_by == Some(worker))
            .map(|t| {
                t.unlock(now);
                t.id
            })
            .collect();
        info!(%worker, released = released.len(), "deregistered worker");
        Ok(released)
    }

    pub fn is_live(&self, session: &WorkerSession) -> bool {
        session.is_live(self.clock.now(), self.timeout)
    }

    /// A worker with no session is never live.
    pub fn is_worker_live(&self, worker: WorkerId) -> bool {
        self.holder_is_live(worker, self.clock.now())
    }

    pub fn live_sessions(&self) -> Vec<&WorkerSession> {
        let now = self.clock.now();
        self.sessions
            .values()
            .filter(|s| s.is_live(now, self.timeout))
            .collect()
    }

    fn holder_is_live(&self, worker: WorkerId, now: DateTime<Utc>) -> bool {
        self.sessions
            .get(&worker)
            .is_some_and(|s| s.is_live(now, self.timeout))
    }

    /// Lock `task_id` for `worker`.
    ///
    /// - a lock held by another live worker rejects with "held by live worker"
    /// - a lock whose holder is not live is taken over
    /// - otherwise the task must derive to ready from its dependencies
    ///
    /// Re-claiming a task the worker already holds returns it unchanged.
    pub fn claim(
        &mut self,
        task_id: TaskId,
        worker: WorkerId,
        tasks: &mut [Task],
    ) -> Result<Task, CoordinationError> {
        let now = self.clock.now();
        if !self.sessions.contains_key(&worker) {
            return Err(CoordinationError::WorkerNotFound(worker));
        }
        let position = tasks
            .iter()
            .position(|t| t.id == task_id)
            .ok_or(CoordinationError::TaskNotFound(task_id))?;

        let current = &tasks[position];
        match current.locked_by {
            Some(holder) if holder == worker && current.status == TaskStatus::InProgress => {
                debug!(task = %task_id, %worker, "claim already held");
                return Ok(current.clone());
            }
            Some(holder) if holder != worker && self.holder_is_live(holder, now) => {
                debug!(task = %task_id, %worker, %holder, "claim rejected, held");
                return Err(CoordinationError::ClaimRejected {
                    task: task_id,
                    reason: ClaimRejection::HeldByLiveWorker(holder),
                });
            }
            _ => {}
        }

        // A stale lock does not count: readiness comes from dependencies only.
        let ready = !current.status.is_terminal() && {
            let graph = DependencyGraph::new(tasks);
            graph
                .node_of(task_id)
                .is_some_and(|node| graph.readiness(node).status == TaskStatus::Ready)
        };
        if !ready {
            debug!(task = %task_id, %worker, "claim rejected, not ready");
            return Err(CoordinationError::ClaimRejected {
                task: task_id,
                reason: ClaimRejection::NotReady,
            });
        }

        if let Some(stale) = tasks[position].locked_by.filter(|&h| h != worker) {
            warn!(task = %task_id, %worker, %stale, "taking over lock from stale holder");
            if let Some(session) = self.sessions.get_mut(&stale) {
                session.claimed_tasks.remove(&task_id);
            }
        }

        let task = &mut tasks[position];
        task.lock(worker, now);
        if let Some(session) = self.sessions.get_mut(&worker) {
            session.claimed_tasks.insert(task_id);
        }
        info!(task = %task_id, %worker, "claimed task");
        Ok(task.clone())
    }

    /// Drop `worker`'s claim on `task_id`. Only the holder may release.
    pub fn release(
        &mut self,
        task_id: TaskId,
        worker: WorkerId,
        tasks: &mut [Task],
    ) -> Result<Task, CoordinationError> {
        let now = self.clock.now();
        let task = tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or(CoordinationError::TaskNotFound(task_id))?;
        if task.locked_by != Some(worker) {
            return Err(CoordinationError::ClaimRejected {
                task: task_id,
                reason: ClaimRejection::NotHeldBy(worker),
            });
        }

        task.unlock(now);
        if let Some(session) = self.sessions.get_mut(&worker) {
            session.claimed_tasks.remove(&task_id);
        }
        info!(task = %task_id, %worker, "released task");
        Ok(task.clone())
    }

    /// Move a held task to `completed` or `failed`. Only the holder may finish.
    pub fn finish(
        &mut self,
        task_id: TaskId,
        worker: WorkerId,
        outcome: TaskStatus,
        tasks: &mut [Task],
    ) -> Result<Task, CoordinationError> {
        debug_assert!(outcome.is_terminal());
        let now = self.clock.now();
        let task = tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or(CoordinationError::TaskNotFound(task_id))?;
        if task.locked_by != Some(worker) {
            return Err(CoordinationError::ClaimRejected {
                task: task_id,
                reason: ClaimRejection::NotHeldBy(worker),
            });
        }

        task.finish(outcome, now);
        if let Some(session) = self.sessions.get_mut(&worker) {
            session.claimed_tasks.remove(&task_id);
        }
        info!(task = %task_id, %worker, %outcome, "finished task");
        Ok(task.clone())
    }

    /// Remove every session that is not live and release its locks.
    ///
    /// Locks whose holder has no session at all are released too. Live
    /// sessions and their claims are never touched, so repeated calls are
    /// no-ops until another session goes stale.
    pub fn sweep_stale(&mut self, tasks: &mut [Task]) -> SweepReport {
        let now = self.clock.now();
        let stale: Vec<WorkerId> = self
            .sessions
            .values()
            .filter(|s| !s.is_live(now, self.timeout))
            .map(|s| s.worker_id)
            .collect();

        for worker in &stale {
            if let Some(session) = self.sessions.remove(worker) {
                warn!(
                    %worker,
                    last_heartbeat = %session.last_heartbeat,
                    claims = session.claimed_tasks.len(),
                    "removing stale session"
                );
            }
        }

        // every session left is live
        let mut released = Vec::new();
        for task in tasks.iter_mut() {
            let Some(holder) = task.locked_by else {
                continue;
            };
            if self.sessions.contains_key(&holder) {
                continue;
            }
            task.unlock(now);
            released.push(task.id);
        }

        if !stale.is_empty() || !released.is_empty() {
            info!(
                removed = stale.len(),
                released = released.len(),
                "swept stale sessions"
            );
        }
        SweepReport {
            released,
            removed: stale,
        }
    }
}

impl<C: Clock> LivenessProbe for WorkerRegistry<C> {
    fn live_holder(&self, task: &Task) -> Option<WorkerId> {
        let now = self.clock.now();
        task.locked_by.filter(|&h| self.holder_is_live(h, now))
    }
}
