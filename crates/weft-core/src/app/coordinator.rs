//! Coordinator - read-compute-write の駆動役
//!
//! 1 回の操作 = snapshot 全体を load → core で計算 → 全体を commit。
//! commit が `StaleSnapshot` で失敗した場合だけ、新しい snapshot に対して
//! 1 回だけやり直します。呼び出し側にはドメインの結果がそのまま返ります。

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::allocator::{AllocationResult, WorkAllocator, WorkerCapacity};
use crate::config::CoordinationConfig;
use crate::conflict::ConflictDetector;
use crate::domain::{
    ChangeEvent, CoordinationError, Priority, RegisterRequest, Task, TaskId, TaskStatus,
    WorkerId, WorkerSession,
};
use crate::graph::{self, GraphView};
use crate::ports::{Clock, IdGenerator, ProjectSnapshot, ProjectStore, StoreError, UlidGenerator};
use crate::registry::{SweepReport, WorkerRegistry};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CoordinatorError {
    pub fn as_coordination(&self) -> Option<&CoordinationError> {
        match self {
            CoordinatorError::Coordination(e) => Some(e),
            CoordinatorError::Store(_) => None,
        }
    }
}

/// Fields for a new task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskDraft {
    pub title: String,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default)]
    pub estimated_duration: Option<u64>,

    #[serde(default)]
    pub depends_on: BTreeSet<TaskId>,

    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
}

impl TaskDraft {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_estimated_duration(mut self, minutes: u64) -> Self {
        self.estimated_duration = Some(minutes);
        self
    }

    pub fn depends_on(mut self, task: TaskId) -> Self {
        self.depends_on.insert(task);
        self
    }

    pub fn with_required_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }
}

pub struct Coordinator<S, C> {
    store: S,
    clock: C,
    config: CoordinationConfig,
    project: String,
}

impl<S: ProjectStore, C: Clock + Clone + 'static> Coordinator<S, C> {
    pub fn new(store: S, clock: C, config: CoordinationConfig, project: impl Into<String>) -> Self {
        Self {
            store,
            clock,
            config,
            project: project.into(),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn ids(&self) -> UlidGenerator<C> {
        UlidGenerator::new(self.clock.clone())
    }

    fn registry(&self, sessions: &[WorkerSession]) -> WorkerRegistry<C> {
        WorkerRegistry::new(self.clock.clone(), self.config.heartbeat_timeout())
            .with_sessions(sessions.iter().cloned())
    }

    pub async fn init(&self) -> Result<(), CoordinatorError> {
        self.store.create(&self.project).await?;
        Ok(())
    }

    pub async fn snapshot(&self) -> Result<ProjectSnapshot, CoordinatorError> {
        Ok(self.store.load(&self.project).await?.value)
    }

    /// Graph view of the stored snapshot. A dangling dependency or a
    /// duplicated task id fails instead of producing a partial view.
    pub async fn graph(&self) -> Result<GraphView, CoordinatorError> {
        let snapshot = self.snapshot().await?;
        let view = graph::build_graph(&snapshot.tasks);
        view.ensure_valid()?;
        Ok(view)
    }

    /// Allocation proposal across the currently live sessions.
    ///
    /// Fails closed on a malformed snapshot, like [`Self::graph`].
    pub async fn allocate(&self) -> Result<AllocationResult, CoordinatorError> {
        let snapshot = self.snapshot().await?;
        graph::build_graph(&snapshot.tasks).ensure_valid()?;
        let registry = self.registry(&snapshot.sessions);
        let workers: Vec<WorkerCapacity> = registry
            .live_sessions()
            .into_iter()
            .map(WorkerCapacity::from)
            .collect();
        Ok(WorkAllocator::from_config(&self.config).allocate(
            &snapshot.tasks,
            &workers,
            &registry,
        ))
    }

    /// Load, apply, commit. A stale commit is retried once against a fresh
    /// snapshot; a second stale commit is returned to the caller.
    /// Events past `event_retention_ms` are dropped from every committed snapshot.
    async fn update<T, F>(&self, op: &'static str, mut apply: F) -> Result<T, CoordinatorError>
    where
        T: Send,
        F: FnMut(&mut ProjectSnapshot, DateTime<Utc>) -> Result<T, CoordinationError> + Send,
    {
        let mut retried = false;
        loop {
            let read = self.store.load(&self.project).await?;
            let mut snapshot = read.value;
            let now = self.clock.now();
            let out = apply(&mut snapshot, now)?;
            let pruned = snapshot.prune_events(now, self.config.event_retention());
            if pruned > 0 {
                debug!(op, project = %self.project, pruned, "dropped expired events");
            }

            match self.store.commit(&self.project, read.version, snapshot).await {
                Ok(version) => {
                    debug!(op, project = %self.project, version, "committed");
                    return Ok(out);
                }
                Err(StoreError::StaleSnapshot { .. }) if !retried => {
                    warn!(op, project = %self.project, "stale snapshot, retrying once");
                    retried = true;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Append the update event for `before -> after` after conflict checks.
    fn record(
        &self,
        snapshot: &mut ProjectSnapshot,
        before: &Task,
        after: &Task,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<(), CoordinationError> {
        let ids = self.ids();
        let event = ChangeEvent::task_update(ids.generate_event_id(), before, after, worker, now);
        if event.changes.is_empty() {
            return Ok(());
        }
        let recent = snapshot.recent_events(now, self.config.conflict_window());
        let admitted = ConflictDetector::new(ids, self.config.conflict_window()).admit(event, &recent)?;
        snapshot.events.push(admitted.event);
        Ok(())
    }

    /// Append release events for locks cleared on behalf of their holder.
    ///
    /// These are not examined: the holder is gone or leaving.
    fn record_releases(
        &self,
        snapshot: &mut ProjectSnapshot,
        before: &[Task],
        released: &[TaskId],
        now: DateTime<Utc>,
    ) {
        let ids = self.ids();
        for id in released {
            let (Some(old), Some(new)) = (
                before.iter().find(|t| t.id == *id),
                snapshot.tasks.iter().find(|t| t.id == *id),
            ) else {
                continue;
            };
            let Some(holder) = old.locked_by else {
                continue;
            };
            let event = ChangeEvent::task_update(ids.generate_event_id(), old, new, holder, now);
            snapshot.events.push(event);
        }
    }

    fn task_by_id(snapshot: &ProjectSnapshot, id: TaskId) -> Result<Task, CoordinationError> {
        snapshot
            .tasks
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or(CoordinationError::TaskNotFound(id))
    }

    pub async fn add_task(&self, draft: TaskDraft) -> Result<Task, CoordinatorError> {
        let id = self.ids().generate_task_id();
        self.update("add_task", |snapshot, now| {
            let mut task = Task::new(id, draft.title.clone(), now).with_priority(draft.priority);
            task.estimated_duration = draft.estimated_duration;
            task.required_capabilities = draft.required_capabilities.clone();
            snapshot.tasks.push(task);
            for dep in &draft.depends_on {
                graph::add_dependency(&mut snapshot.tasks, id, *dep)?;
            }
            Self::task_by_id(snapshot, id)
        })
        .await
    }

    pub async fn add_dependency(
        &self,
        task: TaskId,
        dependency: TaskId,
    ) -> Result<(), CoordinatorError> {
        self.update("add_dependency", |snapshot, now| {
            graph::add_dependency(&mut snapshot.tasks, task, dependency)?;
            if let Some(t) = snapshot.tasks.iter_mut().find(|t| t.id == task) {
                t.updated_at = now;
            }
            Ok(())
        })
        .await
    }

    pub async fn remove_dependency(
        &self,
        task: TaskId,
        dependency: TaskId,
    ) -> Result<(), CoordinatorError> {
        self.update("remove_dependency", |snapshot, now| {
            graph::remove_dependency(&mut snapshot.tasks, task, dependency)?;
            if let Some(t) = snapshot.tasks.iter_mut().find(|t| t.id == task) {
                t.updated_at = now;
            }
            Ok(())
        })
        .await
    }

    pub async fn register(&self, request: RegisterRequest) -> Result<WorkerSession, CoordinatorError> {
        self.update("register", |snapshot, _| {
            let mut registry = self.registry(&snapshot.sessions);
            let session = registry.register(request.clone());
            snapshot.sessions = registry.into_sessions();
            Ok(session)
        })
        .await
    }

    pub async fn heartbeat(&self, worker: WorkerId) -> Result<WorkerSession, CoordinatorError> {
        self.update("heartbeat", |snapshot, _| {
            let mut registry = self.registry(&snapshot.sessions);
            let session = registry.heartbeat(worker)?.clone();
            snapshot.sessions = registry.into_sessions();
            Ok(session)
        })
        .await
    }

    pub async fn deregister(&self, worker: WorkerId) -> Result<Vec<TaskId>, CoordinatorError> {
        self.update("deregister", |snapshot, now| {
            let before = snapshot.tasks.clone();
            let mut registry = self.registry(&snapshot.sessions);
            let released = registry.deregister(worker, &mut snapshot.tasks)?;
            snapshot.sessions = registry.into_sessions();
            self.record_releases(snapshot, &before, &released, now);
            Ok(released)
        })
        .await
    }

    pub async fn claim(&self, task: TaskId, worker: WorkerId) -> Result<Task, CoordinatorError> {
        self.update("claim", |snapshot, now| {
            let mut before = Self::task_by_id(snapshot, task)?;
            let mut registry = self.registry(&snapshot.sessions);
            let claimed = registry.claim(task, worker, &mut snapshot.tasks)?;
            snapshot.sessions = registry.into_sessions();

            // a takeover first releases the stale holder's lock
            if let Some(stale) = before.locked_by.filter(|&h| h != worker) {
                let mut released = before.clone();
                released.unlock(now);
                let event = ChangeEvent::task_update(
                    self.ids().generate_event_id(),
                    &before,
                    &released,
                    stale,
                    now,
                );
                snapshot.events.push(event);
                before = released;
            }
            self.record(snapshot, &before, &claimed, worker, now)?;
            Ok(claimed)
        })
        .await
    }

    pub async fn release(&self, task: TaskId, worker: WorkerId) -> Result<Task, CoordinatorError> {
        self.update("release", |snapshot, now| {
            let before = Self::task_by_id(snapshot, task)?;
            let mut registry = self.registry(&snapshot.sessions);
            let released = registry.release(task, worker, &mut snapshot.tasks)?;
            snapshot.sessions = registry.into_sessions();
            self.record(snapshot, &before, &released, worker, now)?;
            Ok(released)
        })
        .await
    }

    pub async fn complete(&self, task: TaskId, worker: WorkerId) -> Result<Task, CoordinatorError> {
        self.finish(task, worker, TaskStatus::Completed).await
    }

    pub async fn fail(&self, task: TaskId, worker: WorkerId) -> Result<Task, CoordinatorError> {
        self.finish(task, worker, TaskStatus::Failed).await
    }

    async fn finish(
        &self,
        task: TaskId,
        worker: WorkerId,
        outcome: TaskStatus,
    ) -> Result<Task, CoordinatorError> {
        self.update("finish", |snapshot, now| {
            let before = Self::task_by_id(snapshot, task)?;
            let mut registry = self.registry(&snapshot.sessions);
            let finished = registry.finish(task, worker, outcome, &mut snapshot.tasks)?;
            snapshot.sessions = registry.into_sessions();
            self.record(snapshot, &before, &finished, worker, now)?;
            Ok(finished)
        })
        .await
    }

    /// One stale-session sweep.
    pub async fn sweep(&self) -> Result<SweepReport, CoordinatorError> {
        self.update("sweep", |snapshot, now| {
            let before = snapshot.tasks.clone();
            let mut registry = self.registry(&snapshot.sessions);
            let report = registry.sweep_stale(&mut snapshot.tasks);
            snapshot.sessions = registry.into_sessions();
            self.record_releases(snapshot, &before, &report.released, now);
            Ok(report)
        })
        .await
    }
}
