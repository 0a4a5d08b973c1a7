//! Errors - エラー型と分類
//!
//! All outcomes are returned synchronously to the caller. The core never
//! retries and never swallows an error.

use thiserror::Error;

use super::change::ConflictInfo;
use super::ids::{TaskId, WorkerId};

/// Why a claim was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClaimRejection {
    #[error("not ready")]
    NotReady,

    #[error("held by live worker {0}")]
    HeldByLiveWorker(WorkerId),

    /// Release attempted by someone other than the lock holder.
    #[error("not held by {0}")]
    NotHeldBy(WorkerId),
}

#[derive(Debug, Error)]
pub enum CoordinationError {
    /// Adding `task -> dependency` would close a loop.
    #[error("dependency {task} -> {dependency} would create a cycle")]
    CycleDetected { task: TaskId, dependency: TaskId },

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("worker not found: {0}")]
    WorkerNotFound(WorkerId),

    #[error("claim on {task} rejected: {reason}")]
    ClaimRejected { task: TaskId, reason: ClaimRejection },

    /// A high-severity conflict; the pending write must not be committed.
    #[error("conflict detected: {}", .0.description)]
    ConflictDetected(Box<ConflictInfo>),

    /// Malformed snapshot: `task` depends on an id that does not exist.
    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("task {0} appears more than once in the snapshot")]
    DuplicateTask(TaskId),
}

impl CoordinationError {
    /// Is this a rejection the caller may retry against a fresh snapshot?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinationError::ClaimRejected { .. } | CoordinationError::ConflictDetected(_)
        )
    }
}
