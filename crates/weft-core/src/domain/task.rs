//! Task record and its status/priority vocabulary.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{TaskId, WorkerId};

/// Task status.
///
/// State transitions:
/// - Pending -> Ready (derived, all dependencies completed)
/// - Pending -> Blocked (derived, some dependency not completed)
/// - Ready -> InProgress (claim)
/// - InProgress -> Pending (release / stale sweep)
/// - InProgress -> Completed | Failed
///
/// `Ready` and `Blocked` are derived by the graph engine and never
/// authoritative when read back from storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Blocked,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Blocked => "blocked",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task priority. Ordering is `Low < Medium < High < Critical`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// A unit of work inside a project.
///
/// Design:
/// - `depends_on` is the only authoritative edge set.
/// - `dependents` and `blocked_by` are recomputed by every graph build and
///   are carried here only so a snapshot can be inspected as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub status: TaskStatus,

    #[serde(default)]
    pub depends_on: BTreeSet<TaskId>,

    /// Derived: tasks whose `depends_on` contains this task.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub dependents: BTreeSet<TaskId>,

    /// Derived: dependencies that are not completed yet.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub blocked_by: BTreeSet<TaskId>,

    #[serde(default)]
    pub priority: Priority,

    /// Estimated duration in minutes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<u64>,

    /// Capabilities a worker must have to be allocated this task.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub required_capabilities: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<WorkerId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: TaskId, title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            title: title.into(),
            status: TaskStatus::Pending,
            depends_on: BTreeSet::new(),
            dependents: BTreeSet::new(),
            blocked_by: BTreeSet::new(),
            priority: Priority::default(),
            estimated_duration: None,
            required_capabilities: BTreeSet::new(),
            locked_by: None,
            locked_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = TaskId>) -> Self {
        self.depends_on.extend(deps);
        self
    }

    pub fn with_estimated_duration(mut self, minutes: u64) -> Self {
        self.estimated_duration = Some(minutes);
        self
    }

    pub fn with_required_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }

    pub fn is_locked(&self) -> bool {
        self.locked_by.is_some()
    }

    /// Take the claim lock for `worker`.
    pub fn lock(&mut self, worker: WorkerId, now: DateTime<Utc>) {
        self.locked_by = Some(worker);
        self.locked_at = Some(now);
        self.status = TaskStatus::InProgress;
        self.updated_at = now;
    }

    /// Drop the claim lock. An in-progress task goes back to pending.
    pub fn unlock(&mut self, now: DateTime<Utc>) {
        self.locked_by = None;
        self.locked_at = None;
        if self.status == TaskStatus::InProgress {
            self.status = TaskStatus::Pending;
        }
        self.updated_at = now;
    }

    /// Move to a terminal status and drop any lock.
    pub fn finish(&mut self, status: TaskStatus, now: DateTime<Utc>) {
        debug_assert!(status.is_terminal());
        self.locked_by = None;
        self.locked_at = None;
        self.status = status;
        self.updated_at = now;
    }
}
