//! Change events and the conflicts detected between them.
//!
//! A `ChangeEvent` is appended once per committed write and never mutated
//! afterwards. Field-level changes are typed: each entry says whether a
//! field was added, modified or removed and carries the values involved.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ConflictId, EventId, TaskId, WorkerId};
use super::task::{Priority, Task, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Task,
    Worker,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityType::Task => "task",
            EntityType::Worker => "worker",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
}

/// Name of a tracked field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Title,
    Status,
    Priority,
    DependsOn,
    EstimatedDuration,
    RequiredCapabilities,
    LockedBy,
    LockedAt,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Field::Title => "title",
            Field::Status => "status",
            Field::Priority => "priority",
            Field::DependsOn => "depends_on",
            Field::EstimatedDuration => "estimated_duration",
            Field::RequiredCapabilities => "required_capabilities",
            Field::LockedBy => "locked_by",
            Field::LockedAt => "locked_at",
        };
        f.write_str(s)
    }
}

/// Typed value of a tracked field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Status(TaskStatus),
    Priority(Priority),
    Tasks(BTreeSet<TaskId>),
    Minutes(u64),
    Labels(BTreeSet<String>),
    Worker(WorkerId),
    Timestamp(DateTime<Utc>),
}

/// One field-level change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum FieldChange {
    Added { field: Field, value: FieldValue },
    Modified { field: Field, old: FieldValue, new: FieldValue },
    Removed { field: Field, old: FieldValue },
}

impl FieldChange {
    pub fn field(&self) -> &Field {
        match self {
            FieldChange::Added { field, .. }
            | FieldChange::Modified { field, .. }
            | FieldChange::Removed { field, .. } => field,
        }
    }

    /// The value after the change, if the field still exists.
    pub fn new_value(&self) -> Option<&FieldValue> {
        match self {
            FieldChange::Added { value, .. } => Some(value),
            FieldChange::Modified { new, .. } => Some(new),
            FieldChange::Removed { .. } => None,
        }
    }

    fn compare(field: Field, old: FieldValue, new: FieldValue) -> Option<Self> {
        (old != new).then_some(FieldChange::Modified { field, old, new })
    }

    fn compare_optional(
        field: Field,
        old: Option<FieldValue>,
        new: Option<FieldValue>,
    ) -> Option<Self> {
        match (old, new) {
            (None, None) => None,
            (None, Some(value)) => Some(FieldChange::Added { field, value }),
            (Some(old), None) => Some(FieldChange::Removed { field, old }),
            (Some(old), Some(new)) => Self::compare(field, old, new),
        }
    }
}

/// An immutable record of one committed write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: EventId,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub worker_id: WorkerId,
    pub timestamp: DateTime<Utc>,
    pub action: ChangeAction,

    #[serde(default)]
    pub changes: Vec<FieldChange>,

    /// Medium-severity conflicts recorded when the event was admitted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<ConflictId>,
}

impl ChangeEvent {
    pub fn new(
        id: EventId,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        worker_id: WorkerId,
        timestamp: DateTime<Utc>,
        action: ChangeAction,
        changes: Vec<FieldChange>,
    ) -> Self {
        Self {
            id,
            entity_type,
            entity_id: entity_id.into(),
            worker_id,
            timestamp,
            action,
            changes,
            conflicts: Vec::new(),
        }
    }

    /// Update event for a task, with the changes derived from `before`/`after`.
    pub fn task_update(
        id: EventId,
        before: &Task,
        after: &Task,
        worker_id: WorkerId,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self::new(
            id,
            EntityType::Task,
            after.id.to_string(),
            worker_id,
            timestamp,
            ChangeAction::Update,
            Self::diff_tasks(before, after),
        )
    }

    /// Field changes between two versions of the same task.
    ///
    /// Derived fields (`dependents`, `blocked_by`) and bookkeeping
    /// timestamps are not tracked.
    pub fn diff_tasks(before: &Task, after: &Task) -> Vec<FieldChange> {
        let labels = |set: &BTreeSet<String>| {
            (!set.is_empty()).then(|| FieldValue::Labels(set.clone()))
        };
        let deps = |set: &BTreeSet<TaskId>| {
            (!set.is_empty()).then(|| FieldValue::Tasks(set.clone()))
        };

        [
            FieldChange::compare(
                Field::Title,
                FieldValue::Text(before.title.clone()),
                FieldValue::Text(after.title.clone()),
            ),
            FieldChange::compare(
                Field::Status,
                FieldValue::Status(before.status),
                FieldValue::Status(after.status),
            ),
            FieldChange::compare(
                Field::Priority,
                FieldValue::Priority(before.priority),
                FieldValue::Priority(after.priority),
            ),
            FieldChange::compare_optional(
                Field::DependsOn,
                deps(&before.depends_on),
                deps(&after.depends_on),
            ),
            FieldChange::compare_optional(
                Field::EstimatedDuration,
                before.estimated_duration.map(FieldValue::Minutes),
                after.estimated_duration.map(FieldValue::Minutes),
            ),
            FieldChange::compare_optional(
                Field::RequiredCapabilities,
                labels(&before.required_capabilities),
                labels(&after.required_capabilities),
            ),
            FieldChange::compare_optional(
                Field::LockedBy,
                before.locked_by.map(FieldValue::Worker),
                after.locked_by.map(FieldValue::Worker),
            ),
            FieldChange::compare_optional(
                Field::LockedAt,
                before.locked_at.map(FieldValue::Timestamp),
                after.locked_at.map(FieldValue::Timestamp),
            ),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Names of the fields this event touched.
    pub fn changed_fields(&self) -> BTreeSet<Field> {
        self.changes.iter().map(|c| c.field().clone()).collect()
    }

    /// Does this event take (or move) a claim lock on its entity?
    ///
    /// Releasing a lock is not lock-related in this sense.
    pub fn acquires_lock(&self) -> bool {
        self.changes.iter().any(|c| {
            *c.field() == Field::LockedBy && matches!(c.new_value(), Some(FieldValue::Worker(_)))
        })
    }

    pub fn releases_lock(&self) -> bool {
        self.changes
            .iter()
            .any(|c| matches!(c, FieldChange::Removed { field: Field::LockedBy, .. }))
    }

    pub fn targets_same_entity(&self, other: &ChangeEvent) -> bool {
        self.entity_type == other.entity_type && self.entity_id == other.entity_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSeverity {
    Medium,
    High,
}

impl ConflictSeverity {
    /// High-severity conflicts reject the pending write.
    pub fn blocks_write(self) -> bool {
        self == ConflictSeverity::High
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Two workers updated overlapping fields of the same entity.
    ConcurrentEdit,
    /// A worker updated an entity another worker had just locked.
    LockViolation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub id: ConflictId,
    pub kind: ConflictKind,
    pub severity: ConflictSeverity,
    pub auto_resolvable: bool,
    pub entity_type: EntityType,
    pub entity_id: String,

    /// The earlier event.
    pub existing_event: EventId,
    pub existing_worker: WorkerId,

    /// The event being examined.
    pub incoming_event: EventId,
    pub incoming_worker: WorkerId,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub fields: BTreeSet<Field>,

    pub description: String,
}
