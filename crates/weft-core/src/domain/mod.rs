//! Domain model (IDs, tasks, worker sessions, change events, errors).

pub mod change;
pub mod errors;
pub mod ids;
pub mod task;
pub mod worker;

pub use change::{
    ChangeAction, ChangeEvent, ConflictInfo, ConflictKind, ConflictSeverity, EntityType, Field,
    FieldChange, FieldValue,
};
pub use errors::{ClaimRejection, CoordinationError};
pub use ids::{ConflictId, EventId, SessionId, TaskId, WorkerId};
pub use task::{Priority, Task, TaskStatus};
pub use worker::{RegisterRequest, WorkerSession};
