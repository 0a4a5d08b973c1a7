//! IdGenerator port
//!
//! task / worker / session / event / conflict の ID を払い出します。
//! registry と conflict detector は `Box<dyn IdGenerator>` か generic で受け取ります。

use crate::domain::ids::{ConflictId, EventId, SessionId, TaskId, WorkerId};
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator は複数の worker プロセスで衝突しない ID を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（複数スレッドから使える）
pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;

    fn generate_worker_id(&self) -> WorkerId;

    fn generate_session_id(&self) -> SessionId;

    fn generate_event_id(&self) -> EventId;

    fn generate_conflict_id(&self) -> ConflictId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// Clock を使って現在時刻ベースの ULID を生成します。
/// FixedClock を使えば timestamp 部分が決定的になります。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        TaskId::from(self.next_ulid())
    }

    fn generate_worker_id(&self) -> WorkerId {
        WorkerId::from(self.next_ulid())
    }

    fn generate_session_id(&self) -> SessionId {
        SessionId::from(self.next_ulid())
    }

    fn generate_event_id(&self) -> EventId {
        EventId::from(self.next_ulid())
    }

    fn generate_conflict_id(&self) -> ConflictId {
        ConflictId::from(self.next_ulid())
    }
}
