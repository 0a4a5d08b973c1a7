//! Domain identifiers (strongly-typed IDs).
//!
//! ULID ベースの ID を Phantom type パターンで型付けしています。
//! `TaskId` と `WorkerId` は実行時には同じ 128-bit 値ですが、
//! コンパイル時には混同できません。
//!
//! ## ULID の特性
//! - **時刻でソート可能**: 生成順序でソートできる
//! - **分散生成可能**: 複数の worker プロセスが調整なしで生成できる

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
///
/// Display で使うプレフィックス（"task-", "worker-" など）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    /// Display で使うプレフィックス
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
///
/// Serialized as its display form (`task-01H...`), so snapshots stay readable.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// ULID から Id を作成
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    /// 内部の ULID を取得
    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Error returned when a string is not a valid identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} id: {input:?}")]
pub struct ParseIdError {
    kind: &'static str,
    input: String,
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    /// Accepts both the prefixed display form and a bare ULID.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw)
            .map(Self::from_ulid)
            .map_err(|_| ParseIdError {
                kind: T::prefix().trim_end_matches('-'),
                input: s.to_string(),
            })
    }
}

impl<T: IdMarker> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de, T: IdMarker> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ========================================
// マーカー型の定義
// ========================================

/// Task のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

/// Worker のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Worker {}

impl IdMarker for Worker {
    fn prefix() -> &'static str {
        "worker-"
    }
}

/// Session のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Session {}

impl IdMarker for Session {
    fn prefix() -> &'static str {
        "session-"
    }
}

/// ChangeEvent のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Event {}

impl IdMarker for Event {
    fn prefix() -> &'static str {
        "event-"
    }
}

/// Conflict のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Conflict {}

impl IdMarker for Conflict {
    fn prefix() -> &'static str {
        "conflict-"
    }
}

// ========================================
// Type Alias
// ========================================

/// Identifier of a Task (unit of work inside a project).
pub type TaskId = Id<Task>;

/// Identifier of a worker (agent process).
pub type WorkerId = Id<Worker>;

/// Identifier of one registration of a worker.
pub type SessionId = Id<Session>;

/// Identifier of an appended ChangeEvent.
pub type EventId = Id<Event>;

/// Identifier of a detected conflict.
pub type ConflictId = Id<Conflict>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types() {
        let task = TaskId::from_ulid(Ulid::new());
        let worker = WorkerId::from_ulid(Ulid::new());

        assert!(task.to_string().starts_with("task-"));
        assert!(worker.to_string().starts_with("worker-"));
        // let _: TaskId = worker; // <- does not compile
    }

    #[test]
    fn parse_accepts_prefixed_and_bare_forms() {
        let ulid = Ulid::new();
        let task = TaskId::from_ulid(ulid);

        assert_eq!(task.to_string().parse::<TaskId>().unwrap(), task);
        assert_eq!(ulid.to_string().parse::<TaskId>().unwrap(), task);
    }

    #[test]
    fn parse_rejects_garbage() {
        let err = "task-not-a-ulid".parse::<TaskId>().unwrap_err();
        assert!(err.to_string().contains("invalid task id"));
    }

    #[test]
    fn ids_serialize_as_display_string() {
        let id = WorkerId::from_ulid(Ulid::new());

        let serialized = serde_json::to_string(&id).unwrap();
        assert_eq!(serialized, format!("\"{id}\""));

        let back: WorkerId = serde_json::from_str(&serialized).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;

        assert_eq!(size_of::<TaskId>(), size_of::<Ulid>());
        assert_eq!(size_of::<WorkerId>(), 16);
    }
}
