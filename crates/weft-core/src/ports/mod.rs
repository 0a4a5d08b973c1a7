//! Ports - 抽象化レイヤー
//!
//! コアが外部に依存する箇所（時刻、ID 生成、claim 保持者の生存確認、
//! snapshot の永続化）をここで trait として定義します。

pub mod clock;
pub mod id_generator;
pub mod liveness;
pub mod project_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::liveness::{AllLocksLive, LivenessProbe};
pub use self::project_store::{ProjectSnapshot, ProjectStore, StoreError, Versioned};
