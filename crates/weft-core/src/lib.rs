//! weft-core
//!
//! Dependency-aware coordination for workers sharing one task graph.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, worker, change, errors）
//! - **ports**: 抽象化レイヤー（Clock, IdGenerator, LivenessProbe, ProjectStore）
//! - **graph**: readiness / cycles / depth / critical path
//! - **allocator**: ready task の割り当て提案
//! - **registry**: worker session の生存管理と claim
//! - **conflict**: change event の競合検出
//! - **config**: CoordinationConfig（TOML）
//! - **impls**: ports の実装（InMemoryProjectStore, JsonFileStore）
//! - **app**: Coordinator, ReaperLoop
//!
//! `graph`, `allocator`, `registry`, `conflict` は同期・副作用なしで、
//! 呼び出し側が渡した snapshot だけを見ます。

pub mod allocator;
pub mod app;
pub mod config;
pub mod conflict;
pub mod domain;
pub mod graph;
pub mod impls;
pub mod ports;
pub mod registry;

pub use allocator::{AllocationResult, WorkAllocator, WorkerCapacity};
pub use config::CoordinationConfig;
pub use conflict::ConflictDetector;
pub use graph::{GraphView, build_graph};
pub use registry::{SweepReport, WorkerRegistry};
