//! App - アプリケーション層
//!
//! ports と core を組み合わせて、1 project に対する操作を提供します。
//!
//! # 主要コンポーネント
//! - **Coordinator**: load → compute → commit（stale なら 1 回だけ再試行）
//! - **ReaperLoop**: stale session の定期回収

pub mod coordinator;
pub mod reaper_loop;

pub use self::coordinator::{Coordinator, CoordinatorError, TaskDraft};
pub use self::reaper_loop::ReaperLoop;
