//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryProjectStore**: テスト・開発用の正本
//! - **JsonFileStore**: project ごとの JSON ファイル（CLI が使用）

pub mod inmem_store;
pub mod json_file;

pub use self::inmem_store::InMemoryProjectStore;
pub use self::json_file::JsonFileStore;
