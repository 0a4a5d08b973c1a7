//! ProjectStore port - プロジェクト単位の snapshot 永続化
//!
//! コアは I/O を行いません。呼び出し側は project 全体の snapshot を読み、
//! 計算し、全体を書き戻します（single-writer-per-project, full-snapshot
//! optimistic concurrency）。
//!
//! # 設計原則
//! - `commit` は読み込み時の version を受け取る
//! - version が一致しなければ `StoreError::StaleSnapshot`
//! - 同じ snapshot から競合した 2 つの書き込みのうち、永続化されるのは 1 つだけ

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{ChangeEvent, Task, WorkerSession};

/// Everything the coordinator reads and writes for one project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    #[serde(default)]
    pub tasks: Vec<Task>,

    #[serde(default)]
    pub sessions: Vec<WorkerSession>,

    #[serde(default)]
    pub events: Vec<ChangeEvent>,
}

impl ProjectSnapshot {
    /// Events inside `[now - window, now]`, in append order.
    pub fn recent_events(&self, now: DateTime<Utc>, window: Duration) -> Vec<ChangeEvent> {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.events
            .iter()
            .filter(|e| e.timestamp >= cutoff && e.timestamp <= now)
            .cloned()
            .collect()
    }

    /// Drop events older than `now - keep`. Returns how many were dropped.
    pub fn prune_events(&mut self, now: DateTime<Utc>, keep: Duration) -> usize {
        let keep = chrono::Duration::from_std(keep).unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = now.checked_sub_signed(keep) else {
            return 0;
        };
        let before = self.events.len();
        self.events.retain(|e| e.timestamp >= cutoff);
        before - self.events.len()
    }
}

/// A value together with the store version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("project already exists: {0}")]
    ProjectExists(String),

    #[error("invalid project name: {0:?}")]
    InvalidProjectName(String),

    /// Someone else committed since this snapshot was read.
    #[error("stale snapshot for {project}: read version {expected}, store is at {actual}")]
    StaleSnapshot {
        project: String,
        expected: u64,
        actual: u64,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// ProjectStore は project snapshot の正本（source of truth）
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Create an empty project at version 0.
    async fn create(&self, project: &str) -> Result<(), StoreError>;

    async fn load(&self, project: &str) -> Result<Versioned<ProjectSnapshot>, StoreError>;

    /// Replace the whole snapshot if the store is still at `expected_version`.
    ///
    /// Returns the new version.
    async fn commit(
        &self,
        project: &str,
        expected_version: u64,
        snapshot: ProjectSnapshot,
    ) -> Result<u64, StoreError>;
}
