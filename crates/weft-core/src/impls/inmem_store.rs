//! InMemoryProjectStore - テスト・開発用の正本
//!
//! 全 project を 1 つの Mutex の下に置き、commit 時に version を比較します。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::ports::{ProjectSnapshot, ProjectStore, StoreError, Versioned};

/// Clones share the same projects.
#[derive(Clone, Default)]
pub struct InMemoryProjectStore {
    projects: Arc<Mutex<HashMap<String, Versioned<ProjectSnapshot>>>>,
}

impl InMemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectStore for InMemoryProjectStore {
    async fn create(&self, project: &str) -> Result<(), StoreError> {
        let mut projects = self.projects.lock().await;
        if projects.contains_key(project) {
            return Err(StoreError::ProjectExists(project.to_string()));
        }
        projects.insert(
            project.to_string(),
            Versioned {
                version: 0,
                value: ProjectSnapshot::default(),
            },
        );
        Ok(())
    }

    async fn load(&self, project: &str) -> Result<Versioned<ProjectSnapshot>, StoreError> {
        self.projects
            .lock()
            .await
            .get(project)
            .cloned()
            .ok_or_else(|| StoreError::ProjectNotFound(project.to_string()))
    }

    async fn commit(
        &self,
        project: &str,
        expected_version: u64,
        snapshot: ProjectSnapshot,
    ) -> Result<u64, StoreError> {
        let mut projects = self.projects.lock().await;
        let current = projects
            .get_mut(project)
            .ok_or_else(|| StoreError::ProjectNotFound(project.to_string()))?;

        if current.version != expected_version {
            return Err(StoreError::StaleSnapshot {
                project: project.to_string(),
                expected: expected_version,
                actual: current.version,
            });
        }

        current.version += 1;
        current.value = snapshot;
        debug!(project, version = current.version, "committed snapshot");
        Ok(current.version)
    }
}
