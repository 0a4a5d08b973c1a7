//! JsonFileStore - project ごとに 1 つの JSON ファイル
//!
//! `<root>/<project>.json` に version と snapshot 全体を保存します。
//! 書き込みは同じディレクトリの一時ファイルに書いてから rename するので、
//! 読み手が書きかけのファイルを見ることはありません。
//!
//! create / commit の read → version 比較 → write は `<root>/<project>.lock`
//! の排他ロック（fs2）の中で行います。CLI のように別プロセスが同じ
//! ディレクトリを共有しても、同じ version への commit は 1 つしか通りません。

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::debug;
use ulid::Ulid;

use crate::ports::{ProjectSnapshot, ProjectStore, StoreError, Versioned};

#[derive(Serialize, Deserialize)]
struct ProjectFile {
    version: u64,
    #[serde(flatten)]
    snapshot: ProjectSnapshot,
}

#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn check_name(project: &str) -> Result<(), StoreError> {
        let valid = !project.is_empty()
            && project != "."
            && project != ".."
            && !project.contains(['/', '\\']);
        if valid {
            Ok(())
        } else {
            Err(StoreError::InvalidProjectName(project.to_string()))
        }
    }

    /// Path of `project`'s file. Names must be a single path component.
    pub fn project_path(&self, project: &str) -> Result<PathBuf, StoreError> {
        Self::check_name(project)?;
        Ok(self.root.join(format!("{project}.json")))
    }

    fn lock_path(&self, project: &str) -> Result<PathBuf, StoreError> {
        Self::check_name(project)?;
        Ok(self.root.join(format!("{project}.lock")))
    }

    /// Blocks until this handle holds the project's lock.
    /// The lock is released when the returned file is dropped.
    fn acquire_lock(&self, project: &str) -> Result<File, StoreError> {
        fs::create_dir_all(&self.root)?;
        let lock_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.lock_path(project)?)?;
        lock_file.lock_exclusive()?;
        Ok(lock_file)
    }

    fn read(&self, project: &str) -> Result<ProjectFile, StoreError> {
        let path = self.project_path(project)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::ProjectNotFound(project.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn write(&self, project: &str, file: &ProjectFile) -> Result<(), StoreError> {
        let path = self.project_path(project)?;
        let tmp = self.root.join(format!(".{project}.json.{}.tmp", Ulid::new()));

        let bytes = serde_json::to_vec_pretty(file)?;
        fs::write(&tmp, bytes)?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn create_locked(&self, project: &str) -> Result<(), StoreError> {
        let _lock = self.acquire_lock(project)?;
        let path = self.project_path(project)?;
        if path.try_exists()? {
            return Err(StoreError::ProjectExists(project.to_string()));
        }
        self.write(
            project,
            &ProjectFile {
                version: 0,
                snapshot: ProjectSnapshot::default(),
            },
        )?;
        debug!(project, path = %path.display(), "created project file");
        Ok(())
    }

    fn commit_locked(
        &self,
        project: &str,
        expected_version: u64,
        snapshot: ProjectSnapshot,
    ) -> Result<u64, StoreError> {
        let _lock = self.acquire_lock(project)?;
        let current = self.read(project)?;
        if current.version != expected_version {
            return Err(StoreError::StaleSnapshot {
                project: project.to_string(),
                expected: expected_version,
                actual: current.version,
            });
        }

        let version = current.version + 1;
        self.write(project, &ProjectFile { version, snapshot })?;
        debug!(project, version, "committed snapshot");
        Ok(version)
    }
}

/// Run blocking file work off the async worker threads.
async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
}

#[async_trait]
impl ProjectStore for JsonFileStore {
    async fn create(&self, project: &str) -> Result<(), StoreError> {
        let store = self.clone();
        let project = project.to_string();
        blocking(move || store.create_locked(&project)).await
    }

    async fn load(&self, project: &str) -> Result<Versioned<ProjectSnapshot>, StoreError> {
        let store = self.clone();
        let project = project.to_string();
        let file = blocking(move || store.read(&project)).await?;
        Ok(Versioned {
            version: file.version,
            value: file.snapshot,
        })
    }

    async fn commit(
        &self,
        project: &str,
        expected_version: u64,
        snapshot: ProjectSnapshot,
    ) -> Result<u64, StoreError> {
        let store = self.clone();
        let project = project.to_string();
        blocking(move || store.commit_locked(&project, expected_version, snapshot)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Task, TaskId};
    use chrono::Utc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn snapshot_survives_a_reopen() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        store.create("demo").await.unwrap();

        let mut snapshot = ProjectSnapshot::default();
        snapshot
            .tasks
            .push(Task::new(TaskId::from_ulid(Ulid::new()), "write docs", Utc::now()));
        let version = store.commit("demo", 0, snapshot.clone()).await.unwrap();

        let reopened = JsonFileStore::new(dir.path());
        let loaded = reopened.load("demo").await.unwrap();
        assert_eq!(version, 1);
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.value, snapshot);
    }

    #[tokio::test]
    async fn stale_commit_is_rejected_and_file_unchanged() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        store.create("demo").await.unwrap();
        store
            .commit("demo", 0, ProjectSnapshot::default())
            .await
            .unwrap();

        let mut other = ProjectSnapshot::default();
        other
            .tasks
            .push(Task::new(TaskId::from_ulid(Ulid::new()), "late", Utc::now()));
        let err = store.commit("demo", 0, other).await.unwrap_err();

        assert!(matches!(err, StoreError::StaleSnapshot { actual: 1, .. }));
        assert!(store.load("demo").await.unwrap().value.tasks.is_empty());
    }

    #[tokio::test]
    async fn no_temp_files_are_left_behind() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        store.create("demo").await.unwrap();
        store
            .commit("demo", 0, ProjectSnapshot::default())
            .await
            .unwrap();

        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["demo.json".to_string(), "demo.lock".to_string()]);
    }

    #[tokio::test]
    async fn missing_and_duplicate_projects() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested"));

        assert!(matches!(
            store.load("demo").await,
            Err(StoreError::ProjectNotFound(_))
        ));
        store.create("demo").await.unwrap();
        assert!(matches!(
            store.create("demo").await,
            Err(StoreError::ProjectExists(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn separate_stores_racing_on_one_version_have_one_winner() {
        let dir = tempdir().unwrap();
        JsonFileStore::new(dir.path()).create("demo").await.unwrap();

        for round in 0..50u64 {
            // two handles share nothing but the directory, like two CLI processes
            let a = JsonFileStore::new(dir.path());
            let b = JsonFileStore::new(dir.path());
            let left = tokio::spawn(async move {
                a.commit("demo", round, ProjectSnapshot::default()).await
            });
            let right = tokio::spawn(async move {
                b.commit("demo", round, ProjectSnapshot::default()).await
            });
            let results = [left.await.unwrap(), right.await.unwrap()];

            let won = results.iter().filter(|r| r.is_ok()).count();
            assert_eq!(won, 1, "round {round}: {results:?}");
            assert!(results.iter().any(|r| matches!(
                r,
                Err(StoreError::StaleSnapshot { expected, actual, .. })
                    if *expected == round && *actual == round + 1
            )));
        }
        let loaded = JsonFileStore::new(dir.path()).load("demo").await.unwrap();
        assert_eq!(loaded.version, 50);
    }

    #[test]
    fn project_names_must_be_plain() {
        let store = JsonFileStore::new("/tmp/weft");
        assert!(store.project_path("ok-name").is_ok());
        for bad in ["", "..", "a/b", "a\\b"] {
            assert!(matches!(
                store.project_path(bad),
                Err(StoreError::InvalidProjectName(_))
            ));
        }
    }
}
