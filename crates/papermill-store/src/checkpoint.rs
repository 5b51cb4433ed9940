//! Per-run progress records
//!
//! A checkpoint lists the items a run has fully processed. Every mutation is
//! a read-modify-write of `<dir>/<run_id>.json` through an atomic rename, and
//! mutations of one run are serialized in-process so concurrent workers never
//! lose each other's appends.

use crate::atomic::{list_json, read_json, remove, stem, write_json};
use crate::error::{check_id, Result, StoreError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Durable progress of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Run id
    pub run_id: String,
    /// When the run first started
    pub started_at: DateTime<Utc>,
    /// Item keys fully processed, in completion order
    pub completed_item_ids: Vec<String>,
    /// Set once the run finished
    pub completed_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    /// Fresh, empty checkpoint
    #[must_use]
    pub fn fresh(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            started_at: Utc::now(),
            completed_item_ids: Vec::new(),
            completed_at: None,
        }
    }

    /// True if `item_id` is recorded as done
    #[must_use]
    pub fn contains(&self, item_id: &str) -> bool {
        self.completed_item_ids.iter().any(|id| id == item_id)
    }

    /// Number of completed items
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.completed_item_ids.len()
    }

    /// True when nothing has completed
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.completed_item_ids.is_empty()
    }

    /// True once the run was marked complete
    #[inline]
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// One line of [`CheckpointStore::list_runs`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Run id
    pub run_id: String,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Completed items
    pub completed: usize,
    /// Completion time, if finished
    pub completed_at: Option<DateTime<Utc>>,
}

/// Directory of checkpoints, one file per run
#[derive(Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CheckpointStore {
    /// Open (creating if needed) the checkpoint directory.
    ///
    /// # Errors
    /// The directory cannot be created.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(StoreError::io(&dir))?;
        Ok(Self {
            dir,
            locks: DashMap::new(),
        })
    }

    /// Checkpoint directory
    #[inline]
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, run_id: &str) -> Result<PathBuf> {
        check_id(run_id)?;
        Ok(self.dir.join(format!("{run_id}.json")))
    }

    fn lock(&self, run_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(run_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Drop the run's lock entry unless another task still holds it.
    fn release(&self, run_id: &str, lock: &Arc<Mutex<()>>) {
        // One reference is ours, one is the map's.
        self.locks
            .remove_if(run_id, |_, held| Arc::ptr_eq(held, lock) && Arc::strong_count(held) <= 2);
    }

    async fn read(&self, run_id: &str, path: &Path) -> Result<Checkpoint> {
        match read_json::<Checkpoint>(path).await {
            Ok(Some(checkpoint)) => Ok(checkpoint),
            Ok(None) => Ok(Checkpoint::fresh(run_id)),
            Err(err) if err.is_corrupt() => {
                tracing::warn!(run_id, error = %err, "Malformed checkpoint, starting fresh");
                Ok(Checkpoint::fresh(run_id))
            }
            Err(err) => Err(err),
        }
    }

    /// Load the checkpoint of `run_id`; absent or malformed yields a fresh
    /// one. Nothing is written.
    ///
    /// # Errors
    /// Invalid run id or unreadable file.
    pub async fn load(&self, run_id: &str) -> Result<Checkpoint> {
        let path = self.path(run_id)?;
        self.read(run_id, &path).await
    }

    async fn update<F>(&self, run_id: &str, mutate: F) -> Result<Checkpoint>
    where
        F: FnOnce(&mut Checkpoint) -> bool,
    {
        let path = self.path(run_id)?;
        let lock = self.lock(run_id);
        let _guard = lock.lock().await;

        let mut checkpoint = self.read(run_id, &path).await?;
        if mutate(&mut checkpoint) {
            write_json(&path, &checkpoint).await?;
        }
        Ok(checkpoint)
    }

    /// Record `item_id` as completed. Appending an id already present is a
    /// no-op.
    ///
    /// # Errors
    /// Invalid run id or write failure.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn append(&self, run_id: &str, item_id: &str) -> Result<Checkpoint> {
        self.update(run_id, |cp| {
            if cp.contains(item_id) {
                return false;
            }
            cp.completed_item_ids.push(item_id.to_string());
            true
        })
        .await
    }

    /// Undo an append.
    ///
    /// # Errors
    /// Invalid run id or write failure.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn remove(&self, run_id: &str, item_id: &str) -> Result<Checkpoint> {
        self.update(run_id, |cp| {
            let before = cp.completed_item_ids.len();
            cp.completed_item_ids.retain(|id| id != item_id);
            cp.completed_item_ids.len() != before
        })
        .await
    }

    /// Mark the run finished.
    ///
    /// # Errors
    /// Invalid run id or write failure.
    pub async fn mark_complete(&self, run_id: &str) -> Result<Checkpoint> {
        let path = self.path(run_id)?;
        let lock = self.lock(run_id);
        let guard = lock.lock().await;

        let mut checkpoint = self.read(run_id, &path).await?;
        checkpoint.completed_at = Some(Utc::now());
        let written = write_json(&path, &checkpoint).await;
        drop(guard);
        self.release(run_id, &lock);
        written.map(|()| checkpoint)
    }

    /// Delete the checkpoint; returns whether one existed.
    ///
    /// # Errors
    /// Invalid run id or delete failure.
    pub async fn clear(&self, run_id: &str) -> Result<bool> {
        let path = self.path(run_id)?;
        let lock = self.lock(run_id);
        let guard = lock.lock().await;
        let removed = remove(&path).await;
        drop(guard);
        self.release(run_id, &lock);
        removed
    }

    /// Every stored run, sorted by id. Malformed files are skipped.
    ///
    /// # Errors
    /// The directory cannot be listed.
    pub async fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let mut runs = Vec::new();
        for path in list_json(&self.dir).await? {
            let Some(run_id) = stem(&path) else { continue };
            match read_json::<Checkpoint>(&path).await {
                Ok(Some(cp)) => runs.push(RunSummary {
                    run_id: run_id.to_string(),
                    started_at: cp.started_at,
                    completed: cp.len(),
                    completed_at: cp.completed_at,
                }),
                Ok(None) => {}
                Err(err) => tracing::warn!(run_id, error = %err, "Skipping unreadable checkpoint"),
            }
        }
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_absent_is_fresh_and_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path().join("checkpoints")).await.unwrap();
        let cp = store.load("run-1").await.unwrap();
        assert!(cp.is_empty());
        assert!(!cp.is_complete());
        assert!(store.list_runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn append_remove_complete_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).await.unwrap();

        store.append("run-1", "doi:10.1/a").await.unwrap();
        store.append("run-1", "doi:10.1/b").await.unwrap();
        store.append("run-1", "doi:10.1/a").await.unwrap();
        let cp = store.load("run-1").await.unwrap();
        assert_eq!(cp.completed_item_ids, vec!["doi:10.1/a", "doi:10.1/b"]);

        let cp = store.remove("run-1", "doi:10.1/a").await.unwrap();
        assert_eq!(cp.completed_item_ids, vec!["doi:10.1/b"]);

        let cp = store.mark_complete("run-1").await.unwrap();
        assert!(cp.is_complete());
        let runs = store.list_runs().await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].completed, 1);

        assert!(store.clear("run-1").await.unwrap());
        assert!(!store.clear("run-1").await.unwrap());
        assert!(store.load("run-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn finished_runs_release_their_locks() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).await.unwrap();

        store.append("run-a", "doi:10.1/a").await.unwrap();
        store.append("run-b", "doi:10.1/b").await.unwrap();
        assert_eq!(store.locks.len(), 2);

        store.mark_complete("run-a").await.unwrap();
        assert!(store.clear("run-b").await.unwrap());
        assert!(store.locks.is_empty());

        // A completed run can still be appended to after its lock was dropped.
        store.append("run-a", "doi:10.1/c").await.unwrap();
        let cp = store.load("run-a").await.unwrap();
        assert_eq!(cp.completed_item_ids, vec!["doi:10.1/a", "doi:10.1/c"]);
        assert!(cp.is_complete());
    }

    #[tokio::test]
    async fn malformed_checkpoint_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).await.unwrap();
        tokio::fs::write(dir.path().join("run-x.json"), b"{\"run_id\":")
            .await
            .unwrap();
        assert!(store.load("run-x").await.unwrap().is_empty());
        let cp = store.append("run-x", "pid:arxiv:1").await.unwrap();
        assert_eq!(cp.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CheckpointStore::open(dir.path()).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.append("run-c", &format!("pid:test:{i}")).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.load("run-c").await.unwrap().len(), 32);
    }

    #[tokio::test]
    async fn rejects_path_like_run_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).await.unwrap();
        assert!(matches!(
            store.append("../escape", "x").await,
            Err(StoreError::InvalidId(_))
        ));
    }
}
