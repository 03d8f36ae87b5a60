//! In-memory checkpoint store for development and testing
//!
//! [`InMemoryCheckpointStore`] keeps marshalled checkpoint documents in a
//! per-run `Vec` behind a tokio `RwLock`. Checkpoints pass through the
//! [`WireMarshaller`](crate::wire::WireMarshaller) on both write and read,
//! so tests exercise the same wire format a database-backed store would.
//!
//! Not suitable for production: nothing survives a restart, and memory
//! grows with every checkpoint unless a retention bound is set with
//! [`with_retention`](InMemoryCheckpointStore::with_retention).

use crate::checkpoint::{CheckpointId, CheckpointIndexEntry, RunCheckpoint};
use crate::error::{CheckpointError, Result};
use crate::traits::CheckpointStore;
use crate::wire::WireMarshaller;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct StoredCheckpoint {
    entry: CheckpointIndexEntry,
    payload: Value,
}

/// Reference [`CheckpointStore`] backed by process memory
#[derive(Clone)]
pub struct InMemoryCheckpointStore {
    runs: Arc<RwLock<HashMap<String, Vec<StoredCheckpoint>>>>,
    marshaller: WireMarshaller,
    retention: Option<usize>,
}

impl InMemoryCheckpointStore {
    /// Create an empty store with the default marshaller
    pub fn new() -> Self {
        Self {
            runs: Arc::new(RwLock::new(HashMap::new())),
            marshaller: WireMarshaller::new(),
            retention: None,
        }
    }

    /// Use a custom marshaller (e.g. with extra converters registered)
    pub fn with_marshaller(mut self, marshaller: WireMarshaller) -> Self {
        self.marshaller = marshaller;
        self
    }

    /// Keep at most `max_per_run` checkpoints per run, evicting oldest
    pub fn with_retention(mut self, max_per_run: usize) -> Self {
        self.retention = Some(max_per_run);
        self
    }

    /// Total number of checkpoints across all runs
    pub async fn checkpoint_count(&self) -> usize {
        self.runs.read().await.values().map(Vec::len).sum()
    }

    /// Number of runs with at least one checkpoint
    pub async fn run_count(&self) -> usize {
        self.runs.read().await.len()
    }

    /// Drop every stored checkpoint
    pub async fn clear(&self) {
        self.runs.write().await.clear();
    }
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn create_checkpoint(&self, checkpoint: &RunCheckpoint) -> Result<CheckpointId> {
        let payload = self.marshaller.marshal(checkpoint)?;
        let stored = StoredCheckpoint {
            entry: CheckpointIndexEntry::from_checkpoint(checkpoint),
            payload,
        };

        let mut runs = self.runs.write().await;
        let entries = runs.entry(checkpoint.run_id.clone()).or_default();
        entries.retain(|existing| existing.entry.id != checkpoint.id);
        entries.push(stored);
        if let Some(max) = self.retention {
            while entries.len() > max {
                entries.remove(0);
            }
        }
        Ok(checkpoint.id.clone())
    }

    async fn retrieve(&self, run_id: &str, checkpoint_id: &str) -> Result<RunCheckpoint> {
        let runs = self.runs.read().await;
        let stored = runs
            .get(run_id)
            .and_then(|entries| entries.iter().find(|c| c.entry.id == checkpoint_id))
            .ok_or_else(|| CheckpointError::NotFound {
                run_id: run_id.to_string(),
                checkpoint_id: checkpoint_id.to_string(),
            })?;
        self.marshaller.unmarshal(stored.payload.clone())
    }

    async fn retrieve_index(
        &self,
        run_id: &str,
        parent: Option<&str>,
    ) -> Result<Vec<CheckpointIndexEntry>> {
        let runs = self.runs.read().await;
        let entries = runs.get(run_id).map(Vec::as_slice).unwrap_or(&[]);
        Ok(entries
            .iter()
            .map(|stored| stored.entry.clone())
            .filter(|entry| match parent {
                Some(parent_id) => entry.parent_id.as_deref() == Some(parent_id),
                None => true,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_and_retrieve() {
        let store = InMemoryCheckpointStore::new();
        let mut checkpoint = RunCheckpoint::new("run-1").with_step(1);
        checkpoint.scopes.insert("topic/x".to_string(), json!(5));

        let id = store.create_checkpoint(&checkpoint).await.unwrap();
        let restored = store.retrieve("run-1", &id).await.unwrap();
        assert_eq!(checkpoint, restored);
    }

    #[tokio::test]
    async fn test_missing_checkpoint_is_not_found() {
        let store = InMemoryCheckpointStore::new();
        let err = store.retrieve("run-1", "nope").await.unwrap_err();
        assert!(matches!(err, CheckpointError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_index_filters_by_parent() {
        let store = InMemoryCheckpointStore::new();
        let root = RunCheckpoint::new("run-1");
        let child = RunCheckpoint::new("run-1").with_parent(root.id.clone());
        let other = RunCheckpoint::new("run-1");

        store.create_checkpoint(&root).await.unwrap();
        store.create_checkpoint(&child).await.unwrap();
        store.create_checkpoint(&other).await.unwrap();

        let all = store.retrieve_index("run-1", None).await.unwrap();
        assert_eq!(all.len(), 3);

        let children = store.retrieve_index("run-1", Some(&root.id)).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, child.id);
    }

    #[tokio::test]
    async fn test_retention_evicts_oldest() {
        let store = InMemoryCheckpointStore::new().with_retention(2);
        let first = RunCheckpoint::new("run-1").with_step(1);
        let second = RunCheckpoint::new("run-1").with_step(2);
        let third = RunCheckpoint::new("run-1").with_step(3);

        for checkpoint in [&first, &second, &third] {
            store.create_checkpoint(checkpoint).await.unwrap();
        }

        assert_eq!(store.checkpoint_count().await, 2);
        assert!(store.retrieve("run-1", &first.id).await.is_err());
        assert!(store.retrieve("run-1", &third.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_runs_are_isolated() {
        let store = InMemoryCheckpointStore::new();
        let a = RunCheckpoint::new("run-a");
        let b = RunCheckpoint::new("run-b");
        store.create_checkpoint(&a).await.unwrap();
        store.create_checkpoint(&b).await.unwrap();

        assert_eq!(store.run_count().await, 2);
        assert!(store.retrieve("run-a", &b.id).await.is_err());
    }
}
