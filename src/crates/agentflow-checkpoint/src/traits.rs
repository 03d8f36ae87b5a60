//! Extensible checkpoint storage trait for custom backend implementations
//!
//! [`CheckpointStore`] is the engine's only contract with checkpoint
//! persistence. The scheduler writes through it at super-step boundaries
//! and reads through it on restore; everything else (retention, indexing,
//! replication) belongs to the backend.
//!
//! Implementations must provide **read-your-writes consistency for a single
//! run id**: a `retrieve` issued after a successful `create_checkpoint` for
//! the same run must observe that checkpoint.
//!
//! # Implementing a backend
//!
//! ```rust,ignore
//! use agentflow_checkpoint::{
//!     CheckpointIndexEntry, CheckpointStore, RunCheckpoint, WireMarshaller,
//! };
//! use async_trait::async_trait;
//!
//! pub struct PostgresCheckpointStore {
//!     pool: sqlx::PgPool,
//!     marshaller: WireMarshaller,
//! }
//!
//! #[async_trait]
//! impl CheckpointStore for PostgresCheckpointStore {
//!     async fn create_checkpoint(
//!         &self,
//!         checkpoint: &RunCheckpoint,
//!     ) -> agentflow_checkpoint::Result<String> {
//!         let wire = self.marshaller.marshal(checkpoint)?;
//!         sqlx::query("INSERT INTO checkpoints (run_id, id, payload) VALUES ($1, $2, $3)")
//!             .bind(&checkpoint.run_id)
//!             .bind(&checkpoint.id)
//!             .bind(&wire)
//!             .execute(&self.pool)
//!             .await
//!             .map_err(|e| agentflow_checkpoint::CheckpointError::Storage(e.to_string()))?;
//!         Ok(checkpoint.id.clone())
//!     }
//!
//!     // ... retrieve / retrieve_index against the same table ...
//! }
//! ```

use crate::checkpoint::{CheckpointId, CheckpointIndexEntry, RunCheckpoint};
use crate::error::Result;
use async_trait::async_trait;

/// Storage capability consumed by the scheduler
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint; returns its id
    ///
    /// The payload carries its own `run_id` and optional `parent_id`.
    /// Writing the same checkpoint id twice replaces the stored payload.
    async fn create_checkpoint(&self, checkpoint: &RunCheckpoint) -> Result<CheckpointId>;

    /// Retrieve a checkpoint payload by run and checkpoint id
    async fn retrieve(&self, run_id: &str, checkpoint_id: &str) -> Result<RunCheckpoint>;

    /// List checkpoints for a run, newest last
    ///
    /// With `parent` set, only direct children of that checkpoint are
    /// returned.
    async fn retrieve_index(
        &self,
        run_id: &str,
        parent: Option<&str>,
    ) -> Result<Vec<CheckpointIndexEntry>>;
}
