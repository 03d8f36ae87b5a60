//! # agentflow-checkpoint - Run snapshot persistence for agentflow
//!
//! Checkpoint abstractions for the agentflow workflow engine:
//!
//! - [`RunCheckpoint`] - complete run snapshot taken at a super-step
//!   boundary (scopes, executor states, inboxes, fan-in buffers, pending
//!   external-input requests)
//! - [`CheckpointStore`] - pluggable storage capability consumed by the
//!   scheduler
//! - [`WireMarshaller`] - `$type`-tagged JSON wire format with converter
//!   plugins and schema versioning
//! - [`InMemoryCheckpointStore`] - reference backend for development and
//!   tests
//!
//! The engine crate (`agentflow-core`) writes checkpoints at super-step
//! boundaries and restores from them to resume suspended or abandoned
//! runs. Backends only move opaque marshalled documents; the engine owns
//! every payload shape.
//!
//! ## Quick start
//!
//! ```rust
//! use agentflow_checkpoint::{CheckpointStore, InMemoryCheckpointStore, RunCheckpoint};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> agentflow_checkpoint::Result<()> {
//! let store = InMemoryCheckpointStore::new();
//!
//! let checkpoint = RunCheckpoint::new("run-1").with_step(4);
//! let id = store.create_checkpoint(&checkpoint).await?;
//!
//! let restored = store.retrieve("run-1", &id).await?;
//! assert_eq!(restored.step, 4);
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod error;
pub mod memory;
pub mod traits;
pub mod wire;

pub use checkpoint::{CheckpointId, CheckpointIndexEntry, RunCheckpoint, RunId};
pub use error::{CheckpointError, Result};
pub use memory::InMemoryCheckpointStore;
pub use traits::CheckpointStore;
pub use wire::{ValueConverter, WireEncoding, WireMarshaller, TYPE_KEY};
