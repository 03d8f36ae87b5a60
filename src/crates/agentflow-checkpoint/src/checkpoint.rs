//! Core checkpoint data structures for run persistence and replay
//!
//! A [`RunCheckpoint`] is a complete snapshot of a workflow run at a
//! super-step boundary: scope values, per-executor opaque state, queued
//! inbox envelopes, partially filled fan-in buffers and any outstanding
//! external-input requests. Restoring a checkpoint and replaying the same
//! external inputs reproduces the run byte for byte.
//!
//! Checkpoints within a run form a parent/child chain (a DAG once a run is
//! forked from an earlier checkpoint). The engine never interprets the
//! payload maps here beyond serialization: executor ids, scope keys and
//! envelope shapes are owned by the core crate and round-trip as
//! [`serde_json::Value`]s through the wire marshaller.
//!
//! # Example
//!
//! ```rust
//! use agentflow_checkpoint::RunCheckpoint;
//!
//! let checkpoint = RunCheckpoint::new("run-1")
//!     .with_step(3)
//!     .with_parent("earlier-checkpoint-id");
//!
//! assert_eq!(checkpoint.run_id, "run-1");
//! assert_eq!(checkpoint.schema_version, RunCheckpoint::SCHEMA_VERSION);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Checkpoint ID type
pub type CheckpointId = String;

/// Run ID type
pub type RunId = String;

/// Complete run snapshot taken at a super-step boundary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunCheckpoint {
    /// Wire format version; mismatches are rejected on retrieve
    pub schema_version: u32,

    /// Run this checkpoint belongs to
    pub run_id: RunId,

    /// Unique id of this checkpoint
    pub id: CheckpointId,

    /// Parent checkpoint, if any (chains form a DAG per run)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<CheckpointId>,

    /// Capture time
    pub created_at: DateTime<Utc>,

    /// Super-step the run will execute next after restore
    pub step: u64,

    /// Scope values, keyed by `"{scope}/{key}"`
    pub scopes: HashMap<String, Value>,

    /// Opaque per-executor state blobs, keyed by executor id
    pub executor_states: HashMap<String, Value>,

    /// Queued envelopes per executor id, in delivery order
    pub inboxes: HashMap<String, Vec<Value>>,

    /// Partially filled fan-in cohorts, keyed by edge group id
    pub edge_buffers: HashMap<String, Value>,

    /// External-input requests the run is suspended on
    pub pending_requests: Vec<Value>,

    /// Most recent output payload emitted by the run, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_output: Option<Value>,
}

impl RunCheckpoint {
    /// Current wire schema version
    pub const SCHEMA_VERSION: u32 = 1;

    /// Create an empty checkpoint for a run with a fresh id
    pub fn new(run_id: impl Into<RunId>) -> Self {
        Self {
            schema_version: Self::SCHEMA_VERSION,
            run_id: run_id.into(),
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            created_at: Utc::now(),
            step: 0,
            scopes: HashMap::new(),
            executor_states: HashMap::new(),
            inboxes: HashMap::new(),
            edge_buffers: HashMap::new(),
            pending_requests: Vec::new(),
            last_output: None,
        }
    }

    /// Set the parent checkpoint id
    pub fn with_parent(mut self, parent_id: impl Into<CheckpointId>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Set the next super-step number
    pub fn with_step(mut self, step: u64) -> Self {
        self.step = step;
        self
    }
}

/// Index entry describing a stored checkpoint without its payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointIndexEntry {
    /// Checkpoint id
    pub id: CheckpointId,

    /// Parent checkpoint id, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<CheckpointId>,

    /// Capture time
    pub created_at: DateTime<Utc>,

    /// Super-step the checkpoint resumes at
    pub step: u64,
}

impl CheckpointIndexEntry {
    /// Build an index entry from a full checkpoint
    pub fn from_checkpoint(checkpoint: &RunCheckpoint) -> Self {
        Self {
            id: checkpoint.id.clone(),
            parent_id: checkpoint.parent_id.clone(),
            created_at: checkpoint.created_at,
            step: checkpoint.step,
        }
    }
}
