//! Error types for checkpoint operations

use thiserror::Error;

/// Result type for checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors that can occur during checkpoint operations
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Checkpoint not found
    #[error("Checkpoint not found: run '{run_id}', checkpoint '{checkpoint_id}'")]
    NotFound {
        run_id: String,
        checkpoint_id: String,
    },

    /// Wire schema version did not match the engine's expectation
    #[error("Checkpoint schema version mismatch: expected {expected}, found {found}")]
    SchemaVersion { expected: u32, found: u32 },

    /// Payload failed marshalling or converter validation
    #[error("Corrupt checkpoint payload: {0}")]
    Corrupt(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary serialization error
    #[error("Binary serialization error: {0}")]
    BinarySerialization(#[from] bincode::Error),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Custom error
    #[error("{0}")]
    Custom(String),
}
