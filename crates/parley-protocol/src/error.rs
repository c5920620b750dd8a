//! Error taxonomy for checkpoint, restoration, and engine operations.

use thiserror::Error;

/// Errors surfaced by the engine and its control surface.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A requested checkpoint id or message timestamp does not exist.
    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),
    /// A record exists but fails validation (wrong action kind, missing
    /// required state, corrupt JSON).
    #[error("invalid checkpoint: {0}")]
    InvalidCheckpoint(String),
    /// Participants or the coordinator could not be rebuilt from a record.
    /// Fatal to the restore attempt; existing branches are never touched.
    #[error("restoration failed: {0}")]
    Restoration(String),
    /// Live state could not be turned into a persistable record. Non-fatal
    /// to a running conversation; the save is skipped.
    #[error("state serialization failed: {0}")]
    Serialization(String),
    /// Record format drift. Surfaced as a warning on load; restoration is
    /// still attempted.
    #[error("checkpoint format `{found}` does not match runtime format `{expected}`")]
    VersionCompatibility { expected: String, found: String },
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Convenience result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
