//! Checkpoint persistence: the file-backed store and the record validator.

pub mod store;
pub mod validate;

pub use store::{CheckpointStore, FileCheckpointStore, LoadedCheckpoint, content_hash_of};
pub use validate::CheckpointValidator;
