//! # parley-protocol — Conversation checkpoint contract
//!
//! Shared types for the parley engine: everything that crosses a crate
//! boundary or lands on disk lives here.
//!
//! It is intentionally dependency-light (no runtime deps like tokio) so it
//! can be used as a pure contract crate.
//!
//! ## Module Overview
//!
//! - [`ids`] — Typed ID wrappers (RunId, CheckpointId, BranchId)
//! - [`message`] — MessagePayload, TimestampedMessage, Address
//! - [`participant`] — ParticipantState, CoordinatorState, ModelConfig,
//!   CodeExecutionPolicy, TerminationPattern
//! - [`checkpoint`] — CheckpointRecord + ActionKind
//! - [`session`] — Branch, ParentCutoff, HistoryBundle
//! - [`error`] — EngineError, EngineResult

pub mod checkpoint;
pub mod error;
pub mod ids;
pub mod message;
pub mod participant;
pub mod session;

// Re-export the most commonly used types at the crate root.
pub use checkpoint::{ActionKind, CHECKPOINT_FORMAT_VERSION, CheckpointRecord};
pub use error::{EngineError, EngineResult};
pub use ids::{BranchId, CheckpointId, RunId};
pub use message::{Address, MessagePayload, TimestampedMessage};
pub use participant::{
    CodeExecutionConfig, CodeExecutionPolicy, CoordinatorState, InputMode, ModelConfig,
    ParticipantState, TerminationPattern,
};
pub use session::{BUNDLE_FORMAT_VERSION, Branch, HistoryBundle, ParentCutoff};
