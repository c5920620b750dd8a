//! Checkpoint records.

use crate::ids::{BranchId, CheckpointId};
use crate::message::TimestampedMessage;
use crate::participant::{CoordinatorState, ParticipantState};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Record format written by this build. Older versions still load; the
/// validator surfaces the drift as a warning.
pub const CHECKPOINT_FORMAT_VERSION: &str = "parley.checkpoint.v1";

/// The loop action a checkpoint was taken at. Only `message-appended`
/// records carry a fully consistent conversation state and are restorable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    TurnStart,
    MessageAppended,
    ReplyGenerated,
    TurnEnd,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TurnStart => "turn-start",
            Self::MessageAppended => "message-appended",
            Self::ReplyGenerated => "reply-generated",
            Self::TurnEnd => "turn-end",
        }
    }

    pub fn is_restorable(self) -> bool {
        matches!(self, Self::MessageAppended)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One durable conversation snapshot.
///
/// `content_hash` covers the canonical JSON of the record with the hash
/// field itself removed; a mismatch on load is tolerated and flagged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub id: CheckpointId,
    pub step_index: u64,
    pub action: ActionKind,
    pub created_at: DateTime<Utc>,
    pub format_version: String,
    pub content_hash: String,
    pub coordinator: CoordinatorState,
    pub participants: IndexMap<String, ParticipantState>,
    pub message_log: Vec<TimestampedMessage>,
    /// Free-form annotations; the engine records at least `branch_id` and a
    /// short note here.
    #[serde(default)]
    pub session_meta: serde_json::Value,
}

impl CheckpointRecord {
    /// Compose the unique id for a record: step, action, and creation time.
    pub fn compose_id(step_index: u64, action: ActionKind, created_at: DateTime<Utc>) -> CheckpointId {
        CheckpointId::from_string(format!(
            "checkpoint_{step_index}_{action}_{}",
            created_at.format("%Y%m%dT%H%M%S%3f")
        ))
    }

    /// Timestamp of the last committed message in this record, if any.
    pub fn commit_timestamp(&self) -> Option<u64> {
        self.message_log.last().map(|message| message.timestamp)
    }

    /// Branch the record was taken on, read back from `session_meta`.
    pub fn branch_id(&self) -> Option<BranchId> {
        self.session_meta
            .get("branch_id")
            .and_then(serde_json::Value::as_u64)
            .map(BranchId::new)
    }
}
