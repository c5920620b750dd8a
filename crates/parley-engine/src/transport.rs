//! Broadcast hub for engine observers.
//!
//! Slow subscribers lose events; the conversation never blocks on them.

use parley_protocol::{ActionKind, BranchId, CheckpointId, TimestampedMessage};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportEvent {
    MessageCommitted {
        branch_id: BranchId,
        message: TimestampedMessage,
    },
    MessageDropped {
        sender: String,
    },
    CheckpointWritten {
        id: CheckpointId,
        step_index: u64,
        action: ActionKind,
    },
    RunTerminated {
        branch_id: BranchId,
        reason: String,
    },
}

#[derive(Clone, Debug)]
pub struct TransportHub {
    sender: broadcast::Sender<TransportEvent>,
}

impl TransportHub {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn publish(&self, event: TransportEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.sender.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<TransportEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }
}
