//! Reply generation and speaker selection ports.
//!
//! Model backends live behind [`ReplyProvider`]; the engine treats them as a
//! black box that may return a payload, nothing, or an error. The scripted
//! provider drives demos and tests deterministically.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_protocol::{EngineResult, MessagePayload, TimestampedMessage};

use crate::participant::Participant;

#[async_trait]
pub trait ReplyProvider: Send + Sync {
    /// Produce the next reply for `speaker` given its view of the
    /// conversation. `None` means the provider has nothing to say and the
    /// run terminates.
    async fn generate_reply(
        &self,
        speaker: &Participant,
        history: &[TimestampedMessage],
    ) -> EngineResult<Option<MessagePayload>>;
}

/// Pure function of roster and last speaker; no internal state.
pub trait SpeakerSelector: Send + Sync {
    fn select_speaker(&self, last_speaker: Option<&str>, roster: &[String]) -> Option<String>;
}

/// Cycles through the roster in order, starting after the last speaker.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobinSelector;

impl SpeakerSelector for RoundRobinSelector {
    fn select_speaker(&self, last_speaker: Option<&str>, roster: &[String]) -> Option<String> {
        if roster.is_empty() {
            return None;
        }
        let next_index = match last_speaker.and_then(|last| {
            roster.iter().position(|name| name == last)
        }) {
            Some(index) => (index + 1) % roster.len(),
            None => 0,
        };
        roster.get(next_index).cloned()
    }
}

/// Deterministic provider that replays a queue of canned payloads. An empty
/// queue yields `None`, which ends the run.
#[derive(Debug, Default)]
pub struct ScriptedReplyProvider {
    script: Mutex<VecDeque<MessagePayload>>,
}

impl ScriptedReplyProvider {
    pub fn new(replies: impl IntoIterator<Item = MessagePayload>) -> Self {
        Self {
            script: Mutex::new(replies.into_iter().collect()),
        }
    }

    pub fn from_lines<S: AsRef<str>>(lines: &[S]) -> Self {
        Self::new(lines.iter().map(|line| MessagePayload::text(line.as_ref())))
    }

    /// Queue more replies, e.g. before resuming a rewound branch.
    pub fn push(&self, payload: MessagePayload) {
        self.script.lock().push_back(payload);
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }
}

#[async_trait]
impl ReplyProvider for ScriptedReplyProvider {
    async fn generate_reply(
        &self,
        _speaker: &Participant,
        _history: &[TimestampedMessage],
    ) -> EngineResult<Option<MessagePayload>> {
        Ok(self.script.lock().pop_front())
    }
}
