//! Conversation messages.
//!
//! Payloads are opaque to the engine apart from their textual content;
//! `meta` carries whatever the reply provider attached. Timestamps are
//! monotonic integers assigned per branch by the ledger, never wall-clock.

use serde::{Deserialize, Serialize};

/// Delivery target of a message: a named participant or a shared topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Address {
    Participant(String),
    Topic(String),
}

impl Address {
    pub fn participant(name: impl Into<String>) -> Self {
        Self::Participant(name.into())
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self::Topic(name.into())
    }
}

/// Message body as produced by a participant or reply provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub content: String,
    #[serde(default)]
    pub meta: serde_json::Value,
}

impl MessagePayload {
    /// Plain-text payload with no metadata.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            meta: serde_json::Value::Null,
        }
    }
}

/// A committed message: payload plus branch-local monotonic timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampedMessage {
    pub timestamp: u64,
    pub sender: String,
    pub recipient: Address,
    pub payload: MessagePayload,
}

impl TimestampedMessage {
    pub fn new(
        timestamp: u64,
        sender: impl Into<String>,
        recipient: Address,
        payload: MessagePayload,
    ) -> Self {
        Self {
            timestamp,
            sender: sender.into(),
            recipient,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_serde_shape() {
        let json = serde_json::to_string(&Address::topic("group")).unwrap();
        assert_eq!(json, r#"{"kind":"topic","name":"group"}"#);
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Address::topic("group"));
    }

    #[test]
    fn payload_meta_defaults_to_null() {
        let payload: MessagePayload = serde_json::from_str(r#"{"content":"hi"}"#).unwrap();
        assert_eq!(payload, MessagePayload::text("hi"));
    }

    #[test]
    fn message_roundtrip() {
        let message = TimestampedMessage::new(
            7,
            "solver",
            Address::participant("critic"),
            MessagePayload::text("try the lemma"),
        );
        let json = serde_json::to_string(&message).unwrap();
        let back: TimestampedMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(message, back);
    }
}
