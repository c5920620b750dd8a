//! The intervention hub.
//!
//! Sits between the engine and the ledger: every message passes through
//! [`InterventionHub::apply`] before it is committed. Drop is one-shot;
//! override rules carry a sender-prefix match and a remaining-use count.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use parley_protocol::MessagePayload;
use tracing::info;

#[derive(Debug, Clone)]
pub struct OverrideRule {
    pub sender_prefix: String,
    pub replacement: String,
    pub remaining: u32,
}

#[derive(Debug, Default)]
pub struct InterventionHub {
    drop_next: AtomicBool,
    override_rule: Mutex<Option<OverrideRule>>,
}

impl InterventionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard the next observed message. Arming twice is the same as once.
    pub fn arm_drop(&self) {
        self.drop_next.store(true, Ordering::SeqCst);
    }

    pub fn drop_armed(&self) -> bool {
        self.drop_next.load(Ordering::SeqCst)
    }

    /// Replace the content of the next `count` messages whose sender starts
    /// with `sender_prefix`.
    pub fn set_override(
        &self,
        sender_prefix: impl Into<String>,
        replacement: impl Into<String>,
        count: u32,
    ) {
        *self.override_rule.lock() = Some(OverrideRule {
            sender_prefix: sender_prefix.into(),
            replacement: replacement.into(),
            remaining: count,
        });
    }

    pub fn clear_override(&self) {
        *self.override_rule.lock() = None;
    }

    /// Gate a message about to be committed. `None` means it was dropped.
    pub fn apply(&self, sender: &str, payload: MessagePayload) -> Option<MessagePayload> {
        if self.drop_next.swap(false, Ordering::SeqCst) {
            info!(sender, "message dropped by intervention");
            return None;
        }
        let mut guard = self.override_rule.lock();
        if let Some(rule) = guard.as_mut()
            && rule.remaining > 0
            && sender.starts_with(&rule.sender_prefix)
        {
            let replaced = MessagePayload {
                content: rule.replacement.clone(),
                meta: payload.meta,
            };
            rule.remaining -= 1;
            info!(sender, remaining = rule.remaining, "message content overridden");
            if rule.remaining == 0 {
                *guard = None;
            }
            return Some(replaced);
        }
        Some(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_is_one_shot() {
        let hub = InterventionHub::new();
        hub.arm_drop();
        assert!(hub.apply("solver", MessagePayload::text("gone")).is_none());
        assert_eq!(
            hub.apply("solver", MessagePayload::text("kept")),
            Some(MessagePayload::text("kept"))
        );
    }

    #[test]
    fn override_matches_prefix_and_consumes_count() {
        let hub = InterventionHub::new();
        hub.set_override("sol", "redacted", 2);

        assert_eq!(
            hub.apply("critic", MessagePayload::text("untouched")),
            Some(MessagePayload::text("untouched"))
        );
        assert_eq!(
            hub.apply("solver", MessagePayload::text("one")).unwrap().content,
            "redacted"
        );
        assert_eq!(
            hub.apply("solver", MessagePayload::text("two")).unwrap().content,
            "redacted"
        );
        // Count exhausted; rule is gone.
        assert_eq!(
            hub.apply("solver", MessagePayload::text("three")).unwrap().content,
            "three"
        );
    }

    #[test]
    fn override_preserves_metadata() {
        let hub = InterventionHub::new();
        hub.set_override("solver", "fixed", 1);
        let payload = MessagePayload {
            content: "raw".to_string(),
            meta: serde_json::json!({"tool": "calculator"}),
        };
        let replaced = hub.apply("solver", payload).unwrap();
        assert_eq!(replaced.content, "fixed");
        assert_eq!(replaced.meta, serde_json::json!({"tool": "calculator"}));
    }
}
