//! Typed identifiers for runs, checkpoints, and branches.
//!
//! Run and checkpoint IDs are opaque String wrappers (serde-transparent);
//! checkpoint IDs are composed from step/action/timestamp so they are unique
//! by construction. Branch IDs are small integers numbered per run.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from any string value.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Create a new ID using UUID v4 (random).
            pub fn new_uuid() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// View as string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

typed_id!(
    /// Unique identifier for a conversation run (one persisted directory).
    RunId
);
typed_id!(
    /// Unique identifier for a checkpoint record.
    CheckpointId
);

/// Identifier for a branch within a run. Branch 0 is the root; forks are
/// numbered upward.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct BranchId(u64);

impl BranchId {
    /// The root branch every run starts on.
    pub fn root() -> Self {
        Self(0)
    }

    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// The next branch number after this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for BranchId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_new_is_unique() {
        let a = RunId::new_uuid();
        let b = RunId::new_uuid();
        assert_ne!(a, b);
    }

    #[test]
    fn checkpoint_id_from_string() {
        let id = CheckpointId::from_string("checkpoint_3_message-appended_x");
        assert_eq!(id.as_str(), "checkpoint_3_message-appended_x");
        assert_eq!(id.to_string(), "checkpoint_3_message-appended_x");
    }

    #[test]
    fn typed_id_serde_roundtrip() {
        let id = RunId::from_string("RUN001");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"RUN001\"");
        let back: RunId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn branch_id_root_and_next() {
        let root = BranchId::root();
        assert_eq!(root.as_u64(), 0);
        assert_eq!(root.next(), BranchId::new(1));
        assert_eq!(root.to_string(), "0");
    }

    #[test]
    fn branch_id_serializes_as_number() {
        let json = serde_json::to_string(&BranchId::new(2)).unwrap();
        assert_eq!(json, "2");
        let back: BranchId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, BranchId::new(2));
    }
}
