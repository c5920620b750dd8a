//! Branches and the multi-branch history bundle.

use crate::ids::BranchId;
use crate::message::TimestampedMessage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Bundle format written by this build.
pub const BUNDLE_FORMAT_VERSION: &str = "parley.branches.v1";

/// Where a branch was forked from: parent branch plus the cutoff timestamp.
/// Messages with `timestamp < cutoff` were copied into the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentCutoff {
    pub branch_id: BranchId,
    pub timestamp: u64,
}

/// One conversation timeline. A branch freezes the instant a child forks
/// from it and is never mutated again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub branch_id: BranchId,
    pub messages: Vec<TimestampedMessage>,
    pub parent_cutoff: Option<ParentCutoff>,
    /// Optional evaluation result attached by an operator.
    pub score: Option<f64>,
    #[serde(default)]
    pub frozen: bool,
}

impl Branch {
    pub fn root() -> Self {
        Self {
            branch_id: BranchId::root(),
            messages: Vec::new(),
            parent_cutoff: None,
            score: None,
            frozen: false,
        }
    }
}

/// Serialized form of a whole run's history: every branch plus the active
/// one. Branch keys serialize as integers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryBundle {
    pub format_version: String,
    pub current_branch: BranchId,
    pub branches: BTreeMap<BranchId, Branch>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Address, MessagePayload};

    #[test]
    fn bundle_roundtrip() {
        let mut branches = BTreeMap::new();
        let mut root = Branch::root();
        root.messages.push(TimestampedMessage::new(
            0,
            "user",
            Address::topic("group"),
            MessagePayload::text("plan the trip"),
        ));
        root.frozen = true;
        branches.insert(root.branch_id, root);
        let child = Branch {
            branch_id: BranchId::new(1),
            messages: Vec::new(),
            parent_cutoff: Some(ParentCutoff {
                branch_id: BranchId::root(),
                timestamp: 0,
            }),
            score: Some(0.5),
            frozen: false,
        };
        branches.insert(child.branch_id, child);
        let bundle = HistoryBundle {
            format_version: BUNDLE_FORMAT_VERSION.to_string(),
            current_branch: BranchId::new(1),
            branches,
        };
        let json = serde_json::to_string_pretty(&bundle).unwrap();
        let back: HistoryBundle = serde_json::from_str(&json).unwrap();
        assert_eq!(bundle, back);
    }
}
