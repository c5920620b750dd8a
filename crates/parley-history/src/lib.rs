//! The branch ledger: every committed message for every branch of a run.
//!
//! Timestamps are branch-local monotonic integers assigned here and only
//! here. Forking copies the prefix below the cutoff into a new branch,
//! freezes the parent forever, and starts the child's counter above the
//! cutoff so child timestamps never collide with the replaced suffix.

use std::collections::BTreeMap;
use std::path::Path;

use parking_lot::Mutex;
use parley_protocol::{
    Address, BUNDLE_FORMAT_VERSION, Branch, BranchId, EngineError, EngineResult, HistoryBundle,
    MessagePayload, ParentCutoff, TimestampedMessage,
};
use tokio::fs;
use tracing::{debug, info, instrument, warn};

#[derive(Debug)]
struct BranchSlot {
    branch: Branch,
    next_timestamp: u64,
}

#[derive(Debug)]
struct LedgerInner {
    current: BranchId,
    branches: BTreeMap<BranchId, BranchSlot>,
}

#[derive(Debug)]
pub struct BranchLedger {
    inner: Mutex<LedgerInner>,
}

impl Default for BranchLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl BranchLedger {
    /// A fresh ledger with an empty root branch.
    pub fn new() -> Self {
        let mut branches = BTreeMap::new();
        branches.insert(
            BranchId::root(),
            BranchSlot {
                branch: Branch::root(),
                next_timestamp: 0,
            },
        );
        Self {
            inner: Mutex::new(LedgerInner {
                current: BranchId::root(),
                branches,
            }),
        }
    }

    /// Rebuild a ledger from a persisted bundle.
    pub fn from_bundle(bundle: HistoryBundle) -> EngineResult<Self> {
        if bundle.format_version != BUNDLE_FORMAT_VERSION {
            warn!(
                found = %bundle.format_version,
                expected = BUNDLE_FORMAT_VERSION,
                "history bundle format drift; loading anyway"
            );
        }
        if !bundle.branches.contains_key(&bundle.current_branch) {
            return Err(EngineError::InvalidState(format!(
                "bundle current branch {} is not among its branches",
                bundle.current_branch
            )));
        }
        let mut branches = BTreeMap::new();
        for (branch_id, branch) in bundle.branches {
            let mut last: Option<u64> = None;
            for message in &branch.messages {
                if let Some(previous) = last
                    && message.timestamp <= previous
                {
                    return Err(EngineError::InvalidState(format!(
                        "bundle branch {branch_id} timestamps are not strictly increasing"
                    )));
                }
                last = Some(message.timestamp);
            }
            let floor = branch
                .parent_cutoff
                .map(|cutoff| cutoff.timestamp + 1)
                .unwrap_or(0);
            let next_timestamp = last.map(|t| t + 1).unwrap_or(0).max(floor);
            branches.insert(
                branch_id,
                BranchSlot {
                    branch,
                    next_timestamp,
                },
            );
        }
        Ok(Self {
            inner: Mutex::new(LedgerInner {
                current: bundle.current_branch,
                branches,
            }),
        })
    }

    pub fn current_branch(&self) -> BranchId {
        self.inner.lock().current
    }

    pub fn branch_ids(&self) -> Vec<BranchId> {
        self.inner.lock().branches.keys().copied().collect()
    }

    /// Commit a message to a branch, assigning the next timestamp.
    #[instrument(skip(self, payload), fields(branch = %branch_id, sender))]
    pub fn append(
        &self,
        branch_id: BranchId,
        sender: &str,
        recipient: Address,
        payload: MessagePayload,
    ) -> EngineResult<TimestampedMessage> {
        let mut inner = self.inner.lock();
        let slot = inner.branches.get_mut(&branch_id).ok_or_else(|| {
            EngineError::InvalidState(format!("branch {branch_id} does not exist"))
        })?;
        if slot.branch.frozen {
            return Err(EngineError::InvalidState(format!(
                "branch {branch_id} is frozen; it forked a child and is immutable"
            )));
        }
        let message =
            TimestampedMessage::new(slot.next_timestamp, sender, recipient, payload);
        slot.next_timestamp += 1;
        slot.branch.messages.push(message.clone());
        debug!(timestamp = message.timestamp, "message committed");
        Ok(message)
    }

    pub fn message_at(&self, branch_id: BranchId, timestamp: u64) -> Option<TimestampedMessage> {
        let inner = self.inner.lock();
        let slot = inner.branches.get(&branch_id)?;
        slot.branch
            .messages
            .iter()
            .find(|message| message.timestamp == timestamp)
            .cloned()
    }

    pub fn last_message(&self, branch_id: BranchId) -> Option<TimestampedMessage> {
        let inner = self.inner.lock();
        inner
            .branches
            .get(&branch_id)?
            .branch
            .messages
            .last()
            .cloned()
    }

    pub fn branch_messages(&self, branch_id: BranchId) -> Vec<TimestampedMessage> {
        let inner = self.inner.lock();
        inner
            .branches
            .get(&branch_id)
            .map(|slot| slot.branch.messages.clone())
            .unwrap_or_default()
    }

    /// Fork the current branch at `cutoff`: the child keeps messages with
    /// `timestamp < cutoff`, the parent freezes, and the child becomes
    /// current. The child's counter starts at `cutoff + 1` so its first new
    /// timestamp is strictly above the cutoff.
    #[instrument(skip(self), fields(cutoff))]
    pub fn fork_at_cutoff(&self, cutoff: u64) -> EngineResult<BranchId> {
        let mut inner = self.inner.lock();
        let parent_id = inner.current;
        let parent = inner.branches.get(&parent_id).ok_or_else(|| {
            EngineError::InvalidState(format!("branch {parent_id} does not exist"))
        })?;
        if !parent
            .branch
            .messages
            .iter()
            .any(|message| message.timestamp == cutoff)
        {
            return Err(EngineError::CheckpointNotFound(format!(
                "no message at timestamp {cutoff} in branch {parent_id}"
            )));
        }
        let child_id = inner
            .branches
            .keys()
            .last()
            .copied()
            .unwrap_or_else(BranchId::root)
            .next();
        let kept: Vec<TimestampedMessage> = parent
            .branch
            .messages
            .iter()
            .filter(|message| message.timestamp < cutoff)
            .cloned()
            .collect();
        let child = Branch {
            branch_id: child_id,
            messages: kept,
            parent_cutoff: Some(ParentCutoff {
                branch_id: parent_id,
                timestamp: cutoff,
            }),
            score: None,
            frozen: false,
        };
        inner.branches.insert(
            child_id,
            BranchSlot {
                branch: child,
                next_timestamp: cutoff + 1,
            },
        );
        if let Some(parent) = inner.branches.get_mut(&parent_id) {
            parent.branch.frozen = true;
        }
        inner.current = child_id;
        info!(parent = %parent_id, child = %child_id, "branch forked");
        Ok(child_id)
    }

    /// Visibility chain for a branch: the branch itself (no limit), then each
    /// ancestor with the highest timestamp still visible through the fork
    /// cutoffs taken along the way.
    pub fn lineage(&self, branch_id: BranchId) -> Vec<(BranchId, Option<u64>)> {
        let inner = self.inner.lock();
        let mut chain = Vec::new();
        let mut cursor = Some(branch_id);
        let mut limit: Option<u64> = None;
        while let Some(id) = cursor {
            let Some(slot) = inner.branches.get(&id) else {
                break;
            };
            chain.push((id, limit));
            match slot.branch.parent_cutoff {
                Some(cutoff) => {
                    limit = Some(match limit {
                        Some(current) => current.min(cutoff.timestamp),
                        None => cutoff.timestamp,
                    });
                    cursor = Some(cutoff.branch_id);
                }
                None => cursor = None,
            }
        }
        chain
    }

    pub fn set_score(&self, branch_id: BranchId, score: f64) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        let slot = inner.branches.get_mut(&branch_id).ok_or_else(|| {
            EngineError::InvalidState(format!("branch {branch_id} does not exist"))
        })?;
        slot.branch.score = Some(score);
        Ok(())
    }

    pub fn snapshot(&self) -> HistoryBundle {
        let inner = self.inner.lock();
        HistoryBundle {
            format_version: BUNDLE_FORMAT_VERSION.to_string(),
            current_branch: inner.current,
            branches: inner
                .branches
                .iter()
                .map(|(id, slot)| (*id, slot.branch.clone()))
                .collect(),
        }
    }

    /// Replace all in-memory state with a loaded bundle.
    pub fn restore_bundle(&self, bundle: HistoryBundle) -> EngineResult<()> {
        let rebuilt = Self::from_bundle(bundle)?;
        let mut inner = self.inner.lock();
        *inner = rebuilt.inner.into_inner();
        Ok(())
    }

    /// Write the bundle as pretty JSON, creating parent directories.
    pub async fn save_to_file(&self, path: &Path) -> EngineResult<()> {
        let bundle = self.snapshot();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|err| {
                EngineError::Io(format!("failed to create bundle dir {parent:?}: {err}"))
            })?;
        }
        let text = serde_json::to_string_pretty(&bundle)?;
        fs::write(path, text)
            .await
            .map_err(|err| EngineError::Io(format!("failed writing bundle {path:?}: {err}")))?;
        info!(?path, branches = bundle.branches.len(), "history bundle saved");
        Ok(())
    }

    pub async fn read_bundle(path: &Path) -> EngineResult<HistoryBundle> {
        let text = fs::read_to_string(path)
            .await
            .map_err(|err| EngineError::Io(format!("failed reading bundle {path:?}: {err}")))?;
        let bundle: HistoryBundle = serde_json::from_str(&text)?;
        Ok(bundle)
    }
}
