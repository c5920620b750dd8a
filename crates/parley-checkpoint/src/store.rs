//! File-backed checkpoint store.
//!
//! One pretty-JSON file per record under `<run_root>/checkpoints/`. The
//! content hash is computed over canonical (sorted-key) JSON with the hash
//! field removed, so a record hashes the same no matter which serializer
//! ordering produced the file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parley_protocol::{CheckpointId, CheckpointRecord, EngineError, EngineResult};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, instrument, warn};

/// SHA-256 hex of a record's canonical JSON, ignoring any embedded hash.
pub fn content_hash_of(value: &serde_json::Value) -> EngineResult<String> {
    let mut canonical = value.clone();
    if let Some(map) = canonical.as_object_mut() {
        map.remove("content_hash");
    }
    let bytes = serde_json::to_vec(&canonical)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// A record read back from the store. `hash_verified` is false when the
/// stored hash no longer matches the content; loading still succeeds.
#[derive(Debug, Clone)]
pub struct LoadedCheckpoint {
    pub record: CheckpointRecord,
    pub hash_verified: bool,
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a record, embedding its content hash. Never overwrites an
    /// existing id.
    async fn save(&self, record: &CheckpointRecord) -> EngineResult<CheckpointId>;
    async fn load(&self, id: &CheckpointId) -> EngineResult<LoadedCheckpoint>;
    /// All record ids in this run, lexically sorted. Empty for a fresh run.
    async fn list(&self) -> EngineResult<Vec<CheckpointId>>;
}

#[derive(Debug)]
pub struct FileCheckpointStore {
    run_root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(run_root: impl Into<PathBuf>) -> Self {
        Self {
            run_root: run_root.into(),
        }
    }

    pub fn run_root(&self) -> &Path {
        &self.run_root
    }

    fn checkpoints_dir(&self) -> PathBuf {
        self.run_root.join("checkpoints")
    }

    fn path_for(&self, id: &CheckpointId) -> PathBuf {
        self.checkpoints_dir().join(format!("{}.json", id.as_str()))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    #[instrument(skip(self, record), fields(id = %record.id, action = %record.action))]
    async fn save(&self, record: &CheckpointRecord) -> EngineResult<CheckpointId> {
        let path = self.path_for(&record.id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|err| {
                EngineError::Io(format!("failed to create checkpoint dir {parent:?}: {err}"))
            })?;
        }
        if fs::try_exists(&path).await.unwrap_or(false) {
            return Err(EngineError::InvalidState(format!(
                "checkpoint `{}` already exists and will not be overwritten",
                record.id
            )));
        }

        let mut value = serde_json::to_value(record)?;
        let hash = content_hash_of(&value)?;
        if let Some(map) = value.as_object_mut() {
            map.insert("content_hash".to_string(), serde_json::Value::String(hash));
        }
        let text = serde_json::to_string_pretty(&value)?;
        fs::write(&path, text)
            .await
            .map_err(|err| EngineError::Io(format!("failed writing checkpoint {path:?}: {err}")))?;
        debug!("checkpoint written");
        Ok(record.id.clone())
    }

    #[instrument(skip(self), fields(id = %id))]
    async fn load(&self, id: &CheckpointId) -> EngineResult<LoadedCheckpoint> {
        let path = self.path_for(id);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::CheckpointNotFound(id.to_string()));
            }
            Err(err) => {
                return Err(EngineError::Io(format!(
                    "failed reading checkpoint {path:?}: {err}"
                )));
            }
        };

        let value: serde_json::Value = serde_json::from_str(&text)
            .map_err(|err| EngineError::InvalidCheckpoint(format!("`{id}`: corrupt JSON: {err}")))?;
        let stored_hash = value
            .get("content_hash")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        let computed = content_hash_of(&value)?;
        let hash_verified = !stored_hash.is_empty() && stored_hash == computed;
        if !hash_verified {
            warn!(
                stored = %stored_hash,
                computed = %computed,
                "checkpoint content hash mismatch; loading anyway"
            );
        }

        let record: CheckpointRecord = serde_json::from_value(value)
            .map_err(|err| EngineError::InvalidCheckpoint(format!("`{id}`: {err}")))?;
        debug!(hash_verified, "checkpoint loaded");
        Ok(LoadedCheckpoint {
            record,
            hash_verified,
        })
    }

    async fn list(&self) -> EngineResult<Vec<CheckpointId>> {
        let dir = self.checkpoints_dir();
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|err| EngineError::Io(format!("failed listing {dir:?}: {err}")))?;
        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| EngineError::Io(err.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("json")
                && let Some(stem) = path.file_stem().and_then(|stem| stem.to_str())
            {
                ids.push(CheckpointId::from_string(stem));
            }
        }
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use chrono::Utc;
    use indexmap::IndexMap;
    use parley_protocol::{
        ActionKind, Address, BranchId, CHECKPOINT_FORMAT_VERSION, CheckpointRecord,
        CoordinatorState, EngineError, InputMode, MessagePayload, ModelConfig, ParticipantState,
        TerminationPattern, TimestampedMessage,
    };
    use tokio::fs;

    use super::{CheckpointStore, FileCheckpointStore};

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    fn sample_record(step_index: u64, action: ActionKind) -> CheckpointRecord {
        let created_at = Utc::now();
        let mut participants = IndexMap::new();
        participants.insert(
            "solver".to_string(),
            ParticipantState {
                name: "solver".to_string(),
                system_prompt: "solve the task".to_string(),
                input_mode: InputMode::Never,
                max_auto_replies: 10,
                model_config: ModelConfig::new("gpt-4"),
                code_execution: None,
                termination_pattern: TerminationPattern::None,
                pairwise_history: IndexMap::new(),
            },
        );
        CheckpointRecord {
            id: CheckpointRecord::compose_id(step_index, action, created_at),
            step_index,
            action,
            created_at,
            format_version: CHECKPOINT_FORMAT_VERSION.to_string(),
            content_hash: String::new(),
            coordinator: CoordinatorState {
                name: "coordinator".to_string(),
                system_prompt: "run the group".to_string(),
                input_mode: InputMode::Never,
                max_auto_replies: 0,
                model_config: ModelConfig::new("gpt-4"),
                termination_pattern: TerminationPattern::NamedFlag,
                last_speaker: Some("solver".to_string()),
                max_rounds: 12,
                current_round: step_index,
                pairwise_history: IndexMap::new(),
            },
            participants,
            message_log: vec![TimestampedMessage::new(
                0,
                "user",
                Address::topic("group"),
                MessagePayload::text("plan the trip"),
            )],
            session_meta: serde_json::json!({ "branch_id": BranchId::root().as_u64() }),
        }
    }

    #[tokio::test]
    async fn save_then_load_roundtrips() {
        let root = unique_test_root("parley-checkpoint-roundtrip");
        let store = FileCheckpointStore::new(&root);
        let record = sample_record(1, ActionKind::MessageAppended);

        store.save(&record).await.unwrap();
        let loaded = store.load(&record.id).await.unwrap();
        assert!(loaded.hash_verified);
        assert_eq!(loaded.record.step_index, record.step_index);
        assert_eq!(loaded.record.message_log, record.message_log);
        assert_eq!(loaded.record.participants, record.participants);
        assert_eq!(loaded.record.coordinator, record.coordinator);
        assert!(!loaded.record.content_hash.is_empty());

        let _ = fs::remove_dir_all(root).await;
    }

    #[tokio::test]
    async fn load_missing_id_is_not_found() {
        let root = unique_test_root("parley-checkpoint-missing");
        let store = FileCheckpointStore::new(&root);
        let err = store
            .load(&parley_protocol::CheckpointId::from_string("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CheckpointNotFound(_)));
        let _ = fs::remove_dir_all(root).await;
    }

    #[tokio::test]
    async fn save_never_overwrites() {
        let root = unique_test_root("parley-checkpoint-overwrite");
        let store = FileCheckpointStore::new(&root);
        let record = sample_record(2, ActionKind::MessageAppended);
        store.save(&record).await.unwrap();
        let err = store.save(&record).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
        let _ = fs::remove_dir_all(root).await;
    }

    #[tokio::test]
    async fn tampered_record_loads_with_unverified_hash() {
        let root = unique_test_root("parley-checkpoint-tamper");
        let store = FileCheckpointStore::new(&root);
        let record = sample_record(3, ActionKind::MessageAppended);
        store.save(&record).await.unwrap();

        let path = root
            .join("checkpoints")
            .join(format!("{}.json", record.id.as_str()));
        let text = fs::read_to_string(&path).await.unwrap();
        let edited = text.replace("plan the trip", "plan the heist");
        fs::write(&path, edited).await.unwrap();

        let loaded = store.load(&record.id).await.unwrap();
        assert!(!loaded.hash_verified);
        assert_eq!(loaded.record.message_log[0].payload.content, "plan the heist");
        let _ = fs::remove_dir_all(root).await;
    }

    #[tokio::test]
    async fn list_is_sorted_and_empty_for_fresh_run() {
        let root = unique_test_root("parley-checkpoint-list");
        let store = FileCheckpointStore::new(&root);
        assert!(store.list().await.unwrap().is_empty());

        let first = sample_record(1, ActionKind::MessageAppended);
        let second = sample_record(2, ActionKind::ReplyGenerated);
        store.save(&second).await.unwrap();
        store.save(&first).await.unwrap();

        let ids = store.list().await.unwrap();
        assert_eq!(ids.len(), 2);
        let mut sorted = ids.clone();
        sorted.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        assert_eq!(ids, sorted);
        let _ = fs::remove_dir_all(root).await;
    }
}
