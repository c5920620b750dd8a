//! Checkpoint validation.
//!
//! Pure checks over a loaded record. Hard failures mean the record cannot be
//! restored; version drift and roster oddities come back as warnings so the
//! caller can still attempt restoration.

use parley_protocol::{
    ActionKind, CHECKPOINT_FORMAT_VERSION, CheckpointRecord, CodeExecutionPolicy, EngineError,
    EngineResult, ModelConfig,
};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct CheckpointValidator {
    expected_version: String,
}

impl Default for CheckpointValidator {
    fn default() -> Self {
        Self {
            expected_version: CHECKPOINT_FORMAT_VERSION.to_string(),
        }
    }
}

impl CheckpointValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_expected_version(expected_version: impl Into<String>) -> Self {
        Self {
            expected_version: expected_version.into(),
        }
    }

    /// Check a record for restorability. Returns the warnings gathered along
    /// the way, or the first hard error.
    pub fn validate(&self, record: &CheckpointRecord) -> EngineResult<Vec<String>> {
        let mut warnings = Vec::new();

        if !record.action.is_restorable() {
            return Err(EngineError::InvalidCheckpoint(format!(
                "`{}` has action kind `{}`; only `{}` checkpoints are restorable",
                record.id,
                record.action,
                ActionKind::MessageAppended
            )));
        }

        if record.format_version != self.expected_version {
            let drift = EngineError::VersionCompatibility {
                expected: self.expected_version.clone(),
                found: record.format_version.clone(),
            };
            let note = format!("{drift}; attempting restore anyway");
            warn!(id = %record.id, "{note}");
            warnings.push(note);
        }

        if record.participants.is_empty() {
            return Err(EngineError::InvalidCheckpoint(format!(
                "`{}` contains no participants",
                record.id
            )));
        }
        if record.message_log.is_empty() {
            return Err(EngineError::InvalidCheckpoint(format!(
                "`{}` has an empty message log; nothing to resume from",
                record.id
            )));
        }
        let mut last_timestamp: Option<u64> = None;
        for message in &record.message_log {
            if let Some(last) = last_timestamp
                && message.timestamp <= last
            {
                return Err(EngineError::InvalidCheckpoint(format!(
                    "`{}` message log timestamps are not strictly increasing ({} after {})",
                    record.id, message.timestamp, last
                )));
            }
            last_timestamp = Some(message.timestamp);
        }

        for (key, participant) in &record.participants {
            if participant.name.is_empty() || participant.name != *key {
                return Err(EngineError::InvalidCheckpoint(format!(
                    "`{}` participant keyed `{key}` carries name `{}`",
                    record.id, participant.name
                )));
            }
            Self::check_model_config(&record.id.to_string(), key, &participant.model_config)?;
            Self::check_code_execution(&record.id.to_string(), key, participant.code_execution.as_ref())?;
        }

        let coordinator = &record.coordinator;
        if coordinator.name.is_empty() {
            return Err(EngineError::InvalidCheckpoint(format!(
                "`{}` coordinator has no name",
                record.id
            )));
        }
        Self::check_model_config(&record.id.to_string(), &coordinator.name, &coordinator.model_config)?;
        if coordinator.max_rounds == 0 {
            return Err(EngineError::InvalidCheckpoint(format!(
                "`{}` coordinator max_rounds is zero",
                record.id
            )));
        }
        if let Some(last_speaker) = &coordinator.last_speaker
            && !record.participants.contains_key(last_speaker)
            && *last_speaker != coordinator.name
        {
            let note = format!(
                "last speaker `{last_speaker}` is not in the participant roster"
            );
            warn!(id = %record.id, "{note}");
            warnings.push(note);
        }

        Ok(warnings)
    }

    fn check_model_config(id: &str, owner: &str, config: &ModelConfig) -> EngineResult<()> {
        if config.model.is_empty() {
            return Err(EngineError::InvalidCheckpoint(format!(
                "`{id}` model config for `{owner}` is missing a model identifier"
            )));
        }
        Ok(())
    }

    fn check_code_execution(
        id: &str,
        owner: &str,
        policy: Option<&CodeExecutionPolicy>,
    ) -> EngineResult<()> {
        match policy {
            None => Ok(()),
            Some(CodeExecutionPolicy::Disabled { enabled: false }) => Ok(()),
            Some(CodeExecutionPolicy::Disabled { enabled: true }) => {
                Err(EngineError::InvalidCheckpoint(format!(
                    "`{id}` code execution for `{owner}` must be either a disabled flag or a full policy"
                )))
            }
            Some(CodeExecutionPolicy::Full(config)) => {
                if config.work_dir.is_empty() {
                    return Err(EngineError::InvalidCheckpoint(format!(
                        "`{id}` code execution for `{owner}` has an empty work_dir"
                    )));
                }
                Ok(())
            }
        }
    }
}
