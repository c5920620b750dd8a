//! Serializable participant and coordinator state.
//!
//! These are the shapes that land inside checkpoint records. They carry no
//! secrets and no callables: model credentials are stripped at extraction
//! and re-injected at restore, and live termination closures are reduced to
//! a [`TerminationPattern`] tag that a fixed interpreter maps back to a rule.

use crate::message::TimestampedMessage;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// How a participant sources human input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    #[default]
    Never,
    Always,
    Terminate,
}

/// Restorable classification of a participant's termination rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationPattern {
    /// The default rule (terminate-flag match).
    #[default]
    None,
    /// Matches the named solution flag.
    NamedFlag,
    /// A custom closure that cannot be persisted; degrades to the default
    /// rule on restore.
    CustomUnrestorable,
}

/// Non-secret, serializable model configuration.
///
/// `model` is the required identifying field; `extra` holds additional
/// scalar settings that survived credential stripping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ModelConfig {
    pub model: String,
    pub base_url: Option<String>,
    pub api_type: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub seed: Option<i64>,
    pub max_tokens: Option<u32>,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub extra: IndexMap<String, serde_json::Value>,
}

impl ModelConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }
}

/// Full code-execution policy: working directory plus sandbox choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeExecutionConfig {
    pub work_dir: String,
    pub use_docker: bool,
    pub timeout_secs: Option<u64>,
}

/// Code execution is either explicitly disabled or a full policy object.
/// Any other shape fails to parse, and the validator re-checks the two legal
/// forms on loaded records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CodeExecutionPolicy {
    Disabled { enabled: bool },
    Full(CodeExecutionConfig),
}

impl CodeExecutionPolicy {
    pub fn disabled() -> Self {
        Self::Disabled { enabled: false }
    }
}

/// Serializable snapshot of one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantState {
    pub name: String,
    pub system_prompt: String,
    pub input_mode: InputMode,
    pub max_auto_replies: u32,
    pub model_config: ModelConfig,
    pub code_execution: Option<CodeExecutionPolicy>,
    pub termination_pattern: TerminationPattern,
    /// Per-partner message history, keyed by partner name. Linking back to
    /// live partners happens in a second pass at restore.
    #[serde(default)]
    pub pairwise_history: IndexMap<String, Vec<TimestampedMessage>>,
}

/// Serializable snapshot of the coordinator, including loop bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorState {
    pub name: String,
    pub system_prompt: String,
    pub input_mode: InputMode,
    pub max_auto_replies: u32,
    pub model_config: ModelConfig,
    pub termination_pattern: TerminationPattern,
    pub last_speaker: Option<String>,
    pub max_rounds: u64,
    pub current_round: u64,
    #[serde(default)]
    pub pairwise_history: IndexMap<String, Vec<TimestampedMessage>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_mode_wire_names() {
        assert_eq!(serde_json::to_string(&InputMode::Never).unwrap(), "\"never\"");
        assert_eq!(
            serde_json::to_string(&InputMode::Terminate).unwrap(),
            "\"terminate\""
        );
    }

    #[test]
    fn termination_pattern_wire_names() {
        assert_eq!(
            serde_json::to_string(&TerminationPattern::NamedFlag).unwrap(),
            "\"named-flag\""
        );
        assert_eq!(
            serde_json::to_string(&TerminationPattern::CustomUnrestorable).unwrap(),
            "\"custom-unrestorable\""
        );
    }

    #[test]
    fn code_execution_disabled_shape() {
        let policy: CodeExecutionPolicy = serde_json::from_str(r#"{"enabled":false}"#).unwrap();
        assert_eq!(policy, CodeExecutionPolicy::disabled());
        assert_eq!(
            serde_json::to_string(&policy).unwrap(),
            r#"{"enabled":false}"#
        );
    }

    #[test]
    fn code_execution_full_shape() {
        let policy: CodeExecutionPolicy =
            serde_json::from_str(r#"{"work_dir":"scratch","use_docker":true,"timeout_secs":30}"#)
                .unwrap();
        match policy {
            CodeExecutionPolicy::Full(config) => {
                assert_eq!(config.work_dir, "scratch");
                assert!(config.use_docker);
            }
            other => panic!("unexpected policy: {other:?}"),
        }
    }

    #[test]
    fn code_execution_third_shape_rejected() {
        let bad: Result<CodeExecutionPolicy, _> =
            serde_json::from_str(r#"{"commands":["rm"]}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn model_config_roundtrip_keeps_extra() {
        let mut config = ModelConfig::new("gpt-4");
        config.temperature = Some(0.2);
        config
            .extra
            .insert("cache_seed".into(), serde_json::json!(41));
        let json = serde_json::to_string(&config).unwrap();
        let back: ModelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
