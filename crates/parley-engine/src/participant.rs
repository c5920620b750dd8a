//! Live participant and coordinator objects.
//!
//! These carry the parts a checkpoint cannot: termination closures and the
//! model credential. Extraction reduces them to their serializable state;
//! restoration rebuilds them with credentials injected from the environment.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parley_protocol::{
    CodeExecutionPolicy, InputMode, MessagePayload, ModelConfig, TimestampedMessage,
};

/// Content flag the default termination rule looks for.
pub const TERMINATE_FLAG: &str = "TERMINATE";
/// Content flag the named-flag termination rule looks for.
pub const SOLUTION_FLAG: &str = "SOLUTION_FOUND";

/// A live termination rule. Classified by probing at extraction time.
pub type TerminationProbe = Arc<dyn Fn(&MessagePayload) -> bool + Send + Sync>;

pub fn default_termination() -> TerminationProbe {
    Arc::new(|payload| payload.content.contains(TERMINATE_FLAG))
}

pub fn named_flag_termination() -> TerminationProbe {
    Arc::new(|payload| payload.content.contains(SOLUTION_FLAG))
}

/// Operator-supplied credentials. Injected into restored participants,
/// never read from or written to a checkpoint.
#[derive(Debug, Clone, Default)]
pub struct CredentialSource {
    pub api_key: Option<String>,
}

impl CredentialSource {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("PARLEY_API_KEY").ok(),
        }
    }
}

/// Model configuration plus the live credential.
#[derive(Clone)]
pub struct ModelProfile {
    pub config: ModelConfig,
    pub api_key: Option<String>,
}

impl ModelProfile {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Rebuild a profile from persisted config, injecting the credential.
    pub fn from_config(config: ModelConfig, credentials: &CredentialSource) -> Self {
        Self {
            config,
            api_key: credentials.api_key.clone(),
        }
    }
}

impl fmt::Debug for ModelProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelProfile")
            .field("config", &self.config)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// One conversation participant with its runtime-only parts attached.
#[derive(Clone)]
pub struct Participant {
    pub name: String,
    pub system_prompt: String,
    pub input_mode: InputMode,
    pub max_auto_replies: u32,
    pub model: ModelProfile,
    pub code_execution: Option<CodeExecutionPolicy>,
    termination: Option<TerminationProbe>,
    pairwise: IndexMap<String, Vec<TimestampedMessage>>,
}

impl fmt::Debug for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Participant")
            .field("name", &self.name)
            .field("system_prompt", &self.system_prompt)
            .field("input_mode", &self.input_mode)
            .field("max_auto_replies", &self.max_auto_replies)
            .field("model", &self.model)
            .field("code_execution", &self.code_execution)
            .field("termination", &self.termination.as_ref().map(|_| "<probe>"))
            .field("pairwise", &self.pairwise)
            .finish()
    }
}

impl Participant {
    pub fn new(
        name: impl Into<String>,
        system_prompt: impl Into<String>,
        model: ModelProfile,
    ) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            input_mode: InputMode::Never,
            max_auto_replies: 10,
            model,
            code_execution: None,
            termination: None,
            pairwise: IndexMap::new(),
        }
    }

    pub fn with_input_mode(mut self, input_mode: InputMode) -> Self {
        self.input_mode = input_mode;
        self
    }

    pub fn with_max_auto_replies(mut self, max_auto_replies: u32) -> Self {
        self.max_auto_replies = max_auto_replies;
        self
    }

    pub fn with_code_execution(mut self, policy: CodeExecutionPolicy) -> Self {
        self.code_execution = Some(policy);
        self
    }

    pub fn with_termination(mut self, probe: TerminationProbe) -> Self {
        self.termination = Some(probe);
        self
    }

    pub fn termination_probe(&self) -> Option<&TerminationProbe> {
        self.termination.as_ref()
    }

    /// Apply this participant's termination rule, falling back to the
    /// default terminate-flag rule when none is installed.
    pub fn is_termination(&self, payload: &MessagePayload) -> bool {
        match &self.termination {
            Some(probe) => probe(payload),
            None => payload.content.contains(TERMINATE_FLAG),
        }
    }

    /// Record a message in the history shared with `partner`.
    pub fn record_inbound(&mut self, partner: &str, message: TimestampedMessage) {
        self.pairwise
            .entry(partner.to_string())
            .or_default()
            .push(message);
    }

    pub fn history_with(&self, partner: &str) -> &[TimestampedMessage] {
        self.pairwise
            .get(partner)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn pairwise_histories(&self) -> &IndexMap<String, Vec<TimestampedMessage>> {
        &self.pairwise
    }

    pub fn set_history(&mut self, partner: &str, messages: Vec<TimestampedMessage>) {
        self.pairwise.insert(partner.to_string(), messages);
    }
}

/// The coordinator: a participant profile plus loop bookkeeping.
#[derive(Clone, Debug)]
pub struct Coordinator {
    pub profile: Participant,
    pub last_speaker: Option<String>,
    pub max_rounds: u64,
    pub current_round: u64,
}

impl Coordinator {
    pub fn new(profile: Participant, max_rounds: u64) -> Self {
        Self {
            profile,
            last_speaker: None,
            max_rounds,
            current_round: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_protocol::MessagePayload;

    fn profile() -> ModelProfile {
        ModelProfile::new(ModelConfig::new("gpt-4"))
    }

    #[test]
    fn default_rule_matches_terminate_flag_only() {
        let participant = Participant::new("solver", "", profile());
        assert!(participant.is_termination(&MessagePayload::text("ok TERMINATE")));
        assert!(!participant.is_termination(&MessagePayload::text("keep going")));
    }

    #[test]
    fn installed_rule_takes_precedence() {
        let participant = Participant::new("solver", "", profile())
            .with_termination(named_flag_termination());
        assert!(participant.is_termination(&MessagePayload::text("SOLUTION_FOUND: 42")));
        assert!(!participant.is_termination(&MessagePayload::text("TERMINATE")));
    }

    #[test]
    fn pairwise_history_accumulates_per_partner() {
        let mut participant = Participant::new("solver", "", profile());
        participant.record_inbound(
            "coordinator",
            parley_protocol::TimestampedMessage::new(
                0,
                "critic",
                parley_protocol::Address::topic("group"),
                MessagePayload::text("hello"),
            ),
        );
        assert_eq!(participant.history_with("coordinator").len(), 1);
        assert!(participant.history_with("stranger").is_empty());
    }

    #[test]
    fn model_profile_debug_redacts_the_key() {
        let profile = profile().with_api_key("sk-secret");
        let rendered = format!("{profile:?}");
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
