//! State extraction: live objects down to serializable checkpoint state.
//!
//! Credentials never cross this boundary. The live credential lives outside
//! the model config entirely, and any credential-shaped key that found its
//! way into the config's `extra` map is scrubbed here along with non-scalar
//! values.

use indexmap::IndexMap;
use parley_protocol::{
    CoordinatorState, MessagePayload, ModelConfig, ParticipantState, TerminationPattern,
};
use tracing::warn;

use crate::participant::{
    Coordinator, Participant, SOLUTION_FLAG, TERMINATE_FLAG, TerminationProbe,
};

/// Keys that must never appear in a persisted model config.
const CREDENTIAL_FIELDS: &[&str] = &[
    "api_key",
    "token_provider",
    "auth_provider",
    "azure_ad_token_provider",
];

/// Classify a live termination rule by probing it with the two canonical
/// payloads. Rules that match neither cannot be restored and degrade to the
/// default rule later.
pub fn classify_termination(owner: &str, probe: Option<&TerminationProbe>) -> TerminationPattern {
    let Some(probe) = probe else {
        return TerminationPattern::None;
    };
    let matches_solution = probe(&MessagePayload::text(SOLUTION_FLAG));
    let matches_terminate = probe(&MessagePayload::text(TERMINATE_FLAG));
    if matches_solution {
        TerminationPattern::NamedFlag
    } else if matches_terminate {
        TerminationPattern::None
    } else {
        warn!(
            owner,
            "termination rule matches neither canonical probe; it will not survive restoration"
        );
        TerminationPattern::CustomUnrestorable
    }
}

fn sanitize_model_config(config: &ModelConfig) -> ModelConfig {
    let mut sanitized = config.clone();
    sanitized.extra.retain(|key, value| {
        if CREDENTIAL_FIELDS.contains(&key.as_str()) {
            warn!(key, "credential-shaped field stripped from model config");
            return false;
        }
        !value.is_object() && !value.is_array()
    });
    sanitized
}

pub fn extract_participant(participant: &Participant) -> ParticipantState {
    ParticipantState {
        name: participant.name.clone(),
        system_prompt: participant.system_prompt.clone(),
        input_mode: participant.input_mode,
        max_auto_replies: participant.max_auto_replies,
        model_config: sanitize_model_config(&participant.model.config),
        code_execution: participant.code_execution.clone(),
        termination_pattern: classify_termination(
            &participant.name,
            participant.termination_probe(),
        ),
        pairwise_history: participant.pairwise_histories().clone(),
    }
}

pub fn extract_coordinator(coordinator: &Coordinator) -> CoordinatorState {
    let profile = &coordinator.profile;
    CoordinatorState {
        name: profile.name.clone(),
        system_prompt: profile.system_prompt.clone(),
        input_mode: profile.input_mode,
        max_auto_replies: profile.max_auto_replies,
        model_config: sanitize_model_config(&profile.model.config),
        termination_pattern: classify_termination(&profile.name, profile.termination_probe()),
        last_speaker: coordinator.last_speaker.clone(),
        max_rounds: coordinator.max_rounds,
        current_round: coordinator.current_round,
        pairwise_history: profile.pairwise_histories().clone(),
    }
}

/// Extract coordinator and participant state in one pass, participants keyed
/// by name in roster order.
pub fn extract_all(
    coordinator: &Coordinator,
    participants: &[Participant],
) -> (CoordinatorState, IndexMap<String, ParticipantState>) {
    let states = participants
        .iter()
        .map(|participant| (participant.name.clone(), extract_participant(participant)))
        .collect();
    (extract_coordinator(coordinator), states)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parley_protocol::{ModelConfig, TerminationPattern};

    use super::*;
    use crate::participant::{ModelProfile, named_flag_termination};

    #[test]
    fn no_probe_classifies_as_none() {
        assert_eq!(
            classify_termination("solver", None),
            TerminationPattern::None
        );
    }

    #[test]
    fn named_flag_probe_classifies_as_named_flag() {
        let probe = named_flag_termination();
        assert_eq!(
            classify_termination("solver", Some(&probe)),
            TerminationPattern::NamedFlag
        );
    }

    #[test]
    fn terminate_only_probe_classifies_as_default() {
        let probe: TerminationProbe =
            Arc::new(|payload| payload.content.contains(TERMINATE_FLAG));
        assert_eq!(
            classify_termination("solver", Some(&probe)),
            TerminationPattern::None
        );
    }

    #[test]
    fn opaque_probe_classifies_as_custom() {
        let probe: TerminationProbe = Arc::new(|payload| payload.content.len() > 4096);
        assert_eq!(
            classify_termination("solver", Some(&probe)),
            TerminationPattern::CustomUnrestorable
        );
    }

    #[test]
    fn extraction_strips_credentials_and_nested_values() {
        let mut config = ModelConfig::new("gpt-4");
        config
            .extra
            .insert("api_key".into(), serde_json::json!("sk-secret"));
        config
            .extra
            .insert("azure_ad_token_provider".into(), serde_json::json!("cb"));
        config
            .extra
            .insert("response_format".into(), serde_json::json!({"type": "json"}));
        config.extra.insert("cache_seed".into(), serde_json::json!(41));

        let participant =
            Participant::new("solver", "solve", ModelProfile::new(config).with_api_key("sk-live"));
        let state = extract_participant(&participant);

        assert_eq!(state.model_config.extra.len(), 1);
        assert_eq!(
            state.model_config.extra.get("cache_seed"),
            Some(&serde_json::json!(41))
        );
        let json = serde_json::to_string(&state).unwrap();
        assert!(!json.contains("sk-secret"));
        assert!(!json.contains("sk-live"));
    }
}
