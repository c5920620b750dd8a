//! Session recreation from a checkpoint record.
//!
//! Two passes: first every participant and the coordinator are rebuilt from
//! their serialized state with credentials injected, then pairwise histories
//! are linked by partner name against the recreated roster. An unknown
//! partner loses its history with a warning; nothing else fails for it.

use std::collections::HashSet;

use parley_checkpoint::CheckpointValidator;
use parley_protocol::{
    CheckpointRecord, CoordinatorState, EngineResult, ParticipantState, TerminationPattern,
};
use tracing::{info, instrument, warn};

use crate::participant::{
    Coordinator, CredentialSource, ModelProfile, Participant, TerminationProbe,
    named_flag_termination,
};

#[derive(Debug, Clone, Default)]
pub struct SessionRecreator {
    validator: CheckpointValidator,
}

impl SessionRecreator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_validator(validator: CheckpointValidator) -> Self {
        Self { validator }
    }

    /// Rebuild live participants and the coordinator from a record.
    ///
    /// Deterministic: the same record and credentials always produce the
    /// same roster in the same order with the same histories.
    #[instrument(skip_all, fields(id = %record.id))]
    pub fn recreate(
        &self,
        record: &CheckpointRecord,
        credentials: &CredentialSource,
    ) -> EngineResult<(Vec<Participant>, Coordinator)> {
        for warning in self.validator.validate(record)? {
            warn!("{warning}");
        }

        let mut participants: Vec<Participant> = record
            .participants
            .values()
            .map(|state| Self::revive_participant(state, credentials))
            .collect();
        let mut coordinator = Self::revive_coordinator(&record.coordinator, credentials);
        Self::link_histories(&mut participants, &mut coordinator, record);
        info!(
            participants = participants.len(),
            step_index = record.step_index,
            "session recreated from checkpoint"
        );
        Ok((participants, coordinator))
    }

    fn revive_termination(owner: &str, pattern: TerminationPattern) -> Option<TerminationProbe> {
        match pattern {
            TerminationPattern::None => None,
            TerminationPattern::NamedFlag => Some(named_flag_termination()),
            TerminationPattern::CustomUnrestorable => {
                warn!(
                    owner,
                    "custom termination rule cannot be restored; using the default rule"
                );
                None
            }
        }
    }

    fn revive_participant(state: &ParticipantState, credentials: &CredentialSource) -> Participant {
        let mut participant = Participant::new(
            state.name.clone(),
            state.system_prompt.clone(),
            ModelProfile::from_config(state.model_config.clone(), credentials),
        )
        .with_input_mode(state.input_mode)
        .with_max_auto_replies(state.max_auto_replies);
        if let Some(policy) = &state.code_execution {
            participant = participant.with_code_execution(policy.clone());
        }
        if let Some(probe) = Self::revive_termination(&state.name, state.termination_pattern) {
            participant = participant.with_termination(probe);
        }
        participant
    }

    fn revive_coordinator(state: &CoordinatorState, credentials: &CredentialSource) -> Coordinator {
        let mut profile = Participant::new(
            state.name.clone(),
            state.system_prompt.clone(),
            ModelProfile::from_config(state.model_config.clone(), credentials),
        )
        .with_input_mode(state.input_mode)
        .with_max_auto_replies(state.max_auto_replies);
        if let Some(probe) = Self::revive_termination(&state.name, state.termination_pattern) {
            profile = profile.with_termination(probe);
        }
        Coordinator {
            profile,
            last_speaker: state.last_speaker.clone(),
            max_rounds: state.max_rounds,
            current_round: state.current_round,
        }
    }

    /// Second pass: attach pairwise histories by partner name. Partners
    /// missing from the recreated roster are dropped with a warning.
    pub fn link_histories(
        participants: &mut [Participant],
        coordinator: &mut Coordinator,
        record: &CheckpointRecord,
    ) {
        let mut roster: HashSet<String> =
            participants.iter().map(|p| p.name.clone()).collect();
        roster.insert(coordinator.profile.name.clone());

        for participant in participants.iter_mut() {
            let Some(state) = record.participants.get(&participant.name) else {
                continue;
            };
            for (partner, messages) in &state.pairwise_history {
                if roster.contains(partner) {
                    participant.set_history(partner, messages.clone());
                } else {
                    warn!(
                        owner = %participant.name,
                        partner = %partner,
                        "pairwise history partner not in roster; history dropped"
                    );
                }
            }
        }
        for (partner, messages) in &record.coordinator.pairwise_history {
            if roster.contains(partner) {
                coordinator.profile.set_history(partner, messages.clone());
            } else {
                warn!(
                    owner = %coordinator.profile.name,
                    partner = %partner,
                    "pairwise history partner not in roster; history dropped"
                );
            }
        }
    }
}
