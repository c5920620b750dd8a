//! # parley-engine — the continuation engine and its surroundings
//!
//! ## Module Overview
//!
//! - [`participant`] — live Participant/Coordinator, termination probes,
//!   credentials
//! - [`extract`] — live state down to serializable checkpoint state
//! - [`restore`] — SessionRecreator: records back to live state
//! - [`engine`] — ContinuationEngine turn loop and state machine
//! - [`intervene`] — InterventionHub: drop and override gates
//! - [`provider`] — ReplyProvider / SpeakerSelector ports
//! - [`transport`] — broadcast hub for observers

pub mod engine;
pub mod extract;
pub mod intervene;
pub mod participant;
pub mod provider;
pub mod restore;
pub mod transport;

pub use engine::{ContinuationEngine, EngineState, GROUP_TOPIC, PendingMessage};
pub use extract::{extract_all, extract_coordinator, extract_participant};
pub use intervene::{InterventionHub, OverrideRule};
pub use participant::{
    Coordinator, CredentialSource, ModelProfile, Participant, SOLUTION_FLAG, TERMINATE_FLAG,
    TerminationProbe, default_termination, named_flag_termination,
};
pub use provider::{ReplyProvider, RoundRobinSelector, ScriptedReplyProvider, SpeakerSelector};
pub use restore::SessionRecreator;
pub use transport::{TransportEvent, TransportHub};
