//! The continuation engine: the single-task turn loop.
//!
//! State machine is Idle -> Running -> (Paused | Terminated). One full turn
//! per iteration: commit the pending message (through the intervention hub),
//! checkpoint, check termination and the round budget, select the next
//! speaker, generate its reply. Pause requests are observed only between
//! turns, so an in-flight turn always commits completely.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use parley_checkpoint::CheckpointStore;
use parley_history::BranchLedger;
use parley_protocol::{
    ActionKind, Address, CHECKPOINT_FORMAT_VERSION, CheckpointRecord, EngineError, EngineResult,
    MessagePayload, TimestampedMessage,
};
use tracing::{debug, info, instrument, warn};

use crate::extract::extract_all;
use crate::intervene::InterventionHub;
use crate::participant::{Coordinator, Participant};
use crate::provider::{ReplyProvider, SpeakerSelector};
use crate::transport::{TransportEvent, TransportHub};

/// Shared topic every committed message is addressed to.
pub const GROUP_TOPIC: &str = "group";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
    Paused,
    Terminated(String),
}

impl EngineState {
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated(_))
    }
}

/// The one in-flight message: generated or injected but not yet committed.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub sender: String,
    pub payload: MessagePayload,
}

pub struct ContinuationEngine {
    participants: Vec<Participant>,
    coordinator: Coordinator,
    ledger: Arc<BranchLedger>,
    store: Arc<dyn CheckpointStore>,
    provider: Arc<dyn ReplyProvider>,
    selector: Arc<dyn SpeakerSelector>,
    hub: Arc<InterventionHub>,
    transport: TransportHub,
    pause_requested: Arc<AtomicBool>,
    state: EngineState,
    pending: Option<PendingMessage>,
    skip_commit: bool,
    suppress_next_checkpoint: bool,
    step_index: u64,
}

impl ContinuationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        participants: Vec<Participant>,
        coordinator: Coordinator,
        ledger: Arc<BranchLedger>,
        store: Arc<dyn CheckpointStore>,
        provider: Arc<dyn ReplyProvider>,
        selector: Arc<dyn SpeakerSelector>,
        hub: Arc<InterventionHub>,
        transport: TransportHub,
        pause_requested: Arc<AtomicBool>,
    ) -> Self {
        Self {
            participants,
            coordinator,
            ledger,
            store,
            provider,
            selector,
            hub,
            transport,
            pause_requested,
            state: EngineState::Idle,
            pending: None,
            skip_commit: false,
            suppress_next_checkpoint: false,
            step_index: 0,
        }
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn pending_message(&self) -> Option<&PendingMessage> {
        self.pending.as_ref()
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn transport(&self) -> &TransportHub {
        &self.transport
    }

    pub fn step_index(&self) -> u64 {
        self.step_index
    }

    /// Stage the opening message of a fresh conversation.
    #[instrument(skip(self, payload), fields(sender))]
    pub async fn seed(&mut self, sender: &str, payload: MessagePayload) -> EngineResult<()> {
        if self.state != EngineState::Idle {
            return Err(EngineError::InvalidState(
                "only an idle conversation can be seeded".to_string(),
            ));
        }
        if self.pending.is_some() {
            return Err(EngineError::InvalidState(
                "a message is already staged".to_string(),
            ));
        }
        self.pending = Some(PendingMessage {
            sender: sender.to_string(),
            payload,
        });
        self.emit_checkpoint(ActionKind::TurnStart, "conversation seeded")
            .await;
        Ok(())
    }

    pub fn start(&mut self) -> EngineResult<()> {
        match &self.state {
            EngineState::Idle => {
                if self.pending.is_none() {
                    return Err(EngineError::InvalidState(
                        "cannot start: no message staged and no history to resume".to_string(),
                    ));
                }
                self.state = EngineState::Running;
                info!("conversation started");
                Ok(())
            }
            EngineState::Paused => Err(EngineError::InvalidState(
                "conversation is paused; resume it instead".to_string(),
            )),
            EngineState::Running => Err(EngineError::InvalidState(
                "conversation is already running".to_string(),
            )),
            EngineState::Terminated(reason) => Err(EngineError::InvalidState(format!(
                "conversation terminated: {reason}"
            ))),
        }
    }

    /// Paused -> Running with a fresh round budget: the run may take up to
    /// `max_additional_rounds` more turns before the round check fires.
    pub fn resume(&mut self, max_additional_rounds: u64) -> EngineResult<()> {
        if self.state != EngineState::Paused {
            return Err(EngineError::InvalidState(
                "only a paused conversation can be resumed".to_string(),
            ));
        }
        self.coordinator.max_rounds = self.coordinator.current_round + max_additional_rounds;
        self.state = EngineState::Running;
        info!(
            max_rounds = self.coordinator.max_rounds,
            "conversation resumed"
        );
        Ok(())
    }

    /// Replace roster and coordinator with a recreated session. The ledger,
    /// store, and intervention hub stay.
    pub fn install_restored(
        &mut self,
        participants: Vec<Participant>,
        coordinator: Coordinator,
        step_index: u64,
    ) {
        self.participants = participants;
        self.coordinator = coordinator;
        self.step_index = step_index;
        self.pending = None;
        self.skip_commit = false;
        self.suppress_next_checkpoint = false;
        self.state = EngineState::Idle;
    }

    /// Stage the current branch tail as the pending message without
    /// re-appending it, leaving the engine Paused and ready to resume.
    pub fn resume_from_tail(&mut self) -> EngineResult<()> {
        let branch = self.ledger.current_branch();
        let tail = self.ledger.last_message(branch).ok_or_else(|| {
            EngineError::InvalidState("cannot resume: branch history is empty".to_string())
        })?;
        self.pending = Some(PendingMessage {
            sender: tail.sender,
            payload: tail.payload,
        });
        self.skip_commit = true;
        self.state = EngineState::Paused;
        Ok(())
    }

    /// Stage an injected message, optionally suppressing the checkpoint for
    /// its commit (used once per edit-and-rewind re-injection).
    pub fn inject_pending(
        &mut self,
        sender: impl Into<String>,
        payload: MessagePayload,
        suppress_checkpoint: bool,
    ) {
        self.pending = Some(PendingMessage {
            sender: sender.into(),
            payload,
        });
        self.skip_commit = false;
        self.suppress_next_checkpoint = suppress_checkpoint;
    }

    /// Edit the staged message in place. The queue holds exactly one slot.
    pub fn edit_pending(&mut self, index: usize, payload: MessagePayload) -> EngineResult<()> {
        if index != 0 {
            return Err(EngineError::InvalidState(format!(
                "queue index {index} out of range; at most one message is staged"
            )));
        }
        let pending = self.pending.as_mut().ok_or_else(|| {
            EngineError::InvalidState("no message is staged".to_string())
        })?;
        pending.payload = payload;
        Ok(())
    }

    /// Drive turns until pause, termination, or an internal error.
    pub async fn run(&mut self) -> EngineResult<EngineState> {
        while self.state == EngineState::Running {
            self.step_turn().await?;
            if self.pause_requested.swap(false, Ordering::SeqCst)
                && self.state == EngineState::Running
            {
                self.state = EngineState::Paused;
                info!("pause observed at turn boundary");
            }
        }
        Ok(self.state.clone())
    }

    /// Execute exactly one turn and come to rest Paused (unless the turn
    /// terminated the run).
    pub async fn step_once(&mut self) -> EngineResult<EngineState> {
        match &self.state {
            EngineState::Idle => self.start()?,
            EngineState::Paused => self.state = EngineState::Running,
            EngineState::Running => {}
            EngineState::Terminated(reason) => {
                return Err(EngineError::InvalidState(format!(
                    "conversation terminated: {reason}"
                )));
            }
        }
        self.step_turn().await?;
        if self.state == EngineState::Running {
            self.state = EngineState::Paused;
        }
        Ok(self.state.clone())
    }

    #[instrument(skip(self), fields(step = self.step_index, round = self.coordinator.current_round))]
    async fn step_turn(&mut self) -> EngineResult<()> {
        if self.state != EngineState::Running {
            return Err(EngineError::InvalidState(
                "engine is not running".to_string(),
            ));
        }
        let pending = self.pending.take().ok_or_else(|| {
            EngineError::InvalidState("no message staged for this turn".to_string())
        })?;
        let branch = self.ledger.current_branch();

        let committed: Option<TimestampedMessage> = if self.skip_commit {
            // Restored tail: already in the ledger, do not re-append.
            self.skip_commit = false;
            self.ledger.last_message(branch)
        } else {
            match self.hub.apply(&pending.sender, pending.payload) {
                None => {
                    self.transport.publish(TransportEvent::MessageDropped {
                        sender: pending.sender.clone(),
                    });
                    None
                }
                Some(payload) => {
                    let message = self.ledger.append(
                        branch,
                        &pending.sender,
                        Address::topic(GROUP_TOPIC),
                        payload,
                    )?;
                    self.deliver(&message);
                    self.step_index += 1;
                    self.coordinator.current_round += 1;
                    self.coordinator.last_speaker = Some(pending.sender.clone());
                    if self.suppress_next_checkpoint {
                        self.suppress_next_checkpoint = false;
                        debug!("checkpoint suppressed for re-injected message");
                    } else {
                        self.emit_checkpoint(ActionKind::MessageAppended, "message committed")
                            .await;
                    }
                    self.transport.publish(TransportEvent::MessageCommitted {
                        branch_id: branch,
                        message: message.clone(),
                    });
                    Some(message)
                }
            }
        };

        if let Some(message) = &committed {
            if self.coordinator.profile.is_termination(&message.payload) {
                let reason = format!("termination condition met by `{}`", message.sender);
                self.terminate(reason).await;
                return Ok(());
            }
            if self.coordinator.current_round >= self.coordinator.max_rounds {
                let reason = format!(
                    "maximum rounds ({}) reached",
                    self.coordinator.max_rounds
                );
                self.terminate(reason).await;
                return Ok(());
            }
        }

        let roster: Vec<String> = self
            .participants
            .iter()
            .map(|participant| participant.name.clone())
            .collect();
        let last_speaker = self.coordinator.last_speaker.clone();
        let Some(next) = self
            .selector
            .select_speaker(last_speaker.as_deref(), &roster)
        else {
            self.terminate("no eligible speaker selected".to_string())
                .await;
            return Ok(());
        };
        let (speaker, history) = {
            let Some(speaker) = self
                .participants
                .iter()
                .find(|participant| participant.name == next)
            else {
                return Err(EngineError::InvalidState(format!(
                    "selected speaker `{next}` is not in the roster"
                )));
            };
            (
                speaker.clone(),
                speaker
                    .history_with(&self.coordinator.profile.name)
                    .to_vec(),
            )
        };

        let reply = match self.provider.generate_reply(&speaker, &history).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(%err, speaker = %next, "reply provider failed");
                self.terminate(format!("reply generation failed: {err}"))
                    .await;
                return Ok(());
            }
        };
        match reply {
            None => {
                self.terminate("no reply generated".to_string()).await;
            }
            Some(payload) => {
                self.emit_checkpoint(ActionKind::ReplyGenerated, "reply staged")
                    .await;
                self.pending = Some(PendingMessage {
                    sender: next,
                    payload,
                });
            }
        }
        Ok(())
    }

    /// Write the committed message into every roster member's history with
    /// the coordinator, and the coordinator's history with the sender.
    fn deliver(&mut self, message: &TimestampedMessage) {
        let coordinator_name = self.coordinator.profile.name.clone();
        for participant in self.participants.iter_mut() {
            participant.record_inbound(&coordinator_name, message.clone());
        }
        self.coordinator
            .profile
            .record_inbound(&message.sender, message.clone());
    }

    async fn terminate(&mut self, reason: String) {
        info!(%reason, "conversation terminated");
        self.state = EngineState::Terminated(reason.clone());
        self.emit_checkpoint(ActionKind::TurnEnd, &reason).await;
        self.transport.publish(TransportEvent::RunTerminated {
            branch_id: self.ledger.current_branch(),
            reason,
        });
    }

    /// Build and save a checkpoint. Failures are logged and never interrupt
    /// the conversation.
    async fn emit_checkpoint(&self, action: ActionKind, note: &str) {
        let branch = self.ledger.current_branch();
        let (coordinator_state, participant_states) =
            extract_all(&self.coordinator, &self.participants);
        let created_at = Utc::now();
        let record = CheckpointRecord {
            id: CheckpointRecord::compose_id(self.step_index, action, created_at),
            step_index: self.step_index,
            action,
            created_at,
            format_version: CHECKPOINT_FORMAT_VERSION.to_string(),
            content_hash: String::new(),
            coordinator: coordinator_state,
            participants: participant_states,
            message_log: self.ledger.branch_messages(branch),
            session_meta: serde_json::json!({
                "branch_id": branch.as_u64(),
                "note": note,
            }),
        };
        match self.store.save(&record).await {
            Ok(id) => {
                self.transport.publish(TransportEvent::CheckpointWritten {
                    id,
                    step_index: self.step_index,
                    action,
                });
            }
            Err(err) => {
                warn!(%err, action = %action, "checkpoint save failed; conversation continues");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::time::{SystemTime, UNIX_EPOCH};

    use parley_checkpoint::{CheckpointStore, FileCheckpointStore};
    use parley_history::BranchLedger;
    use parley_protocol::{ActionKind, EngineError, MessagePayload, ModelConfig};
    use tokio::fs;

    use super::{ContinuationEngine, EngineState};
    use crate::intervene::InterventionHub;
    use crate::participant::{
        Coordinator, ModelProfile, Participant, named_flag_termination,
    };
    use crate::provider::{RoundRobinSelector, ScriptedReplyProvider};
    use crate::transport::TransportHub;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    fn profile() -> ModelProfile {
        ModelProfile::new(ModelConfig::new("gpt-4"))
    }

    struct Fixture {
        engine: ContinuationEngine,
        store: Arc<FileCheckpointStore>,
        ledger: Arc<BranchLedger>,
        hub: Arc<InterventionHub>,
        root: PathBuf,
    }

    fn fixture(name: &str, replies: &[&str], max_rounds: u64) -> Fixture {
        let root = unique_test_root(name);
        let store = Arc::new(FileCheckpointStore::new(&root));
        let ledger = Arc::new(BranchLedger::new());
        let hub = Arc::new(InterventionHub::new());
        let participants = vec![
            Participant::new("solver", "solve the task", profile()),
            Participant::new("critic", "critique the plan", profile()),
        ];
        let coordinator = Coordinator::new(
            Participant::new("coordinator", "run the group", profile())
                .with_termination(named_flag_termination()),
            max_rounds,
        );
        let engine = ContinuationEngine::new(
            participants,
            coordinator,
            ledger.clone(),
            store.clone(),
            Arc::new(ScriptedReplyProvider::from_lines(replies)),
            Arc::new(RoundRobinSelector),
            hub.clone(),
            TransportHub::new(64),
            Arc::new(AtomicBool::new(false)),
        );
        Fixture {
            engine,
            store,
            ledger,
            hub,
            root,
        }
    }

    #[tokio::test]
    async fn start_without_seed_is_rejected() {
        let mut fx = fixture("parley-engine-noseed", &[], 10);
        let err = fx.engine.start().unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
        let _ = fs::remove_dir_all(fx.root).await;
    }

    #[tokio::test]
    async fn run_terminates_on_the_solution_flag() {
        let mut fx = fixture(
            "parley-engine-solution",
            &["working on it", "SOLUTION_FOUND: 42"],
            10,
        );
        fx.engine
            .seed("user", MessagePayload::text("find the answer"))
            .await
            .unwrap();
        fx.engine.start().unwrap();
        let state = fx.engine.run().await.unwrap();
        match state {
            EngineState::Terminated(reason) => {
                assert!(reason.contains("termination condition met"), "{reason}");
            }
            other => panic!("unexpected state: {other:?}"),
        }
        // seed + both replies committed
        let messages = fx.ledger.branch_messages(fx.ledger.current_branch());
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2].payload.content, "SOLUTION_FOUND: 42");
        let _ = fs::remove_dir_all(fx.root).await;
    }

    #[tokio::test]
    async fn run_terminates_when_the_script_runs_dry() {
        let mut fx = fixture("parley-engine-dry", &["only reply"], 10);
        fx.engine
            .seed("user", MessagePayload::text("go"))
            .await
            .unwrap();
        fx.engine.start().unwrap();
        let state = fx.engine.run().await.unwrap();
        assert_eq!(
            state,
            EngineState::Terminated("no reply generated".to_string())
        );
        let _ = fs::remove_dir_all(fx.root).await;
    }

    #[tokio::test]
    async fn run_terminates_on_the_round_budget() {
        let replies = ["a", "b", "c", "d", "e", "f"];
        let mut fx = fixture("parley-engine-rounds", &replies, 3);
        fx.engine
            .seed("user", MessagePayload::text("go"))
            .await
            .unwrap();
        fx.engine.start().unwrap();
        let state = fx.engine.run().await.unwrap();
        assert_eq!(
            state,
            EngineState::Terminated("maximum rounds (3) reached".to_string())
        );
        assert_eq!(
            fx.ledger.branch_messages(fx.ledger.current_branch()).len(),
            3
        );
        let _ = fs::remove_dir_all(fx.root).await;
    }

    #[tokio::test]
    async fn every_commit_emits_a_message_appended_checkpoint() {
        let mut fx = fixture(
            "parley-engine-checkpoints",
            &["step one", "SOLUTION_FOUND"],
            10,
        );
        fx.engine
            .seed("user", MessagePayload::text("go"))
            .await
            .unwrap();
        fx.engine.start().unwrap();
        fx.engine.run().await.unwrap();

        let ids = fx.store.list().await.unwrap();
        let mut appended = 0;
        let mut saw_turn_start = false;
        let mut saw_turn_end = false;
        for id in &ids {
            let loaded = fx.store.load(id).await.unwrap();
            match loaded.record.action {
                ActionKind::MessageAppended => appended += 1,
                ActionKind::TurnStart => saw_turn_start = true,
                ActionKind::TurnEnd => saw_turn_end = true,
                ActionKind::ReplyGenerated => {}
            }
        }
        assert_eq!(appended, 3);
        assert!(saw_turn_start);
        assert!(saw_turn_end);
        let _ = fs::remove_dir_all(fx.root).await;
    }

    #[tokio::test]
    async fn dropped_message_is_not_committed_or_checkpointed() {
        let mut fx = fixture(
            "parley-engine-drop",
            &["unwanted", "SOLUTION_FOUND"],
            10,
        );
        fx.engine
            .seed("user", MessagePayload::text("go"))
            .await
            .unwrap();
        // First step commits the seed and stages "unwanted"; drop it there.
        fx.engine.step_once().await.unwrap();
        fx.hub.arm_drop();
        fx.engine.step_once().await.unwrap();
        let state = fx.engine.step_once().await.unwrap();
        assert!(state.is_terminated());

        let messages = fx.ledger.branch_messages(fx.ledger.current_branch());
        let contents: Vec<&str> = messages
            .iter()
            .map(|m| m.payload.content.as_str())
            .collect();
        assert_eq!(contents, vec!["go", "SOLUTION_FOUND"]);
        let _ = fs::remove_dir_all(fx.root).await;
    }

    #[tokio::test]
    async fn override_rewrites_before_commit() {
        let mut fx = fixture(
            "parley-engine-override",
            &["bad idea", "SOLUTION_FOUND"],
            10,
        );
        fx.hub.set_override("solver", "use the safe path", 1);
        fx.engine
            .seed("user", MessagePayload::text("go"))
            .await
            .unwrap();
        fx.engine.start().unwrap();
        fx.engine.run().await.unwrap();

        let messages = fx.ledger.branch_messages(fx.ledger.current_branch());
        assert_eq!(messages[1].sender, "solver");
        assert_eq!(messages[1].payload.content, "use the safe path");
        let _ = fs::remove_dir_all(fx.root).await;
    }

    #[tokio::test]
    async fn step_once_executes_exactly_one_turn_and_pauses() {
        let mut fx = fixture("parley-engine-step", &["one", "two", "three"], 10);
        fx.engine
            .seed("user", MessagePayload::text("go"))
            .await
            .unwrap();
        let state = fx.engine.step_once().await.unwrap();
        assert_eq!(state, EngineState::Paused);
        assert_eq!(
            fx.ledger.branch_messages(fx.ledger.current_branch()).len(),
            1
        );
        let state = fx.engine.step_once().await.unwrap();
        assert_eq!(state, EngineState::Paused);
        assert_eq!(
            fx.ledger.branch_messages(fx.ledger.current_branch()).len(),
            2
        );
        let _ = fs::remove_dir_all(fx.root).await;
    }

    #[tokio::test]
    async fn resume_extends_the_round_budget() {
        let mut fx = fixture("parley-engine-resume", &["a", "b", "c"], 10);
        fx.engine
            .seed("user", MessagePayload::text("go"))
            .await
            .unwrap();
        fx.engine.step_once().await.unwrap();
        assert_eq!(fx.engine.coordinator().current_round, 1);
        fx.engine.resume(2).unwrap();
        assert_eq!(fx.engine.coordinator().max_rounds, 3);
        let state = fx.engine.run().await.unwrap();
        assert_eq!(
            state,
            EngineState::Terminated("maximum rounds (3) reached".to_string())
        );
        let _ = fs::remove_dir_all(fx.root).await;
    }
}
