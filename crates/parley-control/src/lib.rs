//! # parley-control — the operator-facing control surface
//!
//! [`ConversationBuilder`] wires participants, a coordinator, a reply
//! provider, and a run directory into a [`ConversationController`]: the
//! single handle for driving, pausing, inspecting, rewinding, and persisting
//! a conversation. The turn loop runs on a spawned task that holds the
//! engine lock for the whole run; control operations that need the engine
//! therefore take effect at turn boundaries, never mid-turn.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parley_checkpoint::{CheckpointStore, FileCheckpointStore};
use parley_engine::{
    ContinuationEngine, Coordinator, CredentialSource, EngineState, InterventionHub, Participant,
    ReplyProvider, RoundRobinSelector, SessionRecreator, SpeakerSelector, TransportEvent,
    TransportHub,
};
use parley_history::BranchLedger;
use parley_protocol::{
    ActionKind, BUNDLE_FORMAT_VERSION, Branch, BranchId, CheckpointId, CheckpointRecord,
    EngineError, EngineResult, HistoryBundle, MessagePayload, RunId,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, instrument, warn};

const DEFAULT_BUNDLE_FILE: &str = "branches.json";
const TRANSPORT_BUFFER: usize = 256;

pub struct ConversationBuilder {
    root: PathBuf,
    participants: Vec<Participant>,
    coordinator: Option<Coordinator>,
    provider: Option<Arc<dyn ReplyProvider>>,
    selector: Arc<dyn SpeakerSelector>,
    credentials: CredentialSource,
}

impl ConversationBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            participants: Vec::new(),
            coordinator: None,
            provider: None,
            selector: Arc::new(RoundRobinSelector),
            credentials: CredentialSource::default(),
        }
    }

    pub fn participant(mut self, participant: Participant) -> Self {
        self.participants.push(participant);
        self
    }

    pub fn coordinator(mut self, coordinator: Coordinator) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn provider(mut self, provider: Arc<dyn ReplyProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn selector(mut self, selector: Arc<dyn SpeakerSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn credentials(mut self, credentials: CredentialSource) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn build(self) -> EngineResult<ConversationController> {
        if self.participants.is_empty() {
            return Err(EngineError::InvalidState(
                "a conversation needs at least one participant".to_string(),
            ));
        }
        let coordinator = self.coordinator.ok_or_else(|| {
            EngineError::InvalidState("a conversation needs a coordinator".to_string())
        })?;
        let provider = self.provider.ok_or_else(|| {
            EngineError::InvalidState("a conversation needs a reply provider".to_string())
        })?;

        let run_id = RunId::new_uuid();
        let run_root = self.root.join("runs").join(run_id.as_str());
        let store: Arc<FileCheckpointStore> = Arc::new(FileCheckpointStore::new(&run_root));
        let ledger = Arc::new(BranchLedger::new());
        let hub = Arc::new(InterventionHub::new());
        let transport = TransportHub::new(TRANSPORT_BUFFER);
        let pause = Arc::new(AtomicBool::new(false));
        let engine = ContinuationEngine::new(
            self.participants,
            coordinator,
            ledger.clone(),
            store.clone(),
            provider,
            self.selector,
            hub.clone(),
            transport.clone(),
            pause.clone(),
        );
        info!(run_id = %run_id, run_root = ?run_root, "conversation built");
        Ok(ConversationController {
            run_id,
            run_root,
            engine: Arc::new(tokio::sync::Mutex::new(engine)),
            ledger,
            store,
            hub,
            transport,
            pause,
            credentials: self.credentials,
            recreator: SessionRecreator::new(),
            run_task: parking_lot::Mutex::new(None),
        })
    }
}

pub struct ConversationController {
    run_id: RunId,
    run_root: PathBuf,
    engine: Arc<tokio::sync::Mutex<ContinuationEngine>>,
    ledger: Arc<BranchLedger>,
    store: Arc<FileCheckpointStore>,
    hub: Arc<InterventionHub>,
    transport: TransportHub,
    pause: Arc<AtomicBool>,
    credentials: CredentialSource,
    recreator: SessionRecreator,
    run_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ConversationController {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn run_root(&self) -> &Path {
        &self.run_root
    }

    pub fn checkpoint_store(&self) -> Arc<FileCheckpointStore> {
        self.store.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.transport.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<TransportEvent> {
        self.transport.subscribe_stream()
    }

    fn run_active(&self) -> bool {
        self.run_task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn spawn_run(&self) {
        let engine = self.engine.clone();
        let handle = tokio::spawn(async move {
            let mut guard = engine.lock().await;
            if let Err(error) = guard.run().await {
                warn!(%error, "run loop ended with an error");
            }
        });
        *self.run_task.lock() = Some(handle);
    }

    /// Stage the opening message.
    pub async fn seed(&self, sender: &str, payload: MessagePayload) -> EngineResult<()> {
        self.engine.lock().await.seed(sender, payload).await
    }

    /// Start the turn loop on its own task.
    pub async fn start(&self) -> EngineResult<()> {
        if self.run_active() {
            return Err(EngineError::InvalidState(
                "run loop is already active".to_string(),
            ));
        }
        // A stop() issued while nothing ran must not leak into this run.
        self.pause.store(false, Ordering::SeqCst);
        self.engine.lock().await.start()?;
        self.spawn_run();
        Ok(())
    }

    /// Request a pause. Advisory: the loop observes it at the next turn
    /// boundary. Stopping when nothing runs is success.
    pub fn stop(&self) -> EngineResult<()> {
        self.pause.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Block until the spawned run loop (if any) comes to rest.
    pub async fn wait_until_settled(&self) {
        let handle = self.run_task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub async fn state(&self) -> EngineState {
        self.engine.lock().await.state().clone()
    }

    /// Execute exactly one turn. The loop must not be running.
    pub async fn step(&self) -> EngineResult<EngineState> {
        if self.run_active() {
            return Err(EngineError::InvalidState(
                "stop the run loop before stepping".to_string(),
            ));
        }
        self.engine.lock().await.step_once().await
    }

    /// Resume a paused conversation with a fresh round budget.
    pub async fn resume(&self, max_additional_rounds: u64) -> EngineResult<()> {
        if self.run_active() {
            return Err(EngineError::InvalidState(
                "run loop is already active".to_string(),
            ));
        }
        self.pause.store(false, Ordering::SeqCst);
        self.engine.lock().await.resume(max_additional_rounds)?;
        self.spawn_run();
        Ok(())
    }

    /// Discard the next observed message. Dropping when nothing is staged
    /// and nothing runs is success with no side effect.
    pub fn drop_next(&self) -> EngineResult<()> {
        if let Ok(guard) = self.engine.try_lock()
            && guard.pending_message().is_none()
        {
            return Ok(());
        }
        self.hub.arm_drop();
        Ok(())
    }

    /// Rewrite the content of the next `count` messages from senders
    /// matching `sender_prefix`.
    pub fn set_override(
        &self,
        sender_prefix: impl Into<String>,
        replacement: impl Into<String>,
        count: u32,
    ) -> EngineResult<()> {
        self.hub.set_override(sender_prefix, replacement, count);
        Ok(())
    }

    pub fn clear_override(&self) {
        self.hub.clear_override();
    }

    /// Edit the staged pending message in place (index 0 is the only slot).
    pub async fn edit_queue(&self, index: usize, payload: MessagePayload) -> EngineResult<()> {
        if self.run_active() {
            return Err(EngineError::InvalidState(
                "stop the run loop before editing the queue".to_string(),
            ));
        }
        self.engine.lock().await.edit_pending(index, payload)
    }

    /// Snapshot of every branch plus the active one.
    pub fn history(&self) -> HistoryBundle {
        self.ledger.snapshot()
    }

    pub fn branch_messages(&self, branch_id: BranchId) -> Vec<parley_protocol::TimestampedMessage> {
        self.ledger.branch_messages(branch_id)
    }

    pub fn current_branch(&self) -> BranchId {
        self.ledger.current_branch()
    }

    pub fn set_branch_score(&self, branch_id: BranchId, score: f64) -> EngineResult<()> {
        self.ledger.set_score(branch_id, score)
    }

    /// Persist the multi-branch bundle. Defaults to
    /// `<run_root>/branches.json`; custom paths get their parent directories
    /// created.
    pub async fn save_to_file(&self, path: Option<&Path>) -> EngineResult<PathBuf> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.run_root.join(DEFAULT_BUNDLE_FILE));
        self.ledger.save_to_file(&path).await?;
        Ok(path)
    }

    /// Replace the in-memory history with a persisted bundle. The engine
    /// must be at rest.
    pub async fn load_from_file(&self, path: &Path) -> EngineResult<()> {
        if self.run_active() {
            return Err(EngineError::InvalidState(
                "stop the run loop before loading history".to_string(),
            ));
        }
        let bundle = BranchLedger::read_bundle(path).await?;
        if bundle.format_version != BUNDLE_FORMAT_VERSION {
            warn!(
                found = %bundle.format_version,
                expected = BUNDLE_FORMAT_VERSION,
                "bundle format drift; loading anyway"
            );
        }
        self.ledger.restore_bundle(bundle)
    }

    /// Reload a saved point: validate, recreate the session, and reset the
    /// history to the record's message log. Leaves the conversation Paused;
    /// call [`Self::resume`] to continue it.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn restore_checkpoint(&self, id: &CheckpointId) -> EngineResult<()> {
        if self.run_active() {
            return Err(EngineError::InvalidState(
                "stop the run loop before restoring".to_string(),
            ));
        }
        let mut engine = self.engine.lock().await;
        let loaded = self.store.load(id).await?;
        let (participants, coordinator) = self
            .recreator
            .recreate(&loaded.record, &self.credentials)?;

        // Nothing above touched shared state; from here on the swap is
        // in-memory only and cannot partially fail.
        let mut branch = Branch::root();
        branch.messages = loaded.record.message_log.clone();
        let mut branches = std::collections::BTreeMap::new();
        branches.insert(branch.branch_id, branch);
        self.ledger.restore_bundle(HistoryBundle {
            format_version: BUNDLE_FORMAT_VERSION.to_string(),
            current_branch: BranchId::root(),
            branches,
        })?;
        engine.install_restored(participants, coordinator, loaded.record.step_index);
        engine.resume_from_tail()?;
        info!(step_index = loaded.record.step_index, "checkpoint restored");
        Ok(())
    }

    /// Restore the newest restorable checkpoint of this run.
    pub async fn restore_latest(&self) -> EngineResult<()> {
        let mut best: Option<CheckpointRecord> = None;
        for id in self.store.list().await? {
            let Ok(loaded) = self.store.load(&id).await else {
                continue;
            };
            if loaded.record.action != ActionKind::MessageAppended {
                continue;
            }
            if best
                .as_ref()
                .is_none_or(|record| record.step_index < loaded.record.step_index)
            {
                best = Some(loaded.record);
            }
        }
        let record = best.ok_or_else(|| {
            EngineError::CheckpointNotFound("no restorable checkpoint in this run".to_string())
        })?;
        self.restore_checkpoint(&record.id).await
    }

    /// Pause at a turn boundary, replace the message at `cutoff` with
    /// `payload`, and continue on a fresh branch restored from the nearest
    /// checkpoint before the cutoff. The prior branch freezes untouched.
    #[instrument(skip(self, payload))]
    pub async fn edit_and_rewind(
        &self,
        cutoff: u64,
        payload: MessagePayload,
    ) -> EngineResult<BranchId> {
        self.pause.store(true, Ordering::SeqCst);
        let mut engine = self.engine.lock().await;
        // Lock acquired: the loop is at rest. Clear the advisory flag so it
        // does not pause the rewound run's first turn.
        self.pause.store(false, Ordering::SeqCst);

        let parent = self.ledger.current_branch();
        let original = self.ledger.message_at(parent, cutoff).ok_or_else(|| {
            EngineError::CheckpointNotFound(format!(
                "no message at timestamp {cutoff} in branch {parent}"
            ))
        })?;
        let record = self.restorable_before(cutoff).await?;
        let (participants, coordinator) = self.recreator.recreate(&record, &self.credentials)?;

        // Everything fallible is done; fork and restart.
        let child = self.ledger.fork_at_cutoff(cutoff)?;
        engine.install_restored(participants, coordinator, record.step_index);
        engine.inject_pending(original.sender.clone(), payload, true);
        engine.start()?;
        drop(engine);
        self.spawn_run();
        info!(parent = %parent, child = %child, "history edited and rewound");
        Ok(child)
    }

    /// Newest restorable checkpoint whose last committed timestamp is
    /// strictly below `cutoff` and which is visible on the current branch's
    /// lineage.
    async fn restorable_before(&self, cutoff: u64) -> EngineResult<CheckpointRecord> {
        let lineage = self.ledger.lineage(self.ledger.current_branch());
        let mut best: Option<(u64, CheckpointRecord)> = None;
        for id in self.store.list().await? {
            let Ok(loaded) = self.store.load(&id).await else {
                continue;
            };
            let record = loaded.record;
            if record.action != ActionKind::MessageAppended {
                continue;
            }
            let Some(commit) = record.commit_timestamp() else {
                continue;
            };
            if commit >= cutoff {
                continue;
            }
            let Some(branch) = record.branch_id() else {
                continue;
            };
            let visible = lineage.iter().any(|(lineage_branch, limit)| {
                *lineage_branch == branch && limit.is_none_or(|limit| commit < limit)
            });
            if !visible {
                continue;
            }
            if best.as_ref().is_none_or(|(best_commit, _)| *best_commit < commit) {
                best = Some((commit, record));
            }
        }
        best.map(|(_, record)| record).ok_or_else(|| {
            EngineError::CheckpointNotFound(format!(
                "no restorable checkpoint before timestamp {cutoff}"
            ))
        })
    }
}
