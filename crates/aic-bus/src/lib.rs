//! Non-blocking heal-event bus: bounded queue, single worker task, playbook
//! matching, append-only journal, and a broadcast stream for external
//! observers (CLI `heal dry-run`, future UI).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use aic_protocol::{find_matching, ExecutionOutcome, ExecutionState, HealEvent, Playbook, PlaybookExecutor};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

/// Minimum bound required by §4.1 ("bounded queue (>=100)").
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
const BROADCAST_CAPACITY: usize = 256;

pub type Handler = Arc<dyn Fn(&HealEvent) + Send + Sync>;

#[derive(Deserialize, Default)]
struct PlaybookFile {
    #[serde(default)]
    playbooks: Vec<Playbook>,
}

/// Reads a playbook YAML file (§6 format). A missing file yields an empty
/// set (logged, not fatal); playbooks are sorted by descending `rank` here
/// too, matching the original's re-sort at match time.
pub fn load_playbooks(path: &Path) -> Vec<Playbook> {
    if !path.exists() {
        warn!(path = %path.display(), "playbook file missing, starting with an empty set");
        return Vec::new();
    }

    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) => {
            warn!(path = %path.display(), %error, "failed reading playbook file");
            return Vec::new();
        }
    };

    match serde_yaml::from_str::<PlaybookFile>(&raw) {
        Ok(mut file) => {
            file.playbooks.sort_by_key(|pb| std::cmp::Reverse(pb.rank));
            file.playbooks
        }
        Err(error) => {
            warn!(path = %path.display(), %error, "failed parsing playbook file");
            Vec::new()
        }
    }
}

struct WorkerState {
    playbooks: Vec<Playbook>,
    handlers: Vec<Handler>,
    executor: Option<Arc<dyn PlaybookExecutor>>,
    journal_path: PathBuf,
    broadcast: broadcast::Sender<HealEvent>,
}

/// The event bus. Construct via [`HealBusBuilder`].
pub struct HealBus {
    sender: mpsc::Sender<HealEvent>,
    broadcast: broadcast::Sender<HealEvent>,
    overflow: Arc<AtomicU64>,
    worker: JoinHandle<()>,
}

pub struct HealBusBuilder {
    capacity: usize,
    playbooks: Vec<Playbook>,
    handlers: Vec<Handler>,
    executor: Option<Arc<dyn PlaybookExecutor>>,
    journal_path: PathBuf,
}

impl HealBusBuilder {
    pub fn new(journal_path: impl Into<PathBuf>) -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            playbooks: Vec::new(),
            handlers: Vec::new(),
            executor: None,
            journal_path: journal_path.into(),
        }
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn playbooks(mut self, playbooks: Vec<Playbook>) -> Self {
        self.playbooks = playbooks;
        self
    }

    pub fn handler(mut self, handler: Handler) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn PlaybookExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn build(self) -> HealBus {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let overflow = Arc::new(AtomicU64::new(0));

        let state = WorkerState {
            playbooks: self.playbooks,
            handlers: self.handlers,
            executor: self.executor,
            journal_path: self.journal_path,
            broadcast: broadcast_tx.clone(),
        };

        let worker = tokio::spawn(run_worker(receiver, state));

        HealBus {
            sender,
            broadcast: broadcast_tx,
            overflow,
            worker,
        }
    }
}

impl HealBus {
    /// Non-blocking; on a full queue the event is dropped and the overflow
    /// counter grows. Never `.await`s, so producers on any thread are safe.
    pub fn emit(&self, event: HealEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.overflow.fetch_add(1, Ordering::Relaxed);
                warn!("bus.overflow: heal event dropped, queue full");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("heal bus worker has shut down, dropping event");
            }
        }
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    /// Subscribe to every processed event from outside the bus's internal
    /// handler list (the CLI's `heal dry-run` observer path).
    pub fn subscribe_stream(&self) -> broadcast::Receiver<HealEvent> {
        self.broadcast.subscribe()
    }

    /// Stops accepting new events and waits (up to 5s, per §5) for the
    /// worker to drain the queue.
    pub async fn shutdown(self) {
        drop(self.sender);
        if tokio::time::timeout(std::time::Duration::from_secs(5), self.worker)
            .await
            .is_err()
        {
            warn!("heal bus worker did not drain within shutdown deadline");
        }
    }
}

async fn run_worker(mut receiver: mpsc::Receiver<HealEvent>, state: WorkerState) {
    while let Some(event) = receiver.recv().await {
        process_event(&event, &state).await;
    }
}

#[instrument(skip(state, event), fields(event_id = %event.id, source = %event.source, kind = %event.kind))]
async fn process_event(event: &HealEvent, state: &WorkerState) {
    let _ = state.broadcast.send(event.clone());

    for handler in &state.handlers {
        let event = event.clone();
        let handler = handler.clone();
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(&event))).is_err() {
            warn!(event_id = %event.id, "heal bus handler panicked, continuing");
        }
    }

    let matches = find_matching(event, &state.playbooks);
    let outcome = match matches.first() {
        None => ExecutionOutcome {
            event_id: event.id.clone(),
            playbook: None,
            state: ExecutionState::NoMatch,
            detail: "no matching playbook".to_owned(),
        },
        Some(playbook) => match &state.executor {
            Some(executor) => executor.execute(event, playbook).await,
            None => ExecutionOutcome {
                event_id: event.id.clone(),
                playbook: Some(playbook.name.clone()),
                state: ExecutionState::NoMatch,
                detail: "matched but no executor configured".to_owned(),
            },
        },
    };

    info!(
        event_id = %outcome.event_id,
        playbook = ?outcome.playbook,
        state = ?outcome.state,
        detail = %outcome.detail,
        "heal event processed"
    );

    if let Err(error) = aic_protocol::append_jsonl(&state.journal_path, &outcome).await {
        warn!(%error, "failed to append heal journal entry");
    }
}
