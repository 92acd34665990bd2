//! Queues of pairs waiting for a processor
//!
//! Four FIFO queues split work by side and by kind so that folders, which
//! must exist before anything moves into them, never wait behind files.
//! Failed pairs sit in a [`BlacklistQueue`] until their retry time.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ndrive_client::names::is_under;
use ndrive_index::{DocPair, PairQueue, PairState, QueueItem};

use crate::blacklist::BlacklistQueue;
use crate::errors::Result;
use crate::events::{EngineEvent, EventBus};
use crate::metrics::QueueMetrics;
use crate::worker::WorkerControl;

/// How often idle processors look at the blacklist.
const IDLE_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    LocalFolder,
    LocalFile,
    RemoteFolder,
    RemoteFile,
}

impl QueueKind {
    const ALL: [QueueKind; 4] = [
        QueueKind::LocalFolder,
        QueueKind::LocalFile,
        QueueKind::RemoteFolder,
        QueueKind::RemoteFile,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Queue of a pair, `None` for states no processor handles.
    pub fn of(item: &QueueItem) -> Option<QueueKind> {
        let state = item.pair_state.as_str();
        if state.starts_with("locally") || item.pair_state == PairState::Conflicted {
            Some(if item.folderish {
                QueueKind::LocalFolder
            } else {
                QueueKind::LocalFile
            })
        } else if state.starts_with("remotely")
            || matches!(
                item.pair_state,
                PairState::UnknownDeleted | PairState::DeletedUnknown | PairState::Deleted
            )
        {
            Some(if item.folderish {
                QueueKind::RemoteFolder
            } else {
                QueueKind::RemoteFile
            })
        } else {
            None
        }
    }

    pub fn processor_name(self) -> &'static str {
        match self {
            QueueKind::LocalFolder => "LocalFolderProcessor",
            QueueKind::LocalFile => "LocalFileProcessor",
            QueueKind::RemoteFolder => "RemoteFolderProcessor",
            QueueKind::RemoteFile => "RemoteFileProcessor",
        }
    }
}

/// Which queues a processor draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorRole {
    Dedicated(QueueKind),
    /// Folders first, then the longest file queue
    Generic,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Processors in total; the first four are dedicated to one queue each
    pub max_processors: usize,
    /// Error count above which a pair is given up
    pub max_errors: u32,
    /// Delay before the first retry of a failed pair
    pub error_interval: Duration,
    pub max_error_interval: Duration,
    /// Delay before an interrupted pair is pushed back
    pub interrupt_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_processors: 4,
            max_errors: 3,
            error_interval: Duration::from_secs(30),
            max_error_interval: Duration::from_secs(30 * 60),
            interrupt_delay: Duration::from_secs(1),
        }
    }
}

struct Queues {
    queues: [VecDeque<QueueItem>; 4],
    queued: HashSet<i64>,
    enabled: [bool; 4],
    blacklist: BlacklistQueue,
}

impl Queues {
    fn requeue_expired(&mut self, now: Instant) -> usize {
        let ready = self.blacklist.pop_ready(now);
        let count = ready.len();
        for entry in ready {
            debug!("Retrying pair {} after error", entry.item.id);
            self.enqueue(entry.item);
        }
        count
    }

    fn enqueue(&mut self, item: QueueItem) -> bool {
        let Some(kind) = QueueKind::of(&item) else {
            debug!("Pair {} in state {} is not processable", item.id, item.pair_state);
            return false;
        };
        if !self.queued.insert(item.id) {
            return false;
        }
        self.queues[kind.index()].push_back(item);
        true
    }

    fn pop_from(&mut self, kind: QueueKind) -> Option<QueueItem> {
        if !self.enabled[kind.index()] {
            return None;
        }
        while let Some(item) = self.queues[kind.index()].pop_front() {
            self.queued.remove(&item.id);
            if self.blacklist.contains(item.id) {
                debug!("Skipping pair {}, waiting for retry", item.id);
                continue;
            }
            return Some(item);
        }
        None
    }

    fn len(&self, kind: QueueKind) -> usize {
        self.queues[kind.index()].len()
    }
}

#[derive(Debug)]
struct ProcessorSlot {
    name: String,
    pair: Option<(i64, String, bool)>,
    cancel: Option<CancellationToken>,
}

/// A live processor found by [`QueueManager::get_processors_on`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorInfo {
    pub worker: usize,
    pub name: String,
    pub pair_id: i64,
    pub local_path: String,
}

pub struct QueueManager {
    config: QueueConfig,
    inner: Mutex<Queues>,
    notify: Notify,
    paused: AtomicBool,
    processors: Mutex<HashMap<usize, ProcessorSlot>>,
    next_worker: AtomicUsize,
    events: EventBus,
}

impl QueueManager {
    pub fn new(config: QueueConfig, events: EventBus) -> Self {
        let blacklist = BlacklistQueue::new(config.error_interval, config.max_error_interval);
        Self {
            config,
            inner: Mutex::new(Queues {
                queues: Default::default(),
                queued: HashSet::new(),
                enabled: [true; 4],
                blacklist,
            }),
            notify: Notify::new(),
            paused: AtomicBool::new(false),
            processors: Mutex::new(HashMap::new()),
            next_worker: AtomicUsize::new(0),
            events,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn push(&self, item: QueueItem) {
        let deleting = !item.folderish && item.pair_state.as_str().contains("deleted");
        let pushed = self.inner.lock().enqueue(item);
        if deleting {
            self.cancel_action_on(item.id);
        }
        if pushed {
            debug!("Pushed pair {} ({})", item.id, item.pair_state);
            self.notify.notify_waiters();
        }
    }

    /// Record a failure of `pair`. Returns false when the pair has failed
    /// too often and is given up.
    pub fn push_error(&self, pair: &DocPair, interval: Option<Duration>) -> bool {
        if pair.error_count > self.config.max_errors {
            warn!(
                "Giving up on pair {} after {} errors: {:?}",
                pair.id, pair.error_count, pair.last_error
            );
            self.inner.lock().blacklist.remove(pair.id);
            self.events.emit(EngineEvent::NewError { id: pair.id });
            return false;
        }
        let next_try = self.inner.lock().blacklist.push(
            QueueItem::from(pair),
            pair.error_count.max(1),
            interval,
            Instant::now(),
        );
        info!(
            "Pair {} on error ({}), retry in {:?}",
            pair.id,
            pair.error_count,
            next_try.saturating_duration_since(Instant::now())
        );
        true
    }

    /// Retry `item` later without counting an error.
    pub fn postpone_pair(&self, item: QueueItem, delay: Option<Duration>) {
        debug!("Postponing pair {} for {:?}", item.id, delay);
        self.inner
            .lock()
            .blacklist
            .push(item, 1, delay, Instant::now());
    }

    /// Forget any pending retry of `id`.
    pub fn remove_error(&self, id: i64) {
        self.inner.lock().blacklist.remove(id);
    }

    pub fn is_on_error(&self, id: i64) -> bool {
        self.inner.lock().blacklist.contains(id)
    }

    /// Move pairs whose retry time has come back into their queue.
    pub fn requeue_expired(&self) -> usize {
        let count = self.inner.lock().requeue_expired(Instant::now());
        if count > 0 {
            self.notify.notify_waiters();
        }
        count
    }

    /// Next pair for a processor of `role`, without waiting.
    pub fn pop(&self, role: ProcessorRole) -> Option<QueueItem> {
        if self.is_paused() {
            return None;
        }
        let mut inner = self.inner.lock();
        inner.requeue_expired(Instant::now());
        match role {
            ProcessorRole::Dedicated(kind) => inner.pop_from(kind),
            ProcessorRole::Generic => {
                if let Some(item) = inner
                    .pop_from(QueueKind::LocalFolder)
                    .or_else(|| inner.pop_from(QueueKind::RemoteFolder))
                {
                    return Some(item);
                }
                let (first, second) =
                    if inner.len(QueueKind::RemoteFile) > inner.len(QueueKind::LocalFile) {
                        (QueueKind::RemoteFile, QueueKind::LocalFile)
                    } else {
                        (QueueKind::LocalFile, QueueKind::RemoteFile)
                    };
                inner.pop_from(first).or_else(|| inner.pop_from(second))
            }
        }
    }

    /// Wait for the next pair, parking while the queues are paused.
    pub async fn next_item(&self, role: ProcessorRole, control: &WorkerControl) -> Result<QueueItem> {
        loop {
            control.interact().await?;
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(item) = self.pop(role) {
                return Ok(item);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(IDLE_TICK) => {}
                _ = control.token().cancelled() => {}
            }
        }
    }

    pub fn suspend(&self) {
        info!("Suspending queue manager");
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        info!("Resuming queue manager");
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn enable_queue(&self, kind: QueueKind, value: bool) {
        self.inner.lock().enabled[kind.index()] = value;
        if value {
            self.notify.notify_waiters();
        }
    }

    pub fn enable_local_file_queue(&self, value: bool) {
        self.enable_queue(QueueKind::LocalFile, value);
    }

    pub fn enable_local_folder_queue(&self, value: bool) {
        self.enable_queue(QueueKind::LocalFolder, value);
    }

    pub fn enable_remote_file_queue(&self, value: bool) {
        self.enable_queue(QueueKind::RemoteFile, value);
    }

    pub fn enable_remote_folder_queue(&self, value: bool) {
        self.enable_queue(QueueKind::RemoteFolder, value);
    }

    pub fn queue_size(&self) -> usize {
        let inner = self.inner.lock();
        QueueKind::ALL.iter().map(|k| inner.len(*k)).sum()
    }

    /// Nothing queued, nothing waiting for retry and no processor busy.
    pub fn is_idle(&self) -> bool {
        let queued = {
            let inner = self.inner.lock();
            QueueKind::ALL.iter().map(|k| inner.len(*k)).sum::<usize>() + inner.blacklist.len()
        };
        queued == 0 && self.processors.lock().values().all(|s| s.pair.is_none())
    }

    /// Nothing queued and no processor busy; pairs waiting for retry are
    /// not counted.
    pub fn is_active(&self) -> bool {
        self.queue_size() > 0 || self.processors.lock().values().any(|s| s.pair.is_some())
    }

    pub fn get_metrics(&self) -> QueueMetrics {
        let inner = self.inner.lock();
        let mut metrics = QueueMetrics {
            local_folder_queue: inner.len(QueueKind::LocalFolder),
            local_file_queue: inner.len(QueueKind::LocalFile),
            remote_folder_queue: inner.len(QueueKind::RemoteFolder),
            remote_file_queue: inner.len(QueueKind::RemoteFile),
            error_queue: inner.blacklist.len(),
            processors: self.processors.lock().len(),
            ..QueueMetrics::default()
        };
        metrics.total_queue = metrics.local_folder_queue
            + metrics.local_file_queue
            + metrics.remote_folder_queue
            + metrics.remote_file_queue;
        metrics
    }

    /// Ids of the pairs waiting for a retry, with their error count.
    pub fn get_errors(&self) -> Vec<(i64, u32)> {
        let mut errors: Vec<_> = self
            .inner
            .lock()
            .blacklist
            .entries()
            .map(|e| (e.item.id, e.count))
            .collect();
        errors.sort_unstable();
        errors
    }

    pub fn register_processor(&self, name: impl Into<String>) -> usize {
        let id = self.next_worker.fetch_add(1, Ordering::SeqCst);
        self.processors.lock().insert(
            id,
            ProcessorSlot {
                name: name.into(),
                pair: None,
                cancel: None,
            },
        );
        id
    }

    pub fn unregister_processor(&self, worker: usize) {
        self.processors.lock().remove(&worker);
    }

    pub fn set_current_pair(&self, worker: usize, pair: &DocPair, cancel: CancellationToken) {
        if let Some(slot) = self.processors.lock().get_mut(&worker) {
            slot.pair = Some((pair.id, pair.local_path.clone(), pair.folderish));
            slot.cancel = Some(cancel);
        }
    }

    pub fn clear_current_pair(&self, worker: usize) {
        if let Some(slot) = self.processors.lock().get_mut(&worker) {
            slot.pair = None;
            slot.cancel = None;
        }
    }

    fn matching(&self, path: &str, exact_match: bool, files_only: bool) -> Vec<ProcessorInfo> {
        self.processors
            .lock()
            .iter()
            .filter_map(|(worker, slot)| {
                let (id, local_path, folderish) = slot.pair.as_ref()?;
                if files_only && *folderish {
                    return None;
                }
                let hit = if exact_match {
                    local_path == path
                } else {
                    is_under(local_path, path)
                };
                hit.then(|| ProcessorInfo {
                    worker: *worker,
                    name: slot.name.clone(),
                    pair_id: *id,
                    local_path: local_path.clone(),
                })
            })
            .collect()
    }

    /// Processors whose current pair is `path` or lives below it.
    pub fn get_processors_on(&self, path: &str, exact_match: bool) -> Vec<ProcessorInfo> {
        self.matching(path, exact_match, false)
    }

    pub fn has_file_processors_on(&self, path: &str, except: Option<usize>) -> bool {
        self.matching(path, false, true)
            .iter()
            .any(|p| Some(p.worker) != except)
    }

    /// Ask the processors under `path` to give up their pair.
    pub fn interrupt_processors_on(&self, path: &str, exact_match: bool) {
        for info in self.get_processors_on(path, exact_match) {
            info!("Interrupting {} on {:?}", info.name, info.local_path);
            self.cancel_worker(info.worker);
        }
    }

    /// Interrupt whoever is working on pair `id`.
    pub fn cancel_action_on(&self, id: i64) {
        let workers: Vec<usize> = self
            .processors
            .lock()
            .iter()
            .filter(|(_, s)| s.pair.as_ref().map(|p| p.0) == Some(id))
            .map(|(w, _)| *w)
            .collect();
        for worker in workers {
            debug!("Cancelling the action on pair {}", id);
            self.cancel_worker(worker);
        }
    }

    fn cancel_worker(&self, worker: usize) {
        if let Some(cancel) = self
            .processors
            .lock()
            .get(&worker)
            .and_then(|s| s.cancel.as_ref())
        {
            cancel.cancel();
        }
    }
}

impl PairQueue for QueueManager {
    fn push(&self, item: QueueItem) {
        QueueManager::push(self, item);
    }

    fn new_conflict(&self, id: i64) {
        // The processor tries an automatic resolution first
        QueueManager::push(self, QueueItem::new(id, false, PairState::Conflicted));
    }

    fn interrupt_processors_on(&self, path: &str, exact_match: bool) {
        QueueManager::interrupt_processors_on(self, path, exact_match);
    }
}
