//! Everything the processors of one engine share

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ndrive_client::{LocalClient, RemoteFileSystem};
use ndrive_index::PairStateStore;

use crate::events::{EngineEvent, EventBus};
use crate::locks::{FolderLock, PathLocks, ReadonlyLocks};
use crate::metrics::ProcessorMetrics;
use crate::queue_manager::QueueManager;

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Undo local changes the server refuses instead of unsynchronizing them
    pub local_rollback: bool,
    /// Send remotely deleted items to the engine trash
    pub use_trash: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            local_rollback: false,
            use_trash: true,
        }
    }
}

pub struct SyncContext {
    pub store: Arc<PairStateStore>,
    pub local: Arc<LocalClient>,
    pub remote: Arc<dyn RemoteFileSystem>,
    pub queue: Arc<QueueManager>,
    pub events: EventBus,
    pub path_locks: PathLocks,
    pub readonly_locks: ReadonlyLocks,
    pub folder_lock: FolderLock,
    local_rollback: AtomicBool,
    use_trash: AtomicBool,
    metrics: Mutex<HashMap<String, ProcessorMetrics>>,
}

impl SyncContext {
    pub fn new(
        store: Arc<PairStateStore>,
        local: Arc<LocalClient>,
        remote: Arc<dyn RemoteFileSystem>,
        queue: Arc<QueueManager>,
        events: EventBus,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            store,
            local,
            remote,
            queue,
            events,
            path_locks: PathLocks::default(),
            readonly_locks: ReadonlyLocks::default(),
            folder_lock: FolderLock::default(),
            local_rollback: AtomicBool::new(config.local_rollback),
            use_trash: AtomicBool::new(config.use_trash),
            metrics: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_rollback(&self) -> bool {
        self.local_rollback.load(Ordering::Relaxed)
    }

    pub fn set_local_rollback(&self, value: bool) {
        self.local_rollback.store(value, Ordering::Relaxed);
    }

    pub fn use_trash(&self) -> bool {
        self.use_trash.load(Ordering::Relaxed)
    }

    pub fn set_use_trash(&self, value: bool) {
        self.use_trash.store(value, Ordering::Relaxed);
    }

    pub fn emit(&self, event: EngineEvent) {
        self.events.emit(event);
    }

    pub(crate) fn record_metrics(&self, metrics: &ProcessorMetrics) {
        self.metrics
            .lock()
            .insert(metrics.worker.clone(), metrics.clone());
        self.emit(EngineEvent::PairSyncEnded {
            metrics: metrics.clone(),
        });
    }

    /// Last known metrics of every processor, by worker name.
    pub fn processor_metrics(&self) -> Vec<ProcessorMetrics> {
        let mut all: Vec<_> = self.metrics.lock().values().cloned().collect();
        all.sort_by(|a, b| a.worker.cmp(&b.worker));
        all
    }
}
