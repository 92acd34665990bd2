//! Workers draining the queue manager
//!
//! Each processor takes one pair at a time, claims it in the store, looks
//! at both sides again and dispatches on the pair state. Failures are
//! mapped to a retry policy: dropped, postponed, counted as an error or
//! given up.

mod context;
mod local;
mod remote;

pub use context::{ProcessorConfig, SyncContext};

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ndrive_client::{ClientError, LocalFileInfo, RemoteFileInfo};
use ndrive_index::{DocPair, PairState, QueueItem, RemoteUpdate};

use crate::errors::{Result, SyncError};
use crate::events::EngineEvent;
use crate::metrics::ProcessorMetrics;
use crate::queue_manager::{ProcessorRole, QueueKind};
use crate::worker::WorkerControl;

/// Delay before a file whose size is still changing is looked at again.
const COPY_IN_PROGRESS_DELAY: Duration = Duration::from_secs(5);

pub struct Processor {
    ctx: Arc<SyncContext>,
    role: ProcessorRole,
    name: String,
    worker: usize,
    control: WorkerControl,
    metrics: ProcessorMetrics,
    /// Cancelled when the current pair must be given up
    cancel: CancellationToken,
    /// Bytes moved while handling the current pair
    transferred: u64,
}

impl Processor {
    pub fn new(ctx: Arc<SyncContext>, role: ProcessorRole, name: impl Into<String>, control: WorkerControl) -> Self {
        let name = name.into();
        let worker = ctx.queue.register_processor(name.clone());
        Self {
            metrics: ProcessorMetrics::new(name.clone()),
            ctx,
            role,
            name,
            worker,
            cancel: control.token().child_token(),
            control,
            transferred: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owner id of the pairs this processor claims; 0 means unclaimed.
    fn thread_id(&self) -> i64 {
        self.worker as i64 + 1
    }

    pub async fn run(mut self) -> Result<()> {
        info!("{} started", self.name);
        let result = loop {
            let item = match self.ctx.queue.next_item(self.role, &self.control).await {
                Ok(item) => item,
                Err(SyncError::ThreadInterrupt) => break Ok(()),
                Err(e) => break Err(e),
            };
            match self.process(item).await {
                Ok(()) => {}
                Err(SyncError::ThreadInterrupt) => break Ok(()),
                Err(e) => {
                    error!("{} failed on pair {}: {}", self.name, item.id, e);
                }
            }
        };
        self.ctx.queue.unregister_processor(self.worker);
        if let Err(e) = self.ctx.store.release_processor(self.thread_id()) {
            warn!("{} cannot release its pairs: {}", self.name, e);
        }
        info!("{} stopped", self.name);
        result
    }

    /// Handle the queued pairs without waiting for new ones, at most
    /// `limit` of them. Returns how many were handled.
    pub async fn run_until_idle(&mut self, limit: usize) -> Result<usize> {
        let mut handled = 0;
        while handled < limit {
            let Some(item) = self.ctx.queue.pop(self.role) else {
                break;
            };
            match self.process(item).await {
                Ok(()) => {}
                Err(SyncError::ThreadInterrupt) => return Err(SyncError::ThreadInterrupt),
                Err(e) => error!("{} failed on pair {}: {}", self.name, item.id, e),
            }
            handled += 1;
        }
        Ok(handled)
    }

    async fn process(&mut self, item: QueueItem) -> Result<()> {
        let Some(pair) = self.ctx.store.acquire_state(self.thread_id(), item.id)? else {
            debug!("{} cannot acquire pair {}, dropping it", self.name, item.id);
            return Ok(());
        };
        self.cancel = self.control.token().child_token();
        self.transferred = 0;
        self.ctx
            .queue
            .set_current_pair(self.worker, &pair, self.cancel.clone());
        self.metrics.begin(pair.id, &handler_name(pair.pair_state));

        let result = self.handle_pair(pair.clone()).await;
        let outcome = match result {
            Ok(()) => Ok(()),
            Err(e) => self.handle_error(&pair, e).await,
        };

        self.ctx.queue.clear_current_pair(self.worker);
        self.ctx.store.release_state(self.thread_id())?;
        self.metrics.finish(self.transferred);
        self.ctx.record_metrics(&self.metrics);
        outcome
    }

    async fn handle_pair(&mut self, mut pair: DocPair) -> Result<()> {
        if is_skipped(pair.pair_state) {
            debug!("{} skips pair in state {}: {}", self.name, pair.pair_state, pair);
            return Ok(());
        }

        if pair.pair_state.as_str().starts_with("locally") {
            if let Some(remote_ref) = pair.remote_ref.clone() {
                match self.ctx.remote.get_fs_info(&remote_ref, None).await {
                    Ok(info) => {
                        if !pair.folderish
                            && pair.remote_digest.is_some()
                            && info.digest != pair.remote_digest
                        {
                            pair.remote_state = ndrive_index::SideState::Modified;
                        }
                        self.refresh_remote(&pair, Some(info)).await?;
                        match self.ctx.store.get_state_from_id(pair.id)? {
                            Some(fresh) => pair = fresh,
                            None => return Ok(()),
                        }
                        if is_skipped(pair.pair_state) {
                            return Ok(());
                        }
                    }
                    Err(e) if e.is_not_found() => pair.remote_ref = None,
                    Err(e) => return Err(e.into()),
                }
            }
        }

        if let Some(parent) = self.ctx.store.get_state_from_local(&pair.local_parent_path)? {
            if parent.last_error.as_deref() == Some("DEDUP") {
                debug!("Parent of {} is on dedup error, skipping", pair);
                return Ok(());
            }
        }

        if pair.pair_state != PairState::LocallyDeleted
            && pair.local_path != ndrive_client::names::ROOT
            && !self.ctx.local.exists(&pair.local_parent_path)
        {
            let parent = match pair.remote_parent_ref.as_deref() {
                Some(r) => self.ctx.store.get_normal_state_from_remote(r)?,
                None => None,
            };
            match parent {
                Some(parent) if parent.local_path != pair.local_parent_path => {
                    debug!(
                        "Local parent of {} is gone, following it to {:?}",
                        pair, parent.local_path
                    );
                    self.ctx
                        .store
                        .update_local_parent_path(&pair, pair.name(), &parent.local_path)?;
                    match self.ctx.store.get_state_from_id(pair.id)? {
                        Some(fresh) => pair = fresh,
                        None => return Ok(()),
                    }
                }
                _ => {
                    debug!("Local parent of {} is gone, removing the pair", pair);
                    self.ctx.store.remove_state(&pair, false, true)?;
                    return Ok(());
                }
            }
        }

        if self.ctx.folder_lock.blocks(&pair.local_path, self.worker) {
            debug!("{} is under a locked folder", pair);
            return Err(SyncError::PairInterrupt);
        }

        let ctx = self.ctx.clone();
        let _soft_lock = ctx.path_locks.lock(&pair.local_path)?;
        info!("{} executing {} on {}", self.name, handler_name(pair.pair_state), pair);
        self.dispatch(pair).await
    }

    async fn dispatch(&mut self, pair: DocPair) -> Result<()> {
        match pair.pair_state {
            PairState::LocallyCreated => self.synchronize_locally_created(pair, false).await,
            PairState::LocallyResolved => self.synchronize_locally_created(pair, true).await,
            PairState::LocallyModified => self.synchronize_locally_modified(pair).await,
            PairState::LocallyMoved => self.synchronize_locally_moved(pair, true).await,
            PairState::LocallyMovedCreated => self.synchronize_locally_moved_created(pair).await,
            PairState::LocallyMovedRemotelyModified => {
                self.synchronize_locally_moved_remotely_modified(pair).await
            }
            PairState::LocallyDeleted => self.synchronize_locally_deleted(pair).await,
            PairState::RemotelyCreated => self.synchronize_remotely_created(pair).await,
            PairState::RemotelyModified => self.synchronize_remotely_modified(pair).await,
            PairState::RemotelyDeleted => self.synchronize_remotely_deleted(pair).await,
            PairState::Conflicted => self.synchronize_conflicted(pair).await,
            PairState::Deleted | PairState::DeletedUnknown | PairState::UnknownDeleted => {
                debug!("Removing pair in state {}: {}", pair.pair_state, pair);
                self.ctx.store.remove_state(&pair, false, true)?;
                Ok(())
            }
            state => {
                info!("Unhandled pair state {} on {}", state, pair);
                Ok(())
            }
        }
    }

    /// Map a handler failure to its retry policy.
    async fn handle_error(&mut self, pair: &DocPair, err: SyncError) -> Result<()> {
        let err = self.normalize(err);
        let item = QueueItem::from(pair);
        match err {
            SyncError::ThreadInterrupt => {
                self.ctx.queue.push(item);
                Err(SyncError::ThreadInterrupt)
            }
            SyncError::PairInterrupt => {
                debug!("{} interrupted, pushing it back", pair);
                self.ctx
                    .queue
                    .postpone_pair(item, Some(self.ctx.queue.config().interrupt_delay));
                Ok(())
            }
            SyncError::ParentNotSynced { path, parent } => {
                debug!("Parent {} of {} is not synchronized yet", parent, path);
                self.ctx
                    .queue
                    .postpone_pair(item, Some(self.ctx.queue.config().interrupt_delay));
                Ok(())
            }
            SyncError::Client(ClientError::Unauthorized { .. }) => {
                self.giveup_error(pair, "INVALID_CREDENTIALS")?;
                self.ctx.emit(EngineEvent::InvalidAuthentication);
                Ok(())
            }
            SyncError::Client(ClientError::Forbidden(message)) => {
                warn!("Access denied on {}: {}", pair, message);
                Ok(())
            }
            SyncError::Client(ClientError::NotFound(reference)) => {
                debug!("Remote item {} of {} not found, dropping", reference, pair);
                Ok(())
            }
            SyncError::Client(ClientError::DuplicationDisabled(path)) => {
                warn!("De-duplication is disabled, giving up on {:?}", path);
                self.giveup_error(pair, "DEDUP")
            }
            SyncError::Client(ref e @ ClientError::CorruptedFile { .. }) => {
                warn!("Corrupted transfer for {}: {}", pair, e);
                self.increase_error(pair, "CORRUPT", Some(&e.to_string()))
            }
            SyncError::Client(ref e) if e.is_connection_error() => {
                info!("Connection error on {}: {}", pair, e);
                self.postpone(pair, "CONNECTION_ERROR", None)
            }
            SyncError::Client(ref e) if e.status().is_some() => {
                let status = e.status().unwrap_or_default();
                match status {
                    404 => {
                        debug!("Remote side of {} is gone (404)", pair);
                        self.ctx.store.remove_state(pair, false, true)?;
                        Ok(())
                    }
                    409 => self.postpone(pair, "CONFLICT", None),
                    500 => self.increase_error(pair, "SERVER_ERROR", Some(&e.to_string())),
                    502 | 503 => self.postpone(pair, "SERVER_UNAVAILABLE", None),
                    _ => self.increase_error(
                        pair,
                        &format!("SYNC_HANDLER_{}", handler_name(pair.pair_state)),
                        Some(&e.to_string()),
                    ),
                }
            }
            ref e if e.is_no_space() => {
                error!("No space left on device while handling {}", pair);
                self.ctx.queue.suspend();
                self.ctx.emit(EngineEvent::NoSpaceLeftOnDevice);
                self.increase_error(pair, "NO_SPACE_LEFT_ON_DEVICE", None)
            }
            ref e if e.is_permission_denied() => {
                info!("File in use or not accessible: {}", pair);
                self.ctx.emit(EngineEvent::ErrorOpenedFile {
                    path: pair.local_path.clone(),
                });
                self.postpone(pair, "USED_FILE", None)
            }
            ref e if e.is_not_found() => {
                debug!("Local side of {} vanished: {}", pair, e);
                self.ctx.store.remove_state(pair, false, true)?;
                Ok(())
            }
            e => {
                error!("Unknown error on {}: {}", pair, e);
                self.increase_error(
                    pair,
                    &format!("SYNC_HANDLER_{}", handler_name(pair.pair_state)),
                    Some(&e.to_string()),
                )
            }
        }
    }

    /// A cancelled transfer is a worker stop or a pair interrupt depending
    /// on which token fired.
    fn normalize(&self, err: SyncError) -> SyncError {
        match err {
            SyncError::Client(ClientError::Interrupted) => {
                if self.control.is_stopped() {
                    SyncError::ThreadInterrupt
                } else {
                    SyncError::PairInterrupt
                }
            }
            e => e,
        }
    }

    fn increase_error(&self, pair: &DocPair, reason: &str, details: Option<&str>) -> Result<()> {
        self.ctx.store.increase_error(pair, reason, details, 1)?;
        let refreshed = self
            .ctx
            .store
            .get_state_from_id(pair.id)?
            .unwrap_or_else(|| pair.clone());
        self.ctx.queue.push_error(&refreshed, None);
        Ok(())
    }

    /// Give up right away: the pair goes over the error threshold.
    fn giveup_error(&self, pair: &DocPair, reason: &str) -> Result<()> {
        let incr = self.ctx.queue.config().max_errors + 1;
        self.ctx.store.increase_error(pair, reason, None, incr)?;
        let mut refreshed = self
            .ctx
            .store
            .get_state_from_id(pair.id)?
            .unwrap_or_else(|| pair.clone());
        refreshed.error_count = refreshed.error_count.max(incr);
        self.ctx.queue.push_error(&refreshed, None);
        Ok(())
    }

    /// Retry later without counting an error.
    fn postpone(&self, pair: &DocPair, reason: &str, delay: Option<Duration>) -> Result<()> {
        debug!("Postponing {} ({})", pair, reason);
        self.ctx.store.increase_error(pair, reason, None, 0)?;
        self.ctx.queue.postpone_pair(QueueItem::from(pair), delay);
        Ok(())
    }

    /// Merge fresh remote info into the pair without queueing it.
    async fn refresh_remote(&self, pair: &DocPair, info: Option<RemoteFileInfo>) -> Result<()> {
        let info = match info {
            Some(info) => info,
            None => {
                let remote_ref = pair.remote_ref.as_deref().ok_or_else(|| {
                    SyncError::IllegalState(format!("no remote ref on {}", pair))
                })?;
                self.ctx
                    .remote
                    .get_fs_info(remote_ref, pair.remote_parent_ref.as_deref())
                    .await?
            }
        };
        self.ctx.store.update_remote_state(
            pair,
            &info,
            None,
            RemoteUpdate {
                versioned: false,
                queue: false,
                ..RemoteUpdate::default()
            },
        )?;
        Ok(())
    }

    /// Write the local side of `pair` from `info`, keeping `pair` in step.
    fn refresh_local_state(&self, pair: &mut DocPair, info: &LocalFileInfo) -> Result<()> {
        if pair.local_digest.is_none() && !pair.folderish {
            pair.local_digest = info.get_digest(self.ctx.local.digest_algorithm(), Some(&self.cancel))?;
        }
        self.ctx.store.update_local_state(pair, info, false, false)?;
        pair.local_path = info.path.clone();
        pair.local_name = Some(info.name.clone());
        pair.local_parent_path = ndrive_client::names::parent_path(&info.path);
        pair.last_local_updated = Some(info.last_modification_time);
        Ok(())
    }

    fn get_normal_state_from_remote_ref(&self, remote_ref: Option<&str>) -> Result<Option<DocPair>> {
        match remote_ref {
            Some(r) => Ok(self.ctx.store.get_normal_state_from_remote(r)?),
            None => Ok(None),
        }
    }

    /// Mirror the server permissions on the local item.
    fn handle_readonly(&self, pair: &DocPair) -> Result<()> {
        if pair.folderish && cfg!(windows) {
            return Ok(());
        }
        if pair.is_readonly() {
            debug!("Setting {} as readonly", pair.local_path);
            self.ctx.local.set_readonly(&pair.local_path)?;
        } else {
            self.ctx.local.unset_readonly(&pair.local_path)?;
        }
        Ok(())
    }

    /// A twin of `pair` held back by a name clash can go now.
    fn search_for_dedup(&self, pair: &DocPair, name: Option<&str>) -> Result<()> {
        let Some(remote_parent_ref) = pair.remote_parent_ref.as_deref() else {
            return Ok(());
        };
        let name = name.unwrap_or_else(|| pair.name());
        if let Some(twin) = self.ctx.store.get_dedupe_pair(name, remote_parent_ref, pair.id)? {
            debug!("Releasing duplicate {}", twin);
            self.ctx.store.reset_error(&twin, None)?;
        }
        Ok(())
    }

    /// Claim `path` as the folder being moved or deleted, once no file
    /// processor works below it.
    async fn set_local_folder_lock(&self, path: &str) -> Result<()> {
        while self.ctx.queue.has_file_processors_on(path, Some(self.worker)) {
            debug!("Waiting for file processors under {:?}", path);
            self.control.sleep(Duration::from_secs(1)).await?;
        }
        self.ctx.folder_lock.set(path, self.worker);
        Ok(())
    }

    fn check_interrupted(&self) -> Result<()> {
        if self.control.is_stopped() {
            return Err(SyncError::ThreadInterrupt);
        }
        if self.cancel.is_cancelled() {
            return Err(SyncError::PairInterrupt);
        }
        Ok(())
    }
}

fn is_skipped(state: PairState) -> bool {
    matches!(state, PairState::Synchronized | PairState::Unsynchronized) || state.is_parent_deleted()
}

fn handler_name(state: PairState) -> String {
    format!("synchronize_{}", state.as_str())
}

/// Start the processors of an engine: one per queue, then generic ones.
pub fn spawn_processors(
    ctx: Arc<SyncContext>,
    control: &WorkerControl,
) -> Vec<JoinHandle<Result<()>>> {
    let total = ctx.queue.config().max_processors.max(1);
    let mut roles: Vec<(ProcessorRole, String)> = Vec::with_capacity(total);
    if total >= 4 {
        for kind in [
            QueueKind::LocalFolder,
            QueueKind::LocalFile,
            QueueKind::RemoteFolder,
            QueueKind::RemoteFile,
        ] {
            roles.push((ProcessorRole::Dedicated(kind), kind.processor_name().to_string()));
        }
    }
    let generic = total - roles.len();
    for n in 0..generic {
        roles.push((ProcessorRole::Generic, format!("GenericProcessor#{}", n)));
    }

    roles
        .into_iter()
        .map(|(role, name)| {
            let processor = Processor::new(ctx.clone(), role, name, control.child());
            tokio::spawn(processor.run())
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ndrive_client::remote::memory::TOP_LEVEL_ID;
    use ndrive_client::{MemoryRemote, RemoteFileSystem};
    use ndrive_index::{PairStateStore, StoreConfig};
    use tempfile::TempDir;

    use crate::events::EventBus;
    use crate::queue_manager::{QueueConfig, QueueManager};

    pub(crate) struct Fixture {
        pub _dir: TempDir,
        pub ctx: Arc<SyncContext>,
        pub remote: Arc<MemoryRemote>,
        /// Remote id of the `Workspace` sync root
        pub root_id: String,
        pub root_pair: i64,
    }

    /// Bind an existing local folder to a remote folder, synchronized.
    pub(crate) fn bind_folder(
        store: &PairStateStore,
        local: &ndrive_client::LocalClient,
        path: &str,
        info: &RemoteFileInfo,
        remote_parent_path: &str,
    ) -> i64 {
        let parent = ndrive_client::names::parent_path(path);
        let id = store
            .insert_local_state(&local.get_info(path).unwrap(), Some(&parent))
            .unwrap();
        let pair = store.get_state_from_id(id).unwrap().unwrap();
        store
            .update_remote_state(&pair, info, Some(remote_parent_path), RemoteUpdate::forced())
            .unwrap();
        let pair = store.get_state_from_id(id).unwrap().unwrap();
        assert!(store.synchronize_state(&pair, None, false).unwrap());
        local.set_remote_id(path, &info.uid).unwrap();
        id
    }

    /// A bound engine with the top level folder on `/` and the `Workspace`
    /// sync root on `/Workspace`; no processor is running.
    pub(crate) async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        let store = Arc::new(
            PairStateStore::open(dir.path().join("engine.db"), StoreConfig::default()).unwrap(),
        );
        let local = Arc::new(ndrive_client::LocalClient::new(&root).with_trash(None));
        let remote = Arc::new(MemoryRemote::new("http://memory/nuxeo/", "alice"));
        let workspace = remote.create_sync_root("Workspace").unwrap();

        let top = remote.get_filesystem_root_info().await.unwrap();
        let info = local.get_info("/").unwrap();
        let id = store.insert_local_state(&info, Some("")).unwrap();
        let pair = store.get_state_from_id(id).unwrap().unwrap();
        store
            .update_remote_state(&pair, &top, Some(""), RemoteUpdate::forced())
            .unwrap();
        let pair = store.get_state_from_id(id).unwrap().unwrap();
        store.synchronize_state(&pair, None, false).unwrap();
        local.set_remote_id("/", &top.uid).unwrap();

        local.make_folder("/", "Workspace").unwrap();
        let root_pair = bind_folder(&store, &local, "/Workspace", &workspace, &format!("/{}", TOP_LEVEL_ID));

        let events = EventBus::new();
        let queue = Arc::new(QueueManager::new(QueueConfig::default(), events.clone()));
        store.set_queue(queue.clone());
        let ctx = Arc::new(SyncContext::new(
            store,
            local,
            remote.clone(),
            queue,
            events,
            ProcessorConfig {
                local_rollback: false,
                use_trash: false,
            },
        ));
        Fixture {
            _dir: dir,
            ctx,
            remote,
            root_id: workspace.uid,
            root_pair,
        }
    }

    impl Fixture {
        pub fn processor(&self) -> Processor {
            Processor::new(
                self.ctx.clone(),
                ProcessorRole::Generic,
                "GenericProcessor#0",
                WorkerControl::new(),
            )
        }

        /// Process queued pairs until the queues are empty.
        pub async fn drain(&self, processor: &mut Processor) {
            for _ in 0..100 {
                let Some(item) = self.ctx.queue.pop(ProcessorRole::Generic) else {
                    return;
                };
                processor.process(item).await.unwrap();
            }
            panic!("queue did not drain");
        }

        pub fn pair(&self, path: &str) -> DocPair {
            self.ctx.store.get_state_from_local(path).unwrap().unwrap()
        }

        /// Record a file created locally under `parent`, as the local
        /// watcher would.
        pub fn create_local_file(&self, parent: &str, name: &str, content: &[u8]) -> String {
            let path = self.ctx.local.make_file(parent, name, Some(content)).unwrap();
            let info = self.ctx.local.get_info(&path).unwrap();
            self.ctx.store.insert_local_state(&info, Some(parent)).unwrap();
            path
        }
    }

    #[tokio::test]
    async fn test_skips_terminal_states() {
        let fx = fixture().await;
        let mut processor = fx.processor();
        processor
            .process(QueueItem::new(fx.root_pair, true, PairState::Synchronized))
            .await
            .unwrap();
        assert_eq!(fx.pair("/Workspace").pair_state, PairState::Synchronized);
        assert_eq!(fx.pair("/Workspace").processor, 0);
    }

    #[tokio::test]
    async fn test_soft_lock_interrupts_and_postpones() {
        let fx = fixture().await;
        fx.create_local_file("/Workspace", "busy.txt", b"data");
        let item = fx.ctx.queue.pop(ProcessorRole::Generic).unwrap();

        let _held = fx.ctx.path_locks.lock("/Workspace/busy.txt").unwrap();
        let mut processor = fx.processor();
        processor.process(item).await.unwrap();
        assert!(fx.ctx.queue.is_on_error(item.id));
        assert!(fx.remote.child_by_name(&fx.root_id, "busy.txt").is_none());
    }

    #[tokio::test]
    async fn test_duplication_disabled_gives_up() {
        let fx = fixture().await;
        let mut rx = fx.ctx.events.subscribe();
        let pair = fx.pair("/Workspace");
        let mut processor = fx.processor();
        processor
            .handle_error(&pair, SyncError::Client(ClientError::DuplicationDisabled("/x".into())))
            .await
            .unwrap();
        let pair = fx.pair("/Workspace");
        assert_eq!(pair.last_error.as_deref(), Some("DEDUP"));
        assert!(pair.error_count > fx.ctx.queue.config().max_errors);
        assert_eq!(rx.try_recv().unwrap(), EngineEvent::NewError { id: pair.id });
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let fx = fixture().await;
        let mut rx = fx.ctx.events.subscribe();
        let pair = fx.pair("/Workspace");
        let mut processor = fx.processor();

        processor
            .handle_error(&pair, SyncError::Client(ClientError::http(500, "u", "boom")))
            .await
            .unwrap();
        let errored = fx.pair("/Workspace");
        assert_eq!(errored.last_error.as_deref(), Some("SERVER_ERROR"));
        assert_eq!(errored.error_count, 1);
        assert!(fx.ctx.queue.is_on_error(pair.id));

        processor
            .handle_error(&pair, SyncError::Client(ClientError::http(503, "u", "later")))
            .await
            .unwrap();
        assert_eq!(fx.pair("/Workspace").error_count, 1);
        assert_eq!(fx.pair("/Workspace").last_error.as_deref(), Some("SERVER_UNAVAILABLE"));

        let no_space = SyncError::Io(std::io::Error::from_raw_os_error(libc::ENOSPC));
        processor.handle_error(&pair, no_space).await.unwrap();
        assert!(fx.ctx.queue.is_paused());
        assert_eq!(rx.try_recv().unwrap(), EngineEvent::NoSpaceLeftOnDevice);

        let unauthorized = SyncError::Client(ClientError::Unauthorized {
            server: "srv".into(),
            user: "alice".into(),
            code: 401,
        });
        processor.handle_error(&pair, unauthorized).await.unwrap();
        assert_eq!(fx.pair("/Workspace").last_error.as_deref(), Some("INVALID_CREDENTIALS"));
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&EngineEvent::InvalidAuthentication));

        let interrupted = processor
            .handle_error(&pair, SyncError::ThreadInterrupt)
            .await;
        assert!(matches!(interrupted, Err(SyncError::ThreadInterrupt)));
    }

    #[tokio::test]
    async fn test_run_stops_on_control() {
        let fx = fixture().await;
        let control = WorkerControl::new();
        let handles = spawn_processors(fx.ctx.clone(), &control);
        assert_eq!(handles.len(), 4);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fx.ctx.queue.get_metrics().processors, 4);
        control.stop();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(fx.ctx.queue.get_metrics().processors, 0);
    }
}
