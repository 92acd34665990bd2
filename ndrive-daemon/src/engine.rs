//! One bound server account
//!
//! The engine owns the store, the clients and the queue of a sync root and
//! runs its workers: both watchers, the processors and a small monitor
//! that reports when the queue drains.

use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use ndrive_client::names::{basename, parent_path, ROOT};
use ndrive_client::{IgnoreRules, LocalClient, RemoteFileSystem};
use ndrive_index::{DocPair, ItemKind, PairStateStore, RemoteUpdate, StoreConfig};
use ndrive_sync::{
    spawn_processors, EngineEvent, EventBus, ProcessorConfig, QueueConfig, QueueManager, QueueMetrics,
    SyncContext, SyncError, WorkerControl,
};

use crate::errors::{EngineError, Result};
use crate::local_watcher::{LocalWatcher, LocalWatcherConfig};
use crate::remote_watcher::{RemoteWatcher, RemoteWatcherConfig};

const FS_MARKER_NAME: &str = "ndrive-marker";
const FS_MARKER_VALUE: &str = "ndrive-test";
const MONITOR_TICK: Duration = Duration::from_secs(1);

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Identifies this installation in the root id of bound folders
    pub device_id: String,
    pub max_processors: usize,
    pub max_errors: u32,
    pub error_interval: Duration,
    pub local_rollback: bool,
    pub use_trash: bool,
    pub store: StoreConfig,
    pub ignore: IgnoreRules,
    pub local_watcher: LocalWatcherConfig,
    pub remote_watcher: RemoteWatcherConfig,
    /// Time given to the workers to exit before they are aborted
    pub stop_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            max_processors: 4,
            max_errors: 3,
            error_interval: Duration::from_secs(30),
            local_rollback: false,
            use_trash: true,
            store: StoreConfig::default(),
            ignore: IgnoreRules::default(),
            local_watcher: LocalWatcherConfig::default(),
            remote_watcher: RemoteWatcherConfig::default(),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// Connectivity flags shared by the engine and its watchers.
pub struct EngineState {
    ctx: Arc<SyncContext>,
    paused: AtomicBool,
    offline: AtomicBool,
    invalid_credentials: AtomicBool,
}

impl EngineState {
    fn new(ctx: Arc<SyncContext>) -> Self {
        Self {
            ctx,
            paused: AtomicBool::new(false),
            offline: AtomicBool::new(false),
            invalid_credentials: AtomicBool::new(false),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Going offline holds the queue until the server answers again.
    pub fn set_offline(&self, value: bool) {
        if self.offline.swap(value, Ordering::SeqCst) == value {
            return;
        }
        if value {
            warn!("Engine is offline");
            self.ctx.queue.suspend();
            self.ctx.emit(EngineEvent::Offline);
        } else {
            info!("Engine is back online");
            if !self.is_paused() {
                self.ctx.queue.resume();
            }
            self.ctx.emit(EngineEvent::Online);
        }
    }

    pub fn has_invalid_credentials(&self) -> bool {
        self.invalid_credentials.load(Ordering::SeqCst)
    }

    pub fn set_invalid_credentials(&self, value: bool) {
        if self.invalid_credentials.swap(value, Ordering::SeqCst) != value && value {
            self.ctx.emit(EngineEvent::InvalidAuthentication);
        }
    }
}

/// Counters reported by `status`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineMetrics {
    pub sync_files: u64,
    pub sync_folders: u64,
    pub syncing: u64,
    pub conflicted: u64,
    pub error: u64,
    pub unsynchronized: u64,
    pub files_size: u64,
    pub invalid_credentials: bool,
}

/// Snapshot of an engine
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub uid: String,
    pub local_folder: PathBuf,
    pub server_url: String,
    pub user: String,
    pub running: bool,
    pub paused: bool,
    pub offline: bool,
    pub last_sync_date: Option<String>,
    pub queue: QueueMetrics,
    pub metrics: EngineMetrics,
}

pub struct Engine {
    uid: String,
    config: EngineConfig,
    data_dir: PathBuf,
    ctx: Arc<SyncContext>,
    state: Arc<EngineState>,
    local_watcher: Arc<LocalWatcher>,
    remote_watcher: Arc<RemoteWatcher>,
    control: parking_lot::Mutex<WorkerControl>,
    running: Arc<RwLock<bool>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("uid", &self.uid)
            .field("data_dir", &self.data_dir)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Open the engine database under `data_dir` and wire the components.
    /// Nothing runs until [`Engine::start`].
    pub fn new(
        uid: impl Into<String>,
        local_folder: impl Into<PathBuf>,
        data_dir: impl Into<PathBuf>,
        remote: Arc<dyn RemoteFileSystem>,
        config: EngineConfig,
    ) -> Result<Self> {
        let uid = uid.into();
        let local_folder = local_folder.into();
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;

        let store = Arc::new(PairStateStore::open(
            data_dir.join(format!("ndrive_{}.db", uid)),
            config.store.clone(),
        )?);
        store.reinit_processors()?;

        let trash = config.use_trash.then(|| data_dir.join("trash").join(&uid));
        let local = Arc::new(
            LocalClient::new(&local_folder)
                .with_digest_algorithm(config.store.digest_algorithm)
                .with_ignore_rules(config.ignore.clone())
                .with_trash(trash),
        );

        let events = EventBus::new();
        let queue = Arc::new(QueueManager::new(
            QueueConfig {
                max_processors: config.max_processors,
                max_errors: config.max_errors,
                error_interval: config.error_interval,
                ..QueueConfig::default()
            },
            events.clone(),
        ));
        store.set_queue(queue.clone());

        let ctx = Arc::new(SyncContext::new(
            store,
            local,
            remote,
            queue,
            events,
            ProcessorConfig {
                local_rollback: config.local_rollback,
                use_trash: config.use_trash,
            },
        ));
        let state = Arc::new(EngineState::new(ctx.clone()));
        let local_watcher = Arc::new(LocalWatcher::new(ctx.clone(), config.local_watcher.clone()));
        let remote_watcher = Arc::new(RemoteWatcher::new(
            ctx.clone(),
            state.clone(),
            config.remote_watcher.clone(),
        ));

        debug!("Engine {} created for {}", uid, local_folder.display());
        Ok(Self {
            uid,
            config,
            data_dir,
            ctx,
            state,
            local_watcher,
            remote_watcher,
            control: parking_lot::Mutex::new(WorkerControl::new()),
            running: Arc::new(RwLock::new(false)),
            tasks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn local_folder(&self) -> &Path {
        self.ctx.local.base_folder()
    }

    pub fn server_url(&self) -> &str {
        self.ctx.remote.server_url()
    }

    pub fn user(&self) -> &str {
        self.ctx.remote.user_id()
    }

    pub fn store(&self) -> &PairStateStore {
        &self.ctx.store
    }

    pub fn local(&self) -> &LocalClient {
        &self.ctx.local
    }

    pub fn remote(&self) -> &Arc<dyn RemoteFileSystem> {
        &self.ctx.remote
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    pub fn state(&self) -> &Arc<EngineState> {
        &self.state
    }

    pub fn local_watcher(&self) -> &LocalWatcher {
        &self.local_watcher
    }

    pub fn remote_watcher(&self) -> &RemoteWatcher {
        &self.remote_watcher
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.ctx.events.subscribe()
    }

    /// Value of the root xattr written on the local folder.
    pub fn root_id(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.server_url(),
            self.user(),
            self.config.device_id,
            self.uid
        )
    }

    /// Prepare the local folder and record the top level folder pair.
    pub async fn bind(&self) -> Result<()> {
        let folder = self.local_folder().to_path_buf();
        std::fs::create_dir_all(&folder)?;
        self.check_fs_marker()?;

        if let Some(existing) = self.ctx.local.get_root_id() {
            let mut parts = existing.split('|');
            let server = parts.next().unwrap_or_default().to_string();
            let user = parts.next().unwrap_or_default().to_string();
            if server != self.server_url() || user != self.user() {
                return Err(EngineError::RootAlreadyBindWithDifferentAccount { user, server });
            }
        }

        self.check_root().await?;
        self.ctx.local.set_root_id(&self.root_id())?;
        info!("Engine {} bound to {} as {}", self.uid, self.server_url(), self.user());
        Ok(())
    }

    /// Forget the binding: local metadata and the engine database go away.
    pub async fn unbind(&self) -> Result<()> {
        self.stop().await?;
        if self.local_folder().exists() {
            if let Err(e) = self.ctx.local.clean_xattr_root() {
                warn!("Cannot clean metadata of {}: {}", self.local_folder().display(), e);
            }
        }
        let db = self.ctx.store.path().to_path_buf();
        for path in [db.clone(), db.with_extension("db-wal"), db.with_extension("db-shm")] {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        let trash = self.data_dir.join("trash").join(&self.uid);
        if trash.exists() {
            std::fs::remove_dir_all(&trash)?;
        }
        info!("Engine {} unbound", self.uid);
        Ok(())
    }

    /// Fail with `InvalidDrive` when the local folder cannot carry xattrs.
    pub fn check_fs_marker(&self) -> Result<()> {
        let local = &self.ctx.local;
        if !local.exists(ROOT) {
            return Ok(());
        }
        let invalid = || EngineError::InvalidDrive(self.local_folder().to_path_buf());
        local
            .set_remote_id_named(ROOT, FS_MARKER_VALUE, FS_MARKER_NAME)
            .map_err(|_| invalid())?;
        let read = local.get_remote_id_named(ROOT, FS_MARKER_NAME);
        local
            .remove_remote_id_named(ROOT, FS_MARKER_NAME)
            .map_err(|_| invalid())?;
        if read.as_deref() != Some(FS_MARKER_VALUE) {
            return Err(invalid());
        }
        Ok(())
    }

    /// Record the top level folder pair when the database is new.
    async fn check_root(&self) -> Result<()> {
        let store = &self.ctx.store;
        if store.get_state_from_local(ROOT)?.is_some() {
            return Ok(());
        }
        let remote_info = self.ctx.remote.get_filesystem_root_info().await?;
        let local_info = self.ctx.local.get_info(ROOT)?;
        let id = store.insert_local_state(&local_info, Some(""))?;
        let pair = self.pair(id)?;
        store.update_remote_state(&pair, &remote_info, Some(""), RemoteUpdate::unversioned())?;
        let pair = self.pair(id)?;
        store.synchronize_state(&pair, None, false)?;
        self.ctx.local.set_remote_id(ROOT, &remote_info.uid)?;
        debug!("Top level folder {} bound to {}", remote_info.uid, ROOT);
        Ok(())
    }

    fn pair(&self, id: i64) -> Result<DocPair> {
        self.ctx
            .store
            .get_state_from_id(id)?
            .ok_or_else(|| SyncError::IllegalState(format!("unknown pair {}", id)).into())
    }

    /// Start the watchers and the processors.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.write().await;
        if *running {
            return Err(EngineError::AlreadyRunning);
        }
        info!("Starting engine {} on {}", self.uid, self.local_folder().display());

        self.check_fs_marker()?;
        self.check_root().await?;
        self.ctx.store.register_queue_manager(self.ctx.queue.clone())?;
        if !self.state.is_paused() && !self.state.is_offline() {
            self.ctx.queue.resume();
        }

        let control = WorkerControl::new();
        *self.control.lock() = control.clone();
        let mut tasks = self.tasks.lock().await;

        let watcher = self.local_watcher.clone();
        let watcher_control = control.child();
        tasks.push(tokio::spawn(async move {
            match watcher.run(watcher_control).await {
                Err(e) if !e.is_interrupt() => error!("LocalWatcher failed: {}", e),
                _ => debug!("LocalWatcher stopped"),
            }
        }));

        let watcher = self.remote_watcher.clone();
        let watcher_control = control.child();
        tasks.push(tokio::spawn(async move {
            match watcher.run(watcher_control).await {
                Err(e) if !e.is_interrupt() => error!("RemoteWatcher failed: {}", e),
                _ => debug!("RemoteWatcher stopped"),
            }
        }));

        for handle in spawn_processors(self.ctx.clone(), &control) {
            tasks.push(tokio::spawn(async move {
                match handle.await {
                    Ok(Err(SyncError::ThreadInterrupt)) | Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("Processor failed: {}", e),
                    Err(e) => error!("Processor task failed: {}", e),
                }
            }));
        }

        tasks.push(tokio::spawn(monitor(self.ctx.clone(), control.child())));

        *running = true;
        self.ctx.emit(EngineEvent::SyncStarted);
        info!("Engine {} started", self.uid);
        Ok(())
    }

    /// Stop every worker, aborting those still busy after the timeout.
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.write().await;
        if !*running {
            return Ok(());
        }
        info!("Stopping engine {}", self.uid);
        self.control.lock().stop();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(self.config.stop_timeout, task).await.is_err() {
                warn!("A worker of engine {} did not stop in time, aborting it", self.uid);
                abort.abort();
            }
        }

        *running = false;
        info!("Engine {} stopped", self.uid);
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub fn suspend(&self) {
        if self.state.paused.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Suspending engine {}", self.uid);
        self.ctx.queue.suspend();
        self.control.lock().suspend();
        self.ctx.emit(EngineEvent::SyncSuspended);
    }

    pub fn resume(&self) {
        if !self.state.paused.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Resuming engine {}", self.uid);
        if !self.state.is_offline() {
            self.ctx.queue.resume();
        }
        self.control.lock().resume();
        self.ctx.emit(EngineEvent::SyncResumed);
    }

    pub fn is_paused(&self) -> bool {
        self.state.is_paused()
    }

    pub fn is_offline(&self) -> bool {
        self.state.is_offline()
    }

    pub fn set_offline(&self, value: bool) {
        self.state.set_offline(value);
    }

    pub fn has_invalid_credentials(&self) -> bool {
        self.state.has_invalid_credentials()
    }

    pub fn set_invalid_credentials(&self, value: bool) {
        self.state.set_invalid_credentials(value);
    }

    pub fn local_rollback(&self) -> bool {
        self.ctx.local_rollback()
    }

    pub fn set_local_rollback(&self, value: bool) {
        self.ctx.set_local_rollback(value);
    }

    pub fn use_trash(&self) -> bool {
        self.ctx.use_trash()
    }

    pub fn set_use_trash(&self, value: bool) {
        self.ctx.set_use_trash(value);
    }

    /// Stop synchronizing the remote subtree at `path`.
    pub fn add_filter(&self, path: &str) -> Result<()> {
        let store = &self.ctx.store;
        store.add_filter(path)?;
        let path = path.trim_end_matches('/');
        if let Some(pair) = store.get_state_from_remote_with_path(basename(path), &parent_path(path))? {
            info!("Filtering {}", pair);
            store.delete_remote_state(&pair)?;
        }
        Ok(())
    }

    /// Synchronize the remote subtree at `path` again at the next poll.
    pub fn remove_filter(&self, path: &str) -> Result<()> {
        self.ctx.store.remove_filter(path)?;
        self.ctx.store.add_path_to_scan(path.trim_end_matches('/'))?;
        Ok(())
    }

    /// Clear the error of a pair and queue it again.
    pub fn retry_pair(&self, row_id: i64) -> Result<()> {
        let pair = self.pair(row_id)?;
        self.ctx.queue.remove_error(row_id);
        self.ctx.store.reset_error(&pair, None)?;
        Ok(())
    }

    pub fn unsynchronize_pair(&self, row_id: i64, reason: Option<&str>) -> Result<()> {
        let pair = self.pair(row_id)?;
        self.ctx.queue.remove_error(row_id);
        self.ctx.store.unsynchronize_state(&pair, reason, true)?;
        Ok(())
    }

    /// Keep the local side of a conflict.
    pub fn resolve_with_local(&self, row_id: i64) -> Result<()> {
        let pair = self.pair(row_id)?;
        self.ctx.store.force_local(&pair)?;
        Ok(())
    }

    /// Keep the remote side of a conflict.
    pub fn resolve_with_remote(&self, row_id: i64) -> Result<()> {
        let pair = self.pair(row_id)?;
        self.ctx.store.force_remote(&pair)?;
        Ok(())
    }

    /// Keep both: the local file is copied under a new name, then the
    /// remote version replaces the original.
    pub fn resolve_with_duplicate(&self, row_id: i64) -> Result<()> {
        let pair = self.pair(row_id)?;
        let local = &self.ctx.local;
        let duplicate = local.duplicate_file(&pair.local_path)?;
        info!("Duplicated {} to {}", pair.local_path, duplicate);
        let info = local.get_info(&duplicate)?;
        match self.ctx.store.insert_local_state(&info, Some(&pair.local_parent_path)) {
            Ok(_) | Err(ndrive_index::StoreError::DuplicatePair(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.ctx.store.force_remote(&pair)?;
        Ok(())
    }

    pub fn cancel_action_on(&self, row_id: i64) {
        self.ctx.queue.cancel_action_on(row_id);
    }

    pub fn get_conflicts(&self) -> Result<Vec<DocPair>> {
        Ok(self.ctx.store.get_conflicts()?)
    }

    pub fn get_errors(&self) -> Result<Vec<DocPair>> {
        Ok(self.ctx.store.get_errors()?)
    }

    pub fn get_metrics(&self) -> Result<EngineMetrics> {
        let store = &self.ctx.store;
        Ok(EngineMetrics {
            sync_files: store.get_sync_count(Some(ItemKind::File))?,
            sync_folders: store.get_sync_count(Some(ItemKind::Folder))?,
            syncing: store.get_syncing_count()?,
            conflicted: store.get_conflict_count()?,
            error: store.get_error_count()?,
            unsynchronized: store.get_unsynchronized_count()?,
            files_size: store.get_global_size()?,
            invalid_credentials: self.has_invalid_credentials(),
        })
    }

    pub async fn get_status(&self) -> Result<EngineStatus> {
        Ok(EngineStatus {
            uid: self.uid.clone(),
            local_folder: self.local_folder().to_path_buf(),
            server_url: self.server_url().to_string(),
            user: self.user().to_string(),
            running: self.is_running().await,
            paused: self.is_paused(),
            offline: self.is_offline(),
            last_sync_date: self.ctx.store.get_config("last_sync_date")?,
            queue: self.ctx.queue.get_metrics(),
            metrics: self.get_metrics()?,
        })
    }

    /// Wait until the queue stays idle for a few ticks. Returns false on
    /// timeout.
    pub async fn wait_sync(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut idle_ticks = 0;
        while tokio::time::Instant::now() < deadline {
            if self.ctx.queue.is_idle() {
                idle_ticks += 1;
                if idle_ticks >= 5 {
                    return true;
                }
            } else {
                idle_ticks = 0;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }
}

/// Emit `SyncCompleted` each time the queue drains after some work.
async fn monitor(ctx: Arc<SyncContext>, control: WorkerControl) {
    let mut was_active = false;
    loop {
        if control.sleep(MONITOR_TICK).await.is_err() {
            return;
        }
        let active = ctx.queue.is_active();
        if was_active && !active {
            let now = Utc::now().to_rfc3339();
            if let Err(e) = ctx.store.update_config("last_sync_date", Some(&now)) {
                warn!("Cannot record the last sync date: {}", e);
            }
            ctx.emit(EngineEvent::SyncCompleted);
        }
        was_active = active;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ndrive_client::{MemoryRemote, RemoteFileInfo};
    use ndrive_index::PairState;
    use tempfile::TempDir;

    pub(crate) struct Fixture {
        pub _dir: TempDir,
        pub engine: Arc<Engine>,
        pub remote: Arc<MemoryRemote>,
        /// The `Workspace` sync root
        pub workspace: RemoteFileInfo,
    }

    /// A bound engine with the top level folder on `/` and the `Workspace`
    /// sync root on `/Workspace`; no worker is running.
    pub(crate) async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryRemote::new("http://memory/nuxeo/", "alice"));
        let workspace = remote.create_sync_root("Workspace").unwrap();
        let engine = Arc::new(
            Engine::new(
                "engine-1",
                dir.path().join("root"),
                dir.path().join("data"),
                remote.clone(),
                EngineConfig {
                    device_id: "device-1".to_string(),
                    ..EngineConfig::default()
                },
            )
            .unwrap(),
        );
        engine.bind().await.unwrap();

        let store = engine.store();
        let local = engine.local();
        local.make_folder(ROOT, "Workspace").unwrap();
        let root = store.get_state_from_local(ROOT).unwrap().unwrap();
        let id = store
            .insert_local_state(&local.get_info("/Workspace").unwrap(), Some(ROOT))
            .unwrap();
        let pair = store.get_state_from_id(id).unwrap().unwrap();
        store
            .update_remote_state(&pair, &workspace, Some(&root.remote_path()), RemoteUpdate::forced())
            .unwrap();
        let pair = store.get_state_from_id(id).unwrap().unwrap();
        assert!(store.synchronize_state(&pair, None, false).unwrap());
        local.set_remote_id("/Workspace", &workspace.uid).unwrap();

        Fixture {
            _dir: dir,
            engine,
            remote,
            workspace,
        }
    }

    impl Fixture {
        /// A file present on both sides and synchronized; returns its pair id.
        pub async fn synced_file(&self, parent: &str, name: &str, content: &[u8]) -> i64 {
            let store = self.engine.store();
            let local = self.engine.local();
            let parent_pair = store.get_state_from_local(parent).unwrap().unwrap();
            let info = self
                .remote
                .create_file_remotely(parent_pair.remote_ref.as_deref().unwrap(), name, content)
                .unwrap();
            let path = local.make_file(parent, name, Some(content)).unwrap();
            let id = store
                .insert_local_state(&local.get_info(&path).unwrap(), Some(parent))
                .unwrap();
            let pair = store.get_state_from_id(id).unwrap().unwrap();
            store
                .update_remote_state(&pair, &info, Some(&parent_pair.remote_path()), RemoteUpdate::forced())
                .unwrap();
            let pair = store.get_state_from_id(id).unwrap().unwrap();
            assert!(store.synchronize_state(&pair, None, false).unwrap());
            local.set_remote_id(&path, &info.uid).unwrap();
            id
        }
    }

    #[tokio::test]
    async fn test_bind_records_top_level_pair() {
        let f = fixture().await;
        let root = f.engine.store().get_state_from_local(ROOT).unwrap().unwrap();
        assert_eq!(root.pair_state, PairState::Synchronized);
        assert_eq!(root.remote_parent_path.as_deref(), Some(""));
        assert_eq!(
            f.engine.local().get_root_id().as_deref(),
            Some("http://memory/nuxeo/|alice|device-1|engine-1")
        );
        // Binding twice is harmless
        f.engine.bind().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_refuses_folder_of_other_account() {
        let f = fixture().await;
        let other = Engine::new(
            "engine-2",
            f.engine.local_folder().to_path_buf(),
            f._dir.path().join("data2"),
            Arc::new(MemoryRemote::new("http://other/nuxeo/", "bob")),
            EngineConfig::default(),
        )
        .unwrap();
        match other.bind().await {
            Err(EngineError::RootAlreadyBindWithDifferentAccount { user, server }) => {
                assert_eq!(user, "alice");
                assert_eq!(server, "http://memory/nuxeo/");
            }
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_suspend_resume_and_offline() {
        let f = fixture().await;
        let mut events = f.engine.subscribe();
        f.engine.suspend();
        assert!(f.engine.is_paused());
        assert!(f.engine.context().queue.is_paused());

        f.engine.set_offline(true);
        f.engine.resume();
        // Still offline: the queue stays on hold
        assert!(f.engine.context().queue.is_paused());
        f.engine.set_offline(false);
        assert!(!f.engine.context().queue.is_paused());

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }
        assert_eq!(
            received,
            vec![
                EngineEvent::SyncSuspended,
                EngineEvent::Offline,
                EngineEvent::SyncResumed,
                EngineEvent::Online
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_credentials_signalled_once() {
        let f = fixture().await;
        let mut events = f.engine.subscribe();
        f.engine.set_invalid_credentials(true);
        f.engine.set_invalid_credentials(true);
        assert!(f.engine.get_metrics().unwrap().invalid_credentials);
        assert_eq!(events.try_recv().unwrap(), EngineEvent::InvalidAuthentication);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_filter_marks_pair_remotely_deleted() {
        let f = fixture().await;
        let id = f.synced_file("/Workspace", "a.txt", b"a").await;
        let pair = f.engine.store().get_state_from_id(id).unwrap().unwrap();

        f.engine.add_filter(&pair.remote_path()).unwrap();
        let filtered = f.engine.store().get_state_from_id(id).unwrap().unwrap();
        assert_eq!(filtered.pair_state, PairState::RemotelyDeleted);
        assert!(f.engine.store().is_filter(&pair.remote_path()));

        f.engine.remove_filter(&pair.remote_path()).unwrap();
        assert!(!f.engine.store().is_filter(&pair.remote_path()));
        assert_eq!(f.engine.store().get_paths_to_scan().unwrap(), vec![pair.remote_path()]);
    }

    #[tokio::test]
    async fn test_resolve_conflict() {
        let f = fixture().await;
        let id = f.synced_file("/Workspace", "c.txt", b"c").await;
        let pair = f.engine.store().get_state_from_id(id).unwrap().unwrap();
        f.engine.store().set_conflict_state(&pair).unwrap();
        assert_eq!(f.engine.get_conflicts().unwrap().len(), 1);

        f.engine.resolve_with_local(id).unwrap();
        let pair = f.engine.store().get_state_from_id(id).unwrap().unwrap();
        assert_eq!(pair.pair_state, PairState::LocallyResolved);

        f.engine.resolve_with_remote(id).unwrap();
        let pair = f.engine.store().get_state_from_id(id).unwrap().unwrap();
        assert_eq!(pair.pair_state, PairState::RemotelyModified);
        assert!(f.engine.get_conflicts().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_with_duplicate_keeps_local_copy() {
        let f = fixture().await;
        let id = f.synced_file("/Workspace", "d.txt", b"mine").await;
        f.engine.resolve_with_duplicate(id).unwrap();

        let copy = f.engine.store().get_state_from_local("/Workspace/d__1.txt").unwrap().unwrap();
        assert_eq!(copy.pair_state, PairState::LocallyCreated);
        assert_eq!(f.engine.local().get_content("/Workspace/d__1.txt").unwrap(), b"mine");
        let original = f.engine.store().get_state_from_id(id).unwrap().unwrap();
        assert_eq!(original.pair_state, PairState::RemotelyModified);
    }

    #[tokio::test]
    async fn test_unsynchronize_and_retry() {
        let f = fixture().await;
        let id = f.synced_file("/Workspace", "e.txt", b"e").await;
        f.engine.unsynchronize_pair(id, Some("READONLY")).unwrap();
        let pair = f.engine.store().get_state_from_id(id).unwrap().unwrap();
        assert_eq!(pair.pair_state, PairState::Unsynchronized);
        assert_eq!(pair.last_error.as_deref(), Some("READONLY"));
        assert_eq!(f.engine.get_metrics().unwrap().unsynchronized, 1);

        let pair_id = f.engine.store().get_state_from_local("/Workspace").unwrap().unwrap().id;
        f.engine.retry_pair(pair_id).unwrap();
        let pair = f.engine.store().get_state_from_id(pair_id).unwrap().unwrap();
        assert_eq!(pair.error_count, 0);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let f = fixture().await;
        let mut events = f.engine.subscribe();
        f.engine.start().await.unwrap();
        assert!(f.engine.is_running().await);
        assert!(matches!(f.engine.start().await, Err(EngineError::AlreadyRunning)));
        loop {
            if events.recv().await.unwrap() == EngineEvent::SyncStarted {
                break;
            }
        }

        f.engine.stop().await.unwrap();
        assert!(!f.engine.is_running().await);
        let status = f.engine.get_status().await.unwrap();
        assert!(!status.running);
        assert_eq!(status.uid, "engine-1");
    }

    #[tokio::test]
    async fn test_unbind_removes_database() {
        let f = fixture().await;
        let db = f.engine.store().path().to_path_buf();
        assert!(db.exists());
        f.engine.unbind().await.unwrap();
        assert!(!db.exists());
        assert!(f.engine.local().get_root_id().is_none());
    }
}
