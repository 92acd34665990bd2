//! Local side of an engine
//!
//! The watcher keeps the store in line with the sync root in two ways: a
//! full recursive scan at startup (and whenever events were lost), then a
//! live stream of filesystem events. Both only touch the store; the
//! processors do the actual synchronization.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use ndrive_client::names::{
    basename, is_generated_tmp_file, is_text_edit_tmp_file, nfc, parent_path, ROOT,
    UNACCESSIBLE_HASH,
};
use ndrive_client::LocalFileInfo;
use ndrive_index::{DocPair, FsEvent, FsEventSource, PairState, QueueItem, SideState, StoreError};
use ndrive_sync::{EngineEvent, SyncContext, SyncError, WorkerControl};

use crate::errors::Result;

/// Owner id used while the watcher holds a pair; processors use small ids.
pub const LOCAL_WATCHER_ID: i64 = 1 << 20;

/// Written at the root to make sure the event stream works.
const WATCHDOG_SETUP_FILE: &str = ".watchdog_setup";

/// Longest wait for an event before the delayed buffers are checked.
const IDLE_TICK: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct LocalWatcherConfig {
    /// Above this many pending events the backlog is dropped for a full scan
    pub max_pending_events: usize,
    /// How long to wait for the event of the setup file
    pub watchdog_timeout: Duration,
    /// Hold deletions back in case they are the first half of a move
    pub delay_deletes: bool,
    pub delete_delay: Duration,
    /// Rescan folders some time after they changed, to catch lost events
    pub schedule_folder_scans: bool,
    pub folder_scan_delay: Duration,
}

impl Default for LocalWatcherConfig {
    fn default() -> Self {
        Self {
            max_pending_events: 50,
            watchdog_timeout: Duration::from_secs(30),
            delay_deletes: cfg!(windows),
            delete_delay: Duration::from_secs(2),
            schedule_folder_scans: cfg!(windows),
            folder_scan_delay: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LocalWatcherMetrics {
    /// Duration of the last full scan
    pub last_local_scan_time_ms: Option<u64>,
    pub new_files: u64,
    pub update_files: u64,
    pub delete_files: u64,
    pub fs_events: u64,
    pub last_event: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    Created,
    Modified,
    Deleted,
    Moved,
}

impl EventKind {
    fn as_str(self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Modified => "modified",
            EventKind::Deleted => "deleted",
            EventKind::Moved => "moved",
        }
    }
}

/// Bookkeeping of one scan pass.
#[derive(Debug, Default)]
struct ScanState {
    /// Pairs missing from disk, by local path
    deleted: HashMap<String, DocPair>,
    /// Remote refs found at another place during the pass
    protected: HashSet<String>,
}

impl ScanState {
    fn protect(&mut self, remote_ref: Option<&str>) {
        if let Some(remote_ref) = remote_ref {
            self.protected.insert(remote_ref.to_string());
        }
    }
}

type DelayedPairs = Mutex<HashMap<String, (Instant, DocPair)>>;

pub struct LocalWatcher {
    ctx: Arc<SyncContext>,
    config: LocalWatcherConfig,
    metrics: Mutex<LocalWatcherMetrics>,
    /// Deletions waiting for `delete_delay`, by remote ref
    delete_events: DelayedPairs,
    /// Folders waiting for `folder_scan_delay`, by local path
    folder_scan_events: DelayedPairs,
    need_full_scan: AtomicBool,
}

impl LocalWatcher {
    pub fn new(ctx: Arc<SyncContext>, config: LocalWatcherConfig) -> Self {
        Self {
            ctx,
            config,
            metrics: Mutex::new(LocalWatcherMetrics::default()),
            delete_events: Mutex::new(HashMap::new()),
            folder_scan_events: Mutex::new(HashMap::new()),
            need_full_scan: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &LocalWatcherConfig {
        &self.config
    }

    pub fn metrics(&self) -> LocalWatcherMetrics {
        self.metrics.lock().clone()
    }

    fn root(&self) -> &Path {
        self.ctx.local.base_folder()
    }

    /// Watch the sync root until stopped.
    pub async fn run(&self, control: WorkerControl) -> Result<()> {
        info!("LocalWatcher starting on {}", self.root().display());
        if !self.root().exists() {
            warn!("Sync root {} is gone", self.root().display());
            self.ctx.emit(EngineEvent::RootDeleted);
            return Ok(());
        }

        let mut source = FsEventSource::watch(self.root())?;
        let mut backlog = self.setup_watchdog(&mut source).await;
        self.scan(&control).await?;

        loop {
            control.interact().await?;
            let mut events = std::mem::take(&mut backlog);
            if events.is_empty() {
                tokio::select! {
                    event = source.next_event() => match event {
                        Some(event) => events.push(event),
                        None => {
                            warn!("Filesystem event source closed");
                            return Ok(());
                        }
                    },
                    _ = tokio::time::sleep(IDLE_TICK) => {}
                    _ = control.token().cancelled() => return Err(SyncError::ThreadInterrupt.into()),
                }
            }
            events.extend(source.drain_ready());

            if events.len() > self.config.max_pending_events {
                warn!(
                    "{} pending filesystem events, dropping them for a full scan",
                    events.len()
                );
                self.scan(&control).await?;
                continue;
            }

            for event in &events {
                control.interact().await?;
                if let Err(e) = self.handle_event(event) {
                    error!("Watchdog exception on {:?}: {}", event, e);
                }
            }

            if self.need_full_scan.swap(false, Ordering::SeqCst) {
                self.scan(&control).await?;
            }
            if let Err(e) = self.flush_delayed(false) {
                error!("Cannot handle delayed events: {}", e);
            }
        }
    }

    /// Touch a file at the root and wait for its event, keeping whatever
    /// else arrives meanwhile.
    async fn setup_watchdog(&self, source: &mut FsEventSource) -> Vec<FsEvent> {
        let marker = self.root().join(WATCHDOG_SETUP_FILE);
        let mut backlog = Vec::new();
        if let Err(e) = std::fs::write(&marker, b"") {
            warn!("Cannot write {}: {}", marker.display(), e);
            return backlog;
        }

        let deadline = tokio::time::Instant::now() + self.config.watchdog_timeout;
        loop {
            match tokio::time::timeout_at(deadline, source.next_event()).await {
                Ok(Some(event)) if event.path() == marker => {
                    debug!("Watchdog setup complete");
                    break;
                }
                Ok(Some(event)) => backlog.push(event),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "No event received for {} after {:?}, changes may be missed",
                        marker.display(),
                        self.config.watchdog_timeout
                    );
                    break;
                }
            }
        }
        if let Err(e) = std::fs::remove_file(&marker) {
            debug!("Cannot remove {}: {}", marker.display(), e);
        }
        backlog
    }

    /// Full recursive scan of the sync root, processors held back meanwhile.
    pub async fn scan(&self, control: &WorkerControl) -> Result<()> {
        let start = Instant::now();
        let queue = &self.ctx.queue;
        let suspended = !queue.is_paused();
        if suspended {
            queue.suspend();
            queue.interrupt_processors_on(ROOT, false);
        }

        let result = self.full_scan(control).await;
        if suspended {
            queue.resume();
        }
        result?;

        let elapsed = start.elapsed().as_millis() as u64;
        self.metrics.lock().last_local_scan_time_ms = Some(elapsed);
        info!("Full local scan done in {}ms", elapsed);
        self.ctx.emit(EngineEvent::LocalScanFinished);
        Ok(())
    }

    async fn full_scan(&self, control: &WorkerControl) -> Result<()> {
        let mut state = ScanState::default();
        let mut stack = vec![self.ctx.local.get_info(ROOT)?];
        while let Some(folder) = stack.pop() {
            control.interact().await?;
            let subfolders = self.scan_folder(&folder, &mut state)?;
            stack.extend(subfolders.into_iter().rev());
        }
        self.handle_deleted_files(state)
    }

    /// Scan the direct children of one folder.
    pub fn scan_pair(&self, path: &str) -> Result<()> {
        let Some(info) = self.ctx.local.try_get_info(path)? else {
            debug!("Cannot scan {}, it is gone", path);
            return Ok(());
        };
        let mut state = ScanState::default();
        self.scan_folder(&info, &mut state)?;
        self.handle_deleted_files(state)
    }

    fn handle_deleted_files(&self, state: ScanState) -> Result<()> {
        let mut deleted: Vec<DocPair> = state.deleted.into_values().collect();
        deleted.sort_by(|a, b| a.local_path.cmp(&b.local_path));
        for pair in deleted {
            if pair
                .remote_ref
                .as_ref()
                .map_or(false, |r| state.protected.contains(r))
            {
                debug!("Skipping deletion of {}, it was moved", pair);
                continue;
            }
            info!("Deleting local state of {}", pair);
            self.metrics.lock().delete_files += 1;
            self.ctx.store.delete_local_state(&pair)?;
        }
        Ok(())
    }

    /// Compare a folder on disk with its children in the store. Returns the
    /// subfolders to descend into, new ones first.
    fn scan_folder(&self, folder: &LocalFileInfo, state: &mut ScanState) -> Result<Vec<LocalFileInfo>> {
        if !folder.folderish {
            return Ok(Vec::new());
        }
        trace!("Scanning {}", folder.path);
        let mut db_children: HashMap<String, DocPair> = self
            .ctx
            .store
            .get_local_children(&folder.path)?
            .into_iter()
            .filter_map(|pair| pair.local_name.clone().map(|name| (name, pair)))
            .collect();

        let children = match self.ctx.local.get_children_info(&folder.path) {
            Ok(children) => children,
            Err(e) if e.is_not_found() => {
                debug!("{} vanished during the scan", folder.path);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut to_scan_new = Vec::new();
        let mut to_scan = Vec::new();
        for child in children {
            match db_children.remove(&child.name) {
                None => self.scan_new_child(folder, child, &mut db_children, state, &mut to_scan_new)?,
                Some(pair) => self.scan_known_child(pair, child, state, &mut to_scan)?,
            }
        }

        for pair in db_children.into_values() {
            if pair.pair_state == PairState::RemotelyCreated
                || pair.remote_state == SideState::Created
                || pair.local_state == SideState::Deleted
            {
                continue;
            }
            if pair.remote_ref.is_none() {
                debug!("{} was never uploaded, forgetting it", pair);
                self.ctx.store.remove_state(&pair, false, true)?;
            } else {
                state.deleted.insert(pair.local_path.clone(), pair);
            }
        }

        to_scan_new.extend(to_scan);
        Ok(to_scan_new)
    }

    fn scan_new_child(
        &self,
        folder: &LocalFileInfo,
        child: LocalFileInfo,
        db_children: &mut HashMap<String, DocPair>,
        state: &mut ScanState,
        to_scan_new: &mut Vec<LocalFileInfo>,
    ) -> Result<()> {
        let store = &self.ctx.store;
        let local = &self.ctx.local;

        let Some(remote_ref) = child.remote_ref.clone() else {
            // Being downloaded under this name
            if let Some(parent_ref) = local.get_remote_id(&folder.path) {
                let downloading = store
                    .get_new_remote_children(&parent_ref)?
                    .iter()
                    .any(|p| p.remote_name.as_deref() == Some(child.name.as_str()));
                if downloading {
                    debug!("Skipping {}, its remote creation is in progress", child.path);
                    return Ok(());
                }
            }
            info!("Found new {} {}", kind_of(&child), child.path);
            self.insert_local(&child, &folder.path)?;
            if child.folderish {
                to_scan_new.push(child);
            }
            return Ok(());
        };

        match store.get_normal_state_from_remote(&remote_ref)? {
            None => {
                info!("Found new {} {} with unknown remote ref", kind_of(&child), child.path);
                self.insert_local(&child, &folder.path)?;
                state.protect(Some(&remote_ref));
            }
            Some(mut pair)
                if !self.ctx.local.is_case_sensitive()
                    && pair.local_path != child.path
                    && pair.local_path.to_lowercase() == child.path.to_lowercase() =>
            {
                info!("Case rename of {} to {}", pair.local_path, child.path);
                if let Some(name) = &pair.local_name {
                    db_children.remove(name);
                }
                self.record_move(&mut pair, &child, true)?;
            }
            Some(pair) if pair.processor > 0 => {
                debug!("Skipping {}, pair {} is being processed", child.path, pair.id);
            }
            Some(pair) if pair.local_path == child.path => {
                debug!("Skipping {}, already known as {}", child.path, pair);
            }
            Some(mut pair) => {
                let old_info = local.try_get_info(&pair.local_path)?;
                let newer = match &old_info {
                    None => false,
                    Some(_) => {
                        local.get_creation_time(&child.path)? >= local.get_creation_time(&pair.local_path)?
                    }
                };
                match old_info {
                    Some(old) if newer && old.remote_ref.as_deref() == Some(remote_ref.as_str()) => {
                        info!("Copy paste of {} to {}", pair.local_path, child.path);
                        local.remove_remote_id(&child.path)?;
                        let child = local.get_info(&child.path)?;
                        self.insert_local(&child, &folder.path)?;
                    }
                    Some(old) if !newer => {
                        // The file here is the original; the old path holds a copy
                        info!("Move of {} to {}, the old path is a copy", pair.local_path, child.path);
                        state.protect(pair.remote_ref.as_deref());
                        let old_path = old.path.clone();
                        self.record_move(&mut pair, &child, false)?;
                        local.remove_remote_id(&old_path)?;
                        self.insert_local(&local.get_info(&old_path)?, &parent_path(&old_path))?;
                    }
                    _ => {
                        info!("Move of {} to {}", pair.local_path, child.path);
                        state.protect(pair.remote_ref.as_deref());
                        self.record_move(&mut pair, &child, false)?;
                    }
                }
            }
        }
        if child.folderish {
            to_scan_new.push(child);
        }
        Ok(())
    }

    /// Record `pair` as moved to `info`, descendants included.
    fn record_move(&self, pair: &mut DocPair, info: &LocalFileInfo, versioned: bool) -> Result<()> {
        if pair.folderish {
            self.ctx.store.replace_local_paths(&pair.local_path, &info.path)?;
        }
        pair.local_state = SideState::Moved;
        self.ctx.store.update_local_state(pair, info, versioned, true)?;
        Ok(())
    }

    fn scan_known_child(
        &self,
        mut pair: DocPair,
        child: LocalFileInfo,
        state: &mut ScanState,
        to_scan: &mut Vec<LocalFileInfo>,
    ) -> Result<()> {
        let store = &self.ctx.store;
        let local = &self.ctx.local;
        if child.folderish {
            to_scan.push(child.clone());
        }

        let unchanged = pair.last_local_updated.map(|d| d.timestamp())
            == Some(child.last_modification_time.timestamp());
        if pair.processor != 0 || unchanged {
            trace!("Skipping unchanged {}", child.path);
            return Ok(());
        }

        if let Some(pair_ref) = pair.remote_ref.clone() {
            match &child.remote_ref {
                None => {
                    debug!("Restoring remote id of {}", child.path);
                    local.set_remote_id(&child.path, &pair_ref)?;
                }
                Some(child_ref) if *child_ref != pair_ref => {
                    // Another item took this name
                    info!("Substitution of {} by {}", pair, child_ref);
                    match store.get_normal_state_from_remote(child_ref)? {
                        Some(mut original) if !local.exists(&original.local_path) => {
                            state.protect(Some(child_ref));
                            self.record_move(&mut original, &child, true)?;
                        }
                        _ => {
                            local.remove_remote_id(&child.path)?;
                            self.insert_local(&local.get_info(&child.path)?, &parent_path(&child.path))?;
                        }
                    }
                    state.deleted.insert(pair.local_path.clone(), pair);
                    return Ok(());
                }
                Some(_) => {}
            }
        }

        if !child.folderish {
            let digest = child.get_digest(local.digest_algorithm(), None)?;
            if digest != pair.local_digest {
                trace!("Digest of {} changed", child.path);
                pair.local_digest = digest;
                pair.local_state = SideState::Modified;
                self.metrics.lock().update_files += 1;
            }
        }
        store.update_local_state(&pair, &child, true, true)?;
        Ok(())
    }

    fn insert_local(&self, info: &LocalFileInfo, parent: &str) -> Result<Option<i64>> {
        match self.ctx.store.insert_local_state(info, Some(parent)) {
            Ok(id) => {
                self.metrics.lock().new_files += 1;
                Ok(Some(id))
            }
            Err(StoreError::DuplicatePair(e)) => {
                debug!("{} is already tracked: {}", info.path, e);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Apply one filesystem event to the store.
    pub fn handle_event(&self, event: &FsEvent) -> Result<()> {
        {
            let mut metrics = self.metrics.lock();
            metrics.fs_events += 1;
            metrics.last_event = Some(Utc::now());
        }
        let (kind, src, dest) = match event {
            FsEvent::Created(p) => (EventKind::Created, p, None),
            FsEvent::Modified(p) => (EventKind::Modified, p, None),
            FsEvent::Deleted(p) => (EventKind::Deleted, p, None),
            FsEvent::Moved { from, to } => (EventKind::Moved, from, Some(to.as_path())),
            FsEvent::Rescan(p) => return self.handle_rescan(p),
        };

        if let Some(dest) = dest {
            if dest != src.as_path() && nfc(&dest.to_string_lossy()) == nfc(&src.to_string_lossy()) {
                debug!("Ignoring normalization move of {}", src.display());
                return Ok(());
            }
        }

        let Some(rel) = self.ctx.local.get_path(src) else {
            match (kind, dest) {
                // Moved in from outside the sync root
                (EventKind::Moved, Some(dest)) => return self.handle_unknown_move(dest),
                _ => {
                    trace!("Ignoring event outside of the sync root: {}", src.display());
                    return Ok(());
                }
            }
        };
        debug!("Handling watchdog event [{}] on {}", kind.as_str(), rel);

        if rel == ROOT {
            self.handle_root_event(kind, dest);
            return Ok(());
        }
        let name = basename(&rel);
        if cfg!(windows) && name.contains(':') {
            trace!("Ignoring alternate data stream {}", rel);
            return Ok(());
        }
        if kind != EventKind::Moved && self.ctx.local.is_ignored(&parent_path(&rel), name) {
            trace!("Ignoring {}", rel);
            return Ok(());
        }
        if self.ctx.local.is_temp_file(name) {
            trace!("Ignoring temporary file {}", rel);
            return Ok(());
        }

        match self.ctx.store.get_state_from_local(&rel)? {
            Some(pair) => self.handle_known_pair(pair, kind, &rel, dest),
            None => match (kind, dest) {
                (EventKind::Deleted, _) => {
                    debug!("Unknown path {} deleted", rel);
                    Ok(())
                }
                (EventKind::Moved, Some(dest)) => self.handle_unknown_move(dest),
                _ => self.handle_unknown_creation(kind, &rel),
            },
        }
    }

    fn handle_rescan(&self, path: &Path) -> Result<()> {
        match self.ctx.local.get_path(path) {
            Some(rel) if rel != ROOT && path.is_dir() => self.scan_pair(&rel),
            _ => {
                info!("Events were lost, a full scan is needed");
                self.need_full_scan.store(true, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    fn handle_root_event(&self, kind: EventKind, dest: Option<&Path>) {
        match (kind, dest) {
            (EventKind::Moved, Some(dest)) => {
                warn!("Sync root moved to {}", dest.display());
                self.ctx.emit(EngineEvent::RootMoved {
                    new_path: dest.to_path_buf(),
                });
            }
            (EventKind::Deleted, _) if !self.root().exists() => {
                warn!("Sync root {} deleted", self.root().display());
                self.ctx.emit(EngineEvent::RootDeleted);
            }
            _ => trace!("Ignoring {} event on the sync root", kind.as_str()),
        }
    }

    fn handle_known_pair(&self, mut pair: DocPair, kind: EventKind, rel: &str, dest: Option<&Path>) -> Result<()> {
        let store = &self.ctx.store;
        if pair.pair_state == PairState::Unsynchronized {
            if matches!(kind, EventKind::Deleted | EventKind::Moved) {
                let name = dest
                    .and_then(|d| d.file_name())
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| basename(rel).to_string());
                if !is_generated_tmp_file(&name).0 {
                    info!("Unsynchronized {} is gone, forgetting it", pair);
                    store.remove_state(&pair, false, true)?;
                }
            }
            return Ok(());
        }

        if kind == EventKind::Created && pair.pair_state == PairState::LocallyDeleted {
            // Deleted then restored before the deletion was synced
            info!("{} is back", pair);
            pair.local_state = SideState::Modified;
            pair.remote_state = SideState::Unknown;
            store.update_local_state(&pair, &self.ctx.local.get_info(rel)?, true, true)?;
        }

        if let (EventKind::Moved, Some(dest)) = (kind, dest) {
            return self.handle_move_on_known_pair(pair, dest);
        }

        let Some(acquired) = store.acquire_state(LOCAL_WATCHER_ID, pair.id)? else {
            debug!("{} is being processed, ignoring the {} event", pair, kind.as_str());
            return Ok(());
        };
        let result = if kind == EventKind::Deleted {
            self.handle_delete_on_known_pair(&acquired)
        } else {
            self.handle_change_on_known_pair(acquired, kind, rel)
        };
        store.release_state(LOCAL_WATCHER_ID)?;
        self.requeue(pair.id)?;
        result
    }

    /// A processor may have popped the pair while it was held.
    fn requeue(&self, id: i64) -> Result<()> {
        if let Some(pair) = self.ctx.store.get_state_from_id(id)? {
            if pair.pair_state.needs_sync() && pair.pair_state != PairState::Conflicted {
                self.ctx.queue.push(QueueItem::from(&pair));
            }
        }
        Ok(())
    }

    fn handle_delete_on_known_pair(&self, pair: &DocPair) -> Result<()> {
        if self.config.delay_deletes {
            if let Some(remote_ref) = &pair.remote_ref {
                debug!("Delaying the deletion of {}", pair);
                self.delete_events
                    .lock()
                    .insert(remote_ref.clone(), (Instant::now(), pair.clone()));
                return Ok(());
            }
        }
        self.check_deletion(pair)
    }

    /// Delete `pair` unless its file is actually still there.
    fn check_deletion(&self, pair: &DocPair) -> Result<()> {
        let local = &self.ctx.local;
        if local.exists(&pair.local_path) {
            let remote_ref = local.get_remote_id(&pair.local_path);
            if remote_ref.is_none() || remote_ref == pair.remote_ref {
                debug!("{} still exists, ignoring its deletion", pair);
                return Ok(());
            }
        }
        let parent_exists = local
            .abspath(&pair.local_path)?
            .parent()
            .map_or(false, Path::exists);
        if !parent_exists {
            debug!("Parent of {} is gone, its deletion comes with it", pair);
            return Ok(());
        }
        info!("Deleting local state of {}", pair);
        self.metrics.lock().delete_files += 1;
        self.ctx.store.delete_local_state(pair)?;
        Ok(())
    }

    fn handle_change_on_known_pair(&self, mut pair: DocPair, kind: EventKind, rel: &str) -> Result<()> {
        let store = &self.ctx.store;
        let local = &self.ctx.local;
        let Some(info) = local.try_get_info(rel)? else {
            debug!("{} is already gone", rel);
            return Ok(());
        };
        let algorithm = local.digest_algorithm();

        if kind == EventKind::Created && info.remote_ref.is_none() && !pair.folderish {
            if info.get_digest(algorithm, None)? == pair.local_digest {
                debug!("{} created again with the same content", rel);
                if let Some(remote_ref) = &pair.remote_ref {
                    local.set_remote_id(rel, remote_ref)?;
                }
                return Ok(());
            }
        }

        if pair.folderish {
            store.update_local_modification_time(&pair, &info)?;
            self.schedule_folder_scan(&pair);
            return Ok(());
        }

        if info.size < store.config().big_file_bytes && pair.local_state == SideState::Synchronized {
            let digest = info.get_digest(algorithm, None)?;
            if digest == pair.local_digest {
                trace!("{} touched but not changed", rel);
                self.restore_remote_id(&pair, &info)?;
                store.update_local_modification_time(&pair, &info)?;
                return Ok(());
            }
            pair.local_digest = digest;
            pair.local_state = SideState::Modified;
        }

        if kind == EventKind::Modified {
            let copying = if info.size != pair.size {
                !matches!(pair.pair_state, PairState::Synchronized | PairState::LocallyResolved)
            } else {
                pair.local_digest.as_deref() == Some(UNACCESSIBLE_HASH)
            };
            if copying {
                debug!("{} is still being written", rel);
                self.restore_remote_id(&pair, &info)?;
                return Ok(());
            }
            self.restore_remote_id(&pair, &info)?;
        }

        self.metrics.lock().update_files += 1;
        store.update_local_state(&pair, &info, true, true)?;
        Ok(())
    }

    /// Put back the remote id an editor dropped while saving.
    fn restore_remote_id(&self, pair: &DocPair, info: &LocalFileInfo) -> Result<()> {
        let Some(remote_ref) = &pair.remote_ref else {
            return Ok(());
        };
        if info.remote_ref.as_ref() == Some(remote_ref) {
            return Ok(());
        }
        let original_exists = match &info.remote_ref {
            Some(other) => self
                .ctx
                .store
                .get_normal_state_from_remote(other)?
                .map_or(false, |p| self.ctx.local.exists(&p.local_path)),
            None => false,
        };
        if !original_exists {
            debug!("Restoring remote id of {}", info.path);
            self.ctx.local.set_remote_id(&info.path, remote_ref)?;
        }
        Ok(())
    }

    fn handle_move_on_known_pair(&self, mut pair: DocPair, dest: &Path) -> Result<()> {
        let store = &self.ctx.store;
        let local = &self.ctx.local;
        let dest_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if is_generated_tmp_file(&dest_name).0 {
            debug!("Ignoring move of {} to temporary file {}", pair, dest_name);
            return Ok(());
        }

        let Some(rel) = local.get_path(dest) else {
            info!("{} moved out of the sync root", pair);
            return self.check_deletion(&pair);
        };

        let remote_ref = local.get_remote_id(&rel);
        if let Some(mut dest_pair) = store.get_state_from_local(&rel)? {
            if dest_pair.remote_ref == remote_ref {
                if let Some(info) = local.try_get_info(&rel)? {
                    // Save-as-temp then rename over the original
                    let digest = info.get_digest(local.digest_algorithm(), None)?;
                    if !pair.folderish && dest_pair.local_digest != digest {
                        info!("Substitution of {} with new content", dest_pair);
                        dest_pair.local_digest = digest;
                        dest_pair.local_state = SideState::Modified;
                        store.update_local_state(&dest_pair, &info, true, true)?;
                    } else {
                        debug!("Substitution of {} with the same content", dest_pair);
                    }
                    if pair.id != dest_pair.id {
                        store.remove_state(&pair, false, true)?;
                    }
                    return Ok(());
                }
            }
        }

        let Some(info) = local.try_get_info(&rel)? else {
            debug!("{} is already gone", rel);
            return Ok(());
        };
        if is_text_edit_tmp_file(&info.name) {
            return Ok(());
        }

        let parent = parent_path(&rel);
        let remote_parent_ref = local.get_remote_id(&parent);
        let old_path = pair.local_path.clone();
        let mut versioned = false;
        if pair.remote_name.as_deref() == Some(info.name.as_str())
            && pair.remote_parent_ref == remote_parent_ref
            && pair.local_parent_path == parent
        {
            info!("Move of {} cancelled", pair);
            pair.local_state = SideState::Synchronized;
        } else if pair.local_state != SideState::Created {
            info!("{} moved to {}", pair, rel);
            pair.local_state = SideState::Moved;
            versioned = true;
        }

        if pair.folderish {
            store.replace_local_paths(&old_path, &info.path)?;
        }
        store.update_local_state(&pair, &info, versioned, true)?;

        if pair.folderish {
            let mut folders = self.folder_scan_events.lock();
            if let Some((at, mut scheduled)) = folders.remove(&old_path) {
                scheduled.local_path = info.path.clone();
                folders.insert(info.path.clone(), (at, scheduled));
            }
        }
        Ok(())
    }

    fn handle_unknown_move(&self, dest: &Path) -> Result<()> {
        let local = &self.ctx.local;
        let Some(rel) = local.get_path(dest) else {
            return Ok(());
        };
        let parent = parent_path(&rel);
        if local.is_ignored(&parent, basename(&rel)) || local.is_temp_file(basename(&rel)) {
            trace!("Ignoring move to {}", rel);
            return Ok(());
        }
        if self.ctx.store.get_state_from_local(&rel)?.is_some() {
            debug!("{} is already tracked", rel);
            return Ok(());
        }
        let Some(info) = local.try_get_info(&rel)? else {
            return Ok(());
        };

        if let Some(remote_ref) = &info.remote_ref {
            if let Some(pair) = self.ctx.store.get_normal_state_from_remote(remote_ref)? {
                if !local.exists(&pair.local_path) {
                    info!("{} came back as {}", pair, rel);
                    return self.handle_move_on_known_pair(pair, dest);
                }
            }
        }

        info!("New {} {} moved in", kind_of(&info), rel);
        self.insert_local(&info, &parent)?;
        if info.folderish {
            self.scan_pair(&rel)?;
        }
        Ok(())
    }

    fn handle_unknown_creation(&self, kind: EventKind, rel: &str) -> Result<()> {
        let store = &self.ctx.store;
        let local = &self.ctx.local;
        let Some(info) = local.try_get_info(rel)? else {
            debug!("{} is already gone", rel);
            return Ok(());
        };
        let parent = parent_path(rel);

        if let Some(remote_ref) = info.remote_ref.clone() {
            let mut moved = false;
            let from_pair = store.get_normal_state_from_remote(&remote_ref)?;
            if let Some(mut from) = from_pair.clone() {
                if from.processor > 0 || from.local_path == rel {
                    debug!("Ignoring {} event on {}, handled elsewhere", kind.as_str(), from);
                    return Ok(());
                }
                if !local.exists(&from.local_path) {
                    let dest_parent = store.get_state_from_local(&parent)?;
                    if let Some(dest_parent) = dest_parent.as_ref().filter(|p| !p.remote_can_create_child) {
                        info!("{} moved into readonly {}", from, dest_parent);
                        store.unsynchronize_state(&from, Some("READONLY"), false)?;
                        self.ctx.emit(EngineEvent::NewReadonly {
                            filename: from.name().to_string(),
                            parent: dest_parent.remote_name.clone(),
                        });
                        return Ok(());
                    }
                    let from_readonly = store
                        .get_state_from_local(&from.local_parent_path)?
                        .map_or(false, |p| !p.remote_can_create_child);
                    if from_readonly {
                        // Moved out of a readonly folder: a copy for the server
                        info!("{} moved out of a readonly folder, creating it", from);
                        self.ctx.emit(EngineEvent::NewReadonly {
                            filename: from.name().to_string(),
                            parent: dest_parent.and_then(|p| p.remote_name),
                        });
                        from.local_state = SideState::Created;
                        from.remote_state = SideState::Unknown;
                        local.remove_remote_id(rel)?;
                    } else {
                        from.local_state = SideState::Moved;
                    }
                    if from.folderish {
                        store.replace_local_paths(&from.local_path, rel)?;
                    }
                    store.update_local_state(&from, &local.get_info(rel)?, true, true)?;
                    moved = true;
                } else if kind == EventKind::Created
                    && local.get_creation_time(&from.local_path)? > local.get_creation_time(rel)?
                {
                    // The old path is the copy
                    info!("{} moved to {} and copied back", from, rel);
                    let old_path = from.local_path.clone();
                    from.local_state = SideState::Moved;
                    store.update_local_state(&from, &local.get_info(rel)?, true, true)?;
                    local.remove_remote_id(&old_path)?;
                    self.insert_local(&local.get_info(&old_path)?, &parent_path(&old_path))?;
                    moved = true;
                }
            }

            if self.config.delay_deletes {
                let delayed = self.delete_events.lock().remove(&remote_ref);
                if let Some((_, mut delayed)) = delayed {
                    if !moved {
                        info!("Delayed deletion of {} was a move to {}", delayed, rel);
                        delayed.local_state = SideState::Moved;
                        store.update_local_state(&delayed, &local.get_info(rel)?, true, true)?;
                    }
                    return Ok(());
                }
            }

            if moved {
                return Ok(());
            }
            if from_pair.is_some() {
                info!("Copy paste of {} to {}", remote_ref, rel);
                local.remove_remote_id(rel)?;
            }
        }

        let info = local.get_info(rel)?;
        info!("New {} {}", kind_of(&info), rel);
        self.insert_local(&info, &parent)?;
        if info.folderish {
            self.scan_pair(rel)?;
        }
        Ok(())
    }

    fn schedule_folder_scan(&self, pair: &DocPair) {
        if !self.config.schedule_folder_scans {
            return;
        }
        trace!("Scheduling a scan of {}", pair.local_path);
        self.folder_scan_events
            .lock()
            .insert(pair.local_path.clone(), (Instant::now(), pair.clone()));
    }

    /// Handle the delayed deletions and folder scans that are due, or all of
    /// them with `force`.
    pub fn flush_delayed(&self, force: bool) -> Result<()> {
        let now = Instant::now();
        for pair in take_expired(&self.delete_events, now, self.config.delete_delay, force) {
            self.check_deletion(&pair)?;
        }
        for pair in take_expired(&self.folder_scan_events, now, self.config.folder_scan_delay, force) {
            if self.ctx.local.exists(&pair.local_path) {
                debug!("Scheduled scan of {}", pair.local_path);
                self.scan_pair(&pair.local_path)?;
            }
        }
        Ok(())
    }

    /// Absolute path of a local ref, for callers feeding events by hand.
    pub fn abspath(&self, rel: &str) -> Result<PathBuf> {
        Ok(self.ctx.local.abspath(rel)?)
    }
}

fn take_expired(pending: &DelayedPairs, now: Instant, delay: Duration, force: bool) -> Vec<DocPair> {
    let mut pending = pending.lock();
    let due: Vec<String> = pending
        .iter()
        .filter(|(_, (at, _))| force || now.duration_since(*at) >= delay)
        .map(|(key, _)| key.clone())
        .collect();
    due.into_iter()
        .filter_map(|key| pending.remove(&key))
        .map(|(_, pair)| pair)
        .collect()
}

fn kind_of(info: &LocalFileInfo) -> &'static str {
    if info.folderish {
        "folder"
    } else {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{fixture, Fixture};
    use ndrive_client::local::xattr;

    fn watcher(f: &Fixture) -> &LocalWatcher {
        f.engine.local_watcher()
    }

    fn pair_at(f: &Fixture, path: &str) -> DocPair {
        f.engine.store().get_state_from_local(path).unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_scan_inserts_new_items_once() {
        let f = fixture().await;
        let local = f.engine.local();
        local.make_folder("/Workspace", "docs").unwrap();
        local.make_file("/Workspace/docs", "a.txt", Some(b"a")).unwrap();

        let control = WorkerControl::new();
        watcher(&f).scan(&control).await.unwrap();
        let docs = pair_at(&f, "/Workspace/docs");
        assert_eq!(docs.pair_state, PairState::LocallyCreated);
        let file = pair_at(&f, "/Workspace/docs/a.txt");
        assert_eq!(file.pair_state, PairState::LocallyCreated);
        assert_eq!(file.local_digest.as_deref(), Some("0cc175b9c0f1b6a831c399e269772661"));
        assert_eq!(watcher(&f).metrics().new_files, 2);

        let before = f.engine.store().get_state_from_id(file.id).unwrap().unwrap();
        watcher(&f).scan(&control).await.unwrap();
        let after = f.engine.store().get_state_from_id(file.id).unwrap().unwrap();
        assert_eq!(before.version, after.version);
        assert_eq!(watcher(&f).metrics().new_files, 2);
    }

    #[tokio::test]
    async fn test_scan_marks_missing_items_deleted() {
        let f = fixture().await;
        let id = f.synced_file("/Workspace", "gone.txt", b"bye").await;
        std::fs::remove_file(f.engine.local().abspath("/Workspace/gone.txt").unwrap()).unwrap();

        watcher(&f).scan(&WorkerControl::new()).await.unwrap();
        let pair = f.engine.store().get_state_from_id(id).unwrap().unwrap();
        assert_eq!(pair.pair_state, PairState::LocallyDeleted);
        assert_eq!(watcher(&f).metrics().delete_files, 1);
    }

    #[tokio::test]
    async fn test_scan_detects_move_by_remote_id() {
        let f = fixture().await;
        let local = f.engine.local();
        local.make_folder("/Workspace", "sub").unwrap();
        let id = f.synced_file("/Workspace", "doc.txt", b"doc").await;
        std::fs::rename(
            local.abspath("/Workspace/doc.txt").unwrap(),
            local.abspath("/Workspace/sub/doc.txt").unwrap(),
        )
        .unwrap();

        watcher(&f).scan(&WorkerControl::new()).await.unwrap();
        let pair = f.engine.store().get_state_from_id(id).unwrap().unwrap();
        assert_eq!(pair.local_path, "/Workspace/sub/doc.txt");
        assert_eq!(pair.pair_state, PairState::LocallyMoved);
    }

    #[tokio::test]
    async fn test_modified_event_updates_digest() {
        let f = fixture().await;
        let id = f.synced_file("/Workspace", "note.txt", b"one").await;
        let local = f.engine.local();
        local.update_content("/Workspace/note.txt", b"two").unwrap();

        let path = local.abspath("/Workspace/note.txt").unwrap();
        watcher(&f).handle_event(&FsEvent::Modified(path)).unwrap();
        let pair = f.engine.store().get_state_from_id(id).unwrap().unwrap();
        assert_eq!(pair.pair_state, PairState::LocallyModified);
        assert_eq!(pair.local_digest.as_deref(), Some("b8a9f715dbb64fd5c56e7783c6820a61"));
        assert_eq!(pair.processor, 0);
    }

    #[tokio::test]
    async fn test_copy_in_progress_keeps_remote_id() {
        let f = fixture().await;
        let id = f.synced_file("/Workspace", "big.txt", b"one").await;
        let local = f.engine.local();
        let path = local.abspath("/Workspace/big.txt").unwrap();
        local.update_content("/Workspace/big.txt", b"two").unwrap();
        watcher(&f).handle_event(&FsEvent::Modified(path.clone())).unwrap();
        let modified = f.engine.store().get_state_from_id(id).unwrap().unwrap();
        assert_eq!(modified.pair_state, PairState::LocallyModified);

        // The writer replaced the file and dropped its metadata
        local.remove_remote_id("/Workspace/big.txt").unwrap();
        local.update_content("/Workspace/big.txt", b"three and more").unwrap();
        watcher(&f).handle_event(&FsEvent::Modified(path)).unwrap();

        let pair = f.engine.store().get_state_from_id(id).unwrap().unwrap();
        assert_eq!(pair.version, modified.version);
        assert_eq!(pair.local_digest, modified.local_digest);
        assert_eq!(local.get_remote_id("/Workspace/big.txt"), pair.remote_ref);
    }

    #[tokio::test]
    async fn test_touch_without_change_keeps_pair_synchronized() {
        let f = fixture().await;
        let id = f.synced_file("/Workspace", "same.txt", b"same").await;
        let local = f.engine.local();
        local.update_content("/Workspace/same.txt", b"same").unwrap();

        let path = local.abspath("/Workspace/same.txt").unwrap();
        watcher(&f).handle_event(&FsEvent::Modified(path)).unwrap();
        let pair = f.engine.store().get_state_from_id(id).unwrap().unwrap();
        assert_eq!(pair.pair_state, PairState::Synchronized);
    }

    #[tokio::test]
    async fn test_deleted_event() {
        let f = fixture().await;
        let id = f.synced_file("/Workspace", "del.txt", b"x").await;
        let path = f.engine.local().abspath("/Workspace/del.txt").unwrap();
        std::fs::remove_file(&path).unwrap();

        watcher(&f).handle_event(&FsEvent::Deleted(path)).unwrap();
        let pair = f.engine.store().get_state_from_id(id).unwrap().unwrap();
        assert_eq!(pair.pair_state, PairState::LocallyDeleted);
    }

    #[tokio::test]
    async fn test_moved_event_and_cancelled_move() {
        let f = fixture().await;
        let id = f.synced_file("/Workspace", "m.txt", b"m").await;
        let local = f.engine.local();
        let from = local.abspath("/Workspace/m.txt").unwrap();
        let to = local.abspath("/Workspace/n.txt").unwrap();
        std::fs::rename(&from, &to).unwrap();
        watcher(&f)
            .handle_event(&FsEvent::Moved { from: from.clone(), to: to.clone() })
            .unwrap();
        let pair = f.engine.store().get_state_from_id(id).unwrap().unwrap();
        assert_eq!(pair.local_path, "/Workspace/n.txt");
        assert_eq!(pair.pair_state, PairState::LocallyMoved);

        std::fs::rename(&to, &from).unwrap();
        watcher(&f)
            .handle_event(&FsEvent::Moved { from: to, to: from })
            .unwrap();
        let pair = f.engine.store().get_state_from_id(id).unwrap().unwrap();
        assert_eq!(pair.local_path, "/Workspace/m.txt");
        assert_eq!(pair.pair_state, PairState::Synchronized);
    }

    #[tokio::test]
    async fn test_copy_of_bound_file_is_a_new_creation() {
        let f = fixture().await;
        let id = f.synced_file("/Workspace", "orig.txt", b"o").await;
        let local = f.engine.local();
        let remote_ref = local.get_remote_id("/Workspace/orig.txt").unwrap();
        local.make_file("/Workspace", "copy.txt", Some(b"o")).unwrap();
        local.set_remote_id("/Workspace/copy.txt", &remote_ref).unwrap();

        let path = local.abspath("/Workspace/copy.txt").unwrap();
        watcher(&f).handle_event(&FsEvent::Created(path)).unwrap();
        let copy = pair_at(&f, "/Workspace/copy.txt");
        assert_eq!(copy.pair_state, PairState::LocallyCreated);
        assert!(local.get_remote_id("/Workspace/copy.txt").is_none());
        let orig = f.engine.store().get_state_from_id(id).unwrap().unwrap();
        assert_eq!(orig.pair_state, PairState::Synchronized);
    }

    #[tokio::test]
    async fn test_ignored_and_temporary_names() {
        let f = fixture().await;
        let local = f.engine.local();
        local.make_file("/Workspace", "~$doc.docx", Some(b"lock")).unwrap();
        local.make_file("/Workspace", ".report.txt.nxpart", Some(b"part")).unwrap();
        for name in ["~$doc.docx", ".report.txt.nxpart"] {
            let path = local.abspath(&format!("/Workspace/{}", name)).unwrap();
            watcher(&f).handle_event(&FsEvent::Created(path)).unwrap();
        }
        assert!(f.engine.store().get_local_children("/Workspace").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_root_events() {
        let f = fixture().await;
        let mut events = f.engine.subscribe();
        let root = f.engine.local().base_folder().to_path_buf();
        let elsewhere = root.with_file_name("moved-root");
        watcher(&f)
            .handle_event(&FsEvent::Moved { from: root, to: elsewhere.clone() })
            .unwrap();
        assert_eq!(
            events.try_recv().unwrap(),
            EngineEvent::RootMoved { new_path: elsewhere }
        );
    }

    #[tokio::test]
    async fn test_delayed_deletion_turned_into_move() {
        let f = fixture().await;
        let id = f.synced_file("/Workspace", "w.txt", b"w").await;
        let watcher = LocalWatcher::new(
            f.engine.context().clone(),
            LocalWatcherConfig {
                delay_deletes: true,
                ..LocalWatcherConfig::default()
            },
        );
        let local = f.engine.local();
        let from = local.abspath("/Workspace/w.txt").unwrap();
        let to = local.abspath("/Workspace/w2.txt").unwrap();
        std::fs::rename(&from, &to).unwrap();

        watcher.handle_event(&FsEvent::Deleted(from)).unwrap();
        assert_eq!(
            f.engine.store().get_state_from_id(id).unwrap().unwrap().pair_state,
            PairState::Synchronized
        );
        watcher.handle_event(&FsEvent::Created(to)).unwrap();
        let pair = f.engine.store().get_state_from_id(id).unwrap().unwrap();
        assert_eq!(pair.local_path, "/Workspace/w2.txt");
        assert_eq!(pair.pair_state, PairState::LocallyMoved);
        watcher.flush_delayed(true).unwrap();
        assert_eq!(
            f.engine.store().get_state_from_id(id).unwrap().unwrap().pair_state,
            PairState::LocallyMoved
        );
    }

    #[tokio::test]
    async fn test_scan_restores_missing_remote_id() {
        let f = fixture().await;
        f.synced_file("/Workspace", "x.txt", b"x").await;
        let local = f.engine.local();
        let abspath = local.abspath("/Workspace/x.txt").unwrap();
        let remote_ref = xattr::get(&abspath, xattr::REMOTE_ID).unwrap();
        local.remove_remote_id("/Workspace/x.txt").unwrap();
        let old = chrono::Utc::now() - chrono::Duration::hours(1);
        local.change_file_date("/Workspace/x.txt", old).unwrap();

        watcher(&f).scan(&WorkerControl::new()).await.unwrap();
        assert_eq!(local.get_remote_id("/Workspace/x.txt"), Some(remote_ref));
        assert_eq!(pair_at(&f, "/Workspace/x.txt").pair_state, PairState::Synchronized);
    }
}
