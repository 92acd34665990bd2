//! Remote side of an engine
//!
//! A full scan of the remote tree on the first start, then a polling loop
//! over the server change summary. The watcher never touches the local
//! filesystem content: every change goes through the store.

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use ndrive_client::names::{child_path, safe_filename, COLLECTION_SYNC_ROOT_FACTORY_NAME, ROOT};
use ndrive_client::{ChangeSummary, RemoteFileInfo};
use ndrive_index::{DocPair, PairState, RemoteUpdate, SideState};
use ndrive_sync::{EngineEvent, SyncContext, SyncError, WorkerControl};

use crate::engine::EngineState;
use crate::errors::{EngineError, Result};

const LAST_FULL_SCAN: &str = "remote_last_full_scan";
const NEED_FULL_SCAN: &str = "remote_need_full_scan";
const LAST_SYNC_DATE: &str = "remote_last_sync_date";
const LAST_EVENT_LOG_ID: &str = "remote_last_event_log_id";
const LAST_ROOT_DEFINITIONS: &str = "remote_last_event_last_root_definitions";

#[derive(Debug, Clone)]
pub struct RemoteWatcherConfig {
    /// Time between two polls of the change summary
    pub delay: Duration,
    pub scroll_batch_size: usize,
    /// Walk the tree with the scroll API when the server supports it
    pub use_scroll: bool,
}

impl Default for RemoteWatcherConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(30),
            scroll_batch_size: 100,
            use_scroll: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RemoteWatcherMetrics {
    pub last_remote_scan_time_ms: Option<u64>,
    pub last_remote_update_time_ms: Option<u64>,
    /// Changes in the last non-empty summary
    pub last_changes: usize,
    /// Polls in a row without any change
    pub empty_polls: u64,
}

pub struct RemoteWatcher {
    ctx: Arc<SyncContext>,
    state: Arc<EngineState>,
    config: RemoteWatcherConfig,
    metrics: Mutex<RemoteWatcherMetrics>,
}

impl RemoteWatcher {
    pub fn new(ctx: Arc<SyncContext>, state: Arc<EngineState>, config: RemoteWatcherConfig) -> Self {
        Self {
            ctx,
            state,
            config,
            metrics: Mutex::new(RemoteWatcherMetrics::default()),
        }
    }

    pub fn config(&self) -> &RemoteWatcherConfig {
        &self.config
    }

    pub fn metrics(&self) -> RemoteWatcherMetrics {
        self.metrics.lock().clone()
    }

    /// Poll the server until stopped.
    pub async fn run(&self, control: WorkerControl) -> Result<()> {
        info!("RemoteWatcher starting, polling every {:?}", self.config.delay);
        loop {
            control.interact().await?;
            if self.state.is_offline() && !self.check_online().await {
                control.sleep(self.config.delay).await?;
                continue;
            }
            self.handle_changes(&control).await?;
            control.sleep(self.config.delay).await?;
        }
    }

    /// Whether the server answers again, leaving the offline state if so.
    async fn check_online(&self) -> bool {
        if self.state.has_invalid_credentials() {
            return false;
        }
        match self.ctx.remote.get_filesystem_root_info().await {
            Ok(_) => {
                self.state.set_offline(false);
                true
            }
            Err(e) => {
                debug!("Server still unreachable: {}", e);
                false
            }
        }
    }

    /// One polling round. Returns false when it failed and should be retried
    /// at the next tick.
    pub async fn handle_changes(&self, control: &WorkerControl) -> Result<bool> {
        match self.poll(control).await {
            Ok(()) => {
                self.ctx.emit(EngineEvent::Updated);
                Ok(true)
            }
            Err(e) if e.is_interrupt() => Err(e),
            Err(e) if e.is_unauthorized() => {
                error!("Invalid credentials: {}", e);
                self.state.set_invalid_credentials(true);
                self.state.set_offline(true);
                Ok(false)
            }
            Err(e) if is_connection_error(&e) => {
                warn!("Server unreachable: {}", e);
                self.state.set_offline(true);
                Ok(false)
            }
            Err(e) => {
                error!("Cannot handle remote changes: {}", e);
                Ok(false)
            }
        }
    }

    async fn poll(&self, control: &WorkerControl) -> Result<()> {
        let store = &self.ctx.store;
        if store.get_config(LAST_FULL_SCAN)?.is_none() {
            return self.scan_remote(control).await;
        }
        if store.get_config(NEED_FULL_SCAN)?.is_some() {
            return self.scan_remote(control).await;
        }
        let start = Instant::now();
        self.update_remote_states(control).await?;
        self.scan_pending_paths(control).await?;
        self.metrics.lock().last_remote_update_time_ms = Some(start.elapsed().as_millis() as u64);
        Ok(())
    }

    async fn get_changes(&self) -> Result<ChangeSummary> {
        let store = &self.ctx.store;
        let log_id = store
            .get_config(LAST_EVENT_LOG_ID)?
            .and_then(|v| v.parse::<i64>().ok());
        let last_sync_date = store
            .get_config(LAST_SYNC_DATE)?
            .and_then(|v| v.parse::<i64>().ok());
        let roots = store.get_config_or(LAST_ROOT_DEFINITIONS, "")?;
        trace!(
            "Getting changes since log id {:?}, date {:?}",
            log_id,
            last_sync_date
        );
        Ok(self
            .ctx
            .remote
            .get_changes(&roots, log_id, last_sync_date)
            .await?)
    }

    fn save_changes_state(&self, summary: &ChangeSummary) -> Result<()> {
        let store = &self.ctx.store;
        store.update_config(LAST_SYNC_DATE, Some(&summary.sync_date.to_string()))?;
        if let Some(upper_bound) = summary.upper_bound {
            store.update_config(LAST_EVENT_LOG_ID, Some(&upper_bound.to_string()))?;
        }
        store.update_config(
            LAST_ROOT_DEFINITIONS,
            Some(&summary.active_synchronization_root_definitions),
        )?;
        Ok(())
    }

    fn filtered(&self, info: &RemoteFileInfo) -> bool {
        self.ctx.store.is_filter(&info.path)
    }

    /// Full scan of the remote tree from the top level folder.
    pub async fn scan_remote(&self, control: &WorkerControl) -> Result<()> {
        let start = Instant::now();
        let store = &self.ctx.store;
        let root_pair = store
            .get_state_from_local(ROOT)?
            .ok_or_else(|| SyncError::IllegalState("the sync root is not bound".to_string()))?;
        let root_info = self.ctx.remote.get_filesystem_root_info().await?;
        store.update_remote_state(&root_pair, &root_info, Some(""), RemoteUpdate::unversioned())?;
        let root_pair = store
            .get_state_from_id(root_pair.id)?
            .ok_or_else(|| SyncError::IllegalState("the sync root pair vanished".to_string()))?;

        // Later polls start from now
        let summary = self.get_changes().await?;
        self.save_changes_state(&summary)?;

        info!("Full remote scan of {}", root_info.name);
        self.scan_remote_from(root_pair, root_info, control).await?;

        store.update_config(LAST_FULL_SCAN, Some(&Utc::now().to_rfc3339()))?;
        store.delete_config(NEED_FULL_SCAN)?;
        store.clean_scanned()?;
        let elapsed = start.elapsed().as_millis() as u64;
        self.metrics.lock().last_remote_scan_time_ms = Some(elapsed);
        info!("Full remote scan done in {}ms", elapsed);
        self.ctx.emit(EngineEvent::RemoteScanFinished);
        Ok(())
    }

    async fn scan_remote_from(&self, pair: DocPair, info: RemoteFileInfo, control: &WorkerControl) -> Result<()> {
        if self.config.use_scroll && info.can_scroll_descendants {
            match self.scan_remote_scroll(&pair, &info, control).await {
                Err(EngineError::Client(e)) if e.status() == Some(404) => {
                    debug!("Scroll API not available, falling back to a recursive scan");
                }
                other => return other,
            }
        }
        self.scan_remote_tree(pair, info, true, control).await
    }

    /// Walk every descendant through the scroll API, parents first.
    async fn scan_remote_scroll(&self, pair: &DocPair, info: &RemoteFileInfo, control: &WorkerControl) -> Result<()> {
        let store = &self.ctx.store;
        let mut scroll_id: Option<String> = None;
        let mut seen: HashSet<String> = HashSet::new();
        loop {
            control.interact().await?;
            let batch = self
                .ctx
                .remote
                .scroll_descendants(&info.uid, scroll_id.as_deref(), self.config.scroll_batch_size)
                .await?;
            if batch.items.is_empty() {
                break;
            }
            let mut items = batch.items;
            items.sort_by(|a, b| a.path.cmp(&b.path));
            for child in items {
                if self.filtered(&child) {
                    debug!("Ignoring filtered {}", child.path);
                    continue;
                }
                seen.insert(child.uid.clone());
                match store.get_normal_state_from_remote(&child.uid)? {
                    Some(mut child_pair) => {
                        let parent_path = remote_parent_path(&child.path);
                        if is_modified(&child_pair, &child) {
                            child_pair.remote_state = SideState::Modified;
                        }
                        store.update_remote_state(&child_pair, &child, Some(&parent_path), RemoteUpdate::default())?;
                    }
                    None => {
                        let Some(parent_uid) = &child.parent_uid else {
                            continue;
                        };
                        match store.get_normal_state_from_remote(parent_uid)? {
                            Some(parent) => {
                                self.find_remote_child_match_or_create(&parent, &child).await?;
                            }
                            None => debug!("No parent pair for {}, skipping", child.path),
                        }
                    }
                }
            }
            scroll_id = batch.scroll_id;
        }

        for descendant in store.get_remote_descendants(&pair.remote_path())? {
            let Some(remote_ref) = &descendant.remote_ref else {
                continue;
            };
            if !seen.contains(remote_ref) && descendant.remote_state != SideState::Deleted {
                info!("{} is gone from the server", descendant);
                store.delete_remote_state(&descendant)?;
            }
        }
        store.add_path_scanned(&pair.remote_path())?;
        Ok(())
    }

    /// Compare the remote children of `pair` with the store, folder by folder.
    /// Without `force`, folders already scanned in this session are skipped.
    async fn scan_remote_tree(
        &self,
        pair: DocPair,
        info: RemoteFileInfo,
        force: bool,
        control: &WorkerControl,
    ) -> Result<()> {
        let store = &self.ctx.store;
        let mut stack = vec![(pair, info)];
        while let Some((pair, info)) = stack.pop() {
            control.interact().await?;
            if !force && store.is_path_scanned(&info.path)? {
                trace!("{} already scanned", info.path);
                continue;
            }
            let Some(pair_ref) = pair.remote_ref.clone() else {
                continue;
            };
            let parent_path = pair.remote_path();
            let mut db_children: HashMap<String, DocPair> = store
                .get_remote_children(&pair_ref)?
                .into_iter()
                .filter_map(|c| c.remote_ref.clone().map(|r| (r, c)))
                .collect();

            let mut to_scan = Vec::new();
            for child in self.ctx.remote.get_fs_children(&info.uid).await? {
                if self.filtered(&child) {
                    debug!("Ignoring filtered {}", child.path);
                    continue;
                }
                let child_pair = match db_children.remove(&child.uid) {
                    Some(mut child_pair) => {
                        if is_modified(&child_pair, &child) {
                            child_pair.remote_state = SideState::Modified;
                        }
                        store.update_remote_state(&child_pair, &child, Some(&parent_path), RemoteUpdate::default())?;
                        store.get_state_from_id(child_pair.id)?
                    }
                    None => self.find_remote_child_match_or_create(&pair, &child).await?,
                };
                if let Some(child_pair) = child_pair.filter(|_| child.folderish) {
                    to_scan.push((child_pair, child));
                }
            }

            for gone in db_children.into_values() {
                if gone.remote_state != SideState::Deleted {
                    info!("{} is gone from the server", gone);
                    store.delete_remote_state(&gone)?;
                }
            }
            store.add_path_scanned(&info.path)?;
            stack.extend(to_scan.into_iter().rev());
        }
        Ok(())
    }

    /// Bind `info` to a local pair waiting for it, or record it as a remote
    /// creation under `parent`.
    async fn find_remote_child_match_or_create(
        &self,
        parent: &DocPair,
        info: &RemoteFileInfo,
    ) -> Result<Option<DocPair>> {
        let store = &self.ctx.store;
        let local = &self.ctx.local;
        if self.filtered(info) {
            return Ok(None);
        }
        let local_path = child_path(&parent.local_path, &safe_filename(&info.name));
        let remote_parent_path = parent.remote_path();

        let mut child_pair = store.get_state_from_local(&local_path)?;
        if child_pair.is_none() && local.exists(&parent.local_path) {
            // Renamed or deduplicated locally
            for child in local.get_children_info(&parent.local_path)? {
                if child.remote_ref.as_deref() == Some(info.uid.as_str()) {
                    debug!("Found {} locally as {}", info.name, child.path);
                    child_pair = store.get_state_from_local(&child.path)?;
                    break;
                }
            }
        }

        if let Some(mut pair) = child_pair {
            if pair.remote_ref.is_some() && pair.remote_ref.as_deref() != Some(info.uid.as_str()) {
                debug!("{} is bound to another remote item", pair);
            } else {
                let same_content = pair.folderish == info.folderish
                    && local.is_equal_digests(
                        pair.local_digest.as_deref(),
                        info.digest.as_deref(),
                        &pair.local_path,
                        info.digest_algorithm,
                        None,
                    )?;
                if same_content && pair.local_path != local_path {
                    info!("{} was renamed locally, keeping the local name", pair);
                    pair.local_state = SideState::Moved;
                    pair.remote_state = SideState::Synchronized;
                    let local_info = local.get_info(&pair.local_path)?;
                    store.update_local_state(&pair, &local_info, false, false)?;
                    store.update_remote_state(&pair, info, Some(&remote_parent_path), RemoteUpdate::default())?;
                } else if same_content {
                    let updated = store.update_remote_state(
                        &pair,
                        info,
                        Some(&remote_parent_path),
                        RemoteUpdate::default(),
                    )?;
                    let version = pair.version + i64::from(updated);
                    let refreshed = store.get_state_from_id(pair.id)?.unwrap_or(pair.clone());
                    if store.synchronize_state(&refreshed, Some(version), false)? {
                        info!("{} matches its remote item", refreshed);
                        local.set_remote_id(&refreshed.local_path, &info.uid)?;
                    }
                } else {
                    pair.remote_state = SideState::Modified;
                    store.update_remote_state(&pair, info, Some(&remote_parent_path), RemoteUpdate::default())?;
                }
                return Ok(store.get_state_from_id(pair.id)?);
            }
        }

        let id = store.insert_remote_state(info, &remote_parent_path, &local_path, &parent.local_path)?;
        match id {
            Some(id) => {
                debug!("Remote creation of {} at {}", info.name, local_path);
                Ok(store.get_state_from_id(id)?)
            }
            None => Ok(store.get_normal_state_from_remote(&info.uid)?),
        }
    }

    /// Apply the change summary since the last poll.
    pub async fn update_remote_states(&self, control: &WorkerControl) -> Result<()> {
        let store = &self.ctx.store;
        let summary = self.get_changes().await?;

        if summary.has_too_many_changes {
            info!("Too many changes on the server, a full scan is needed");
            store.add_path_to_scan(ROOT)?;
            self.save_changes_state(&summary)?;
            return Ok(());
        }

        let mut changes = summary.file_system_changes.clone();
        changes.sort_by(|a, b| b.event_date.cmp(&a.event_date));
        {
            let mut metrics = self.metrics.lock();
            if changes.is_empty() {
                metrics.empty_polls += 1;
            } else {
                metrics.empty_polls = 0;
                metrics.last_changes = changes.len();
            }
        }
        if changes.is_empty() {
            self.ctx.emit(EngineEvent::NoChangesFound);
        } else {
            debug!("Processing {} remote changes", changes.len());
        }

        let mut refreshed: HashSet<String> = HashSet::new();
        let mut delete_queue: Vec<DocPair> = Vec::new();
        for change in changes {
            control.interact().await?;
            let remote_ref = change.file_system_item_id.as_str();
            if refreshed.iter().any(|r| r.ends_with(remote_ref)) {
                // A more recent event was applied already
                continue;
            }
            let new_info = change.file_system_item.as_ref();
            if new_info.map_or(false, |i| self.filtered(i)) {
                debug!("Ignoring change on filtered {}", remote_ref);
                continue;
            }

            let mut pairs = store.get_states_from_remote(remote_ref)?;
            if pairs.is_empty() {
                pairs.extend(store.get_first_state_from_partial_remote(remote_ref)?);
            }

            let mut updated = false;
            for pair in pairs {
                let event = change.event_id.as_str();
                match new_info {
                    None if event == "deleted" => {
                        if pair.local_path == ROOT {
                            continue;
                        }
                        debug!("Queueing deletion of {}", pair);
                        delete_queue.push(pair);
                    }
                    Some(_) if event == "deleted" => {
                        debug!("Ignoring deletion of {}, the item still exists", pair);
                        updated = true;
                        break;
                    }
                    None => {
                        if event == "securityUpdated" {
                            info!("Read access to {} was removed", pair);
                            store.delete_remote_state(&pair)?;
                        } else {
                            debug!("Unknown event {} on {}", event, pair);
                        }
                    }
                    Some(info) => {
                        let pair_factory = pair
                            .remote_parent_ref
                            .as_deref()
                            .and_then(|r| r.split('#').next())
                            .unwrap_or_default();
                        let info_factory = info
                            .parent_uid
                            .as_deref()
                            .and_then(|r| r.split('#').next())
                            .unwrap_or_default();
                        if event == "documentMoved" && pair_factory == COLLECTION_SYNC_ROOT_FACTORY_NAME {
                            // Moved from a collection to a sync root: handled as a creation
                            break;
                        }
                        if event == "documentMoved" && info_factory == COLLECTION_SYNC_ROOT_FACTORY_NAME {
                            info!("{} moved out of the sync roots", pair);
                            store.delete_remote_state(&pair)?;
                        } else {
                            self.refresh_pair(pair, info, event, control).await?;
                        }
                    }
                }
                updated = true;
                refreshed.insert(remote_ref.to_string());
            }

            if let (Some(info), false) = (new_info, updated) {
                let mut created = false;
                if let Some(parent_uid) = &info.parent_uid {
                    if let Some(parent) = store.get_states_from_remote(parent_uid)?.into_iter().next() {
                        if let Some(child) = self.find_remote_child_match_or_create(&parent, info).await? {
                            if child.folderish && child.pair_state == PairState::RemotelyCreated {
                                debug!("Scanning the content of new folder {}", child.remote_path());
                                self.scan_remote_tree(child, info.clone(), false, control).await?;
                            }
                        }
                        created = true;
                        refreshed.insert(remote_ref.to_string());
                    }
                }
                if !created {
                    debug!("No bound parent for changed item {}", info.path);
                }
            }
        }

        delete_queue.sort_by(|a, b| a.local_path.cmp(&b.local_path));
        let mut deleted: Vec<String> = Vec::new();
        for pair in delete_queue {
            if deleted.iter().any(|p| pair.local_path.starts_with(&format!("{}/", p))) {
                continue;
            }
            let Some(remote_ref) = &pair.remote_ref else {
                continue;
            };
            if self.ctx.remote.get_fs_item(remote_ref, None).await?.is_some() {
                debug!("{} still exists on the server", pair);
                continue;
            }
            info!("{} was deleted on the server", pair);
            store.delete_remote_state(&pair)?;
            deleted.push(pair.local_path.clone());
        }

        self.save_changes_state(&summary)?;
        Ok(())
    }

    async fn refresh_pair(
        &self,
        mut pair: DocPair,
        info: &RemoteFileInfo,
        event: &str,
        control: &WorkerControl,
    ) -> Result<()> {
        let store = &self.ctx.store;
        if pair.remote_state == SideState::Created {
            return Ok(());
        }
        let lock_event = matches!(event, "documentLocked" | "documentUnlocked");
        if info.digest != pair.local_digest
            || pair.local_name.as_deref() != Some(safe_filename(&info.name).as_str())
            || info.parent_uid != pair.remote_parent_ref
        {
            pair.remote_state = SideState::Modified;
        }
        debug!("Refreshing remote state of {} ({})", pair, event);
        let parent_path = remote_parent_path(&info.path);
        let options = if lock_event {
            RemoteUpdate::forced()
        } else {
            RemoteUpdate::default()
        };
        store.update_remote_state(&pair, info, Some(&parent_path), options)?;

        if pair.folderish {
            if event == "securityUpdated" {
                store.add_path_to_scan(&format!("{}/{}", parent_path, info.uid))?;
            } else if event == "documentMoved" {
                if let Some(fresh) = store.get_state_from_id(pair.id)? {
                    self.scan_remote_tree(fresh, info.clone(), false, control).await?;
                }
            }
        }
        if lock_event {
            if let Some(fresh) = store.get_state_from_id(pair.id)? {
                self.handle_readonly(&fresh, info);
            }
        }
        Ok(())
    }

    /// Mirror the remote write permission and lock on the local file.
    fn handle_readonly(&self, pair: &DocPair, info: &RemoteFileInfo) {
        let local = &self.ctx.local;
        let locked_by_other = info
            .lock_owner
            .as_deref()
            .map_or(false, |owner| owner != self.ctx.remote.user_id());
        let readonly = locked_by_other
            || if pair.folderish {
                !pair.remote_can_create_child
            } else {
                !pair.remote_can_update
            };
        let result = if readonly {
            local.set_readonly(&pair.local_path)
        } else {
            local.unset_readonly(&pair.local_path)
        };
        if let Err(e) = result {
            warn!("Cannot update the readonly flag of {}: {}", pair.local_path, e);
        }
        if locked_by_other {
            self.ctx.emit(EngineEvent::NewLocked {
                filename: pair.name().to_string(),
                owner: info.lock_owner.clone().unwrap_or_default(),
                created: info.lock_created,
            });
        }
    }

    /// Rescan the remote paths queued by previous polls.
    async fn scan_pending_paths(&self, control: &WorkerControl) -> Result<()> {
        let store = &self.ctx.store;
        for path in store.get_paths_to_scan()? {
            control.interact().await?;
            if path == ROOT {
                store.update_config(NEED_FULL_SCAN, Some(ROOT))?;
                store.delete_path_to_scan(&path)?;
                return self.scan_remote(control).await;
            }
            let (parent, remote_ref) = path.rsplit_once('/').unwrap_or(("", path.as_str()));
            let pair = store.get_state_from_remote_with_path(remote_ref, parent)?;
            match (pair, self.ctx.remote.get_fs_item(remote_ref, None).await?) {
                (Some(pair), Some(info)) => {
                    info!("Partial scan of {}", path);
                    self.scan_remote_tree(pair, info, true, control).await?;
                }
                (Some(pair), None) => store.delete_remote_state(&pair)?,
                (None, _) => debug!("Nothing to scan at {}", path),
            }
            store.delete_path_to_scan(&path)?;
        }
        Ok(())
    }
}

/// Whether the listed `info` differs from what the store knows.
fn is_modified(pair: &DocPair, info: &RemoteFileInfo) -> bool {
    pair.remote_can_delete != info.can_delete
        || pair.remote_can_rename != info.can_rename
        || pair.remote_can_update != info.can_update
        || pair.remote_can_create_child != info.can_create_child
        || pair.remote_name.as_deref() != Some(info.name.as_str())
        || pair.remote_digest != info.digest
        || pair.remote_parent_ref != info.parent_uid
}

fn remote_parent_path(path: &str) -> String {
    path.rsplit_once('/').map(|(p, _)| p.to_string()).unwrap_or_default()
}

fn is_connection_error(error: &EngineError) -> bool {
    match error {
        EngineError::Client(e) | EngineError::Sync(SyncError::Client(e)) => e.is_connection_error(),
        _ => false,
    }
}
