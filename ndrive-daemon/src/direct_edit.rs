//! Direct Edit
//!
//! Opens one server document outside of any sync root: the blob is
//! downloaded into its own folder under the Direct Edit root, the folder is
//! tagged with everything needed to send it back, and a watcher uploads the
//! file whenever the editor saves it. Office and LibreOffice lock files
//! drive the server lock of the document.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use percent_encoding::percent_decode_str;
use regex::Regex;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use url::Url;

use ndrive_client::local::{unset_path_readonly, xattr};
use ndrive_client::names::{
    basename, download_tmp_name, is_lock_file, is_temp_file, parent_path, safe_filename, ROOT,
    UNACCESSIBLE_HASH,
};
use ndrive_client::remote::doc_uid_from_fs_id;
use ndrive_client::{ClientError, DigestAlgorithm, LocalClient, RemoteDocument};
use ndrive_index::{FsEvent, FsEventSource, ManagerStore};
use ndrive_sync::{EngineEvent, EventBus, SyncError, WorkerControl};

use crate::engine::Engine;
use crate::errors::{EngineError, Result};
use crate::manager::{open_local_file, EngineRegistry};

const DEFAULT_XPATH: &str = "file:content";
const NOTE_XPATH: &str = "note:note";

#[derive(Debug, Clone)]
pub struct DirectEditConfig {
    /// Root of the edited documents, one sub folder per document
    pub folder: PathBuf,
    /// Longest wait for an event before the queues are checked
    pub tick: Duration,
    /// Delay before a failed upload is tried again
    pub error_delay: Duration,
    /// Lock the document on the server while an editor holds a lock file
    pub use_autolock: bool,
    /// Launch the default application on the downloaded file
    pub open_files: bool,
}

impl Default for DirectEditConfig {
    fn default() -> Self {
        Self {
            folder: std::env::temp_dir().join("ndrive_edit"),
            tick: Duration::from_millis(500),
            error_delay: Duration::from_secs(30),
            use_autolock: true,
            open_files: true,
        }
    }
}

/// A parsed `nxdrive://edit/...` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditRequest {
    pub server_url: String,
    pub user: Option<String>,
    pub repo: Option<String>,
    pub doc_id: String,
    pub filename: Option<String>,
    pub download_url: Option<String>,
}

fn edit_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(concat!(
            r"(?i)^nxdrive://edit/(?P<scheme>\w*)/(?P<server>.*)/",
            r"user/(?P<user>.*)/repo/(?P<repo>.*)/",
            r"nxdocid/(?P<docid>[0-9a-fA-F\-]*)/filename/(?P<filename>[^/]*)",
            r"(?:/downloadUrl/(?P<download>.*))?$",
        ))
        .expect("valid regex")
    })
}

fn legacy_edit_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(concat!(
            r"(?i)^nxdrive://edit/(?P<scheme>\w*)/(?P<server>.*?)/",
            r"(?:user/(?P<user>[^/]*)/)?(?:repo/(?P<repo>[^/]*)/)?",
            r"fsitem/(?P<fsid>[^/]+)(?:/filename/(?P<filename>[^/]*))?$",
        ))
        .expect("valid regex")
    })
}

fn download_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([^/]+/){3}(?P<xpath>.+)/(?P<filename>[^?]*)").expect("valid regex")
    })
}

/// Sub folders created by [`DirectEdit::prepare_edit`] start with the doc uid.
fn edit_dir_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9a-fA-F-]+_").expect("valid regex"))
}

fn decode(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}

/// Parse a Direct Edit URL, either the current form or the legacy
/// `fsitem` one.
pub fn parse_edit_url(url: &str) -> Result<EditRequest> {
    let (caps, doc_id) = if let Some(caps) = edit_url_re().captures(url) {
        let doc_id = caps["docid"].to_string();
        (caps, doc_id)
    } else if let Some(caps) = legacy_edit_url_re().captures(url) {
        let doc_id = doc_uid_from_fs_id(&decode(&caps["fsid"])).to_string();
        (caps, doc_id)
    } else {
        return Err(EngineError::InvalidUrl(url.to_string()));
    };

    let scheme = caps["scheme"].to_ascii_lowercase();
    if scheme != "http" && scheme != "https" {
        return Err(EngineError::InvalidUrl(url.to_string()));
    }
    if doc_id.is_empty() {
        return Err(EngineError::InvalidUrl(url.to_string()));
    }
    let group = |name: &str| {
        caps.name(name)
            .map(|m| decode(m.as_str()))
            .filter(|v| !v.is_empty())
    };
    Ok(EditRequest {
        server_url: format!("{}://{}", scheme, decode(&caps["server"])),
        user: group("user"),
        repo: group("repo"),
        doc_id,
        filename: group("filename"),
        download_url: group("download"),
    })
}

/// Drop the default port and the trailing slashes.
pub fn simplify_url(url: &str) -> String {
    match Url::parse(url) {
        // The default port of the scheme is never kept by the parser
        Ok(parsed) => parsed.as_str().trim_end_matches('/').to_string(),
        Err(_) => url.trim_end_matches('/').to_string(),
    }
}

/// Blob xpath embedded in a download URL such as
/// `nxfile/default/{uid}/file:content/name.odt?changeToken=1`.
pub fn xpath_from_download_url(download_url: &str) -> Option<String> {
    download_url_re()
        .captures(download_url)
        .map(|caps| caps["xpath"].to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAction {
    Lock,
    Unlock,
    /// Unlock a document left locked by a previous session, then drop its folder
    UnlockOrphan,
}

impl LockAction {
    fn as_str(self) -> &'static str {
        match self {
            LockAction::Lock => "lock",
            LockAction::Unlock => "unlock",
            LockAction::UnlockOrphan => "unlock_orphan",
        }
    }
}

/// What the tags of an edit folder tell about its document.
#[derive(Clone)]
pub struct EditDetails {
    pub uid: String,
    pub engine: Arc<Engine>,
    pub digest: Option<String>,
    pub digest_algorithm: DigestAlgorithm,
    pub xpath: String,
    pub editing: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DirectEditMetrics {
    pub edit_files: u64,
    pub fs_events: u64,
    pub uploads: u64,
    pub queued_uploads: usize,
    pub queued_errors: usize,
}

pub struct DirectEdit {
    config: DirectEditConfig,
    engines: EngineRegistry,
    local: LocalClient,
    manager_store: Option<Arc<ManagerStore>>,
    events: EventBus,
    upload_queue: Mutex<VecDeque<String>>,
    lock_queue: Mutex<VecDeque<(String, LockAction)>>,
    error_queue: Mutex<Vec<(String, Instant)>>,
    metrics: Mutex<DirectEditMetrics>,
}

impl DirectEdit {
    pub fn new(
        config: DirectEditConfig,
        engines: EngineRegistry,
        manager_store: Option<Arc<ManagerStore>>,
    ) -> Self {
        Self {
            local: LocalClient::new(config.folder.clone()),
            config,
            engines,
            manager_store,
            events: EventBus::new(),
            upload_queue: Mutex::new(VecDeque::new()),
            lock_queue: Mutex::new(VecDeque::new()),
            error_queue: Mutex::new(Vec::new()),
            metrics: Mutex::new(DirectEditMetrics::default()),
        }
    }

    pub fn folder(&self) -> &Path {
        &self.config.folder
    }

    pub fn config(&self) -> &DirectEditConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> DirectEditMetrics {
        let mut metrics = self.metrics.lock().clone();
        metrics.queued_uploads = self.upload_queue.lock().len();
        metrics.queued_errors = self.error_queue.lock().len();
        metrics
    }

    /// Engine bound to `server_url`, the user compared exactly first and
    /// then ignoring case.
    pub fn find_engine(&self, server_url: &str, user: Option<&str>) -> Option<Arc<Engine>> {
        let url = simplify_url(server_url);
        let engines: Vec<Arc<Engine>> = self
            .engines
            .read()
            .values()
            .filter(|e| simplify_url(e.server_url()) == url)
            .cloned()
            .collect();
        let Some(user) = user else {
            return engines.into_iter().next();
        };
        if let Some(engine) = engines.iter().find(|e| e.user() == user) {
            return Some(engine.clone());
        }
        engines.into_iter().find(|e| e.user().eq_ignore_ascii_case(user))
    }

    fn get_engine(&self, server_url: &str, user: Option<&str>) -> Option<Arc<Engine>> {
        let Some(engine) = self.find_engine(server_url, user) else {
            warn!("No engine bound to {} for {:?}", server_url, user);
            self.events.emit(EngineEvent::DirectEditError {
                message: "DIRECT_EDIT_CANT_FIND_ENGINE".to_string(),
                values: vec![user.unwrap_or("Unknown").to_string(), server_url.to_string()],
            });
            return None;
        };
        if engine.has_invalid_credentials() {
            warn!("Engine {} has invalid credentials", engine.uid());
            self.events.emit(EngineEvent::InvalidAuthentication);
            return None;
        }
        Some(engine)
    }

    /// Parse `url`, download the document and open it.
    pub async fn handle_url(&self, url: &str) -> Result<Option<PathBuf>> {
        let request = parse_edit_url(url)?;
        self.edit(&request).await
    }

    pub async fn edit(&self, request: &EditRequest) -> Result<Option<PathBuf>> {
        info!("Direct Editing doc {} on {}", request.doc_id, request.server_url);
        let Some(engine) = self.get_engine(&request.server_url, request.user.as_deref()) else {
            return Ok(None);
        };
        let Some(path) = self.prepare_edit(&engine, request).await? else {
            return Ok(None);
        };

        if self.config.open_files {
            if let Err(e) = open_local_file(&path) {
                error!("Cannot open {}: {}", path.display(), e);
            }
        }
        self.events.emit(EngineEvent::OpenDocument { path: path.clone() });
        Ok(Some(path))
    }

    /// Fetch the document, refusing versions, documents locked by someone
    /// else and documents the user cannot write.
    async fn get_info(&self, engine: &Engine, doc_id: &str) -> Result<Option<RemoteDocument>> {
        let doc = match engine.remote().fetch_document(doc_id).await {
            Ok(doc) => doc,
            Err(e) if e.is_not_found() => {
                warn!("Document {} not found on {}", doc_id, engine.server_url());
                self.events.emit(EngineEvent::DirectEditError {
                    message: "DIRECT_EDIT_NOT_FOUND".to_string(),
                    values: vec![doc_id.to_string(), engine.server_url().to_string()],
                });
                return Ok(None);
            }
            Err(ClientError::Unauthorized { .. }) => {
                engine.set_invalid_credentials(true);
                self.events.emit(EngineEvent::InvalidAuthentication);
                return Ok(None);
            }
            Err(ClientError::Forbidden(_)) => {
                self.events.emit(EngineEvent::DirectEditError {
                    message: "DIRECT_EDIT_FORBIDDEN".to_string(),
                    values: vec![doc_id.to_string(), engine.user().to_string()],
                });
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if doc.is_version {
            self.events.emit(EngineEvent::DirectEditError {
                message: "DIRECT_EDIT_VERSION".to_string(),
                values: vec![doc.version.clone().unwrap_or_default(), doc_id.to_string()],
            });
            return Ok(None);
        }
        if let Some(owner) = doc.lock_owner.as_deref() {
            if owner != engine.user() {
                info!("Document {} is locked by {}", doc.name, owner);
                let created = doc
                    .lock_created
                    .as_deref()
                    .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
                    .map(|c| c.with_timezone(&Utc));
                self.events.emit(EngineEvent::DirectEditLocked {
                    filename: doc.name.clone(),
                    owner: owner.to_string(),
                    created,
                });
                return Ok(None);
            }
        }
        if !doc.permissions.is_empty() && !doc.can_write() {
            info!("No write permission on {}", doc.name);
            self.events.emit(EngineEvent::DirectEditReadonly {
                filename: doc.name.clone(),
            });
            return Ok(None);
        }
        Ok(Some(doc))
    }

    /// Download the blob into its edit folder and tag the folder.
    pub async fn prepare_edit(&self, engine: &Engine, request: &EditRequest) -> Result<Option<PathBuf>> {
        let Some(doc) = self.get_info(engine, &request.doc_id).await? else {
            return Ok(None);
        };

        let xpath = match request.download_url.as_deref().and_then(xpath_from_download_url) {
            Some(xpath) if xpath != "blobholder:0" => xpath,
            Some(_) => DEFAULT_XPATH.to_string(),
            None if doc.doc_type == "Note" => NOTE_XPATH.to_string(),
            None => DEFAULT_XPATH.to_string(),
        };
        let Some(blob) = doc.get_blob(&xpath) else {
            warn!("No blob associated with xpath {} for {}", xpath, doc.path);
            return Ok(None);
        };

        let filename = safe_filename(&blob.name);
        let server = Url::parse(engine.server_url())
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| engine.server_url().to_string());
        self.events.emit(EngineEvent::DirectEditStarting {
            server,
            filename: filename.clone(),
        });

        let dir_name = safe_filename(&format!("{}_{}", request.doc_id, xpath));
        let dir_path = self.config.folder.join(&dir_name);
        std::fs::create_dir_all(&dir_path)?;
        let dir_ref = format!("{}{}", ROOT, dir_name);
        let file_path = dir_path.join(&filename);
        let tmp_path = dir_path.join(download_tmp_name(&filename));

        info!("Editing {}", filename);
        let copied = match blob.digest.as_deref() {
            Some(digest) => self.copy_duplicate(engine, digest, &tmp_path)?,
            None => false,
        };
        if !copied {
            engine
                .remote()
                .download_blob(&request.doc_id, &xpath, &tmp_path, None)
                .await?;
        }

        self.local.set_remote_id(&dir_ref, &request.doc_id)?;
        self.local
            .set_remote_id_named(&dir_ref, engine.server_url(), xattr::EDIT_SERVER_URL)?;
        self.local.set_remote_id_named(&dir_ref, engine.user(), xattr::EDIT_USER)?;
        self.local.set_remote_id_named(&dir_ref, &xpath, xattr::EDIT_XPATH)?;
        if let Some(digest) = blob.digest.as_deref() {
            let algorithm = blob
                .digest_algorithm
                .or_else(|| DigestAlgorithm::guess(digest))
                .ok_or_else(|| ClientError::InvalidArgument(format!("unknown digest {}", digest)))?;
            self.local.set_remote_id_named(&dir_ref, digest, xattr::EDIT_DIGEST)?;
            self.local
                .set_remote_id_named(&dir_ref, algorithm.as_str(), xattr::EDIT_DIGEST_ALGORITHM)?;
        }
        self.local.set_remote_id_named(&dir_ref, &filename, xattr::EDIT_NAME)?;

        std::fs::rename(&tmp_path, &file_path)?;
        self.metrics.lock().edit_files += 1;
        Ok(Some(file_path))
    }

    /// Copy a synchronized file with the same digest instead of downloading.
    fn copy_duplicate(&self, engine: &Engine, digest: &str, out: &Path) -> Result<bool> {
        let Some(pair) = engine.store().get_valid_duplicate_file(digest)? else {
            return Ok(false);
        };
        let source = engine.local().abspath(&pair.local_path)?;
        if !source.is_file() {
            return Ok(false);
        }
        debug!("Copying {} instead of downloading it", source.display());
        std::fs::copy(&source, out)?;
        unset_path_readonly(out)?;
        Ok(true)
    }

    /// Details of the edit folder holding `reference`.
    pub fn extract_edit_info(&self, reference: &str) -> Option<EditDetails> {
        let dir = parent_path(reference);
        if dir.is_empty() || dir == ROOT {
            return None;
        }
        let server_url = self.local.get_remote_id_named(&dir, xattr::EDIT_SERVER_URL)?;
        let user = self.local.get_remote_id_named(&dir, xattr::EDIT_USER);
        let engine = self.find_engine(&server_url, user.as_deref())?;
        let uid = self.local.get_remote_id(&dir)?;
        let digest = self.local.get_remote_id_named(&dir, xattr::EDIT_DIGEST);
        let digest_algorithm = self
            .local
            .get_remote_id_named(&dir, xattr::EDIT_DIGEST_ALGORITHM)
            .and_then(|a| a.parse().ok())
            .or_else(|| digest.as_deref().and_then(DigestAlgorithm::guess))
            .unwrap_or_default();
        let xpath = self
            .local
            .get_remote_id_named(&dir, xattr::EDIT_XPATH)
            .unwrap_or_else(|| DEFAULT_XPATH.to_string());
        let editing = self.local.get_remote_id_named(&dir, xattr::EDIT_LOCK).as_deref() == Some("1");
        Some(EditDetails {
            uid,
            engine,
            digest,
            digest_algorithm,
            xpath,
            editing,
        })
    }

    /// Accept `digest` as the server side version and upload anyway.
    pub fn force_update(&self, reference: &str, digest: &str) -> Result<()> {
        let dir = parent_path(reference);
        self.local.set_remote_id_named(&dir, digest, xattr::EDIT_DIGEST)?;
        info!("Forcing the upload of {}", reference);
        self.queue_upload(reference);
        Ok(())
    }

    fn queue_upload(&self, reference: &str) {
        let mut queue = self.upload_queue.lock();
        if !queue.iter().any(|r| r == reference) {
            queue.push_back(reference.to_string());
        }
    }

    fn queue_lock(&self, reference: &str, action: LockAction) {
        debug!("Queueing {} of {}", action.as_str(), reference);
        self.lock_queue.lock().push_back((reference.to_string(), action));
    }

    pub fn handle_event(&self, event: &FsEvent) {
        if matches!(event, FsEvent::Rescan(_)) {
            return;
        }
        let path = event.path();
        if path.is_dir() {
            return;
        }
        let Some(reference) = self.local.get_path(path) else {
            return;
        };
        let file_name = basename(&reference);
        if is_temp_file(file_name) {
            return;
        }
        let dir = parent_path(&reference);
        if dir.is_empty() || dir == ROOT {
            return;
        }
        let Some(name) = self.local.get_remote_id_named(&dir, xattr::EDIT_NAME) else {
            return;
        };
        self.metrics.lock().fs_events += 1;
        let editing = self.local.get_remote_id_named(&dir, xattr::EDIT_LOCK).as_deref() == Some("1");

        if file_name != name {
            if self.config.use_autolock && is_lock_file(file_name) {
                match event {
                    FsEvent::Created(_) | FsEvent::Moved { .. } if !editing => {
                        self.queue_lock(&reference, LockAction::Lock)
                    }
                    FsEvent::Deleted(_) if editing => self.queue_lock(&reference, LockAction::Unlock),
                    _ => {}
                }
            }
            return;
        }
        if !matches!(event, FsEvent::Deleted(_)) {
            debug!("Queueing the upload of {}", reference);
            self.queue_upload(&reference);
        }
    }

    pub async fn handle_queues(&self) {
        self.handle_lock_queue().await;
        self.handle_error_queue();
        self.handle_upload_queue().await;
    }

    async fn handle_lock_queue(&self) {
        let pending: Vec<(String, LockAction)> = self.lock_queue.lock().drain(..).collect();
        for (reference, action) in pending {
            if let Err(e) = self.handle_lock(&reference, action).await {
                error!("Cannot {} {}: {}", action.as_str(), reference, e);
                self.events.emit(EngineEvent::DirectEditLockError {
                    action: action.as_str().to_string(),
                    filename: basename(&reference).to_string(),
                    reference: reference.clone(),
                });
            }
        }
    }

    async fn handle_lock(&self, reference: &str, action: LockAction) -> Result<()> {
        let Some(details) = self.extract_edit_info(reference) else {
            debug!("No edit details for {}", reference);
            return Ok(());
        };
        let dir = parent_path(reference);
        let dir_path = self.local.abspath(&dir)?;
        let remote = details.engine.remote().clone();
        let result = match action {
            LockAction::Lock => remote.lock(&details.uid).await,
            LockAction::Unlock | LockAction::UnlockOrphan => remote.unlock(&details.uid).await,
        };
        match result {
            Ok(()) => {}
            Err(ClientError::DocumentAlreadyLocked { owner })
                if owner.eq_ignore_ascii_case(details.engine.user()) => {}
            Err(ClientError::DocumentAlreadyLocked { owner }) => {
                warn!("Document {} already locked by {}", details.uid, owner);
                self.events.emit(EngineEvent::DirectEditLocked {
                    filename: basename(reference).to_string(),
                    owner,
                    created: None,
                });
                return Ok(());
            }
            Err(e) if e.is_not_found() && action != LockAction::Lock => {
                warn!("Document {} is gone, dropping {}", details.uid, dir);
                self.forget_lock(&dir_path).await?;
                self.purge(&dir);
                return Ok(());
            }
            Err(e) if e.is_connection_error() => {
                warn!("Server unreachable, will {} {} later", action.as_str(), reference);
                self.queue_lock(reference, action);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        match action {
            LockAction::Lock => {
                self.local.set_remote_id_named(&dir, "1", xattr::EDIT_LOCK)?;
                if let Some(store) = &self.manager_store {
                    store
                        .lock_path(&dir_path, i64::from(std::process::id()), &details.uid)
                        .await?;
                }
                info!("Locked {} on the server", details.uid);
            }
            LockAction::Unlock => {
                self.local.remove_remote_id_named(&dir, xattr::EDIT_LOCK)?;
                self.forget_lock(&dir_path).await?;
                info!("Unlocked {} on the server", details.uid);
            }
            LockAction::UnlockOrphan => {
                self.forget_lock(&dir_path).await?;
                info!("Unlocked orphan {}", details.uid);
                self.purge(&dir);
            }
        }
        Ok(())
    }

    async fn forget_lock(&self, dir_path: &Path) -> Result<()> {
        if let Some(store) = &self.manager_store {
            store.unlock_path(dir_path).await?;
        }
        Ok(())
    }

    fn handle_error_queue(&self) {
        let now = Instant::now();
        let ready: Vec<String> = {
            let mut errors = self.error_queue.lock();
            let (ready, waiting): (Vec<_>, Vec<_>) = errors
                .drain(..)
                .partition(|(_, at)| now.duration_since(*at) >= self.config.error_delay);
            *errors = waiting;
            ready.into_iter().map(|(r, _)| r).collect()
        };
        for reference in ready {
            debug!("Retrying the upload of {}", reference);
            self.queue_upload(&reference);
        }
    }

    async fn handle_upload_queue(&self) {
        loop {
            let Some(reference) = self.upload_queue.lock().pop_front() else {
                break;
            };
            match self.handle_upload(&reference).await {
                Ok(()) => {}
                Err(EngineError::Client(ClientError::Forbidden(_))) => {
                    warn!("Upload of {} refused by the server", reference);
                    self.events.emit(EngineEvent::DirectEditError {
                        message: "DIRECT_EDIT_FORBIDDEN".to_string(),
                        values: vec![basename(&reference).to_string()],
                    });
                }
                Err(EngineError::Client(e)) if e.is_not_found() => {
                    warn!("Document of {} is gone: {}", reference, e);
                }
                Err(e) => {
                    error!("Upload of {} failed: {}", reference, e);
                    self.error_queue.lock().push((reference, Instant::now()));
                }
            }
        }
    }

    async fn handle_upload(&self, reference: &str) -> Result<()> {
        let path = self.local.abspath(reference)?;
        if !path.is_file() {
            return Ok(());
        }
        let Some(details) = self.extract_edit_info(reference) else {
            debug!("No edit details for {}", reference);
            return Ok(());
        };
        let info = self.local.get_info(reference)?;
        let Some(current) = info.get_digest(details.digest_algorithm, None)? else {
            return Ok(());
        };
        if current == UNACCESSIBLE_HASH {
            debug!("{} is still being written", reference);
            self.error_queue.lock().push((reference.to_string(), Instant::now()));
            return Ok(());
        }
        if details.digest.as_deref() == Some(current.as_str()) {
            debug!("Digest of {} has not changed", reference);
            return Ok(());
        }

        let remote = details.engine.remote().clone();
        if !details.editing {
            let doc = remote.fetch_document(&details.uid).await?;
            if let Some(remote_digest) = doc.get_blob(&details.xpath).and_then(|b| b.digest) {
                if Some(remote_digest.as_str()) != details.digest.as_deref() {
                    warn!(
                        "Remote digest {} of {} differs from the downloaded one",
                        remote_digest, reference
                    );
                    self.events.emit(EngineEvent::DirectEditConflict {
                        filename: info.name.clone(),
                        reference: reference.to_string(),
                        digest: remote_digest,
                    });
                    return Ok(());
                }
            }
        }

        info!("Uploading {} to {}", reference, details.uid);
        remote
            .attach_blob(&details.uid, &path, &details.xpath, &info.name, true)
            .await?;
        self.local
            .set_remote_id_named(&parent_path(reference), &current, xattr::EDIT_DIGEST)?;
        self.metrics.lock().uploads += 1;
        self.events.emit(EngineEvent::DirectEditUploadCompleted { filename: info.name });
        Ok(())
    }

    fn purge(&self, dir: &str) {
        let Ok(path) = self.local.abspath(dir) else {
            return;
        };
        debug!("Removing edit folder {}", path.display());
        if let Err(e) = std::fs::remove_dir_all(&path) {
            warn!("Cannot remove {}: {}", path.display(), e);
        }
    }

    /// Startup pass over the edit folders: locked ones are kept, modified
    /// ones are uploaded, the others are removed.
    pub fn cleanup(&self) -> Result<()> {
        if !self.config.folder.exists() {
            std::fs::create_dir_all(&self.config.folder)?;
            return Ok(());
        }
        for child in self.local.get_children_info(ROOT)? {
            if !child.folderish || !edit_dir_re().is_match(&child.name) {
                debug!("Skipping {} in the edit folder", child.name);
                continue;
            }
            if self.local.get_remote_id_named(&child.path, xattr::EDIT_LOCK).as_deref() == Some("1") {
                info!("Keeping {}, the document is locked", child.path);
                continue;
            }
            let name = self.local.get_remote_id_named(&child.path, xattr::EDIT_NAME);
            let file = self
                .local
                .get_children_info(&child.path)?
                .into_iter()
                .find(|c| !c.folderish && Some(&c.name) == name.as_ref());
            if let Some(file) = file {
                if let Some(details) = self.extract_edit_info(&file.path) {
                    let digest = file.get_digest(details.digest_algorithm, None)?;
                    if digest.is_some() && digest != details.digest {
                        info!("{} was modified offline, uploading it", file.path);
                        self.queue_upload(&file.path);
                        continue;
                    }
                }
            }
            self.purge(&child.path);
        }
        Ok(())
    }

    /// Queue an unlock for locked folders whose editor is gone.
    pub async fn unlock_orphans(&self) -> Result<()> {
        let Some(store) = &self.manager_store else {
            return Ok(());
        };
        for entry in store.get_locks().await? {
            let Some(dir) = self.local.get_path(&entry.path) else {
                continue;
            };
            if !entry.path.is_dir() {
                store.unlock_path(&entry.path).await?;
                continue;
            }
            let has_lock_file = std::fs::read_dir(&entry.path)?
                .filter_map(|e| e.ok())
                .any(|e| is_lock_file(&e.file_name().to_string_lossy()));
            if has_lock_file {
                continue;
            }
            if let Some(name) = self.local.get_remote_id_named(&dir, xattr::EDIT_NAME) {
                self.queue_lock(&format!("{}/{}", dir, name), LockAction::UnlockOrphan);
            }
        }
        Ok(())
    }

    pub async fn run(&self, control: WorkerControl) -> Result<()> {
        info!("DirectEdit starting on {}", self.config.folder.display());
        self.cleanup()?;
        self.unlock_orphans().await?;
        let mut source = FsEventSource::watch(&self.config.folder)?;

        loop {
            control.interact().await?;
            let mut events = Vec::new();
            tokio::select! {
                event = source.next_event() => match event {
                    Some(event) => events.push(event),
                    None => {
                        warn!("Filesystem event source closed");
                        return Ok(());
                    }
                },
                _ = tokio::time::sleep(self.config.tick) => {}
                _ = control.token().cancelled() => return Err(SyncError::ThreadInterrupt.into()),
            }
            events.extend(source.drain_ready());
            for event in &events {
                self.handle_event(event);
            }
            self.handle_queues().await;
        }
    }
}
