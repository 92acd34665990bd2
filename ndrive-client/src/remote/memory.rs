//! In-process server keeping a FileSystemItem tree and its audit log.
//!
//! Used by the end-to-end tests and the offline demo mode. Mutations done
//! through [`RemoteFileSystem`] act as the bound user; the `*_remotely`
//! helpers act as another user working on the server.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{doc_uid_from_fs_id, RemoteFileSystem};
use crate::digest::{digest_bytes, DigestAlgorithm};
use crate::errors::{ClientError, Result};
use crate::info::{ChangeSummary, FileSystemChange, RemoteDocument, RemoteFileInfo, ScrollBatch};
use crate::names::{split_ext, DEFAULT_REPOSITORY_NAME};

pub const TOP_LEVEL_ID: &str = "org.nuxeo.drive.service.impl.DefaultTopLevelFolderItemFactory#";
const SYNC_ROOT_FACTORY: &str = "defaultSyncRootFolderItemFactory";
const ITEM_FACTORY: &str = "defaultFileSystemItemFactory";
const REMOTE_USER: &str = "remote_user";

/// Changes above this count are summarized as `hasTooManyChanges`.
const TOO_MANY_CHANGES: usize = 1000;

#[derive(Debug, Clone)]
struct MemoryItem {
    info: RemoteFileInfo,
    content: Vec<u8>,
    sync_root: bool,
}

#[derive(Debug, Clone)]
struct LoggedEvent {
    log_id: i64,
    event_id: String,
    event_date: i64,
    fs_item_id: String,
    name: String,
}

#[derive(Debug, Default)]
struct Tree {
    items: HashMap<String, MemoryItem>,
    events: Vec<LoggedEvent>,
    next_log_id: i64,
}

impl Tree {
    fn get(&self, id: &str) -> Result<&MemoryItem> {
        self.items
            .get(id)
            .ok_or_else(|| ClientError::NotFound(id.to_string()))
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut MemoryItem> {
        self.items
            .get_mut(id)
            .ok_or_else(|| ClientError::NotFound(id.to_string()))
    }

    fn log(&mut self, event_id: &str, item: &RemoteFileInfo) {
        self.next_log_id += 1;
        self.events.push(LoggedEvent {
            log_id: self.next_log_id,
            event_id: event_id.to_string(),
            event_date: Utc::now().timestamp_millis(),
            fs_item_id: item.uid.clone(),
            name: item.name.clone(),
        });
    }

    fn children(&self, id: &str) -> Vec<RemoteFileInfo> {
        let mut children: Vec<_> = self
            .items
            .values()
            .filter(|i| i.info.parent_uid.as_deref() == Some(id))
            .map(|i| i.info.clone())
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name).then(a.uid.cmp(&b.uid)));
        children
    }

    /// Parents before children.
    fn descendants(&self, id: &str) -> Vec<RemoteFileInfo> {
        let mut result = Vec::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            let children = self.children(&current);
            stack.extend(children.iter().rev().filter(|c| c.folderish).map(|c| c.uid.clone()));
            result.extend(children);
        }
        result
    }

    /// Recompute `path` of an item and its whole subtree.
    fn refresh_paths(&mut self, id: &str) {
        let parent_path = self
            .items
            .get(id)
            .and_then(|i| i.info.parent_uid.clone())
            .and_then(|p| self.items.get(&p).map(|p| p.info.path.clone()))
            .unwrap_or_default();
        if let Some(item) = self.items.get_mut(id) {
            item.info.path = format!("{}/{}", parent_path, item.info.uid);
        }
        let children: Vec<String> = self.children(id).into_iter().map(|c| c.uid).collect();
        for child in children {
            self.refresh_paths(&child);
        }
    }

    fn remove_subtree(&mut self, id: &str) {
        let children: Vec<String> = self.children(id).into_iter().map(|c| c.uid).collect();
        for child in children {
            self.remove_subtree(&child);
        }
        self.items.remove(id);
    }
}

/// A whole server in memory.
pub struct MemoryRemote {
    server_url: String,
    user_id: String,
    tree: Mutex<Tree>,
    event_log_id: AtomicBool,
    uploads: AtomicUsize,
}

impl MemoryRemote {
    pub fn new(server_url: impl Into<String>, user_id: impl Into<String>) -> Self {
        let mut tree = Tree::default();
        let root = RemoteFileInfo {
            name: "Nuxeo Drive".to_string(),
            uid: TOP_LEVEL_ID.to_string(),
            parent_uid: None,
            path: format!("/{}", TOP_LEVEL_ID),
            folderish: true,
            last_modification_time: Some(Utc::now()),
            creation_time: Some(Utc::now()),
            last_contributor: Some("system".to_string()),
            digest: None,
            digest_algorithm: None,
            download_url: None,
            can_rename: false,
            can_delete: false,
            can_update: false,
            can_create_child: false,
            lock_owner: None,
            lock_created: None,
            can_scroll_descendants: true,
        };
        tree.items.insert(
            root.uid.clone(),
            MemoryItem {
                info: root,
                content: Vec::new(),
                sync_root: false,
            },
        );
        Self {
            server_url: server_url.into(),
            user_id: user_id.into(),
            tree: Mutex::new(tree),
            event_log_id: AtomicBool::new(true),
            uploads: AtomicUsize::new(0),
        }
    }

    /// Simulate a server without `lowerBound` support.
    pub fn set_event_log_id(&self, enabled: bool) {
        self.event_log_id.store(enabled, Ordering::SeqCst);
    }

    /// Number of content uploads received so far.
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn item(&self, id: &str) -> Option<RemoteFileInfo> {
        self.tree.lock().items.get(id).map(|i| i.info.clone())
    }

    pub fn content(&self, id: &str) -> Option<Vec<u8>> {
        self.tree.lock().items.get(id).map(|i| i.content.clone())
    }

    pub fn children_of(&self, id: &str) -> Vec<RemoteFileInfo> {
        self.tree.lock().children(id)
    }

    pub fn child_by_name(&self, parent_id: &str, name: &str) -> Option<RemoteFileInfo> {
        self.children_of(parent_id).into_iter().find(|c| c.name == name)
    }

    fn new_item(
        tree: &Tree,
        factory: &str,
        parent_id: &str,
        name: &str,
        folderish: bool,
        content: &[u8],
        contributor: &str,
    ) -> Result<RemoteFileInfo> {
        let parent = tree.get(parent_id)?;
        if !parent.info.folderish {
            return Err(ClientError::InvalidArgument(format!("{} is not a folder", parent_id)));
        }
        let uid = format!("{}#{}#{}", factory, DEFAULT_REPOSITORY_NAME, uuid::Uuid::new_v4());
        let now = Utc::now();
        let doc_uid = doc_uid_from_fs_id(&uid).to_string();
        Ok(RemoteFileInfo {
            name: name.to_string(),
            parent_uid: Some(parent_id.to_string()),
            path: format!("{}/{}", parent.info.path, uid),
            folderish,
            last_modification_time: Some(now),
            creation_time: Some(now),
            last_contributor: Some(contributor.to_string()),
            digest: (!folderish).then(|| digest_bytes(content, DigestAlgorithm::Md5)),
            digest_algorithm: (!folderish).then_some(DigestAlgorithm::Md5),
            download_url: (!folderish)
                .then(|| format!("nxfile/default/{}/blobholder:0/{}", doc_uid, name)),
            can_rename: true,
            can_delete: true,
            can_update: !folderish,
            can_create_child: folderish,
            lock_owner: None,
            lock_created: None,
            can_scroll_descendants: folderish,
            uid,
        })
    }

    fn insert(
        &self,
        factory: &str,
        parent_id: &str,
        name: &str,
        folderish: bool,
        content: &[u8],
        contributor: &str,
    ) -> Result<RemoteFileInfo> {
        let mut tree = self.tree.lock();
        let info = Self::new_item(&tree, factory, parent_id, name, folderish, content, contributor)?;
        tree.items.insert(
            info.uid.clone(),
            MemoryItem {
                info: info.clone(),
                content: content.to_vec(),
                sync_root: factory == SYNC_ROOT_FACTORY,
            },
        );
        tree.log("documentCreated", &info);
        debug!("Created remote item {} ({})", info.name, info.uid);
        Ok(info)
    }

    /// Create a synchronization root under the top level folder.
    pub fn create_sync_root(&self, name: &str) -> Result<RemoteFileInfo> {
        self.insert(SYNC_ROOT_FACTORY, TOP_LEVEL_ID, name, true, &[], REMOTE_USER)
    }

    pub fn create_folder_remotely(&self, parent_id: &str, name: &str) -> Result<RemoteFileInfo> {
        self.insert(ITEM_FACTORY, parent_id, name, true, &[], REMOTE_USER)
    }

    pub fn create_file_remotely(
        &self,
        parent_id: &str,
        name: &str,
        content: &[u8],
    ) -> Result<RemoteFileInfo> {
        self.insert(ITEM_FACTORY, parent_id, name, false, content, REMOTE_USER)
    }

    fn write_content(&self, id: &str, content: &[u8], contributor: &str) -> Result<RemoteFileInfo> {
        let mut tree = self.tree.lock();
        let item = tree.get_mut(id)?;
        item.content = content.to_vec();
        item.info.digest = Some(digest_bytes(content, DigestAlgorithm::Md5));
        item.info.digest_algorithm = Some(DigestAlgorithm::Md5);
        item.info.last_modification_time = Some(Utc::now());
        item.info.last_contributor = Some(contributor.to_string());
        let info = item.info.clone();
        tree.log("documentModified", &info);
        Ok(info)
    }

    pub fn update_file_remotely(&self, id: &str, content: &[u8]) -> Result<RemoteFileInfo> {
        self.write_content(id, content, REMOTE_USER)
    }

    pub fn rename_remotely(&self, id: &str, name: &str) -> Result<RemoteFileInfo> {
        let mut tree = self.tree.lock();
        let item = tree.get_mut(id)?;
        item.info.name = name.to_string();
        item.info.last_contributor = Some(REMOTE_USER.to_string());
        let info = item.info.clone();
        tree.log("documentModified", &info);
        Ok(info)
    }

    pub fn move_remotely(&self, id: &str, new_parent_id: &str) -> Result<RemoteFileInfo> {
        let mut tree = self.tree.lock();
        tree.get(new_parent_id)?;
        tree.get_mut(id)?.info.parent_uid = Some(new_parent_id.to_string());
        tree.refresh_paths(id);
        let info = tree.get(id)?.info.clone();
        tree.log("documentMoved", &info);
        Ok(info)
    }

    pub fn delete_remotely(&self, id: &str) -> Result<()> {
        let mut tree = self.tree.lock();
        let info = tree.get(id)?.info.clone();
        tree.remove_subtree(id);
        tree.log("deleted", &info);
        Ok(())
    }

    /// Change the permissions of an item and its descendants.
    pub fn set_readonly_remotely(&self, id: &str, readonly: bool) -> Result<()> {
        let mut tree = self.tree.lock();
        let mut ids = vec![id.to_string()];
        ids.extend(tree.descendants(id).into_iter().map(|d| d.uid));
        for current in &ids {
            let item = tree.get_mut(current)?;
            item.info.can_rename = !readonly;
            item.info.can_delete = !readonly;
            item.info.can_update = !readonly && !item.info.folderish;
            item.info.can_create_child = !readonly && item.info.folderish;
        }
        let info = tree.get(id)?.info.clone();
        tree.log("securityUpdated", &info);
        Ok(())
    }

    pub fn lock_remotely(&self, id: &str, owner: &str) -> Result<()> {
        let mut tree = self.tree.lock();
        let item = tree.get_mut(id)?;
        item.info.lock_owner = Some(owner.to_string());
        item.info.lock_created = Some(Utc::now());
        let info = item.info.clone();
        tree.log("documentLocked", &info);
        Ok(())
    }

    fn find_by_doc_ref(tree: &Tree, doc_ref: &str) -> Result<String> {
        if tree.items.contains_key(doc_ref) {
            return Ok(doc_ref.to_string());
        }
        let uid = doc_uid_from_fs_id(doc_ref);
        tree.items
            .keys()
            .find(|k| doc_uid_from_fs_id(k) == uid)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(doc_ref.to_string()))
    }

    fn document(&self, item: &MemoryItem) -> RemoteDocument {
        let info = &item.info;
        let uid = doc_uid_from_fs_id(&info.uid).to_string();
        let mut permissions = vec!["Read".to_string()];
        if info.can_update || info.can_create_child {
            permissions.push("Write".to_string());
        }
        let properties = if info.folderish {
            json!({ "dc:title": info.name })
        } else {
            json!({
                "dc:title": info.name,
                "file:content": {
                    "name": info.name,
                    "digest": info.digest,
                    "digestAlgorithm": "MD5",
                    "length": item.content.len().to_string(),
                    "data": format!("{}nxfile/default/{}/file:content/{}", self.server_url, uid, info.name),
                }
            })
        };
        RemoteDocument {
            path: info.path.clone(),
            name: info.name.clone(),
            doc_type: if info.folderish { "Folder" } else { "File" }.to_string(),
            version: None,
            is_version: false,
            lock_owner: info.lock_owner.clone(),
            lock_created: info.lock_created.map(|t| t.to_rfc3339()),
            permissions,
            properties,
            uid,
        }
    }

    fn check_digest(info: &RemoteFileInfo, content: &[u8], file_out: &Path) -> Result<()> {
        if let Some(expected) = &info.digest {
            let algorithm = info.digest_algorithm.unwrap_or_default();
            let actual = digest_bytes(content, algorithm);
            if &actual != expected {
                return Err(ClientError::CorruptedFile {
                    path: file_out.display().to_string(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(())
    }
}

fn interrupted(cancel: Option<&CancellationToken>) -> Result<()> {
    if cancel.map(|c| c.is_cancelled()).unwrap_or(false) {
        return Err(ClientError::Interrupted);
    }
    Ok(())
}

fn conflicted_name_at(original: &str, user: &str, now: DateTime<Utc>) -> String {
    let (stem, ext) = split_ext(original);
    format!("{} ({} - {}){}", stem, user, now.format("%Y-%m-%d %H-%M"), ext)
}

#[async_trait]
impl RemoteFileSystem for MemoryRemote {
    fn server_url(&self) -> &str {
        &self.server_url
    }

    fn user_id(&self) -> &str {
        &self.user_id
    }

    fn is_event_log_id(&self) -> bool {
        self.event_log_id.load(Ordering::SeqCst)
    }

    async fn get_filesystem_root_info(&self) -> Result<RemoteFileInfo> {
        Ok(self.tree.lock().get(TOP_LEVEL_ID)?.info.clone())
    }

    async fn get_fs_item(
        &self,
        fs_item_id: &str,
        _parent_fs_item_id: Option<&str>,
    ) -> Result<Option<RemoteFileInfo>> {
        Ok(self.item(fs_item_id))
    }

    async fn get_fs_children(&self, fs_item_id: &str) -> Result<Vec<RemoteFileInfo>> {
        let tree = self.tree.lock();
        tree.get(fs_item_id)?;
        Ok(tree.children(fs_item_id))
    }

    async fn scroll_descendants(
        &self,
        fs_item_id: &str,
        scroll_id: Option<&str>,
        batch_size: usize,
    ) -> Result<ScrollBatch> {
        let tree = self.tree.lock();
        tree.get(fs_item_id)?;
        let offset: usize = scroll_id.and_then(|s| s.parse().ok()).unwrap_or(0);
        let items: Vec<_> = tree
            .descendants(fs_item_id)
            .into_iter()
            .skip(offset)
            .take(batch_size.max(1))
            .collect();
        Ok(ScrollBatch {
            scroll_id: Some((offset + items.len()).to_string()),
            items,
        })
    }

    async fn fs_exists(&self, fs_item_id: &str) -> Result<bool> {
        Ok(self.tree.lock().items.contains_key(fs_item_id))
    }

    async fn make_folder(&self, parent_id: &str, name: &str, _overwrite: bool) -> Result<RemoteFileInfo> {
        {
            let tree = self.tree.lock();
            if !tree.get(parent_id)?.info.can_create_child {
                return Err(ClientError::Forbidden(format!("cannot create in {}", parent_id)));
            }
        }
        self.insert(ITEM_FACTORY, parent_id, name, true, &[], &self.user_id)
    }

    async fn stream_file(
        &self,
        parent_id: &str,
        file_path: &Path,
        filename: &str,
        overwrite: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<RemoteFileInfo> {
        interrupted(cancel)?;
        let content = tokio::fs::read(file_path).await?;
        let existing = {
            let tree = self.tree.lock();
            if !tree.get(parent_id)?.info.can_create_child {
                return Err(ClientError::Forbidden(format!("cannot create in {}", parent_id)));
            }
            tree.children(parent_id)
                .into_iter()
                .find(|c| overwrite && !c.folderish && c.name == filename)
        };
        self.uploads.fetch_add(1, Ordering::SeqCst);
        match existing {
            Some(existing) => self.write_content(&existing.uid, &content, &self.user_id),
            None => self.insert(ITEM_FACTORY, parent_id, filename, false, &content, &self.user_id),
        }
    }

    async fn stream_update(
        &self,
        fs_item_id: &str,
        file_path: &Path,
        _parent_fs_item_id: Option<&str>,
        filename: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<RemoteFileInfo> {
        interrupted(cancel)?;
        let content = tokio::fs::read(file_path).await?;
        {
            let mut tree = self.tree.lock();
            let item = tree.get_mut(fs_item_id)?;
            if !item.info.can_update {
                return Err(ClientError::Forbidden(format!("cannot update {}", fs_item_id)));
            }
            item.info.name = filename.to_string();
        }
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.write_content(fs_item_id, &content, &self.user_id)
    }

    async fn stream_content(
        &self,
        info: &RemoteFileInfo,
        file_out: &Path,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        interrupted(cancel)?;
        let content = self
            .content(&info.uid)
            .ok_or_else(|| ClientError::NotFound(info.uid.clone()))?;
        Self::check_digest(info, &content, file_out)?;
        tokio::fs::write(file_out, content).await?;
        Ok(())
    }

    async fn delete(&self, fs_item_id: &str, _parent_fs_item_id: Option<&str>) -> Result<()> {
        let mut tree = self.tree.lock();
        let info = tree.get(fs_item_id)?.info.clone();
        if !info.can_delete {
            return Err(ClientError::Forbidden(format!("cannot delete {}", fs_item_id)));
        }
        tree.remove_subtree(fs_item_id);
        tree.log("deleted", &info);
        Ok(())
    }

    async fn rename(&self, fs_item_id: &str, new_name: &str) -> Result<RemoteFileInfo> {
        let mut tree = self.tree.lock();
        let item = tree.get_mut(fs_item_id)?;
        if !item.info.can_rename {
            return Err(ClientError::Forbidden(format!("cannot rename {}", fs_item_id)));
        }
        item.info.name = new_name.to_string();
        item.info.last_contributor = Some(self.user_id.clone());
        let info = item.info.clone();
        tree.log("documentModified", &info);
        Ok(info)
    }

    async fn move_item(&self, fs_item_id: &str, new_parent_id: &str) -> Result<RemoteFileInfo> {
        if !self.can_move(fs_item_id, new_parent_id).await? {
            return Err(ClientError::Forbidden(format!(
                "cannot move {} to {}",
                fs_item_id, new_parent_id
            )));
        }
        let mut tree = self.tree.lock();
        tree.get_mut(fs_item_id)?.info.parent_uid = Some(new_parent_id.to_string());
        tree.refresh_paths(fs_item_id);
        let info = tree.get(fs_item_id)?.info.clone();
        tree.log("documentMoved", &info);
        Ok(info)
    }

    async fn can_move(&self, fs_item_id: &str, new_parent_id: &str) -> Result<bool> {
        let tree = self.tree.lock();
        let item = tree.get(fs_item_id)?;
        let parent = tree.get(new_parent_id)?;
        Ok(item.info.can_delete && parent.info.can_create_child)
    }

    async fn conflicted_name(&self, original_name: &str) -> Result<String> {
        Ok(conflicted_name_at(original_name, &self.user_id, Utc::now()))
    }

    async fn get_changes(
        &self,
        _last_root_definitions: &str,
        log_id: Option<i64>,
        last_sync_date: Option<i64>,
    ) -> Result<ChangeSummary> {
        let tree = self.tree.lock();
        let use_log_id = self.is_event_log_id() && log_id.is_some();
        let events: Vec<&LoggedEvent> = tree
            .events
            .iter()
            .filter(|e| {
                if use_log_id {
                    e.log_id > log_id.unwrap_or_default()
                } else {
                    // Date based bounds overlap: duplicates are expected
                    e.event_date >= last_sync_date.unwrap_or_default()
                }
            })
            .collect();

        let has_too_many_changes = events.len() > TOO_MANY_CHANGES;
        let file_system_changes = if has_too_many_changes {
            Vec::new()
        } else {
            events
                .iter()
                .map(|e| FileSystemChange {
                    event_id: e.event_id.clone(),
                    event_date: e.event_date,
                    file_system_item_id: e.fs_item_id.clone(),
                    file_system_item_name: Some(e.name.clone()),
                    file_system_item: tree.items.get(&e.fs_item_id).map(|i| i.info.clone()),
                })
                .collect()
        };

        let mut roots: Vec<String> = tree
            .items
            .values()
            .filter(|i| i.sync_root)
            .map(|i| format!("{}:{}", DEFAULT_REPOSITORY_NAME, doc_uid_from_fs_id(&i.info.uid)))
            .collect();
        roots.sort();

        Ok(ChangeSummary {
            file_system_changes,
            sync_date: Utc::now().timestamp_millis(),
            upper_bound: self.is_event_log_id().then_some(tree.next_log_id),
            active_synchronization_root_definitions: roots.join(","),
            has_too_many_changes,
        })
    }

    async fn fetch_document(&self, doc_ref: &str) -> Result<RemoteDocument> {
        let tree = self.tree.lock();
        let id = Self::find_by_doc_ref(&tree, doc_ref)?;
        Ok(self.document(tree.get(&id)?))
    }

    async fn download_blob(
        &self,
        doc_ref: &str,
        _xpath: &str,
        file_out: &Path,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        interrupted(cancel)?;
        let content = {
            let tree = self.tree.lock();
            let id = Self::find_by_doc_ref(&tree, doc_ref)?;
            tree.get(&id)?.content.clone()
        };
        tokio::fs::write(file_out, content).await?;
        Ok(())
    }

    async fn attach_blob(
        &self,
        doc_ref: &str,
        file_path: &Path,
        _xpath: &str,
        _filename: &str,
        _apply_versioning_policy: bool,
    ) -> Result<()> {
        let content = tokio::fs::read(file_path).await?;
        let id = Self::find_by_doc_ref(&self.tree.lock(), doc_ref)?;
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.write_content(&id, &content, &self.user_id)?;
        Ok(())
    }

    async fn lock(&self, doc_ref: &str) -> Result<()> {
        let mut tree = self.tree.lock();
        let id = Self::find_by_doc_ref(&tree, doc_ref)?;
        let item = tree.get_mut(&id)?;
        if let Some(owner) = &item.info.lock_owner {
            if owner != &self.user_id {
                return Err(ClientError::DocumentAlreadyLocked { owner: owner.clone() });
            }
        }
        item.info.lock_owner = Some(self.user_id.clone());
        item.info.lock_created = Some(Utc::now());
        let info = item.info.clone();
        tree.log("documentLocked", &info);
        Ok(())
    }

    async fn unlock(&self, doc_ref: &str) -> Result<()> {
        let mut tree = self.tree.lock();
        let id = Self::find_by_doc_ref(&tree, doc_ref)?;
        let item = tree.get_mut(&id)?;
        item.info.lock_owner = None;
        item.info.lock_created = None;
        let info = item.info.clone();
        tree.log("documentUnlocked", &info);
        Ok(())
    }

    async fn register_as_root(&self, doc_ref: &str) -> Result<()> {
        let mut tree = self.tree.lock();
        let id = Self::find_by_doc_ref(&tree, doc_ref)?;
        tree.get_mut(&id)?.sync_root = true;
        Ok(())
    }

    async fn unregister_as_root(&self, doc_ref: &str) -> Result<()> {
        let mut tree = self.tree.lock();
        let id = Self::find_by_doc_ref(&tree, doc_ref)?;
        let item = tree.get_mut(&id)?;
        item.sync_root = false;
        let info = item.info.clone();
        tree.log("deleted", &info);
        Ok(())
    }

    async fn get_roots(&self) -> Result<Vec<RemoteDocument>> {
        let tree = self.tree.lock();
        let mut roots: Vec<_> = tree
            .items
            .values()
            .filter(|i| i.sync_root)
            .map(|i| self.document(i))
            .collect();
        roots.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(roots)
    }
}
