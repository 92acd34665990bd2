//! Data transfer objects describing items on both sides of a binding.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::digest::{compute_digest, DigestAlgorithm};
use crate::errors::{ClientError, Result};
use crate::names::{nfc, UNACCESSIBLE_HASH};

/// A file or folder under a local sync root.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalFileInfo {
    /// Absolute sync root
    pub root: PathBuf,
    /// Path relative to the root, `/` separated, starting with `/`
    pub path: String,
    pub name: String,
    pub folderish: bool,
    pub size: u64,
    pub last_modification_time: DateTime<Utc>,
    pub remote_ref: Option<String>,
    pub filepath: PathBuf,
}

impl LocalFileInfo {
    /// Lazy digest computation. Folders have none; unreadable files yield
    /// the `TO_COMPUTE` placeholder.
    pub fn get_digest(
        &self,
        algorithm: DigestAlgorithm,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<String>> {
        if self.folderish {
            return Ok(None);
        }
        match compute_digest(&self.filepath, algorithm, cancel) {
            Ok(digest) => Ok(Some(digest)),
            Err(ClientError::Io(_)) => Ok(Some(UNACCESSIBLE_HASH.to_string())),
            Err(e) => Err(e),
        }
    }
}

/// A FileSystemItem as exposed by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFileInfo {
    pub name: String,
    pub uid: String,
    pub parent_uid: Option<String>,
    pub path: String,
    pub folderish: bool,
    pub last_modification_time: Option<DateTime<Utc>>,
    pub creation_time: Option<DateTime<Utc>>,
    pub last_contributor: Option<String>,
    pub digest: Option<String>,
    pub digest_algorithm: Option<DigestAlgorithm>,
    pub download_url: Option<String>,
    pub can_rename: bool,
    pub can_delete: bool,
    pub can_update: bool,
    pub can_create_child: bool,
    pub lock_owner: Option<String>,
    pub lock_created: Option<DateTime<Utc>>,
    pub can_scroll_descendants: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLockInfo {
    owner: Option<String>,
    created: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawFileSystemItem {
    id: String,
    parent_id: Option<String>,
    name: String,
    #[serde(default)]
    folder: bool,
    #[serde(default)]
    path: String,
    last_modification_date: Option<i64>,
    creation_date: Option<i64>,
    last_contributor: Option<String>,
    digest: Option<String>,
    digest_algorithm: Option<String>,
    #[serde(rename = "downloadURL")]
    download_url: Option<String>,
    #[serde(default)]
    can_rename: bool,
    #[serde(default)]
    can_delete: bool,
    #[serde(default)]
    can_update: bool,
    #[serde(default)]
    can_create_child: bool,
    #[serde(default)]
    can_scroll_descendants: bool,
    lock_info: Option<RawLockInfo>,
}

fn from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

impl From<RawFileSystemItem> for RemoteFileInfo {
    fn from(raw: RawFileSystemItem) -> Self {
        let (digest, digest_algorithm, download_url, can_update, can_create_child) = if raw.folder
        {
            (None, None, None, false, raw.can_create_child)
        } else {
            let algorithm = raw
                .digest_algorithm
                .as_deref()
                .and_then(|a| a.parse().ok())
                .or_else(|| raw.digest.as_deref().and_then(DigestAlgorithm::guess));
            (raw.digest, algorithm, raw.download_url, raw.can_update, false)
        };
        let (lock_owner, lock_created) = match raw.lock_info {
            Some(lock) => (lock.owner, from_millis(lock.created)),
            None => (None, None),
        };
        RemoteFileInfo {
            name: nfc(&raw.name),
            uid: raw.id,
            parent_uid: raw.parent_id,
            path: raw.path,
            folderish: raw.folder,
            last_modification_time: from_millis(raw.last_modification_date),
            creation_time: from_millis(raw.creation_date),
            last_contributor: raw.last_contributor,
            digest,
            digest_algorithm,
            download_url,
            can_rename: raw.can_rename,
            can_delete: raw.can_delete,
            can_update,
            can_create_child,
            lock_owner,
            lock_created,
            can_scroll_descendants: raw.can_scroll_descendants,
        }
    }
}

impl RemoteFileInfo {
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let raw: RawFileSystemItem = serde_json::from_value(value)?;
        Ok(raw.into())
    }

    /// Wire representation, the inverse of [`RemoteFileInfo::from_json`].
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.uid,
            "parentId": self.parent_uid,
            "name": self.name,
            "folder": self.folderish,
            "path": self.path,
            "lastModificationDate": self.last_modification_time.map(|t| t.timestamp_millis()),
            "creationDate": self.creation_time.map(|t| t.timestamp_millis()),
            "lastContributor": self.last_contributor,
            "digest": self.digest,
            "digestAlgorithm": self.digest_algorithm.map(|a| a.as_str()),
            "downloadURL": self.download_url,
            "canRename": self.can_rename,
            "canDelete": self.can_delete,
            "canUpdate": self.can_update,
            "canCreateChild": self.can_create_child,
            "canScrollDescendants": self.can_scroll_descendants,
            "lockInfo": self.lock_owner.as_ref().map(|owner| serde_json::json!({
                "owner": owner,
                "created": self.lock_created.map(|t| t.timestamp_millis()),
            })),
        })
    }

    pub fn is_locked(&self) -> bool {
        self.lock_owner.is_some()
    }
}

/// One event of the change summary.
#[derive(Debug, Clone, PartialEq)]
pub struct FileSystemChange {
    pub event_id: String,
    pub event_date: i64,
    pub file_system_item_id: String,
    pub file_system_item_name: Option<String>,
    pub file_system_item: Option<RemoteFileInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFileSystemChange {
    event_id: String,
    #[serde(default)]
    event_date: i64,
    file_system_item_id: String,
    file_system_item_name: Option<String>,
    file_system_item: Option<RawFileSystemItem>,
}

/// Result of `NuxeoDrive.GetChangeSummary`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChangeSummary {
    pub file_system_changes: Vec<FileSystemChange>,
    pub sync_date: i64,
    pub upper_bound: Option<i64>,
    pub active_synchronization_root_definitions: String,
    pub has_too_many_changes: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChangeSummary {
    #[serde(default)]
    file_system_changes: Vec<RawFileSystemChange>,
    #[serde(default)]
    sync_date: i64,
    upper_bound: Option<i64>,
    #[serde(default)]
    active_synchronization_root_definitions: String,
    #[serde(default)]
    has_too_many_changes: bool,
}

impl ChangeSummary {
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let raw: RawChangeSummary = serde_json::from_value(value)?;
        Ok(ChangeSummary {
            file_system_changes: raw
                .file_system_changes
                .into_iter()
                .map(|c| FileSystemChange {
                    event_id: c.event_id,
                    event_date: c.event_date,
                    file_system_item_id: c.file_system_item_id,
                    file_system_item_name: c.file_system_item_name,
                    file_system_item: c.file_system_item.map(RemoteFileInfo::from),
                })
                .collect(),
            sync_date: raw.sync_date,
            upper_bound: raw.upper_bound,
            active_synchronization_root_definitions: raw.active_synchronization_root_definitions,
            has_too_many_changes: raw.has_too_many_changes,
        })
    }
}

/// One page of `NuxeoDrive.ScrollDescendants`.
#[derive(Debug, Clone, Default)]
pub struct ScrollBatch {
    pub scroll_id: Option<String>,
    pub items: Vec<RemoteFileInfo>,
}

impl ScrollBatch {
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let scroll_id = value
            .get("scrollId")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let items = match value.get("fileSystemItems") {
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .cloned()
                .map(RemoteFileInfo::from_json)
                .collect::<Result<Vec<_>>>()?,
            _ => Vec::new(),
        };
        Ok(ScrollBatch { scroll_id, items })
    }
}

/// Blob metadata attached to a document property.
#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    pub name: String,
    pub digest: Option<String>,
    pub digest_algorithm: Option<DigestAlgorithm>,
    pub size: u64,
    pub mimetype: Option<String>,
    pub data: Option<String>,
}

/// A document fetched through the Document API.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDocument {
    pub uid: String,
    pub path: String,
    pub name: String,
    pub doc_type: String,
    pub version: Option<String>,
    pub is_version: bool,
    pub lock_owner: Option<String>,
    pub lock_created: Option<String>,
    pub permissions: Vec<String>,
    pub properties: serde_json::Value,
}

impl RemoteDocument {
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let text = |key: &str| value.get(key).and_then(|v| v.as_str()).map(str::to_string);
        let uid = text("uid").ok_or_else(|| {
            ClientError::InvalidArgument("document entity without uid".to_string())
        })?;
        let permissions = value
            .pointer("/contextParameters/permissions")
            .and_then(|p| p.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|p| p.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(RemoteDocument {
            path: text("path").unwrap_or_default(),
            name: text("title").unwrap_or_else(|| uid.clone()),
            doc_type: text("type").unwrap_or_default(),
            version: text("versionLabel"),
            is_version: value
                .get("isVersion")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            lock_owner: text("lockOwner"),
            lock_created: text("lockCreated"),
            permissions,
            properties: value
                .get("properties")
                .cloned()
                .unwrap_or(serde_json::Value::Null),
            uid,
        })
    }

    pub fn can_write(&self) -> bool {
        self.permissions.iter().any(|p| p == "Write" || p == "ReadWrite" || p == "Everything")
    }

    /// Blob stored under `xpath`, if any.
    pub fn get_blob(&self, xpath: &str) -> Option<Blob> {
        let prop = self.properties.get(xpath)?;
        let obj = prop.as_object()?;
        let text = |key: &str| obj.get(key).and_then(|v| v.as_str()).map(str::to_string);
        Some(Blob {
            name: text("name")?,
            digest: text("digest"),
            digest_algorithm: text("digestAlgorithm").and_then(|a| a.parse().ok()),
            size: obj
                .get("length")
                .and_then(|v| v.as_str().and_then(|s| s.parse().ok()).or_else(|| v.as_u64()))
                .unwrap_or(0),
            mimetype: text("mime-type"),
            data: text("data"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_file_item_from_json() {
        let info = RemoteFileInfo::from_json(json!({
            "id": "defaultFileSystemItemFactory#default#abc",
            "parentId": "defaultSyncRootFolderItemFactory#default#ws",
            "name": "report.txt",
            "folder": false,
            "path": "/root/ws/abc",
            "lastModificationDate": 1_500_000_000_000i64,
            "digest": "b1946ac92492d2347c6235b4d2611184",
            "digestAlgorithm": "MD5",
            "downloadURL": "nxfile/default/abc/blobholder:0/report.txt",
            "canRename": true,
            "canDelete": true,
            "canUpdate": true,
            "canCreateChild": true,
            "lockInfo": {"owner": "bob", "created": 1_500_000_000_000i64}
        }))
        .unwrap();
        assert_eq!(info.digest_algorithm, Some(DigestAlgorithm::Md5));
        assert!(!info.can_create_child);
        assert_eq!(info.lock_owner.as_deref(), Some("bob"));
        assert!(info.last_modification_time.is_some());

        let again = RemoteFileInfo::from_json(info.to_json()).unwrap();
        assert_eq!(again, info);
    }

    #[test]
    fn test_folder_item_drops_blob_fields() {
        let info = RemoteFileInfo::from_json(json!({
            "id": "f1",
            "parentId": "root",
            "name": "Docs",
            "folder": true,
            "digest": "ignored",
            "canUpdate": true,
            "canCreateChild": true,
            "canScrollDescendants": true
        }))
        .unwrap();
        assert!(info.digest.is_none());
        assert!(!info.can_update);
        assert!(info.can_create_child);
        assert!(info.can_scroll_descendants);
    }

    #[test]
    fn test_change_summary() {
        let summary = ChangeSummary::from_json(json!({
            "fileSystemChanges": [{
                "eventId": "deleted",
                "eventDate": 42,
                "fileSystemItemId": "f1",
                "fileSystemItemName": "a.txt",
                "fileSystemItem": null
            }],
            "syncDate": 1000,
            "upperBound": 17,
            "activeSynchronizationRootDefinitions": "default:ws",
            "hasTooManyChanges": false
        }))
        .unwrap();
        assert_eq!(summary.file_system_changes.len(), 1);
        assert_eq!(summary.upper_bound, Some(17));
        assert!(summary.file_system_changes[0].file_system_item.is_none());
    }

    #[test]
    fn test_document_blob() {
        let doc = RemoteDocument::from_json(json!({
            "uid": "doc-1",
            "title": "memo",
            "type": "File",
            "lockOwner": "alice",
            "contextParameters": {"permissions": ["Read", "Write"]},
            "properties": {
                "file:content": {
                    "name": "memo.txt",
                    "digest": "b1946ac92492d2347c6235b4d2611184",
                    "digestAlgorithm": "MD5",
                    "length": "6",
                    "data": "http://srv/nxfile/default/doc-1/file:content/memo.txt"
                }
            }
        }))
        .unwrap();
        assert!(doc.can_write());
        let blob = doc.get_blob("file:content").unwrap();
        assert_eq!(blob.name, "memo.txt");
        assert_eq!(blob.size, 6);
        assert!(doc.get_blob("note:note").is_none());
    }
}
