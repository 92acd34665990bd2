//! Remote side of a binding.
//!
//! [`RemoteFileSystem`] is the seam between the synchronization core and a
//! server: the HTTP [`AutomationClient`] talks to a real repository while
//! [`MemoryRemote`] keeps a whole tree in process.

pub mod automation;
pub mod memory;
pub mod upload;

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::errors::{ClientError, Result};
use crate::info::{ChangeSummary, RemoteDocument, RemoteFileInfo, ScrollBatch};

pub use automation::AutomationClient;
pub use memory::MemoryRemote;

/// Connection settings of a remote client.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub server_url: String,
    pub user_id: String,
    pub device_id: String,
    pub password: Option<String>,
    pub token: Option<String>,
    pub repository: String,
    pub client_version: String,
    pub application_name: String,
    /// Timeout of JSON operations
    pub timeout: Duration,
    /// Timeout of blob transfers
    pub blob_timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080/nuxeo/".to_string(),
            user_id: String::new(),
            device_id: uuid::Uuid::new_v4().simple().to_string(),
            password: None,
            token: None,
            repository: crate::names::DEFAULT_REPOSITORY_NAME.to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            application_name: "Nuxeo Drive".to_string(),
            timeout: Duration::from_secs(20),
            blob_timeout: Duration::from_secs(60),
        }
    }
}

/// FileSystemItem API plus the few Document API calls used by DirectEdit.
#[async_trait]
pub trait RemoteFileSystem: Send + Sync {
    fn server_url(&self) -> &str;

    fn user_id(&self) -> &str;

    /// Whether the change summary accepts an event log id lower bound.
    fn is_event_log_id(&self) -> bool;

    async fn get_filesystem_root_info(&self) -> Result<RemoteFileInfo>;

    async fn get_fs_item(
        &self,
        fs_item_id: &str,
        parent_fs_item_id: Option<&str>,
    ) -> Result<Option<RemoteFileInfo>>;

    /// Like [`RemoteFileSystem::get_fs_item`] but a missing item is an error.
    async fn get_fs_info(
        &self,
        fs_item_id: &str,
        parent_fs_item_id: Option<&str>,
    ) -> Result<RemoteFileInfo> {
        self.get_fs_item(fs_item_id, parent_fs_item_id)
            .await?
            .ok_or_else(|| ClientError::NotFound(fs_item_id.to_string()))
    }

    async fn get_fs_children(&self, fs_item_id: &str) -> Result<Vec<RemoteFileInfo>>;

    async fn scroll_descendants(
        &self,
        fs_item_id: &str,
        scroll_id: Option<&str>,
        batch_size: usize,
    ) -> Result<ScrollBatch>;

    async fn fs_exists(&self, fs_item_id: &str) -> Result<bool>;

    async fn make_folder(
        &self,
        parent_id: &str,
        name: &str,
        overwrite: bool,
    ) -> Result<RemoteFileInfo>;

    /// Create a file from local content.
    async fn stream_file(
        &self,
        parent_id: &str,
        file_path: &Path,
        filename: &str,
        overwrite: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<RemoteFileInfo>;

    /// Replace the content of an existing file.
    async fn stream_update(
        &self,
        fs_item_id: &str,
        file_path: &Path,
        parent_fs_item_id: Option<&str>,
        filename: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<RemoteFileInfo>;

    /// Download the content of `info` into `file_out`, verifying the digest.
    async fn stream_content(
        &self,
        info: &RemoteFileInfo,
        file_out: &Path,
        cancel: Option<&CancellationToken>,
    ) -> Result<()>;

    async fn delete(&self, fs_item_id: &str, parent_fs_item_id: Option<&str>) -> Result<()>;

    async fn rename(&self, fs_item_id: &str, new_name: &str) -> Result<RemoteFileInfo>;

    async fn move_item(&self, fs_item_id: &str, new_parent_id: &str) -> Result<RemoteFileInfo>;

    async fn can_move(&self, fs_item_id: &str, new_parent_id: &str) -> Result<bool>;

    async fn conflicted_name(&self, original_name: &str) -> Result<String>;

    async fn get_changes(
        &self,
        last_root_definitions: &str,
        log_id: Option<i64>,
        last_sync_date: Option<i64>,
    ) -> Result<ChangeSummary>;

    async fn fetch_document(&self, doc_ref: &str) -> Result<RemoteDocument>;

    /// Download the blob stored under `xpath` of a document.
    async fn download_blob(
        &self,
        doc_ref: &str,
        xpath: &str,
        file_out: &Path,
        cancel: Option<&CancellationToken>,
    ) -> Result<()>;

    async fn attach_blob(
        &self,
        doc_ref: &str,
        file_path: &Path,
        xpath: &str,
        filename: &str,
        apply_versioning_policy: bool,
    ) -> Result<()>;

    async fn lock(&self, doc_ref: &str) -> Result<()>;

    async fn unlock(&self, doc_ref: &str) -> Result<()>;

    async fn register_as_root(&self, doc_ref: &str) -> Result<()>;

    async fn unregister_as_root(&self, doc_ref: &str) -> Result<()>;

    async fn get_roots(&self) -> Result<Vec<RemoteDocument>>;
}

/// Document uid behind a FileSystemItem id (`factory#repo#uid`).
pub fn doc_uid_from_fs_id(fs_item_id: &str) -> &str {
    fs_item_id.rsplit('#').next().unwrap_or(fs_item_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_uid_from_fs_id() {
        assert_eq!(doc_uid_from_fs_id("defaultFileSystemItemFactory#default#abc"), "abc");
        assert_eq!(doc_uid_from_fs_id("abc"), "abc");
    }
}
