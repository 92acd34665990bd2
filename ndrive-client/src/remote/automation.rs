//! HTTP client for the Automation operation interface.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{doc_uid_from_fs_id, RemoteConfig, RemoteFileSystem};
use crate::digest::DigestAlgorithm;
use crate::errors::{ClientError, Result};
use crate::info::{ChangeSummary, RemoteDocument, RemoteFileInfo, ScrollBatch};

const JSON_CONTENT_TYPE: &str = "application/json+nxrequest";
const ACCEPT: &str = "application/json+nxentity, */*";

/// Automation client bound to one server and user.
pub struct AutomationClient {
    config: RemoteConfig,
    server_url: String,
    pub(crate) client: Client,
    pub(crate) blob_client: Client,
    operations: RwLock<HashMap<String, Value>>,
    is_event_log_id: AtomicBool,
    pub(crate) new_upload_api: AtomicBool,
}

impl AutomationClient {
    /// Build the client without contacting the server.
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let mut server_url = config.server_url.clone();
        if !server_url.ends_with('/') {
            server_url.push('/');
        }
        url::Url::parse(&server_url)
            .map_err(|e| ClientError::InvalidArgument(format!("{}: {}", server_url, e)))?;

        let client = Client::builder()
            .timeout(config.timeout)
            .cookie_store(true)
            .default_headers(common_headers(&config)?)
            .build()?;
        let blob_client = Client::builder()
            .timeout(config.blob_timeout)
            .cookie_store(true)
            .default_headers(common_headers(&config)?)
            .build()?;

        Ok(Self {
            config,
            server_url,
            client,
            blob_client,
            operations: RwLock::new(HashMap::new()),
            is_event_log_id: AtomicBool::new(true),
            new_upload_api: AtomicBool::new(true),
        })
    }

    /// Build the client and load the operation registry.
    pub async fn connect(config: RemoteConfig) -> Result<Self> {
        let client = Self::new(config)?;
        client.fetch_api().await?;
        Ok(client)
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    pub fn automation_url(&self) -> String {
        format!("{}site/automation/", self.server_url)
    }

    pub fn rest_api_url(&self) -> String {
        format!("{}api/v1/", self.server_url)
    }

    pub(crate) fn authenticate(&self, request: RequestBuilder) -> RequestBuilder {
        match (&self.config.token, &self.config.password) {
            (Some(token), _) => request.header("X-Authentication-Token", token),
            (None, Some(password)) => request.basic_auth(&self.config.user_id, Some(password)),
            (None, None) => request,
        }
    }

    fn unauthorized(&self, code: u16) -> ClientError {
        ClientError::Unauthorized {
            server: self.server_url.clone(),
            user: self.config.user_id.clone(),
            code,
        }
    }

    /// Map an error status to the client error taxonomy.
    pub(crate) async fn check_response(&self, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let url = response.url().to_string();
        let message = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::UNAUTHORIZED => self.unauthorized(status.as_u16()),
            StatusCode::FORBIDDEN => ClientError::Forbidden(url),
            StatusCode::NOT_FOUND => ClientError::NotFound(url),
            _ => ClientError::http(status.as_u16(), url, message),
        })
    }

    /// Load the operation registry and detect server capabilities.
    pub async fn fetch_api(&self) -> Result<()> {
        let url = self.automation_url();
        debug!("Fetching operation registry from {}", url);
        let response = self.authenticate(self.client.get(&url)).send().await?;
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(self.unauthorized(response.status().as_u16()))
            }
            _ => {}
        }
        let registry: Value = self.check_response(response).await?.json().await?;

        let mut operations = HashMap::new();
        for key in ["operations", "chains"] {
            if let Some(Value::Array(items)) = registry.get(key) {
                for op in items {
                    let Some(id) = op.get("id").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    operations.insert(id.to_string(), op.clone());
                    if let Some(Value::Array(aliases)) = op.get("aliases") {
                        for alias in aliases.iter().filter_map(|a| a.as_str()) {
                            operations.insert(alias.to_string(), op.clone());
                        }
                    }
                }
            }
        }

        let lower_bound = operations
            .get("NuxeoDrive.GetChangeSummary")
            .and_then(|op| op.get("params"))
            .and_then(|p| p.as_array())
            .map(|params| {
                params
                    .iter()
                    .any(|p| p.get("name").and_then(|n| n.as_str()) == Some("lowerBound"))
            })
            .unwrap_or(false);
        self.is_event_log_id.store(lower_bound, Ordering::SeqCst);
        debug!("Loaded {} operations, event log id: {}", operations.len(), lower_bound);
        *self.operations.write() = operations;
        Ok(())
    }

    pub(crate) fn check_operation(&self, command: &str) -> Result<()> {
        let operations = self.operations.read();
        // Batch endpoints are not operations
        if operations.is_empty() || command.contains('/') || operations.contains_key(command) {
            return Ok(());
        }
        if command.starts_with("NuxeoDrive.") {
            return Err(ClientError::AddonNotInstalled(command.to_string()));
        }
        Err(ClientError::InvalidArgument(format!(
            "{} is not available on {}",
            command, self.server_url
        )))
    }

    /// Run an operation, returning its JSON result (`Null` for void or
    /// non-JSON answers).
    pub async fn execute(&self, command: &str, input: Option<&str>, params: Value) -> Result<Value> {
        self.check_operation(command)?;
        let url = format!("{}{}", self.automation_url(), command);
        let body = request_body(input, params);
        trace!("Calling {} with {}", url, body);

        let mut request = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .header("Accept", ACCEPT)
            .header("X-NXproperties", "*")
            .header("X-NXDocumentProperties", "*");
        if self.config.repository != crate::names::DEFAULT_REPOSITORY_NAME {
            request = request.header("X-NXRepository", &self.config.repository);
        }
        let response = self.authenticate(request).body(body.to_string()).send().await?;
        parse_response(self.check_response(response).await?).await
    }

    /// Same as [`AutomationClient::execute`] without expecting a result.
    pub async fn execute_void(&self, command: &str, input: Option<&str>, params: Value) -> Result<()> {
        self.check_operation(command)?;
        let url = format!("{}{}", self.automation_url(), command);
        let request = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .header("Accept", ACCEPT)
            .header("X-NXVoidOperation", "true");
        let response = self
            .authenticate(request)
            .body(request_body(input, params).to_string())
            .send()
            .await?;
        self.check_response(response).await?;
        Ok(())
    }

    /// Ask the server for an authentication token. `None` when the server
    /// does not provide the token endpoint.
    pub async fn request_token(&self, revoke: bool) -> Result<Option<String>> {
        let url = format!("{}authentication/token", self.server_url);
        let device_description = device_description();
        let request = self.client.get(&url).query(&[
            ("deviceId", self.config.device_id.as_str()),
            ("applicationName", self.config.application_name.as_str()),
            ("permission", "ReadWrite"),
            ("revoke", if revoke { "true" } else { "false" }),
            ("deviceDescription", device_description.as_str()),
        ]);
        let response = self.authenticate(request).send().await?;
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(self.unauthorized(response.status().as_u16()))
            }
            StatusCode::NOT_FOUND => Ok(None),
            _ => {
                let token = self.check_response(response).await?.text().await?;
                Ok(if revoke { None } else { Some(token.trim().to_string()) })
            }
        }
    }

    pub async fn revoke_token(&self) -> Result<()> {
        self.request_token(true).await.map(|_| ())
    }

    /// GET `url` into `file_out`, checking the digest when one is given.
    pub async fn download(
        &self,
        url: &str,
        file_out: &Path,
        digest: Option<&str>,
        algorithm: Option<DigestAlgorithm>,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        let url = if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}{}", self.server_url, url)
        };
        debug!("Downloading {} to {}", url, file_out.display());
        let response = self.authenticate(self.blob_client.get(&url)).send().await?;
        let response = self.check_response(response).await?;

        let result = write_stream(response, file_out, digest, algorithm, cancel).await;
        if result.is_err() {
            if let Err(e) = tokio::fs::remove_file(file_out).await {
                trace!("Cannot remove partial download {}: {}", file_out.display(), e);
            }
        }
        result
    }

    fn fs_item(value: Value) -> Result<RemoteFileInfo> {
        RemoteFileInfo::from_json(value)
    }
}

fn device_description() -> String {
    format!("{} {}", std::env::consts::OS, std::env::consts::ARCH)
}

fn request_body(input: Option<&str>, params: Value) -> Value {
    let params: Map<String, Value> = match params {
        Value::Object(map) => map.into_iter().filter(|(_, v)| !v.is_null()).collect(),
        _ => Map::new(),
    };
    let mut body = json!({ "params": params });
    if let Some(input) = input {
        body["input"] = Value::String(input.to_string());
    }
    body
}

pub(crate) async fn parse_response(response: Response) -> Result<Value> {
    let is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false);
    let bytes = response.bytes().await?;
    if is_json && !bytes.is_empty() {
        Ok(serde_json::from_slice(&bytes)?)
    } else {
        Ok(Value::Null)
    }
}

fn common_headers(config: &RemoteConfig) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    let pairs = [
        ("x-user-id", config.user_id.clone()),
        ("x-device-id", config.device_id.clone()),
        ("x-client-version", config.client_version.clone()),
        (
            "user-agent",
            format!("{}/{}", config.application_name, config.client_version),
        ),
        ("x-application-name", config.application_name.clone()),
        ("cache-control", "no-cache".to_string()),
    ];
    for (name, value) in pairs {
        let value = HeaderValue::from_str(&value)
            .map_err(|e| ClientError::InvalidArgument(format!("header {}: {}", name, e)))?;
        headers.insert(HeaderName::from_static(name), value);
    }
    Ok(headers)
}

async fn write_stream(
    response: Response,
    file_out: &Path,
    digest: Option<&str>,
    algorithm: Option<DigestAlgorithm>,
    cancel: Option<&CancellationToken>,
) -> Result<()> {
    let algorithm = algorithm
        .or_else(|| digest.and_then(DigestAlgorithm::guess))
        .unwrap_or_default();
    let mut hasher = algorithm.hasher();
    let mut file = tokio::fs::File::create(file_out).await?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        if cancel.map(|c| c.is_cancelled()).unwrap_or(false) {
            return Err(ClientError::Interrupted);
        }
        let chunk = chunk?;
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    if let Some(expected) = digest {
        let actual = hex::encode(hasher.finalize());
        if actual != expected {
            warn!("Corrupted download {}: {} != {}", file_out.display(), actual, expected);
            return Err(ClientError::CorruptedFile {
                path: file_out.display().to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
    }
    Ok(())
}

#[async_trait]
impl RemoteFileSystem for AutomationClient {
    fn server_url(&self) -> &str {
        &self.server_url
    }

    fn user_id(&self) -> &str {
        &self.config.user_id
    }

    fn is_event_log_id(&self) -> bool {
        self.is_event_log_id.load(Ordering::SeqCst)
    }

    async fn get_filesystem_root_info(&self) -> Result<RemoteFileInfo> {
        let value = self.execute("NuxeoDrive.GetTopLevelFolder", None, json!({})).await?;
        Self::fs_item(value)
    }

    async fn get_fs_item(
        &self,
        fs_item_id: &str,
        parent_fs_item_id: Option<&str>,
    ) -> Result<Option<RemoteFileInfo>> {
        let value = self
            .execute(
                "NuxeoDrive.GetFileSystemItem",
                None,
                json!({ "id": fs_item_id, "parentId": parent_fs_item_id }),
            )
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        Self::fs_item(value).map(Some)
    }

    async fn get_fs_children(&self, fs_item_id: &str) -> Result<Vec<RemoteFileInfo>> {
        let value = self
            .execute("NuxeoDrive.GetChildren", None, json!({ "id": fs_item_id }))
            .await?;
        match value {
            Value::Array(items) => items.into_iter().map(Self::fs_item).collect(),
            _ => Ok(Vec::new()),
        }
    }

    async fn scroll_descendants(
        &self,
        fs_item_id: &str,
        scroll_id: Option<&str>,
        batch_size: usize,
    ) -> Result<ScrollBatch> {
        let value = self
            .execute(
                "NuxeoDrive.ScrollDescendants",
                None,
                json!({ "id": fs_item_id, "scrollId": scroll_id, "batchSize": batch_size }),
            )
            .await?;
        ScrollBatch::from_json(value)
    }

    async fn fs_exists(&self, fs_item_id: &str) -> Result<bool> {
        let value = self
            .execute("NuxeoDrive.FileSystemItemExists", None, json!({ "id": fs_item_id }))
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn make_folder(&self, parent_id: &str, name: &str, overwrite: bool) -> Result<RemoteFileInfo> {
        let value = self
            .execute(
                "NuxeoDrive.CreateFolder",
                None,
                json!({ "parentId": parent_id, "name": name, "overwrite": overwrite }),
            )
            .await?;
        Self::fs_item(value)
    }

    async fn stream_file(
        &self,
        parent_id: &str,
        file_path: &Path,
        filename: &str,
        overwrite: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<RemoteFileInfo> {
        let value = self
            .execute_with_blob_streaming(
                "NuxeoDrive.CreateFile",
                file_path,
                filename,
                json!({ "parentId": parent_id, "overwrite": overwrite }),
                cancel,
            )
            .await?;
        Self::fs_item(value)
    }

    async fn stream_update(
        &self,
        fs_item_id: &str,
        file_path: &Path,
        parent_fs_item_id: Option<&str>,
        filename: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<RemoteFileInfo> {
        let value = self
            .execute_with_blob_streaming(
                "NuxeoDrive.UpdateFile",
                file_path,
                filename,
                json!({ "id": fs_item_id, "parentId": parent_fs_item_id }),
                cancel,
            )
            .await?;
        Self::fs_item(value)
    }

    async fn stream_content(
        &self,
        info: &RemoteFileInfo,
        file_out: &Path,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        let url = info
            .download_url
            .as_deref()
            .ok_or_else(|| ClientError::InvalidArgument(format!("{} has no content", info.uid)))?;
        self.download(url, file_out, info.digest.as_deref(), info.digest_algorithm, cancel)
            .await
    }

    async fn delete(&self, fs_item_id: &str, parent_fs_item_id: Option<&str>) -> Result<()> {
        self.execute_void(
            "NuxeoDrive.Delete",
            None,
            json!({ "id": fs_item_id, "parentId": parent_fs_item_id }),
        )
        .await
    }

    async fn rename(&self, fs_item_id: &str, new_name: &str) -> Result<RemoteFileInfo> {
        let value = self
            .execute("NuxeoDrive.Rename", None, json!({ "id": fs_item_id, "name": new_name }))
            .await?;
        Self::fs_item(value)
    }

    async fn move_item(&self, fs_item_id: &str, new_parent_id: &str) -> Result<RemoteFileInfo> {
        let value = self
            .execute(
                "NuxeoDrive.Move",
                None,
                json!({ "srcId": fs_item_id, "destId": new_parent_id }),
            )
            .await?;
        Self::fs_item(value)
    }

    async fn can_move(&self, fs_item_id: &str, new_parent_id: &str) -> Result<bool> {
        let value = self
            .execute(
                "NuxeoDrive.CanMove",
                None,
                json!({ "srcId": fs_item_id, "destId": new_parent_id }),
            )
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn conflicted_name(&self, original_name: &str) -> Result<String> {
        let value = self
            .execute(
                "NuxeoDrive.GenerateConflictedItemName",
                None,
                json!({ "name": original_name }),
            )
            .await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ClientError::InvalidArgument("empty conflicted name".to_string()))
    }

    async fn get_changes(
        &self,
        last_root_definitions: &str,
        log_id: Option<i64>,
        last_sync_date: Option<i64>,
    ) -> Result<ChangeSummary> {
        let params = match log_id {
            Some(log_id) if self.is_event_log_id() => json!({
                "lowerBound": log_id,
                "lastSyncActiveRootDefinitions": last_root_definitions,
            }),
            _ => json!({
                "lastSyncDate": last_sync_date,
                "lastSyncActiveRootDefinitions": last_root_definitions,
            }),
        };
        let value = self.execute("NuxeoDrive.GetChangeSummary", None, params).await?;
        ChangeSummary::from_json(value)
    }

    async fn fetch_document(&self, doc_ref: &str) -> Result<RemoteDocument> {
        let url = format!("{}id/{}", self.rest_api_url(), doc_uid_from_fs_id(doc_ref));
        let request = self
            .client
            .get(&url)
            .header("fetch-document", "lock")
            .header("enrichers-document", "permissions")
            .header("X-NXproperties", "*");
        let response = self.authenticate(request).send().await?;
        let value: Value = self.check_response(response).await?.json().await?;
        RemoteDocument::from_json(value)
    }

    async fn download_blob(
        &self,
        doc_ref: &str,
        xpath: &str,
        file_out: &Path,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        let doc = self.fetch_document(doc_ref).await?;
        match doc.get_blob(xpath) {
            Some(blob) => {
                let url = blob.data.clone().unwrap_or_else(|| {
                    format!("nxfile/{}/{}/{}/{}", self.config.repository, doc.uid, xpath, blob.name)
                });
                self.download(&url, file_out, blob.digest.as_deref(), blob.digest_algorithm, cancel)
                    .await
            }
            None if xpath == "note:note" => {
                let content = doc
                    .properties
                    .get("note:note")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                tokio::fs::write(file_out, content).await?;
                Ok(())
            }
            None => Err(ClientError::NotFound(format!("{} on {}", xpath, doc_ref))),
        }
    }

    async fn attach_blob(
        &self,
        doc_ref: &str,
        file_path: &Path,
        xpath: &str,
        filename: &str,
        apply_versioning_policy: bool,
    ) -> Result<()> {
        let uid = doc_uid_from_fs_id(doc_ref);
        let (command, params) = if xpath == "note:note" {
            (
                "NuxeoDrive.AttachBlob",
                json!({ "document": uid, "applyVersioningPolicy": apply_versioning_policy }),
            )
        } else {
            ("Blob.AttachOnDocument", json!({ "document": uid, "xpath": xpath }))
        };
        self.execute_with_blob_streaming(command, file_path, filename, params, None)
            .await?;
        Ok(())
    }

    async fn lock(&self, doc_ref: &str) -> Result<()> {
        let input = format!("doc:{}", doc_uid_from_fs_id(doc_ref));
        match self.execute("Document.Lock", Some(&input), json!({})).await {
            Ok(_) => Ok(()),
            Err(ClientError::Http { status, message, .. }) if status == 409 || status == 500 => {
                match message.split("Document already locked by ").nth(1) {
                    Some(rest) => Err(ClientError::DocumentAlreadyLocked {
                        owner: rest.split(':').next().unwrap_or_default().to_string(),
                    }),
                    None => Err(ClientError::http(status, input, message)),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn unlock(&self, doc_ref: &str) -> Result<()> {
        let input = format!("doc:{}", doc_uid_from_fs_id(doc_ref));
        self.execute("Document.Unlock", Some(&input), json!({})).await?;
        Ok(())
    }

    async fn register_as_root(&self, doc_ref: &str) -> Result<()> {
        let input = format!("doc:{}", doc_uid_from_fs_id(doc_ref));
        self.execute_void("NuxeoDrive.SetSynchronization", Some(&input), json!({ "enable": true }))
            .await
    }

    async fn unregister_as_root(&self, doc_ref: &str) -> Result<()> {
        let input = format!("doc:{}", doc_uid_from_fs_id(doc_ref));
        self.execute_void("NuxeoDrive.SetSynchronization", Some(&input), json!({ "enable": false }))
            .await
    }

    async fn get_roots(&self) -> Result<Vec<RemoteDocument>> {
        let value = self.execute("NuxeoDrive.GetRoots", None, json!({})).await?;
        match value.get("entries") {
            Some(Value::Array(entries)) => entries
                .iter()
                .cloned()
                .map(RemoteDocument::from_json)
                .collect(),
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::extract::Path as AxumPath;
    use axum::http::{HeaderMap as AxumHeaders, StatusCode as AxumStatus};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use tempfile::tempdir;

    fn item(id: &str, name: &str, folder: bool) -> Value {
        json!({
            "id": id,
            "parentId": "root",
            "name": name,
            "folder": folder,
            "path": format!("/root/{}", id),
            "digest": if folder { Value::Null } else { json!("b1946ac92492d2347c6235b4d2611184") },
            "digestAlgorithm": "MD5",
            "downloadURL": format!("nxfile/default/{}/blobholder-0/{}", id, name),
            "canRename": true,
            "canDelete": true,
            "canUpdate": true,
            "canCreateChild": folder
        })
    }

    pub(crate) async fn spawn_server(with_lower_bound: bool) -> String {
        let change_params = if with_lower_bound {
            json!([{"name": "lastSyncDate"}, {"name": "lowerBound"}])
        } else {
            json!([{"name": "lastSyncDate"}])
        };
        let registry = json!({
            "operations": [
                {"id": "NuxeoDrive.GetTopLevelFolder", "aliases": [], "params": []},
                {"id": "NuxeoDrive.GetChangeSummary", "params": change_params},
                {"id": "NuxeoDrive.CreateFile", "params": []},
                {"id": "NuxeoDrive.Rename", "params": []},
                {"id": "Document.Lock", "aliases": ["Document.SetLock"], "params": []}
            ]
        });

        let app = Router::new()
            .route(
                "/nuxeo/site/automation/",
                get(move |headers: AxumHeaders| {
                    let registry = registry.clone();
                    async move {
                        if headers.get("authorization").is_none() {
                            return Err(AxumStatus::UNAUTHORIZED);
                        }
                        Ok(Json(registry))
                    }
                }),
            )
            .route(
                "/nuxeo/site/automation/NuxeoDrive.GetTopLevelFolder",
                post(|| async { Json(item("root", "Nuxeo Drive", true)) }),
            )
            .route(
                "/nuxeo/site/automation/NuxeoDrive.GetChangeSummary",
                post(|body: Bytes| async move {
                    let body: Value = serde_json::from_slice(&body).unwrap_or_default();
                    let bound = body["params"]["lowerBound"].as_i64();
                    Json(json!({
                        "fileSystemChanges": [],
                        "syncDate": 1000,
                        "upperBound": bound.map(|b| b + 1),
                        "activeSynchronizationRootDefinitions": "default:ws",
                        "hasTooManyChanges": false
                    }))
                }),
            )
            .route(
                "/nuxeo/site/automation/Document.Lock",
                post(|| async {
                    (
                        AxumStatus::CONFLICT,
                        "Document already locked by bob: Cannot lock",
                    )
                }),
            )
            .route(
                "/nuxeo/api/v1/upload",
                post(|| async { Json(json!({"batchId": "batch-1"})) }),
            )
            .route(
                "/nuxeo/api/v1/upload/:batch/:idx",
                post(|headers: AxumHeaders, body: Bytes| async move {
                    let name = headers
                        .get("X-File-Name")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    assert_eq!(name, "my%20report.txt");
                    assert_eq!(&body[..], b"hello\n");
                    AxumStatus::CREATED
                }),
            )
            .route(
                "/nuxeo/api/v1/upload/:batch/:idx/execute/:op",
                post(|AxumPath((batch, _idx, op)): AxumPath<(String, String, String)>| async move {
                    assert_eq!(batch, "batch-1");
                    assert_eq!(op, "NuxeoDrive.CreateFile");
                    Json(item("new-file", "report.txt", false))
                }),
            )
            .route(
                "/nuxeo/nxfile/default/:id/blobholder-0/:name",
                get(|AxumPath((id, _name)): AxumPath<(String, String)>| async move {
                    if id == "corrupt" {
                        b"tampered".to_vec()
                    } else {
                        b"hello\n".to_vec()
                    }
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/nuxeo", addr)
    }

    fn config(server_url: String, password: Option<&str>) -> RemoteConfig {
        RemoteConfig {
            server_url,
            user_id: "alice".to_string(),
            password: password.map(str::to_string),
            ..RemoteConfig::default()
        }
    }

    #[tokio::test]
    async fn test_connect_and_capabilities() {
        let url = spawn_server(true).await;
        let client = AutomationClient::connect(config(url.clone(), Some("secret")))
            .await
            .unwrap();
        assert!(client.is_event_log_id());
        assert!(client.server_url().ends_with("/nuxeo/"));

        let root = client.get_filesystem_root_info().await.unwrap();
        assert!(root.folderish);
        assert_eq!(root.uid, "root");

        let summary = client.get_changes("default:ws", Some(41), None).await.unwrap();
        assert_eq!(summary.upper_bound, Some(42));

        // Missing drive operation
        let err = client
            .get_fs_children("root")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::AddonNotInstalled(op) if op == "NuxeoDrive.GetChildren"));

        let url = spawn_server(false).await;
        let legacy = AutomationClient::connect(config(url, Some("secret"))).await.unwrap();
        assert!(!legacy.is_event_log_id());
        let summary = legacy.get_changes("default:ws", Some(41), Some(5)).await.unwrap();
        assert_eq!(summary.upper_bound, None);
    }

    #[tokio::test]
    async fn test_unauthorized() {
        let url = spawn_server(true).await;
        let err = AutomationClient::connect(config(url, None)).await.err().unwrap();
        assert!(matches!(err, ClientError::Unauthorized { code: 401, ref user, .. } if user == "alice"));
    }

    #[tokio::test]
    async fn test_upload_and_download() {
        let url = spawn_server(true).await;
        let client = AutomationClient::connect(config(url, Some("secret"))).await.unwrap();
        let dir = tempdir().unwrap();
        let source = dir.path().join("my report.txt");
        std::fs::write(&source, b"hello\n").unwrap();

        let created = client
            .stream_file("root", &source, "my report.txt", false, None)
            .await
            .unwrap();
        assert_eq!(created.uid, "new-file");

        let target = dir.path().join(".report.txt.nxpart");
        client.stream_content(&created, &target, None).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"hello\n");

        let mut corrupt = created.clone();
        corrupt.download_url = Some("nxfile/default/corrupt/blobholder-0/report.txt".to_string());
        let err = client.stream_content(&corrupt, &target, None).await.unwrap_err();
        assert!(matches!(err, ClientError::CorruptedFile { .. }));
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_lock_conflict_names_owner() {
        let url = spawn_server(true).await;
        let client = AutomationClient::connect(config(url, Some("secret"))).await.unwrap();
        let err = client.lock("defaultFileSystemItemFactory#default#doc").await.unwrap_err();
        assert!(matches!(err, ClientError::DocumentAlreadyLocked { owner } if owner == "bob"));
    }
}
