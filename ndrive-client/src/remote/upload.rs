//! Batch upload: the REST `api/v1/upload` API with a fallback to the legacy
//! Automation `batch/upload` + `batch/execute` endpoints.

use bytes::Bytes;
use futures::StreamExt;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::CONTENT_TYPE;
use reqwest::Body;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::automation::{parse_response, AutomationClient};
use crate::errors::{ClientError, Result};
use crate::names::safe_filename;

/// Minimum transaction timeout negotiated for batch executions.
pub const DEFAULT_TX_TIMEOUT: Duration = Duration::from_secs(300);

const FILENAME_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Transaction timeout for a batch whose upload took `upload_duration`.
pub fn transaction_timeout(upload_duration: Duration) -> Duration {
    DEFAULT_TX_TIMEOUT.max(upload_duration * 2)
}

impl AutomationClient {
    /// Open an upload batch, switching to the legacy API when the server
    /// does not know the REST one.
    pub async fn init_upload(&self) -> Result<String> {
        if self.new_upload_api.load(Ordering::SeqCst) {
            let url = format!("{}upload", self.rest_api_url());
            let response = self.authenticate(self.client.post(&url)).send().await?;
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                info!("New upload API is not available on {}, using the legacy one", url);
                self.new_upload_api.store(false, Ordering::SeqCst);
            } else {
                let value: Value = self.check_response(response).await?.json().await?;
                if let Some(batch) = value.get("batchId").and_then(|b| b.as_str()) {
                    return Ok(batch.to_string());
                }
                return Err(ClientError::InvalidArgument("upload batch without id".to_string()));
            }
        }
        Ok(format!(
            "{}_{}",
            chrono::Utc::now().timestamp_millis(),
            uuid::Uuid::new_v4().simple()
        ))
    }

    /// Stream a file into a batch slot.
    pub async fn upload_file(
        &self,
        batch_id: &str,
        file_idx: u32,
        file_path: &Path,
        filename: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        let file = tokio::fs::File::open(file_path).await?;
        let size = file.metadata().await?.len();
        let token = cancel.cloned();
        let stream = ReaderStream::with_capacity(file, crate::names::FILE_BUFFER_SIZE).map(
            move |chunk: std::io::Result<Bytes>| match &token {
                Some(token) if token.is_cancelled() => Err(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "upload interrupted",
                )),
                _ => chunk,
            },
        );

        let new_api = self.new_upload_api.load(Ordering::SeqCst);
        let url = if new_api {
            format!("{}upload/{}/{}", self.rest_api_url(), batch_id, file_idx)
        } else {
            format!("{}batch/upload", self.automation_url())
        };
        let encoded = utf8_percent_encode(&safe_filename(filename), FILENAME_ENCODE).to_string();
        let mut request = self
            .blob_client
            .post(&url)
            .header("X-File-Name", encoded)
            .header("X-File-Size", size.to_string())
            .header("X-File-Type", "application/octet-stream")
            .header(CONTENT_TYPE, "application/octet-stream");
        if !new_api {
            request = request
                .header("X-Batch-Id", batch_id)
                .header("X-File-Idx", file_idx.to_string());
        }
        debug!("Uploading {} ({} bytes) to {}", file_path.display(), size, url);
        let response = self
            .authenticate(request)
            .body(Body::wrap_stream(stream))
            .send()
            .await;
        if cancel.map(|c| c.is_cancelled()).unwrap_or(false) {
            return Err(ClientError::Interrupted);
        }
        self.check_response(response?).await?;
        Ok(())
    }

    /// Run `command` with the uploaded batch file as input.
    pub async fn execute_batch(
        &self,
        command: &str,
        batch_id: &str,
        file_idx: u32,
        params: Value,
        tx_timeout: Duration,
    ) -> Result<Value> {
        if self.new_upload_api.load(Ordering::SeqCst) {
            let url = format!(
                "{}upload/{}/{}/execute/{}",
                self.rest_api_url(),
                batch_id,
                file_idx,
                command
            );
            let request = self
                .blob_client
                .post(&url)
                .header(CONTENT_TYPE, "application/json")
                .header("Nuxeo-Transaction-Timeout", tx_timeout.as_secs().to_string())
                .timeout(tx_timeout);
            let response = self
                .authenticate(request)
                .body(json!({ "params": params }).to_string())
                .send()
                .await?;
            return parse_response(self.check_response(response).await?).await;
        }

        let mut all_params = json!({
            "operationId": command,
            "batchId": batch_id,
            "fileIdx": file_idx.to_string(),
        });
        if let (Some(target), Value::Object(extra)) = (all_params.as_object_mut(), params) {
            target.extend(extra);
        }
        self.execute("batch/execute", None, all_params).await
    }

    /// Upload a file then run `command` on it, negotiating the transaction
    /// timeout from the measured upload time.
    pub async fn execute_with_blob_streaming(
        &self,
        command: &str,
        file_path: &Path,
        filename: &str,
        params: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value> {
        self.check_operation(command)?;
        let batch_id = self.init_upload().await?;
        let started = Instant::now();
        self.upload_file(&batch_id, 0, file_path, filename, cancel).await?;
        let tx_timeout = transaction_timeout(started.elapsed());
        self.execute_batch(command, &batch_id, 0, params, tx_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_timeout() {
        assert_eq!(transaction_timeout(Duration::from_secs(10)), DEFAULT_TX_TIMEOUT);
        assert_eq!(
            transaction_timeout(Duration::from_secs(200)),
            Duration::from_secs(400)
        );
    }

    #[test]
    fn test_filename_encoding() {
        let encoded = utf8_percent_encode(&safe_filename("a b/c.txt"), FILENAME_ENCODE).to_string();
        assert_eq!(encoded, "a%20b-c.txt");
    }
}
