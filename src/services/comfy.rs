//! Client for the remote image-generation server (ComfyUI HTTP API).
//!
//! The server's queue and history responses are loosely shaped JSON; they are
//! parsed here into [`QueueSnapshot`] and [`HistoryLookup`] so the worker only
//! deals with typed states. A prompt missing from both the live queue and the
//! history is a normal transient state, reported as [`HistoryLookup::Pending`].

use reqwest::multipart;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use uuid::Uuid;

/// Timeout for the status endpoint probe.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for calls without a configured phase timeout.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ComfyError {
    #[error("HTTP request to image server failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Image server returned HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("Unexpected image server response: {0}")]
    Parse(String),

    #[error("Image server rejected the prompt: {0}")]
    Rejected(String),
}

impl ComfyError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ComfyError::Http(err) if err.is_timeout())
    }
}

/// Reference to an image held by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_image_type")]
    pub kind: String,
}

fn default_image_type() -> String {
    "output".to_string()
}

/// Response of `POST /upload/image`.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadedImage {
    pub name: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[derive(Debug, Deserialize)]
struct PromptResponse {
    prompt_id: Option<String>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    node_errors: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct QueueResponse {
    #[serde(default)]
    queue_running: Vec<Vec<Value>>,
    #[serde(default)]
    queue_pending: Vec<Vec<Value>>,
}

/// Prompt ids currently running or waiting on the server.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueSnapshot {
    pub running: Vec<String>,
    pub pending: Vec<String>,
}

impl QueueSnapshot {
    /// 0 while running, 1.. for pending entries; `None` when absent.
    pub fn position(&self, prompt_id: &str) -> Option<usize> {
        if self.running.iter().any(|id| id == prompt_id) {
            return Some(0);
        }
        self.pending
            .iter()
            .position(|id| id == prompt_id)
            .map(|index| index + 1)
    }

    pub fn is_running(&self, prompt_id: &str) -> bool {
        self.running.iter().any(|id| id == prompt_id)
    }
}

impl From<QueueResponse> for QueueSnapshot {
    fn from(response: QueueResponse) -> Self {
        // Each entry is [number, prompt_id, prompt, extra_data, outputs_to_execute].
        let ids = |entries: Vec<Vec<Value>>| {
            entries
                .into_iter()
                .filter_map(|entry| entry.get(1).and_then(Value::as_str).map(str::to_string))
                .collect()
        };
        Self {
            running: ids(response.queue_running),
            pending: ids(response.queue_pending),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub images: Vec<ImageRef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryStatus {
    #[serde(default)]
    pub status_str: Option<String>,
    #[serde(default)]
    pub completed: Option<bool>,
}

/// One finished prompt in `GET /history/{id}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub outputs: BTreeMap<String, NodeOutput>,
    #[serde(default)]
    pub status: Option<HistoryStatus>,
}

impl HistoryEntry {
    /// The image to fetch: first image of `preferred_node`, else the first
    /// image of the lowest-numbered node that has one.
    pub fn select_image(&self, preferred_node: &str) -> Option<&ImageRef> {
        self.outputs
            .get(preferred_node)
            .and_then(|node| node.images.first())
            .or_else(|| {
                let mut nodes: Vec<_> = self.outputs.iter().collect();
                nodes.sort_by(|(a, _), (b, _)| node_order(a).cmp(&node_order(b)));
                nodes.into_iter().find_map(|(_, node)| node.images.first())
            })
    }

    pub fn failed(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.status_str.as_deref())
            .is_some_and(|s| s == "error")
    }
}

/// Node ids are numeric strings; non-numeric ids sort last.
fn node_order(id: &str) -> (u64, &str) {
    (id.parse().unwrap_or(u64::MAX), id)
}

#[derive(Debug, Clone)]
pub enum HistoryLookup {
    /// Not in history yet.
    Pending,
    Complete(HistoryEntry),
}

/// HTTP client for one image-generation server.
#[derive(Debug, Clone)]
pub struct ComfyClient {
    http: Client,
    base_url: String,
    client_id: String,
}

impl ComfyClient {
    pub fn new(base_url: &str) -> Result<Self, ComfyError> {
        let http = Client::builder()
            .user_agent(concat!("arcade-memorial/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id: Uuid::new_v4().to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `POST /upload/image` as multipart; returns the server-assigned name.
    pub async fn upload_image(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        mime: &str,
        timeout: Duration,
    ) -> Result<UploadedImage, ComfyError> {
        let part = multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str(mime)?;
        let form = multipart::Form::new()
            .part("image", part)
            .text("type", "input")
            .text("overwrite", "true");

        let response = self
            .http
            .post(self.url("/upload/image"))
            .multipart(form)
            .timeout(timeout)
            .send()
            .await?;

        Ok(check_status(response).await?.json().await?)
    }

    /// `POST /prompt`; returns the server's prompt id.
    pub async fn submit_prompt(&self, workflow: &Value, timeout: Duration) -> Result<String, ComfyError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": self.client_id,
        });

        let response = self
            .http
            .post(self.url("/prompt"))
            .json(&body)
            .timeout(timeout)
            .send()
            .await?;

        let parsed: PromptResponse = check_status(response).await?.json().await?;
        if let Some(error) = parsed.error {
            return Err(ComfyError::Rejected(error.to_string()));
        }
        if let Some(node_errors) = parsed.node_errors.filter(|v| v.as_object().is_some_and(|o| !o.is_empty())) {
            return Err(ComfyError::Rejected(node_errors.to_string()));
        }
        parsed
            .prompt_id
            .ok_or_else(|| ComfyError::Parse("missing prompt_id".to_string()))
    }

    /// `GET /queue`.
    pub async fn queue(&self) -> Result<QueueSnapshot, ComfyError> {
        let response = self
            .http
            .get(self.url("/queue"))
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .send()
            .await?;
        let parsed: QueueResponse = check_status(response).await?.json().await?;
        Ok(parsed.into())
    }

    /// `GET /history/{prompt_id}`.
    pub async fn history(&self, prompt_id: &str) -> Result<HistoryLookup, ComfyError> {
        let response = self
            .http
            .get(self.url(&format!("/history/{prompt_id}")))
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .send()
            .await?;
        let mut parsed: HashMap<String, HistoryEntry> = check_status(response).await?.json().await?;
        Ok(match parsed.remove(prompt_id) {
            Some(entry) => HistoryLookup::Complete(entry),
            None => HistoryLookup::Pending,
        })
    }

    /// `GET /view` for an output image.
    pub async fn view(&self, image: &ImageRef) -> Result<Vec<u8>, ComfyError> {
        let response = self
            .http
            .get(self.url("/view"))
            .query(&[
                ("filename", image.filename.as_str()),
                ("subfolder", image.subfolder.as_str()),
                ("type", image.kind.as_str()),
            ])
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .send()
            .await?;
        Ok(check_status(response).await?.bytes().await?.to_vec())
    }

    /// `POST /queue` with `{delete: [id]}`.
    pub async fn delete_from_queue(&self, prompt_id: &str) -> Result<(), ComfyError> {
        let response = self
            .http
            .post(self.url("/queue"))
            .json(&serde_json::json!({ "delete": [prompt_id] }))
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    /// `POST /interrupt`; stops whatever the server is executing.
    pub async fn interrupt(&self) -> Result<(), ComfyError> {
        let response = self
            .http
            .post(self.url("/interrupt"))
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    /// Ping `GET /system_stats`; any transport or status failure is `false`.
    pub async fn system_stats(&self, timeout: Duration) -> bool {
        match self
            .http
            .get(self.url("/system_stats"))
            .timeout(timeout)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                tracing::debug!(error = %err, "Image server health check failed");
                false
            }
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ComfyError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ComfyError::Status { status, body })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_positions() {
        let response: QueueResponse = serde_json::from_value(serde_json::json!({
            "queue_running": [[3, "p-running", {}, {}, []]],
            "queue_pending": [[4, "p-next", {}, {}, []], [5, "p-last", {}, {}, []]]
        }))
        .unwrap();
        let snapshot = QueueSnapshot::from(response);

        assert_eq!(snapshot.position("p-running"), Some(0));
        assert_eq!(snapshot.position("p-next"), Some(1));
        assert_eq!(snapshot.position("p-last"), Some(2));
        assert_eq!(snapshot.position("p-gone"), None);
        assert!(snapshot.is_running("p-running"));
    }

    #[test]
    fn test_queue_tolerates_malformed_entries() {
        let response: QueueResponse = serde_json::from_value(serde_json::json!({
            "queue_running": [[], [1]],
        }))
        .unwrap();
        assert_eq!(QueueSnapshot::from(response), QueueSnapshot::default());
    }

    #[test]
    fn test_select_image_prefers_final_save_node() {
        let entry: HistoryEntry = serde_json::from_value(serde_json::json!({
            "outputs": {
                "12": {"images": [{"filename": "preview.png", "subfolder": "", "type": "temp"}]},
                "9": {"images": [{"filename": "photo_anime_1_00001_.png", "subfolder": "", "type": "output"}]}
            },
            "status": {"status_str": "success", "completed": true}
        }))
        .unwrap();

        assert_eq!(entry.select_image("9").unwrap().filename, "photo_anime_1_00001_.png");
        assert!(!entry.failed());
    }

    #[test]
    fn test_select_image_falls_back_to_any_node() {
        let entry: HistoryEntry = serde_json::from_value(serde_json::json!({
            "outputs": {
                "3": {"text": ["no images here"]},
                "15": {"images": [{"filename": "fallback.png"}]}
            }
        }))
        .unwrap();

        let image = entry.select_image("9").unwrap();
        assert_eq!(image.filename, "fallback.png");
        assert_eq!(image.kind, "output");
    }

    #[test]
    fn test_fallback_follows_numeric_node_order() {
        let entry: HistoryEntry = serde_json::from_value(serde_json::json!({
            "outputs": {
                "10": {"images": [{"filename": "later.png"}]},
                "ui": {"images": [{"filename": "named.png"}]},
                "8": {"images": [{"filename": "earlier.png"}]}
            }
        }))
        .unwrap();

        assert_eq!(entry.select_image("9").unwrap().filename, "earlier.png");
    }

    #[test]
    fn test_history_without_images() {
        let entry: HistoryEntry = serde_json::from_value(serde_json::json!({
            "outputs": {},
            "status": {"status_str": "error", "completed": false}
        }))
        .unwrap();
        assert!(entry.select_image("9").is_none());
        assert!(entry.failed());
    }
}
