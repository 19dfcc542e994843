//! Session client for the upstream ComfyUI peer.
//!
//! One client instance serves exactly one job: submit the prompt, stream
//! progress frames over the WebSocket until the completion frame arrives,
//! then resolve the artifact through the history endpoint. HTTP failures
//! are logged and collapsed into empty returns; only the stream's idle
//! timeout surfaces upward as a typed error.

pub mod select;

use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::path::Path;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::config::Config;
use crate::core::AppError;
pub use select::{ImageRef, select_images};

/// Network timeouts for the upstream session.
#[derive(Debug, Clone, Copy)]
pub struct ComfyTimeouts {
    /// HTTP connect timeout.
    pub http_connect: Duration,
    /// HTTP read timeout.
    pub http_read: Duration,
    /// WebSocket connect timeout.
    pub ws_connect: Duration,
    /// WebSocket idle timeout; exceeding it aborts the stream.
    pub ws_idle: Duration,
}

impl Default for ComfyTimeouts {
    fn default() -> Self {
        Self {
            http_connect: Duration::from_secs(3),
            http_read: Duration::from_secs(10),
            ws_connect: Duration::from_secs(5),
            ws_idle: Duration::from_secs(120),
        }
    }
}

impl ComfyTimeouts {
    /// Derive timeouts from the application configuration.
    #[must_use]
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            http_connect: Duration::from_secs_f64(cfg.comfy_http_connect_timeout),
            http_read: Duration::from_secs_f64(cfg.comfy_http_read_timeout),
            ws_connect: Duration::from_secs_f64(cfg.comfy_ws_connect_timeout),
            ws_idle: Duration::from_secs_f64(cfg.comfy_ws_idle_timeout),
        }
    }
}

/// Normalise a configured upstream address into `(scheme, host:port)`.
///
/// Accepts both `"127.0.0.1:8188"` and a full `http(s)://` URL.
#[must_use]
pub fn normalize_server(address: &str) -> (String, String) {
    let raw = address.trim();
    if let Some((scheme, rest)) = raw.split_once("://") {
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "https" => "https",
            _ => "http",
        };
        let hostport = rest.trim_end_matches('/').trim();
        let hostport = if hostport.is_empty() {
            "127.0.0.1:8188"
        } else {
            hostport
        };
        return (scheme.to_owned(), hostport.to_owned());
    }
    let hostport = if raw.is_empty() { "127.0.0.1:8188" } else { raw };
    ("http".to_owned(), hostport.to_owned())
}

/// A session against one ComfyUI peer.
///
/// Not shared between jobs; construct a fresh client per job so the
/// `client_id` cleanly scopes interrupt and progress correlation.
#[derive(Debug, Clone)]
pub struct ComfyClient {
    address: String,
    client_id: String,
    http: Client,
    timeouts: ComfyTimeouts,
}

impl ComfyClient {
    /// Create a client for the given upstream address.
    pub fn new(address: &str, timeouts: ComfyTimeouts) -> anyhow::Result<Self> {
        let http = Client::builder()
            .connect_timeout(timeouts.http_connect)
            .timeout(timeouts.http_read)
            .build()?;
        Ok(Self {
            address: address.to_owned(),
            client_id: Uuid::new_v4().to_string(),
            http,
            timeouts,
        })
    }

    fn http_base(&self) -> String {
        let (scheme, hostport) = normalize_server(&self.address);
        format!("{scheme}://{hostport}")
    }

    fn ws_base(&self) -> String {
        let (scheme, hostport) = normalize_server(&self.address);
        let ws_scheme = if scheme == "https" { "wss" } else { "ws" };
        format!("{ws_scheme}://{hostport}")
    }

    /// Load the workflow graph from disk, apply node overrides, and submit
    /// it to `/prompt`.
    ///
    /// Overrides deep-merge into each node's `inputs` so existing wire
    /// connections survive; top-level override keys other than `inputs`
    /// replace the node's keys directly. Returns the response object
    /// (containing `prompt_id`) or an empty map after logging any failure.
    pub async fn queue_prompt(
        &self,
        graph_path: &Path,
        overrides: &Map<String, Value>,
    ) -> Map<String, Value> {
        let mut graph: Map<String, Value> = match std::fs::read_to_string(graph_path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(graph) => graph,
                Err(err) => {
                    tracing::error!(path = %graph_path.display(), error = %err, "workflow graph invalid");
                    return Map::new();
                }
            },
            Err(err) => {
                tracing::error!(path = %graph_path.display(), error = %err, "workflow graph missing");
                return Map::new();
            }
        };

        for (node_id, node_overrides) in overrides {
            let Some(node) = graph.get_mut(node_id) else {
                tracing::warn!(node_id = %node_id, "override targets a node missing from the graph");
                continue;
            };
            apply_node_override(node, node_overrides);
        }

        let url = format!("{}/prompt", self.http_base());
        let body = json!({ "prompt": graph, "client_id": self.client_id });
        match self.http.post(&url).json(&body).send().await {
            Ok(resp) => match resp.error_for_status() {
                Ok(resp) => resp.json::<Map<String, Value>>().await.unwrap_or_else(|err| {
                    tracing::error!(url = %url, error = %err, "queue_prompt response unreadable");
                    Map::new()
                }),
                Err(err) => {
                    tracing::error!(url = %url, error = %err, "queue_prompt rejected");
                    Map::new()
                }
            },
            Err(err) => {
                tracing::error!(url = %url, error = %err, "queue_prompt request failed");
                Map::new()
            }
        }
    }

    /// Upload a reference image into the upstream input folder so a
    /// LoadImage node can reference it.
    ///
    /// Returns the filename the server stored it under; the server may
    /// rename on collision. Falls back to the requested name when the
    /// response is unparseable, and `None` on request failure.
    pub async fn upload_image(
        &self,
        filename: &str,
        bytes: Vec<u8>,
        mime: &str,
    ) -> Option<String> {
        let url = format!("{}/upload/image", self.http_base());
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename.to_owned())
            .mime_str(mime)
            .ok()?;
        let form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("type", "input");
        let resp = match self.http.post(&url).multipart(form).send().await {
            Ok(resp) => match resp.error_for_status() {
                Ok(resp) => resp,
                Err(err) => {
                    tracing::error!(url = %url, error = %err, "upload_image rejected");
                    return None;
                }
            },
            Err(err) => {
                tracing::error!(url = %url, error = %err, "upload_image request failed");
                return None;
            }
        };
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        Some(parse_uploaded_name(&body).unwrap_or_else(|| filename.to_owned()))
    }

    /// Stream progress frames until the prompt completes, then resolve the
    /// generated images.
    ///
    /// `on_progress` is called with percentages in 0..=100. The returned
    /// list is ordered best-first by the artifact selection rules. An idle
    /// WebSocket surfaces [`AppError::UpstreamTimeout`]; a server-side
    /// close ends the stream normally (the history lookup then decides
    /// whether anything was produced).
    pub async fn stream(
        &self,
        prompt_id: &str,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<Vec<(String, Vec<u8>)>, AppError> {
        let ws_url = format!("{}/ws?clientId={}", self.ws_base(), self.client_id);
        let connect = tokio::time::timeout(self.timeouts.ws_connect, connect_async(ws_url.as_str()));
        let (ws, _) = match connect.await {
            Ok(Ok(ok)) => ok,
            Ok(Err(err)) => {
                tracing::error!(url = %ws_url, error = %err, "websocket connect failed");
                return Err(AppError::UpstreamProtocol(format!(
                    "websocket connect failed: {err}"
                )));
            }
            Err(_) => {
                tracing::error!(url = %ws_url, "websocket connect timed out");
                return Err(AppError::UpstreamTimeout { stage: "ws_connect" });
            }
        };
        let (_write, mut read) = ws.split();

        loop {
            let frame = tokio::time::timeout(self.timeouts.ws_idle, read.next()).await;
            match frame {
                Err(_) => {
                    tracing::error!(url = %ws_url, prompt_id = %prompt_id, "websocket idle timeout");
                    return Err(AppError::UpstreamTimeout { stage: "ws_idle" });
                }
                Ok(None) | Ok(Some(Ok(Message::Close(_)))) => {
                    tracing::info!(prompt_id = %prompt_id, "websocket closed by peer");
                    break;
                }
                Ok(Some(Ok(Message::Text(text)))) => {
                    match serde_json::from_str::<StreamFrame>(&text) {
                        Ok(StreamFrame::Executing { data }) => {
                            if data.node.is_none()
                                && data.prompt_id.as_deref() == Some(prompt_id)
                            {
                                on_progress(100.0);
                                tracing::info!(prompt_id = %prompt_id, "generation complete");
                                break;
                            }
                        }
                        Ok(StreamFrame::Progress { data }) => {
                            if data.max > 0.0 {
                                let pct = (data.value / data.max) * 100.0;
                                tracing::debug!(prompt_id = %prompt_id, progress = pct, "upstream progress");
                                on_progress(pct);
                            }
                        }
                        Ok(StreamFrame::Other) | Err(_) => {}
                    }
                }
                Ok(Some(Ok(_))) => {} // binary previews, pings, pongs
                Ok(Some(Err(err))) => {
                    use tokio_tungstenite::tungstenite::Error as WsError;
                    match err {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            tracing::info!(prompt_id = %prompt_id, "websocket connection closed");
                            break;
                        }
                        other => {
                            tracing::error!(prompt_id = %prompt_id, error = %other, "websocket stream error");
                            return Err(AppError::UpstreamProtocol(other.to_string()));
                        }
                    }
                }
            }
        }

        let history = self.get_history(prompt_id).await;
        let entry = history.get(prompt_id).cloned().unwrap_or(Value::Null);
        let refs = select_images(&entry);
        if let Some(best) = refs.first() {
            tracing::info!(
                prompt_id = %prompt_id,
                filename = %best.filename,
                folder_type = %best.folder_type,
                candidates = refs.len(),
                "artifact selected"
            );
        }

        let mut images = Vec::new();
        for image in refs {
            if let Some(bytes) = self
                .get_image(&image.filename, &image.subfolder, &image.folder_type)
                .await
            {
                images.push((image.filename, bytes));
            }
        }
        Ok(images)
    }

    /// Ask the upstream to interrupt whatever our client id is running.
    /// Idempotent; false only when the request itself failed.
    pub async fn interrupt(&self) -> bool {
        let url = format!("{}/interrupt", self.http_base());
        let body = json!({ "client_id": self.client_id });
        match self.http.post(&url).json(&body).send().await {
            Ok(resp) => resp.error_for_status().is_ok(),
            Err(err) => {
                tracing::error!(url = %url, error = %err, "interrupt request failed");
                false
            }
        }
    }

    /// Fetch `/history/{prompt_id}`; empty object on any failure.
    pub async fn get_history(&self, prompt_id: &str) -> Value {
        let url = format!("{}/history/{prompt_id}", self.http_base());
        match self.http.get(&url).send().await {
            Ok(resp) => match resp.error_for_status() {
                Ok(resp) => resp.json().await.unwrap_or(Value::Null),
                Err(err) => {
                    tracing::error!(url = %url, error = %err, "history request rejected");
                    Value::Null
                }
            },
            Err(err) => {
                tracing::error!(url = %url, error = %err, "history request failed");
                Value::Null
            }
        }
    }

    /// Fetch one image through `/view`.
    pub async fn get_image(
        &self,
        filename: &str,
        subfolder: &str,
        folder_type: &str,
    ) -> Option<Vec<u8>> {
        let url = format!("{}/view", self.http_base());
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("filename", filename),
                ("subfolder", subfolder),
                ("type", folder_type),
            ])
            .send()
            .await;
        match resp {
            Ok(resp) => match resp.error_for_status() {
                Ok(resp) => resp.bytes().await.ok().map(|b| b.to_vec()),
                Err(err) => {
                    tracing::error!(url = %url, error = %err, "image request rejected");
                    None
                }
            },
            Err(err) => {
                tracing::error!(url = %url, error = %err, "image request failed");
                None
            }
        }
    }
}

/// Deep-merge one node override into a graph node.
fn apply_node_override(node: &mut Value, overrides: &Value) {
    let (Some(node_obj), Some(override_obj)) = (node.as_object_mut(), overrides.as_object())
    else {
        return;
    };
    match (
        node_obj.get_mut("inputs").and_then(Value::as_object_mut),
        override_obj.get("inputs").and_then(Value::as_object),
    ) {
        (Some(inputs), Some(override_inputs)) => {
            for (key, value) in override_inputs {
                inputs.insert(key.clone(), value.clone());
            }
        }
        _ => {
            for (key, value) in override_obj {
                node_obj.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Pick the stored filename out of an `/upload/image` response.
fn parse_uploaded_name(body: &Value) -> Option<String> {
    let obj = body.as_object()?;
    for key in ["name", "filename", "file"] {
        if let Some(name) = obj.get(key).and_then(Value::as_str) {
            if !name.is_empty() {
                return Some(name.to_owned());
            }
        }
    }
    obj.get("names")
        .and_then(Value::as_array)
        .and_then(|names| names.first())
        .and_then(Value::as_str)
        .map(str::to_owned)
}

/// Typed frames of the upstream status stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum StreamFrame {
    Executing { data: ExecutingData },
    Progress { data: ProgressData },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ExecutingData {
    node: Option<Value>,
    prompt_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProgressData {
    #[serde(default)]
    value: f64,
    #[serde(default)]
    max: f64,
}
