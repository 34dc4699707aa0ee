//! HTTP transport for the tracker's remote tool protocol.
//!
//! Tool invocations are POSTed as JSON to the tracker endpoint and results
//! come back as content blocks; the first text block is parsed as JSON when
//! possible and returned verbatim otherwise.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{QueueError, ToolTransport};

/// Environment variable holding the tracker endpoint URL.
pub const TRACKER_URL_ENV: &str = "TASK_MCP_URL";
/// Environment variable holding the optional bearer key.
pub const TRACKER_API_KEY_ENV: &str = "MCP_API_KEY";
/// Default tracker endpoint when the env var is unset.
pub const DEFAULT_TRACKER_URL: &str = "http://localhost:8001/sse";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Reqwest-backed [`ToolTransport`] speaking the tracker's tool protocol.
pub struct HttpTransport {
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::Client,
    connected: AtomicBool,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Result<Self, QueueError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| QueueError::Connection(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            endpoint: endpoint.into(),
            api_key: api_key.filter(|k| !k.is_empty()),
            client,
            connected: AtomicBool::new(false),
        })
    }

    /// Build a transport from `TASK_MCP_URL` / `MCP_API_KEY`.
    pub fn from_env() -> Result<Self, QueueError> {
        let endpoint =
            std::env::var(TRACKER_URL_ENV).unwrap_or_else(|_| DEFAULT_TRACKER_URL.to_string());
        let api_key = std::env::var(TRACKER_API_KEY_ENV).ok();
        Self::new(endpoint, api_key)
    }

    fn request(&self, body: &Value) -> reqwest::RequestBuilder {
        let mut req = self.client.post(&self.endpoint).json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        req
    }

    async fn post(&self, body: Value) -> Result<Value, QueueError> {
        let response = self
            .request(&body)
            .send()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(QueueError::Connection(format!(
                "tracker returned status {status}"
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| QueueError::Protocol(format!("invalid JSON from tracker: {e}")))
    }
}

/// Extract the tool result from a response envelope.
///
/// Tool results arrive as content blocks: the first `{"type": "text"}`
/// block's text is parsed as JSON when possible, otherwise returned as a
/// JSON string. Responses without content blocks are returned as-is.
pub(crate) fn parse_tool_result(response: Value) -> Result<Value, QueueError> {
    let blocks = response
        .get("result")
        .and_then(|r| r.get("content"))
        .or_else(|| response.get("content"))
        .and_then(Value::as_array);

    let Some(blocks) = blocks else {
        return Ok(response);
    };

    for block in blocks {
        if block.get("type").and_then(Value::as_str) == Some("text") {
            let text = block
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| QueueError::Protocol("text block without text".to_string()))?;
            return Ok(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())));
        }
    }

    Err(QueueError::Protocol(
        "tool response had no text content block".to_string(),
    ))
}

#[async_trait]
impl ToolTransport for HttpTransport {
    async fn connect(&self) -> Result<(), QueueError> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        // Initialize handshake; a reachable tracker answers with its
        // capabilities, which we do not need beyond liveness.
        self.post(json!({"method": "initialize", "params": {}})).await?;
        self.connected.store(true, Ordering::SeqCst);
        info!(endpoint = %self.endpoint, "connected to tracker");
        Ok(())
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            debug!(endpoint = %self.endpoint, "disconnected from tracker");
        }
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, QueueError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(QueueError::NotConnected);
        }
        let response = self
            .post(json!({
                "method": "tools/call",
                "params": {"name": name, "arguments": arguments},
            }))
            .await?;
        parse_tool_result(response)
    }
}
