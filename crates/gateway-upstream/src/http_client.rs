//! A concrete [`UpstreamClient`](crate::server_context::UpstreamClient) that
//! speaks MCP streamable-HTTP to a real upstream server (§4.4 "owns one
//! upstream MCP client connection ... stdio, HTTP, streamable HTTP").
//!
//! Grounded on the teacher's `turbomcp-transport` streamable HTTP client
//! (`streamable_http_client.rs`): a single `/mcp` endpoint, `Mcp-Session-Id`
//! echoed back from `initialize`, a background SSE reader for
//! server-originated notifications and reverse requests, scaled down to
//! the subset this gateway's `ServerContext` needs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use gateway_types::{AdvertisedCapabilities, GatewayError, GatewayResult, PromptAdvert, ResourceAdvert, ToolAdvert};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use secrecy::ExposeSecret;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::auth_strategy::TokenCache;
use crate::server_context::{ReverseRequestKind, ServerEvent, UpstreamClient};

#[derive(Debug, Clone)]
pub struct HttpUpstreamClientConfig {
    /// `https://host:port` with no trailing slash.
    pub base_url: String,
    /// Defaults to `/mcp`, matching the gateway's own wire surface (§6).
    pub endpoint_path: String,
    pub client_name: String,
    pub client_version: String,
    pub protocol_version: String,
    pub request_timeout: Duration,
}

impl Default for HttpUpstreamClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            endpoint_path: "/mcp".to_string(),
            client_name: "mcp-gateway".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: "2025-06-18".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Identifies which cached token (if any) this client stamps onto its
/// outbound requests; `ServerContext::refresh_credentials` keeps the
/// cache current, this client only reads it (§4.4 "Credential refresh").
#[derive(Clone)]
struct TokenSource {
    cache: Arc<TokenCache>,
    server_id: String,
    subject: String,
}

pub struct HttpUpstreamClient {
    config: HttpUpstreamClientConfig,
    http: reqwest::Client,
    session_id: RwLock<Option<String>>,
    tokens: Option<TokenSource>,
}

impl HttpUpstreamClient {
    #[must_use]
    pub fn new(config: HttpUpstreamClientConfig) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(config.request_timeout)
                .build()
                .unwrap_or_default(),
            config,
            session_id: RwLock::new(None),
            tokens: None,
        }
    }

    /// Reads the current token from `cache` on every request instead of a
    /// value fixed at construction time, so a mid-life refresh (§4.4)
    /// takes effect on the next call without rebuilding the client.
    #[must_use]
    pub fn with_token_source(mut self, cache: Arc<TokenCache>, server_id: String, subject: String) -> Self {
        self.tokens = Some(TokenSource { cache, server_id, subject });
        self
    }

    fn url(&self) -> String {
        format!("{}{}", self.config.base_url, self.config.endpoint_path)
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/event-stream"));
        if let Some(session_id) = self.session_id.read().clone() {
            if let Ok(value) = HeaderValue::from_str(&session_id) {
                headers.insert("mcp-session-id", value);
            }
        }
        if let Some(source) = &self.tokens {
            if let Some(token) = source.cache.get(&source.server_id, &source.subject) {
                if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token.access_token.expose_secret())) {
                    headers.insert(AUTHORIZATION, value);
                }
            }
        }
        headers
    }

    async fn rpc_call(&self, method: &str, params: Value) -> GatewayResult<Value> {
        let id = Value::from(fastrand::u64(..));
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        let response = self
            .http
            .post(self.url())
            .headers(self.headers())
            .json(&body)
            .send()
            .await
            .map_err(|err| GatewayError::ServerError(format!("{method}: {err}")))?;

        if let Some(session_id) = response
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.write() = Some(session_id.to_string());
        }

        if !response.status().is_success() {
            return Err(GatewayError::ServerError(format!("{method}: http {}", response.status())));
        }

        let envelope: Value = response
            .json()
            .await
            .map_err(|err| GatewayError::ServerError(format!("{method}: invalid json response: {err}")))?;

        if let Some(error) = envelope.get("error") {
            let message = error.get("message").and_then(Value::as_str).unwrap_or("upstream error");
            return Err(GatewayError::ServerError(message.to_string()));
        }
        Ok(envelope.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn list_capabilities(&self) -> AdvertisedCapabilities {
        let tools = self
            .rpc_call("tools/list", Value::Null)
            .await
            .ok()
            .and_then(|v| v.get("tools").cloned())
            .and_then(|v| serde_json::from_value::<Vec<ToolAdvert>>(v).ok())
            .unwrap_or_default();
        let resources = self
            .rpc_call("resources/list", Value::Null)
            .await
            .ok()
            .and_then(|v| v.get("resources").cloned())
            .and_then(|v| serde_json::from_value::<Vec<ResourceAdvert>>(v).ok())
            .unwrap_or_default();
        let prompts = self
            .rpc_call("prompts/list", Value::Null)
            .await
            .ok()
            .and_then(|v| v.get("prompts").cloned())
            .and_then(|v| serde_json::from_value::<Vec<PromptAdvert>>(v).ok())
            .unwrap_or_default();
        AdvertisedCapabilities { tools, resources, prompts }
    }

    /// Spawns the background SSE reader that turns the upstream's
    /// `GET /mcp` stream into [`ServerEvent`]s: list-changed/resource
    /// notifications are forwarded directly; server-initiated requests
    /// (sampling/roots/elicit) get a oneshot response channel whose
    /// resolution is POSTed back to the upstream as a JSON-RPC response.
    fn spawn_sse_reader(&self, tx: mpsc::Sender<ServerEvent>) {
        let url = self.url();
        let headers = self.headers();
        let http = self.http.clone();
        tokio::spawn(async move {
            let response = match http.get(&url).headers(headers).send().await {
                Ok(response) => response,
                Err(err) => {
                    warn!(%err, "upstream sse stream failed to open");
                    return;
                }
            };
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            while let Some(chunk) = stream.next().await {
                let Ok(chunk) = chunk else { break };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(frame_end) = buffer.find("\n\n") {
                    let frame = buffer[..frame_end].to_string();
                    buffer.drain(..frame_end + 2);
                    if let Some(event) = parse_sse_frame(&frame, &http, &url) {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }
}

fn parse_sse_frame(frame: &str, http: &reqwest::Client, url: &str) -> Option<ServerEvent> {
    let data_line = frame.lines().find_map(|line| line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")))?;
    let message: Value = serde_json::from_str(data_line.trim()).ok()?;
    let method = message.get("method").and_then(Value::as_str)?;
    let params = message.get("params").cloned().unwrap_or(Value::Null);

    match method {
        "notifications/tools/list_changed" => Some(ServerEvent::ToolsListChanged),
        "notifications/resources/list_changed" => Some(ServerEvent::ResourcesListChanged),
        "notifications/prompts/list_changed" => Some(ServerEvent::PromptsListChanged),
        "notifications/resources/updated" => Some(ServerEvent::ResourceUpdated {
            uri: params.get("uri").and_then(Value::as_str).unwrap_or_default().to_string(),
            payload: params,
        }),
        "sampling/createMessage" | "roots/list" | "elicitation/create" => {
            let kind = match method {
                "sampling/createMessage" => ReverseRequestKind::Sampling,
                "roots/list" => ReverseRequestKind::Roots,
                _ => ReverseRequestKind::Elicitation,
            };
            let proxy_request_id = params
                .get("_meta")
                .and_then(|m| m.get("proxyContext"))
                .and_then(|p| p.get("proxyRequestId"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let server_request_id = message.get("id").cloned().unwrap_or(Value::Null);
            let (respond, recv) = oneshot::channel();
            spawn_reverse_response_forwarder(http.clone(), url.to_string(), server_request_id.clone(), recv);
            Some(ServerEvent::ReverseRequest { kind, proxy_request_id, server_request_id, params, respond })
        }
        _ => None,
    }
}

/// Awaits the gateway's answer to a reverse request and POSTs it back to
/// the upstream as the JSON-RPC response to the id it originally issued.
fn spawn_reverse_response_forwarder(
    http: reqwest::Client,
    url: String,
    server_request_id: Value,
    recv: oneshot::Receiver<GatewayResult<Value>>,
) {
    tokio::spawn(async move {
        let Ok(outcome) = recv.await else { return };
        let body = match outcome {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": server_request_id, "result": result }),
            Err(err) => json!({
                "jsonrpc": "2.0",
                "id": server_request_id,
                "error": { "code": -32603, "message": err.to_string() },
            }),
        };
        if let Err(err) = http.post(&url).json(&body).send().await {
            warn!(%err, "failed to forward reverse-request response upstream");
        }
    });
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn connect(&self) -> GatewayResult<(AdvertisedCapabilities, mpsc::Receiver<ServerEvent>)> {
        self.rpc_call(
            "initialize",
            json!({
                "protocolVersion": self.config.protocol_version,
                "clientInfo": { "name": self.config.client_name, "version": self.config.client_version },
                "capabilities": {},
            }),
        )
        .await?;

        let capabilities = self.list_capabilities().await;
        let (tx, rx) = mpsc::channel(64);
        self.spawn_sse_reader(tx);
        Ok((capabilities, rx))
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> GatewayResult<Value> {
        self.rpc_call("tools/call", json!({ "name": name, "arguments": arguments })).await
    }

    async fn read_resource(&self, uri: &str, meta: Value) -> GatewayResult<Value> {
        self.rpc_call("resources/read", json!({ "uri": uri, "_meta": meta })).await
    }

    async fn get_prompt(&self, name: &str, arguments: Value) -> GatewayResult<Value> {
        self.rpc_call("prompts/get", json!({ "name": name, "arguments": arguments })).await
    }

    async fn disconnect(&self) -> GatewayResult<()> {
        let Some(session_id) = self.session_id.read().clone() else {
            return Ok(());
        };
        let _ = self
            .http
            .delete(self.url())
            .header("mcp-session-id", session_id)
            .send()
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_base_and_path() {
        let client = HttpUpstreamClient::new(HttpUpstreamClientConfig {
            base_url: "http://localhost:9000".into(),
            ..Default::default()
        });
        assert_eq!(client.url(), "http://localhost:9000/mcp");
    }

    #[test]
    fn parses_list_changed_notification() {
        let http = reqwest::Client::new();
        let frame = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/tools/list_changed\"}";
        let event = parse_sse_frame(frame, &http, "http://localhost/mcp");
        assert!(matches!(event, Some(ServerEvent::ToolsListChanged)));
    }

    #[test]
    fn ignores_frames_without_a_method() {
        let http = reqwest::Client::new();
        let frame = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}";
        assert!(parse_sse_frame(frame, &http, "http://localhost/mcp").is_none());
    }
}
