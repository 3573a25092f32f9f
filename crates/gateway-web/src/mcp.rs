//! `POST/GET/DELETE /mcp` (§4.3, §6): the MCP wire surface — the
//! `initialize` handshake, forward request dispatch, reverse-response
//! resolution, SSE streaming with replay, and session termination.

use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::Stream;
use gateway_session::{ClientCapabilities, ClientSession, ReverseOutcome, SseFrame};
use gateway_types::{new_session_id, CloseReason, GatewayError, JsonRpcMessage};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::admission::admit;
use crate::error::{apply_rate_limit_headers, ApiError};
use crate::state::AppState;

const SESSION_HEADER: &str = "mcp-session-id";
const LAST_EVENT_ID_HEADER: &str = "last-event-id";
const SSE_CHANNEL_CAPACITY: usize = 256;

fn api_error(state: &AppState, err: GatewayError, request_id: Value) -> ApiError {
    ApiError::new(err, state.base_url.clone()).with_request_id(request_id)
}

fn client_capabilities_from_params(params: &Value) -> ClientCapabilities {
    let caps = params.get("capabilities").cloned().unwrap_or(Value::Null);
    ClientCapabilities {
        roots: caps.get("roots").is_some(),
        sampling: caps.get("sampling").is_some(),
        elicitation: caps.get("elicitation").is_some(),
    }
}

/// Handles one parsed JSON-RPC call against an already-established
/// session (§4.6): tool/resource/prompt dispatch, or local resource
/// subscription bookkeeping.
async fn handle_established_request(
    state: &AppState,
    session: &Arc<ClientSession>,
    client_ip: &str,
    message: JsonRpcMessage,
) -> Result<Value, GatewayError> {
    let id = message.id.clone().unwrap_or(Value::Null);
    let method = message.method.clone().unwrap_or_default();
    let params = message.params.unwrap_or(Value::Null);

    match method.as_str() {
        "tools/call" => {
            let server_id = params["serverId"].as_str().unwrap_or_default();
            let name = params["name"].as_str().unwrap_or_default();
            let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
            state
                .router
                .dispatch(
                    session,
                    server_id,
                    gateway_router::RequestKind::Tool,
                    name,
                    arguments,
                    id,
                    client_ip,
                )
                .await
        }
        "resources/read" => {
            let server_id = params["serverId"].as_str().unwrap_or_default();
            let uri = params["uri"].as_str().unwrap_or_default();
            state
                .router
                .dispatch(
                    session,
                    server_id,
                    gateway_router::RequestKind::Resource,
                    uri,
                    Value::Null,
                    id,
                    client_ip,
                )
                .await
        }
        "prompts/get" => {
            let server_id = params["serverId"].as_str().unwrap_or_default();
            let name = params["name"].as_str().unwrap_or_default();
            let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
            state
                .router
                .dispatch(
                    session,
                    server_id,
                    gateway_router::RequestKind::Prompt,
                    name,
                    arguments,
                    id,
                    client_ip,
                )
                .await
        }
        "resources/subscribe" => {
            let server_id = params["serverId"].as_str().unwrap_or_default();
            let uri = params["uri"].as_str().unwrap_or_default();
            state.servers.subscribe_resource(server_id, uri, &session.session_id);
            Ok(Value::Object(serde_json::Map::new()))
        }
        "resources/unsubscribe" => {
            let server_id = params["serverId"].as_str().unwrap_or_default();
            let uri = params["uri"].as_str().unwrap_or_default();
            state.servers.unsubscribe_resource(server_id, uri, &session.session_id);
            Ok(Value::Object(serde_json::Map::new()))
        }
        other => Err(GatewayError::InvalidRequest(format!("unsupported method: {other}"))),
    }
}

/// Resolves a reverse request (§4.3) whose client response just arrived
/// over `POST /mcp` carrying the gateway-allocated id as `id`.
fn resolve_reverse(state: &AppState, message: &JsonRpcMessage) -> bool {
    let Some(Value::String(gateway_request_id)) = &message.id else {
        return false;
    };
    let outcome = match (&message.result, &message.error) {
        (Some(result), _) => ReverseOutcome::Result(result.clone()),
        (None, Some(error)) => ReverseOutcome::Error {
            code: error.code,
            message: error.message.clone(),
        },
        (None, None) => return false,
    };
    gateway_router::resolve_reverse_response(&state.sessions, gateway_request_id, outcome)
}

async fn handle_initialize(
    state: &AppState,
    auth: gateway_types::AuthContext,
    message: &JsonRpcMessage,
) -> (Arc<ClientSession>, Value) {
    let params = message.params.clone().unwrap_or(Value::Null);
    let session_id = new_session_id();
    let servers = state.servers.list_servers();
    let view = gateway_upstream::compute_effective_view(&servers, &auth.permissions, &auth.preferences, |server_id| {
        auth.launch_configs.0.contains_key(server_id)
    });

    let session = state.sessions.create_with_timeouts(
        session_id.clone(),
        auth,
        state.reverse_timeouts.into(),
    );
    session.apply_permission_update(view);
    session.set_client_capabilities(client_capabilities_from_params(&params));
    session.activate();

    let protocol_version = params
        .get("protocolVersion")
        .and_then(Value::as_str)
        .unwrap_or("2025-06-18")
        .to_string();

    let result = serde_json::json!({
        "protocolVersion": protocol_version,
        "serverInfo": { "name": "mcp-gateway", "version": env!("CARGO_PKG_VERSION") },
        "capabilities": {
            "tools": { "listChanged": true },
            "resources": { "listChanged": true, "subscribe": true },
            "prompts": { "listChanged": true },
        },
    });
    (session, result)
}

/// `POST /mcp` (§6): the `initialize` handshake on a fresh connection, or
/// a forward/reverse-response call on an established one.
pub async fn mcp_post(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let client_ip: IpAddr = addr.ip();
    let admitted = match admit(&state, client_ip, &headers).await {
        Ok(admitted) => admitted,
        Err(err) => return api_error(&state, err, Value::Null).into_response(),
    };

    let message: JsonRpcMessage = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(err) => {
            return api_error(&state, GatewayError::MalformedJsonRpc(err.to_string()), Value::Null).into_response();
        }
    };

    let mut response_headers = HeaderMap::new();
    apply_rate_limit_headers(&mut response_headers, admitted.auth.rate_limit, &admitted.rate_limit);

    let session_header = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok());

    let body_response = match session_header {
        None => {
            if message.method.as_deref() != Some("initialize") {
                return api_error(&state, GatewayError::MissingSessionId, message.id.clone().unwrap_or(Value::Null))
                    .into_response();
            }
            let request_id = message.id.clone().unwrap_or(Value::Null);
            let (session, result) = handle_initialize(&state, admitted.auth, &message).await;
            if let Ok(value) = HeaderValue::from_str(&session.session_id) {
                response_headers.insert(SESSION_HEADER, value);
            }
            Json(JsonRpcMessage::response(request_id, result)).into_response()
        }
        Some(session_id) => {
            let Some(session) = state.sessions.get(session_id) else {
                return api_error(&state, GatewayError::UnknownSession, message.id.clone().unwrap_or(Value::Null))
                    .into_response();
            };
            session.touch();
            session.set_auth_context(admitted.auth);

            if message.is_response() {
                resolve_reverse(&state, &message);
                return (StatusCode::ACCEPTED, response_headers, Json(serde_json::json!({"acknowledged": true})))
                    .into_response();
            }

            let request_id = message.id.clone().unwrap_or(Value::Null);
            let client_ip_str = client_ip.to_string();
            match handle_established_request(&state, &session, &client_ip_str, message).await {
                Ok(result) => Json(JsonRpcMessage::response(request_id, result)).into_response(),
                Err(err) => api_error(&state, err, request_id).into_response(),
            }
        }
    };

    let (mut parts, body) = body_response.into_parts();
    parts.headers.extend(response_headers);
    Response::from_parts(parts, body)
}

/// Streams replayed-then-live SSE frames, detaching the session's writer
/// and clearing its resource subscriptions when the client disconnects.
struct SseSessionStream {
    inner: ReceiverStream<SseFrame>,
    session: Arc<ClientSession>,
    servers: Arc<gateway_upstream::ServerManager>,
}

impl Stream for SseSessionStream {
    type Item = Result<SseEvent, std::convert::Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(frame)) => Poll::Ready(Some(Ok(SseEvent::default().id(frame.event_id).data(frame.data)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for SseSessionStream {
    fn drop(&mut self) {
        self.session.detach_sse();
        self.servers.unsubscribe_session(&self.session.session_id);
    }
}

/// `GET /mcp` (§4.3, §6): opens or resumes the session's SSE stream.
pub async fn mcp_get(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(session_id) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) else {
        return api_error(&state, GatewayError::MissingSessionId, Value::Null).into_response();
    };
    let Some(session) = state.sessions.get(session_id) else {
        return api_error(&state, GatewayError::UnknownSession, Value::Null).into_response();
    };
    session.touch();

    let (tx, rx) = mpsc::channel(SSE_CHANNEL_CAPACITY);

    if let Some(last_event_id) = headers.get(LAST_EVENT_ID_HEADER).and_then(|v| v.to_str().ok()) {
        state
            .events
            .replay_after(Some(last_event_id), |event| {
                let _ = tx.try_send(SseFrame {
                    event_id: event.event_id.clone(),
                    data: event.message_data.clone(),
                });
            })
            .await;
    }

    session.attach_sse(tx);

    let stream = SseSessionStream {
        inner: ReceiverStream::new(rx),
        session,
        servers: state.servers.clone(),
    };
    Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15))).into_response()
}

/// `DELETE /mcp` (§4.3, §8 invariant 7): always 200, even for an unknown
/// or already-closed session.
pub async fn mcp_delete(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    if let Some(session_id) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
        if let Some(session) = state.sessions.get(session_id) {
            session.close(CloseReason::ClientRequested);
            state.sessions.remove(session_id);
            state.servers.unsubscribe_session(session_id);
            state.events.release_stream_cache(session_id);
        }
    }
    Json(serde_json::json!({
        "jsonrpc": "2.0",
        "result": { "message": "Session terminated or not found" },
        "id": Value::Null,
    }))
}
