//! Control-plane WebSocket (§4.7, §6): a realtime channel, separate from
//! SSE, that pushes `permissions_changed`/`online_sessions` events to a
//! user's connected devices and answers `get_capabilities`/
//! `set_capabilities`/`configure_server`/`unconfigure_server` requests
//! from them.

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use gateway_session::{ControlPlaneMessage, ControlPlaneSocket};
use gateway_types::AuthContext;
use secrecy::SecretString;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use crate::admission::admit;
use crate::error::ApiError;
use crate::state::AppState;

/// `GET /control-plane` (§6): upgrades to a device socket once the same
/// IP/token/rate-limit chain `/mcp` uses has admitted the caller.
pub async fn control_plane_upgrade(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let admitted = match admit(&state, addr.ip(), &headers).await {
        Ok(admitted) => admitted,
        Err(err) => return ApiError::new(err, state.base_url.clone()).into_response(),
    };
    ws.on_upgrade(move |socket| run_socket(socket, state, admitted.auth))
}

async fn run_socket(socket: WebSocket, state: AppState, auth: AuthContext) {
    let (handle, mut outbound) = state.control_plane.register(auth.user_id.clone());
    let online: Vec<String> = state
        .sessions
        .get_user_sessions(&auth.user_id)
        .iter()
        .map(|s| s.session_id.clone())
        .collect();
    handle.send(ControlPlaneMessage::OnlineSessions { session_ids: online });

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            outbound_message = outbound.recv() => {
                let Some(message) = outbound_message else { break };
                let Ok(text) = serde_json::to_string(&message) else { continue };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            inbound_message = stream.next() => {
                match inbound_message {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound(&state, &handle, &auth, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(user_id = %auth.user_id, %err, "control-plane socket read error");
                        break;
                    }
                }
            }
        }
    }

    state.control_plane.unregister(&handle);
}

async fn handle_inbound(state: &AppState, handle: &Arc<ControlPlaneSocket>, auth: &AuthContext, text: &str) {
    let Ok(message) = serde_json::from_str::<ControlPlaneMessage>(text) else {
        warn!(user_id = %auth.user_id, "discarding malformed control-plane message");
        return;
    };
    match message {
        ControlPlaneMessage::Request { request_id, operation, payload } => {
            let result = dispatch_operation(state, auth, &operation, payload).await;
            handle.send(ControlPlaneMessage::Response { request_id, payload: result });
        }
        ControlPlaneMessage::Response { request_id, payload } => {
            state.control_plane.resolve_response(&request_id, payload);
        }
        ControlPlaneMessage::PermissionsChanged { .. } | ControlPlaneMessage::OnlineSessions { .. } => {
            // Server-originated shapes; a device never legitimately sends these.
        }
    }
}

/// Computes the user's effective view from the live server pool. Changes
/// to the underlying permissions/preferences blobs are a user-repository
/// concern; this crate only recomputes and serves the derived view.
fn capabilities_view(state: &AppState, auth: &AuthContext) -> Value {
    let servers = state.servers.list_servers();
    let view = gateway_upstream::compute_effective_view(&servers, &auth.permissions, &auth.preferences, |server_id| {
        auth.launch_configs.0.contains_key(server_id)
    });
    serde_json::to_value(view).unwrap_or(Value::Null)
}

async fn dispatch_operation(state: &AppState, auth: &AuthContext, operation: &str, payload: Value) -> Value {
    match operation {
        "get_capabilities" => capabilities_view(state, auth),
        "set_capabilities" => {
            // Persisting the edited permissions/preferences blob belongs to
            // the user repository behind the token validator; here we only
            // re-propagate the resulting view to the caller's own sessions
            // and notify their other devices.
            for session in state.sessions.get_user_sessions(&auth.user_id) {
                let view = gateway_upstream::compute_effective_view(
                    &state.servers.list_servers(),
                    &auth.permissions,
                    &auth.preferences,
                    |server_id| auth.launch_configs.0.contains_key(server_id),
                );
                session.apply_permission_update(view);
            }
            state
                .control_plane
                .send_to_user(&auth.user_id, ControlPlaneMessage::PermissionsChanged { user_id: auth.user_id.clone() });
            capabilities_view(state, auth)
        }
        "configure_server" => configure_server(state, auth, payload).await,
        "unconfigure_server" => {
            let Some(server_id) = payload.get("serverId").and_then(Value::as_str) else {
                return serde_json::json!({"error": "missing serverId"});
            };
            state.servers.close_temporary_server(server_id, &auth.user_id).await;
            serde_json::json!({"ok": true})
        }
        other => serde_json::json!({"error": format!("unsupported operation: {other}")}),
    }
}

async fn configure_server(state: &AppState, auth: &AuthContext, payload: Value) -> Value {
    let Some(server_id) = payload.get("serverId").and_then(Value::as_str) else {
        return serde_json::json!({"error": "missing serverId"});
    };
    let Some(token) = payload.get("token").and_then(Value::as_str) else {
        return serde_json::json!({"error": "missing token"});
    };
    let Some(server) = state.servers.server(server_id) else {
        return serde_json::json!({"error": format!("unknown server: {server_id}")});
    };
    match state
        .servers
        .create_temporary_server(&auth.user_id, &server, SecretString::from(token.to_string()))
        .await
    {
        Ok(_) => serde_json::json!({"ok": true}),
        Err(err) => serde_json::json!({"error": err.to_string()}),
    }
}
