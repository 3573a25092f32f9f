//! Client Session (§4.3): owns one client's transport, its SSE writer,
//! and its reverse-request table.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use gateway_types::{
    compare_permissions, new_uniform_request_id, now_millis, AuthContext, CloseReason,
    EffectiveCapabilityView, GatewayError, GatewayResult, SessionLifecycleState,
};
pub use gateway_types::CloseReason as ClosedReason;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::reverse::{outcome_to_result, PendingReverse, ReverseKind, ReverseOutcome, ReverseTimeouts};

/// Idle timeout before a session moves to `Closing` with `SessionTimeout`
/// (§4.3 "Idle timeout: 60 minutes since lastActive").
pub const IDLE_TIMEOUT_MILLIS: u64 = 60 * 60 * 1000;

/// One frame pushed onto a session's SSE stream (§4.3 "SSE framing").
#[derive(Debug, Clone)]
pub struct SseFrame {
    pub event_id: String,
    /// Serialized JSON-RPC message (request, response, or notification).
    pub data: String,
}

impl SseFrame {
    #[must_use]
    pub fn render(&self) -> String {
        format!("event: message\nid: {}\ndata: {}\n\n", self.event_id, self.data)
    }
}

/// A client's declared capability flags, read once at `initialize` time
/// and consulted by reverse-request dispatch (§4.3 step (i)).
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientCapabilities {
    pub roots: bool,
    pub sampling: bool,
    pub elicitation: bool,
}

impl ClientCapabilities {
    #[must_use]
    pub fn supports(self, kind: ReverseKind) -> bool {
        match kind {
            ReverseKind::Sampling => self.sampling,
            ReverseKind::Roots => self.roots,
            ReverseKind::Elicitation => self.elicitation,
        }
    }
}

pub struct ClientSession {
    pub session_id: String,
    pub user_id: String,
    state: RwLock<SessionLifecycleState>,
    auth_context: RwLock<AuthContext>,
    effective_view: RwLock<EffectiveCapabilityView>,
    client_capabilities: RwLock<ClientCapabilities>,
    last_active_millis: AtomicU64,
    sse_sender: RwLock<Option<mpsc::Sender<SseFrame>>>,
    pending_reverse: DashMap<String, PendingReverse>,
    timeouts: ReverseTimeouts,
}

impl ClientSession {
    #[must_use]
    pub fn new(session_id: String, auth_context: AuthContext) -> Arc<Self> {
        Self::with_timeouts(session_id, auth_context, ReverseTimeouts::default())
    }

    /// Same as [`Self::new`], but with reverse-request timeouts other than
    /// the §4.3 defaults (e.g. from `REVERSE_REQUEST_TIMEOUT_*` config).
    #[must_use]
    pub fn with_timeouts(session_id: String, auth_context: AuthContext, timeouts: ReverseTimeouts) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            user_id: auth_context.user_id.clone(),
            state: RwLock::new(SessionLifecycleState::Initializing),
            auth_context: RwLock::new(auth_context),
            effective_view: RwLock::new(EffectiveCapabilityView::default()),
            client_capabilities: RwLock::new(ClientCapabilities::default()),
            last_active_millis: AtomicU64::new(now_millis() as u64),
            sse_sender: RwLock::new(None),
            pending_reverse: DashMap::new(),
            timeouts,
        })
    }

    #[must_use]
    pub fn state(&self) -> SessionLifecycleState {
        *self.state.read()
    }

    #[must_use]
    pub fn auth_context(&self) -> AuthContext {
        self.auth_context.read().clone()
    }

    pub fn set_auth_context(&self, ctx: AuthContext) {
        *self.auth_context.write() = ctx;
    }

    pub fn set_client_capabilities(&self, caps: ClientCapabilities) {
        *self.client_capabilities.write() = caps;
    }

    pub fn touch(&self) {
        self.last_active_millis
            .store(now_millis() as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn last_active_millis(&self) -> u64 {
        self.last_active_millis.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_idle(&self, now: u64) -> bool {
        now.saturating_sub(self.last_active_millis()) > IDLE_TIMEOUT_MILLIS
    }

    /// On the first `POST /mcp` carrying a valid `initialize` (§4.3).
    pub fn activate(&self) {
        *self.state.write() = SessionLifecycleState::Active;
    }

    /// On `GET /mcp` with no `Last-Event-ID`: wires the SSE writer.
    pub fn attach_sse(&self, sender: mpsc::Sender<SseFrame>) {
        *self.sse_sender.write() = Some(sender);
    }

    /// On socket close/error: clears `sseConnected`.
    pub fn detach_sse(&self) {
        *self.sse_sender.write() = None;
    }

    #[must_use]
    pub fn sse_connected(&self) -> bool {
        self.sse_sender.read().is_some()
    }

    /// Pushes one frame to the live SSE stream. A blocked client read
    /// never blocks the caller: the channel is bounded and a full
    /// channel silently drops the frame (§5 "dropping is the default").
    pub fn push_frame(&self, frame: SseFrame) {
        let guard = self.sse_sender.read();
        if let Some(sender) = guard.as_ref() {
            if let Err(err) = sender.try_send(frame) {
                warn!(session_id = %self.session_id, error = %err, "dropping SSE frame, channel full or closed");
            }
        }
    }

    /// `DELETE /mcp` (§4.3): moves to `Closing`, drains reverse requests,
    /// then `Closed`. Idempotent — closing an already-closed session is a
    /// no-op, matching "the DELETE response must be 200 even if the
    /// session is already gone".
    pub fn close(&self, reason: CloseReason) {
        if self.state() == SessionLifecycleState::Closed {
            return;
        }
        *self.state.write() = SessionLifecycleState::Closing;
        self.cancel_all_reverse(reason);
        self.detach_sse();
        *self.state.write() = SessionLifecycleState::Closed;
        info!(session_id = %self.session_id, ?reason, "session closed");
    }

    fn cancel_all_reverse(&self, reason: CloseReason) {
        let keys: Vec<String> = self.pending_reverse.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, pending)) = self.pending_reverse.remove(&key) {
                let _ = pending.responder.send(ReverseOutcome::Error {
                    code: gateway_types::jsonrpc::error_codes::CONNECTION_CLOSED,
                    message: format!("session closing: {reason:?}"),
                });
            }
        }
    }

    /// Applies a capability delta (§4.3 "Permission updates on a live
    /// session") and returns the `*_list_changed` notifications to emit.
    pub fn apply_permission_update(&self, new_view: EffectiveCapabilityView) -> Vec<&'static str> {
        let old_view = std::mem::replace(&mut *self.effective_view.write(), new_view.clone());
        let delta = compare_permissions(&old_view, &new_view);
        let mut notifications = Vec::new();
        if delta.tools_changed {
            notifications.push("notifications/tools/list_changed");
        }
        if delta.resources_changed {
            notifications.push("notifications/resources/list_changed");
        }
        if delta.prompts_changed {
            notifications.push("notifications/prompts/list_changed");
        }
        notifications
    }

    #[must_use]
    pub fn effective_view(&self) -> EffectiveCapabilityView {
        self.effective_view.read().clone()
    }

    /// Reverse-request dispatch (§4.3 "Reverse-request dispatch").
    ///
    /// `send_frame` is how the caller actually frames and emits the
    /// outbound server-initiated JSON-RPC request (normally
    /// `self.push_frame`, injected here only to keep event-id allocation
    /// out of this module — callers pass a closure that wraps
    /// `push_frame` together with an `EventStore::store_event` call).
    pub async fn dispatch_reverse_request(
        &self,
        kind: ReverseKind,
        originating_server_request_id: Value,
        params: Value,
        send_frame: impl FnOnce(&str, &Value) -> GatewayResult<()>,
    ) -> GatewayResult<Value> {
        if !self.client_capabilities.read().supports(kind) {
            return Err(GatewayError::InvalidRequest(format!(
                "client did not advertise capability required for {:?}",
                kind
            )));
        }
        if !self.sse_connected() {
            return Err(GatewayError::ServerOffline(
                "no live SSE stream to deliver reverse request".into(),
            ));
        }

        let gateway_request_id = new_uniform_request_id(&self.session_id);
        let (responder, receiver) = oneshot::channel();
        self.pending_reverse.insert(
            gateway_request_id.clone(),
            PendingReverse {
                kind,
                originating_server_request_id,
                responder,
            },
        );

        let envelope = serde_json::json!({
            "jsonrpc": "2.0",
            "id": gateway_request_id,
            "method": kind.method(),
            "params": params,
        });

        if let Err(err) = send_frame(&gateway_request_id, &envelope) {
            self.pending_reverse.remove(&gateway_request_id);
            return Err(err);
        }

        let timeout = self.timeouts.for_kind(kind);
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(outcome)) => outcome_to_result(outcome),
            Ok(Err(_)) => {
                self.pending_reverse.remove(&gateway_request_id);
                Err(GatewayError::Internal("reverse request channel dropped".into()))
            }
            Err(_) => {
                self.pending_reverse.remove(&gateway_request_id);
                Err(GatewayError::ReverseRequestTimeout {
                    kind: format!("{kind:?}"),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Completes a pending reverse request when the client's response
    /// arrives over `POST /mcp` carrying the gateway-allocated id.
    pub fn resolve_reverse_response(&self, gateway_request_id: &str, outcome: ReverseOutcome) -> bool {
        match self.pending_reverse.remove(gateway_request_id) {
            Some((_, pending)) => pending.responder.send(outcome).is_ok(),
            None => false,
        }
    }

    #[must_use]
    pub fn pending_reverse_count(&self) -> usize {
        self.pending_reverse.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_types::schema::{LaunchConfigsBlob, PermissionsBlob, PreferencesBlob};
    use gateway_types::{Role, UserStatus};

    fn auth_context() -> AuthContext {
        AuthContext {
            user_id: "u1".into(),
            token_mask: "abcd1234…abcd1234".into(),
            role: Role::User,
            status: UserStatus::Enabled,
            permissions: PermissionsBlob::default(),
            preferences: PreferencesBlob::default(),
            launch_configs: LaunchConfigsBlob::default(),
            authenticated_at_millis: now_millis(),
            expires_at: 0,
            rate_limit: 60,
        }
    }

    #[test]
    fn activate_transitions_to_active() {
        let session = ClientSession::new("s1".into(), auth_context());
        assert_eq!(session.state(), SessionLifecycleState::Initializing);
        session.activate();
        assert_eq!(session.state(), SessionLifecycleState::Active);
    }

    #[test]
    fn close_is_idempotent() {
        let session = ClientSession::new("s1".into(), auth_context());
        session.activate();
        session.close(CloseReason::ClientRequested);
        assert_eq!(session.state(), SessionLifecycleState::Closed);
        session.close(CloseReason::ClientRequested);
        assert_eq!(session.state(), SessionLifecycleState::Closed);
    }

    #[tokio::test]
    async fn dispatch_reverse_request_without_sse_fails_fast() {
        let session = ClientSession::new("s1".into(), auth_context());
        session.set_client_capabilities(ClientCapabilities {
            roots: false,
            sampling: true,
            elicitation: false,
        });
        let result = session
            .dispatch_reverse_request(
                ReverseKind::Sampling,
                Value::Null,
                serde_json::json!({}),
                |_, _| Ok(()),
            )
            .await;
        assert!(matches!(result, Err(GatewayError::ServerOffline(_))));
    }

    #[tokio::test]
    async fn dispatch_reverse_request_without_capability_is_rejected() {
        let session = ClientSession::new("s1".into(), auth_context());
        let (tx, _rx) = mpsc::channel(8);
        session.attach_sse(tx);
        let result = session
            .dispatch_reverse_request(
                ReverseKind::Roots,
                Value::Null,
                serde_json::json!({}),
                |_, _| Ok(()),
            )
            .await;
        assert!(matches!(result, Err(GatewayError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn dispatch_reverse_request_resolves_on_client_response() {
        let session = ClientSession::new("s1".into(), auth_context());
        session.set_client_capabilities(ClientCapabilities {
            roots: true,
            sampling: false,
            elicitation: false,
        });
        let (tx, mut rx) = mpsc::channel(8);
        session.attach_sse(tx);

        let session_clone = session.clone();
        let responder = tokio::spawn(async move {
            let frame = rx.recv().await.expect("frame sent");
            assert!(frame.data.contains("roots/list"));
            let envelope: Value = serde_json::from_str(&frame.data).unwrap();
            let id = envelope["id"].as_str().unwrap().to_string();
            session_clone.resolve_reverse_response(
                &id,
                ReverseOutcome::Result(serde_json::json!({"roots": []})),
            );
        });

        let result = session
            .dispatch_reverse_request(
                ReverseKind::Roots,
                Value::Null,
                serde_json::json!({}),
                |id, envelope| {
                    session.push_frame(SseFrame {
                        event_id: format!("evt_{id}"),
                        data: envelope.to_string(),
                    });
                    Ok(())
                },
            )
            .await;

        responder.await.unwrap();
        assert_eq!(result.unwrap(), serde_json::json!({"roots": []}));
    }
}
