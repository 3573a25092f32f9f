//! Forward path (§4.6): client-to-server dispatch with capability
//! checking, proxy-context stamping, sleeping-server wake, and
//! per-request audit logging.

use std::sync::Arc;
use std::time::Instant;

use gateway_session::ClientSession;
use gateway_store::event_store::EventStore;
use gateway_store::log_queue::LogQueue;
use gateway_types::{
    new_proxy_request_id, new_uniform_request_id, AuthContext, GatewayError, GatewayResult,
    LogAction, LogEntry, MetricsSink, NoopMetricsSink,
};
use gateway_upstream::ServerManager;
use serde_json::Value;
use tracing::info_span;

/// The length an already-successful response is truncated to before it is
/// written to the audit log (§6 `LOG_RESPONSE_MAX_LENGTH`, default 300).
/// Errors are always logged in full.
pub const DEFAULT_LOG_RESPONSE_MAX_LENGTH: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Tool,
    Resource,
    Prompt,
}

impl RequestKind {
    fn request_action(self) -> LogAction {
        match self {
            RequestKind::Tool => LogAction::RequestTool,
            RequestKind::Resource => LogAction::RequestResource,
            RequestKind::Prompt => LogAction::RequestPrompt,
        }
    }

    fn response_action(self) -> LogAction {
        match self {
            RequestKind::Tool => LogAction::ResponseTool,
            RequestKind::Resource => LogAction::ResponseResource,
            RequestKind::Prompt => LogAction::ResponsePrompt,
        }
    }

    fn label(self) -> &'static str {
        match self {
            RequestKind::Tool => "tool",
            RequestKind::Resource => "resource",
            RequestKind::Prompt => "prompt",
        }
    }
}

pub struct RequestRouter {
    pub(crate) sessions: Arc<gateway_session::SessionStore>,
    pub(crate) servers: Arc<ServerManager>,
    pub(crate) events: Arc<EventStore>,
    pub(crate) logs: Option<LogQueue>,
    response_max_length: usize,
    metrics: Arc<dyn MetricsSink>,
}

impl RequestRouter {
    #[must_use]
    pub fn new(
        sessions: Arc<gateway_session::SessionStore>,
        servers: Arc<ServerManager>,
        events: Arc<EventStore>,
        logs: Option<LogQueue>,
    ) -> Self {
        Self {
            sessions,
            servers,
            events,
            logs,
            response_max_length: DEFAULT_LOG_RESPONSE_MAX_LENGTH,
            metrics: Arc::new(NoopMetricsSink),
        }
    }

    #[must_use]
    pub fn with_response_max_length(mut self, max_length: usize) -> Self {
        self.response_max_length = max_length;
        self
    }

    /// Routes forward-call outcomes through `sink` (§2 "Metrics hook")
    /// instead of the no-op default.
    #[must_use]
    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = sink;
        self
    }

    /// Checks that `target` (a tool/resource/prompt name or uri) is
    /// present and enabled in the session's effective view of
    /// `server_id` (§4.6 step 1).
    fn check_capability(
        &self,
        session: &ClientSession,
        server_id: &str,
        kind: RequestKind,
        target: &str,
    ) -> GatewayResult<()> {
        let view = session.effective_view();
        let Some(server_view) = view.0.get(server_id) else {
            return Err(GatewayError::ServerNotFound(server_id.to_string()));
        };
        let items = match kind {
            RequestKind::Tool => &server_view.tools,
            RequestKind::Resource => &server_view.resources,
            RequestKind::Prompt => &server_view.prompts,
        };
        match items.get(target) {
            Some(item) if item.enabled => Ok(()),
            _ => Err(GatewayError::InvalidRequest(format!(
                "{} '{target}' is not available on server '{server_id}'",
                kind.label()
            ))),
        }
    }

    /// Stamps `_meta.proxyContext` onto `arguments` (§6 "Proxy context
    /// `_meta`"): `{proxyRequestId: "<sessionId>:<originalRequestId>:<nowMs>",
    /// uniformRequestId}`. Non-object `arguments` become an empty object
    /// first so the meta always has somewhere to live.
    fn stamp_proxy_context(
        session_id: &str,
        original_request_id: &Value,
        uniform_request_id: &str,
        arguments: Value,
    ) -> (Value, String) {
        let original_id_str = match original_request_id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let proxy_request_id = new_proxy_request_id(session_id, &original_id_str);
        let meta = serde_json::json!({
            "proxyRequestId": proxy_request_id,
            "uniformRequestId": uniform_request_id,
        });

        let mut arguments = if arguments.is_object() { arguments } else { Value::Object(serde_json::Map::new()) };
        arguments
            .as_object_mut()
            .expect("normalized to an object above")
            .insert("_meta".to_string(), meta);
        (arguments, proxy_request_id)
    }

    /// Dispatches one client request to `server_id` (§4.6 steps 1-6).
    #[allow(clippy::too_many_arguments)]
    pub async fn dispatch(
        &self,
        session: &Arc<ClientSession>,
        server_id: &str,
        kind: RequestKind,
        target: &str,
        arguments: Value,
        original_request_id: Value,
        client_ip: &str,
    ) -> GatewayResult<Value> {
        self.check_capability(session, server_id, kind, target)?;

        let uniform_request_id = new_uniform_request_id(&session.session_id);
        let (stamped, proxy_request_id) =
            Self::stamp_proxy_context(&session.session_id, &original_request_id, &uniform_request_id, arguments);

        let context = self
            .servers
            .resolve_context(server_id, &session.user_id)
            .ok_or_else(|| GatewayError::ServerNotFound(server_id.to_string()))?;

        let auth_context = session.auth_context();
        let span = info_span!(
            "forward_request",
            kind = kind.label(),
            server_id,
            session_id = %session.session_id,
            uniform_request_id = %uniform_request_id,
            proxy_request_id = %proxy_request_id,
        );
        let _enter = span.enter();

        self.log_request(kind, server_id, session, &uniform_request_id, &auth_context, &stamped, client_ip);

        let started = Instant::now();
        let result = match kind {
            RequestKind::Tool => context.dispatch_call_tool(target, stamped.clone()).await,
            RequestKind::Resource => context.dispatch_read_resource(target, stamped["_meta"].clone()).await,
            RequestKind::Prompt => context.dispatch_get_prompt(target, stamped.clone()).await,
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        self.metrics.record_forward(result.is_ok(), started.elapsed().as_micros() as u64);
        self.log_response(kind, server_id, session, &uniform_request_id, &auth_context, &result, duration_ms);
        result
    }

    fn log_request(
        &self,
        kind: RequestKind,
        server_id: &str,
        session: &ClientSession,
        uniform_request_id: &str,
        auth_context: &AuthContext,
        params: &Value,
        client_ip: &str,
    ) {
        let Some(logs) = &self.logs else { return };
        logs.enqueue(LogEntry {
            action: kind.request_action(),
            user_id: Some(auth_context.user_id.clone()),
            server_id: Some(server_id.to_string()),
            session_id: Some(session.session_id.clone()),
            upstream_request_id: None,
            uniform_request_id: uniform_request_id.to_string(),
            parent_uniform_request_id: None,
            ip: client_ip.to_string(),
            user_agent: None,
            token_mask: auth_context.token_mask.clone(),
            request_params: serde_json::to_string(params).ok(),
            response_result: None,
            error: None,
            duration_ms: 0,
            status_code: 0,
        });
    }

    fn log_response(
        &self,
        kind: RequestKind,
        server_id: &str,
        session: &ClientSession,
        uniform_request_id: &str,
        auth_context: &AuthContext,
        result: &GatewayResult<Value>,
        duration_ms: u64,
    ) {
        let Some(logs) = &self.logs else { return };
        let (response_result, error, status_code) = match result {
            Ok(value) => {
                let rendered = serde_json::to_string(value).unwrap_or_default();
                let truncated = truncate_chars(&rendered, self.response_max_length);
                (Some(truncated), None, 200)
            }
            Err(err) => (None, Some(err.to_string()), err.http_status()),
        };
        logs.enqueue(LogEntry {
            action: kind.response_action(),
            user_id: Some(auth_context.user_id.clone()),
            server_id: Some(server_id.to_string()),
            session_id: Some(session.session_id.clone()),
            upstream_request_id: None,
            uniform_request_id: uniform_request_id.to_string(),
            parent_uniform_request_id: None,
            ip: String::new(),
            user_agent: None,
            token_mask: auth_context.token_mask.clone(),
            request_params: None,
            response_result,
            error,
            duration_ms,
            status_code,
        });
    }
}

/// Truncates to at most `max_length` `char`s, respecting UTF-8 boundaries
/// (§6 "response truncation").
fn truncate_chars(s: &str, max_length: usize) -> String {
    if s.chars().count() <= max_length {
        s.to_string()
    } else {
        s.chars().take(max_length).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_types::{AuthContext, EffectiveCapabilityView, EffectiveItem, EffectiveServerView, Role, UserStatus};
    use gateway_types::schema::{LaunchConfigsBlob, PermissionsBlob, PreferencesBlob};
    use std::collections::BTreeMap;

    fn auth_context(user_id: &str) -> AuthContext {
        AuthContext {
            user_id: user_id.to_string(),
            token_mask: "abcd1234…abcd1234".into(),
            role: Role::User,
            status: UserStatus::Enabled,
            permissions: PermissionsBlob::default(),
            preferences: PreferencesBlob::default(),
            launch_configs: LaunchConfigsBlob::default(),
            authenticated_at_millis: gateway_types::now_millis(),
            expires_at: 0,
            rate_limit: 60,
        }
    }

    fn session_with_tool(server_id: &str, tool: &str, enabled: bool) -> Arc<ClientSession> {
        let session = ClientSession::new("sess1".into(), auth_context("u1"));
        let mut tools = BTreeMap::new();
        tools.insert(tool.to_string(), EffectiveItem { enabled, description: None, danger_level: None });
        let mut view = EffectiveCapabilityView::default();
        view.0.insert(
            server_id.to_string(),
            EffectiveServerView {
                enabled: true,
                server_name: "Test".into(),
                allow_user_input: false,
                auth_type: gateway_types::AuthType::ApiKey,
                config_template: BTreeMap::new(),
                configured: true,
                tools,
                resources: BTreeMap::new(),
                prompts: BTreeMap::new(),
            },
        );
        session.apply_permission_update(view);
        session
    }

    #[test]
    fn stamp_proxy_context_inserts_meta_on_plain_object() {
        let (stamped, proxy_request_id) = RequestRouter::stamp_proxy_context(
            "sess1",
            &Value::from(7),
            "sess1_1000_abcd",
            serde_json::json!({"x": 1}),
        );
        assert_eq!(stamped["x"], 1);
        assert_eq!(stamped["_meta"]["uniformRequestId"], "sess1_1000_abcd");
        assert!(proxy_request_id.starts_with("sess1:7:"));
    }

    #[test]
    fn stamp_proxy_context_normalizes_non_object_arguments() {
        let (stamped, _) = RequestRouter::stamp_proxy_context("sess1", &Value::Null, "uid", Value::Null);
        assert!(stamped.is_object());
        assert!(stamped["_meta"].is_object());
    }

    #[test]
    fn truncate_chars_respects_utf8_boundaries() {
        let s = "こんにちは世界";
        let truncated = truncate_chars(s, 3);
        assert_eq!(truncated.chars().count(), 3);
    }

    fn router() -> RequestRouter {
        RequestRouter::new(
            Arc::new(gateway_session::SessionStore::new()),
            Arc::new(ServerManager::new(
                Arc::new(NoopFactory),
                None,
            )),
            Arc::new(EventStore::new(
                Arc::new(gateway_store::InMemoryDurableEventStore::new()),
                Default::default(),
            )),
            None,
        )
    }

    struct NoopFactory;

    #[async_trait::async_trait]
    impl gateway_upstream::UpstreamClientFactory for NoopFactory {
        async fn build(&self, _server: &gateway_types::Server) -> GatewayResult<Arc<dyn gateway_upstream::UpstreamClient>> {
            Err(GatewayError::Internal("unused in this test".into()))
        }
    }

    #[tokio::test]
    async fn dispatch_rejects_disabled_capability() {
        let session = session_with_tool("s1", "read_file", false);
        let result = router()
            .dispatch(&session, "s1", RequestKind::Tool, "read_file", Value::Null, Value::from(1), "127.0.0.1")
            .await;
        assert!(matches!(result, Err(GatewayError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn dispatch_rejects_unknown_server() {
        let session = session_with_tool("s1", "read_file", true);
        let result = router()
            .dispatch(&session, "does-not-exist", RequestKind::Tool, "read_file", Value::Null, Value::from(1), "127.0.0.1")
            .await;
        assert!(matches!(result, Err(GatewayError::ServerNotFound(_))));
    }
}
