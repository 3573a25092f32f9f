//! Broadcast path (§4.6): server-originated `list_changed` notifications
//! fanned out to every session whose user has access to the originating
//! server, and resource-update notifications delivered only to sessions
//! with an active subscription.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use gateway_session::SessionStore;
use gateway_store::event_store::EventStore;
use gateway_types::{new_event_id, JsonRpcMessage, MetricsSink, NoopMetricsSink};
use gateway_upstream::ServerManager;
use serde_json::Value;
use tracing::debug;

/// Bounded per-session dedup set: at most this many recently-sent
/// broadcast keys are remembered per session (§4.6 "keep last 100 keys").
const DEDUP_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListChangedKind {
    Tools,
    Resources,
    Prompts,
}

impl ListChangedKind {
    #[must_use]
    pub fn method(self) -> &'static str {
        match self {
            Self::Tools => "notifications/tools/list_changed",
            Self::Resources => "notifications/resources/list_changed",
            Self::Prompts => "notifications/prompts/list_changed",
        }
    }
}

/// Bounded, per-session FIFO of recently-delivered broadcast keys, used
/// to avoid re-sending the same `list_changed` to a session twice for
/// one underlying server event.
#[derive(Default)]
struct DedupSets {
    sets: DashMap<String, VecDeque<String>>,
}

impl DedupSets {
    fn seen_or_record(&self, session_id: &str, key: &str) -> bool {
        let mut entry = self.sets.entry(session_id.to_string()).or_default();
        if entry.contains(&key.to_string()) {
            return true;
        }
        entry.push_back(key.to_string());
        if entry.len() > DEDUP_CAPACITY {
            entry.pop_front();
        }
        false
    }
}

pub struct BroadcastRouter {
    sessions: Arc<SessionStore>,
    servers: Arc<ServerManager>,
    events: Arc<EventStore>,
    dedup: DedupSets,
    metrics: Arc<dyn MetricsSink>,
}

impl BroadcastRouter {
    #[must_use]
    pub fn new(sessions: Arc<SessionStore>, servers: Arc<ServerManager>, events: Arc<EventStore>) -> Self {
        Self {
            sessions,
            servers,
            events,
            dedup: DedupSets::default(),
            metrics: Arc::new(NoopMetricsSink),
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = sink;
        self
    }

    fn deliver(&self, session: &gateway_session::ClientSession, message: &JsonRpcMessage) {
        let data = serde_json::to_string(message).unwrap_or_default();
        let event_id = new_event_id(&session.session_id);
        session.push_frame(gateway_session::SseFrame {
            event_id,
            data,
        });
    }

    /// `toolListChanged`/`resourcesListChanged`/`promptsListChanged` for
    /// server `server_id` (§4.6 "Broadcast path"): sent to every session
    /// whose user currently has `server_id` in their effective view,
    /// de-duplicated per session.
    pub async fn broadcast_list_changed(&self, server_id: &str, kind: ListChangedKind) {
        let dedup_key = format!("{server_id}:{}", kind.method());
        let message = JsonRpcMessage::notification(kind.method(), serde_json::json!({ "serverId": server_id }));

        let mut delivered = 0usize;
        for session in self.sessions.all_sessions() {
            if !session.effective_view().0.contains_key(server_id) {
                continue;
            }
            if self.dedup.seen_or_record(&session.session_id, &dedup_key) {
                continue;
            }
            self.deliver(&session, &message);
            self.events
                .store_event(&session.session_id, kind.method(), &serde_json::to_string(&message).unwrap_or_default())
                .await;
            self.metrics.record_broadcast();
            delivered += 1;
        }
        debug!(server_id, method = kind.method(), delivered, "broadcast list_changed");
    }

    /// `resourceUpdated` for `<server_id, uri>` (§4.6 step 4, §3 invariant
    /// 4): delivered only to sessions in
    /// `getResourceSubscribers("<serverId>::<uri>")`.
    pub async fn broadcast_resource_updated(&self, server_id: &str, uri: &str, payload: Value) {
        let message = JsonRpcMessage::notification(
            "notifications/resources/updated",
            serde_json::json!({ "serverId": server_id, "uri": uri, "data": payload }),
        );
        let rendered = serde_json::to_string(&message).unwrap_or_default();

        for session_id in self.servers.get_resource_subscribers(server_id, uri) {
            let Some(session) = self.sessions.get(&session_id) else {
                continue;
            };
            self.deliver(&session, &message);
            self.events
                .store_event(&session_id, "notifications/resources/updated", &rendered)
                .await;
            self.metrics.record_broadcast();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_types::{AuthContext, EffectiveCapabilityView, EffectiveServerView, Role, UserStatus};
    use gateway_types::schema::{LaunchConfigsBlob, PermissionsBlob, PreferencesBlob};
    use std::collections::BTreeMap;
    use tokio::sync::mpsc;

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

    fn view_with_server(server_id: &str) -> EffectiveCapabilityView {
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
                tools: BTreeMap::new(),
                resources: BTreeMap::new(),
                prompts: BTreeMap::new(),
            },
        );
        view
    }

    struct NoopFactory;
    #[async_trait::async_trait]
    impl gateway_upstream::UpstreamClientFactory for NoopFactory {
        async fn build(&self, _server: &gateway_types::Server) -> gateway_types::GatewayResult<Arc<dyn gateway_upstream::UpstreamClient>> {
            Err(gateway_types::GatewayError::Internal("unused".into()))
        }
    }

    fn router() -> BroadcastRouter {
        BroadcastRouter::new(
            Arc::new(SessionStore::new()),
            Arc::new(ServerManager::new(Arc::new(NoopFactory), None)),
            Arc::new(EventStore::new(Arc::new(gateway_store::InMemoryDurableEventStore::new()), Default::default())),
        )
    }

    #[tokio::test]
    async fn broadcasts_only_to_sessions_with_server_access() {
        let router = router();
        let with_access = router.sessions.create("s1".into(), auth_context("u1"));
        with_access.apply_permission_update(view_with_server("srv1"));
        let (tx, mut rx) = mpsc::channel(8);
        with_access.attach_sse(tx);

        let without_access = router.sessions.create("s2".into(), auth_context("u2"));
        let (tx2, mut rx2) = mpsc::channel(8);
        without_access.attach_sse(tx2);

        router.broadcast_list_changed("srv1", ListChangedKind::Tools).await;

        assert!(rx.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn dedup_skips_a_repeated_broadcast_to_the_same_session() {
        let router = router();
        let session = router.sessions.create("s1".into(), auth_context("u1"));
        session.apply_permission_update(view_with_server("srv1"));
        let (tx, mut rx) = mpsc::channel(8);
        session.attach_sse(tx);

        router.broadcast_list_changed("srv1", ListChangedKind::Tools).await;
        router.broadcast_list_changed("srv1", ListChangedKind::Tools).await;

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn resource_updated_reaches_only_subscribers() {
        let router = router();
        let subscriber = router.sessions.create("s1".into(), auth_context("u1"));
        let (tx, mut rx) = mpsc::channel(8);
        subscriber.attach_sse(tx);
        router.servers.subscribe_resource("srv1", "file://a.txt", "s1");

        let bystander = router.sessions.create("s2".into(), auth_context("u2"));
        let (tx2, mut rx2) = mpsc::channel(8);
        bystander.attach_sse(tx2);

        router
            .broadcast_resource_updated("srv1", "file://a.txt", serde_json::json!({"size": 1}))
            .await;

        assert!(rx.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }
}
