//! Server Manager (§4.4): the pool of Server Contexts, plus bootstrap,
//! admin-edit, delete, and resource-subscription bookkeeping.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use gateway_store::log_queue::LogQueue;
use gateway_types::{AuthType, GatewayResult, Server, ServerStatus};
use secrecy::SecretString;
use tracing::{info, warn};

use crate::auth_strategy::{strategy_for, AuthStrategy, OAuthClientConfig, OAuthToken, TokenCache};
use crate::server_context::{ServerContext, ServerEventHandler, UpstreamClient};

/// Builds the transport-level connection for one server entry. The only
/// seam `ServerManager` needs into the concrete upstream transport
/// (stdio, HTTP, ...); kept separate so tests can substitute a fake
/// client without touching any real network stack.
#[async_trait]
pub trait UpstreamClientFactory: Send + Sync {
    async fn build(&self, server: &Server) -> GatewayResult<Arc<dyn UpstreamClient>>;
}

/// Result of `connectAllServers` (§4.4): which servers came up and which
/// failed, with their error messages.
#[derive(Debug, Clone, Default)]
pub struct ConnectAllReport {
    pub success: Vec<String>,
    pub failed: Vec<(String, String)>,
}

fn subscriber_key(server_id: &str, uri: &str) -> String {
    format!("{server_id}::{uri}")
}

pub struct ServerManager {
    factory: Arc<dyn UpstreamClientFactory>,
    logs: Option<LogQueue>,
    oauth_configs: DashMap<AuthType, OAuthClientConfig>,
    token_cache: Arc<TokenCache>,
    /// Ground-truth server entities, keyed by `serverId`.
    servers: DashMap<String, Server>,
    /// Shared contexts for servers with `allowUserInput = false`.
    shared_contexts: DashMap<String, Arc<ServerContext>>,
    /// Per-user contexts for `allowUserInput = true` servers, keyed by
    /// `(serverId, userId)` (§3 "a Server Context is per-user").
    temporary_contexts: DashMap<(String, String), Arc<ServerContext>>,
    /// `<serverId>::<uri> -> {sessionId}` (§4.6 "resource-update events
    /// go only to sessions in getResourceSubscribers").
    resource_subscribers: DashMap<String, DashSet<String>>,
    /// Forwards every context's server-originated events (list-changed
    /// notifications, reverse requests) out to the rest of the
    /// application (§4.4, §4.6 "Reverse path"). `None` in tests that
    /// never exercise that path.
    event_handler: Option<ServerEventHandler>,
}

impl ServerManager {
    #[must_use]
    pub fn new(factory: Arc<dyn UpstreamClientFactory>, logs: Option<LogQueue>) -> Self {
        Self {
            factory,
            logs,
            oauth_configs: DashMap::new(),
            token_cache: Arc::new(TokenCache::new()),
            servers: DashMap::new(),
            shared_contexts: DashMap::new(),
            temporary_contexts: DashMap::new(),
            resource_subscribers: DashMap::new(),
            event_handler: None,
        }
    }

    /// Same as [`Self::new`], but registers `handler` to receive every
    /// server-originated event any context's upstream client raises.
    /// `gateway-cli` is the only caller that needs this: it is the one
    /// place with access to the Request Router's broadcast path and the
    /// Session Store, which this crate must not depend on directly.
    #[must_use]
    pub fn with_event_handler(mut self, handler: ServerEventHandler) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Registers the OAuth client configuration used when building an
    /// `AuthStrategy` for `auth_type`; a no-op for `ApiKey`, which needs
    /// none.
    pub fn set_oauth_config(&self, auth_type: AuthType, config: OAuthClientConfig) {
        self.oauth_configs.insert(auth_type, config);
    }

    fn auth_strategy_for(&self, auth_type: AuthType) -> Option<Arc<dyn AuthStrategy>> {
        if auth_type == AuthType::ApiKey {
            return Some(strategy_for(auth_type, None));
        }
        self.oauth_configs
            .get(&auth_type)
            .map(|config| strategy_for(auth_type, Some(config.clone())))
    }

    /// Enumerates and lazily connects every enabled, non-`allowUserInput`
    /// server (§4.4 "On bootstrap it enumerates enabled servers and
    /// lazily connects them"). `allowUserInput` servers only get a
    /// context once a user configures one via `create_temporary_server`.
    pub async fn bootstrap(&self, servers: Vec<Server>) {
        for server in servers {
            self.servers.insert(server.server_id.clone(), server.clone());
            if server.enabled && !server.allow_user_input {
                self.spawn_shared_context(&server).await;
            }
        }
    }

    async fn spawn_shared_context(&self, server: &Server) {
        let client = match self.factory.build(server).await {
            Ok(client) => client,
            Err(err) => {
                warn!(server_id = %server.server_id, %err, "failed to build upstream client");
                return;
            }
        };
        let auth = self.auth_strategy_for(server.auth_type);
        let context = ServerContext::with_event_handler(
            server.server_id.clone(),
            None,
            client,
            auth,
            Some(self.token_cache.clone()),
            self.logs.clone(),
            self.event_handler.clone(),
        );
        if let Err(err) = context.connect().await {
            warn!(server_id = %server.server_id, %err, "initial connect failed");
        } else {
            self.refresh_ground_truth_capabilities(&server.server_id, &context);
        }
        self.shared_contexts.insert(server.server_id.clone(), context);
    }

    /// Copies a context's freshly connected capability set onto its
    /// ground-truth `Server` entry, since the Capability Service (§4.5)
    /// derives every effective view from `list_servers()` rather than
    /// from any single context's in-memory state.
    fn refresh_ground_truth_capabilities(&self, server_id: &str, context: &Arc<ServerContext>) {
        if let Some(mut entry) = self.servers.get_mut(server_id) {
            entry.cached_capabilities = context.capabilities();
        }
    }

    /// Admin edited a server's config: tear down any existing shared
    /// context and rebuild it from the new entity (§4.4 "on admin edit
    /// it restarts the affected context").
    pub async fn restart_server(&self, server: Server) {
        self.servers.insert(server.server_id.clone(), server.clone());
        if let Some((_, old)) = self.shared_contexts.remove(&server.server_id) {
            old.close().await;
        }
        if server.enabled && !server.allow_user_input {
            self.spawn_shared_context(&server).await;
        }
    }

    /// Admin deleted a server: tears down every context (shared and any
    /// per-user temporaries) and drops the ground-truth entry. Purging
    /// the server from every user's `launchConfigs`/`userPreferences` is
    /// a user-repository concern and is the caller's responsibility once
    /// this returns (§4.4).
    pub async fn delete_server(&self, server_id: &str) {
        self.servers.remove(server_id);
        if let Some((_, context)) = self.shared_contexts.remove(server_id) {
            context.close().await;
        }
        let stale: Vec<(String, String)> = self
            .temporary_contexts
            .iter()
            .map(|e| e.key().clone())
            .filter(|(sid, _)| sid == server_id)
            .collect();
        for key in stale {
            if let Some((_, context)) = self.temporary_contexts.remove(&key) {
                context.close().await;
            }
        }
        self.resource_subscribers
            .retain(|key, _| !key.starts_with(&format!("{server_id}::")));
    }

    /// Creates (or replaces) a per-user context for an `allowUserInput`
    /// server, seeding its token cache entry from the user-supplied
    /// credential (§4.4 `createTemporaryServer`).
    pub async fn create_temporary_server(
        &self,
        user_id: &str,
        server: &Server,
        user_token: SecretString,
    ) -> GatewayResult<Arc<ServerContext>> {
        let client = self.factory.build(server).await?;
        let auth = self.auth_strategy_for(server.auth_type);
        if let Some(auth) = &auth {
            let token: OAuthToken = auth.get_initial_token(user_token).await?;
            self.token_cache.put(&server.server_id, user_id, token);
        }
        let context = ServerContext::with_event_handler(
            server.server_id.clone(),
            Some(user_id.to_string()),
            client,
            auth,
            Some(self.token_cache.clone()),
            self.logs.clone(),
            self.event_handler.clone(),
        );
        context.connect().await?;
        self.refresh_ground_truth_capabilities(&server.server_id, &context);
        self.temporary_contexts
            .insert((server.server_id.clone(), user_id.to_string()), context.clone());
        Ok(context)
    }

    /// Tears down and forgets a per-user context (`closeTemporaryServer`).
    pub async fn close_temporary_server(&self, server_id: &str, user_id: &str) {
        if let Some((_, context)) = self
            .temporary_contexts
            .remove(&(server_id.to_string(), user_id.to_string()))
        {
            context.close().await;
        }
        self.token_cache.invalidate(server_id, user_id);
    }

    #[must_use]
    pub fn get_shared_context(&self, server_id: &str) -> Option<Arc<ServerContext>> {
        self.shared_contexts.get(server_id).map(|e| e.clone())
    }

    #[must_use]
    pub fn get_temporary_context(&self, server_id: &str, user_id: &str) -> Option<Arc<ServerContext>> {
        self.temporary_contexts
            .get(&(server_id.to_string(), user_id.to_string()))
            .map(|e| e.clone())
    }

    /// The context a request for `(server_id, user_id)` should dispatch
    /// through: the shared context if the server doesn't need per-user
    /// credentials, otherwise that user's temporary context.
    #[must_use]
    pub fn resolve_context(&self, server_id: &str, user_id: &str) -> Option<Arc<ServerContext>> {
        match self.servers.get(server_id) {
            Some(entry) if entry.allow_user_input => self.get_temporary_context(server_id, user_id),
            Some(_) => self.get_shared_context(server_id),
            None => None,
        }
    }

    #[must_use]
    pub fn server(&self, server_id: &str) -> Option<Server> {
        self.servers.get(server_id).map(|e| e.clone())
    }

    /// Every registered server entity, ground truth for the Capability
    /// Service (§4.5) when a wire adapter recomputes a user's effective
    /// view.
    #[must_use]
    pub fn list_servers(&self) -> Vec<Server> {
        self.servers.iter().map(|e| e.value().clone()).collect()
    }

    /// `healthCheck()`: status of every shared context, plus every
    /// per-user temporary context keyed `<serverId>:<userId>`.
    #[must_use]
    pub fn health_check(&self) -> BTreeMap<String, ServerStatus> {
        let mut statuses = BTreeMap::new();
        for entry in &self.shared_contexts {
            statuses.insert(entry.key().clone(), entry.value().status());
        }
        for entry in &self.temporary_contexts {
            let (server_id, user_id) = entry.key();
            statuses.insert(format!("{server_id}:{user_id}"), entry.value().status());
        }
        statuses
    }

    /// Connects every registered, enabled, non-`allowUserInput` server
    /// that isn't already `Online`, regardless of its current bootstrap
    /// state (§4.4 `connectAllServers`). `_token` is the caller's admin
    /// credential; authorizing it is the admission layer's job, not
    /// this one's.
    pub async fn connect_all_servers(&self, _token: &str) -> ConnectAllReport {
        let targets: Vec<Server> = self
            .servers
            .iter()
            .map(|e| e.value().clone())
            .filter(|s| s.enabled && !s.allow_user_input)
            .collect();

        let mut report = ConnectAllReport::default();
        for server in targets {
            if let Some(existing) = self.shared_contexts.get(&server.server_id) {
                if existing.status() == ServerStatus::Online {
                    report.success.push(server.server_id.clone());
                    continue;
                }
            }
            self.spawn_shared_context(&server).await;
            match self.shared_contexts.get(&server.server_id).map(|c| c.status()) {
                Some(ServerStatus::Online) => report.success.push(server.server_id.clone()),
                _ => report.failed.push((
                    server.server_id.clone(),
                    "failed to reach Online after connect attempt".to_string(),
                )),
            }
        }
        info!(success = report.success.len(), failed = report.failed.len(), "connect_all_servers complete");
        report
    }

    pub fn subscribe_resource(&self, server_id: &str, uri: &str, session_id: &str) {
        self.resource_subscribers
            .entry(subscriber_key(server_id, uri))
            .or_default()
            .insert(session_id.to_string());
    }

    pub fn unsubscribe_resource(&self, server_id: &str, uri: &str, session_id: &str) {
        if let Some(set) = self.resource_subscribers.get(&subscriber_key(server_id, uri)) {
            set.remove(session_id);
        }
    }

    /// Drops `session_id` from every resource subscription, used when a
    /// session closes.
    pub fn unsubscribe_session(&self, session_id: &str) {
        for entry in &self.resource_subscribers {
            entry.value().remove(session_id);
        }
    }

    /// `getResourceSubscribers(key)`: the set of sessionIds subscribed to
    /// `<serverId>::<uri>` (§4.4, §4.6 step 4).
    #[must_use]
    pub fn get_resource_subscribers(&self, server_id: &str, uri: &str) -> Vec<String> {
        self.resource_subscribers
            .get(&subscriber_key(server_id, uri))
            .map(|set| set.iter().map(|s| s.clone()).collect())
            .unwrap_or_default()
    }

    /// Process shutdown (§5): closes every shared and per-user temporary
    /// context (each emits its own `ServerClose` log entry), run after
    /// the wire adapter has stopped admitting new connections.
    pub async fn shutdown(&self) {
        let shared: Vec<Arc<ServerContext>> = self.shared_contexts.iter().map(|e| e.value().clone()).collect();
        let temporary: Vec<Arc<ServerContext>> = self.temporary_contexts.iter().map(|e| e.value().clone()).collect();
        for context in shared.into_iter().chain(temporary) {
            context.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server_context::ServerEvent;
    use gateway_types::AdvertisedCapabilities;
    use serde_json::Value;
    use std::collections::BTreeMap as Map;
    use tokio::sync::mpsc;

    struct AlwaysOkClient;

    #[async_trait]
    impl UpstreamClient for AlwaysOkClient {
        async fn connect(&self) -> GatewayResult<(AdvertisedCapabilities, mpsc::Receiver<ServerEvent>)> {
            let (_tx, rx) = mpsc::channel(1);
            Ok((AdvertisedCapabilities::default(), rx))
        }
        async fn call_tool(&self, _name: &str, _arguments: Value) -> GatewayResult<Value> {
            Ok(Value::Null)
        }
        async fn read_resource(&self, _uri: &str, _meta: Value) -> GatewayResult<Value> {
            Ok(Value::Null)
        }
        async fn get_prompt(&self, _name: &str, _arguments: Value) -> GatewayResult<Value> {
            Ok(Value::Null)
        }
        async fn disconnect(&self) -> GatewayResult<()> {
            Ok(())
        }
    }

    struct AlwaysOkFactory;

    #[async_trait]
    impl UpstreamClientFactory for AlwaysOkFactory {
        async fn build(&self, _server: &Server) -> GatewayResult<Arc<dyn UpstreamClient>> {
            Ok(Arc::new(AlwaysOkClient))
        }
    }

    fn server(server_id: &str, allow_user_input: bool) -> Server {
        Server {
            server_id: server_id.to_string(),
            server_name: "Test".into(),
            enabled: true,
            auth_type: AuthType::ApiKey,
            allow_user_input,
            config_template: Map::new(),
            cached_capabilities: AdvertisedCapabilities::default(),
        }
    }

    fn manager() -> ServerManager {
        ServerManager::new(Arc::new(AlwaysOkFactory), None)
    }

    #[tokio::test]
    async fn bootstrap_connects_shared_servers_but_not_allow_user_input_ones() {
        let mgr = manager();
        mgr.bootstrap(vec![server("s1", false), server("s2", true)]).await;
        assert!(mgr.get_shared_context("s1").is_some());
        assert!(mgr.get_shared_context("s2").is_none());
        assert_eq!(mgr.get_shared_context("s1").unwrap().status(), ServerStatus::Online);
    }

    #[tokio::test]
    async fn create_temporary_server_is_scoped_to_one_user() {
        let mgr = manager();
        let server = server("s1", true);
        mgr.servers.insert("s1".into(), server.clone());
        mgr.create_temporary_server("u1", &server, SecretString::from("tok".to_string()))
            .await
            .unwrap();
        assert!(mgr.get_temporary_context("s1", "u1").is_some());
        assert!(mgr.get_temporary_context("s1", "u2").is_none());
    }

    #[tokio::test]
    async fn resolve_context_routes_by_allow_user_input_flag() {
        let mgr = manager();
        mgr.bootstrap(vec![server("s1", false)]).await;
        let shared = server("s2", true);
        mgr.servers.insert("s2".into(), shared.clone());
        mgr.create_temporary_server("u1", &shared, SecretString::from("tok".to_string()))
            .await
            .unwrap();

        assert!(mgr.resolve_context("s1", "whoever").is_some());
        assert!(mgr.resolve_context("s2", "u1").is_some());
        assert!(mgr.resolve_context("s2", "someone-else").is_none());
    }

    #[tokio::test]
    async fn delete_server_tears_down_shared_and_temporary_contexts() {
        let mgr = manager();
        mgr.bootstrap(vec![server("s1", false)]).await;
        let temp = server("s2", true);
        mgr.servers.insert("s2".into(), temp.clone());
        mgr.create_temporary_server("u1", &temp, SecretString::from("tok".to_string()))
            .await
            .unwrap();

        mgr.delete_server("s1").await;
        mgr.delete_server("s2").await;

        assert!(mgr.get_shared_context("s1").is_none());
        assert!(mgr.get_temporary_context("s2", "u1").is_none());
        assert!(mgr.server("s1").is_none());
    }

    #[tokio::test]
    async fn connect_all_servers_reports_success_for_online_servers() {
        let mgr = manager();
        mgr.bootstrap(vec![server("s1", false), server("s2", false)]).await;
        let report = mgr.connect_all_servers("admin-token").await;
        assert_eq!(report.success.len(), 2);
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn list_servers_reflects_bootstrap_and_delete() {
        let mgr = manager();
        mgr.bootstrap(vec![server("s1", false), server("s2", false)]).await;
        let mut ids: Vec<String> = mgr.list_servers().iter().map(|s| s.server_id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["s1".to_string(), "s2".to_string()]);

        mgr.delete_server("s1").await;
        assert_eq!(mgr.list_servers().len(), 1);
    }

    #[test]
    fn resource_subscribers_track_per_key_sessions() {
        let mgr = manager();
        mgr.subscribe_resource("s1", "file://a.txt", "sess-1");
        mgr.subscribe_resource("s1", "file://a.txt", "sess-2");
        mgr.subscribe_resource("s1", "file://b.txt", "sess-3");

        let mut subs = mgr.get_resource_subscribers("s1", "file://a.txt");
        subs.sort();
        assert_eq!(subs, vec!["sess-1", "sess-2"]);

        mgr.unsubscribe_resource("s1", "file://a.txt", "sess-1");
        assert_eq!(mgr.get_resource_subscribers("s1", "file://a.txt"), vec!["sess-2"]);
    }

    #[test]
    fn unsubscribe_session_clears_it_from_every_key() {
        let mgr = manager();
        mgr.subscribe_resource("s1", "file://a.txt", "sess-1");
        mgr.subscribe_resource("s2", "file://b.txt", "sess-1");
        mgr.unsubscribe_session("sess-1");
        assert!(mgr.get_resource_subscribers("s1", "file://a.txt").is_empty());
        assert!(mgr.get_resource_subscribers("s2", "file://b.txt").is_empty());
    }
}
