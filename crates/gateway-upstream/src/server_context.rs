//! Server Context (§4.4): owns one upstream MCP client connection, its
//! status machine, and its advertised capability set.

use std::sync::Arc;

use async_trait::async_trait;
use gateway_store::log_queue::LogQueue;
use gateway_types::{
    new_uniform_request_id, AdvertisedCapabilities, GatewayError, GatewayResult, LogAction,
    LogEntry, ServerStatus,
};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};
use tracing::info;

use crate::auth_strategy::{now_unix_secs, AuthStrategy, OAuthToken, TokenCache};

/// The reverse-request kinds a server can ask the gateway to route to its
/// client (§4.3, §4.6 "Reverse path"). Mirrors `gateway_session::ReverseKind`
/// without this crate depending on `gateway-session` (that dependency would
/// point the wrong way: `gateway-session` is a leaf relative to the pool).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReverseRequestKind {
    Sampling,
    Roots,
    Elicitation,
}

/// One server-originated event surfaced out of band from forward-call
/// responses (§4.4 "Emits lifecycle log events... forwards to the Request
/// Router broadcast path", §4.6 "Reverse path"). An `UpstreamClient`
/// implementation pushes these onto the channel it hands back from
/// `connect`; `ServerContext` forwards each one to whatever
/// [`ServerEventHandler`] the `ServerManager` was built with.
pub enum ServerEvent {
    ToolsListChanged,
    ResourcesListChanged,
    PromptsListChanged,
    ResourceUpdated {
        uri: String,
        payload: Value,
    },
    /// A server-initiated sampling/roots/elicitation call. `proxy_request_id`
    /// is the `_meta.proxyContext.proxyRequestId` the server echoed back
    /// from the forward request that triggered it (§6 "Proxy context
    /// `_meta`"), which is how the caller finds the originating session.
    ReverseRequest {
        kind: ReverseRequestKind,
        proxy_request_id: String,
        server_request_id: Value,
        params: Value,
        respond: oneshot::Sender<GatewayResult<Value>>,
    },
}

/// Registered once per `ServerManager` (or per context, for `allowUserInput`
/// servers); receives every [`ServerEvent`] a context's upstream client
/// raises, tagged with the `serverId` it came from. Kept as a plain
/// callback rather than a trait object the pool depends on, so this crate
/// never has to import `gateway-router`/`gateway-session` (§9 "global
/// singletons collapse into an explicit application context").
pub type ServerEventHandler = Arc<dyn Fn(String, ServerEvent) + Send + Sync>;

/// One upstream MCP JSON-RPC client connection (§4.4 "owns one upstream
/// MCP client"). Implementations speak whatever transport the server
/// uses (stdio, HTTP, streamable HTTP); the context only needs the
/// request/response shape.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Opens the connection and returns the server's advertised
    /// capability set (ground truth, §3) plus the channel its background
    /// reader pushes server-originated events onto. A client with nothing
    /// to push may return a channel whose sender is dropped immediately.
    async fn connect(&self) -> GatewayResult<(AdvertisedCapabilities, mpsc::Receiver<ServerEvent>)>;
    async fn call_tool(&self, name: &str, arguments: Value) -> GatewayResult<Value>;
    async fn read_resource(&self, uri: &str, meta: Value) -> GatewayResult<Value>;
    async fn get_prompt(&self, name: &str, arguments: Value) -> GatewayResult<Value>;
    async fn disconnect(&self) -> GatewayResult<()>;
}

/// A sleeping server gets exactly one wake attempt before the gateway
/// fails the request fast; no auto-retry (§9 open question (b)).
const WAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ServerContext {
    pub server_id: String,
    /// `Some` for a per-user "temporary" context of an `allowUserInput`
    /// server; `None` for a shared context (§3 Server Context ownership).
    pub user_id: Option<String>,
    client: Arc<dyn UpstreamClient>,
    status: RwLock<ServerStatus>,
    capabilities: RwLock<AdvertisedCapabilities>,
    auth: Option<Arc<dyn AuthStrategy>>,
    token_cache: Option<Arc<TokenCache>>,
    logs: Option<LogQueue>,
    event_handler: Option<ServerEventHandler>,
}

impl ServerContext {
    #[must_use]
    pub fn new(
        server_id: String,
        user_id: Option<String>,
        client: Arc<dyn UpstreamClient>,
        auth: Option<Arc<dyn AuthStrategy>>,
        token_cache: Option<Arc<TokenCache>>,
        logs: Option<LogQueue>,
    ) -> Arc<Self> {
        Self::with_event_handler(server_id, user_id, client, auth, token_cache, logs, None)
    }

    /// Same as [`Self::new`], but forwards every [`ServerEvent`] the
    /// upstream client raises to `event_handler` (§4.4, §4.6 "Reverse
    /// path"). `ServerManager` is the only caller that supplies one.
    #[must_use]
    pub fn with_event_handler(
        server_id: String,
        user_id: Option<String>,
        client: Arc<dyn UpstreamClient>,
        auth: Option<Arc<dyn AuthStrategy>>,
        token_cache: Option<Arc<TokenCache>>,
        logs: Option<LogQueue>,
        event_handler: Option<ServerEventHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            server_id,
            user_id,
            client,
            status: RwLock::new(ServerStatus::Connecting),
            capabilities: RwLock::new(AdvertisedCapabilities::default()),
            auth,
            token_cache,
            logs,
            event_handler,
        })
    }

    /// Spawns the background task that drains the upstream client's event
    /// channel and forwards each item to the registered event handler,
    /// tagged with this context's `serverId`.
    fn spawn_event_forwarding(&self, mut events: mpsc::Receiver<ServerEvent>) {
        let Some(handler) = self.event_handler.clone() else {
            return;
        };
        let server_id = self.server_id.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                handler(server_id.clone(), event);
            }
        });
    }

    #[must_use]
    pub fn status(&self) -> ServerStatus {
        *self.status.read()
    }

    #[must_use]
    pub fn capabilities(&self) -> AdvertisedCapabilities {
        self.capabilities.read().clone()
    }

    fn set_status(&self, status: ServerStatus) {
        let prior = {
            let mut guard = self.status.write();
            let prior = *guard;
            *guard = status;
            prior
        };
        if prior != status {
            info!(server_id = %self.server_id, ?prior, ?status, "server status change");
            self.log(LogAction::ServerStatusChange, None);
        }
    }

    fn log(&self, action: LogAction, error: Option<String>) {
        let Some(logs) = &self.logs else { return };
        let subject = self.user_id.as_deref().unwrap_or(&self.server_id);
        logs.enqueue(LogEntry {
            action,
            user_id: self.user_id.clone(),
            server_id: Some(self.server_id.clone()),
            session_id: None,
            upstream_request_id: None,
            uniform_request_id: new_uniform_request_id(subject),
            parent_uniform_request_id: None,
            ip: "internal".into(),
            user_agent: None,
            token_mask: String::new(),
            request_params: None,
            response_result: None,
            error,
            duration_ms: 0,
            status_code: 0,
        });
    }

    /// Initial connection attempt, run once when the context is created
    /// (§4.4 "lazily connects them").
    pub async fn connect(&self) -> GatewayResult<()> {
        self.set_status(ServerStatus::Connecting);
        match self.client.connect().await {
            Ok((caps, events)) => {
                *self.capabilities.write() = caps;
                self.set_status(ServerStatus::Online);
                self.log(LogAction::ServerInit, None);
                self.spawn_event_forwarding(events);
                Ok(())
            }
            Err(err) => {
                self.set_status(ServerStatus::Error);
                self.log(LogAction::ServerInit, Some(err.to_string()));
                Err(err)
            }
        }
    }

    /// One bounded wake attempt for a `Sleeping` context (§4.4 step "If
    /// the server is Sleeping, wake it first").
    pub async fn wake(&self) -> GatewayResult<()> {
        if self.status() != ServerStatus::Sleeping {
            return Ok(());
        }
        self.set_status(ServerStatus::Connecting);
        match timeout(WAKE_TIMEOUT, self.client.connect()).await {
            Ok(Ok((caps, events))) => {
                *self.capabilities.write() = caps;
                self.set_status(ServerStatus::Online);
                self.spawn_event_forwarding(events);
                Ok(())
            }
            Ok(Err(err)) => {
                self.set_status(ServerStatus::Offline);
                Err(err)
            }
            Err(_) => {
                self.set_status(ServerStatus::Offline);
                Err(GatewayError::ServerOffline(self.server_id.clone()))
            }
        }
    }

    pub fn mark_sleeping(&self) {
        self.set_status(ServerStatus::Sleeping);
    }

    /// Consults the token cache and refreshes via the auth strategy if
    /// the cached token is within the early-expiry buffer (§4.4
    /// "Credential refresh"). A no-op for contexts without a strategy
    /// (e.g. servers with no configured auth).
    async fn refresh_credentials(&self) -> GatewayResult<()> {
        let (Some(auth), Some(cache)) = (&self.auth, &self.token_cache) else {
            return Ok(());
        };
        let subject = self.user_id.as_deref().unwrap_or(&self.server_id);
        let Some(current) = cache.get(&self.server_id, subject) else {
            return Ok(());
        };
        if current.needs_refresh(now_unix_secs()) {
            let refreshed = auth.refresh_token(&current).await?;
            cache.put(&self.server_id, subject, refreshed);
        }
        Ok(())
    }

    /// Checks dispatchability per §4.4 step 4: wake a sleeping server,
    /// fail fast on `Error`/`Offline`/still-`Connecting`.
    async fn ensure_dispatchable(&self) -> GatewayResult<()> {
        match self.status() {
            ServerStatus::Online => Ok(()),
            ServerStatus::Sleeping => self.wake().await,
            ServerStatus::Error | ServerStatus::Offline | ServerStatus::Connecting => {
                Err(GatewayError::ServerOffline(self.server_id.clone()))
            }
        }
    }

    pub async fn dispatch_call_tool(&self, name: &str, arguments: Value) -> GatewayResult<Value> {
        self.ensure_dispatchable().await?;
        self.refresh_credentials().await?;
        self.client.call_tool(name, arguments).await
    }

    pub async fn dispatch_read_resource(&self, uri: &str, meta: Value) -> GatewayResult<Value> {
        self.ensure_dispatchable().await?;
        self.refresh_credentials().await?;
        self.client.read_resource(uri, meta).await
    }

    pub async fn dispatch_get_prompt(&self, name: &str, arguments: Value) -> GatewayResult<Value> {
        self.ensure_dispatchable().await?;
        self.refresh_credentials().await?;
        self.client.get_prompt(name, arguments).await
    }

    pub async fn close(&self) {
        let _ = self.client.disconnect().await;
        self.set_status(ServerStatus::Offline);
        self.log(LogAction::ServerClose, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeClient {
        connect_calls: AtomicUsize,
        fail_connect: bool,
    }

    #[async_trait]
    impl UpstreamClient for FakeClient {
        async fn connect(&self) -> GatewayResult<(AdvertisedCapabilities, mpsc::Receiver<ServerEvent>)> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_connect {
                Err(GatewayError::ServerError("boom".into()))
            } else {
                let (_tx, rx) = mpsc::channel(1);
                Ok((AdvertisedCapabilities::default(), rx))
            }
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

    fn context(fail_connect: bool) -> Arc<ServerContext> {
        ServerContext::new(
            "s1".into(),
            None,
            Arc::new(FakeClient {
                connect_calls: AtomicUsize::new(0),
                fail_connect,
            }),
            None,
            None,
            None,
        )
    }

    #[tokio::test]
    async fn connect_success_moves_to_online() {
        let ctx = context(false);
        ctx.connect().await.unwrap();
        assert_eq!(ctx.status(), ServerStatus::Online);
    }

    #[tokio::test]
    async fn connect_failure_moves_to_error() {
        let ctx = context(true);
        assert!(ctx.connect().await.is_err());
        assert_eq!(ctx.status(), ServerStatus::Error);
    }

    #[tokio::test]
    async fn dispatch_fails_fast_when_offline() {
        let ctx = context(false);
        ctx.set_status(ServerStatus::Offline);
        let result = ctx.dispatch_call_tool("whatever", Value::Null).await;
        assert!(matches!(result, Err(GatewayError::ServerOffline(_))));
    }

    #[tokio::test]
    async fn dispatch_wakes_a_sleeping_context() {
        let ctx = context(false);
        ctx.mark_sleeping();
        assert_eq!(ctx.status(), ServerStatus::Sleeping);
        ctx.dispatch_call_tool("whatever", Value::Null).await.unwrap();
        assert_eq!(ctx.status(), ServerStatus::Online);
    }

    #[tokio::test]
    async fn failed_wake_moves_to_offline_not_error() {
        let ctx = context(true);
        ctx.mark_sleeping();
        assert!(ctx.dispatch_call_tool("whatever", Value::Null).await.is_err());
        assert_eq!(ctx.status(), ServerStatus::Offline);
    }

    #[tokio::test]
    async fn close_disconnects_and_marks_offline() {
        let ctx = context(false);
        ctx.connect().await.unwrap();
        ctx.close().await;
        assert_eq!(ctx.status(), ServerStatus::Offline);
    }
}
