//! Application-context wiring: constructs every collaborator and core
//! component named across `gateway-admission`/`gateway-store`/
//! `gateway-session`/`gateway-upstream`/`gateway-router` and assembles
//! the [`gateway_web::AppState`] the wire adapters run against (§9
//! "collapse global singletons into an explicit application context
//! value").
//!
//! Standalone operation has no real user/proxy database, OAuth issuer,
//! or durable event store behind it, so this wiring reaches for the
//! in-memory reference collaborators each crate ships for exactly this
//! purpose. A production deployment swaps those constructors for ones
//! backed by its own database without touching anything downstream.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use gateway_admission::collaborators::in_memory::{InMemoryProxyRepository, InMemoryUserRepository};
use gateway_admission::{IpWhitelist, RateLimiter, TokenValidator, TokenValidatorConfig};
use gateway_router::{route_reverse_from_server, BroadcastRouter, ListChangedKind, RequestRouter};
use gateway_session::{ControlPlaneNotifier, ReverseKind, SessionStore};
use gateway_store::durable::InMemoryDurableEventStore;
use gateway_store::log_queue::{InMemoryLogSink, LogQueue};
use gateway_store::EventStore;
use gateway_upstream::{ReverseRequestKind, ServerEvent, ServerEventHandler, ServerManager};
use gateway_web::AppState;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::GatewayConfig;
use crate::factory::HttpUpstreamClientFactory;

/// Everything `main` needs to hold onto past startup: the state handed
/// to the router, plus the handles the shutdown sequence (§5) drains in
/// order.
pub struct AppContext {
    pub state: AppState,
    pub log_queue: LogQueue,
    pub log_worker: JoinHandle<()>,
    pub servers: Arc<ServerManager>,
    pub sessions: Arc<SessionStore>,
    pub events: Arc<EventStore>,
}

fn reverse_kind_of(kind: ReverseRequestKind) -> ReverseKind {
    match kind {
        ReverseRequestKind::Sampling => ReverseKind::Sampling,
        ReverseRequestKind::Roots => ReverseKind::Roots,
        ReverseRequestKind::Elicitation => ReverseKind::Elicitation,
    }
}

/// Wires an `Arc<dyn Fn>` event handler that fans `ServerEvent`s out to
/// the broadcast path (§4.6) and the reverse path (§4.3). The broadcast
/// router depends on the `ServerManager` being constructed, which in
/// turn needs this handler at construction time, so the router is
/// threaded through a `OnceLock` set immediately after `ServerManager`
/// comes into being — no event reaches the gateway before that happens,
/// since nothing has connected to an upstream server yet.
fn build_event_handler(
    sessions: Arc<SessionStore>,
    broadcast: Arc<OnceLock<Arc<BroadcastRouter>>>,
    logs: LogQueue,
) -> ServerEventHandler {
    Arc::new(move |server_id, event| {
        let sessions = sessions.clone();
        let broadcast = broadcast.clone();
        let logs = logs.clone();
        tokio::spawn(async move {
            match event {
                ServerEvent::ToolsListChanged => {
                    if let Some(router) = broadcast.get() {
                        router.broadcast_list_changed(&server_id, ListChangedKind::Tools).await;
                    }
                }
                ServerEvent::ResourcesListChanged => {
                    if let Some(router) = broadcast.get() {
                        router.broadcast_list_changed(&server_id, ListChangedKind::Resources).await;
                    }
                }
                ServerEvent::PromptsListChanged => {
                    if let Some(router) = broadcast.get() {
                        router.broadcast_list_changed(&server_id, ListChangedKind::Prompts).await;
                    }
                }
                ServerEvent::ResourceUpdated { uri, payload } => {
                    if let Some(router) = broadcast.get() {
                        router.broadcast_resource_updated(&server_id, &uri, payload).await;
                    }
                }
                ServerEvent::ReverseRequest {
                    kind,
                    proxy_request_id,
                    server_request_id,
                    params,
                    respond,
                } => {
                    let result = route_reverse_from_server(
                        &sessions,
                        &proxy_request_id,
                        reverse_kind_of(kind),
                        server_request_id,
                        params,
                        Some(&logs),
                    )
                    .await;
                    let _ = respond.send(result);
                }
            }
        });
    })
}

const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Periodically purges stream caches/durable rows past the retention
/// window (§4.2 "retention-driven cleanup").
fn spawn_event_store_cleanup(events: Arc<EventStore>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let purged = events.cleanup_expired().await;
            if purged > 0 {
                tracing::debug!(purged, "event store cleanup pass");
            }
        }
    });
}

/// Periodically closes sessions idle past the timeout (§4.3 "idle
/// timeout"); runs independently of any single request.
fn spawn_idle_sweep(sessions: Arc<SessionStore>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(IDLE_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            let closed = sessions.sweep_idle(gateway_types::now_millis());
            if closed > 0 {
                tracing::debug!(closed, "idle session sweep");
            }
        }
    });
}

/// Builds the whole application context from a loaded [`GatewayConfig`].
/// Bootstraps zero servers and zero users: a standalone run is an empty
/// gateway until its user/server repositories are seeded, which is a
/// real-deployment concern this binary deliberately leaves to whatever
/// admin tooling front-ends `InMemoryUserRepository`/`ServerManager`.
pub async fn build(config: &GatewayConfig) -> anyhow::Result<AppContext> {
    let users = Arc::new(InMemoryUserRepository::new());
    let proxies = Arc::new(InMemoryProxyRepository::disabled());

    let tokens = Arc::new(TokenValidator::new(
        users.clone(),
        TokenValidatorConfig {
            jwt_secret: config.jwt_secret(),
        },
    ));
    let ip_whitelist = Arc::new(IpWhitelist::new(proxies.clone()));
    let rate_limiter = Arc::new(RateLimiter::new());

    let durable = Arc::new(InMemoryDurableEventStore::new());
    let events = Arc::new(EventStore::new(durable, config.event_store_config()));

    let log_sink = Arc::new(InMemoryLogSink::new());
    let (log_queue, log_worker) = LogQueue::spawn(log_sink);
    let log_worker_handle = log_worker.run();

    let sessions = Arc::new(SessionStore::new());
    let broadcast_cell: Arc<OnceLock<Arc<BroadcastRouter>>> = Arc::new(OnceLock::new());
    let event_handler = build_event_handler(sessions.clone(), broadcast_cell.clone(), log_queue.clone());

    let factory = Arc::new(HttpUpstreamClientFactory::new(Duration::from_secs(30)));
    let servers = Arc::new(
        ServerManager::new(factory, Some(log_queue.clone())).with_event_handler(event_handler),
    );

    let broadcast = Arc::new(BroadcastRouter::new(sessions.clone(), servers.clone(), events.clone()));
    broadcast_cell
        .set(broadcast.clone())
        .unwrap_or_else(|_| warn!("broadcast router cell set twice, ignoring"));

    let router = Arc::new(RequestRouter::new(
        sessions.clone(),
        servers.clone(),
        events.clone(),
        Some(log_queue.clone()),
    ).with_response_max_length(config.log_response_max_length));

    let control_plane = Arc::new(ControlPlaneNotifier::new());

    servers.bootstrap(Vec::new()).await;

    spawn_event_store_cleanup(events.clone(), config.cleanup_interval());
    spawn_idle_sweep(sessions.clone());

    let state = AppState {
        sessions: sessions.clone(),
        servers: servers.clone(),
        events: events.clone(),
        router,
        broadcast,
        control_plane,
        ip_whitelist,
        tokens,
        rate_limiter,
        logs: Some(log_queue.clone()),
        base_url: config.base_url.clone(),
        reverse_timeouts: config.reverse_timeouts(),
    };

    Ok(AppContext {
        state,
        log_queue,
        log_worker: log_worker_handle,
        servers,
        sessions,
        events,
    })
}
