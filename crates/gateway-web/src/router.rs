//! Router assembly (§6): wires the `/mcp` trio, the control-plane
//! WebSocket, and the well-known metadata endpoints onto one
//! [`axum::Router`], with the tower middleware stack the rest of this
//! workspace's axum integration uses.

use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::control_plane::control_plane_upgrade;
use crate::mcp::{mcp_delete, mcp_get, mcp_post};
use crate::state::AppState;
use crate::wellknown::{oauth_authorization_server, oauth_protected_resource, oauth_protected_resource_mcp};

/// Per-request timeout applied ahead of the gateway's own per-reverse-kind
/// timeouts; generous enough that a slow elicitation round trip (up to
/// 300s, §4.3) is never cut off by the wire adapter itself.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(310);

/// Builds the full gateway router over `state` (§6 "Wire adapters").
#[must_use]
pub fn build_router(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(CompressionLayer::new());

    Router::new()
        .route("/mcp", post(mcp_post).get(mcp_get).delete(mcp_delete))
        .route("/control-plane", get(control_plane_upgrade))
        .route("/.well-known/oauth-authorization-server", get(oauth_authorization_server))
        .route("/.well-known/oauth-protected-resource", get(oauth_protected_resource))
        .route("/.well-known/oauth-protected-resource/mcp", get(oauth_protected_resource_mcp))
        .with_state(state)
        .layer(middleware)
}
