//! Shared application state cloned into every axum handler (§9 "collapse
//! global singletons into an explicit application context value").

use std::sync::Arc;

use gateway_admission::{IpWhitelist, RateLimiter, TokenValidator};
use gateway_router::{BroadcastRouter, RequestRouter};
use gateway_session::{ControlPlaneNotifier, SessionStore};
use gateway_store::event_store::EventStore;
use gateway_store::log_queue::LogQueue;
use gateway_upstream::ServerManager;

/// Reverse-request timeouts consumed only at session-creation time, so
/// they live alongside the rest of the wiring rather than inside
/// `gateway-session` (which only knows the *defaults*).
#[derive(Debug, Clone, Copy)]
pub struct ReverseTimeoutConfig {
    pub sampling_ms: u64,
    pub roots_ms: u64,
    pub elicitation_ms: u64,
}

impl Default for ReverseTimeoutConfig {
    fn default() -> Self {
        Self {
            sampling_ms: 60_000,
            roots_ms: 10_000,
            elicitation_ms: 300_000,
        }
    }
}

impl From<ReverseTimeoutConfig> for gateway_session::ReverseTimeouts {
    fn from(config: ReverseTimeoutConfig) -> Self {
        Self {
            sampling: std::time::Duration::from_millis(config.sampling_ms),
            roots: std::time::Duration::from_millis(config.roots_ms),
            elicit: std::time::Duration::from_millis(config.elicitation_ms),
        }
    }
}

/// Everything a wire adapter needs, collected into one `Clone`-cheap
/// handle (every field is an `Arc`). Built once in `gateway-cli` and
/// handed to the axum router.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionStore>,
    pub servers: Arc<ServerManager>,
    pub events: Arc<EventStore>,
    pub router: Arc<RequestRouter>,
    pub broadcast: Arc<BroadcastRouter>,
    pub control_plane: Arc<ControlPlaneNotifier>,
    pub ip_whitelist: Arc<IpWhitelist>,
    pub tokens: Arc<TokenValidator>,
    pub rate_limiter: Arc<RateLimiter>,
    /// Shared with `gateway-router`'s `RequestRouter`, so admission-time
    /// audit entries (`AuthRateLimit`) land in the same queue as every
    /// other log producer (§4.1, §9 "global singletons").
    pub logs: Option<LogQueue>,
    /// Used to render `resource_metadata` in `WWW-Authenticate` and the
    /// well-known metadata documents' endpoint URLs (§6).
    pub base_url: String,
    /// Per-kind reverse-request timeouts applied to every session created
    /// at `initialize` time (`REVERSE_REQUEST_TIMEOUT_*`, §6).
    pub reverse_timeouts: ReverseTimeoutConfig,
}
