//! Server Manager & Server Context (§4.4), credential refresh
//! (§4.4 "Credential refresh"), OAuth authorization-code exchange
//! (§4.4 "Authorization-code exchange"), and Capability Service (§4.5).

pub mod auth_strategy;
pub mod capability;
pub mod http_client;
pub mod oauth_exchange;
pub mod server_context;
pub mod server_manager;

pub use auth_strategy::{AuthStrategy, OAuthClientConfig, OAuthToken, TokenCache};
pub use capability::compute_effective_view;
pub use http_client::{HttpUpstreamClient, HttpUpstreamClientConfig};
pub use oauth_exchange::{CodeExchangeError, CodeExchangeRouter, ExchangeResult, ProviderAdapter};
pub use server_context::{ServerContext, ServerEvent, ServerEventHandler, ReverseRequestKind, UpstreamClient};
pub use server_manager::{ConnectAllReport, ServerManager, UpstreamClientFactory};
