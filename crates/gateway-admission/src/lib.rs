//! Admission & Identity (§4.1): IP whitelist matching, bearer-token
//! validation (legacy hex + OAuth JWT), and per-user fixed-window rate
//! limiting — the three chained operations invoked before any `/mcp`
//! traffic reaches the core.

pub mod collaborators;
pub mod ip_whitelist;
pub mod rate_limit;
pub mod token;

pub use collaborators::{ProxyRepository, UserRepository};
pub use ip_whitelist::IpWhitelist;
pub use rate_limit::{RateLimitDecision, RateLimiter};
pub use token::{TokenValidator, TokenValidatorConfig};
