//! Gateway configuration (§6 "Configuration"): defaults layered under an
//! optional `config/*.toml` file, in turn overridden by environment
//! variables — the standard `config` crate layering, grounded in the
//! same "typed config struct built from layered sources" shape the
//! ambient stack calls for in `SPEC_FULL.md` §2.

use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

fn default_backend_port() -> u16 {
    3002
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_base_url() -> String {
    "http://localhost:3002".to_string()
}
fn default_log_response_max_length() -> usize {
    300
}
fn default_sampling_timeout_ms() -> u64 {
    60_000
}
fn default_elicitation_timeout_ms() -> u64 {
    300_000
}
fn default_roots_timeout_ms() -> u64 {
    10_000
}
fn default_event_store_max_cache_size() -> usize {
    10_000
}
fn default_event_store_max_stream_events() -> usize {
    1_000
}
fn default_event_store_retention_days() -> u64 {
    7
}
fn default_event_store_cleanup_interval_hours() -> u64 {
    24
}
fn default_jwt_secret() -> String {
    "development-only-insecure-secret".to_string()
}

/// Mirrors `spec.md` §6's configuration table. Fields are all optional on
/// the wire (`serde(default = ...)`); only `JWT_SECRET` should be
/// overridden for anything beyond local development.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_backend_port")]
    pub backend_port: u16,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_pretty: bool,
    #[serde(default = "default_log_response_max_length")]
    pub log_response_max_length: usize,
    #[serde(default = "default_sampling_timeout_ms")]
    pub reverse_request_timeout_sampling: u64,
    #[serde(default = "default_elicitation_timeout_ms")]
    pub reverse_request_timeout_elicitation: u64,
    #[serde(default = "default_roots_timeout_ms")]
    pub reverse_request_timeout_roots: u64,
    #[serde(default = "default_event_store_max_cache_size")]
    pub event_store_max_cache_size: usize,
    #[serde(default = "default_event_store_max_stream_events")]
    pub event_store_max_stream_events: usize,
    #[serde(default = "default_event_store_retention_days")]
    pub event_store_retention_days: u64,
    #[serde(default = "default_event_store_cleanup_interval_hours")]
    pub event_store_cleanup_interval_hours: u64,
    /// Accepted for parity with `spec.md` §6 but not a real knob the
    /// in-memory durable store honors; a relational backing store is
    /// where compression would actually apply.
    #[serde(default)]
    pub event_store_enable_compression: bool,
    /// Same caveat as `event_store_enable_compression`.
    #[serde(default)]
    pub event_store_enable_partitioning: bool,
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            backend_port: default_backend_port(),
            base_url: default_base_url(),
            log_level: default_log_level(),
            log_pretty: false,
            log_response_max_length: default_log_response_max_length(),
            reverse_request_timeout_sampling: default_sampling_timeout_ms(),
            reverse_request_timeout_elicitation: default_elicitation_timeout_ms(),
            reverse_request_timeout_roots: default_roots_timeout_ms(),
            event_store_max_cache_size: default_event_store_max_cache_size(),
            event_store_max_stream_events: default_event_store_max_stream_events(),
            event_store_retention_days: default_event_store_retention_days(),
            event_store_cleanup_interval_hours: default_event_store_cleanup_interval_hours(),
            event_store_enable_compression: false,
            event_store_enable_partitioning: false,
            jwt_secret: default_jwt_secret(),
        }
    }
}

impl GatewayConfig {
    /// Loads configuration: every field already carries a compiled-in
    /// default (`serde(default = ...)`), optionally overridden by
    /// `config/gateway.toml` (if present), in turn overridden by
    /// environment variables matching §6's table verbatim (e.g.
    /// `BACKEND_PORT`, `JWT_SECRET`).
    pub fn load() -> anyhow::Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/gateway").required(false))
            .add_source(config::Environment::default().try_parsing(true));
        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.backend_port)
    }

    #[must_use]
    pub fn jwt_secret(&self) -> SecretString {
        SecretString::from(self.jwt_secret.clone())
    }

    #[must_use]
    pub fn reverse_timeouts(&self) -> gateway_web::ReverseTimeoutConfig {
        gateway_web::ReverseTimeoutConfig {
            sampling_ms: self.reverse_request_timeout_sampling,
            roots_ms: self.reverse_request_timeout_roots,
            elicitation_ms: self.reverse_request_timeout_elicitation,
        }
    }

    #[must_use]
    pub fn event_store_config(&self) -> gateway_store::EventStoreConfig {
        gateway_store::EventStoreConfig {
            max_stream_events: self.event_store_max_stream_events,
            max_cache_size: self.event_store_max_cache_size,
            retention_days: self.event_store_retention_days,
        }
    }

    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.event_store_cleanup_interval_hours * 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let config = GatewayConfig::default();
        assert_eq!(config.backend_port, 3002);
        assert_eq!(config.log_response_max_length, 300);
        assert_eq!(config.reverse_request_timeout_sampling, 60_000);
        assert_eq!(config.reverse_request_timeout_elicitation, 300_000);
        assert_eq!(config.reverse_request_timeout_roots, 10_000);
        assert_eq!(config.event_store_max_stream_events, 1_000);
        assert_eq!(config.event_store_max_cache_size, 10_000);
        assert_eq!(config.event_store_retention_days, 7);
    }

    #[test]
    fn bind_addr_uses_configured_port() {
        let mut config = GatewayConfig::default();
        config.backend_port = 9000;
        assert_eq!(config.bind_addr(), "0.0.0.0:9000");
    }
}
