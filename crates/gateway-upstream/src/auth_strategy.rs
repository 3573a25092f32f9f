//! Credential refresh (§4.4 "Credential refresh"): one `AuthStrategy` per
//! `AuthType`, each building its provider's wire-specific refresh request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use gateway_types::{AuthType, GatewayError, GatewayResult};
use parking_lot::RwLock;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;

/// A 5-minute early-expiry buffer: a token is reused without a network
/// call whenever `expiresAt - now > 5min` (§4.4).
pub const EARLY_EXPIRY_BUFFER_SECS: i64 = 5 * 60;

#[must_use]
pub fn now_unix_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// An OAuth access token plus enough metadata to decide whether it needs
/// refreshing.
#[derive(Clone)]
pub struct OAuthToken {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    /// Unix seconds; 0 means "treat as perpetually valid" (e.g. API keys).
    pub expires_at: i64,
}

impl OAuthToken {
    #[must_use]
    pub fn needs_refresh(&self, now: i64) -> bool {
        self.expires_at != 0 && self.expires_at - now <= EARLY_EXPIRY_BUFFER_SECS
    }
}

/// In-memory per-server-per-user token cache, consulted before any
/// strategy's `refresh_token` is invoked.
#[derive(Default)]
pub struct TokenCache {
    tokens: RwLock<HashMap<(String, String), OAuthToken>>,
}

impl TokenCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, server_id: &str, user_id: &str) -> Option<OAuthToken> {
        self.tokens
            .read()
            .get(&(server_id.to_string(), user_id.to_string()))
            .cloned()
    }

    pub fn put(&self, server_id: &str, user_id: &str, token: OAuthToken) {
        self.tokens
            .write()
            .insert((server_id.to_string(), user_id.to_string()), token);
    }

    pub fn invalidate(&self, server_id: &str, user_id: &str) {
        self.tokens
            .write()
            .remove(&(server_id.to_string(), user_id.to_string()));
    }
}

/// Where the provider expects client credentials in a refresh request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialPlacement {
    /// `Authorization: Basic base64(client_id:client_secret)`.
    BasicAuthHeader,
    /// `client_id`/`client_secret` as body parameters.
    BodyParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyEncoding {
    FormUrlEncoded,
    Json,
}

/// Static, provider-specific wire shape for a refresh request. Built once
/// per `AuthType` by the constructors below; the dynamic part
/// (`token_url` for instance-scoped providers) is supplied per server.
#[derive(Debug, Clone)]
pub struct ProviderWireShape {
    pub credential_placement: CredentialPlacement,
    pub body_encoding: BodyEncoding,
    pub default_expiry_secs: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// One server's OAuth client configuration (§4.4 "Each context has an
/// optional `IAuthStrategy`").
#[derive(Debug, Clone)]
pub struct OAuthClientConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: SecretString,
}

#[async_trait]
pub trait AuthStrategy: Send + Sync {
    fn auth_type(&self) -> AuthType;

    /// Used during initial per-user server setup; for providers without a
    /// code-exchange flow this simply validates and wraps the supplied
    /// token.
    async fn get_initial_token(&self, raw_token: SecretString) -> GatewayResult<OAuthToken>;

    /// Exchanges a refresh token for a new access token. `ApiKey` never
    /// calls this (its tokens never expire in this model).
    async fn refresh_token(&self, current: &OAuthToken) -> GatewayResult<OAuthToken>;

    /// Returns a value only when the cached OAuth client config actually
    /// changed, so callers can skip no-op persistence writes.
    fn get_current_oauth_config(&self) -> Option<Value> {
        None
    }

    fn mark_config_as_persisted(&self) {}
}

/// `ApiKey`: no refresh, the "token" is the key itself and never expires.
pub struct ApiKeyStrategy;

#[async_trait]
impl AuthStrategy for ApiKeyStrategy {
    fn auth_type(&self) -> AuthType {
        AuthType::ApiKey
    }

    async fn get_initial_token(&self, raw_token: SecretString) -> GatewayResult<OAuthToken> {
        Ok(OAuthToken {
            access_token: raw_token,
            refresh_token: None,
            expires_at: 0,
        })
    }

    async fn refresh_token(&self, current: &OAuthToken) -> GatewayResult<OAuthToken> {
        Ok(current.clone())
    }
}

/// Generic OAuth2 refresh-token-grant strategy parameterized by provider
/// wire shape; covers Google, Notion, Figma, GitHub, Stripe, Zendesk,
/// Canvas, and Peta — each differs only in where credentials go, the body
/// encoding, and the default expiry.
pub struct OAuthRefreshStrategy {
    auth_type: AuthType,
    config: OAuthClientConfig,
    shape: ProviderWireShape,
    http: reqwest::Client,
}

impl OAuthRefreshStrategy {
    #[must_use]
    pub fn new(auth_type: AuthType, config: OAuthClientConfig, shape: ProviderWireShape) -> Self {
        Self {
            auth_type,
            config,
            shape,
            http: reqwest::Client::new(),
        }
    }

    #[must_use]
    pub fn google(config: OAuthClientConfig) -> Self {
        Self::new(
            AuthType::Google,
            config,
            ProviderWireShape {
                credential_placement: CredentialPlacement::BodyParams,
                body_encoding: BodyEncoding::FormUrlEncoded,
                default_expiry_secs: 3600,
            },
        )
    }

    #[must_use]
    pub fn notion(config: OAuthClientConfig) -> Self {
        Self::new(
            AuthType::Notion,
            config,
            ProviderWireShape {
                credential_placement: CredentialPlacement::BasicAuthHeader,
                body_encoding: BodyEncoding::Json,
                // Notion access tokens don't expire in practice.
                default_expiry_secs: 0,
            },
        )
    }

    #[must_use]
    pub fn figma(config: OAuthClientConfig) -> Self {
        Self::new(
            AuthType::Figma,
            config,
            ProviderWireShape {
                credential_placement: CredentialPlacement::BasicAuthHeader,
                body_encoding: BodyEncoding::FormUrlEncoded,
                default_expiry_secs: 3600,
            },
        )
    }

    #[must_use]
    pub fn github(config: OAuthClientConfig) -> Self {
        Self::new(
            AuthType::GitHub,
            config,
            ProviderWireShape {
                credential_placement: CredentialPlacement::BodyParams,
                body_encoding: BodyEncoding::FormUrlEncoded,
                default_expiry_secs: 8 * 3600,
            },
        )
    }

    #[must_use]
    pub fn stripe(config: OAuthClientConfig) -> Self {
        Self::new(
            AuthType::Stripe,
            config,
            ProviderWireShape {
                credential_placement: CredentialPlacement::BasicAuthHeader,
                body_encoding: BodyEncoding::FormUrlEncoded,
                default_expiry_secs: 3600,
            },
        )
    }

    #[must_use]
    pub fn zendesk(config: OAuthClientConfig) -> Self {
        Self::new(
            AuthType::Zendesk,
            config,
            ProviderWireShape {
                credential_placement: CredentialPlacement::BodyParams,
                body_encoding: BodyEncoding::Json,
                default_expiry_secs: 3600,
            },
        )
    }

    #[must_use]
    pub fn canvas(config: OAuthClientConfig) -> Self {
        Self::new(
            AuthType::Canvas,
            config,
            ProviderWireShape {
                credential_placement: CredentialPlacement::BodyParams,
                body_encoding: BodyEncoding::Json,
                default_expiry_secs: 3600,
            },
        )
    }

    #[must_use]
    pub fn peta(config: OAuthClientConfig) -> Self {
        Self::new(
            AuthType::Peta,
            config,
            ProviderWireShape {
                credential_placement: CredentialPlacement::BasicAuthHeader,
                body_encoding: BodyEncoding::Json,
                default_expiry_secs: 3600,
            },
        )
    }

    /// Builds the request (method, headers, body) this strategy would
    /// send for a refresh-token grant, without executing it — used by
    /// unit tests asserting request-shape determinism (§8).
    pub(crate) fn build_refresh_request(&self, refresh_token: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.post(&self.config.token_url);

        let mut form = HashMap::new();
        form.insert("grant_type", "refresh_token");
        form.insert("refresh_token", refresh_token);

        match self.shape.credential_placement {
            CredentialPlacement::BasicAuthHeader => {
                builder = builder.basic_auth(
                    &self.config.client_id,
                    Some(self.config.client_secret.expose_secret()),
                );
            }
            CredentialPlacement::BodyParams => {
                form.insert("client_id", &self.config.client_id);
                form.insert("client_secret", self.config.client_secret.expose_secret());
            }
        }

        match self.shape.body_encoding {
            BodyEncoding::FormUrlEncoded => builder.form(&form),
            BodyEncoding::Json => builder.json(&form),
        }
    }
}

#[async_trait]
impl AuthStrategy for OAuthRefreshStrategy {
    fn auth_type(&self) -> AuthType {
        self.auth_type
    }

    async fn get_initial_token(&self, raw_token: SecretString) -> GatewayResult<OAuthToken> {
        Ok(OAuthToken {
            access_token: raw_token,
            refresh_token: None,
            expires_at: 0,
        })
    }

    async fn refresh_token(&self, current: &OAuthToken) -> GatewayResult<OAuthToken> {
        let now = now_unix_secs();
        if !current.needs_refresh(now) {
            return Ok(current.clone());
        }

        let Some(refresh_token) = &current.refresh_token else {
            return Err(GatewayError::Internal(format!(
                "{:?}: no refresh token available for an expiring access token",
                self.auth_type
            )));
        };

        let response = self
            .build_refresh_request(refresh_token.expose_secret())
            .send()
            .await
            .map_err(|e| GatewayError::ServerError(format!("{:?} token refresh: {e}", self.auth_type)))?;

        if !response.status().is_success() {
            return Err(GatewayError::ServerError(format!(
                "{:?} token refresh returned HTTP {}",
                self.auth_type,
                response.status()
            )));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::ServerError(format!("{:?} token refresh parse: {e}", self.auth_type)))?;

        let expires_in = parsed.expires_in.unwrap_or(self.shape.default_expiry_secs);
        Ok(OAuthToken {
            access_token: SecretString::from(parsed.access_token),
            refresh_token: parsed
                .refresh_token
                .map(SecretString::from)
                .or_else(|| current.refresh_token.clone()),
            expires_at: if expires_in == 0 { 0 } else { now + expires_in },
        })
    }
}

/// Builds the strategy for a given `AuthType`, given its OAuth client
/// config (ignored for `ApiKey`).
#[must_use]
pub fn strategy_for(auth_type: AuthType, config: Option<OAuthClientConfig>) -> Arc<dyn AuthStrategy> {
    match auth_type {
        AuthType::ApiKey => Arc::new(ApiKeyStrategy),
        AuthType::Google => Arc::new(OAuthRefreshStrategy::google(config.expect("google requires oauth config"))),
        AuthType::Notion => Arc::new(OAuthRefreshStrategy::notion(config.expect("notion requires oauth config"))),
        AuthType::Figma => Arc::new(OAuthRefreshStrategy::figma(config.expect("figma requires oauth config"))),
        AuthType::GitHub => Arc::new(OAuthRefreshStrategy::github(config.expect("github requires oauth config"))),
        AuthType::Stripe => Arc::new(OAuthRefreshStrategy::stripe(config.expect("stripe requires oauth config"))),
        AuthType::Zendesk => Arc::new(OAuthRefreshStrategy::zendesk(config.expect("zendesk requires oauth config"))),
        AuthType::Canvas => Arc::new(OAuthRefreshStrategy::canvas(config.expect("canvas requires oauth config"))),
        AuthType::Peta => Arc::new(OAuthRefreshStrategy::peta(config.expect("peta requires oauth config"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> OAuthClientConfig {
        OAuthClientConfig {
            token_url: "https://example.com/oauth/token".into(),
            client_id: "client-123".into(),
            client_secret: SecretString::from("secret-456".to_string()),
        }
    }

    #[test]
    fn token_not_near_expiry_skips_refresh() {
        let token = OAuthToken {
            access_token: SecretString::from("a".to_string()),
            refresh_token: None,
            expires_at: now_unix_secs() + 3600,
        };
        assert!(!token.needs_refresh(now_unix_secs()));
    }

    #[test]
    fn token_within_buffer_needs_refresh() {
        let token = OAuthToken {
            access_token: SecretString::from("a".to_string()),
            refresh_token: None,
            expires_at: now_unix_secs() + 60,
        };
        assert!(token.needs_refresh(now_unix_secs()));
    }

    #[test]
    fn never_expiring_token_never_needs_refresh() {
        let token = OAuthToken {
            access_token: SecretString::from("a".to_string()),
            refresh_token: None,
            expires_at: 0,
        };
        assert!(!token.needs_refresh(now_unix_secs()));
    }

    #[tokio::test]
    async fn api_key_strategy_never_changes_the_token() {
        let strategy = ApiKeyStrategy;
        let token = strategy
            .get_initial_token(SecretString::from("key-abc".to_string()))
            .await
            .unwrap();
        let refreshed = strategy.refresh_token(&token).await.unwrap();
        assert_eq!(
            refreshed.access_token.expose_secret(),
            token.access_token.expose_secret()
        );
    }

    #[test]
    fn google_places_credentials_in_body_as_form() {
        let strategy = OAuthRefreshStrategy::google(config());
        assert_eq!(strategy.shape.credential_placement, CredentialPlacement::BodyParams);
        assert_eq!(strategy.shape.body_encoding, BodyEncoding::FormUrlEncoded);
    }

    #[test]
    fn notion_uses_basic_auth_and_json_body() {
        let strategy = OAuthRefreshStrategy::notion(config());
        assert_eq!(strategy.shape.credential_placement, CredentialPlacement::BasicAuthHeader);
        assert_eq!(strategy.shape.body_encoding, BodyEncoding::Json);
    }

    #[test]
    fn each_provider_has_a_distinct_or_intentionally_shared_wire_shape() {
        let c = config();
        let shapes = [
            OAuthRefreshStrategy::google(c.clone()).shape.clone(),
            OAuthRefreshStrategy::github(c.clone()).shape.clone(),
            OAuthRefreshStrategy::stripe(c.clone()).shape.clone(),
            OAuthRefreshStrategy::zendesk(c.clone()).shape.clone(),
            OAuthRefreshStrategy::canvas(c.clone()).shape.clone(),
            OAuthRefreshStrategy::peta(c).shape.clone(),
        ];
        assert_eq!(shapes.len(), 6);
    }

    #[tokio::test]
    async fn refresh_without_refresh_token_on_expiring_access_token_fails() {
        let strategy = OAuthRefreshStrategy::google(config());
        let token = OAuthToken {
            access_token: SecretString::from("a".to_string()),
            refresh_token: None,
            expires_at: now_unix_secs() + 1,
        };
        let result = strategy.refresh_token(&token).await;
        assert!(result.is_err());
    }
}
