//! Authorization-code exchange router (§4.4 "Authorization-code exchange
//! (initial setup only, collaborator)"): a single router dispatching to a
//! provider adapter by name, with a dynamic-URL capability for
//! instance-scoped providers (Zendesk, Canvas).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Failure classification the router reports back (§4.4): a request that
/// never reached the token endpoint, one that reached it but returned an
/// unparseable/non-success body, or an unknown provider name.
#[derive(Debug, Error)]
pub enum CodeExchangeError {
    #[error("http error contacting token endpoint: {0}")]
    Http(String),
    #[error("failed to parse token endpoint response: {0}")]
    Parse(String),
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}

#[derive(Debug, Clone)]
pub struct ExchangeResult {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub expires_in: Option<i64>,
    pub expires_at: Option<i64>,
    pub raw: Value,
}

/// Per-provider request-building logic for the authorization-code grant.
/// Implementors only describe *how to build the request*; the router
/// owns sending it and classifying failures.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fixed providers (Google, GitHub, ...) return their hardcoded token
    /// URL; instance-scoped providers (Zendesk, Canvas) require the
    /// caller to supply one via [`CodeExchangeRequest::token_url`].
    fn fixed_token_url(&self) -> Option<&str> {
        None
    }

    fn build_request(
        &self,
        http: &reqwest::Client,
        token_url: &str,
        request: &CodeExchangeRequest,
    ) -> reqwest::RequestBuilder;
}

#[derive(Debug, Clone)]
pub struct CodeExchangeRequest {
    pub code: String,
    pub redirect_uri: String,
    pub client_id: String,
    pub client_secret: SecretString,
    /// Required only for instance-scoped providers.
    pub token_url: Option<String>,
}

#[derive(Deserialize)]
struct RawTokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Generic form-encoded adapter covering the common shape (Google,
/// GitHub, Figma, Stripe, Peta): `client_id`/`client_secret`/`code`/
/// `redirect_uri`/`grant_type=authorization_code` as form params.
pub struct FormEncodedAdapter {
    name: &'static str,
    token_url: Option<&'static str>,
}

impl FormEncodedAdapter {
    #[must_use]
    pub fn fixed(name: &'static str, token_url: &'static str) -> Self {
        Self {
            name,
            token_url: Some(token_url),
        }
    }

    #[must_use]
    pub fn dynamic(name: &'static str) -> Self {
        Self { name, token_url: None }
    }
}

#[async_trait]
impl ProviderAdapter for FormEncodedAdapter {
    fn name(&self) -> &'static str {
        self.name
    }

    fn fixed_token_url(&self) -> Option<&str> {
        self.token_url
    }

    fn build_request(
        &self,
        http: &reqwest::Client,
        token_url: &str,
        request: &CodeExchangeRequest,
    ) -> reqwest::RequestBuilder {
        let mut form = HashMap::new();
        form.insert("grant_type", "authorization_code".to_string());
        form.insert("code", request.code.clone());
        form.insert("redirect_uri", request.redirect_uri.clone());
        form.insert("client_id", request.client_id.clone());
        form.insert("client_secret", request.client_secret.expose_secret().clone());
        http.post(token_url).form(&form)
    }
}

/// JSON-body adapter (Notion, Zendesk, Canvas): same fields, posted as a
/// JSON body instead of form-urlencoded.
pub struct JsonBodyAdapter {
    name: &'static str,
    token_url: Option<&'static str>,
}

impl JsonBodyAdapter {
    #[must_use]
    pub fn fixed(name: &'static str, token_url: &'static str) -> Self {
        Self {
            name,
            token_url: Some(token_url),
        }
    }

    #[must_use]
    pub fn dynamic(name: &'static str) -> Self {
        Self { name, token_url: None }
    }
}

#[async_trait]
impl ProviderAdapter for JsonBodyAdapter {
    fn name(&self) -> &'static str {
        self.name
    }

    fn fixed_token_url(&self) -> Option<&str> {
        self.token_url
    }

    fn build_request(
        &self,
        http: &reqwest::Client,
        token_url: &str,
        request: &CodeExchangeRequest,
    ) -> reqwest::RequestBuilder {
        let body = serde_json::json!({
            "grant_type": "authorization_code",
            "code": request.code,
            "redirect_uri": request.redirect_uri,
            "client_id": request.client_id,
            "client_secret": request.client_secret.expose_secret(),
        });
        http.post(token_url).json(&body)
    }
}

/// Dispatches by provider name to the right adapter, sends the request,
/// and classifies failures (§4.4 "classifies failures as `http | parse |
/// unknown_provider`").
pub struct CodeExchangeRouter {
    http: reqwest::Client,
    adapters: HashMap<&'static str, Arc<dyn ProviderAdapter>>,
}

impl CodeExchangeRouter {
    #[must_use]
    pub fn new() -> Self {
        let mut adapters: HashMap<&'static str, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert("google", Arc::new(FormEncodedAdapter::fixed("google", "https://oauth2.googleapis.com/token")));
        adapters.insert("github", Arc::new(FormEncodedAdapter::fixed("github", "https://github.com/login/oauth/access_token")));
        adapters.insert("figma", Arc::new(FormEncodedAdapter::fixed("figma", "https://www.figma.com/api/oauth/token")));
        adapters.insert("stripe", Arc::new(FormEncodedAdapter::fixed("stripe", "https://connect.stripe.com/oauth/token")));
        adapters.insert("peta", Arc::new(FormEncodedAdapter::fixed("peta", "https://api.peta.example/oauth/token")));
        adapters.insert("notion", Arc::new(JsonBodyAdapter::fixed("notion", "https://api.notion.com/v1/oauth/token")));
        // Instance-scoped: caller supplies `token_url` per tenant.
        adapters.insert("zendesk", Arc::new(JsonBodyAdapter::dynamic("zendesk")));
        adapters.insert("canvas", Arc::new(JsonBodyAdapter::dynamic("canvas")));
        Self {
            http: reqwest::Client::new(),
            adapters,
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.name(), adapter);
    }

    /// Performs the authorization-code exchange for `provider`.
    pub async fn exchange(
        &self,
        provider: &str,
        request: CodeExchangeRequest,
    ) -> Result<ExchangeResult, CodeExchangeError> {
        let adapter = self
            .adapters
            .get(provider)
            .ok_or_else(|| CodeExchangeError::UnknownProvider(provider.to_string()))?;

        let token_url = adapter
            .fixed_token_url()
            .map(str::to_string)
            .or_else(|| request.token_url.clone())
            .ok_or_else(|| {
                CodeExchangeError::Http(format!("{provider} requires a tokenUrl and none was supplied"))
            })?;

        let response = adapter
            .build_request(&self.http, &token_url, &request)
            .send()
            .await
            .map_err(|e| CodeExchangeError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CodeExchangeError::Http(format!("HTTP {}", response.status())));
        }

        let raw: Value = response
            .json()
            .await
            .map_err(|e| CodeExchangeError::Parse(e.to_string()))?;

        let parsed: RawTokenResponse =
            serde_json::from_value(raw.clone()).map_err(|e| CodeExchangeError::Parse(e.to_string()))?;

        let now = crate::auth_strategy::now_unix_secs();
        Ok(ExchangeResult {
            access_token: SecretString::from(parsed.access_token),
            refresh_token: parsed.refresh_token.map(SecretString::from),
            expires_in: parsed.expires_in,
            expires_at: parsed.expires_in.map(|secs| now + secs),
            raw,
        })
    }
}

impl Default for CodeExchangeRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CodeExchangeRequest {
        CodeExchangeRequest {
            code: "auth-code".into(),
            redirect_uri: "https://gateway.example/callback".into(),
            client_id: "client-1".into(),
            client_secret: SecretString::from("secret".to_string()),
            token_url: None,
        }
    }

    #[tokio::test]
    async fn unknown_provider_is_classified_correctly() {
        let router = CodeExchangeRouter::new();
        let err = router.exchange("not-a-real-provider", request()).await.unwrap_err();
        assert!(matches!(err, CodeExchangeError::UnknownProvider(_)));
    }

    #[tokio::test]
    async fn dynamic_provider_without_token_url_fails_with_http_classification() {
        let router = CodeExchangeRouter::new();
        let err = router.exchange("zendesk", request()).await.unwrap_err();
        assert!(matches!(err, CodeExchangeError::Http(_)));
    }

    #[test]
    fn fixed_providers_have_a_builtin_token_url() {
        let router = CodeExchangeRouter::new();
        assert!(router.adapters["google"].fixed_token_url().is_some());
        assert!(router.adapters["zendesk"].fixed_token_url().is_none());
    }
}
