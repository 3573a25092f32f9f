//! Well-known OAuth metadata endpoints (§6): RFC 8414 authorization
//! server metadata and RFC 9728 protected resource metadata.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /.well-known/oauth-authorization-server` (RFC 8414).
pub async fn oauth_authorization_server(State(state): State<AppState>) -> Json<Value> {
    let base = &state.base_url;
    Json(json!({
        "issuer": base,
        "authorization_endpoint": format!("{base}/authorize"),
        "token_endpoint": format!("{base}/token"),
        "registration_endpoint": format!("{base}/register"),
        "revocation_endpoint": format!("{base}/revoke"),
        "introspection_endpoint": format!("{base}/introspect"),
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code", "refresh_token"],
        "token_endpoint_auth_methods_supported": ["client_secret_basic", "client_secret_post", "none"],
        "code_challenge_methods_supported": ["S256", "plain"],
        "client_id_metadata_document_supported": true,
        "scopes_supported": ["mcp:tools", "mcp:resources", "mcp:prompts"],
    }))
}

fn protected_resource_document(base: &str, resource: &str) -> Value {
    json!({
        "resource": resource,
        "authorization_servers": [base],
        "bearer_methods_supported": ["header"],
        "scopes_supported": ["mcp:tools", "mcp:resources", "mcp:prompts"],
    })
}

/// `GET /.well-known/oauth-protected-resource` (RFC 9728).
pub async fn oauth_protected_resource(State(state): State<AppState>) -> Json<Value> {
    Json(protected_resource_document(&state.base_url, &state.base_url))
}

/// `GET /.well-known/oauth-protected-resource/mcp` (RFC 9728, scoped to
/// the `/mcp` resource specifically).
pub async fn oauth_protected_resource_mcp(State(state): State<AppState>) -> Json<Value> {
    let resource = format!("{}/mcp", state.base_url);
    Json(protected_resource_document(&state.base_url, &resource))
}
