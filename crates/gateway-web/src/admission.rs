//! Admission pipeline (§4.1): the three chained operations every `/mcp`
//! and control-plane request passes through before reaching the core —
//! IP admission, bearer-token validation, and per-user rate limiting.

use std::net::IpAddr;

use axum::http::HeaderMap;
use gateway_admission::RateLimitDecision;
use gateway_types::{new_uniform_request_id, AuthContext, GatewayError, GatewayResult, LogAction, LogEntry};

use crate::state::AppState;

pub struct Admitted {
    pub auth: AuthContext,
    pub rate_limit: RateLimitDecision,
}

fn bearer_token(headers: &HeaderMap) -> GatewayResult<&str> {
    let raw = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(GatewayError::InvalidToken)?;
    raw.strip_prefix("Bearer ").ok_or(GatewayError::InvalidToken)
}

/// Runs `admitIP -> authenticate -> checkRate` in order (§4.1 contract),
/// short-circuiting on the first failure.
pub async fn admit(state: &AppState, client_ip: IpAddr, headers: &HeaderMap) -> GatewayResult<Admitted> {
    if !state.ip_whitelist.admit(client_ip).await {
        return Err(GatewayError::IpNotAllowed);
    }

    let token = bearer_token(headers)?;
    let auth = state.tokens.authenticate(token).await?;

    let decision = state.rate_limiter.check(&auth.user_id, auth.rate_limit).await;
    if let RateLimitDecision::Deny { retry_after_secs, reset_at } = decision {
        log_rate_limit_deny(state, &auth, client_ip, retry_after_secs);
        return Err(GatewayError::RateLimitExceeded {
            retry_after_secs,
            limit: auth.rate_limit,
            reset_at,
        });
    }

    Ok(Admitted { auth, rate_limit: decision })
}

/// `AuthRateLimit` audit entry (§4.1 "On deny ... append an `AuthRateLimit`
/// log").
fn log_rate_limit_deny(state: &AppState, auth: &AuthContext, client_ip: IpAddr, retry_after_secs: u64) {
    let Some(logs) = &state.logs else { return };
    logs.enqueue(LogEntry {
        action: LogAction::AuthRateLimit,
        user_id: Some(auth.user_id.clone()),
        server_id: None,
        session_id: None,
        upstream_request_id: None,
        uniform_request_id: new_uniform_request_id(&auth.user_id),
        parent_uniform_request_id: None,
        ip: client_ip.to_string(),
        user_agent: None,
        token_mask: auth.token_mask.clone(),
        request_params: None,
        response_result: None,
        error: Some(format!("rate limit exceeded, retry after {retry_after_secs}s")),
        duration_ms: 0,
        status_code: 429,
    });
}
