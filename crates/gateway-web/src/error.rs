//! Error envelope rendering (§6 "Error envelopes", §7).
//!
//! Every failure surfaced over `/mcp` is rendered as a JSON-RPC error
//! object with the HTTP status `GatewayError::http_status()` prescribes,
//! so the HTTP and JSON-RPC views of a failure can never disagree.

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use gateway_admission::{www_authenticate_invalid_token, RateLimitDecision};
use gateway_types::{GatewayError, JsonRpcMessage};
use serde_json::Value;

/// Wraps a [`GatewayError`] with the context its HTTP rendering needs:
/// the base URL for `WWW-Authenticate`'s `resource_metadata` link, and
/// the request id to echo (`Value::Null` before one is known).
pub struct ApiError {
    pub error: GatewayError,
    pub base_url: String,
    pub request_id: Value,
}

impl ApiError {
    #[must_use]
    pub fn new(error: GatewayError, base_url: impl Into<String>) -> Self {
        Self {
            error,
            base_url: base_url.into(),
            request_id: Value::Null,
        }
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: Value) -> Self {
        self.request_id = request_id;
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = JsonRpcMessage::error_response(self.request_id, self.error.json_rpc_code(), self.error.to_string());

        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            if let Ok(value) = HeaderValue::from_str(&www_authenticate_invalid_token(&self.base_url, "mcp-gateway")) {
                response.headers_mut().insert(axum::http::header::WWW_AUTHENTICATE, value);
            }
        }
        if let GatewayError::RateLimitExceeded { retry_after_secs, limit, reset_at } = &self.error {
            // §4.1 "On deny, respond HTTP 429 with X-RateLimit-Limit,
            // X-RateLimit-Remaining, X-RateLimit-Reset ... and Retry-After";
            // `admit` short-circuits before `apply_rate_limit_headers` below
            // ever runs for a denied request, so the full set is applied here.
            if let Ok(v) = HeaderValue::from_str(&limit.to_string()) {
                response.headers_mut().insert("X-RateLimit-Limit", v);
            }
            response.headers_mut().insert("X-RateLimit-Remaining", HeaderValue::from_static("0"));
            if let Ok(v) = HeaderValue::from_str(reset_at) {
                response.headers_mut().insert("X-RateLimit-Reset", v);
            }
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

/// Applies `X-RateLimit-*` headers to a response, per §6.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, limit: u32, decision: &RateLimitDecision) {
    if let Ok(v) = HeaderValue::from_str(&limit.to_string()) {
        headers.insert("X-RateLimit-Limit", v);
    }
    match decision {
        RateLimitDecision::Allow { remaining, reset_at } => {
            if let Ok(v) = HeaderValue::from_str(&remaining.to_string()) {
                headers.insert("X-RateLimit-Remaining", v);
            }
            if let Ok(v) = HeaderValue::from_str(reset_at) {
                headers.insert("X-RateLimit-Reset", v);
            }
        }
        RateLimitDecision::Deny { retry_after_secs, reset_at } => {
            headers.insert("X-RateLimit-Remaining", HeaderValue::from_static("0"));
            if let Ok(v) = HeaderValue::from_str(reset_at) {
                headers.insert("X-RateLimit-Reset", v);
            }
            if let Ok(v) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                headers.insert("Retry-After", v);
            }
        }
    }
}
