//! Gateway-wide error taxonomy (§7).
//!
//! Every layer maps a `GatewayError` to an HTTP status and a JSON-RPC error
//! code the same way, so the HTTP and JSON-RPC views of an error can never
//! disagree with each other.

use crate::jsonrpc::error_codes;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    // --- Client admission (§7 "Client admission") ---
    #[error("client ip not admitted")]
    IpNotAllowed,
    #[error("invalid token")]
    InvalidToken,
    #[error("user not found")]
    UserNotFound,
    #[error("user disabled")]
    UserDisabled,
    #[error("user expired")]
    UserExpired,
    #[error("invalid permissions: {0}")]
    InvalidPermissions(String),
    #[error("session expired")]
    SessionExpired,
    #[error("invalid session")]
    InvalidSession,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimitExceeded {
        retry_after_secs: u64,
        limit: u32,
        /// ISO 8601 timestamp of the next window reset (§4.1, §6).
        reset_at: String,
    },

    // --- Protocol (§7 "Protocol") ---
    #[error("missing session id")]
    MissingSessionId,
    #[error("unknown session")]
    UnknownSession,
    #[error("unsupported protocol version: {0}")]
    ProtocolVersionMismatch(String),
    #[error("malformed json-rpc: {0}")]
    MalformedJsonRpc(String),

    // --- Upstream (§7 "Upstream") ---
    #[error("server not found: {0}")]
    ServerNotFound(String),
    #[error("server offline: {0}")]
    ServerOffline(String),
    #[error("server error: {0}")]
    ServerError(String),
    #[error("reverse request timeout: {kind} exceeded {timeout_ms}ms")]
    ReverseRequestTimeout { kind: String, timeout_ms: u64 },

    // --- Internal (§7 "Internal") ---
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status the wire adapter should use for this error.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::IpNotAllowed => 403,
            GatewayError::InvalidToken => 401,
            GatewayError::UserDisabled | GatewayError::UserExpired => 403,
            GatewayError::UserNotFound => 403,
            GatewayError::InvalidPermissions(_) => 400,
            GatewayError::SessionExpired => 401,
            GatewayError::InvalidSession
            | GatewayError::MissingSessionId
            | GatewayError::UnknownSession
            | GatewayError::ProtocolVersionMismatch(_)
            | GatewayError::MalformedJsonRpc(_)
            | GatewayError::InvalidRequest(_) => 400,
            GatewayError::RateLimitExceeded { .. } => 429,
            GatewayError::ServerNotFound(_)
            | GatewayError::ServerOffline(_)
            | GatewayError::ServerError(_)
            | GatewayError::ReverseRequestTimeout { .. }
            | GatewayError::Internal(_) => 500,
        }
    }

    /// JSON-RPC error code this maps to when surfaced in a response body.
    #[must_use]
    pub fn json_rpc_code(&self) -> i64 {
        match self {
            GatewayError::InvalidRequest(_)
            | GatewayError::MissingSessionId
            | GatewayError::UnknownSession
            | GatewayError::ProtocolVersionMismatch(_)
            | GatewayError::MalformedJsonRpc(_)
            | GatewayError::InvalidSession
            | GatewayError::InvalidPermissions(_) => error_codes::INVALID_REQUEST,
            GatewayError::ServerNotFound(_) | GatewayError::ServerOffline(_) => {
                error_codes::METHOD_NOT_FOUND
            }
            GatewayError::ServerError(_)
            | GatewayError::ReverseRequestTimeout { .. }
            | GatewayError::Internal(_) => error_codes::INTERNAL_ERROR,
            _ => error_codes::CONNECTION_CLOSED,
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
