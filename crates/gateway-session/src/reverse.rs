//! Reverse-request dispatch (§4.3 "Reverse-request dispatch"): sampling,
//! roots, and elicitation requests a server asks the gateway to forward
//! to the client over the SSE stream.

use std::time::Duration;

use gateway_types::GatewayError;
use serde_json::Value;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReverseKind {
    Sampling,
    Roots,
    Elicitation,
}

impl ReverseKind {
    #[must_use]
    pub fn method(self) -> &'static str {
        match self {
            Self::Sampling => "sampling/createMessage",
            Self::Roots => "roots/list",
            Self::Elicitation => "elicitation/create",
        }
    }

    /// The client capability flag required to issue this kind of reverse
    /// request (§4.3 "client must advertise `roots` for roots, `sampling`
    /// for sampling, per-session flag for elicitation").
    #[must_use]
    pub fn requires_capability(self) -> &'static str {
        match self {
            Self::Sampling => "sampling",
            Self::Roots => "roots",
            Self::Elicitation => "elicitation",
        }
    }
}

/// Per-kind default timeouts (§4.3), overridable via configuration.
#[derive(Debug, Clone, Copy)]
pub struct ReverseTimeouts {
    pub sampling: Duration,
    pub roots: Duration,
    pub elicit: Duration,
}

impl Default for ReverseTimeouts {
    fn default() -> Self {
        Self {
            sampling: Duration::from_secs(60),
            roots: Duration::from_secs(10),
            elicit: Duration::from_secs(300),
        }
    }
}

impl ReverseTimeouts {
    #[must_use]
    pub fn for_kind(&self, kind: ReverseKind) -> Duration {
        match kind {
            ReverseKind::Sampling => self.sampling,
            ReverseKind::Roots => self.roots,
            ReverseKind::Elicitation => self.elicit,
        }
    }
}

/// What a pending reverse request resolves to: the client's JSON-RPC
/// `result`, or an error surfaced by the client.
#[derive(Debug, Clone)]
pub enum ReverseOutcome {
    Result(Value),
    Error { code: i64, message: String },
}

/// One in-flight reverse request: who asked (for logging), and the
/// channel its eventual outcome is delivered on.
pub(crate) struct PendingReverse {
    pub kind: ReverseKind,
    pub originating_server_request_id: Value,
    pub responder: oneshot::Sender<ReverseOutcome>,
}

/// Converts a [`ReverseOutcome`] (or a timeout/cancellation) into the
/// `GatewayResult<Value>` the caller (the Server Context awaiting this
/// reverse call) ultimately sees.
pub(crate) fn outcome_to_result(outcome: ReverseOutcome) -> Result<Value, GatewayError> {
    match outcome {
        ReverseOutcome::Result(v) => Ok(v),
        ReverseOutcome::Error { code, message } => {
            Err(GatewayError::ServerError(format!("{message} (code {code})")))
        }
    }
}
