//! Request routing for the MCP gateway: the forward path (§4.6,
//! client-to-server dispatch), the reverse path (§4.3/§4.6,
//! server-to-client sampling/roots/elicitation), and the broadcast path
//! (§4.6, server-originated `list_changed`/`resourceUpdated` fan-out).

pub mod broadcast;
pub mod forward;
pub mod reverse;

pub use broadcast::{BroadcastRouter, ListChangedKind};
pub use forward::{RequestKind, RequestRouter, DEFAULT_LOG_RESPONSE_MAX_LENGTH};
pub use reverse::{resolve_reverse_response, route_reverse_from_server, route_reverse_request};
