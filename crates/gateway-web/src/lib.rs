//! axum wire adapters for the MCP gateway (§6): `/mcp` (POST/GET/DELETE),
//! the control-plane WebSocket, well-known OAuth metadata, and the
//! admission pipeline every one of them runs through first.

pub mod admission;
pub mod control_plane;
pub mod error;
pub mod mcp;
pub mod router;
pub mod state;
pub mod wellknown;

pub use error::ApiError;
pub use router::build_router;
pub use state::{AppState, ReverseTimeoutConfig};
