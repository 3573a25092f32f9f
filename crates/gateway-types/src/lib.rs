//! Core data model for the MCP gateway.
//!
//! This crate has no async runtime dependency and no I/O: it defines the
//! entities of the gateway's data model (§3), the JSON-RPC envelope shared
//! by every wire-touching crate, the permission/preference schema
//! validation rules, and the gateway-wide error taxonomy (§7).

pub mod entities;
pub mod error;
pub mod ids;
pub mod jsonrpc;
pub mod metrics;
pub mod schema;

pub use entities::*;
pub use error::{GatewayError, GatewayResult};
pub use ids::*;
pub use jsonrpc::{JsonRpcError, JsonRpcMessage};
pub use metrics::{GatewayMetrics, GatewayMetricsSnapshot, InProcessMetricsSink, MetricsSink, NoopMetricsSink};
