//! Event Store (§4.2): per-stream append-only log of JSON-RPC messages,
//! used for SSE replay after reconnect. Also houses the audit log queue
//! (§5 "The log queue is multi-producer, single-consumer").

pub mod durable;
pub mod event_store;
pub mod log_queue;

pub use durable::{DurableEventStore, InMemoryDurableEventStore};
pub use event_store::{EventStore, EventStoreConfig};
pub use log_queue::{LogQueue, LogSink};
