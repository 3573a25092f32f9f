//! Durable event storage (collaborator seam, §4.2).
//!
//! A real deployment backs this with a relational table keyed by
//! `eventId` carrying `createdAt`/`expiresAt`; the in-memory reference
//! implementation here is what tests and a from-scratch `cargo run` use,
//! modeled after the `EventStore` trait shape used across the MCP
//! ecosystem (store/replay/prune/count).

use async_trait::async_trait;
use gateway_types::Event;
use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Debug, Clone, thiserror::Error)]
#[error("durable store error: {0}")]
pub struct DurableStoreError(pub String);

#[async_trait]
pub trait DurableEventStore: Send + Sync {
    /// Persists one event. Failures are logged by the caller but never
    /// fail the originating RPC (§4.2 step 3).
    async fn persist(&self, event: Event) -> Result<(), DurableStoreError>;

    /// Returns events of `stream_id` with `created_at_millis` strictly
    /// greater than `after_millis`, in ascending append order.
    async fn events_after(
        &self,
        stream_id: &str,
        after_millis: u128,
    ) -> Result<Vec<Event>, DurableStoreError>;

    /// Returns every event of `stream_id` in ascending append order (used
    /// when `Last-Event-ID` is unknown: "all events of S are replayed").
    async fn all_events(&self, stream_id: &str) -> Result<Vec<Event>, DurableStoreError>;

    /// Deletes every event with `expires_at_millis < now_millis`. Run by
    /// the periodic cleanup job (§4.2).
    async fn delete_expired(&self, now_millis: u128) -> Result<u64, DurableStoreError>;

    async fn count(&self) -> usize;
}

/// Reference `DurableEventStore` implementation: an in-process ordered
/// map, keyed by `(stream_id, created_at_millis, event_id)` so lookups by
/// stream and time range stay sorted without external storage.
#[derive(Default)]
pub struct InMemoryDurableEventStore {
    // BTreeMap key: (stream_id, created_at_millis, event_id) -> Event
    events: Mutex<BTreeMap<(String, u128, String), Event>>,
}

impl InMemoryDurableEventStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableEventStore for InMemoryDurableEventStore {
    async fn persist(&self, event: Event) -> Result<(), DurableStoreError> {
        let key = (
            event.stream_id.clone(),
            event.created_at_millis,
            event.event_id.clone(),
        );
        self.events.lock().insert(key, event);
        Ok(())
    }

    async fn events_after(
        &self,
        stream_id: &str,
        after_millis: u128,
    ) -> Result<Vec<Event>, DurableStoreError> {
        let guard = self.events.lock();
        let start = (stream_id.to_string(), after_millis.saturating_add(1), String::new());
        let out = guard
            .range(start..)
            .take_while(|((sid, _, _), _)| sid == stream_id)
            .map(|(_, e)| e.clone())
            .collect();
        Ok(out)
    }

    async fn all_events(&self, stream_id: &str) -> Result<Vec<Event>, DurableStoreError> {
        let guard = self.events.lock();
        let start = (stream_id.to_string(), 0u128, String::new());
        let out = guard
            .range(start..)
            .take_while(|((sid, _, _), _)| sid == stream_id)
            .map(|(_, e)| e.clone())
            .collect();
        Ok(out)
    }

    async fn delete_expired(&self, now_millis: u128) -> Result<u64, DurableStoreError> {
        let mut guard = self.events.lock();
        let before = guard.len();
        guard.retain(|_, e| e.expires_at_millis >= now_millis);
        Ok((before - guard.len()) as u64)
    }

    async fn count(&self) -> usize {
        self.events.lock().len()
    }
}
