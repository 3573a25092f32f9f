//! The `EventStore` façade (§4.2): an in-memory per-stream cache with
//! per-stream and total LRU caps, backed by a durable store used for SSE
//! replay after reconnect.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use gateway_types::{new_event_id, now_millis, parse_event_id, stream_id_of, Event};
use tracing::{error, warn};

use crate::durable::DurableEventStore;

#[derive(Debug, Clone)]
pub struct EventStoreConfig {
    /// Max cached events per stream before the smallest is evicted.
    pub max_stream_events: usize,
    /// Max cached events overall before the LRU stream is trimmed.
    pub max_cache_size: usize,
    /// Default TTL for persisted events.
    pub retention_days: u64,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            max_stream_events: 1_000,
            max_cache_size: 10_000,
            retention_days: 7,
        }
    }
}

/// One stream's cached tail: events kept in append order, smallest
/// (oldest) evicted first on per-stream overflow.
#[derive(Default)]
struct StreamCache {
    events: VecDeque<Event>,
}

pub struct EventStore {
    config: EventStoreConfig,
    durable: Arc<dyn DurableEventStore>,
    cache: DashMap<String, StreamCache>,
    /// Approximate total cached event count, used to decide when to evict
    /// the globally-oldest stream entry on total overflow.
    total_cached: std::sync::atomic::AtomicUsize,
}

impl EventStore {
    #[must_use]
    pub fn new(durable: Arc<dyn DurableEventStore>, config: EventStoreConfig) -> Self {
        Self {
            config,
            durable,
            cache: DashMap::new(),
            total_cached: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// `storeEvent(streamId, message)` (§4.2 steps 1-3).
    ///
    /// Persistence failures are logged but never propagated — the caller
    /// (the request/broadcast path) must still succeed.
    pub async fn store_event(&self, stream_id: &str, message_type: &str, message_data: &str) -> Event {
        let event_id = new_event_id(stream_id);
        let created_at_millis = now_millis();
        let expires_at_millis = created_at_millis + self.config.retention_days as u128 * 24 * 60 * 60 * 1000;

        let event = Event {
            event_id,
            stream_id: stream_id.to_string(),
            session_id: stream_id.to_string(),
            message_type: message_type.to_string(),
            message_data: message_data.to_string(),
            created_at_millis,
            expires_at_millis,
        };

        self.insert_into_cache(event.clone());

        if let Err(err) = self.durable.persist(event.clone()).await {
            error!(error = %err, stream_id, "failed to persist event to durable store");
        }

        event
    }

    fn insert_into_cache(&self, event: Event) {
        let stream_id = event.stream_id.clone();
        {
            let mut entry = self.cache.entry(stream_id.clone()).or_default();
            entry.events.push_back(event);
            if entry.events.len() > self.config.max_stream_events {
                entry.events.pop_front();
            } else {
                self.total_cached
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        }

        if self.total_cached.load(std::sync::atomic::Ordering::Relaxed) > self.config.max_cache_size {
            self.evict_lru_stream();
        }
    }

    /// Evicts the oldest event of the stream whose oldest cached event is
    /// globally the least recent (an approximation of a global LRU using
    /// per-stream queues, avoiding a second global index).
    fn evict_lru_stream(&self) {
        let mut oldest: Option<(String, u128)> = None;
        for entry in self.cache.iter() {
            if let Some(front) = entry.value().events.front() {
                match &oldest {
                    Some((_, ts)) if *ts <= front.created_at_millis => {}
                    _ => oldest = Some((entry.key().clone(), front.created_at_millis)),
                }
            }
        }
        if let Some((stream_id, _)) = oldest {
            if let Some(mut entry) = self.cache.get_mut(&stream_id) {
                if entry.events.pop_front().is_some() {
                    self.total_cached
                        .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
                }
            }
        }
    }

    /// `replayAfter(lastEventId, send)` (§4.2).
    ///
    /// Reads from the durable store (the cache is only an acceleration
    /// layer for the live tail) so replay always sees everything, even
    /// events evicted from cache. Decode failures of individual rows are
    /// skipped and logged, never abort the whole replay.
    pub async fn replay_after<F: FnMut(&Event)>(&self, last_event_id: Option<&str>, mut send: F) {
        let events = match last_event_id {
            None => return,
            Some(id) => match parse_event_id(id) {
                Some(parsed) => self
                    .durable
                    .events_after(&parsed.stream_id, parsed.created_at_millis)
                    .await,
                None => {
                    // Unknown/garbled id: fall back to full replay of its
                    // apparent stream prefix, per "if the id is unknown,
                    // all events of S are replayed".
                    let stream_id = stream_id_of(id);
                    self.durable.all_events(stream_id).await
                }
            },
        };

        match events {
            Ok(events) => {
                for event in events {
                    send(&event);
                }
            }
            Err(err) => {
                warn!(error = %err, "replay failed to read from durable store");
            }
        }
    }

    /// Replays every event of `stream_id` (used when a GET /mcp carries
    /// no `Last-Event-ID` header at all is *not* replay — this helper is
    /// for the "unknown id" branch and for tests).
    pub async fn replay_all<F: FnMut(&Event)>(&self, stream_id: &str, mut send: F) {
        match self.durable.all_events(stream_id).await {
            Ok(events) => events.iter().for_each(|e| send(e)),
            Err(err) => warn!(error = %err, stream_id, "full replay failed"),
        }
    }

    /// Periodic GC (§4.2 "A periodic cleanup job deletes expired events
    /// every 24 hours").
    pub async fn cleanup_expired(&self) -> u64 {
        match self.durable.delete_expired(now_millis()).await {
            Ok(n) => n,
            Err(err) => {
                error!(error = %err, "event store cleanup failed");
                0
            }
        }
    }

    /// Drops a stream's cache entirely (used on session close).
    pub fn release_stream_cache(&self, stream_id: &str) {
        if let Some((_, cache)) = self.cache.remove(stream_id) {
            self.total_cached
                .fetch_sub(cache.events.len(), std::sync::atomic::Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn cached_len(&self, stream_id: &str) -> usize {
        self.cache.get(stream_id).map(|e| e.events.len()).unwrap_or(0)
    }
}

/// Groups parsed event ids by stream, used by tests asserting ordering.
#[must_use]
pub fn group_by_stream(events: &[Event]) -> BTreeMap<String, Vec<Event>> {
    let mut out: BTreeMap<String, Vec<Event>> = BTreeMap::new();
    for e in events {
        out.entry(e.stream_id.clone()).or_default().push(e.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::InMemoryDurableEventStore;

    fn store() -> EventStore {
        EventStore::new(Arc::new(InMemoryDurableEventStore::new()), EventStoreConfig::default())
    }

    #[tokio::test]
    async fn replay_after_known_id_yields_strictly_newer_events() {
        let store = store();
        let e1 = store.store_event("s1", "response", "{\"a\":1}").await;
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let _e2 = store.store_event("s1", "response", "{\"a\":2}").await;
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let _e3 = store.store_event("s1", "response", "{\"a\":3}").await;

        let mut replayed = Vec::new();
        store
            .replay_after(Some(&e1.event_id), |e| replayed.push(e.clone()))
            .await;
        assert_eq!(replayed.len(), 2);
        assert!(replayed.iter().all(|e| e.created_at_millis > e1.created_at_millis));
    }

    #[tokio::test]
    async fn replay_after_unknown_id_replays_whole_stream() {
        let store = store();
        store.store_event("s1", "response", "{}").await;
        store.store_event("s1", "response", "{}").await;

        let mut replayed = Vec::new();
        store
            .replay_after(Some("s1_0_zzzz"), |e| replayed.push(e.clone()))
            .await;
        // s1_0_zzzz parses fine (stream s1, ts 0) so this exercises the
        // "known id, ts before everything" branch: same result as full replay.
        assert_eq!(replayed.len(), 2);
    }

    #[tokio::test]
    async fn per_stream_cache_cap_evicts_oldest() {
        let mut config = EventStoreConfig::default();
        config.max_stream_events = 2;
        let store = EventStore::new(Arc::new(InMemoryDurableEventStore::new()), config);
        store.store_event("s1", "response", "{}").await;
        store.store_event("s1", "response", "{}").await;
        store.store_event("s1", "response", "{}").await;
        assert_eq!(store.cached_len("s1"), 2);
    }

    #[tokio::test]
    async fn release_stream_cache_drops_entry() {
        let store = store();
        store.store_event("s1", "response", "{}").await;
        assert_eq!(store.cached_len("s1"), 1);
        store.release_stream_cache("s1");
        assert_eq!(store.cached_len("s1"), 0);
    }
}
