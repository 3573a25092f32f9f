//! Per-user fixed-window rate limiting (§4.1 "Rate limiting").
//!
//! Fixed 60s window per user; counters live in a `DashMap` keyed by
//! userId; a sweep clears entries idle for more than two windows every
//! 5 minutes.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const WINDOW: Duration = Duration::from_secs(60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const SWEEP_IDLE_WINDOWS: u32 = 2;

#[derive(Debug, Clone)]
struct Counter {
    window_start: Instant,
    count: u32,
    last_seen: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// `reset_at` is the window boundary rendered as ISO 8601 (§4.1, §6
    /// `X-RateLimit-Reset`).
    Allow { remaining: u32, reset_at: String },
    Deny { retry_after_secs: u64, reset_at: String },
}

pub struct RateLimiter {
    counters: DashMap<String, Counter>,
    last_sweep: Mutex<Instant>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// `checkRate(userId, limit) -> {allow, remaining, resetAt} | {deny,
    /// retryAfter}` (§4.1).
    pub async fn check(&self, user_id: &str, limit: u32) -> RateLimitDecision {
        self.maybe_sweep().await;

        let now = Instant::now();
        let mut entry = self
            .counters
            .entry(user_id.to_string())
            .or_insert_with(|| Counter {
                window_start: now,
                count: 0,
                last_seen: now,
            });

        if now.duration_since(entry.window_start) >= WINDOW {
            entry.window_start = now;
            entry.count = 0;
        }
        entry.last_seen = now;

        let remaining_in_window = WINDOW.saturating_sub(now.duration_since(entry.window_start));

        if entry.count >= limit {
            let retry_after_secs = remaining_in_window.as_secs().max(1);
            return RateLimitDecision::Deny {
                retry_after_secs,
                reset_at: reset_at_iso(remaining_in_window),
            };
        }

        entry.count += 1;
        let remaining = limit - entry.count;
        RateLimitDecision::Allow {
            remaining,
            reset_at: reset_at_iso(remaining_in_window),
        }
    }

    async fn maybe_sweep(&self) {
        let mut last_sweep = self.last_sweep.lock().await;
        let now = Instant::now();
        if now.duration_since(*last_sweep) < SWEEP_INTERVAL {
            return;
        }
        *last_sweep = now;
        let idle_threshold = WINDOW * SWEEP_IDLE_WINDOWS;
        self.counters
            .retain(|_, counter| now.duration_since(counter.last_seen) < idle_threshold);
    }
}

/// Renders "now + `remaining_in_window`" as ISO 8601 (§4.1, §6
/// `X-RateLimit-Reset`).
fn reset_at_iso(remaining_in_window: Duration) -> String {
    let offset = chrono::Duration::milliseconds(remaining_in_window.as_millis() as i64);
    (chrono::Utc::now() + offset).to_rfc3339()
}

/// Shared handle type used by the admission pipeline and by the wire
/// adapter when formatting `X-RateLimit-*` / `Retry-After` headers.
pub type SharedRateLimiter = Arc<RateLimiter>;
