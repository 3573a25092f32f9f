//! Metrics hook **[NEW]** (§2 "Ambient stack"): lock-free counters plus a
//! `MetricsSink` seam so a future exporter can be wired into `AppContext`
//! without touching call sites. Grounded in `turbomcp-proxy`'s
//! `AtomicMetrics`/`ProxyMetrics` pair, generalized from "proxy forwarding"
//! to the gateway's forward/reverse/broadcast paths.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Lock-free counters updated from any wire-adapter or router call site.
/// Each field is read/written independently; a snapshot is therefore
/// consistent per-field, not a single atomic transaction.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    pub forwards_succeeded: AtomicU64,
    pub forwards_failed: AtomicU64,
    pub reverse_requests_sent: AtomicU64,
    pub reverse_requests_resolved: AtomicU64,
    pub reverse_requests_timed_out: AtomicU64,
    pub broadcast_events_sent: AtomicU64,
    pub active_sessions: AtomicU64,
    avg_forward_latency_us: AtomicU64,
}

impl GatewayMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates the forward-call latency EMA (90% prior weight), the same
    /// smoothing the teacher's proxy metrics use.
    pub fn record_forward_latency_us(&self, latency_us: u64) {
        let current = self.avg_forward_latency_us.load(Ordering::Relaxed);
        let new_avg = if current == 0 {
            latency_us
        } else {
            current.saturating_mul(9).saturating_add(latency_us) / 10
        };
        self.avg_forward_latency_us.store(new_avg, Ordering::Relaxed);
    }

    pub fn inc_forwards_succeeded(&self) {
        self.forwards_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_forwards_failed(&self) {
        self.forwards_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reverse_requests_sent(&self) {
        self.reverse_requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reverse_requests_resolved(&self) {
        self.reverse_requests_resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reverse_requests_timed_out(&self) {
        self.reverse_requests_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_broadcast_events_sent(&self) {
        self.broadcast_events_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_active_sessions(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_active_sessions(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> GatewayMetricsSnapshot {
        GatewayMetricsSnapshot {
            forwards_succeeded: self.forwards_succeeded.load(Ordering::Relaxed),
            forwards_failed: self.forwards_failed.load(Ordering::Relaxed),
            reverse_requests_sent: self.reverse_requests_sent.load(Ordering::Relaxed),
            reverse_requests_resolved: self.reverse_requests_resolved.load(Ordering::Relaxed),
            reverse_requests_timed_out: self.reverse_requests_timed_out.load(Ordering::Relaxed),
            broadcast_events_sent: self.broadcast_events_sent.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            avg_forward_latency_ms: self.avg_forward_latency_us.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }
}

/// Point-in-time, serializable view of [`GatewayMetrics`], suitable for a
/// `/metrics`-style JSON endpoint or an export task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayMetricsSnapshot {
    pub forwards_succeeded: u64,
    pub forwards_failed: u64,
    pub reverse_requests_sent: u64,
    pub reverse_requests_resolved: u64,
    pub reverse_requests_timed_out: u64,
    pub broadcast_events_sent: u64,
    pub active_sessions: u64,
    pub avg_forward_latency_ms: f64,
}

impl GatewayMetricsSnapshot {
    #[must_use]
    pub fn forward_success_rate(&self) -> Option<f64> {
        let total = self.forwards_succeeded + self.forwards_failed;
        if total == 0 {
            None
        } else {
            Some((self.forwards_succeeded as f64 / total as f64) * 100.0)
        }
    }
}

/// Observer seam threaded through `AppContext`: every wire-adapter and
/// router call site reports through this trait instead of reaching into
/// `GatewayMetrics` directly, so an exporter (Prometheus, StatsD, ...) can
/// be substituted without touching those call sites.
pub trait MetricsSink: Send + Sync {
    fn record_forward(&self, success: bool, latency_us: u64);
    fn record_reverse_sent(&self);
    fn record_reverse_resolved(&self);
    fn record_reverse_timed_out(&self);
    fn record_broadcast(&self);
    fn session_opened(&self);
    fn session_closed(&self);
}

/// Default sink: records into an in-process [`GatewayMetrics`] with no
/// external export. Good enough until a real exporter is wired in.
#[derive(Debug, Default)]
pub struct InProcessMetricsSink {
    metrics: GatewayMetrics,
}

impl InProcessMetricsSink {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn snapshot(&self) -> GatewayMetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl MetricsSink for InProcessMetricsSink {
    fn record_forward(&self, success: bool, latency_us: u64) {
        if success {
            self.metrics.inc_forwards_succeeded();
        } else {
            self.metrics.inc_forwards_failed();
        }
        self.metrics.record_forward_latency_us(latency_us);
    }

    fn record_reverse_sent(&self) {
        self.metrics.inc_reverse_requests_sent();
    }

    fn record_reverse_resolved(&self) {
        self.metrics.inc_reverse_requests_resolved();
    }

    fn record_reverse_timed_out(&self) {
        self.metrics.inc_reverse_requests_timed_out();
    }

    fn record_broadcast(&self) {
        self.metrics.inc_broadcast_events_sent();
    }

    fn session_opened(&self) {
        self.metrics.inc_active_sessions();
    }

    fn session_closed(&self) {
        self.metrics.dec_active_sessions();
    }
}

/// No-op sink: the `AppContext` default until an exporter is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn record_forward(&self, _success: bool, _latency_us: u64) {}
    fn record_reverse_sent(&self) {}
    fn record_reverse_resolved(&self) {}
    fn record_reverse_timed_out(&self) {}
    fn record_broadcast(&self) {}
    fn session_opened(&self) {}
    fn session_closed(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_starts_at_zero() {
        let metrics = GatewayMetrics::new();
        let snap = metrics.snapshot();
        assert_eq!(snap.forwards_succeeded, 0);
        assert_eq!(snap.forward_success_rate(), None);
    }

    #[test]
    fn forward_counters_and_success_rate() {
        let metrics = GatewayMetrics::new();
        metrics.inc_forwards_succeeded();
        metrics.inc_forwards_succeeded();
        metrics.inc_forwards_failed();
        let snap = metrics.snapshot();
        assert_eq!(snap.forwards_succeeded, 2);
        assert_eq!(snap.forwards_failed, 1);
        assert_eq!(snap.forward_success_rate(), Some(200.0 / 3.0));
    }

    #[test]
    fn latency_ema_matches_teacher_weighting() {
        let metrics = GatewayMetrics::new();
        metrics.record_forward_latency_us(1000);
        assert_eq!(metrics.snapshot().avg_forward_latency_ms, 1.0);
        metrics.record_forward_latency_us(2000);
        assert_eq!(metrics.snapshot().avg_forward_latency_ms, 1.1);
    }

    #[test]
    fn in_process_sink_feeds_snapshot() {
        let sink = InProcessMetricsSink::new();
        sink.record_forward(true, 500);
        sink.session_opened();
        sink.session_opened();
        sink.session_closed();
        let snap = sink.snapshot();
        assert_eq!(snap.forwards_succeeded, 1);
        assert_eq!(snap.active_sessions, 1);
    }

    #[test]
    fn noop_sink_is_inert() {
        let sink = NoopMetricsSink;
        sink.record_forward(true, 1);
        sink.record_reverse_sent();
        sink.record_broadcast();
    }
}
