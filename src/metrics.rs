//! Engine metrics.
//!
//! Counters and gauges for processed/failed events, dispatch latency, active
//! viewer connections, and relay reachability. Everything is a plain atomic:
//! recording a metric cannot fail and never touches the data path.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Read-only counters and gauges for external monitoring.
pub struct Metrics {
    events_accepted: AtomicU64,
    events_failed: AtomicU64,
    dispatch_count: AtomicU64,
    dispatch_micros: AtomicU64,
    active_connections: AtomicU64,
    evictions: AtomicU64,
    relay_published: AtomicU64,
    relay_received: AtomicU64,
    relay_dropped: AtomicU64,
    relay_reachable: AtomicBool,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            events_accepted: AtomicU64::new(0),
            events_failed: AtomicU64::new(0),
            dispatch_count: AtomicU64::new(0),
            dispatch_micros: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            relay_published: AtomicU64::new(0),
            relay_received: AtomicU64::new(0),
            relay_dropped: AtomicU64::new(0),
            relay_reachable: AtomicBool::new(true),
            start_time: Instant::now(),
        }
    }

    /// An event was accepted by `publish`.
    pub fn event_accepted(&self) {
        self.events_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// A handler or broadcast attempt failed.
    pub fn event_failed(&self) {
        self.events_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one full dispatch (handlers + fan-out hand-off).
    pub fn dispatch_completed(&self, elapsed: Duration) {
        self.dispatch_count.fetch_add(1, Ordering::Relaxed);
        self.dispatch_micros
            .fetch_add(elapsed.as_micros().min(u128::from(u64::MAX)) as u64, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Saturating: a close observed without a matching open stays at zero.
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// A connection was evicted for backpressure or repeated send timeouts.
    pub fn connection_evicted(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn relay_published(&self) {
        self.relay_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn relay_received(&self) {
        self.relay_received.fetch_add(1, Ordering::Relaxed);
    }

    /// An event fell off the bounded relay buffer during an outage.
    pub fn relay_dropped(&self) {
        self.relay_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_relay_reachable(&self, reachable: bool) {
        self.relay_reachable.store(reachable, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn relay_reachable(&self) -> bool {
        self.relay_reachable.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Average dispatch latency in milliseconds.
    pub fn average_dispatch_ms(&self) -> f64 {
        let count = self.dispatch_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.dispatch_micros.load(Ordering::Relaxed) as f64 / count as f64 / 1000.0
    }

    /// JSON summary served on `/metrics` and attached to live-stats events.
    pub fn summary(&self) -> Value {
        json!({
            "events": {
                "accepted": self.events_accepted.load(Ordering::Relaxed),
                "failed": self.events_failed.load(Ordering::Relaxed),
                "averageDispatchMs": self.average_dispatch_ms(),
            },
            "connections": {
                "active": self.active_connections(),
                "evicted": self.evictions.load(Ordering::Relaxed),
            },
            "relay": {
                "reachable": self.relay_reachable(),
                "published": self.relay_published.load(Ordering::Relaxed),
                "received": self.relay_received.load(Ordering::Relaxed),
                "dropped": self.relay_dropped.load(Ordering::Relaxed),
            },
        })
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let m = Metrics::new();
        m.event_accepted();
        m.event_accepted();
        m.event_failed();

        let summary = m.summary();
        assert_eq!(summary["events"]["accepted"], 2);
        assert_eq!(summary["events"]["failed"], 1);
    }

    #[test]
    fn test_connection_gauge_never_underflows() {
        let m = Metrics::new();
        m.connection_closed();
        assert_eq!(m.active_connections(), 0);

        m.connection_opened();
        m.connection_opened();
        m.connection_closed();
        assert_eq!(m.active_connections(), 1);
    }

    #[test]
    fn test_dispatch_latency_average() {
        let m = Metrics::new();
        assert_eq!(m.average_dispatch_ms(), 0.0);

        m.dispatch_completed(Duration::from_millis(2));
        m.dispatch_completed(Duration::from_millis(4));
        let avg = m.average_dispatch_ms();
        assert!((avg - 3.0).abs() < 0.1, "average {avg} not near 3ms");
    }

    #[test]
    fn test_relay_reachability_gauge() {
        let m = Metrics::new();
        assert!(m.relay_reachable());
        m.set_relay_reachable(false);
        assert!(!m.relay_reachable());
        assert_eq!(m.summary()["relay"]["reachable"], false);
    }
}
