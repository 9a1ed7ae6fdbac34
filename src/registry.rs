//! Connection registry and broadcast fan-out.
//!
//! The [`ConnectionRegistry`] is the only resource on the hot path that is
//! mutated by multiple concurrent callers: the accept path inserts, the
//! fan-out reads, and evictions remove. It is constructed once at startup
//! and shared by `Arc`; there is no ambient global state.
//!
//! ## Connection lifecycle
//!
//! ```text
//! accept(sink)
//!   ├─ snapshot read fresh from the store ──► queued as the FIRST frame
//!   ├─ writer task spawned (exclusively owns the transport sink)
//!   └─ entry registered ──► visible to broadcast
//!
//! destroyed on: explicit disconnect | transport error |
//!               buffer overflow or repeated send timeouts (eviction)
//! ```
//!
//! ## Backpressure isolation
//!
//! `broadcast` serializes an event once and `try_send`s the frame into each
//! connection's bounded buffer. A viewer that cannot keep up fills its own
//! buffer and is evicted; it never delays delivery to other viewers and
//! never blocks a producer. Eviction aborts the writer task, cancelling any
//! in-flight send.

use crate::event::{SyncEvent, WireMessage};
use crate::metrics::Metrics;
use crate::store::{StoreError, StoreReader};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Identifier assigned to a connection at accept time.
pub type ConnectionId = u64;

/// Errors surfaced by a transport sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("transport closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),
}

/// Errors from the accept path.
#[derive(Debug, Error)]
pub enum AcceptError {
    /// The snapshot read against the authoritative store failed.
    #[error("snapshot read failed: {0}")]
    Snapshot(#[from] StoreError),

    #[error("snapshot serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Write half of a viewer transport.
///
/// Exclusively owned by the connection's writer task; no other component
/// ever holds the handle. The WebSocket write half is one implementation;
/// tests use a channel-backed one.
#[async_trait]
pub trait ViewerSink: Send + 'static {
    /// Sends one serialized frame.
    async fn send(&mut self, frame: &str) -> Result<(), SinkError>;

    /// Closes the transport. Best effort.
    async fn close(&mut self);
}

/// Tunables for the registry and fan-out.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Outbound frames buffered per connection before eviction.
    pub outbound_buffer: usize,
    /// Bound on a single transport send.
    pub send_timeout: Duration,
    /// Consecutive send timeouts tolerated before eviction.
    pub max_send_timeouts: u32,
    /// Leaderboard rows included in the connect snapshot.
    pub snapshot_limit: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: 64,
            send_timeout: Duration::from_secs(5),
            max_send_timeouts: 3,
            snapshot_limit: 10,
        }
    }
}

struct ConnectionEntry {
    outbound: mpsc::Sender<Arc<str>>,
    last_seen: Arc<Mutex<Instant>>,
    writer: JoinHandle<()>,
}

/// Concurrent set of live viewer connections, plus the broadcast fan-out.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
    next_id: AtomicU64,
    store: Arc<dyn StoreReader>,
    metrics: Arc<Metrics>,
    config: RegistryConfig,
}

impl ConnectionRegistry {
    pub fn new(store: Arc<dyn StoreReader>, metrics: Arc<Metrics>, config: RegistryConfig) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            store,
            metrics,
            config,
        }
    }

    /// Accepts a viewer transport: computes a fresh snapshot, queues it as
    /// the first outbound frame, spawns the writer task, and registers the
    /// connection. Events broadcast after registration are observed strictly
    /// after the snapshot, so a reconnecting viewer catches up without any
    /// history replay.
    pub async fn accept(self: &Arc<Self>, sink: Box<dyn ViewerSink>) -> Result<ConnectionId, AcceptError> {
        let snapshot = self.snapshot().await?;
        let frame: Arc<str> = serde_json::to_string(&snapshot)?.into();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel::<Arc<str>>(self.config.outbound_buffer.max(1));

        // Capacity is fresh; the snapshot always fits.
        let _ = tx.try_send(frame);

        let last_seen = Arc::new(Mutex::new(Instant::now()));
        let writer = tokio::spawn(Arc::clone(self).writer_loop(id, sink, rx, Arc::clone(&last_seen)));

        let entry = ConnectionEntry {
            outbound: tx,
            last_seen,
            writer,
        };
        self.connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, entry);

        self.metrics.connection_opened();
        info!(connection = id, "Viewer connected");
        Ok(id)
    }

    /// Current aggregate state, read fresh from the authoritative store.
    pub async fn snapshot(&self) -> Result<WireMessage, StoreError> {
        let leaderboard = self.store.leaderboard(self.config.snapshot_limit).await?;
        let live_stats = self.store.live_stats().await?;
        let trending = self.store.trending().await?;

        Ok(WireMessage::Snapshot {
            leaderboard: serde_json::to_value(leaderboard).unwrap_or_default(),
            live_stats: serde_json::to_value(live_stats).unwrap_or_default(),
            trending: serde_json::to_value(trending).unwrap_or_default(),
        })
    }

    /// Serializes `event` once and attempts delivery to every registered
    /// connection. Returns the number of connections the frame was queued
    /// for. Connections whose buffer is full are evicted; delivery to the
    /// rest is unaffected.
    pub fn broadcast(&self, event: &SyncEvent) -> usize {
        let frame: Arc<str> = match serde_json::to_string(&WireMessage::Event {
            event: event.clone(),
        }) {
            Ok(s) => s.into(),
            Err(e) => {
                warn!(error = %e, id = %event.id, "Failed to serialize event for broadcast");
                self.metrics.event_failed();
                return 0;
            }
        };

        // Clone the senders out so no lock is held while pushing frames or
        // evicting.
        let targets: Vec<(ConnectionId, mpsc::Sender<Arc<str>>)> = {
            let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
            connections
                .iter()
                .map(|(id, entry)| (*id, entry.outbound.clone()))
                .collect()
        };

        let mut queued = 0;
        for (id, tx) in targets {
            match tx.try_send(Arc::clone(&frame)) {
                Ok(()) => queued += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(connection = id, "Outbound buffer full, evicting slow viewer");
                    self.metrics.event_failed();
                    self.evict(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Writer already exited; sweep the stale entry.
                    self.remove_entry(id);
                }
            }
        }
        queued
    }

    /// Removes and destroys a connection. Safe to call concurrently with an
    /// in-flight broadcast; the writer task is aborted, cancelling any
    /// in-flight send.
    pub fn disconnect(&self, id: ConnectionId) {
        if let Some(entry) = self.remove_entry(id) {
            entry.writer.abort();
            info!(connection = id, "Viewer disconnected");
        }
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Marks inbound activity on a connection (client message, pong).
    pub fn touch(&self, id: ConnectionId) {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = connections.get(&id) {
            *entry.last_seen.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        }
    }

    /// Time since the connection last made progress, if it is still live.
    pub fn idle_for(&self, id: ConnectionId) -> Option<Duration> {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        connections
            .get(&id)
            .map(|entry| entry.last_seen.lock().unwrap_or_else(|e| e.into_inner()).elapsed())
    }

    fn evict(&self, id: ConnectionId) {
        if let Some(entry) = self.remove_entry(id) {
            entry.writer.abort();
            self.metrics.connection_evicted();
        }
    }

    fn remove_entry(&self, id: ConnectionId) -> Option<ConnectionEntry> {
        let removed = self
            .connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        if removed.is_some() {
            self.metrics.connection_closed();
        }
        removed
    }

    /// Drains frames to the transport in queue order. Exits on transport
    /// error, on channel close (disconnect/eviction), or after
    /// `max_send_timeouts` consecutive timeouts.
    async fn writer_loop(
        self: Arc<Self>,
        id: ConnectionId,
        mut sink: Box<dyn ViewerSink>,
        mut rx: mpsc::Receiver<Arc<str>>,
        last_seen: Arc<Mutex<Instant>>,
    ) {
        let mut strikes: u32 = 0;

        while let Some(frame) = rx.recv().await {
            match tokio::time::timeout(self.config.send_timeout, sink.send(&frame)).await {
                Ok(Ok(())) => {
                    strikes = 0;
                    *last_seen.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
                }
                Ok(Err(e)) => {
                    debug!(connection = id, error = %e, "Transport error, closing connection");
                    self.remove_entry(id);
                    break;
                }
                Err(_) => {
                    strikes += 1;
                    if strikes >= self.config.max_send_timeouts {
                        warn!(
                            connection = id,
                            strikes, "Repeated send timeouts, evicting viewer"
                        );
                        self.metrics.connection_evicted();
                        self.remove_entry(id);
                        break;
                    }
                }
            }
        }

        sink.close().await;
        // Covers the channel-closed exit; a second remove is a no-op.
        self.remove_entry(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::store::{LeaderboardEntry, LiveStats, MemoryStore};
    use serde_json::json;

    /// Sink that records frames and optionally stalls per send.
    struct TestSink {
        frames: mpsc::UnboundedSender<String>,
        delay: Duration,
    }

    #[async_trait]
    impl ViewerSink for TestSink {
        async fn send(&mut self, frame: &str) -> Result<(), SinkError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.frames
                .send(frame.to_string())
                .map_err(|_| SinkError::Closed)
        }

        async fn close(&mut self) {}
    }

    fn test_registry(config: RegistryConfig) -> Arc<ConnectionRegistry> {
        let store = Arc::new(MemoryStore::new());
        store.set_leaderboard(vec![LeaderboardEntry {
            rank: 1,
            submission_id: "sub-1".to_string(),
            title: "scene".to_string(),
            creator: "ada".to_string(),
            votes: 5,
        }]);
        store.set_live_stats(LiveStats {
            total_submissions: 1,
            total_votes: 5,
            active_challenges: 0,
        });
        Arc::new(ConnectionRegistry::new(store, Arc::new(Metrics::new()), config))
    }

    fn attach(
        registry: &Arc<ConnectionRegistry>,
        delay: Duration,
    ) -> (
        impl std::future::Future<Output = Result<ConnectionId, AcceptError>> + '_,
        mpsc::UnboundedReceiver<String>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Box::new(TestSink { frames: tx, delay });
        (registry.accept(sink), rx)
    }

    fn event(kind: EventKind, n: u64) -> SyncEvent {
        SyncEvent::new(kind, json!({"n": n}), "inst-test")
    }

    #[tokio::test]
    async fn test_snapshot_is_first_frame() {
        let registry = test_registry(RegistryConfig::default());
        let (accept, mut rx) = attach(&registry, Duration::ZERO);
        accept.await.unwrap();

        registry.broadcast(&event(EventKind::VoteCast, 1));

        let first = rx.recv().await.unwrap();
        assert!(first.contains("\"type\":\"snapshot\""), "got: {first}");
        assert!(first.contains("sub-1"));

        let second = rx.recv().await.unwrap();
        assert!(second.contains("\"type\":\"event\""));
        assert!(second.contains("vote_cast"));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_connections_in_order() {
        let registry = test_registry(RegistryConfig::default());
        let (accept_a, mut rx_a) = attach(&registry, Duration::ZERO);
        accept_a.await.unwrap();
        let (accept_b, mut rx_b) = attach(&registry, Duration::ZERO);
        accept_b.await.unwrap();

        for n in 0..5 {
            registry.broadcast(&event(EventKind::VoteCast, n));
        }

        for rx in [&mut rx_a, &mut rx_b] {
            let snapshot = rx.recv().await.unwrap();
            assert!(snapshot.contains("snapshot"));
            for n in 0..5 {
                let frame = rx.recv().await.unwrap();
                assert!(frame.contains(&format!("\"n\":{n}")), "frame: {frame}");
            }
        }
    }

    #[tokio::test]
    async fn test_slow_viewer_evicted_without_affecting_others() {
        let registry = test_registry(RegistryConfig {
            outbound_buffer: 2,
            send_timeout: Duration::from_millis(50),
            max_send_timeouts: 1,
            snapshot_limit: 10,
        });

        let (accept_slow, _rx_slow) = attach(&registry, Duration::from_secs(60));
        let slow_id = accept_slow.await.unwrap();
        let (accept_fast, mut rx_fast) = attach(&registry, Duration::ZERO);
        accept_fast.await.unwrap();
        assert_eq!(registry.len(), 2);

        // The slow sink stalls on the snapshot; these overflow its buffer.
        for n in 0..10 {
            registry.broadcast(&event(EventKind::VoteCast, n));
            tokio::task::yield_now().await;
        }

        // Give eviction a moment to land.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(registry.idle_for(slow_id).is_none(), "slow viewer still registered");
        assert_eq!(registry.len(), 1);

        // The fast viewer saw the snapshot plus everything broadcast.
        let snapshot = rx_fast.recv().await.unwrap();
        assert!(snapshot.contains("snapshot"));
        for n in 0..10 {
            let frame = rx_fast.recv().await.unwrap();
            assert!(frame.contains(&format!("\"n\":{n}")));
        }
    }

    #[tokio::test]
    async fn test_disconnect_is_safe_concurrently_with_broadcast() {
        let registry = test_registry(RegistryConfig::default());
        let (accept_a, _rx_a) = attach(&registry, Duration::ZERO);
        let a = accept_a.await.unwrap();
        let (accept_b, mut rx_b) = attach(&registry, Duration::ZERO);
        accept_b.await.unwrap();

        let broadcaster = Arc::clone(&registry);
        let handle = tokio::spawn(async move {
            for n in 0..50 {
                broadcaster.broadcast(&event(EventKind::VoteCast, n));
                tokio::task::yield_now().await;
            }
        });

        registry.disconnect(a);
        handle.await.unwrap();

        assert_eq!(registry.len(), 1);
        // Survivor still receives frames.
        let first = rx_b.recv().await.unwrap();
        assert!(first.contains("snapshot"));
        assert!(rx_b.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_touch_updates_idle_time() {
        let registry = test_registry(RegistryConfig::default());
        let (accept, _rx) = attach(&registry, Duration::ZERO);
        let id = accept.await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.touch(id);
        let idle = registry.idle_for(id).unwrap();
        assert!(idle < Duration::from_millis(25), "idle: {idle:?}");
    }
}
