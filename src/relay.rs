//! Cross-instance relay over a shared Redis pub/sub channel.
//!
//! Every instance publishes its locally originated events to one shared
//! channel and re-injects events originated by other instances into its own
//! dispatcher. Two rules keep this loop-free and outage-tolerant:
//!
//! - **Echo suppression**: every event carries a mandatory
//!   `origin_instance`; frames whose origin equals the local instance id are
//!   discarded on receipt, and re-injected events are tagged
//!   `source = Relay` so the dispatcher never hands them back to the relay.
//! - **Outage isolation**: publishing goes through a bounded in-memory
//!   queue. While the channel is unreachable the publisher retries with
//!   capped exponential backoff and local delivery proceeds untouched;
//!   if the queue overflows, the OLDEST buffered event is dropped first.
//!   The loss is acceptable because aggregate state is always re-derivable
//!   from the authoritative store.

use crate::dispatch::Dispatcher;
use crate::event::{EventSource, SyncEvent};
use crate::metrics::Metrics;
use crate::shutdown::ShutdownSignal;
use deadpool_redis::redis;
use deadpool_redis::{redis::cmd, Pool};
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Errors from relay transport operations.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("redis pool error: {0}")]
    Pool(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("subscription stream ended")]
    Disconnected,
}

/// Capped exponential retry backoff: `first × factor^attempt`, clamped to
/// `max`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub first: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_secs(1),
            max: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay for the given attempt number (0-indexed).
    pub fn next(&self, attempt: u32) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let secs = self.first.as_secs_f64() * self.factor.powi(attempt.min(i32::MAX as u32) as i32);
        if !secs.is_finite() || secs < 0.0 || secs > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Relay tunables.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Shared pub/sub channel name.
    pub channel: String,
    /// Outbound events retained while the channel is unreachable.
    pub buffer: usize,
    /// Retry policy for publish and reconnect.
    pub backoff: BackoffPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            channel: "livewire:sync".to_string(),
            buffer: 256,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Bounded FIFO of events awaiting publication, oldest dropped on overflow.
pub struct OutboundQueue {
    inner: Mutex<VecDeque<SyncEvent>>,
    capacity: usize,
    notify: Notify,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            notify: Notify::new(),
        }
    }

    /// Appends an event; returns the displaced oldest event on overflow.
    pub fn push(&self, event: SyncEvent) -> Option<SyncEvent> {
        let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        queue.push_back(event);
        let dropped = if queue.len() > self.capacity {
            queue.pop_front()
        } else {
            None
        };
        drop(queue);
        self.notify.notify_one();
        dropped
    }

    /// Waits for and removes the oldest queued event.
    pub async fn pop(&self) -> SyncEvent {
        loop {
            let notified = self.notify.notified();
            if let Some(event) = self
                .inner
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
            {
                return event;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cheap handle the dispatcher uses to hand events to the relay.
#[derive(Clone)]
pub struct RelayHandle {
    queue: Arc<OutboundQueue>,
    metrics: Arc<Metrics>,
}

impl RelayHandle {
    pub fn new(queue: Arc<OutboundQueue>, metrics: Arc<Metrics>) -> Self {
        Self { queue, metrics }
    }

    /// Queues an event for cross-instance publication. Never blocks; on
    /// overflow the oldest buffered event is dropped and counted.
    pub fn enqueue(&self, event: SyncEvent) {
        if let Some(dropped) = self.queue.push(event) {
            debug!(id = %dropped.id, "Relay buffer full, dropped oldest event");
            self.metrics.relay_dropped();
        }
    }
}

/// Decodes a frame received from the shared channel.
///
/// Returns `None` for undecodable frames and for echoes of this instance's
/// own publications. Accepted events are re-tagged `source = Relay`.
pub fn decode_remote(frame: &str, local_instance: &str) -> Option<SyncEvent> {
    let event: SyncEvent = match serde_json::from_str(frame) {
        Ok(ev) => ev,
        Err(e) => {
            warn!(error = %e, "Discarding undecodable relay frame");
            return None;
        }
    };

    if event.origin_instance == local_instance {
        return None;
    }

    Some(event.with_source(EventSource::Relay))
}

/// The relay's background tasks: one publisher, one subscriber.
pub struct Relay {
    pool: Pool,
    redis_url: String,
    instance: String,
    config: RelayConfig,
    queue: Arc<OutboundQueue>,
    metrics: Arc<Metrics>,
    shutdown: ShutdownSignal,
}

impl Relay {
    pub fn new(
        pool: Pool,
        redis_url: impl Into<String>,
        instance: impl Into<String>,
        config: RelayConfig,
        metrics: Arc<Metrics>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            pool,
            redis_url: redis_url.into(),
            instance: instance.into(),
            queue: Arc::new(OutboundQueue::new(config.buffer)),
            config,
            metrics,
            shutdown,
        }
    }

    /// Handle for the dispatcher's outbound hand-off.
    pub fn handle(&self) -> RelayHandle {
        RelayHandle::new(Arc::clone(&self.queue), Arc::clone(&self.metrics))
    }

    /// Spawns the publisher and subscriber tasks.
    pub fn spawn(self, dispatcher: Dispatcher) {
        let relay = Arc::new(self);
        tokio::spawn(Arc::clone(&relay).run_publisher());
        tokio::spawn(relay.run_subscriber(dispatcher));
    }

    /// Drains the outbound queue to the shared channel, retrying each event
    /// with capped backoff while the channel is unreachable.
    async fn run_publisher(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown.subscribe();

        'events: loop {
            let event = tokio::select! {
                _ = shutdown_rx.recv() => break,
                event = self.queue.pop() => event,
            };

            let frame = match serde_json::to_string(&event) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, id = %event.id, "Failed to serialize event for relay");
                    continue;
                }
            };

            let mut attempt: u32 = 0;
            loop {
                match self.try_publish(&frame).await {
                    Ok(_) => {
                        self.metrics.set_relay_reachable(true);
                        self.metrics.relay_published();
                        continue 'events;
                    }
                    Err(e) => {
                        self.metrics.set_relay_reachable(false);
                        let delay = self.config.backoff.next(attempt);
                        attempt += 1;
                        warn!(
                            error = %e,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Relay publish failed, backing off"
                        );

                        tokio::select! {
                            _ = shutdown_rx.recv() => break 'events,
                            _ = tokio::time::sleep(delay) => {}
                        }

                        // The event being retried still counts toward
                        // retention: once the queue refills to capacity it
                        // is the oldest and gives way.
                        if self.queue.len() >= self.config.buffer {
                            debug!(id = %event.id, "Relay buffer refilled during outage, dropping in-flight event");
                            self.metrics.relay_dropped();
                            continue 'events;
                        }
                    }
                }
            }
        }

        info!("Relay publisher stopped");
    }

    async fn try_publish(&self, frame: &str) -> Result<i64, RelayError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| RelayError::Pool(e.to_string()))?;

        let receivers: i64 = cmd("PUBLISH")
            .arg(&self.config.channel)
            .arg(frame)
            .query_async(&mut conn)
            .await?;

        Ok(receivers)
    }

    /// Receives events from the shared channel and injects them into the
    /// local dispatcher, reconnecting with the publish backoff policy.
    async fn run_subscriber(self: Arc<Self>, dispatcher: Dispatcher) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut attempt: u32 = 0;

        loop {
            match self.subscribe_once(&dispatcher, &mut shutdown_rx).await {
                Ok(()) => break, // shutdown
                Err(e) => {
                    self.metrics.set_relay_reachable(false);
                    let delay = self.config.backoff.next(attempt);
                    attempt += 1;
                    warn!(
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Relay subscription lost, reconnecting"
                    );

                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!("Relay subscriber stopped");
    }

    async fn subscribe_once(
        &self,
        dispatcher: &Dispatcher,
        shutdown_rx: &mut tokio::sync::broadcast::Receiver<()>,
    ) -> Result<(), RelayError> {
        let client = redis::Client::open(self.redis_url.as_str())?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(&self.config.channel).await?;

        self.metrics.set_relay_reachable(true);
        info!(channel = %self.config.channel, "Relay subscribed");

        let mut stream = pubsub.on_message();
        loop {
            let msg = tokio::select! {
                _ = shutdown_rx.recv() => return Ok(()),
                msg = stream.next() => msg.ok_or(RelayError::Disconnected)?,
            };

            let frame: String = msg.get_payload()?;
            let Some(event) = decode_remote(&frame, &self.instance) else {
                continue;
            };

            self.metrics.relay_received();
            if let Err(e) = dispatcher.publish_event(event) {
                warn!(error = %e, "Failed to inject relayed event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use serde_json::json;

    fn event(n: u64, origin: &str) -> SyncEvent {
        SyncEvent::new(EventKind::VoteCast, json!({"n": n}), origin)
    }

    #[test]
    fn test_backoff_growth_and_clamp() {
        let backoff = BackoffPolicy {
            first: Duration::from_millis(100),
            max: Duration::from_secs(10),
            factor: 2.0,
        };

        assert_eq!(backoff.next(0), Duration::from_millis(100));
        assert_eq!(backoff.next(1), Duration::from_millis(200));
        assert_eq!(backoff.next(3), Duration::from_millis(800));
        assert_eq!(backoff.next(30), Duration::from_secs(10));
        assert_eq!(backoff.next(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_queue_drops_oldest_on_overflow() {
        let queue = OutboundQueue::new(3);
        let mut dropped = Vec::new();

        for n in 0..5 {
            if let Some(old) = queue.push(event(n, "inst-a")) {
                dropped.push(old.payload["n"].as_u64().unwrap());
            }
        }

        assert_eq!(queue.len(), 3);
        assert_eq!(dropped, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_queue_pop_in_order() {
        let queue = OutboundQueue::new(10);
        for n in 0..3 {
            queue.push(event(n, "inst-a"));
        }

        for n in 0..3 {
            let ev = queue.pop().await;
            assert_eq!(ev.payload["n"], n);
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_queue_pop_waits_for_push() {
        let queue = Arc::new(OutboundQueue::new(10));
        let pusher = Arc::clone(&queue);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            pusher.push(event(7, "inst-a"));
        });

        let ev = tokio::time::timeout(Duration::from_secs(1), queue.pop())
            .await
            .expect("pop should complete once pushed");
        assert_eq!(ev.payload["n"], 7);
    }

    #[test]
    fn test_handle_counts_dropped_events() {
        let metrics = Arc::new(Metrics::new());
        let handle = RelayHandle::new(Arc::new(OutboundQueue::new(1)), Arc::clone(&metrics));

        handle.enqueue(event(1, "inst-a"));
        handle.enqueue(event(2, "inst-a"));

        assert_eq!(metrics.summary()["relay"]["dropped"], 1);
    }

    #[test]
    fn test_decode_remote_discards_echo() {
        let ev = event(1, "inst-a");
        let frame = serde_json::to_string(&ev).unwrap();

        assert!(decode_remote(&frame, "inst-a").is_none(), "echo not discarded");

        let accepted = decode_remote(&frame, "inst-b").expect("foreign event accepted");
        assert_eq!(accepted.source, EventSource::Relay);
        assert_eq!(accepted.id, ev.id);
        assert_eq!(accepted.origin_instance, "inst-a");
    }

    #[test]
    fn test_decode_remote_rejects_garbage() {
        assert!(decode_remote("not json", "inst-a").is_none());
        assert!(decode_remote("{\"id\": 1}", "inst-a").is_none());
    }
}
