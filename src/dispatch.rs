//! Event dispatcher.
//!
//! [`Dispatcher::publish_event`] is the single entry point for every
//! producer: the ingest endpoint, the scheduler, and the relay's inbound
//! side. Publishing is non-blocking; the caller gets back the event id as an
//! acceptance acknowledgement, not a delivery receipt. Delivery work happens
//! on a small pool of lane tasks.
//!
//! ## Ordering
//!
//! Events sharing a `correlation_key` hash to the same lane, and each lane
//! processes its queue strictly in order, so related events run their
//! handlers and reach every viewer buffer in creation order. Events with
//! different or absent keys land on arbitrary lanes and may be processed
//! concurrently; that is the whole of the ordering contract.
//!
//! ## Isolation
//!
//! Each handler runs in its own spawned task: an error or panic is logged
//! and counted, and neither the remaining handlers nor the fan-out nor the
//! relay hand-off are affected.
//!
//! ## Echo prevention
//!
//! Events tagged `source = Relay` came in from the shared channel and are
//! never handed back to it; everything else is enqueued for cross-instance
//! publication after the local fan-out.

use crate::event::{EventKind, EventSource, SyncEvent, DEFAULT_PRIORITY, MAX_PRIORITY};
use crate::handlers::Handler;
use crate::metrics::Metrics;
use crate::registry::ConnectionRegistry;
use crate::relay::RelayHandle;
use crate::shutdown::ShutdownSignal;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Errors returned by `publish`.
#[derive(Debug, Error)]
pub enum PublishError {
    /// Lane queues are full; the event was not accepted.
    #[error("dispatcher saturated, event rejected")]
    Saturated,

    /// The dispatcher has shut down.
    #[error("dispatcher closed")]
    Closed,
}

struct Registration {
    priority: u8,
    order: usize,
    handler: Arc<dyn Handler>,
}

/// Builds a [`Dispatcher`]. Handler registration happens here, once, at
/// startup; the handler table is immutable afterwards.
pub struct DispatcherBuilder {
    instance: String,
    handlers: HashMap<EventKind, Vec<Registration>>,
    lanes: usize,
    queue_depth: usize,
    next_order: usize,
}

impl DispatcherBuilder {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            handlers: HashMap::new(),
            lanes: 4,
            queue_depth: 1024,
            next_order: 0,
        }
    }

    /// Number of concurrent dispatch lanes.
    pub fn lanes(mut self, lanes: usize) -> Self {
        self.lanes = lanes.max(1);
        self
    }

    /// Events buffered per lane before `publish` reports saturation.
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    /// Registers a handler for one event kind. Handlers run in ascending
    /// priority order (1..=5); ties run in registration order.
    pub fn on(mut self, kind: EventKind, priority: u8, handler: Arc<dyn Handler>) -> Self {
        let registration = Registration {
            priority: priority.clamp(DEFAULT_PRIORITY, MAX_PRIORITY),
            order: self.next_order,
            handler,
        };
        self.next_order += 1;
        self.handlers.entry(kind).or_default().push(registration);
        self
    }

    /// Finalizes the handler table and spawns the lane tasks.
    pub fn build(
        self,
        registry: Arc<ConnectionRegistry>,
        relay: Option<RelayHandle>,
        metrics: Arc<Metrics>,
        shutdown: ShutdownSignal,
    ) -> Dispatcher {
        let mut handlers: HashMap<EventKind, Vec<Arc<dyn Handler>>> = HashMap::new();
        for (kind, mut registrations) in self.handlers {
            registrations.sort_by_key(|r| (r.priority, r.order));
            handlers.insert(kind, registrations.into_iter().map(|r| r.handler).collect());
        }

        let inner = Arc::new(DispatchInner {
            instance: self.instance,
            handlers,
            registry,
            relay,
            metrics,
        });

        let mut lanes = Vec::with_capacity(self.lanes);
        for lane in 0..self.lanes {
            let (tx, rx) = mpsc::channel::<SyncEvent>(self.queue_depth);
            tokio::spawn(lane_loop(lane, Arc::clone(&inner), rx, shutdown.subscribe()));
            lanes.push(tx);
        }

        info!(
            lanes = lanes.len(),
            kinds = inner.handlers.len(),
            "Dispatcher started"
        );

        Dispatcher {
            inner,
            lanes: Arc::new(lanes),
            round_robin: Arc::new(AtomicUsize::new(0)),
        }
    }
}

struct DispatchInner {
    instance: String,
    handlers: HashMap<EventKind, Vec<Arc<dyn Handler>>>,
    registry: Arc<ConnectionRegistry>,
    relay: Option<RelayHandle>,
    metrics: Arc<Metrics>,
}

/// Cheap-to-clone publish surface shared by all producers.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatchInner>,
    lanes: Arc<Vec<mpsc::Sender<SyncEvent>>>,
    round_robin: Arc<AtomicUsize>,
}

impl Dispatcher {
    pub fn builder(instance: impl Into<String>) -> DispatcherBuilder {
        DispatcherBuilder::new(instance)
    }

    /// Local instance id stamped as `origin_instance` on produced events.
    pub fn instance(&self) -> &str {
        &self.inner.instance
    }

    /// Publishes a locally produced event with defaults. Returns the event
    /// id once the event is accepted for dispatch.
    pub fn publish(&self, kind: EventKind, payload: Value) -> Result<String, PublishError> {
        self.publish_event(SyncEvent::new(kind, payload, self.inner.instance.clone()))
    }

    /// Publishes a fully built event (correlation key, priority, source).
    pub fn publish_event(&self, event: SyncEvent) -> Result<String, PublishError> {
        let lane = match &event.correlation_key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() as usize) % self.lanes.len()
            }
            None => self.round_robin.fetch_add(1, Ordering::Relaxed) % self.lanes.len(),
        };

        let id = event.id.clone();
        match self.lanes[lane].try_send(event) {
            Ok(()) => {
                self.inner.metrics.event_accepted();
                Ok(id)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.inner.metrics.event_failed();
                Err(PublishError::Saturated)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PublishError::Closed),
        }
    }
}

async fn lane_loop(
    lane: usize,
    inner: Arc<DispatchInner>,
    mut rx: mpsc::Receiver<SyncEvent>,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        dispatch_one(&inner, event).await;
    }

    debug!(lane, "Dispatch lane stopped");
}

/// Runs handlers, hands the event to the fan-out, then to the relay.
async fn dispatch_one(inner: &Arc<DispatchInner>, event: SyncEvent) {
    let started = Instant::now();

    if let Some(handlers) = inner.handlers.get(&event.kind) {
        for handler in handlers {
            let name = handler.name().to_string();
            let task_handler = Arc::clone(handler);
            let task_event = event.clone();

            // Spawned so a panicking handler is contained by the join error.
            let outcome = tokio::spawn(async move { task_handler.handle(&task_event).await }).await;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(handler = %name, id = %event.id, error = %e, "Handler failed");
                    inner.metrics.event_failed();
                }
                Err(join_error) => {
                    warn!(
                        handler = %name,
                        id = %event.id,
                        panicked = join_error.is_panic(),
                        "Handler aborted"
                    );
                    inner.metrics.event_failed();
                }
            }
        }
    }

    inner.registry.broadcast(&event);

    // Relay-received events are not re-published: that is the echo-loop
    // breaker.
    if event.source != EventSource::Relay {
        if let Some(relay) = &inner.relay {
            relay.enqueue(event);
        }
    }

    inner.metrics.dispatch_completed(started.elapsed());
}
