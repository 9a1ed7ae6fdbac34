//! Periodic aggregate regeneration.
//!
//! The scheduler announces derived state on fixed intervals: the leaderboard
//! every 30 seconds, live stats every 10 seconds, trending every 5 minutes
//! (all configurable). Each tick reads the aggregate fresh from the
//! authoritative store and publishes it as a snapshot-carrying event.
//!
//! Multiple instances running the same timers independently is safe: every
//! instance publishes its own freshly computed snapshot, consumers display
//! the latest snapshot they receive and dedup on event id, so duplicate
//! aggregate events for the same underlying state are harmless. No
//! single-writer election is needed for correctness.

use crate::dispatch::Dispatcher;
use crate::event::{EventKind, EventSource, SyncEvent};
use crate::metrics::Metrics;
use crate::shutdown::ShutdownSignal;
use crate::store::StoreReader;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tick intervals for the aggregate timers.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub leaderboard_interval: Duration,
    pub trending_interval: Duration,
    pub live_stats_interval: Duration,
    /// Leaderboard rows included in each refresh.
    pub leaderboard_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            leaderboard_interval: Duration::from_secs(30),
            trending_interval: Duration::from_secs(300),
            live_stats_interval: Duration::from_secs(10),
            leaderboard_limit: 10,
        }
    }
}

/// Spawns the aggregate timers. All of them stop together on shutdown.
pub struct Scheduler {
    dispatcher: Dispatcher,
    store: Arc<dyn StoreReader>,
    metrics: Arc<Metrics>,
    config: SchedulerConfig,
    shutdown: ShutdownSignal,
}

impl Scheduler {
    pub fn new(
        dispatcher: Dispatcher,
        store: Arc<dyn StoreReader>,
        metrics: Arc<Metrics>,
        config: SchedulerConfig,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            dispatcher,
            store,
            metrics,
            config,
            shutdown,
        }
    }

    /// Spawns one task per timer.
    pub fn spawn(self) {
        let scheduler = Arc::new(self);

        info!(
            leaderboard_secs = scheduler.config.leaderboard_interval.as_secs(),
            trending_secs = scheduler.config.trending_interval.as_secs(),
            live_stats_secs = scheduler.config.live_stats_interval.as_secs(),
            "Scheduler started"
        );

        tokio::spawn(Arc::clone(&scheduler).run_timer(
            EventKind::LeaderboardUpdated,
            scheduler.config.leaderboard_interval,
        ));
        tokio::spawn(Arc::clone(&scheduler).run_timer(
            EventKind::TrendingUpdated,
            scheduler.config.trending_interval,
        ));
        tokio::spawn(Arc::clone(&scheduler).run_timer(
            EventKind::LiveStatsUpdated,
            scheduler.config.live_stats_interval,
        ));
    }

    async fn run_timer(self: Arc<Self>, kind: EventKind, period: Duration) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(period);
        // The first tick fires immediately; viewers get fresh aggregates as
        // soon as the engine is up.
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.tick(kind).await {
                // A store hiccup skips one refresh, nothing more.
                warn!(kind = %kind, error = %e, "Aggregate refresh failed");
            }
        }

        debug!(kind = %kind, "Scheduler timer stopped");
    }

    /// Reads the aggregate fresh and publishes it as a snapshot event.
    async fn tick(&self, kind: EventKind) -> Result<(), TickError> {
        let payload = match kind {
            EventKind::LeaderboardUpdated => {
                let rows = self.store.leaderboard(self.config.leaderboard_limit).await?;
                json!({ "leaderboard": rows })
            }
            EventKind::TrendingUpdated => {
                let rows = self.store.trending().await?;
                json!({ "trending": rows })
            }
            EventKind::LiveStatsUpdated => {
                let stats = self.store.live_stats().await?;
                json!({
                    "stats": stats,
                    "activeViewers": self.metrics.active_connections(),
                    "sync": self.metrics.summary(),
                })
            }
            other => {
                debug!(kind = %other, "No timer payload for kind");
                return Ok(());
            }
        };

        let event = SyncEvent::new(kind, payload, self.dispatcher.instance().to_string())
            .with_source(EventSource::Scheduler);
        self.dispatcher.publish_event(event)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
enum TickError {
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    #[error(transparent)]
    Publish(#[from] crate::dispatch::PublishError),
}
