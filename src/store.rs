//! Read-only interface to the authoritative store.
//!
//! The persistent store (submissions, votes, users) lives outside this
//! engine. The engine only ever reads derived aggregates from it, and always
//! reads them fresh: the snapshot sent to a newly connected viewer and the
//! payload of every scheduler-produced aggregate event are computed by
//! calling these methods at that moment, never by mutating a cached copy.
//! That is what keeps instances from diverging.

use async_trait::async_trait;
use deadpool_redis::{redis::cmd, Pool};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use thiserror::Error;
use tracing::warn;

/// Errors surfaced by a store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store query failed: {0}")]
    Query(String),
}

/// One leaderboard row, ranked by votes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub rank: u32,
    #[serde(rename = "submissionId")]
    pub submission_id: String,
    pub title: String,
    pub creator: String,
    pub votes: u64,
}

/// Aggregate counters displayed on live dashboards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveStats {
    #[serde(rename = "totalSubmissions")]
    pub total_submissions: u64,
    #[serde(rename = "totalVotes")]
    pub total_votes: u64,
    #[serde(rename = "activeChallenges")]
    pub active_challenges: u32,
}

/// One trending row, ranked by recent engagement score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendingEntry {
    #[serde(rename = "submissionId")]
    pub submission_id: String,
    pub title: String,
    pub score: f64,
}

/// Read-only aggregate queries against the authoritative store.
///
/// Called fresh by both the connection snapshot path and the scheduler.
#[async_trait]
pub trait StoreReader: Send + Sync {
    /// Current leaderboard, best first, at most `limit` rows.
    async fn leaderboard(&self, limit: usize) -> Result<Vec<LeaderboardEntry>, StoreError>;

    /// Current live counters.
    async fn live_stats(&self) -> Result<LiveStats, StoreError>;

    /// Current trending list, best first.
    async fn trending(&self) -> Result<Vec<TrendingEntry>, StoreError>;
}

/// In-memory store for tests and for embedding the engine without a real
/// database. The embedding application replaces the aggregates wholesale;
/// readers always observe a complete state.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    leaderboard: Vec<LeaderboardEntry>,
    live_stats: LiveStats,
    trending: Vec<TrendingEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_leaderboard(&self, rows: Vec<LeaderboardEntry>) {
        self.inner.write().unwrap_or_else(|e| e.into_inner()).leaderboard = rows;
    }

    pub fn set_live_stats(&self, stats: LiveStats) {
        self.inner.write().unwrap_or_else(|e| e.into_inner()).live_stats = stats;
    }

    pub fn set_trending(&self, rows: Vec<TrendingEntry>) {
        self.inner.write().unwrap_or_else(|e| e.into_inner()).trending = rows;
    }
}

#[async_trait]
impl StoreReader for MemoryStore {
    async fn leaderboard(&self, limit: usize) -> Result<Vec<LeaderboardEntry>, StoreError> {
        let state = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(state.leaderboard.iter().take(limit).cloned().collect())
    }

    async fn live_stats(&self) -> Result<LiveStats, StoreError> {
        let state = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(state.live_stats.clone())
    }

    async fn trending(&self) -> Result<Vec<TrendingEntry>, StoreError> {
        let state = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(state.trending.clone())
    }
}

/// Store reader backed by Redis keys the platform keeps current.
///
/// The platform writes each aggregate as a JSON blob (`<prefix>:leaderboard`,
/// `<prefix>:live_stats`, `<prefix>:trending`); this reader fetches the blob
/// on every call, so snapshots and scheduler ticks always observe the latest
/// written state. A missing or unparseable blob degrades to an empty
/// aggregate rather than failing the read.
pub struct RedisStore {
    pool: Pool,
    prefix: String,
}

impl RedisStore {
    pub fn new(pool: Pool) -> Self {
        Self::with_prefix(pool, "livewire:store")
    }

    pub fn with_prefix(pool: Pool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
        }
    }

    async fn fetch<T: DeserializeOwned + Default>(&self, key_suffix: &str) -> Result<T, StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let key = format!("{}:{}", self.prefix, key_suffix);
        let raw: Option<String> = cmd("GET")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(decode_aggregate(raw.as_deref(), &key))
    }
}

fn decode_aggregate<T: DeserializeOwned + Default>(raw: Option<&str>, key: &str) -> T {
    match raw {
        None => T::default(),
        Some(raw) => match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "Unparseable aggregate blob, using empty state");
                T::default()
            }
        },
    }
}

#[async_trait]
impl StoreReader for RedisStore {
    async fn leaderboard(&self, limit: usize) -> Result<Vec<LeaderboardEntry>, StoreError> {
        let mut rows: Vec<LeaderboardEntry> = self.fetch("leaderboard").await?;
        rows.truncate(limit);
        Ok(rows)
    }

    async fn live_stats(&self) -> Result<LiveStats, StoreError> {
        self.fetch("live_stats").await
    }

    async fn trending(&self) -> Result<Vec<TrendingEntry>, StoreError> {
        self.fetch("trending").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(rank: u32, id: &str, votes: u64) -> LeaderboardEntry {
        LeaderboardEntry {
            rank,
            submission_id: id.to_string(),
            title: format!("scene {id}"),
            creator: "tester".to_string(),
            votes,
        }
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        store.set_leaderboard(vec![entry(1, "sub-1", 10), entry(2, "sub-2", 7)]);
        store.set_live_stats(LiveStats {
            total_submissions: 2,
            total_votes: 17,
            active_challenges: 1,
        });

        let rows = store.leaderboard(10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].submission_id, "sub-1");

        let stats = store.live_stats().await.unwrap();
        assert_eq!(stats.total_votes, 17);
    }

    #[tokio::test]
    async fn test_leaderboard_limit() {
        let store = MemoryStore::new();
        store.set_leaderboard((1..=5).map(|i| entry(i, &format!("s{i}"), 10 - i as u64)).collect());

        let rows = store.leaderboard(3).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].rank, 3);
    }

    #[test]
    fn test_leaderboard_entry_wire_names() {
        let row = entry(1, "sub-1", 3);
        let json = serde_json::to_string(&row).unwrap();
        assert!(json.contains("submissionId"));
        assert!(json.contains("\"votes\":3"));
    }

    #[test]
    fn test_decode_aggregate_missing_key_is_empty() {
        let rows: Vec<LeaderboardEntry> = decode_aggregate(None, "k");
        assert!(rows.is_empty());

        let stats: LiveStats = decode_aggregate(None, "k");
        assert_eq!(stats, LiveStats::default());
    }

    #[test]
    fn test_decode_aggregate_garbage_is_empty() {
        let rows: Vec<TrendingEntry> = decode_aggregate(Some("not json"), "k");
        assert!(rows.is_empty());
    }

    #[test]
    fn test_decode_aggregate_round_trip() {
        let blob = serde_json::to_string(&vec![entry(1, "sub-1", 9)]).unwrap();
        let rows: Vec<LeaderboardEntry> = decode_aggregate(Some(&blob), "k");
        assert_eq!(rows[0].votes, 9);
    }
}
