//! Core event types for livewire.
//!
//! A [`SyncEvent`] is an immutable notification that some state changed,
//! identified by a unique id. Events are accepted from producers, dispatched
//! to in-process handlers, fanned out to live viewers, and replicated to
//! other instances over the relay channel.
//!
//! # Example
//!
//! ```json
//! {
//!   "id": "5f0c…",
//!   "kind": "vote_cast",
//!   "payload": { "submissionId": "sub-42", "votes": 17 },
//!   "source": "local",
//!   "originInstance": "livewire-host-1",
//!   "correlationKey": "sub-42",
//!   "priority": 2,
//!   "createdAt": "2026-08-07T10:00:00Z"
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Closed set of event kinds flowing through the engine.
///
/// Wire names are snake_case (`submission_created`, …) and double as the
/// route keys in the configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SubmissionCreated,
    VoteCast,
    VoteRemoved,
    LeaderboardUpdated,
    UserJoined,
    UserPromoted,
    ChallengeStarted,
    TrendingUpdated,
    LiveStatsUpdated,
}

impl EventKind {
    /// All kinds, in declaration order.
    pub const ALL: [EventKind; 9] = [
        EventKind::SubmissionCreated,
        EventKind::VoteCast,
        EventKind::VoteRemoved,
        EventKind::LeaderboardUpdated,
        EventKind::UserJoined,
        EventKind::UserPromoted,
        EventKind::ChallengeStarted,
        EventKind::TrendingUpdated,
        EventKind::LiveStatsUpdated,
    ];

    /// The snake_case wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SubmissionCreated => "submission_created",
            EventKind::VoteCast => "vote_cast",
            EventKind::VoteRemoved => "vote_removed",
            EventKind::LeaderboardUpdated => "leaderboard_updated",
            EventKind::UserJoined => "user_joined",
            EventKind::UserPromoted => "user_promoted",
            EventKind::ChallengeStarted => "challenge_started",
            EventKind::TrendingUpdated => "trending_updated",
            EventKind::LiveStatsUpdated => "live_stats_updated",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownEventKind(s.to_string()))
    }
}

/// Error for an event-kind string outside the closed set.
#[derive(Debug, thiserror::Error)]
#[error("unknown event kind: {0}")]
pub struct UnknownEventKind(pub String);

/// Origin classification of an event.
///
/// `Relay` marks events re-injected from the shared channel; the dispatcher
/// never hands those back to the relay, which is what breaks echo loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// Produced by a local producer (ingest endpoint, embedding code).
    Local,
    /// Received from another instance over the relay channel.
    Relay,
    /// Produced by a local scheduler tick.
    Scheduler,
}

/// Default priority for events that do not specify one.
pub const DEFAULT_PRIORITY: u8 = 1;

/// Highest allowed priority (must-deliver-first, e.g. a vote milestone).
pub const MAX_PRIORITY: u8 = 5;

/// An event flowing through the sync engine.
///
/// `id` is the system-wide idempotency key: it is generated exactly once at
/// creation and never reused, and every consumer treats a repeated delivery
/// of the same id as a no-op.
///
/// `origin_instance` is mandatory. It names the instance that first created
/// the event and is how the relay discards echoes of its own publications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    /// Globally unique id, assigned at creation.
    pub id: String,

    /// Event classification.
    pub kind: EventKind,

    /// Kind-specific payload. Aggregate events carry a snapshot freshly read
    /// from the authoritative store, never an incrementally mutated copy.
    pub payload: Value,

    /// Origin classification.
    pub source: EventSource,

    /// Instance that first created the event.
    #[serde(rename = "originInstance")]
    pub origin_instance: String,

    /// Orders related events relative to each other. Events without a key
    /// carry no mutual ordering guarantee.
    #[serde(rename = "correlationKey", skip_serializing_if = "Option::is_none")]
    pub correlation_key: Option<String>,

    /// 1 (informational) to 5 (must-deliver-first). Orders handler execution
    /// and nothing else.
    pub priority: u8,

    /// Creation timestamp, monotonic per correlation key on one producer.
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl SyncEvent {
    /// Creates a new locally sourced event with a fresh id and timestamp.
    pub fn new(kind: EventKind, payload: Value, origin_instance: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            payload,
            source: EventSource::Local,
            origin_instance: origin_instance.into(),
            correlation_key: None,
            priority: DEFAULT_PRIORITY,
            created_at: Utc::now(),
        }
    }

    /// Sets the origin classification.
    #[inline]
    pub fn with_source(mut self, source: EventSource) -> Self {
        self.source = source;
        self
    }

    /// Sets the correlation key.
    #[inline]
    pub fn with_correlation_key(mut self, key: impl Into<String>) -> Self {
        self.correlation_key = Some(key.into());
        self
    }

    /// Sets the priority, clamped to 1..=5.
    #[inline]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(DEFAULT_PRIORITY, MAX_PRIORITY);
        self
    }
}

/// Messages sent to viewers over the duplex connection.
///
/// On connect a viewer receives exactly one [`WireMessage::Snapshot`] before
/// any [`WireMessage::Event`]. Viewers must deduplicate events on `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Point-in-time aggregate state, computed fresh from the authoritative
    /// store. Bootstraps a newly joined or reconnected viewer without
    /// historical event replay.
    Snapshot {
        leaderboard: Value,
        #[serde(rename = "liveStats")]
        live_stats: Value,
        trending: Value,
    },
    /// A single sync event.
    Event { event: SyncEvent },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_round_trip() {
        for kind in EventKind::ALL {
            let parsed: EventKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("not_a_kind".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_kind_serde_matches_as_str() {
        let json_str = serde_json::to_string(&EventKind::VoteCast).unwrap();
        assert_eq!(json_str, "\"vote_cast\"");
    }

    #[test]
    fn test_new_event_defaults() {
        let ev = SyncEvent::new(EventKind::VoteCast, json!({"votes": 1}), "inst-a");
        assert_eq!(ev.source, EventSource::Local);
        assert_eq!(ev.origin_instance, "inst-a");
        assert_eq!(ev.priority, DEFAULT_PRIORITY);
        assert!(ev.correlation_key.is_none());
        assert!(!ev.id.is_empty());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = SyncEvent::new(EventKind::UserJoined, json!({}), "inst-a");
        let b = SyncEvent::new(EventKind::UserJoined, json!({}), "inst-a");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_priority_clamped() {
        let ev = SyncEvent::new(EventKind::VoteCast, json!({}), "i").with_priority(9);
        assert_eq!(ev.priority, MAX_PRIORITY);
        let ev = SyncEvent::new(EventKind::VoteCast, json!({}), "i").with_priority(0);
        assert_eq!(ev.priority, DEFAULT_PRIORITY);
    }

    #[test]
    fn test_event_serialize_wire_names() {
        let ev = SyncEvent::new(EventKind::SubmissionCreated, json!({"title": "x"}), "inst-a")
            .with_correlation_key("sub-1");

        let json_str = serde_json::to_string(&ev).unwrap();
        assert!(json_str.contains("\"kind\":\"submission_created\""));
        assert!(json_str.contains("originInstance"));
        assert!(json_str.contains("correlationKey"));
        assert!(json_str.contains("createdAt"));
    }

    #[test]
    fn test_event_deserialize() {
        let json_str = r#"{
            "id": "abc",
            "kind": "leaderboard_updated",
            "payload": {"leaderboard": []},
            "source": "scheduler",
            "originInstance": "inst-b",
            "priority": 3,
            "createdAt": "2026-08-07T10:00:00Z"
        }"#;

        let ev: SyncEvent = serde_json::from_str(json_str).unwrap();
        assert_eq!(ev.kind, EventKind::LeaderboardUpdated);
        assert_eq!(ev.source, EventSource::Scheduler);
        assert_eq!(ev.origin_instance, "inst-b");
        assert!(ev.correlation_key.is_none());
    }

    #[test]
    fn test_wire_message_tagging() {
        let ev = SyncEvent::new(EventKind::VoteCast, json!({}), "i");
        let msg = WireMessage::Event { event: ev };
        let json_str = serde_json::to_string(&msg).unwrap();
        assert!(json_str.contains("\"type\":\"event\""));

        let snap = WireMessage::Snapshot {
            leaderboard: json!([]),
            live_stats: json!({}),
            trending: json!([]),
        };
        let json_str = serde_json::to_string(&snap).unwrap();
        assert!(json_str.contains("\"type\":\"snapshot\""));
        assert!(json_str.contains("liveStats"));
    }
}
