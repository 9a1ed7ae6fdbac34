//! Chat-platform integration.
//!
//! [`ChatHandler`] posts matched events to a community-chat webhook URL.
//! It is driven purely as a dispatcher handler and never calls back into
//! the engine: the chat platform is a downstream consumer of the stream,
//! not a producer.
//!
//! # Example
//!
//! ```rust,ignore
//! use livewire::handlers::ChatHandler;
//! use std::time::Duration;
//!
//! let handler = ChatHandler::new("https://discord.com/api/webhooks/…")
//!     .with_timeout(Duration::from_secs(10))
//!     .with_retries(2)
//!     .with_embed_format();
//! ```

use super::{Handler, HandlerError};
use crate::event::{EventKind, SyncEvent};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default timeout for webhook requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of retries on 5xx responses.
const DEFAULT_RETRIES: u32 = 1;

/// Embed accent color per event kind.
fn embed_color(kind: EventKind) -> u32 {
    match kind {
        EventKind::SubmissionCreated => 0xFF1493, // hot pink, new content
        EventKind::VoteCast | EventKind::VoteRemoved => 0x57F287,
        EventKind::LeaderboardUpdated | EventKind::TrendingUpdated => 0xFEE75C,
        EventKind::UserJoined | EventKind::UserPromoted => 0x5865F2,
        EventKind::ChallengeStarted => 0xED4245,
        EventKind::LiveStatsUpdated => 0x99AAB5,
    }
}

/// "vote_cast" -> "Vote Cast"
fn embed_title(kind: EventKind) -> String {
    kind.as_str()
        .split('_')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                None => String::new(),
                Some(first) => first.to_uppercase().chain(chars).collect(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Posts events to an HTTP webhook, optionally in chat-embed format.
#[derive(Debug, Clone)]
pub struct ChatHandler {
    url: String,
    /// Reused for connection pooling.
    client: Client,
    timeout: Duration,
    retries: u32,
    embed_format: bool,
}

impl ChatHandler {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: Client::new(),
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
            embed_format: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Format the payload as a chat embed instead of raw JSON.
    pub fn with_embed_format(mut self) -> Self {
        self.embed_format = true;
        self
    }

    fn build_payload(&self, event: &SyncEvent) -> Value {
        if self.embed_format {
            self.build_embed_payload(event)
        } else {
            json!({
                "id": event.id,
                "kind": event.kind,
                "payload": event.payload,
                "createdAt": event.created_at,
            })
        }
    }

    fn build_embed_payload(&self, event: &SyncEvent) -> Value {
        let mut embed = json!({
            "title": embed_title(event.kind),
            "description": self.format_description(event),
            "color": embed_color(event.kind),
            "timestamp": event.created_at,
            "footer": { "text": format!("instance: {}", event.origin_instance) },
        });

        let fields = self.build_fields(event);
        if !fields.is_empty() {
            embed["fields"] = Value::Array(fields);
        }

        json!({ "embeds": [embed] })
    }

    fn format_description(&self, event: &SyncEvent) -> String {
        let payload = &event.payload;
        let str_field = |key: &str| payload.get(key).and_then(Value::as_str);

        match event.kind {
            EventKind::SubmissionCreated => {
                if let (Some(creator), Some(title)) = (str_field("creator"), str_field("title")) {
                    return format!("**{creator}** submitted **{title}**! Vote with reactions.");
                }
            }
            EventKind::VoteCast => {
                if let Some(id) = str_field("submissionId") {
                    return format!("New vote on **{id}**");
                }
            }
            EventKind::UserPromoted => {
                if let (Some(user), Some(role)) = (str_field("username"), str_field("role")) {
                    return format!("**{user}** was promoted to **{role}**!");
                }
            }
            EventKind::UserJoined => {
                if let Some(user) = str_field("username") {
                    return format!("Welcome **{user}**!");
                }
            }
            EventKind::ChallengeStarted => {
                if let Some(name) = str_field("name") {
                    return format!("Challenge **{name}** is live!");
                }
            }
            EventKind::LeaderboardUpdated => {
                return self.format_leaderboard(payload);
            }
            _ => {}
        }

        if let Some(msg) = str_field("message") {
            return msg.to_string();
        }
        format!("{} event", event.kind)
    }

    /// Top rows with medal markers, the way the original leaderboard channel
    /// renders them.
    fn format_leaderboard(&self, payload: &Value) -> String {
        let rows = match payload.get("leaderboard").and_then(Value::as_array) {
            Some(rows) if !rows.is_empty() => rows,
            _ => return "Leaderboard updated".to_string(),
        };

        let mut lines = Vec::new();
        for (i, row) in rows.iter().take(5).enumerate() {
            let medal = match i {
                0 => "🥇",
                1 => "🥈",
                2 => "🥉",
                _ => "🔹",
            };
            let title = row.get("title").and_then(Value::as_str).unwrap_or("?");
            let creator = row.get("creator").and_then(Value::as_str).unwrap_or("?");
            let votes = row.get("votes").and_then(Value::as_u64).unwrap_or(0);
            lines.push(format!("{medal} **{title}** by {creator} ({votes} votes)"));
        }
        lines.join("\n")
    }

    fn build_fields(&self, event: &SyncEvent) -> Vec<Value> {
        let mut fields = Vec::new();

        if let Some(obj) = event.payload.as_object() {
            for (key, value) in obj {
                // Scalars only; nested aggregates are already summarized in
                // the description.
                let field_value = match value {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => continue,
                };
                if field_value.is_empty() {
                    continue;
                }

                fields.push(json!({
                    "name": key,
                    "value": field_value,
                    "inline": true,
                }));

                if fields.len() >= 6 {
                    break;
                }
            }
        }

        fields
    }

    async fn send_request(&self, event: &SyncEvent) -> Result<reqwest::Response, HandlerError> {
        let payload = self.build_payload(event);

        let mut last_error = None;
        let mut attempts = 0;

        while attempts <= self.retries {
            if attempts > 0 {
                debug!(attempt = attempts, url = %self.url, "Retrying chat webhook");
            }

            let result = self
                .client
                .post(&self.url)
                .timeout(self.timeout)
                .json(&payload)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() || status.is_client_error() {
                        // 4xx is not retryable; surface it to the caller.
                        return Ok(response);
                    }
                    warn!(
                        status = %status,
                        url = %self.url,
                        attempt = attempts,
                        "Chat webhook returned server error"
                    );
                    last_error = Some(HandlerError::Failed(format!("server error: {status}")));
                }
                Err(e) => {
                    warn!(error = %e, url = %self.url, attempt = attempts, "Chat webhook request failed");
                    last_error = Some(HandlerError::Http(e));
                }
            }

            attempts += 1;
        }

        Err(last_error.unwrap_or_else(|| HandlerError::Failed("unknown error".into())))
    }
}

#[async_trait]
impl Handler for ChatHandler {
    fn name(&self) -> &str {
        "chat"
    }

    async fn handle(&self, event: &SyncEvent) -> Result<(), HandlerError> {
        debug!(
            url = %self.url,
            kind = %event.kind,
            embed = self.embed_format,
            "Posting to chat webhook"
        );

        let response = self.send_request(event).await?;
        let status = response.status();

        if status.is_success() {
            info!(url = %self.url, status = %status, kind = %event.kind, "Chat message delivered");
            Ok(())
        } else {
            Err(HandlerError::Failed(format!(
                "chat webhook returned status {status}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    #[test]
    fn test_builder() {
        let handler = ChatHandler::new("https://example.com/hook")
            .with_timeout(Duration::from_secs(5))
            .with_retries(3);

        assert_eq!(handler.url, "https://example.com/hook");
        assert_eq!(handler.timeout, Duration::from_secs(5));
        assert_eq!(handler.retries, 3);
        assert!(!handler.embed_format);
    }

    #[test]
    fn test_embed_title_casing() {
        assert_eq!(embed_title(EventKind::VoteCast), "Vote Cast");
        assert_eq!(embed_title(EventKind::SubmissionCreated), "Submission Created");
        assert_eq!(embed_title(EventKind::LiveStatsUpdated), "Live Stats Updated");
    }

    #[test]
    fn test_submission_embed() {
        let handler = ChatHandler::new("https://example.com/hook").with_embed_format();
        let ev = SyncEvent::new(
            EventKind::SubmissionCreated,
            json!({"creator": "ada", "title": "rooftop scene", "submissionId": "sub-9"}),
            "inst-a",
        );

        let payload = handler.build_payload(&ev);
        let embed = &payload["embeds"][0];
        assert_eq!(embed["title"], "Submission Created");
        assert!(embed["description"].as_str().unwrap().contains("ada"));
        assert!(embed["description"].as_str().unwrap().contains("rooftop scene"));
        assert_eq!(embed["color"], 0xFF1493);
    }

    #[test]
    fn test_leaderboard_embed_medals() {
        let handler = ChatHandler::new("https://example.com/hook").with_embed_format();
        let ev = SyncEvent::new(
            EventKind::LeaderboardUpdated,
            json!({"leaderboard": [
                {"title": "a", "creator": "x", "votes": 10},
                {"title": "b", "creator": "y", "votes": 7},
            ]}),
            "inst-a",
        );

        let payload = handler.build_payload(&ev);
        let description = payload["embeds"][0]["description"].as_str().unwrap();
        assert!(description.contains("🥇"));
        assert!(description.contains("🥈"));
        assert!(description.contains("10 votes"));
    }

    #[test]
    fn test_plain_json_payload() {
        let handler = ChatHandler::new("https://example.com/hook");
        let ev = SyncEvent::new(EventKind::VoteCast, json!({"votes": 3}), "inst-a");

        let payload = handler.build_payload(&ev);
        assert!(payload.get("embeds").is_none());
        assert_eq!(payload["kind"], "vote_cast");
        assert_eq!(payload["payload"]["votes"], 3);
    }

    #[test]
    fn test_fields_skip_nested_values() {
        let handler = ChatHandler::new("https://example.com/hook").with_embed_format();
        let ev = SyncEvent::new(
            EventKind::VoteCast,
            json!({"submissionId": "sub-1", "votes": 4, "meta": {"nested": true}}),
            "inst-a",
        );

        let fields = handler.build_fields(&ev);
        assert_eq!(fields.len(), 2);
        assert!(fields.iter().all(|f| f["name"] != "meta"));
    }
}
