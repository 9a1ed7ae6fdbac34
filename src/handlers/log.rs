//! Structured logging of matched events.

use super::{Handler, HandlerError};
use crate::event::SyncEvent;
use async_trait::async_trait;
use tracing::info;

/// Logs every matched event through `tracing`.
///
/// Useful for audit trails and for watching the stream during development.
#[derive(Debug, Clone)]
pub struct LogHandler {
    /// Prefix distinguishing multiple log handlers (e.g. "audit").
    prefix: String,
}

impl LogHandler {
    pub fn new() -> Self {
        Self {
            prefix: "event".to_string(),
        }
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for LogHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for LogHandler {
    fn name(&self) -> &str {
        "log"
    }

    async fn handle(&self, event: &SyncEvent) -> Result<(), HandlerError> {
        info!(
            prefix = %self.prefix,
            id = %event.id,
            kind = %event.kind,
            source = ?event.source,
            origin = %event.origin_instance,
            priority = event.priority,
            "[{}] {}",
            self.prefix,
            event.kind
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use serde_json::json;

    #[tokio::test]
    async fn test_log_handler_succeeds() {
        let handler = LogHandler::with_prefix("audit");
        let ev = SyncEvent::new(EventKind::VoteCast, json!({"votes": 1}), "inst");

        handler.handle(&ev).await.unwrap();
        assert_eq!(handler.name(), "log");
    }
}
