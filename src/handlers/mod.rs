//! In-process event handlers.
//!
//! A [`Handler`] is invoked by the dispatcher for every published event of a
//! kind it was registered for. Handlers are the seam through which the rest
//! of the platform reacts to the stream: the chat-platform integration is
//! nothing more than a handler registered for `submission_created` and
//! friends. Handlers never call back into the dispatcher.
//!
//! A failing handler is logged and counted; it cannot abort the publish, the
//! remaining handlers, or the viewer fan-out.
//!
//! ## Built-in handlers
//!
//! - [`LogHandler`]: structured logging of matched events
//! - [`ChatHandler`]: HTTP POST to a community-chat webhook
//!
//! ## Custom handlers
//!
//! ```rust,ignore
//! use livewire::{Handler, HandlerError, SyncEvent};
//! use async_trait::async_trait;
//!
//! struct RewardHandler;
//!
//! #[async_trait]
//! impl Handler for RewardHandler {
//!     fn name(&self) -> &str {
//!         "rewards"
//!     }
//!
//!     async fn handle(&self, event: &SyncEvent) -> Result<(), HandlerError> {
//!         // credit points for the vote
//!         Ok(())
//!     }
//! }
//! ```

pub mod chat;
pub mod log;

use crate::event::SyncEvent;
use async_trait::async_trait;
use thiserror::Error;

pub use chat::ChatHandler;
pub use log::LogHandler;

/// Errors that can occur during handler execution.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// HTTP request failed (chat webhook).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error while building an outbound payload.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic handler failure.
    #[error("handler failed: {0}")]
    Failed(String),
}

/// An in-process reaction to a published event.
///
/// Handlers must be `Send + Sync`; the dispatcher shares them across its
/// lane tasks.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Unique name of this handler (e.g. "log", "chat").
    fn name(&self) -> &str;

    /// Reacts to one event.
    async fn handle(&self, event: &SyncEvent) -> Result<(), HandlerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use serde_json::json;

    struct CountingHandler(std::sync::atomic::AtomicUsize);

    #[async_trait]
    impl Handler for CountingHandler {
        fn name(&self) -> &str {
            "counting"
        }

        async fn handle(&self, _event: &SyncEvent) -> Result<(), HandlerError> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_handler_trait_object() {
        let handler: std::sync::Arc<dyn Handler> =
            std::sync::Arc::new(CountingHandler(Default::default()));
        let ev = SyncEvent::new(EventKind::UserJoined, json!({}), "inst");

        handler.handle(&ev).await.unwrap();
        assert_eq!(handler.name(), "counting");
    }
}
