//! # Livewire
//!
//! Real-time event synchronization engine: keeps leaderboards, live counters
//! and trending lists consistent across every connected viewer and every
//! running instance of the service.
//!
//! ## Architecture
//!
//! ```text
//! Producers ──► Dispatcher ──┬─► Handlers (log, chat webhook, …)
//!   (ingest,     (lanes)     ├─► Broadcast fan-out ──► live viewers (ws)
//!    scheduler,              └─► Relay ──► shared channel ──► other instances
//!    relay-in)
//! ```
//!
//! Delivery is at-least-once with idempotent event ids; ordering is
//! guaranteed per correlation key only; reconnecting viewers are
//! bootstrapped with a fresh store snapshot instead of event replay.
//!
//! ## Modules
//!
//! - [`event`]: shared event vocabulary and viewer wire protocol
//! - [`dispatch`]: publish surface, handler execution, ordering lanes
//! - [`registry`]: live connection set and broadcast fan-out
//! - [`relay`]: cross-instance replication over Redis pub/sub
//! - [`scheduler`]: periodic aggregate regeneration
//! - [`store`]: read-only interface to the authoritative store
//! - [`handlers`]: in-process handlers, including the chat integration
//! - [`metrics`]: counters and gauges for monitoring

pub mod config;
pub mod dispatch;
pub mod event;
pub mod handlers;
pub mod metrics;
pub mod registry;
pub mod relay;
pub mod scheduler;
pub mod shutdown;
pub mod store;

// Re-export commonly used types at crate root
pub use config::SyncConfig;
pub use dispatch::{Dispatcher, DispatcherBuilder, PublishError};
pub use event::{EventKind, EventSource, SyncEvent, WireMessage};
pub use handlers::{Handler, HandlerError};
pub use metrics::Metrics;
pub use registry::{ConnectionRegistry, ViewerSink};
pub use relay::Relay;
pub use scheduler::Scheduler;
pub use shutdown::ShutdownSignal;
pub use store::{MemoryStore, StoreReader};
