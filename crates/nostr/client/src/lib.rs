//! Multi-relay client layer.
//!
//! This crate provides:
//! - Relay protocol frames (NIP-01, plus NIP-50 search filters)
//! - A transport seam with WebSocket and in-memory implementations
//! - Single relay connections with reconnect supervision
//! - A relay pool with fan-out publish and aggregate subscription completion
//! - Per-query event deduplication
//!
//! # Example
//!
//! ```rust,no_run
//! use nostr_client::{Filter, PoolConfig, RelayPool};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let pool = RelayPool::new(
//!         &["wss://relay.damus.io".to_string(), "wss://nos.lol".to_string()],
//!         PoolConfig::default(),
//!     );
//!     pool.init().await;
//!
//!     let filter = Filter::new().kinds(vec![1]).limit(10);
//!     pool.subscribe_all(
//!         "notes",
//!         vec![filter],
//!         Arc::new(|event| println!("Received event: {}", event.id)),
//!         Box::new(|| println!("Backlog complete")),
//!         pool.config().fetch_wait,
//!     )
//!     .await;
//! }
//! ```

mod dedup;
mod error;
mod message;
mod pool;
mod relay;
mod subscription;
mod transport;

pub use dedup::{EventDeduplicator, SharedDeduplicator};
pub use error::{ClientError, Result};
pub use message::{ClientMessage, Filter, MessageError, RelayMessage};
pub use pool::{PoolConfig, PublishReport, RelayPool};
pub use relay::{ConnectionState, LinkEvent, RelayConfig, RelayConnection};
pub use subscription::{
    CompleteCallback, CompletionLatch, EventCallback, Subscription, generate_subscription_id,
};
pub use transport::{
    FrameSink, FrameStream, Link, MemoryTransport, RelayEnd, Transport, WebSocketTransport,
};

/// Default relays.
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.nostr.band",
    "wss://nostr.wine",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_relays() {
        assert!(!DEFAULT_RELAYS.is_empty());
        for relay in DEFAULT_RELAYS {
            assert!(relay.starts_with("wss://"));
        }
    }
}
