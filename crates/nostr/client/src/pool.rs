//! Relay pool for managing connections to multiple relays.
//!
//! The pool holds a fixed set of relay URLs, connects to all of them
//! concurrently and tolerates any subset failing. Subscriptions are fanned
//! out identically to every live connection, and their completions are
//! folded into one aggregate callback that fires exactly once: when every
//! connection has reported end of stored events, or when the caller's wait
//! elapses, whichever comes first.
//!
//! Link transitions of every member connection are merged onto one
//! [`LinkEvent`] channel. Relay-side subscriptions do not survive a lost
//! link, so owners watch it and re-issue theirs with
//! [`RelayPool::subscribe_on`] when a relay comes back.

use crate::message::Filter;
use crate::relay::{ConnectionState, LinkEvent, RelayConfig, RelayConnection};
use crate::subscription::{CompleteCallback, CompletionLatch, EventCallback, Subscription};
use crate::transport::{Transport, WebSocketTransport};
use futures::future::join_all;
use nostr::Event;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Per-connection settings
    pub relay: RelayConfig,
    /// Aggregate completion wait for channel joins
    pub join_wait: Duration,
    /// Aggregate completion wait for fetches and searches
    pub fetch_wait: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            relay: RelayConfig::default(),
            join_wait: Duration::from_secs(3),
            fetch_wait: Duration::from_secs(5),
        }
    }
}

/// Outcome of a fan-out publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Connections that were live when publishing
    pub attempted: usize,
    /// Connections that took the frame
    pub accepted: usize,
}

impl PublishReport {
    pub fn is_success(&self) -> bool {
        self.accepted > 0
    }
}

/// A pool of relay connections.
pub struct RelayPool {
    connections: Vec<RelayConnection>,
    config: PoolConfig,
    links: broadcast::Sender<LinkEvent>,
}

impl RelayPool {
    /// Create a pool over WebSockets. Invalid URLs are skipped with a warning.
    pub fn new(urls: &[String], config: PoolConfig) -> Self {
        Self::with_transport(urls, config, Arc::new(WebSocketTransport))
    }

    pub fn with_transport(
        urls: &[String],
        config: PoolConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (links, _) = broadcast::channel(256);
        let mut connections: Vec<RelayConnection> = Vec::with_capacity(urls.len());
        for url in urls {
            match RelayConnection::with_link_events(
                url,
                config.relay.clone(),
                transport.clone(),
                links.clone(),
            ) {
                Ok(conn) => {
                    if connections.iter().any(|c| c.url() == conn.url()) {
                        debug!("Skipping duplicate relay {}", url);
                        continue;
                    }
                    connections.push(conn);
                }
                Err(e) => warn!("Skipping relay {}: {}", url, e),
            }
        }
        Self {
            connections,
            config,
            links,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Every relay URL in the pool, connected or not.
    pub fn urls(&self) -> Vec<String> {
        self.connections
            .iter()
            .map(|c| c.url().to_string())
            .collect()
    }

    /// Receive link transitions of every relay in the pool from now on.
    pub fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.links.subscribe()
    }

    /// Connect to every relay concurrently. Returns how many succeeded.
    pub async fn init(&self) -> usize {
        let results = join_all(self.connections.iter().map(|conn| conn.connect())).await;

        let mut connected = 0;
        for (conn, result) in self.connections.iter().zip(results) {
            match result {
                Ok(()) => connected += 1,
                Err(e) => warn!("Relay {} unavailable: {}", conn.url(), e),
            }
        }
        info!(
            "Connected to {}/{} relays",
            connected,
            self.connections.len()
        );
        connected
    }

    async fn live(&self) -> Vec<&RelayConnection> {
        let mut live = Vec::new();
        for conn in &self.connections {
            if conn.state().await == ConnectionState::Connected {
                live.push(conn);
            }
        }
        live
    }

    /// URLs of the currently connected relays.
    pub async fn connected(&self) -> Vec<String> {
        self.live()
            .await
            .into_iter()
            .map(|c| c.url().to_string())
            .collect()
    }

    pub async fn connected_count(&self) -> usize {
        self.live().await.len()
    }

    /// Send an event to every connected relay.
    pub async fn publish_to_all(&self, event: &Event) -> PublishReport {
        let live = self.live().await;
        let results = join_all(live.iter().map(|conn| conn.publish(event))).await;
        let report = PublishReport {
            attempted: live.len(),
            accepted: results.into_iter().filter(|sent| *sent).count(),
        };
        debug!(
            "Published {} to {}/{} relays",
            event.id, report.accepted, report.attempted
        );
        report
    }

    /// Issue the same subscription to every connected relay.
    ///
    /// `on_all_complete` fires exactly once: after every subscribed relay
    /// sent EOSE, or after `wait`, whichever is first. With no connected
    /// relays it fires immediately. Returns the number of relays subscribed.
    pub async fn subscribe_all(
        &self,
        subscription_id: &str,
        filters: Vec<Filter>,
        on_event: EventCallback,
        on_all_complete: CompleteCallback,
        wait: Duration,
    ) -> usize {
        let latch = Arc::new(CompletionLatch::new(on_all_complete));
        let live = self.live().await;
        if live.is_empty() {
            debug!("No relays for subscription {}", subscription_id);
            latch.fire();
            return 0;
        }

        let remaining = Arc::new(AtomicUsize::new(live.len()));
        let count_down = {
            let latch = latch.clone();
            let remaining = remaining.clone();
            move || {
                if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                    latch.fire();
                }
            }
        };

        let mut subscribed = 0;
        for conn in live {
            let done = count_down.clone();
            let subscription = Subscription::new(subscription_id, filters.clone(), on_event.clone())
                .on_complete(Box::new(done));
            if conn.subscribe(subscription).await {
                subscribed += 1;
            } else {
                // Lost between the liveness check and the REQ; nothing to wait for.
                count_down();
            }
        }

        let timer_latch = latch.clone();
        let id = subscription_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if timer_latch.fire() {
                debug!("Subscription {} settled by timeout", id);
            }
        });

        subscribed
    }

    /// Issue a subscription on one relay, without completion tracking.
    ///
    /// Meant for restoring subscriptions after that relay reconnects. Skips
    /// a relay that is not connected or already carries `subscription_id`.
    /// Returns whether a REQ went out.
    pub async fn subscribe_on(
        &self,
        url: &str,
        subscription_id: &str,
        filters: Vec<Filter>,
        on_event: EventCallback,
    ) -> bool {
        let Some(conn) = self.connections.iter().find(|c| c.url().as_str() == url) else {
            debug!("No relay {} in pool", url);
            return false;
        };
        if conn
            .active_subscriptions()
            .await
            .iter()
            .any(|id| id == subscription_id)
        {
            return false;
        }
        conn.subscribe_with(subscription_id, filters, on_event).await
    }

    /// Close a subscription on every relay.
    pub async fn unsubscribe_all(&self, subscription_id: &str) {
        join_all(
            self.connections
                .iter()
                .map(|conn| conn.unsubscribe(subscription_id)),
        )
        .await;
    }

    pub async fn disconnect_all(&self) {
        join_all(self.connections.iter().map(|conn| conn.disconnect())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_and_duplicate_urls_skipped() {
        let pool = RelayPool::new(
            &[
                "wss://a.test".to_string(),
                "https://not-a-relay.test".to_string(),
                "wss://a.test".to_string(),
                "wss://b.test".to_string(),
            ],
            PoolConfig::default(),
        );
        assert_eq!(pool.urls(), vec!["wss://a.test/", "wss://b.test/"]);
    }

    #[tokio::test]
    async fn test_empty_pool_degrades() {
        let pool = RelayPool::new(&[], PoolConfig::default());
        assert_eq!(pool.init().await, 0);
        assert!(pool.connected().await.is_empty());

        let event = Event {
            id: "x".into(),
            pubkey: "y".into(),
            created_at: 0,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: "z".into(),
        };
        let report = pool.publish_to_all(&event).await;
        assert_eq!(report, PublishReport::default());
        assert!(!report.is_success());

        let (tx, rx) = tokio::sync::oneshot::channel();
        let subscribed = pool
            .subscribe_all(
                "s",
                vec![],
                Arc::new(|_| {}),
                Box::new(move || {
                    let _ = tx.send(());
                }),
                Duration::from_secs(3),
            )
            .await;
        assert_eq!(subscribed, 0);
        // Fired synchronously, before subscribe_all returned.
        assert!(rx.await.is_ok());
    }
}
