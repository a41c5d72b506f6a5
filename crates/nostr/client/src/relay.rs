//! Single relay connection management
//!
//! A [`RelayConnection`] owns one link to one relay. Each open link runs a
//! writer task (outbound frame queue to the sink) and a reader task (frame
//! parsing and subscription routing). A supervisor task, started on the first
//! successful connect, reacts to link loss by reconnecting with a linear
//! backoff (`attempt * reconnect_delay`) until `max_reconnect_attempts` is
//! exhausted, after which the connection is [`ConnectionState::Failed`] for
//! good. Link transitions are announced as [`LinkEvent`]s so owners can
//! track connectivity and restore subscriptions on a fresh link.

use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, Filter, RelayMessage};
use crate::subscription::Subscription;
use crate::transport::{Link, Transport, WebSocketTransport};
use futures::{SinkExt, StreamExt};
use nostr::Event;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Disconnected
    Disconnected,
    /// Currently connecting
    Connecting,
    /// Connected and ready
    Connected,
    /// Waiting out a backoff delay before the next attempt
    Reconnecting,
    /// Reconnect attempts exhausted; unavailable for the rest of the session
    Failed,
}

/// A link transition on one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A link opened; `reconnect` is false for the initial connect
    Up { url: String, reconnect: bool },
    /// The link dropped; subscriptions on it are gone
    Down { url: String },
}

impl LinkEvent {
    pub fn url(&self) -> &str {
        match self {
            LinkEvent::Up { url, .. } | LinkEvent::Down { url } => url,
        }
    }
}

/// Relay connection configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Reconnection attempts after a link loss
    pub max_reconnect_attempts: u32,
    /// Backoff step; attempt `n` waits `n * reconnect_delay`
    pub reconnect_delay: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(2),
        }
    }
}

struct Inner {
    url: Url,
    config: RelayConfig,
    transport: Arc<dyn Transport>,
    state: RwLock<ConnectionState>,
    /// Outbound frame queue of the current link's writer task
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    /// Active subscriptions (subscription_id -> Subscription)
    subscriptions: Mutex<HashMap<String, Subscription>>,
    /// Reader and writer tasks of the current link
    link_tasks: Mutex<Vec<JoinHandle<()>>>,
    lost_tx: mpsc::UnboundedSender<u64>,
    lost_rx: Mutex<Option<mpsc::UnboundedReceiver<u64>>>,
    /// Bumped on every new link so stale loss notices are ignored
    generation: AtomicU64,
    /// Set by an explicit disconnect; suppresses reconnects
    closed: AtomicBool,
    links: broadcast::Sender<LinkEvent>,
}

/// Relay connection
#[derive(Clone)]
pub struct RelayConnection {
    inner: Arc<Inner>,
}

impl RelayConnection {
    /// Create a new relay connection (does not connect yet)
    pub fn new(url: &str) -> Result<Self> {
        Self::with_config(url, RelayConfig::default())
    }

    pub fn with_config(url: &str, config: RelayConfig) -> Result<Self> {
        Self::with_transport(url, config, Arc::new(WebSocketTransport))
    }

    pub fn with_transport(
        url: &str,
        config: RelayConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let (links, _) = broadcast::channel(64);
        Self::with_link_events(url, config, transport, links)
    }

    /// Like [`RelayConnection::with_transport`], announcing link transitions
    /// on a caller-supplied channel so several connections can share one.
    pub fn with_link_events(
        url: &str,
        config: RelayConfig,
        transport: Arc<dyn Transport>,
        links: broadcast::Sender<LinkEvent>,
    ) -> Result<Self> {
        let url = Url::parse(url)?;

        // Validate WebSocket URL
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                url.scheme()
            )));
        }

        let (lost_tx, lost_rx) = mpsc::unbounded_channel();

        Ok(Self {
            inner: Arc::new(Inner {
                url,
                config,
                transport,
                state: RwLock::new(ConnectionState::Disconnected),
                outbound: Mutex::new(None),
                subscriptions: Mutex::new(HashMap::new()),
                link_tasks: Mutex::new(Vec::new()),
                lost_tx,
                lost_rx: Mutex::new(Some(lost_rx)),
                generation: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                links,
            }),
        })
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    /// Receive this connection's link transitions from now on.
    pub fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.inner.links.subscribe()
    }

    /// Get current connection state
    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    /// Check if connected
    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    /// Connect to the relay.
    ///
    /// Resolves once the link is open. Fails after `connect_timeout` or on an
    /// immediate transport error; a failed initial connect does not schedule
    /// reconnects.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.inner.state.write().await;
            match *state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Failed => {
                    return Err(ClientError::Connection(format!(
                        "{} exhausted its reconnect attempts",
                        self.inner.url
                    )));
                }
                _ => *state = ConnectionState::Connecting,
            }
        }
        self.inner.closed.store(false, Ordering::SeqCst);

        info!("Connecting to relay: {}", self.inner.url);
        match Inner::open_link(&self.inner).await {
            Ok(()) => {
                self.inner.announce_up(false);
                self.start_supervisor().await;
                Ok(())
            }
            Err(e) => {
                *self.inner.state.write().await = ConnectionState::Disconnected;
                warn!("Failed to connect to {}: {}", self.inner.url, e);
                Err(e)
            }
        }
    }

    async fn start_supervisor(&self) {
        let Some(lost_rx) = self.inner.lost_rx.lock().await.take() else {
            return;
        };
        // Holds only a weak reference; ends when the connection is dropped.
        tokio::spawn(supervise(Arc::downgrade(&self.inner), lost_rx));
    }

    /// Disconnect from the relay and stop reconnecting.
    pub async fn disconnect(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);

        info!("Disconnecting from relay: {}", self.inner.url);
        self.inner.teardown_link().await;
        self.inner.subscriptions.lock().await.clear();

        let mut state = self.inner.state.write().await;
        if *state != ConnectionState::Failed {
            *state = ConnectionState::Disconnected;
        }
    }

    /// Send a REQ and register the subscription's callbacks.
    ///
    /// Returns `false` without doing anything if the relay is not connected.
    pub async fn subscribe(&self, subscription: Subscription) -> bool {
        if !self.is_connected().await {
            debug!(
                "Skipping subscription {} on {}: not connected",
                subscription.id(),
                self.inner.url
            );
            return false;
        }

        let message = ClientMessage::Req {
            subscription_id: subscription.id().to_string(),
            filters: subscription.filters().to_vec(),
        };
        let id = subscription.id().to_string();
        self.inner
            .subscriptions
            .lock()
            .await
            .insert(id.clone(), subscription);

        match self.inner.send(&message).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to subscribe {} on {}: {}", id, self.inner.url, e);
                self.inner.subscriptions.lock().await.remove(&id);
                false
            }
        }
    }

    /// Convenience wrapper building the [`Subscription`] in place.
    pub async fn subscribe_with(
        &self,
        subscription_id: &str,
        filters: Vec<Filter>,
        on_event: crate::subscription::EventCallback,
    ) -> bool {
        self.subscribe(Subscription::new(subscription_id, filters, on_event))
            .await
    }

    /// Send CLOSE and drop the callbacks. Unknown ids are fine.
    pub async fn unsubscribe(&self, subscription_id: &str) {
        let removed = self
            .inner
            .subscriptions
            .lock()
            .await
            .remove(subscription_id);

        if removed.is_some() && self.is_connected().await {
            let message = ClientMessage::Close {
                subscription_id: subscription_id.to_string(),
            };
            if let Err(e) = self.inner.send(&message).await {
                debug!("CLOSE {} on {} not sent: {}", subscription_id, self.inner.url, e);
            }
        }
    }

    /// Publish an event. Returns whether the frame was handed to the link.
    pub async fn publish(&self, event: &Event) -> bool {
        if !self.is_connected().await {
            return false;
        }
        match self.inner.send(&ClientMessage::Event(event.clone())).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to publish {} to {}: {}", event.id, self.inner.url, e);
                false
            }
        }
    }

    /// Get all active subscription IDs
    pub async fn active_subscriptions(&self) -> Vec<String> {
        self.inner
            .subscriptions
            .lock()
            .await
            .keys()
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnection")
            .field("url", &self.inner.url.as_str())
            .finish_non_exhaustive()
    }
}

impl Inner {
    async fn send(&self, message: &ClientMessage) -> Result<()> {
        let text = message.to_json()?;
        debug!("Sending to {}: {}", self.url, text);

        let outbound = self.outbound.lock().await;
        match outbound.as_ref() {
            Some(tx) => tx.send(text).map_err(|_| ClientError::NotConnected),
            None => Err(ClientError::NotConnected),
        }
    }

    /// Open a link and start its reader/writer tasks.
    async fn open_link(this: &Arc<Self>) -> Result<()> {
        let link = match timeout(this.config.connect_timeout, this.transport.open(&this.url)).await
        {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(ClientError::Timeout(format!(
                    "Connection timeout after {:?}",
                    this.config.connect_timeout
                )));
            }
        };

        this.teardown_link().await;
        let generation = this.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let Link { mut sink, mut stream } = link;

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let url = this.url.to_string();
        let writer = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(text).await {
                    warn!("Write to {} failed: {}", url, e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_inner = Arc::clone(this);
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(text) => reader_inner.handle_frame(&text).await,
                    Err(e) => {
                        warn!("Read from {} failed: {}", reader_inner.url, e);
                        break;
                    }
                }
            }
            reader_inner.link_lost(generation).await;
        });

        *this.outbound.lock().await = Some(out_tx);
        *this.link_tasks.lock().await = vec![writer, reader];
        *this.state.write().await = ConnectionState::Connected;
        info!("Connected to relay: {}", this.url);
        Ok(())
    }

    fn announce_up(&self, reconnect: bool) {
        // No receivers is fine.
        let _ = self.links.send(LinkEvent::Up {
            url: self.url.to_string(),
            reconnect,
        });
    }

    /// Stop the current link's tasks, if any.
    async fn teardown_link(&self) {
        self.outbound.lock().await.take();
        let tasks = std::mem::take(&mut *self.link_tasks.lock().await);
        for task in tasks {
            task.abort();
        }
    }

    async fn link_lost(&self, generation: u64) {
        if self.closed.load(Ordering::SeqCst) || self.generation.load(Ordering::SeqCst) != generation
        {
            return;
        }

        info!("Relay {} closed connection", self.url);
        self.outbound.lock().await.take();
        // Subscriptions do not survive the link; callers re-subscribe.
        self.subscriptions.lock().await.clear();
        *self.state.write().await = ConnectionState::Disconnected;
        let _ = self.links.send(LinkEvent::Down {
            url: self.url.to_string(),
        });
        let _ = self.lost_tx.send(generation);
    }

    async fn handle_frame(&self, text: &str) {
        let message = match RelayMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                debug!("Discarding malformed frame from {}: {}", self.url, e);
                return;
            }
        };

        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                // Clone out of the lock so callbacks never run under it.
                let subscription = self.subscriptions.lock().await.get(&subscription_id).cloned();
                match subscription {
                    Some(subscription) => subscription.handle_event(event),
                    None => debug!(
                        "Event for unknown subscription {} from {}",
                        subscription_id, self.url
                    ),
                }
            }
            RelayMessage::Eose { subscription_id } => {
                let subscription = self.subscriptions.lock().await.get(&subscription_id).cloned();
                if let Some(subscription) = subscription {
                    subscription.mark_eose();
                }
            }
            RelayMessage::Ok {
                event_id,
                success,
                message,
            } => {
                if success {
                    debug!("{} accepted {}", self.url, event_id);
                } else {
                    warn!("{} rejected {}: {}", self.url, event_id, message);
                }
            }
            RelayMessage::Notice { message } => {
                info!("Notice from {}: {}", self.url, message);
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                warn!(
                    "Subscription {} closed by {}: {}",
                    subscription_id, self.url, message
                );
                self.subscriptions.lock().await.remove(&subscription_id);
            }
        }
    }
}

/// Reconnect loop, fed by link-loss notices.
async fn supervise(inner: Weak<Inner>, mut lost_rx: mpsc::UnboundedReceiver<u64>) {
    while let Some(generation) = lost_rx.recv().await {
        let Some(this) = inner.upgrade() else {
            return;
        };
        if this.closed.load(Ordering::SeqCst)
            || this.generation.load(Ordering::SeqCst) != generation
        {
            continue;
        }

        let max_attempts = this.config.max_reconnect_attempts;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if attempt > max_attempts {
                warn!(
                    "Giving up on {} after {} reconnect attempts",
                    this.url, max_attempts
                );
                *this.state.write().await = ConnectionState::Failed;
                return;
            }

            if this.closed.load(Ordering::SeqCst) {
                break;
            }
            *this.state.write().await = ConnectionState::Reconnecting;
            let delay = this.config.reconnect_delay * attempt;
            debug!("Reconnecting to {} in {:?} (attempt {})", this.url, delay, attempt);
            tokio::time::sleep(delay).await;

            if this.closed.load(Ordering::SeqCst) {
                break;
            }
            match Inner::open_link(&this).await {
                Ok(()) => {
                    if this.closed.load(Ordering::SeqCst) {
                        // Disconnected while the link was opening.
                        this.teardown_link().await;
                        *this.state.write().await = ConnectionState::Disconnected;
                    } else {
                        info!("Reconnected to {} after {} attempt(s)", this.url, attempt);
                        this.announce_up(true);
                    }
                    break;
                }
                Err(e) => warn!("Reconnect attempt {} to {} failed: {}", attempt, this.url, e),
            }
        }
    }
}
