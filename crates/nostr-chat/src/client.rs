//! The chat session.
//!
//! [`ChatClient`] owns one instance of every subsystem: the relay pool,
//! presence tracker, DM store, channel state and open rooms. Relay
//! callbacks never touch session state themselves. They verify, deduplicate
//! and forward events into one channel, drained by a single handler task
//! that applies them in order.
//!
//! Relays forget subscriptions when a link drops. Every long-lived
//! subscription is kept in a registry, and when the pool reports a relay
//! back up the handler re-issues them on that relay and publishes the new
//! relay count.

use crate::channel::{ChannelInfo, ChannelState};
use crate::classify::{ChatMessage, Classified, ClassifyContext, classify};
use crate::config::ChatConfig;
use crate::dm::{self, DecryptedMessage, DmStore};
use crate::error::{ChatError, Result};
use crate::events::{DmEvent, MessageEvent, Observers, RoomEvent, StatusEvent};
use crate::presence::{
    ActiveUser, OriginActivity, PresenceContent, PresenceTracker, PresenceUpdate, now_ms,
};
use crate::room::{RoomContext, RoomKey, RoomMode, TAG_CHANNEL, normalize_origin};
use crate::store::{KEY_DISPLAY_NAME, KEY_PINNED_CHANNELS, KEY_SECRET, KeyValueStore, lock};
use nostr::{
    CryptoGateway, ENCRYPTED_DM_KIND, Event, EventTemplate, KIND_CHANNEL_MESSAGE,
    KIND_CHANNEL_METADATA, KIND_SHORT_TEXT_NOTE, Keys, Secp256k1Gateway, finalize_event_with,
    sort_events_chronological, unix_now, verify_event_with,
};
use nostr_client::{
    CompleteCallback, EventCallback, EventDeduplicator, Filter, LinkEvent, RelayPool,
    SharedDeduplicator, Transport, WebSocketTransport, generate_subscription_id,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{RwLock, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Work for the handler task.
enum Inbound {
    Channel { generation: u64, event: Event },
    ChannelSettled { generation: u64 },
    Room { key: RoomKey, event: Event },
    RoomSettled { key: RoomKey },
    Presence(Event),
    Dm(Event),
    Link(LinkEvent),
}

/// A long-lived subscription, as needed to re-issue it on a fresh link.
#[derive(Clone)]
struct Standing {
    filters: Vec<Filter>,
    on_event: EventCallback,
}

struct OpenRoom {
    ctx: RoomContext,
    subscription_id: String,
    seen: SharedDeduplicator,
    /// `(created_at, item)`, oldest first
    items: Vec<(u64, Classified)>,
}

#[derive(Default)]
struct SessionState {
    presence: PresenceTracker,
    dms: DmStore,
    channel: ChannelState,
    rooms: HashMap<RoomKey, OpenRoom>,
    /// Long-lived presence and DM subscriptions
    background: Vec<String>,
}

#[derive(Debug, Default)]
struct Preferences {
    display_name: Option<String>,
    pinned: Vec<String>,
}

struct Inner {
    config: ChatConfig,
    pool: RelayPool,
    keys: Keys,
    gateway: Arc<dyn CryptoGateway>,
    store: Arc<dyn KeyValueStore>,
    state: RwLock<SessionState>,
    prefs: RwLock<Preferences>,
    observers: Observers,
    inbound: mpsc::UnboundedSender<Inbound>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    /// Handler and link watcher
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Background, channel and room subscriptions by id
    standing: Mutex<HashMap<String, Standing>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

/// A chat session over a pool of relays.
///
/// Cloning is cheap and every clone drives the same session.
#[derive(Clone)]
pub struct ChatClient {
    inner: Arc<Inner>,
}

fn load_identity(store: &dyn KeyValueStore) -> Result<Keys> {
    if let Some(secret) = store.get(KEY_SECRET)? {
        return Keys::from_secret_hex(&secret)
            .map_err(|e| ChatError::Store(format!("stored identity unusable: {e}")));
    }
    let keys = Keys::generate();
    store.set(KEY_SECRET, &keys.secret_hex())?;
    info!("Generated identity {}", keys.public_key());
    Ok(keys)
}

fn load_preferences(store: &dyn KeyValueStore) -> Result<Preferences> {
    let display_name = store
        .get(KEY_DISPLAY_NAME)?
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty());
    let pinned = match store.get(KEY_PINNED_CHANNELS)? {
        Some(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
            warn!("Ignoring unreadable pinned channel list: {}", e);
            Vec::new()
        }),
        None => Vec::new(),
    };
    Ok(Preferences {
        display_name,
        pinned,
    })
}

impl ChatClient {
    /// Session over WebSocket relays.
    pub fn new(config: ChatConfig, store: Arc<dyn KeyValueStore>) -> Result<Self> {
        Self::with_transport(config, store, Arc::new(WebSocketTransport))
    }

    pub fn with_transport(
        config: ChatConfig,
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        Self::with_gateway(config, store, transport, Arc::new(Secp256k1Gateway::new()))
    }

    /// Fully explicit constructor.
    ///
    /// Loads the identity, display name and pinned channels from `store`,
    /// generating and persisting an identity on first use. Nothing touches
    /// the network until [`ChatClient::init`].
    pub fn with_gateway(
        config: ChatConfig,
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn Transport>,
        gateway: Arc<dyn CryptoGateway>,
    ) -> Result<Self> {
        let keys = load_identity(store.as_ref())?;
        let prefs = load_preferences(store.as_ref())?;
        let pool = RelayPool::with_transport(&config.relays, config.pool_config(), transport);
        let (inbound, pending) = mpsc::unbounded_channel();
        let observers = Observers::new(config.observer_capacity);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                pool,
                keys,
                gateway,
                store,
                state: RwLock::new(SessionState::default()),
                prefs: RwLock::new(prefs),
                observers,
                inbound,
                pending: Mutex::new(Some(pending)),
                tasks: Mutex::new(Vec::new()),
                standing: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Start the handler and link watcher tasks on first use.
    fn ensure_handler(&self) {
        let Some(mut pending) = lock(&self.inner.pending).take() else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let handler = tokio::spawn(async move {
            while let Some(item) = pending.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.handle(item).await;
            }
        });

        let mut links = self.inner.pool.link_events();
        let inbound = self.inner.inbound.clone();
        let watcher = tokio::spawn(async move {
            loop {
                match links.recv().await {
                    Ok(link) => {
                        if inbound.send(Inbound::Link(link)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Missed {} relay link events", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        lock(&self.inner.tasks).extend([handler, watcher]);
    }

    pub fn pubkey(&self) -> &str {
        self.inner.keys.public_key()
    }

    pub fn config(&self) -> &ChatConfig {
        &self.inner.config
    }

    // ---- lifecycle ----

    /// Connect the pool and subscribe to global presence and our own DMs.
    /// Returns the number of relays reached; zero leaves the session
    /// usable but offline.
    pub async fn init(&self) -> Result<usize> {
        self.ensure_handler();
        let connected = self.inner.pool.init().await;
        let _ = self
            .inner
            .observers
            .status
            .send(StatusEvent::Connected { relays: connected });
        if connected == 0 {
            warn!("No relays reachable, session is offline");
            return Ok(0);
        }
        self.inner.subscribe_background().await;
        info!(
            "Chat session {} ready on {} relays",
            self.pubkey(),
            connected
        );
        Ok(connected)
    }

    /// Close every subscription and relay link.
    pub async fn disconnect(&self) {
        let (subscriptions, left) = {
            let mut state = self.inner.state.write().await;
            let mut subscriptions = std::mem::take(&mut state.background);
            let left = state.channel.leave();
            if let Some(left) = &left {
                subscriptions.push(left.subscription_id.clone());
            }
            subscriptions.extend(state.rooms.drain().map(|(_, room)| room.subscription_id));
            (subscriptions, left)
        };
        for id in &subscriptions {
            self.inner.unsubscribe_standing(id).await;
        }
        self.inner.pool.disconnect_all().await;

        if let Some(left) = left {
            let _ = self.inner.observers.status.send(StatusEvent::ChannelLeft {
                channel_id: left.channel_id,
            });
        }
        let _ = self.inner.observers.status.send(StatusEvent::Disconnected);
        info!("Chat session disconnected");
    }

    pub async fn connected_relays(&self) -> Vec<String> {
        self.inner.pool.connected().await
    }

    // ---- channel ----

    /// Join the channel of `origin`, leaving the current one first.
    /// Returns the channel id.
    pub async fn join_channel(&self, origin: &str) -> Result<String> {
        self.ensure_handler();
        self.inner.join_channel(origin).await
    }

    pub async fn leave_channel(&self) -> Result<()> {
        let left = self
            .inner
            .state
            .write()
            .await
            .channel
            .leave()
            .ok_or(ChatError::NoChannel)?;
        self.inner.unsubscribe_standing(&left.subscription_id).await;
        info!("Left channel {}", left.channel_id);
        let _ = self.inner.observers.status.send(StatusEvent::ChannelLeft {
            channel_id: left.channel_id,
        });
        Ok(())
    }

    pub async fn current_channel(&self) -> Option<ChannelInfo> {
        self.inner.state.read().await.channel.info()
    }

    /// Publish a chat message to the current channel.
    pub async fn send_message(&self, content: &str) -> Result<Event> {
        self.inner.send_message(content).await
    }

    /// Announce ourselves in the current channel.
    pub async fn announce_presence(&self) -> Result<Event> {
        self.inner.announce_presence().await
    }

    /// Delivered messages of the current channel, oldest first.
    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.inner.state.read().await.channel.messages()
    }

    pub async fn active_users(&self) -> Vec<ActiveUser> {
        let state = self.inner.state.read().await;
        match state.channel.info() {
            Some(info) => state.presence.active_users(&info.channel_id, now_ms()),
            None => Vec::new(),
        }
    }

    pub async fn global_activity(&self) -> Vec<OriginActivity> {
        self.inner
            .state
            .read()
            .await
            .presence
            .global_activity(now_ms())
    }

    // ---- rooms ----

    /// Keep a live subscription for `ctx`. Accepted items are delivered on
    /// [`ChatClient::subscribe_rooms`] and kept for [`ChatClient::room_items`].
    pub async fn open_room(&self, ctx: &RoomContext) -> Result<RoomKey> {
        self.ensure_handler();
        self.inner.open_room(ctx).await
    }

    /// Returns false if the room was not open.
    pub async fn close_room(&self, key: &RoomKey) -> bool {
        let Some(room) = self.inner.state.write().await.rooms.remove(key) else {
            return false;
        };
        self.inner.unsubscribe_standing(&room.subscription_id).await;
        debug!("Closed room {}", room.subscription_id);
        true
    }

    pub async fn room_items(&self, key: &RoomKey) -> Vec<Classified> {
        self.inner
            .state
            .read()
            .await
            .rooms
            .get(key)
            .map(|room| room.items.iter().map(|(_, item)| item.clone()).collect())
            .unwrap_or_default()
    }

    /// One-shot room query: waits for the backlog (bounded by the fetch
    /// wait), then returns accepted, classified items oldest first.
    pub async fn fetch_room(&self, ctx: &RoomContext) -> Result<Vec<Classified>> {
        let events = self
            .inner
            .query("fetch", vec![self.inner.room_filter(ctx)])
            .await;
        let state = self.inner.state.read().await;
        let cx = self.inner.classify_context(Some(&state.presence));
        Ok(events
            .iter()
            .filter(|event| ctx.accepts(event))
            .map(|event| classify(event, &cx))
            .filter(|item| !item.is_ignored())
            .collect())
    }

    /// Publish a message into a room.
    pub async fn send_to_room(&self, ctx: &RoomContext, content: &str) -> Result<Event> {
        self.inner.send_to_room(ctx, content).await
    }

    /// Full-text search over notes and chat messages.
    pub async fn search(&self, query: &str) -> Result<Vec<ChatMessage>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ChatError::EmptyContent);
        }
        let filter = Filter::new()
            .kinds(RoomMode::Universal.kinds())
            .search(query)
            .limit(self.inner.config.history_limit);
        let events = self.inner.query("search", vec![filter]).await;

        let state = self.inner.state.read().await;
        let cx = self.inner.classify_context(Some(&state.presence));
        Ok(events
            .iter()
            .filter_map(|event| match classify(event, &cx) {
                Classified::Message(message) => Some(message),
                _ => None,
            })
            .collect())
    }

    // ---- direct messages ----

    pub async fn send_dm(&self, peer: &str, content: &str) -> Result<Event> {
        self.inner.send_dm(peer, content).await
    }

    pub async fn conversation(&self, peer: &str) -> Vec<DecryptedMessage> {
        self.inner
            .state
            .read()
            .await
            .dms
            .conversation(&peer.trim().to_lowercase())
            .to_vec()
    }

    /// Peers with a conversation, most recent first.
    pub async fn dm_peers(&self) -> Vec<String> {
        self.inner.state.read().await.dms.peers()
    }

    // ---- preferences ----

    /// Name used in presence announcements. Defaults to a pubkey prefix.
    pub async fn display_name(&self) -> String {
        self.inner.display_name().await
    }

    pub async fn set_display_name(&self, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ChatError::EmptyContent);
        }
        self.inner.store.set(KEY_DISPLAY_NAME, name)?;
        self.inner.prefs.write().await.display_name = Some(name.to_string());
        Ok(())
    }

    /// Returns false if the origin was already pinned.
    pub async fn pin_channel(&self, origin: &str) -> Result<bool> {
        let origin = normalize_origin(origin);
        if origin.is_empty() {
            return Err(ChatError::InvalidRoom("empty origin".to_string()));
        }
        let mut prefs = self.inner.prefs.write().await;
        if prefs.pinned.contains(&origin) {
            return Ok(false);
        }
        let mut pinned = prefs.pinned.clone();
        pinned.push(origin);
        self.inner.persist_pinned(&pinned)?;
        prefs.pinned = pinned;
        Ok(true)
    }

    /// Returns false if the origin was not pinned.
    pub async fn unpin_channel(&self, origin: &str) -> Result<bool> {
        let origin = normalize_origin(origin);
        let mut prefs = self.inner.prefs.write().await;
        if !prefs.pinned.contains(&origin) {
            return Ok(false);
        }
        let pinned: Vec<String> = prefs
            .pinned
            .iter()
            .filter(|p| **p != origin)
            .cloned()
            .collect();
        self.inner.persist_pinned(&pinned)?;
        prefs.pinned = pinned;
        Ok(true)
    }

    pub async fn pinned_channels(&self) -> Vec<String> {
        self.inner.prefs.read().await.pinned.clone()
    }

    // ---- observers ----

    pub fn subscribe_messages(&self) -> broadcast::Receiver<MessageEvent> {
        self.inner.observers.messages.subscribe()
    }

    pub fn subscribe_presence(&self) -> broadcast::Receiver<PresenceUpdate> {
        self.inner.observers.presence.subscribe()
    }

    pub fn subscribe_global_activity(&self) -> broadcast::Receiver<Vec<OriginActivity>> {
        self.inner.observers.global_activity.subscribe()
    }

    pub fn subscribe_dms(&self) -> broadcast::Receiver<DmEvent> {
        self.inner.observers.dms.subscribe()
    }

    pub fn subscribe_rooms(&self) -> broadcast::Receiver<RoomEvent> {
        self.inner.observers.rooms.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.observers.status.subscribe()
    }
}

impl Inner {
    fn classify_context<'a>(&'a self, presence: Option<&'a PresenceTracker>) -> ClassifyContext<'a> {
        ClassifyContext {
            keys: &self.keys,
            gateway: self.gateway.as_ref(),
            presence,
        }
    }

    /// Sign and self-verify. A signature that does not verify is an
    /// integrity fault and the event is never published.
    fn sign(&self, template: &EventTemplate) -> Result<Event> {
        let event = finalize_event_with(self.gateway.as_ref(), template, self.keys.secret_key())?;
        if !verify_event_with(self.gateway.as_ref(), &event) {
            error!("Signed event {} failed self-verification", event.id);
            return Err(ChatError::Integrity(format!(
                "event {} failed self-verification",
                event.id
            )));
        }
        Ok(event)
    }

    async fn require_relays(&self) -> Result<()> {
        if self.pool.connected_count().await == 0 {
            return Err(ChatError::NoRelays);
        }
        Ok(())
    }

    async fn publish(&self, event: &Event) -> Result<()> {
        let report = self.pool.publish_to_all(event).await;
        if report.attempted == 0 {
            return Err(ChatError::NoRelays);
        }
        if !report.is_success() {
            return Err(ChatError::PublishFailed(format!(
                "no relay took event {}",
                event.id
            )));
        }
        Ok(())
    }

    async fn display_name(&self) -> String {
        self.prefs
            .read()
            .await
            .display_name
            .clone()
            .unwrap_or_else(|| self.keys.public_key().chars().take(8).collect())
    }

    fn persist_pinned(&self, pinned: &[String]) -> Result<()> {
        self.store
            .set(KEY_PINNED_CHANNELS, &serde_json::to_string(pinned)?)
    }

    fn room_filter(&self, ctx: &RoomContext) -> Filter {
        ctx.filter()
            .since(unix_now().saturating_sub(self.config.history_window_secs))
            .limit(self.config.history_limit)
    }

    /// Subscription callback that verifies, deduplicates and forwards.
    fn forward<F>(&self, seen: Option<SharedDeduplicator>, wrap: F) -> EventCallback
    where
        F: Fn(Event) -> Inbound + Send + Sync + 'static,
    {
        let gateway = self.gateway.clone();
        let inbound = self.inbound.clone();
        Arc::new(move |event: Event| {
            if !verify_event_with(gateway.as_ref(), &event) {
                debug!("Dropping event {} with bad id or signature", event.id);
                return;
            }
            if let Some(seen) = &seen
                && !seen.insert(&event.id)
            {
                return;
            }
            let _ = inbound.send(wrap(event));
        })
    }

    /// Subscribe on every live relay and remember the subscription so it
    /// can be restored on relays that reconnect later.
    async fn subscribe_standing(
        &self,
        subscription_id: &str,
        filters: Vec<Filter>,
        on_event: EventCallback,
        on_all_complete: CompleteCallback,
        wait: Duration,
    ) -> usize {
        lock(&self.standing).insert(
            subscription_id.to_string(),
            Standing {
                filters: filters.clone(),
                on_event: on_event.clone(),
            },
        );
        self.pool
            .subscribe_all(subscription_id, filters, on_event, on_all_complete, wait)
            .await
    }

    async fn unsubscribe_standing(&self, subscription_id: &str) {
        lock(&self.standing).remove(subscription_id);
        self.pool.unsubscribe_all(subscription_id).await;
    }

    async fn subscribe_background(&self) {
        let previous = std::mem::take(&mut self.state.write().await.background);
        for id in &previous {
            self.unsubscribe_standing(id).await;
        }

        let own = self.keys.public_key().to_string();
        let presence_id = format!("presence-{}", generate_subscription_id());
        let presence_filter = Filter::new()
            .kinds(vec![KIND_CHANNEL_METADATA])
            .since(unix_now().saturating_sub(self.config.presence_window_secs));
        self.subscribe_standing(
            &presence_id,
            vec![presence_filter],
            self.forward(None, Inbound::Presence),
            Box::new(|| {}),
            self.config.fetch_wait(),
        )
        .await;

        let dm_id = format!("dm-{}", generate_subscription_id());
        let dm_filters = vec![
            Filter::new()
                .kinds(vec![ENCRYPTED_DM_KIND])
                .pubkey_refs(vec![own.clone()])
                .limit(self.config.history_limit),
            Filter::new()
                .kinds(vec![ENCRYPTED_DM_KIND])
                .authors(vec![own])
                .limit(self.config.history_limit),
        ];
        self.subscribe_standing(
            &dm_id,
            dm_filters,
            self.forward(None, Inbound::Dm),
            Box::new(|| {}),
            self.config.fetch_wait(),
        )
        .await;

        self.state.write().await.background = vec![presence_id, dm_id];
    }

    async fn join_channel(&self, origin: &str) -> Result<String> {
        let room = RoomContext::channel(origin)?;
        let (Some(channel_id), Some(origin)) = (
            room.channel_id().map(str::to_string),
            room.origin().map(str::to_string),
        ) else {
            return Err(ChatError::InvalidRoom(format!("no origin in {origin:?}")));
        };

        let subscription_id = format!("chan-{}", generate_subscription_id());
        let seen = EventDeduplicator::shared();
        let (generation, left) = {
            let mut state = self.state.write().await;
            if state
                .channel
                .info()
                .is_some_and(|info| info.channel_id == channel_id)
            {
                return Ok(channel_id);
            }
            state
                .channel
                .begin(room.clone(), subscription_id.clone(), seen.clone())
        };

        if let Some(left) = left {
            self.unsubscribe_standing(&left.subscription_id).await;
            let _ = self.observers.status.send(StatusEvent::ChannelLeft {
                channel_id: left.channel_id,
            });
        }
        info!("Joining channel {} ({})", origin, channel_id);
        let _ = self.observers.status.send(StatusEvent::ChannelJoining {
            channel_id: channel_id.clone(),
            origin,
        });

        let history = self.room_filter(&room);
        let presence = Filter::new()
            .kinds(vec![KIND_CHANNEL_METADATA])
            .tag(TAG_CHANNEL, vec![channel_id.clone()])
            .since(unix_now().saturating_sub(self.config.presence_window_secs));

        let on_event = self.forward(Some(seen), move |event| Inbound::Channel { generation, event });
        let inbound = self.inbound.clone();
        let relays = self
            .subscribe_standing(
                &subscription_id,
                vec![history, presence],
                on_event,
                Box::new(move || {
                    let _ = inbound.send(Inbound::ChannelSettled { generation });
                }),
                self.config.join_wait(),
            )
            .await;
        debug!("Join {} sent to {} relays", subscription_id, relays);
        Ok(channel_id)
    }

    async fn announce_presence(&self) -> Result<Event> {
        let room = self
            .state
            .read()
            .await
            .channel
            .room()
            .cloned()
            .ok_or(ChatError::NoChannel)?;
        let content = serde_json::to_string(&PresenceContent {
            name: self.display_name().await,
            origin: room.origin().map(str::to_string),
        })?;
        let event = self.sign(&EventTemplate::now(
            KIND_CHANNEL_METADATA,
            room.tags(),
            content,
        ))?;

        // Local entry first; relays may take a while or never answer.
        if let Some(update) = PresenceUpdate::from_event(&event) {
            let mut state = self.state.write().await;
            self.apply_presence(&mut state, &update);
        }
        self.publish(&event).await?;
        Ok(event)
    }

    async fn send_message(&self, content: &str) -> Result<Event> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::EmptyContent);
        }
        let room = self
            .state
            .read()
            .await
            .channel
            .room()
            .cloned()
            .ok_or(ChatError::NoChannel)?;
        self.require_relays().await?;

        let event = self.sign(&EventTemplate::now(KIND_CHANNEL_MESSAGE, room.tags(), content))?;
        self.publish(&event).await?;

        let mut state = self.state.write().await;
        let message = ChatMessage::from_event(&event, &self.classify_context(Some(&state.presence)));
        if let Some(message) = state.channel.accept_own(message) {
            let _ = self.observers.messages.send(MessageEvent {
                channel_id: room.channel_id().unwrap_or_default().to_string(),
                message,
            });
        }
        Ok(event)
    }

    async fn open_room(&self, ctx: &RoomContext) -> Result<RoomKey> {
        let key = ctx.key();
        let subscription_id = format!("room-{}", generate_subscription_id());
        let seen = EventDeduplicator::shared();
        {
            let mut state = self.state.write().await;
            if state.rooms.contains_key(&key) {
                return Ok(key);
            }
            state.rooms.insert(
                key.clone(),
                OpenRoom {
                    ctx: ctx.clone(),
                    subscription_id: subscription_id.clone(),
                    seen: seen.clone(),
                    items: Vec::new(),
                },
            );
        }

        let event_key = key.clone();
        let on_event = self.forward(Some(seen), move |event| Inbound::Room {
            key: event_key.clone(),
            event,
        });
        let settled_key = key.clone();
        let inbound = self.inbound.clone();
        self.subscribe_standing(
            &subscription_id,
            vec![self.room_filter(ctx)],
            on_event,
            Box::new(move || {
                let _ = inbound.send(Inbound::RoomSettled { key: settled_key });
            }),
            self.config.fetch_wait(),
        )
        .await;
        debug!("Opened room {}", subscription_id);
        Ok(key)
    }

    async fn send_to_room(&self, ctx: &RoomContext, content: &str) -> Result<Event> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::EmptyContent);
        }
        let kind = match ctx.mode() {
            RoomMode::Channel => KIND_CHANNEL_MESSAGE,
            RoomMode::Universal if ctx.channel_id().is_some() => KIND_CHANNEL_MESSAGE,
            RoomMode::Universal => KIND_SHORT_TEXT_NOTE,
            RoomMode::Direct | RoomMode::Announcement => {
                return Err(ChatError::InvalidRoom(format!(
                    "cannot post plain messages to a {:?} room",
                    ctx.mode()
                )));
            }
        };
        self.require_relays().await?;

        let event = self.sign(&EventTemplate::now(kind, ctx.tags(), content))?;
        self.publish(&event).await?;

        let key = ctx.key();
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if let Some(room) = state.rooms.get_mut(&key)
            && room.seen.insert(&event.id)
        {
            let item = Classified::Message(ChatMessage::from_event(
                &event,
                &self.classify_context(Some(&state.presence)),
            ));
            insert_item(&mut room.items, event.created_at, item.clone());
            let _ = self.observers.rooms.send(RoomEvent { key, item });
        }
        Ok(event)
    }

    async fn send_dm(&self, peer: &str, content: &str) -> Result<Event> {
        if content.trim().is_empty() {
            return Err(ChatError::EmptyContent);
        }
        let peer = peer.trim().to_lowercase();
        self.require_relays().await?;

        let template = dm::seal(self.gateway.as_ref(), &self.keys, &peer, content)?;
        let event = self.sign(&template)?;
        self.publish(&event).await?;

        let message = DecryptedMessage {
            id: event.id.clone(),
            pubkey: event.pubkey.clone(),
            content: content.to_string(),
            timestamp_ms: event.created_at_ms(),
            is_own: true,
        };
        if self.state.write().await.dms.insert(&peer, message.clone()) {
            let _ = self.observers.dms.send(DmEvent { peer, message });
        }
        Ok(event)
    }

    /// One-shot fan-out query, settled by completion or the fetch wait.
    /// Verified, deduplicated events come back oldest first.
    async fn query(&self, prefix: &str, filters: Vec<Filter>) -> Vec<Event> {
        let subscription_id = format!("{prefix}-{}", generate_subscription_id());
        let seen = EventDeduplicator::shared();
        let collected = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = oneshot::channel();

        let on_event: EventCallback = {
            let gateway = self.gateway.clone();
            let collected = collected.clone();
            Arc::new(move |event: Event| {
                if verify_event_with(gateway.as_ref(), &event) && seen.insert(&event.id) {
                    lock(&collected).push(event);
                }
            })
        };
        self.pool
            .subscribe_all(
                &subscription_id,
                filters,
                on_event,
                Box::new(move || {
                    let _ = done_tx.send(());
                }),
                self.config.fetch_wait(),
            )
            .await;
        let _ = done_rx.await;
        self.pool.unsubscribe_all(&subscription_id).await;

        let mut events = std::mem::take(&mut *lock(&collected));
        sort_events_chronological(&mut events);
        debug!("Query {} returned {} events", subscription_id, events.len());
        events
    }

    fn apply_presence(&self, state: &mut SessionState, update: &PresenceUpdate) {
        if state.presence.apply(update) {
            let _ = self.observers.presence.send(update.clone());
            let _ = self
                .observers
                .global_activity
                .send(state.presence.global_activity(now_ms()));
        }
    }

    // ---- handler task ----

    async fn handle(&self, item: Inbound) {
        match item {
            Inbound::Channel { generation, event } => self.on_channel_event(generation, event).await,
            Inbound::ChannelSettled { generation } => self.on_channel_settled(generation).await,
            Inbound::Room { key, event } => self.on_room_event(key, event).await,
            Inbound::RoomSettled { key } => {
                if self.state.read().await.rooms.contains_key(&key) {
                    let _ = self.observers.status.send(StatusEvent::RoomReady { key });
                }
            }
            Inbound::Presence(event) => {
                if let Some(update) = PresenceUpdate::from_event(&event) {
                    let mut state = self.state.write().await;
                    self.apply_presence(&mut state, &update);
                }
            }
            Inbound::Dm(event) => self.on_dm(event).await,
            Inbound::Link(link) => self.on_link(link).await,
        }
    }

    /// Restore standing subscriptions on a reconnected relay and publish
    /// the relay count after every link change past `init`.
    async fn on_link(&self, link: LinkEvent) {
        match &link {
            // Counted by init itself.
            LinkEvent::Up {
                reconnect: false, ..
            } => return,
            LinkEvent::Up { url, .. } => {
                let standing: Vec<(String, Standing)> = lock(&self.standing)
                    .iter()
                    .map(|(id, sub)| (id.clone(), sub.clone()))
                    .collect();
                let mut restored = 0;
                for (id, sub) in standing {
                    if self.pool.subscribe_on(url, &id, sub.filters, sub.on_event).await {
                        restored += 1;
                    }
                }
                info!("Relay {} is back, restored {} subscriptions", url, restored);
            }
            LinkEvent::Down { url } => warn!("Lost relay {}", url),
        }
        let relays = self.pool.connected_count().await;
        let _ = self.observers.status.send(StatusEvent::Connected { relays });
    }

    async fn on_channel_event(&self, generation: u64, event: Event) {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if !state.channel.is_current(generation) {
            return;
        }
        let Some(room) = state.channel.room() else {
            return;
        };
        if !room.accepts(&event) {
            debug!("Event {} is not in the joined channel", event.id);
            return;
        }
        let channel_id = room.channel_id().unwrap_or_default().to_string();

        let item = classify(&event, &self.classify_context(Some(&state.presence)));
        match item {
            Classified::Message(message) => {
                if let Some(message) = state.channel.accept(generation, message) {
                    let _ = self
                        .observers
                        .messages
                        .send(MessageEvent { channel_id, message });
                }
            }
            Classified::Presence(update) => self.apply_presence(state, &update),
            _ => {}
        }
    }

    async fn on_channel_settled(&self, generation: u64) {
        let settled = {
            let mut state = self.state.write().await;
            let channel_id = state
                .channel
                .info()
                .map(|info| info.channel_id)
                .unwrap_or_default();
            state
                .channel
                .complete(generation)
                .map(|backlog| (channel_id, backlog))
        };
        let Some((channel_id, backlog)) = settled else {
            return;
        };

        let count = backlog.len();
        for message in backlog {
            let _ = self.observers.messages.send(MessageEvent {
                channel_id: channel_id.clone(),
                message,
            });
        }
        info!("Joined channel {} with {} backlog messages", channel_id, count);
        let _ = self.observers.status.send(StatusEvent::ChannelJoined {
            channel_id,
            backlog: count,
        });

        if let Err(e) = self.announce_presence().await {
            warn!("Presence announcement failed: {}", e);
        }
    }

    async fn on_room_event(&self, key: RoomKey, event: Event) {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let Some(room) = state.rooms.get_mut(&key) else {
            return;
        };
        if !room.ctx.accepts(&event) {
            return;
        }
        let item = classify(&event, &self.classify_context(Some(&state.presence)));
        if item.is_ignored() {
            return;
        }
        insert_item(&mut room.items, event.created_at, item.clone());
        if let Classified::Presence(update) = &item {
            self.apply_presence(state, update);
        }
        let _ = self.observers.rooms.send(RoomEvent { key, item });
    }

    async fn on_dm(&self, event: Event) {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if state.dms.contains(&event.id) {
            return;
        }
        if let Classified::DirectMessage { peer, message } =
            classify(&event, &self.classify_context(None))
            && state.dms.insert(&peer, message.clone())
        {
            let _ = self.observers.dms.send(DmEvent { peer, message });
        }
    }
}

fn insert_item(items: &mut Vec<(u64, Classified)>, created_at: u64, item: Classified) {
    let at = items.partition_point(|(t, _)| *t <= created_at);
    items.insert(at, (created_at, item));
}
