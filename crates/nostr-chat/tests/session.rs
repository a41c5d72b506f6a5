//! Chat session integration tests over the in-memory transport.

use nostr::{EventTemplate, finalize_event, unix_now};
use nostr_chat::{
    ChatClient, ChatConfig, ChatError, Classified, Event, JsonFileStore, Keys, MemoryStore,
    OriginActivity, RoomContext, RoomMode, StatusEvent, channel_id,
};
use nostr_client::{ClientMessage, Filter, MemoryTransport, RelayEnd, RelayMessage};
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use tempfile::TempDir;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{Duration, sleep, timeout};

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

macro_rules! eventually {
    ($cond:expr) => {{
        let mut held = false;
        for _ in 0..200 {
            if $cond {
                held = true;
                break;
            }
            sleep(Duration::from_millis(25)).await;
        }
        assert!(held, "condition never held: {}", stringify!($cond));
    }};
}

/// Scripted relay: answers REQs from storage, then EOSE, and forwards
/// newly published events to matching live subscriptions.
#[derive(Clone)]
struct Relay {
    stored: Arc<Mutex<Vec<Event>>>,
    live: broadcast::Sender<Event>,
    /// Every REQ subscription id, in arrival order
    requests: Arc<Mutex<Vec<String>>>,
    kick: broadcast::Sender<()>,
}

impl Relay {
    fn new(stored: Vec<Event>) -> Self {
        Self {
            stored: Arc::new(Mutex::new(stored)),
            live: broadcast::channel(256).0,
            requests: Arc::new(Mutex::new(Vec::new())),
            kick: broadcast::channel(4).0,
        }
    }

    fn serve(&self, mut listener: UnboundedReceiver<RelayEnd>) {
        let relay = self.clone();
        tokio::spawn(async move {
            while let Some(end) = listener.recv().await {
                tokio::spawn(relay.clone().session(end));
            }
        });
    }

    async fn session(self, mut end: RelayEnd) {
        let mut live = self.live.subscribe();
        let mut kick = self.kick.subscribe();
        let mut subscriptions: HashMap<String, Vec<Filter>> = HashMap::new();
        loop {
            tokio::select! {
                message = end.recv_message() => match message {
                    Some(ClientMessage::Req { subscription_id, filters }) => {
                        self.requests.lock().unwrap().push(subscription_id.clone());
                        let stored = self.stored.lock().unwrap().clone();
                        for event in stored {
                            if filters.iter().any(|f| f.matches(&event)) {
                                end.send(&RelayMessage::Event {
                                    subscription_id: subscription_id.clone(),
                                    event,
                                });
                            }
                        }
                        end.send(&RelayMessage::Eose {
                            subscription_id: subscription_id.clone(),
                        });
                        subscriptions.insert(subscription_id, filters);
                    }
                    Some(ClientMessage::Event(event)) => {
                        end.send(&RelayMessage::Ok {
                            event_id: event.id.clone(),
                            success: true,
                            message: String::new(),
                        });
                        self.stored.lock().unwrap().push(event.clone());
                        let _ = self.live.send(event);
                    }
                    Some(ClientMessage::Close { subscription_id }) => {
                        subscriptions.remove(&subscription_id);
                    }
                    None => break,
                },
                _ = kick.recv() => break,
                Ok(event) = live.recv() => {
                    for (subscription_id, filters) in &subscriptions {
                        if filters.iter().any(|f| f.matches(&event)) {
                            end.send(&RelayMessage::Event {
                                subscription_id: subscription_id.clone(),
                                event: event.clone(),
                            });
                        }
                    }
                }
            }
        }
    }

    /// Close every open link; clients see a link loss.
    fn drop_links(&self) {
        let _ = self.kick.send(());
    }

    fn requests(&self, prefix: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|id| id.starts_with(prefix))
            .count()
    }

    fn published(&self, kind: u16) -> Vec<Event> {
        self.stored
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }
}

struct Network {
    transport: MemoryTransport,
    urls: Vec<String>,
    relays: Vec<Relay>,
}

fn network(urls: &[&str], stored: Vec<Event>) -> Network {
    init_tracing();
    let transport = MemoryTransport::new();
    let relays = urls
        .iter()
        .map(|url| {
            let relay = Relay::new(stored.clone());
            relay.serve(transport.listen(url));
            relay
        })
        .collect();
    Network {
        transport,
        urls: urls.iter().map(|u| u.to_string()).collect(),
        relays,
    }
}

impl Network {
    fn client(&self) -> ChatClient {
        self.client_with(ChatConfig::with_relays(self.urls.clone()))
    }

    fn client_with(&self, config: ChatConfig) -> ChatClient {
        ChatClient::with_transport(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(self.transport.clone()),
        )
        .unwrap()
    }
}

fn sign(keys: &Keys, kind: u16, tags: Vec<Vec<String>>, content: &str, age_secs: u64) -> Event {
    let template = EventTemplate {
        created_at: unix_now() - age_secs,
        kind,
        tags,
        content: content.to_string(),
    };
    finalize_event(&template, keys.secret_key()).unwrap()
}

fn tag(name: &str, value: &str) -> Vec<String> {
    vec![name.to_string(), value.to_string()]
}

async fn wait_for<T: Clone>(rx: &mut broadcast::Receiver<T>, mut pred: impl FnMut(&T) -> bool) -> T {
    timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(value) if pred(&value) => return value,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("observer closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for observer")
}

fn contents(items: &[Classified]) -> Vec<String> {
    items
        .iter()
        .map(|item| match item {
            Classified::Message(m) => m.content.clone(),
            other => panic!("unexpected item {other:?}"),
        })
        .collect()
}

#[tokio::test]
async fn test_join_delivers_duplicated_backlog_once() {
    let author = Keys::generate();
    let channel = channel_id("https://example.com/path");
    let backlog = sign(
        &author,
        42,
        vec![tag("h", &channel), tag("r", "https://example.com/path")],
        "first!",
        60,
    );
    let net = network(&["wss://a.test", "wss://b.test"], vec![backlog.clone()]);
    let client = net.client();
    let mut status = client.subscribe_status();
    let mut messages = client.subscribe_messages();

    assert_eq!(client.init().await.unwrap(), 2);
    let joined = client.join_channel("https://example.com/path/").await.unwrap();
    assert_eq!(joined, channel);

    let event = wait_for(&mut status, |s| matches!(s, StatusEvent::ChannelJoined { .. })).await;
    assert_eq!(
        event,
        StatusEvent::ChannelJoined {
            channel_id: channel.clone(),
            backlog: 1
        }
    );

    let delivered = messages.try_recv().unwrap();
    assert_eq!(delivered.message.id, backlog.id);
    assert_eq!(delivered.channel_id, channel);
    assert!(messages.try_recv().is_err());
    assert_eq!(client.messages().await.len(), 1);

    let info = client.current_channel().await.unwrap();
    assert_eq!(info.origin, "https://example.com/path");

    // Joining announces presence on every relay.
    eventually!(net.relays.iter().all(|r| r.published(41).len() == 1));
    let users = client.active_users().await;
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].pubkey, client.pubkey());
}

#[tokio::test]
async fn test_own_message_and_echo_delivered_once() {
    let net = network(&["wss://a.test"], vec![]);
    let client = net.client();
    let mut status = client.subscribe_status();
    client.init().await.unwrap();
    client.join_channel("https://a.test/post").await.unwrap();
    wait_for(&mut status, |s| matches!(s, StatusEvent::ChannelJoined { .. })).await;

    let sent = client
        .send_message("look https://img.test/cat.png")
        .await
        .unwrap();
    assert_eq!(sent.kind, 42);
    assert!(sent.has_tag("h", &channel_id("https://a.test/post")));

    eventually!(net.relays[0].published(42).len() == 1);
    sleep(Duration::from_millis(100)).await;
    let messages = client.messages().await;
    assert_eq!(messages.len(), 1);
    assert!(messages[0].is_own);
    assert_eq!(messages[0].images, vec!["https://img.test/cat.png"]);

    assert!(matches!(
        client.send_message("   ").await,
        Err(ChatError::EmptyContent)
    ));
    client.leave_channel().await.unwrap();
    assert!(matches!(
        client.send_message("anyone?").await,
        Err(ChatError::NoChannel)
    ));
    assert!(matches!(
        client.leave_channel().await,
        Err(ChatError::NoChannel)
    ));
}

#[tokio::test]
async fn test_presence_across_sessions() {
    let net = network(&["wss://a.test"], vec![]);
    let alice = net.client();
    let bob = net.client();
    bob.set_display_name("Bob").await.unwrap();

    let mut alice_status = alice.subscribe_status();
    alice.init().await.unwrap();
    bob.init().await.unwrap();
    alice.join_channel("https://example.com/path").await.unwrap();
    wait_for(&mut alice_status, |s| matches!(s, StatusEvent::ChannelJoined { .. })).await;
    bob.join_channel("https://example.com/path#comments").await.unwrap();

    eventually!(alice.active_users().await.len() == 2);
    let users = alice.active_users().await;
    let bob_entry = users.iter().find(|u| u.pubkey == bob.pubkey()).unwrap();
    assert_eq!(bob_entry.display_name, "Bob");

    eventually!(alice.global_activity().await.first().is_some_and(|a| a.active_count == 2));
    assert_eq!(
        alice.global_activity().await,
        vec![OriginActivity {
            origin: "https://example.com/path".to_string(),
            active_count: 2,
        }]
    );
}

#[tokio::test]
async fn test_dm_without_relays_fails() {
    init_tracing();
    let client = ChatClient::with_transport(
        ChatConfig::with_relays(vec![]),
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryTransport::new()),
    )
    .unwrap();
    assert_eq!(client.init().await.unwrap(), 0);

    let peer = Keys::generate();
    let result = client.send_dm(peer.public_key(), "hello?").await;
    assert!(matches!(result, Err(ChatError::NoRelays)));
    assert!(client.conversation(peer.public_key()).await.is_empty());
    assert!(client.dm_peers().await.is_empty());
}

#[tokio::test]
async fn test_offline_join_settles_but_cannot_send() {
    init_tracing();
    let net = network(&["wss://down.test"], vec![]);
    net.transport.set_refused("wss://down.test", true);
    let client = net.client();
    let mut status = client.subscribe_status();

    assert_eq!(client.init().await.unwrap(), 0);
    client.join_channel("https://a.test").await.unwrap();
    let joined = wait_for(&mut status, |s| matches!(s, StatusEvent::ChannelJoined { .. })).await;
    assert!(matches!(joined, StatusEvent::ChannelJoined { backlog: 0, .. }));

    assert!(matches!(
        client.send_message("hi").await,
        Err(ChatError::NoRelays)
    ));
    assert!(client.messages().await.is_empty());
}

#[tokio::test]
async fn test_dm_between_sessions() {
    let net = network(&["wss://a.test"], vec![]);
    let alice = net.client();
    let bob = net.client();
    let mut bob_dms = bob.subscribe_dms();
    alice.init().await.unwrap();
    bob.init().await.unwrap();

    alice.send_dm(bob.pubkey(), "hi bob").await.unwrap();
    let received = wait_for(&mut bob_dms, |_| true).await;
    assert_eq!(received.peer, alice.pubkey());
    assert_eq!(received.message.content, "hi bob");
    assert!(!received.message.is_own);

    // The relay copy is ciphertext.
    let stored = net.relays[0].published(4);
    assert_eq!(stored.len(), 1);
    assert_ne!(stored[0].content, "hi bob");

    eventually!(alice.conversation(bob.pubkey()).await.len() == 1);
    sleep(Duration::from_millis(100)).await;
    let mine = alice.conversation(bob.pubkey()).await;
    assert_eq!(mine.len(), 1);
    assert!(mine[0].is_own);
    assert_eq!(alice.dm_peers().await, vec![bob.pubkey().to_string()]);
    assert_eq!(bob.dm_peers().await, vec![alice.pubkey().to_string()]);
}

#[tokio::test]
async fn test_fetch_room_membership() {
    let a = Keys::generate();
    let b = Keys::generate();
    let c = Keys::generate();
    let (pa, pb, pc) = (a.public_key(), b.public_key(), c.public_key());
    let stored = vec![
        sign(&a, 1, vec![tag("p", pa), tag("p", pb)], "both", 40),
        sign(&a, 1, vec![tag("p", pa)], "only a", 30),
        sign(&b, 1, vec![tag("p", pa), tag("p", pb), tag("p", pc)], "three", 20),
        sign(
            &a,
            42,
            vec![tag("h", &channel_id("https://x.test")), tag("p", pa), tag("p", pb)],
            "in a channel",
            10,
        ),
    ];
    let net = network(&["wss://a.test", "wss://b.test"], stored);
    let client = net.client();
    client.init().await.unwrap();

    let direct = RoomContext::direct(pa, pb).unwrap();
    let items = client.fetch_room(&direct).await.unwrap();
    assert_eq!(contents(&items), vec!["both", "three"]);

    let strict = RoomContext::builder()
        .users([pb, pa])
        .strict(true)
        .build()
        .unwrap();
    let items = client.fetch_room(&strict).await.unwrap();
    assert_eq!(contents(&items), vec!["both", "three", "in a channel"]);

    let open = RoomContext::builder().user(pa).build().unwrap();
    assert_eq!(client.fetch_room(&open).await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_open_room_receives_live_posts() {
    let net = network(&["wss://a.test"], vec![]);
    let alice = net.client();
    let bob = net.client();
    alice.init().await.unwrap();
    bob.init().await.unwrap();

    let room = RoomContext::builder().subject("rust").build().unwrap();
    let mut status = alice.subscribe_status();
    let mut rooms = alice.subscribe_rooms();
    let key = alice.open_room(&room).await.unwrap();
    wait_for(&mut status, |s| matches!(s, StatusEvent::RoomReady { .. })).await;

    let sent = bob.send_to_room(&room, "borrowck is fine").await.unwrap();
    assert_eq!(sent.kind, 1);
    let event = wait_for(&mut rooms, |_| true).await;
    assert_eq!(event.key, key);
    assert_eq!(contents(&[event.item]), vec!["borrowck is fine"]);
    assert_eq!(alice.room_items(&key).await.len(), 1);

    let dm_room = RoomContext::builder()
        .subject("rust")
        .mode(RoomMode::Direct)
        .build()
        .unwrap();
    assert!(matches!(
        bob.send_to_room(&dm_room, "x").await,
        Err(ChatError::InvalidRoom(_))
    ));

    assert!(alice.close_room(&key).await);
    assert!(!alice.close_room(&key).await);
    assert!(alice.room_items(&key).await.is_empty());
}

#[tokio::test]
async fn test_search_matches_text() {
    let author = Keys::generate();
    let stored = vec![
        sign(&author, 1, vec![], "Rust 2024 edition notes", 30),
        sign(&author, 42, vec![], "python packaging", 20),
    ];
    let net = network(&["wss://a.test"], stored);
    let client = net.client();
    client.init().await.unwrap();

    let found = client.search("rust").await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].content, "Rust 2024 edition notes");
    assert!(matches!(
        client.search("  ").await,
        Err(ChatError::EmptyContent)
    ));
}

#[tokio::test]
async fn test_identity_and_preferences_persist() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("chat.json");
    let open = |path: &std::path::Path| {
        ChatClient::with_transport(
            ChatConfig::with_relays(vec![]),
            Arc::new(JsonFileStore::open(path).unwrap()),
            Arc::new(MemoryTransport::new()),
        )
        .unwrap()
    };

    let first = open(&path);
    let pubkey = first.pubkey().to_string();
    assert_eq!(first.display_name().await, &pubkey[..8]);
    first.set_display_name("  Alice ").await.unwrap();
    assert!(first.pin_channel("https://a.test/x/").await.unwrap());
    assert!(!first.pin_channel("https://a.test/x#top").await.unwrap());
    assert!(first.pin_channel("https://b.test").await.unwrap());
    drop(first);

    let second = open(&path);
    assert_eq!(second.pubkey(), pubkey);
    assert_eq!(second.display_name().await, "Alice");
    assert_eq!(
        second.pinned_channels().await,
        vec!["https://a.test/x".to_string(), "https://b.test".to_string()]
    );
    assert!(second.unpin_channel("https://a.test/x").await.unwrap());
    assert!(!second.unpin_channel("https://a.test/x").await.unwrap());
    drop(second);

    let third = open(&path);
    assert_eq!(third.pinned_channels().await, vec!["https://b.test".to_string()]);
    assert!(matches!(
        third.set_display_name(" ").await,
        Err(ChatError::EmptyContent)
    ));
}

#[tokio::test]
async fn test_reconnected_relay_gets_subscriptions_back() {
    let net = network(&["wss://a.test", "wss://b.test"], vec![]);
    let mut config = ChatConfig::with_relays(net.urls.clone());
    config.reconnect_delay_ms = 50;
    let alice = net.client_with(config);
    let mut status = alice.subscribe_status();

    assert_eq!(alice.init().await.unwrap(), 2);
    alice.join_channel("https://example.com/path").await.unwrap();
    wait_for(&mut status, |s| matches!(s, StatusEvent::ChannelJoined { .. })).await;
    let b = &net.relays[1];
    assert_eq!(b.requests("chan-"), 1);

    b.drop_links();
    wait_for(&mut status, |s| *s == StatusEvent::Connected { relays: 1 }).await;
    wait_for(&mut status, |s| *s == StatusEvent::Connected { relays: 2 }).await;
    assert_eq!(alice.connected_relays().await.len(), 2);

    // Same ids, re-issued on the new link only.
    eventually!(b.requests("chan-") == 2);
    eventually!(b.requests("presence-") == 2 && b.requests("dm-") == 2);
    assert_eq!(net.relays[0].requests("chan-"), 1);

    // Bob only reaches b, so alice hears him through the restored link.
    let bob = net.client_with(ChatConfig::with_relays(vec!["wss://b.test".to_string()]));
    let mut bob_status = bob.subscribe_status();
    bob.init().await.unwrap();
    bob.join_channel("https://example.com/path").await.unwrap();
    wait_for(&mut bob_status, |s| matches!(s, StatusEvent::ChannelJoined { .. })).await;
    bob.send_message("back online").await.unwrap();
    bob.send_dm(alice.pubkey(), "psst").await.unwrap();

    eventually!(alice.messages().await.iter().any(|m| m.content == "back online"));
    eventually!(alice.conversation(bob.pubkey()).await.len() == 1);
    assert!(net.relays[0].published(42).is_empty());

    alice.disconnect().await;
    wait_for(&mut status, |s| *s == StatusEvent::Disconnected).await;
}
