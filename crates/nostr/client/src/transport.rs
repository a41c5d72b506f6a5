//! Transport seam between a relay connection and the network.
//!
//! A [`Transport`] opens a [`Link`]: a sink of outgoing text frames and a
//! stream of incoming ones. The stream ending (or yielding an error) is link
//! loss. [`WebSocketTransport`] is the production implementation;
//! [`MemoryTransport`] wires connections to in-process relay ends so tests
//! and embedders can drive the relay side directly.

use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, RelayMessage};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use url::Url;

pub type FrameSink = Pin<Box<dyn Sink<String, Error = ClientError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// An open, bidirectional text-frame link to one relay.
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens links to relays.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, url: &Url) -> Result<Link>;
}

/// WebSocket transport over tokio-tungstenite.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &Url) -> Result<Link> {
        let (ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| ClientError::WebSocket(e.to_string()))?;
        let (write, read) = ws.split();

        let sink = write
            .sink_map_err(|e| ClientError::WebSocket(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, ClientError>(Message::Text(text.into()))));

        // Pings are answered by tungstenite itself; only text frames matter.
        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_string())),
                Ok(_) => None,
                Err(e) => Some(Err(ClientError::WebSocket(e.to_string()))),
            })
        });

        Ok(Link {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// Relay side of an in-memory link.
///
/// Dropping a `RelayEnd` closes the link, which the client sees as link loss.
pub struct RelayEnd {
    url: String,
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<String>,
}

impl RelayEnd {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Next raw frame sent by the client, `None` once the client closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.next().await
    }

    /// Next frame sent by the client, parsed. Unparseable frames are skipped.
    pub async fn recv_message(&mut self) -> Option<ClientMessage> {
        while let Some(frame) = self.recv().await {
            match ClientMessage::from_json(&frame) {
                Ok(message) => return Some(message),
                Err(e) => debug!("memory relay {} skipping frame: {}", self.url, e),
            }
        }
        None
    }

    /// Push a raw frame to the client. Returns false once the client is gone.
    pub fn send_raw(&self, frame: impl Into<String>) -> bool {
        self.to_client.unbounded_send(frame.into()).is_ok()
    }

    pub fn send(&self, message: &RelayMessage) -> bool {
        self.send_raw(message.to_json())
    }
}

#[derive(Default)]
struct MemoryState {
    listeners: HashMap<String, tokio::sync::mpsc::UnboundedSender<RelayEnd>>,
    refused: HashSet<String>,
    stalled: HashSet<String>,
    attempts: HashMap<String, Vec<Instant>>,
}

/// In-process transport.
///
/// Only URLs registered with [`MemoryTransport::listen`] accept links. Every
/// open attempt is timestamped with the tokio clock, so paused-time tests can
/// assert on reconnect timing.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

fn key(url: &str) -> String {
    Url::parse(url)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| url.to_string())
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        match self.state.lock() {
            Ok(mut state) => f(&mut state),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Accept links for `url`; each successful open yields one [`RelayEnd`].
    pub fn listen(&self, url: &str) -> tokio::sync::mpsc::UnboundedReceiver<RelayEnd> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.with_state(|state| {
            state.listeners.insert(key(url), tx);
        });
        rx
    }

    /// Refuse (or stop refusing) new links to `url`.
    pub fn set_refused(&self, url: &str, refused: bool) {
        self.with_state(|state| {
            if refused {
                state.refused.insert(key(url));
            } else {
                state.refused.remove(&key(url));
            }
        });
    }

    /// Make opens to `url` hang forever (until the caller times out).
    pub fn set_stalled(&self, url: &str, stalled: bool) {
        self.with_state(|state| {
            if stalled {
                state.stalled.insert(key(url));
            } else {
                state.stalled.remove(&key(url));
            }
        });
    }

    /// Instants of every open attempt made to `url`.
    pub fn attempts(&self, url: &str) -> Vec<Instant> {
        self.with_state(|state| state.attempts.get(&key(url)).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, url: &Url) -> Result<Link> {
        let url_key = url.to_string();
        let (stalled, refused, listener) = self.with_state(|state| {
            state
                .attempts
                .entry(url_key.clone())
                .or_default()
                .push(Instant::now());
            (
                state.stalled.contains(&url_key),
                state.refused.contains(&url_key),
                state.listeners.get(&url_key).cloned(),
            )
        });

        if stalled {
            future::pending::<()>().await;
        }
        let listener = match listener {
            Some(listener) if !refused => listener,
            _ => {
                return Err(ClientError::Transport(format!(
                    "connection refused: {url_key}"
                )));
            }
        };

        let (client_tx, from_client) = mpsc::unbounded::<String>();
        let (to_client, client_rx) = mpsc::unbounded::<String>();
        let end = RelayEnd {
            url: url_key.clone(),
            from_client,
            to_client,
        };
        if listener.send(end).is_err() {
            return Err(ClientError::Transport(format!(
                "no relay listening on {url_key}"
            )));
        }

        Ok(Link {
            sink: Box::pin(client_tx.sink_map_err(|e| ClientError::Transport(e.to_string()))),
            stream: Box::pin(client_rx.map(Ok)),
        })
    }
}
