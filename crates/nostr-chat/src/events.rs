//! Observer payloads.
//!
//! Each category has its own broadcast channel on [`crate::ChatClient`]. Any
//! number of receivers may subscribe; dropping a receiver unsubscribes it.

use crate::classify::{ChatMessage, Classified};
use crate::dm::DecryptedMessage;
use crate::presence::{OriginActivity, PresenceUpdate};
use crate::room::RoomKey;
use tokio::sync::broadcast;

/// A chat line delivered in the current channel.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub channel_id: String,
    pub message: ChatMessage,
}

/// A direct message stored in a conversation.
#[derive(Debug, Clone)]
pub struct DmEvent {
    pub peer: String,
    pub message: DecryptedMessage,
}

/// An item accepted into an open room.
#[derive(Debug, Clone)]
pub struct RoomEvent {
    pub key: RoomKey,
    pub item: Classified,
}

/// Session lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// Connected relay count, after `init` and on every later link loss or reconnect
    Connected { relays: usize },
    Disconnected,
    ChannelJoining { channel_id: String, origin: String },
    ChannelJoined { channel_id: String, backlog: usize },
    ChannelLeft { channel_id: String },
    /// An open room's backlog settled
    RoomReady { key: RoomKey },
}

#[derive(Debug)]
pub(crate) struct Observers {
    pub messages: broadcast::Sender<MessageEvent>,
    pub presence: broadcast::Sender<PresenceUpdate>,
    pub global_activity: broadcast::Sender<Vec<OriginActivity>>,
    pub dms: broadcast::Sender<DmEvent>,
    pub rooms: broadcast::Sender<RoomEvent>,
    pub status: broadcast::Sender<StatusEvent>,
}

impl Observers {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            messages: broadcast::channel(capacity).0,
            presence: broadcast::channel(capacity).0,
            global_activity: broadcast::channel(capacity).0,
            dms: broadcast::channel(capacity).0,
            rooms: broadcast::channel(capacity).0,
            status: broadcast::channel(capacity).0,
        }
    }
}
