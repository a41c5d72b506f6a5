//! Multi-relay chat engine.
//!
//! This crate provides:
//! - Origin channels: every URL maps to one deterministic channel id
//! - Rooms addressed by origin, participants and subject, with membership rules
//! - Presence tracking per channel and per origin
//! - NIP-04 direct messages with per-peer conversations
//! - A single session facade, [`ChatClient`], with broadcast observers
//!
//! # Example
//!
//! ```rust,no_run
//! use nostr_chat::{ChatClient, ChatConfig, MemoryStore, StatusEvent};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> nostr_chat::Result<()> {
//!     let client = ChatClient::new(ChatConfig::default(), Arc::new(MemoryStore::new()))?;
//!     let mut status = client.subscribe_status();
//!     let mut messages = client.subscribe_messages();
//!
//!     client.init().await?;
//!     client.join_channel("https://example.com/article").await?;
//!
//!     while let Ok(event) = status.recv().await {
//!         if let StatusEvent::ChannelJoined { backlog, .. } = event {
//!             println!("Joined with {} messages", backlog);
//!             break;
//!         }
//!     }
//!     client.send_message("hello").await?;
//!
//!     while let Ok(event) = messages.recv().await {
//!         println!("{}: {}", event.message.name, event.message.content);
//!     }
//!     Ok(())
//! }
//! ```

mod channel;
mod classify;
mod client;
mod config;
mod dm;
mod error;
mod events;
mod presence;
mod room;
mod store;

pub use channel::{ChannelInfo, ChannelState, JoinPhase, LeftChannel};
pub use classify::{ChatMessage, Classified, ClassifyContext, Post, classify, extract_media};
pub use client::ChatClient;
pub use config::{ChatConfig, load_config, save_config};
pub use dm::{DecryptedMessage, DmStore, counterpart};
pub use error::{ChatError, Result};
pub use events::{DmEvent, MessageEvent, RoomEvent, StatusEvent};
pub use presence::{
    ActiveUser, OriginActivity, PRESENCE_WINDOW_MS, PresenceContent, PresenceRecord,
    PresenceTracker, PresenceUpdate,
};
pub use room::{
    RoomContext, RoomContextBuilder, RoomKey, RoomMode, TAG_CHANNEL, TAG_ORIGIN,
    TAG_PARTICIPANT, TAG_SUBJECT, channel_id, normalize_origin,
};
pub use store::{
    JsonFileStore, KEY_DISPLAY_NAME, KEY_PINNED_CHANNELS, KEY_SECRET, KeyValueStore, MemoryStore,
};

// Re-export the protocol types that appear in this crate's API
pub use nostr::{Event, Keys};
pub use nostr_client::{DEFAULT_RELAYS, MemoryTransport, Transport};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_id_ignores_presentation_details() {
        let id = channel_id("https://example.com/path");
        assert_eq!(id.len(), 64);
        assert_eq!(id, channel_id("https://example.com/path/"));
        assert_eq!(id, channel_id("https://example.com/path#comments"));
        assert_eq!(id, channel_id("https://example.com/path?utm=1"));
        assert_ne!(id, channel_id("https://example.com/other"));
    }

    #[test]
    fn test_default_config_uses_default_relays() {
        let config = ChatConfig::default();
        assert_eq!(config.relays.len(), DEFAULT_RELAYS.len());
    }
}
