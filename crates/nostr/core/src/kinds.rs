//! Event kinds understood by the chat engine.

use serde::{Deserialize, Serialize};

pub const KIND_SHORT_TEXT_NOTE: u16 = 1;
pub const ENCRYPTED_DM_KIND: u16 = 4;
pub const REPOST_KIND: u16 = 6;
pub const REACTION_KIND: u16 = 7;
/// NIP-28 channel metadata, used for presence announcements.
pub const KIND_CHANNEL_METADATA: u16 = 41;
/// NIP-28 channel message.
pub const KIND_CHANNEL_MESSAGE: u16 = 42;
pub const ZAP_REQUEST_KIND: u16 = 9734;
pub const ZAP_RECEIPT_KIND: u16 = 9735;
pub const ARTICLE_KIND: u16 = 30023;

/// Closed set of kinds with dedicated handling; everything else is `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Note,
    EncryptedDm,
    Repost,
    Reaction,
    Presence,
    ChatMessage,
    ZapReceipt,
    Article,
    Other(u16),
}

impl EventKind {
    pub fn as_u16(self) -> u16 {
        match self {
            EventKind::Note => KIND_SHORT_TEXT_NOTE,
            EventKind::EncryptedDm => ENCRYPTED_DM_KIND,
            EventKind::Repost => REPOST_KIND,
            EventKind::Reaction => REACTION_KIND,
            EventKind::Presence => KIND_CHANNEL_METADATA,
            EventKind::ChatMessage => KIND_CHANNEL_MESSAGE,
            EventKind::ZapReceipt => ZAP_RECEIPT_KIND,
            EventKind::Article => ARTICLE_KIND,
            EventKind::Other(kind) => kind,
        }
    }

    /// Kinds rendered as chat lines.
    pub fn is_chat(self) -> bool {
        matches!(self, EventKind::Note | EventKind::ChatMessage)
    }
}

impl From<u16> for EventKind {
    fn from(kind: u16) -> Self {
        match kind {
            KIND_SHORT_TEXT_NOTE => EventKind::Note,
            ENCRYPTED_DM_KIND => EventKind::EncryptedDm,
            REPOST_KIND => EventKind::Repost,
            REACTION_KIND => EventKind::Reaction,
            KIND_CHANNEL_METADATA => EventKind::Presence,
            KIND_CHANNEL_MESSAGE => EventKind::ChatMessage,
            ZAP_RECEIPT_KIND => EventKind::ZapReceipt,
            ARTICLE_KIND => EventKind::Article,
            other => EventKind::Other(other),
        }
    }
}

impl From<EventKind> for u16 {
    fn from(kind: EventKind) -> Self {
        kind.as_u16()
    }
}
