//! Error types for the chat layer.

use thiserror::Error;

/// Errors surfaced by chat operations.
///
/// Relay faults never appear here: connection loss and malformed frames are
/// absorbed by the pool. What remains are validation failures, publish
/// outcomes and local crypto or storage faults.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("no relays connected")]
    NoRelays,

    #[error("message content is empty")]
    EmptyContent,

    #[error("no channel joined")]
    NoChannel,

    #[error("invalid room: {0}")]
    InvalidRoom(String),

    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("integrity fault: {0}")]
    Integrity(String),

    #[error("encryption error: {0}")]
    Crypto(#[from] nostr::Nip04Error),

    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("event signing error: {0}")]
    Signing(#[from] nostr::Nip01Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ChatError>;
