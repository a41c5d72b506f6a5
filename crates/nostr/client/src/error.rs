//! Relay layer errors.
//!
//! None of these reach chat callers directly: the pool absorbs link faults
//! and reports them as connectivity changes.

use crate::message::MessageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Refused, closed or broken link
    #[error("transport error: {0}")]
    Transport(String),

    /// Reconnect attempts exhausted
    #[error("connection error: {0}")]
    Connection(String),

    /// Not a ws:// or wss:// URL
    #[error("invalid relay URL: {0}")]
    InvalidUrl(String),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed relay frame
    #[error("protocol error: {0}")]
    Protocol(#[from] MessageError),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("not connected to relay")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, ClientError>;
