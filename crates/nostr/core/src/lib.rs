//! Nostr protocol types for the chat engine.
//!
//! This crate provides:
//! - NIP-01: Basic protocol (events, signing, verification)
//! - NIP-04: Encrypted Direct Messages (requires `full` feature)
//! - NIP-18: Reposts
//! - NIP-23: Long-form Content
//! - NIP-25: Reactions
//! - NIP-57: Lightning Zap receipts
//! - A crypto gateway trait with a secp256k1 / AES-CBC implementation
//!
//! # Features
//!
//! - `full` (default): Full crypto support including key generation and signing
//! - `minimal`: Just Event type and serialization

mod crypto;
#[cfg(feature = "full")]
mod keys;
mod kinds;
mod nip01;
#[cfg(feature = "full")]
mod nip04;
mod nip18;
mod nip23;
mod nip25;
mod nip57;

pub use crypto::{CryptoError, CryptoGateway};
#[cfg(feature = "full")]
pub use crypto::{Secp256k1Gateway, sha256};
#[cfg(feature = "full")]
pub use keys::Keys;
pub use kinds::*;
pub use nip01::{
    Event, EventTemplate, Nip01Error, UnsignedEvent, event_hash_with, finalize_event_with,
    serialize_event, sort_events, sort_events_chronological, unix_now, validate_event,
    verify_event_with,
};
#[cfg(feature = "full")]
pub use nip01::{finalize_event, verify_event};
#[cfg(feature = "full")]
pub use nip04::{Nip04Error, decrypt as nip04_decrypt, encrypt as nip04_encrypt};
#[cfg(feature = "full")]
pub use nip04::{decrypt_with as nip04_decrypt_with, encrypt_with as nip04_encrypt_with};
pub use nip18::{Nip18Error, Repost};
pub use nip23::{Article, Nip23Error};
pub use nip25::{Nip25Error, Reaction};
pub use nip57::{Nip57Error, ZapReceipt};
