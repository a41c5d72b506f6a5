//! NIP-01: Basic protocol flow description.
//!
//! This module implements the core event structure and operations:
//! - Event structure (id, pubkey, created_at, kind, tags, content, sig)
//! - Event serialization for hashing
//! - Signing and verification through a [`CryptoGateway`]
//! - Tag lookup helpers used by filters and room membership checks

use crate::crypto::{CryptoError, CryptoGateway};
#[cfg(feature = "full")]
use crate::crypto::Secp256k1Gateway;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during NIP-01 operations.
#[derive(Debug, Error)]
pub enum Nip01Error {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// A signed event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Event {
    /// 32-bytes lowercase hex-encoded sha256 of the serialized event data
    pub id: String,
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind (integer between 0 and 65535)
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
    /// 64-bytes lowercase hex signature
    pub sig: String,
}

impl Event {
    /// Values (second element) of every tag named `key`, in tag order.
    pub fn tag_values<'a, 'k>(
        &'a self,
        key: &'k str,
    ) -> impl Iterator<Item = &'a str> + use<'a, 'k> {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(key))
            .filter_map(|tag| tag.get(1).map(String::as_str))
    }

    /// Value of the first tag named `key`.
    pub fn first_tag(&self, key: &str) -> Option<&str> {
        self.tag_values(key).next()
    }

    /// Value of the last tag named `key`.
    pub fn last_tag(&self, key: &str) -> Option<&str> {
        self.tag_values(key).last()
    }

    /// Whether any `key` tag carries `value`.
    pub fn has_tag(&self, key: &str, value: &str) -> bool {
        self.tag_values(key).any(|v| v == value)
    }

    /// Timestamp in milliseconds.
    pub fn created_at_ms(&self) -> u64 {
        self.created_at.saturating_mul(1000)
    }
}

/// An unsigned event (before signing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// A template for creating events (without pubkey, which comes from the signing key).
///
/// ```
/// use nostr::EventTemplate;
///
/// let template = EventTemplate {
///     created_at: 1_700_000_000,
///     kind: 42,
///     tags: vec![vec!["h".to_string(), "abc".to_string()]],
///     content: "hello room".to_string(),
/// };
/// assert_eq!(template.kind, 42);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    /// Unix timestamp in seconds
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl EventTemplate {
    /// Template stamped with the current time.
    pub fn now(kind: u16, tags: Vec<Vec<String>>, content: impl Into<String>) -> Self {
        Self {
            created_at: unix_now(),
            kind,
            tags,
            content: content.into(),
        }
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Serialize an unsigned event for hashing.
///
/// Format: `[0, pubkey, created_at, kind, tags, content]`
pub fn serialize_event(event: &UnsignedEvent) -> Result<String, Nip01Error> {
    if !is_lower_hex(&event.pubkey, 64) {
        return Err(Nip01Error::InvalidEvent(
            "can't serialize event with wrong or missing properties".to_string(),
        ));
    }

    serde_json::to_string(&(
        0,
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    ))
    .map_err(|e| Nip01Error::Serialization(e.to_string()))
}

/// Event id (hex) of an unsigned event.
pub fn event_hash_with(
    gateway: &dyn CryptoGateway,
    event: &UnsignedEvent,
) -> Result<String, Nip01Error> {
    let serialized = serialize_event(event)?;
    Ok(hex::encode(gateway.hash(serialized.as_bytes())))
}

/// Structural validation of a signed event (lengths and hex only).
pub fn validate_event(event: &Event) -> bool {
    is_hex(&event.id, 64) && is_lower_hex(&event.pubkey, 64) && is_hex(&event.sig, 128)
}

/// Sign an event template, producing a complete signed event.
pub fn finalize_event_with(
    gateway: &dyn CryptoGateway,
    template: &EventTemplate,
    secret_key: &[u8; 32],
) -> Result<Event, Nip01Error> {
    let pubkey = hex::encode(gateway.public_key(secret_key)?);

    let unsigned = UnsignedEvent {
        pubkey,
        created_at: template.created_at,
        kind: template.kind,
        tags: template.tags.clone(),
        content: template.content.clone(),
    };

    let id = event_hash_with(gateway, &unsigned)?;
    let id_bytes = decode_32(&id)?;
    let sig = gateway
        .sign(&id_bytes, secret_key)
        .map_err(|e| Nip01Error::Signing(e.to_string()))?;

    Ok(Event {
        id,
        pubkey: unsigned.pubkey,
        created_at: unsigned.created_at,
        kind: unsigned.kind,
        tags: unsigned.tags,
        content: unsigned.content,
        sig: hex::encode(sig),
    })
}

/// Verify an event's id and signature.
///
/// Structurally invalid events verify as `false` rather than erroring.
pub fn verify_event_with(gateway: &dyn CryptoGateway, event: &Event) -> bool {
    if !validate_event(event) {
        return false;
    }

    let unsigned = UnsignedEvent {
        pubkey: event.pubkey.clone(),
        created_at: event.created_at,
        kind: event.kind,
        tags: event.tags.clone(),
        content: event.content.clone(),
    };
    match event_hash_with(gateway, &unsigned) {
        Ok(computed) if computed == event.id => {}
        _ => return false,
    }

    let (Ok(id), Ok(pubkey)) = (decode_32(&event.id), decode_32(&event.pubkey)) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(&event.sig) else {
        return false;
    };
    let Ok(sig) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };

    gateway.verify(&sig, &id, &pubkey)
}

/// Sign with the default secp256k1 gateway.
#[cfg(feature = "full")]
pub fn finalize_event(template: &EventTemplate, secret_key: &[u8; 32]) -> Result<Event, Nip01Error> {
    finalize_event_with(&Secp256k1Gateway::new(), template, secret_key)
}

/// Verify with the default secp256k1 gateway.
#[cfg(feature = "full")]
pub fn verify_event(event: &Event) -> bool {
    verify_event_with(&Secp256k1Gateway::new(), event)
}

/// Sort events in reverse-chronological order by created_at,
/// then by id (lexicographically) in case of ties.
pub fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| match b.created_at.cmp(&a.created_at) {
        std::cmp::Ordering::Equal => a.id.cmp(&b.id),
        other => other,
    });
}

/// Oldest first, ties broken by id.
pub fn sort_events_chronological(events: &mut [Event]) {
    events.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

pub(crate) fn decode_32(value: &str) -> Result<[u8; 32], Nip01Error> {
    let bytes = hex::decode(value).map_err(|e| Nip01Error::InvalidHex(e.to_string()))?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| Nip01Error::InvalidHex(format!("expected 32 bytes, got {}", bytes.len())))
}

fn is_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.chars().all(|c| c.is_ascii_hexdigit())
}

fn is_lower_hex(value: &str, len: usize) -> bool {
    is_hex(value, len) && !value.chars().any(|c| c.is_ascii_uppercase())
}

#[cfg(all(test, feature = "full"))]
mod tests {
    use super::*;
    use crate::kinds::KIND_SHORT_TEXT_NOTE;

    const TEST_PRIVATE_KEY: &str =
        "d217c1ff2f8a65c3e3a1740db3b9f58b8c848bb45e26d00ed4714e4a0f4ceecf";

    fn test_private_key() -> [u8; 32] {
        decode_32(TEST_PRIVATE_KEY).unwrap()
    }

    fn note(content: &str) -> Event {
        let template = EventTemplate {
            kind: KIND_SHORT_TEXT_NOTE,
            tags: vec![
                vec!["p".to_string(), "aa".to_string()],
                vec!["e".to_string(), "first".to_string()],
                vec!["e".to_string(), "second".to_string()],
            ],
            content: content.to_string(),
            created_at: 1617932115,
        };
        finalize_event(&template, &test_private_key()).unwrap()
    }

    #[test]
    fn test_finalize_event_creates_signed_event() {
        let event = note("Hello, world!");

        assert_eq!(event.kind, KIND_SHORT_TEXT_NOTE);
        assert_eq!(event.content, "Hello, world!");
        assert_eq!(event.created_at, 1617932115);
        assert_eq!(event.id.len(), 64);
        assert_eq!(event.sig.len(), 128);
        assert!(verify_event(&event));
    }

    #[test]
    fn test_serialize_event_format() {
        let gateway = Secp256k1Gateway::new();
        let pubkey = hex::encode(gateway.public_key(&test_private_key()).unwrap());
        let unsigned = UnsignedEvent {
            pubkey: pubkey.clone(),
            created_at: 1617932115,
            kind: KIND_SHORT_TEXT_NOTE,
            tags: vec![],
            content: "Hello, world!".to_string(),
        };

        let serialized = serialize_event(&unsigned).unwrap();
        let expected = format!("[0,\"{}\",1617932115,1,[],\"Hello, world!\"]", pubkey);
        assert_eq!(serialized, expected);
    }

    #[test]
    fn test_serialize_event_invalid_pubkey() {
        let unsigned = UnsignedEvent {
            pubkey: "invalid".to_string(),
            created_at: 1617932115,
            kind: KIND_SHORT_TEXT_NOTE,
            tags: vec![],
            content: String::new(),
        };
        assert!(serialize_event(&unsigned).is_err());
    }

    #[test]
    fn test_verify_rejects_tampering() {
        let mut event = note("original");
        event.content = "tampered".to_string();
        assert!(!verify_event(&event));

        let mut event = note("original");
        event.sig = "0".repeat(128);
        assert!(!verify_event(&event));

        let mut event = note("original");
        event.id = "zz".to_string();
        assert!(!verify_event(&event));
    }

    #[test]
    fn test_tag_helpers() {
        let event = note("tags");
        assert_eq!(event.first_tag("e"), Some("first"));
        assert_eq!(event.last_tag("e"), Some("second"));
        assert_eq!(event.tag_values("e").collect::<Vec<_>>(), vec!["first", "second"]);
        assert!(event.has_tag("p", "aa"));
        assert!(!event.has_tag("p", "bb"));
        assert_eq!(event.first_tag("t"), None);
    }

    #[test]
    fn test_tag_value_outlives_key() {
        let event = note("tags");
        let value = {
            let key = String::from("e");
            event.last_tag(&key)
        };
        assert_eq!(value, Some("second"));

        let values: Vec<&str> = ["p", "e"]
            .iter()
            .map(|k| k.to_string())
            .filter_map(|k| event.first_tag(&k))
            .collect();
        assert_eq!(values, vec!["aa", "first"]);
    }

    #[test]
    fn test_sorting() {
        let mut a = note("a");
        a.created_at = 10;
        let mut b = note("b");
        b.created_at = 30;
        let mut c = note("c");
        c.created_at = 20;

        let mut events = vec![a.clone(), b.clone(), c.clone()];
        sort_events(&mut events);
        assert_eq!(
            events.iter().map(|e| e.created_at).collect::<Vec<_>>(),
            vec![30, 20, 10]
        );

        sort_events_chronological(&mut events);
        assert_eq!(
            events.iter().map(|e| e.created_at).collect::<Vec<_>>(),
            vec![10, 20, 30]
        );
    }

    #[test]
    fn test_event_json_shape() {
        let event = note("json");
        let json = serde_json::to_value(&event).unwrap();
        for field in ["id", "pubkey", "created_at", "kind", "tags", "content", "sig"] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
