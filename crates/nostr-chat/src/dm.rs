//! Direct messages: NIP-04 sealing and per-peer conversation logs.

use crate::room::TAG_PARTICIPANT;
use nostr::{
    CryptoGateway, ENCRYPTED_DM_KIND, Event, EventTemplate, Keys, Nip04Error, nip04_decrypt_with,
    nip04_encrypt_with,
};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecryptedMessage {
    pub id: String,
    /// Author
    pub pubkey: String,
    pub content: String,
    pub timestamp_ms: u64,
    pub is_own: bool,
}

/// The other party of a DM event, as seen from `own_pubkey`.
///
/// Own events resolve to the first `p` tag that is not us; events from
/// others resolve to their author, provided they tag us. A note to self
/// resolves to ourselves. `None` means the event is not ours to read.
pub fn counterpart(event: &Event, own_pubkey: &str) -> Option<String> {
    if event.pubkey == own_pubkey {
        let mut recipients = event.tag_values(TAG_PARTICIPANT);
        let first = recipients.next()?;
        if first != own_pubkey {
            return Some(first.to_string());
        }
        return Some(
            recipients
                .find(|p| *p != own_pubkey)
                .unwrap_or(first)
                .to_string(),
        );
    }
    event
        .has_tag(TAG_PARTICIPANT, own_pubkey)
        .then(|| event.pubkey.clone())
}

/// Decrypt a DM event addressed to or sent by `keys`.
///
/// `Ok(None)` for events that do not involve us; errors are decryption
/// failures, which callers drop.
pub fn open(
    gateway: &dyn CryptoGateway,
    keys: &Keys,
    event: &Event,
) -> Result<Option<(String, DecryptedMessage)>, Nip04Error> {
    let Some(peer) = counterpart(event, keys.public_key()) else {
        return Ok(None);
    };
    let content = nip04_decrypt_with(gateway, keys.secret_key(), &peer, &event.content)?;
    let message = DecryptedMessage {
        id: event.id.clone(),
        pubkey: event.pubkey.clone(),
        content,
        timestamp_ms: event.created_at_ms(),
        is_own: event.pubkey == keys.public_key(),
    };
    Ok(Some((peer, message)))
}

/// Unsigned DM to `peer`.
pub fn seal(
    gateway: &dyn CryptoGateway,
    keys: &Keys,
    peer: &str,
    plaintext: &str,
) -> Result<EventTemplate, Nip04Error> {
    let content = nip04_encrypt_with(gateway, keys.secret_key(), peer, plaintext)?;
    Ok(EventTemplate::now(
        ENCRYPTED_DM_KIND,
        vec![vec![TAG_PARTICIPANT.to_string(), peer.to_string()]],
        content,
    ))
}

/// Conversations keyed by counterpart pubkey.
#[derive(Debug, Default)]
pub struct DmStore {
    conversations: HashMap<String, Vec<DecryptedMessage>>,
}

impl DmStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert in timestamp order. Returns `false` if the id is already stored.
    pub fn insert(&mut self, peer: &str, message: DecryptedMessage) -> bool {
        let log = self.conversations.entry(peer.to_string()).or_default();
        if log.iter().any(|m| m.id == message.id) {
            return false;
        }
        let at = log.partition_point(|m| m.timestamp_ms <= message.timestamp_ms);
        log.insert(at, message);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.conversations
            .values()
            .any(|log| log.iter().any(|m| m.id == id))
    }

    pub fn conversation(&self, peer: &str) -> &[DecryptedMessage] {
        self.conversations
            .get(peer)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Peers, most recent conversation first.
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<(&String, u64)> = self
            .conversations
            .iter()
            .filter_map(|(peer, log)| log.last().map(|m| (peer, m.timestamp_ms)))
            .collect();
        peers.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        peers.into_iter().map(|(peer, _)| peer.clone()).collect()
    }
}
