//! Event classification.
//!
//! Every inbound event goes through [`classify`], a single exhaustive match
//! over [`EventKind`] that turns raw events into typed items.

use crate::dm::{self, DecryptedMessage};
use crate::presence::{PresenceTracker, PresenceUpdate};
use indexmap::IndexSet;
use nostr::{Article, CryptoGateway, Event, EventKind, Keys, Reaction, Repost, ZapReceipt};
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;
use tracing::debug;

static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s<>"'`]+"#).expect("url pattern")
});

static IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\.(png|jpe?g|gif|webp|svg)$").expect("image pattern")
});

/// Image URLs and other links found in message text, each deduplicated in
/// first-seen order. Images never appear among the links.
pub fn extract_media(content: &str) -> (Vec<String>, Vec<String>) {
    let mut images = IndexSet::new();
    let mut links = IndexSet::new();
    for found in URL_RE.find_iter(content) {
        let url = found
            .as_str()
            .trim_end_matches(['.', ',', ';', ':', '!', '?', ')', ']', '}']);
        let path = url.split(['?', '#']).next().unwrap_or(url);
        if IMAGE_RE.is_match(path) {
            images.insert(url.to_string());
        } else {
            links.insert(url.to_string());
        }
    }
    (images.into_iter().collect(), links.into_iter().collect())
}

/// A chat line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub id: String,
    pub pubkey: String,
    /// Presence name if known, else the first 8 characters of the pubkey
    pub name: String,
    pub content: String,
    pub timestamp_ms: u64,
    pub is_own: bool,
    pub kind: u16,
    pub images: Vec<String>,
    pub links: Vec<String>,
}

impl ChatMessage {
    pub fn from_event(event: &Event, ctx: &ClassifyContext<'_>) -> Self {
        let (images, links) = extract_media(&event.content);
        let name = ctx
            .presence
            .and_then(|p| p.display_name(&event.pubkey))
            .map(str::to_string)
            .unwrap_or_else(|| event.pubkey.chars().take(8).collect());
        Self {
            id: event.id.clone(),
            pubkey: event.pubkey.clone(),
            name,
            content: event.content.clone(),
            timestamp_ms: event.created_at_ms(),
            is_own: event.pubkey == ctx.keys.public_key(),
            kind: event.kind,
            images,
            links,
        }
    }
}

/// Extended post kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum Post {
    Repost(Repost),
    Reaction(Reaction),
    Zap(ZapReceipt),
    Article(Article),
}

/// Outcome of classifying one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Message(ChatMessage),
    Presence(PresenceUpdate),
    DirectMessage {
        peer: String,
        message: DecryptedMessage,
    },
    Post(Post),
    Ignored,
}

impl Classified {
    pub fn is_ignored(&self) -> bool {
        matches!(self, Classified::Ignored)
    }
}

/// What classification needs from the session.
pub struct ClassifyContext<'a> {
    pub keys: &'a Keys,
    pub gateway: &'a dyn CryptoGateway,
    /// Name lookup for chat lines
    pub presence: Option<&'a PresenceTracker>,
}

pub fn classify(event: &Event, ctx: &ClassifyContext<'_>) -> Classified {
    match EventKind::from(event.kind) {
        EventKind::Note | EventKind::ChatMessage => {
            Classified::Message(ChatMessage::from_event(event, ctx))
        }
        EventKind::Presence => match PresenceUpdate::from_event(event) {
            Some(update) => Classified::Presence(update),
            None => {
                debug!("Presence {} has no presence content", event.id);
                Classified::Ignored
            }
        },
        EventKind::EncryptedDm => match dm::open(ctx.gateway, ctx.keys, event) {
            Ok(Some((peer, message))) => Classified::DirectMessage { peer, message },
            Ok(None) => Classified::Ignored,
            Err(e) => {
                debug!("Dropping undecryptable DM {}: {}", event.id, e);
                Classified::Ignored
            }
        },
        EventKind::Repost => post(event, Repost::from_event(event).map(Post::Repost)),
        EventKind::Reaction => post(event, Reaction::from_event(event).map(Post::Reaction)),
        EventKind::ZapReceipt => post(event, ZapReceipt::from_event(event).map(Post::Zap)),
        EventKind::Article => post(event, Article::from_event(event).map(Post::Article)),
        EventKind::Other(_) => Classified::Ignored,
    }
}

fn post<E: std::fmt::Display>(event: &Event, parsed: Result<Post, E>) -> Classified {
    match parsed {
        Ok(post) => Classified::Post(post),
        Err(e) => {
            debug!("Ignoring kind {} event {}: {}", event.kind, event.id, e);
            Classified::Ignored
        }
    }
}
