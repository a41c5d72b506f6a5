//! Room addressing and membership.
//!
//! A room is any combination of an origin (a URL, mapped to a channel id),
//! a participant set and a subject. Relays only understand OR-of-values tag
//! filters, so [`RoomContext::filter`] over-selects and
//! [`RoomContext::accepts`] re-checks every event client-side.

use crate::error::{ChatError, Result};
use indexmap::IndexSet;
use nostr::{
    ENCRYPTED_DM_KIND, Event, KIND_CHANNEL_MESSAGE, KIND_CHANNEL_METADATA, KIND_SHORT_TEXT_NOTE,
};
use nostr_client::Filter;
use serde::{Deserialize, Serialize};
use url::Url;

/// Tag carrying a channel id.
pub const TAG_CHANNEL: &str = "h";
/// Tag carrying the normalized origin, informational only.
pub const TAG_ORIGIN: &str = "r";
/// Tag carrying a participant pubkey.
pub const TAG_PARTICIPANT: &str = "p";
/// Tag carrying a subject.
pub const TAG_SUBJECT: &str = "t";

/// Canonical form of an origin URL: `scheme://host[:port]/path`, with query,
/// fragment and trailing slashes removed.
///
/// Input that does not parse as a host-bearing URL is stripped textually.
///
/// ```
/// use nostr_chat::normalize_origin;
///
/// assert_eq!(
///     normalize_origin("https://Example.com/path/?q=1#top"),
///     "https://example.com/path"
/// );
/// ```
pub fn normalize_origin(origin: &str) -> String {
    let origin = origin.trim();
    if let Ok(url) = Url::parse(origin)
        && let Some(host) = url.host_str()
    {
        let mut normalized = format!("{}://{}", url.scheme(), host);
        if let Some(port) = url.port() {
            normalized.push_str(&format!(":{port}"));
        }
        normalized.push_str(url.path());
        return normalized.trim_end_matches('/').to_string();
    }
    let end = origin.find(['#', '?']).unwrap_or(origin.len());
    origin[..end].trim_end_matches('/').to_string()
}

/// Channel id for an origin: hex sha256 of the normalized origin.
pub fn channel_id(origin: &str) -> String {
    hex_digest(&normalize_origin(origin))
}

fn hex_digest(value: &str) -> String {
    hex::encode(nostr::sha256(value.as_bytes()))
}

/// Which event kinds a room selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RoomMode {
    /// Per-origin chat channel (kind 42)
    Channel,
    /// Notes and chat messages (kinds 1 and 42)
    Universal,
    /// Encrypted direct messages (kind 4)
    Direct,
    /// Presence announcements (kind 41)
    Announcement,
}

impl RoomMode {
    pub fn kinds(self) -> Vec<u16> {
        match self {
            RoomMode::Channel => vec![KIND_CHANNEL_MESSAGE],
            RoomMode::Universal => vec![KIND_SHORT_TEXT_NOTE, KIND_CHANNEL_MESSAGE],
            RoomMode::Direct => vec![ENCRYPTED_DM_KIND],
            RoomMode::Announcement => vec![KIND_CHANNEL_METADATA],
        }
    }
}

/// Addressing and membership rules of one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomContext {
    origin: Option<String>,
    channel: Option<String>,
    users: IndexSet<String>,
    subject: Option<String>,
    strict: bool,
    direct: bool,
    mode: RoomMode,
}

/// Builder for [`RoomContext`].
#[derive(Debug, Clone, Default)]
pub struct RoomContextBuilder {
    origin: Option<String>,
    users: Vec<String>,
    subject: Option<String>,
    strict: bool,
    mode: Option<RoomMode>,
}

impl RoomContextBuilder {
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn user(mut self, pubkey: impl Into<String>) -> Self {
        self.users.push(pubkey.into());
        self
    }

    pub fn users<I, S>(mut self, pubkeys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.users.extend(pubkeys.into_iter().map(Into::into));
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Require every listed user to be tagged on an event.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn mode(mut self, mode: RoomMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Fails unless at least one of origin, users or subject is non-empty.
    pub fn build(self) -> Result<RoomContext> {
        let origin = self
            .origin
            .map(|o| normalize_origin(&o))
            .filter(|o| !o.is_empty());
        let users: IndexSet<String> = self
            .users
            .into_iter()
            .map(|u| u.trim().to_lowercase())
            .filter(|u| !u.is_empty())
            .collect();
        let subject = self
            .subject
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        if origin.is_none() && users.is_empty() && subject.is_none() {
            return Err(ChatError::InvalidRoom(
                "a room needs an origin, users or a subject".to_string(),
            ));
        }

        let mode = self.mode.unwrap_or(if users.is_empty() && subject.is_none() {
            RoomMode::Channel
        } else {
            RoomMode::Universal
        });

        Ok(RoomContext {
            channel: origin.as_deref().map(hex_digest),
            origin,
            users,
            subject,
            strict: self.strict,
            direct: false,
            mode,
        })
    }
}

impl RoomContext {
    pub fn builder() -> RoomContextBuilder {
        RoomContextBuilder::default()
    }

    /// The per-origin chat channel.
    pub fn channel(origin: &str) -> Result<Self> {
        Self::builder().origin(origin).build()
    }

    /// Private two-party conversation.
    ///
    /// Besides requiring both parties tagged, it refuses any event that
    /// carries a channel or origin tag, so channel traffic that happens to
    /// mention both parties stays out.
    pub fn direct(a: &str, b: &str) -> Result<Self> {
        let mut ctx = Self::builder().users([a, b]).strict(true).build()?;
        if ctx.users.len() != 2 {
            return Err(ChatError::InvalidRoom(
                "a direct room needs two distinct users".to_string(),
            ));
        }
        ctx.direct = true;
        Ok(ctx)
    }

    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    pub fn channel_id(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    pub fn users(&self) -> impl Iterator<Item = &str> {
        self.users.iter().map(String::as_str)
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn is_direct(&self) -> bool {
        self.direct
    }

    pub fn mode(&self) -> RoomMode {
        self.mode
    }

    pub fn key(&self) -> RoomKey {
        RoomKey::from_context(self)
    }

    /// Relay filter for this room. Callers add `since`/`limit`.
    pub fn filter(&self) -> Filter {
        let mut filter = Filter::new().kinds(self.mode.kinds());
        if let Some(channel) = &self.channel {
            filter = filter.tag(TAG_CHANNEL, vec![channel.clone()]);
        }
        if !self.users.is_empty() {
            filter = filter.tag(TAG_PARTICIPANT, self.users.iter().cloned().collect());
        }
        if let Some(subject) = &self.subject {
            filter = filter.tag(TAG_SUBJECT, vec![subject.clone()]);
        }
        filter
    }

    /// Client-side membership check, applied after the relay filter.
    pub fn accepts(&self, event: &Event) -> bool {
        if self.strict
            && !self
                .users
                .iter()
                .all(|user| event.has_tag(TAG_PARTICIPANT, user))
        {
            return false;
        }
        if self.direct
            && (event.first_tag(TAG_CHANNEL).is_some() || event.first_tag(TAG_ORIGIN).is_some())
        {
            return false;
        }
        if let Some(subject) = &self.subject
            && !event.has_tag(TAG_SUBJECT, subject)
        {
            return false;
        }
        if let Some(channel) = &self.channel
            && !event.has_tag(TAG_CHANNEL, channel)
        {
            return false;
        }
        true
    }

    /// Tags that place a published event in this room.
    pub fn tags(&self) -> Vec<Vec<String>> {
        let mut tags = Vec::new();
        if let (Some(channel), Some(origin)) = (&self.channel, &self.origin) {
            tags.push(vec![TAG_CHANNEL.to_string(), channel.clone()]);
            tags.push(vec![TAG_ORIGIN.to_string(), origin.clone()]);
        }
        for user in &self.users {
            tags.push(vec![TAG_PARTICIPANT.to_string(), user.clone()]);
        }
        if let Some(subject) = &self.subject {
            tags.push(vec![TAG_SUBJECT.to_string(), subject.clone()]);
        }
        tags
    }
}

/// Canonical identity of a room.
///
/// Two contexts that select the same events under the same rules produce
/// equal keys regardless of how users were ordered or duplicated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomKey {
    pub channel: Option<String>,
    pub users: Vec<String>,
    pub subject: Option<String>,
    pub strict: bool,
    pub direct: bool,
    pub mode: RoomMode,
}

impl RoomKey {
    /// The one canonicalization: users sorted and deduplicated, everything
    /// else taken from the already-normalized context.
    pub fn from_context(ctx: &RoomContext) -> Self {
        let mut users: Vec<String> = ctx.users.iter().cloned().collect();
        users.sort();
        users.dedup();
        Self {
            channel: ctx.channel.clone(),
            users,
            subject: ctx.subject.clone(),
            strict: ctx.strict,
            direct: ctx.direct,
            mode: ctx.mode,
        }
    }
}
