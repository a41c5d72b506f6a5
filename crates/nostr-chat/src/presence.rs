//! Presence tracking.
//!
//! Presence events say "this pubkey is here, under this name". Records are
//! kept per channel and per origin and never evicted; whether a record is
//! still active is decided when it is read.

use crate::room::{TAG_CHANNEL, TAG_ORIGIN, normalize_origin};
use indexmap::IndexMap;
use nostr::Event;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A record older than this is inactive.
pub const PRESENCE_WINDOW_MS: u64 = 300_000;

/// Current unix time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// JSON content of a presence event.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PresenceContent {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub display_name: String,
    pub last_seen_ms: u64,
}

impl PresenceRecord {
    pub fn is_active(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_seen_ms) < PRESENCE_WINDOW_MS
    }
}

/// One parsed presence event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceUpdate {
    pub pubkey: String,
    /// Channel id from the event's `h` tag
    pub channel_id: Option<String>,
    /// Normalized origin, from the content or the `r` tag
    pub origin: Option<String>,
    pub display_name: String,
    pub last_seen_ms: u64,
}

impl PresenceUpdate {
    /// `None` when the content is not a presence object.
    pub fn from_event(event: &Event) -> Option<Self> {
        let content: PresenceContent = serde_json::from_str(&event.content).ok()?;
        let origin = content
            .origin
            .as_deref()
            .or_else(|| event.first_tag(TAG_ORIGIN))
            .map(normalize_origin)
            .filter(|o| !o.is_empty());
        Some(Self {
            pubkey: event.pubkey.clone(),
            channel_id: event.first_tag(TAG_CHANNEL).map(str::to_string),
            origin,
            display_name: content.name.trim().to_string(),
            last_seen_ms: event.created_at_ms(),
        })
    }

    fn record(&self) -> PresenceRecord {
        PresenceRecord {
            display_name: self.display_name.clone(),
            last_seen_ms: self.last_seen_ms,
        }
    }
}

/// A user active in a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveUser {
    pub pubkey: String,
    pub display_name: String,
    pub last_seen_ms: u64,
}

/// How many users are active under one origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OriginActivity {
    pub origin: String,
    pub active_count: usize,
}

type Table = IndexMap<String, PresenceRecord>;

/// Write `record` unless the table already holds something newer.
fn upsert(table: &mut Table, pubkey: &str, record: PresenceRecord) -> bool {
    match table.get_mut(pubkey) {
        Some(existing) if existing.last_seen_ms > record.last_seen_ms => false,
        Some(existing) => {
            let changed = *existing != record;
            *existing = record;
            changed
        }
        None => {
            table.insert(pubkey.to_string(), record);
            true
        }
    }
}

#[derive(Debug, Default)]
pub struct PresenceTracker {
    channels: HashMap<String, Table>,
    origins: HashMap<String, Table>,
    latest: HashMap<String, PresenceRecord>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an update to every table it belongs to. Returns whether any
    /// record changed.
    pub fn apply(&mut self, update: &PresenceUpdate) -> bool {
        let mut changed = false;
        if let Some(channel) = &update.channel_id {
            let table = self.channels.entry(channel.clone()).or_default();
            changed |= upsert(table, &update.pubkey, update.record());
        }
        if let Some(origin) = &update.origin {
            let table = self.origins.entry(origin.clone()).or_default();
            changed |= upsert(table, &update.pubkey, update.record());
        }

        let newer = self
            .latest
            .get(&update.pubkey)
            .is_none_or(|r| r.last_seen_ms <= update.last_seen_ms);
        if newer && !update.display_name.is_empty() {
            self.latest.insert(update.pubkey.clone(), update.record());
        }
        changed
    }

    /// Most recently announced name for a pubkey.
    pub fn display_name(&self, pubkey: &str) -> Option<&str> {
        self.latest.get(pubkey).map(|r| r.display_name.as_str())
    }

    pub fn record(&self, channel_id: &str, pubkey: &str) -> Option<&PresenceRecord> {
        self.channels.get(channel_id)?.get(pubkey)
    }

    /// Active users of a channel, in order of first appearance.
    pub fn active_users(&self, channel_id: &str, now_ms: u64) -> Vec<ActiveUser> {
        let Some(table) = self.channels.get(channel_id) else {
            return Vec::new();
        };
        table
            .iter()
            .filter(|(_, record)| record.is_active(now_ms))
            .map(|(pubkey, record)| ActiveUser {
                pubkey: pubkey.clone(),
                display_name: record.display_name.clone(),
                last_seen_ms: record.last_seen_ms,
            })
            .collect()
    }

    /// Origins with at least one active user, busiest first.
    pub fn global_activity(&self, now_ms: u64) -> Vec<OriginActivity> {
        let mut activity: Vec<OriginActivity> = self
            .origins
            .iter()
            .map(|(origin, table)| OriginActivity {
                origin: origin.clone(),
                active_count: table.values().filter(|r| r.is_active(now_ms)).count(),
            })
            .filter(|a| a.active_count > 0)
            .collect();
        activity.sort_by(|a, b| {
            b.active_count
                .cmp(&a.active_count)
                .then_with(|| a.origin.cmp(&b.origin))
        });
        activity
    }
}
