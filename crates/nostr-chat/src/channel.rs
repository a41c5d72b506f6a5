//! Channel join state machine.
//!
//! `Idle -> Joining -> Joined -> Idle`. While joining, backlog messages are
//! buffered; when the join query settles they are flushed in timestamp
//! order and later messages are delivered as they arrive. Each join gets a
//! new generation, and anything tagged with an older generation is stale.

use crate::classify::ChatMessage;
use crate::room::RoomContext;
use nostr_client::SharedDeduplicator;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JoinPhase {
    Idle,
    Joining,
    Joined,
}

/// Snapshot of the current channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelInfo {
    pub origin: String,
    pub channel_id: String,
    pub phase: JoinPhase,
}

/// A channel that was just left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeftChannel {
    pub channel_id: String,
    pub subscription_id: String,
}

#[derive(Debug)]
struct Session {
    room: RoomContext,
    subscription_id: String,
    generation: u64,
    phase: JoinPhase,
    buffer: Vec<ChatMessage>,
    messages: Vec<ChatMessage>,
    seen: SharedDeduplicator,
}

fn insert_sorted(messages: &mut Vec<ChatMessage>, message: ChatMessage) {
    let at = messages.partition_point(|m| m.timestamp_ms <= message.timestamp_ms);
    messages.insert(at, message);
}

#[derive(Debug, Default)]
pub struct ChannelState {
    current: Option<Session>,
    generation: u64,
}

impl ChannelState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> JoinPhase {
        self.current
            .as_ref()
            .map(|s| s.phase)
            .unwrap_or(JoinPhase::Idle)
    }

    pub fn info(&self) -> Option<ChannelInfo> {
        let session = self.current.as_ref()?;
        Some(ChannelInfo {
            origin: session.room.origin().unwrap_or_default().to_string(),
            channel_id: session.room.channel_id().unwrap_or_default().to_string(),
            phase: session.phase,
        })
    }

    pub fn room(&self) -> Option<&RoomContext> {
        self.current.as_ref().map(|s| &s.room)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.current
            .as_ref()
            .is_some_and(|s| s.generation == generation)
    }

    /// Enter `Joining` for `room`, leaving whatever was current.
    ///
    /// `seen` is the join query's deduplicator, shared with its
    /// subscription callback.
    pub fn begin(
        &mut self,
        room: RoomContext,
        subscription_id: String,
        seen: SharedDeduplicator,
    ) -> (u64, Option<LeftChannel>) {
        let left = self.leave();
        self.generation += 1;
        self.current = Some(Session {
            room,
            subscription_id,
            generation: self.generation,
            phase: JoinPhase::Joining,
            buffer: Vec::new(),
            messages: Vec::new(),
            seen,
        });
        (self.generation, left)
    }

    /// Take a message from the join subscription. Returns it when it should
    /// be delivered right away; buffered and stale messages yield `None`.
    pub fn accept(&mut self, generation: u64, message: ChatMessage) -> Option<ChatMessage> {
        let session = self
            .current
            .as_mut()
            .filter(|s| s.generation == generation)?;
        match session.phase {
            JoinPhase::Joining => {
                session.buffer.push(message);
                None
            }
            JoinPhase::Joined => {
                insert_sorted(&mut session.messages, message.clone());
                Some(message)
            }
            JoinPhase::Idle => None,
        }
    }

    /// Record a message we published ourselves, so the relay echo is not
    /// delivered a second time. Returns it when it should be delivered.
    pub fn accept_own(&mut self, message: ChatMessage) -> Option<ChatMessage> {
        let session = self.current.as_ref()?;
        if !session.seen.insert(&message.id) {
            return None;
        }
        let generation = session.generation;
        self.accept(generation, message)
    }

    /// Settle the join: `Joining -> Joined`, returning the flushed backlog.
    /// `None` if the generation is stale or already settled.
    pub fn complete(&mut self, generation: u64) -> Option<Vec<ChatMessage>> {
        let session = self
            .current
            .as_mut()
            .filter(|s| s.generation == generation && s.phase == JoinPhase::Joining)?;
        let mut backlog = std::mem::take(&mut session.buffer);
        backlog.sort_by(|a, b| {
            a.timestamp_ms
                .cmp(&b.timestamp_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        for message in &backlog {
            insert_sorted(&mut session.messages, message.clone());
        }
        session.phase = JoinPhase::Joined;
        Some(backlog)
    }

    /// Back to `Idle`.
    pub fn leave(&mut self) -> Option<LeftChannel> {
        let session = self.current.take()?;
        Some(LeftChannel {
            channel_id: session.room.channel_id().unwrap_or_default().to_string(),
            subscription_id: session.subscription_id,
        })
    }

    /// Delivered messages, oldest first. Empty while joining.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.current
            .as_ref()
            .map(|s| s.messages.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_client::EventDeduplicator;
    use pretty_assertions::assert_eq;

    fn message(id: &str, timestamp_ms: u64) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            pubkey: "p".repeat(64),
            name: "pppppppp".to_string(),
            content: id.to_string(),
            timestamp_ms,
            is_own: false,
            kind: 42,
            images: vec![],
            links: vec![],
        }
    }

    fn ids(messages: &[ChatMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    fn room(origin: &str) -> RoomContext {
        RoomContext::channel(origin).unwrap()
    }

    #[test]
    fn test_join_buffers_then_flushes_sorted() {
        let mut state = ChannelState::new();
        assert_eq!(state.phase(), JoinPhase::Idle);

        let (generation, left) =
            state.begin(room("https://a.test"), "s1".into(), EventDeduplicator::shared());
        assert!(left.is_none());
        assert_eq!(state.phase(), JoinPhase::Joining);

        assert!(state.accept(generation, message("late", 300)).is_none());
        assert!(state.accept(generation, message("early", 100)).is_none());
        assert!(state.messages().is_empty());

        let flushed = state.complete(generation).unwrap();
        assert_eq!(ids(&flushed), vec!["early", "late"]);
        assert_eq!(state.phase(), JoinPhase::Joined);
        assert!(state.complete(generation).is_none());

        let live = state.accept(generation, message("mid", 200)).unwrap();
        assert_eq!(live.id, "mid");
        assert_eq!(ids(&state.messages()), vec!["early", "mid", "late"]);
    }

    #[test]
    fn test_rejoin_leaves_previous_and_ignores_stale() {
        let mut state = ChannelState::new();
        let (first, _) = state.begin(room("https://a.test"), "s1".into(), EventDeduplicator::shared());
        let (second, left) =
            state.begin(room("https://b.test/"), "s2".into(), EventDeduplicator::shared());

        let left = left.unwrap();
        assert_eq!(left.subscription_id, "s1");
        assert_ne!(first, second);
        assert!(!state.is_current(first));

        assert!(state.accept(first, message("stale", 1)).is_none());
        assert!(state.complete(first).is_none());
        state.complete(second).unwrap();
        assert!(state.messages().is_empty());

        let info = state.info().unwrap();
        assert_eq!(info.origin, "https://b.test");
        assert_eq!(info.phase, JoinPhase::Joined);

        assert_eq!(state.leave().unwrap().subscription_id, "s2");
        assert!(state.info().is_none());
        assert!(state.leave().is_none());
    }

    #[test]
    fn test_own_message_not_duplicated_by_echo() {
        let mut state = ChannelState::new();
        let seen = EventDeduplicator::shared();
        let (generation, _) = state.begin(room("https://a.test"), "s".into(), seen.clone());
        state.complete(generation);

        assert!(state.accept_own(message("mine", 10)).is_some());
        // The relay echo is filtered by the shared seen set upstream.
        assert!(!seen.insert("mine"));
        assert_eq!(state.messages().len(), 1);

        // Echo first, own copy second.
        assert!(seen.insert("raced"));
        assert!(state.accept_own(message("raced", 20)).is_none());
    }
}
