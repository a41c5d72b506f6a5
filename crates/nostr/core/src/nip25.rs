//! NIP-25: Reactions.

use crate::kinds::REACTION_KIND;
use crate::nip01::Event;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Nip25Error {
    #[error("expected kind 7, got {0}")]
    WrongKind(u16),

    #[error("reaction has no e tag")]
    MissingTarget,
}

/// A parsed reaction. The target is the last `e` tag, per NIP-25.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reaction {
    pub reactor: String,
    pub target_id: String,
    pub target_author: Option<String>,
    /// `+` for like, `-` for dislike, otherwise an emoji.
    pub emoji: String,
}

impl Reaction {
    pub fn from_event(event: &Event) -> Result<Self, Nip25Error> {
        if event.kind != REACTION_KIND {
            return Err(Nip25Error::WrongKind(event.kind));
        }
        let target_id = event
            .last_tag("e")
            .ok_or(Nip25Error::MissingTarget)?
            .to_string();

        let emoji = match event.content.trim() {
            "" => "+".to_string(),
            other => other.to_string(),
        };

        Ok(Self {
            reactor: event.pubkey.clone(),
            target_id,
            target_author: event.last_tag("p").map(str::to_string),
            emoji,
        })
    }

    pub fn is_like(&self) -> bool {
        self.emoji == "+"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reaction(tags: Vec<[&str; 2]>, content: &str) -> Event {
        Event {
            id: "1".repeat(64),
            pubkey: "b".repeat(64),
            created_at: 5,
            kind: REACTION_KIND,
            tags: tags
                .into_iter()
                .map(|[k, v]| vec![k.to_string(), v.to_string()])
                .collect(),
            content: content.to_string(),
            sig: "0".repeat(128),
        }
    }

    #[test]
    fn test_last_e_tag_wins() {
        let parsed =
            Reaction::from_event(&reaction(vec![["e", "root"], ["e", "leaf"]], "🔥")).unwrap();
        assert_eq!(parsed.target_id, "leaf");
        assert_eq!(parsed.emoji, "🔥");
        assert!(!parsed.is_like());
    }

    #[test]
    fn test_empty_content_is_like() {
        let parsed = Reaction::from_event(&reaction(vec![["e", "x"]], "")).unwrap();
        assert!(parsed.is_like());
    }

    #[test]
    fn test_missing_target() {
        assert!(matches!(
            Reaction::from_event(&reaction(vec![], "+")),
            Err(Nip25Error::MissingTarget)
        ));
    }
}
