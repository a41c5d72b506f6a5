//! NIP-18: Reposts.
//!
//! A kind 6 repost carries the reposted event as stringified JSON in its
//! content (may be empty) plus `e`/`p` tags pointing at the original.

use crate::kinds::REPOST_KIND;
use crate::nip01::Event;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Nip18Error {
    #[error("expected kind 6, got {0}")]
    WrongKind(u16),

    #[error("repost has no target event")]
    MissingTarget,
}

/// A parsed repost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repost {
    pub reposter: String,
    pub target_id: String,
    pub target_author: Option<String>,
    /// Embedded original, when the content carried a parseable event.
    pub original: Option<Event>,
}

impl Repost {
    pub fn from_event(event: &Event) -> Result<Self, Nip18Error> {
        if event.kind != REPOST_KIND {
            return Err(Nip18Error::WrongKind(event.kind));
        }

        let original = if event.content.trim().is_empty() {
            None
        } else {
            serde_json::from_str::<Event>(&event.content).ok()
        };

        let target_id = event
            .first_tag("e")
            .map(str::to_string)
            .or_else(|| original.as_ref().map(|e| e.id.clone()))
            .ok_or(Nip18Error::MissingTarget)?;

        let target_author = event
            .first_tag("p")
            .map(str::to_string)
            .or_else(|| original.as_ref().map(|e| e.pubkey.clone()));

        Ok(Self {
            reposter: event.pubkey.clone(),
            target_id,
            target_author,
            original,
        })
    }
}
