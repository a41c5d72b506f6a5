//! NIP-23: Long-form Content (kind 30023).

use crate::kinds::ARTICLE_KIND;
use crate::nip01::Event;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Nip23Error {
    #[error("expected kind 30023, got {0}")]
    WrongKind(u16),
}

/// Article metadata pulled from tags; the body is the markdown content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Article {
    pub author: String,
    /// `d` tag, empty when absent.
    pub identifier: String,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub image: Option<String>,
    pub published_at: Option<u64>,
    pub hashtags: Vec<String>,
    pub content: String,
}

impl Article {
    pub fn from_event(event: &Event) -> Result<Self, Nip23Error> {
        if event.kind != ARTICLE_KIND {
            return Err(Nip23Error::WrongKind(event.kind));
        }

        Ok(Self {
            author: event.pubkey.clone(),
            identifier: event.first_tag("d").unwrap_or_default().to_string(),
            title: event.first_tag("title").map(str::to_string),
            summary: event.first_tag("summary").map(str::to_string),
            image: event.first_tag("image").map(str::to_string),
            published_at: event
                .first_tag("published_at")
                .and_then(|v| v.parse().ok()),
            hashtags: event.tag_values("t").map(str::to_string).collect(),
            content: event.content.clone(),
        })
    }

    /// NIP-33 coordinate `30023:<pubkey>:<d>`.
    pub fn coordinate(&self) -> String {
        format!("{}:{}:{}", ARTICLE_KIND, self.author, self.identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_article_fields() {
        let event = Event {
            id: "2".repeat(64),
            pubkey: "c".repeat(64),
            created_at: 100,
            kind: ARTICLE_KIND,
            tags: vec![
                vec!["d".to_string(), "my-post".to_string()],
                vec!["title".to_string(), "Hello".to_string()],
                vec!["summary".to_string(), "short".to_string()],
                vec!["published_at".to_string(), "1700000000".to_string()],
                vec!["t".to_string(), "rust".to_string()],
            ],
            content: "# Body".to_string(),
            sig: "0".repeat(128),
        };

        let article = Article::from_event(&event).unwrap();
        assert_eq!(article.identifier, "my-post");
        assert_eq!(article.title.as_deref(), Some("Hello"));
        assert_eq!(article.summary.as_deref(), Some("short"));
        assert_eq!(article.published_at, Some(1_700_000_000));
        assert_eq!(article.hashtags, vec!["rust"]);
        assert_eq!(article.coordinate(), format!("30023:{}:my-post", "c".repeat(64)));
    }
}
