//! Relay protocol messages.
//!
//! This module implements the relay protocol messages as specified in NIP-01:
//! - Client to Relay: EVENT, REQ, CLOSE
//! - Relay to Client: EVENT, OK, EOSE, CLOSED, NOTICE
//!
//! Both directions can be encoded and decoded so the in-memory transport can
//! play the relay side.

use nostr::Event;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors that can occur when parsing relay messages.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing field: {0}")]
    MissingField(String),
}

/// Messages sent from client to relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Publish an event: ["EVENT", <event JSON>]
    Event(Event),

    /// Subscribe to events: ["REQ", <subscription_id>, <filter1>, <filter2>, ...]
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },

    /// Close a subscription: ["CLOSE", <subscription_id>]
    Close { subscription_id: String },
}

impl ClientMessage {
    /// Serialize to JSON array for sending to relay.
    pub fn to_json(&self) -> Result<String, MessageError> {
        let value = match self {
            ClientMessage::Event(event) => json!(["EVENT", event]),
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut arr: Vec<Value> = vec![
                    Value::String("REQ".to_string()),
                    Value::String(subscription_id.clone()),
                ];
                for filter in filters {
                    arr.push(serde_json::to_value(filter)?);
                }
                Value::Array(arr)
            }
            ClientMessage::Close { subscription_id } => json!(["CLOSE", subscription_id]),
        };
        Ok(value.to_string())
    }

    /// Parse a frame as sent by a client.
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let arr = parse_array(json)?;
        match message_type(&arr)? {
            "EVENT" => {
                let event = arr
                    .get(1)
                    .ok_or_else(|| MessageError::MissingField("event".to_string()))?;
                Ok(ClientMessage::Event(serde_json::from_value(event.clone())?))
            }
            "REQ" => {
                let subscription_id = string_at(&arr, 1, "subscription_id")?;
                let filters = arr[2..]
                    .iter()
                    .map(|f| serde_json::from_value(f.clone()))
                    .collect::<Result<Vec<Filter>, _>>()?;
                Ok(ClientMessage::Req {
                    subscription_id,
                    filters,
                })
            }
            "CLOSE" => Ok(ClientMessage::Close {
                subscription_id: string_at(&arr, 1, "subscription_id")?,
            }),
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }
}

/// Messages sent from relay to client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// Event matching a subscription: ["EVENT", <subscription_id>, <event JSON>]
    Event {
        subscription_id: String,
        event: Event,
    },

    /// Command result: ["OK", <event_id>, <true|false>, <message>]
    Ok {
        event_id: String,
        success: bool,
        message: String,
    },

    /// End of stored events: ["EOSE", <subscription_id>]
    Eose { subscription_id: String },

    /// Subscription closed by relay: ["CLOSED", <subscription_id>, <message>]
    Closed {
        subscription_id: String,
        message: String,
    },

    /// Human-readable notice: ["NOTICE", <message>]
    Notice { message: String },
}

impl RelayMessage {
    /// Parse a JSON message from the relay.
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let arr = parse_array(json)?;

        match message_type(&arr)? {
            "EVENT" => {
                if arr.len() < 3 {
                    return Err(MessageError::MissingField(
                        "event or subscription_id".to_string(),
                    ));
                }
                let subscription_id = string_at(&arr, 1, "subscription_id")?;
                let event: Event = serde_json::from_value(arr[2].clone())?;
                Ok(RelayMessage::Event {
                    subscription_id,
                    event,
                })
            }
            "OK" => {
                if arr.len() < 4 {
                    return Err(MessageError::MissingField("OK fields".to_string()));
                }
                let event_id = string_at(&arr, 1, "event_id")?;
                let success = arr[2].as_bool().ok_or_else(|| {
                    MessageError::InvalidFormat("success not a boolean".to_string())
                })?;
                let message = arr[3].as_str().unwrap_or("").to_string();
                Ok(RelayMessage::Ok {
                    event_id,
                    success,
                    message,
                })
            }
            "EOSE" => Ok(RelayMessage::Eose {
                subscription_id: string_at(&arr, 1, "subscription_id")?,
            }),
            "CLOSED" => {
                let subscription_id = string_at(&arr, 1, "subscription_id")?;
                let message = arr.get(2).and_then(Value::as_str).unwrap_or("").to_string();
                Ok(RelayMessage::Closed {
                    subscription_id,
                    message,
                })
            }
            "NOTICE" => Ok(RelayMessage::Notice {
                message: string_at(&arr, 1, "message")?,
            }),
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }

    /// Serialize as a relay would put it on the wire.
    pub fn to_json(&self) -> String {
        match self {
            RelayMessage::Event {
                subscription_id,
                event,
            } => json!(["EVENT", subscription_id, event]),
            RelayMessage::Ok {
                event_id,
                success,
                message,
            } => json!(["OK", event_id, success, message]),
            RelayMessage::Eose { subscription_id } => json!(["EOSE", subscription_id]),
            RelayMessage::Closed {
                subscription_id,
                message,
            } => json!(["CLOSED", subscription_id, message]),
            RelayMessage::Notice { message } => json!(["NOTICE", message]),
        }
        .to_string()
    }
}

fn parse_array(json: &str) -> Result<Vec<Value>, MessageError> {
    let arr: Vec<Value> =
        serde_json::from_str(json).map_err(|e| MessageError::InvalidFormat(e.to_string()))?;
    if arr.is_empty() {
        return Err(MessageError::InvalidFormat("empty array".to_string()));
    }
    Ok(arr)
}

fn message_type(arr: &[Value]) -> Result<&str, MessageError> {
    arr[0]
        .as_str()
        .ok_or_else(|| MessageError::InvalidFormat("first element not a string".to_string()))
}

fn string_at(arr: &[Value], index: usize, field: &str) -> Result<String, MessageError> {
    arr.get(index)
        .ok_or_else(|| MessageError::MissingField(field.to_string()))?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| MessageError::InvalidFormat(format!("{field} not a string")))
}

/// Filter for subscription requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Event IDs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    /// Authors (pubkeys)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    /// Event kinds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    /// Events since timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    /// Events until timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    /// Maximum number of events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// NIP-50 full-text query
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,

    /// Generic tag queries, keyed `#<letter>`. Values within one key are OR'd.
    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    /// Create a new empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(mut self, ids: Vec<String>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn authors(mut self, authors: Vec<String>) -> Self {
        self.authors = Some(authors);
        self
    }

    pub fn kinds(mut self, kinds: Vec<u16>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn search(mut self, query: impl Into<String>) -> Self {
        self.search = Some(query.into());
        self
    }

    /// Add a tag filter. The key should be the tag letter (e.g., "e", "p").
    pub fn tag(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.tags.insert(format!("#{}", key.into()), values);
        self
    }

    /// Filter by #p (pubkey reference) tags.
    pub fn pubkey_refs(self, pubkeys: Vec<String>) -> Self {
        self.tag("p", pubkeys)
    }

    /// Local evaluation of the filter, the way a relay would apply it.
    ///
    /// `limit` is not considered. `search` is a case-insensitive substring
    /// match on content.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids
            && !ids.contains(&event.id)
        {
            return false;
        }
        if let Some(authors) = &self.authors
            && !authors.contains(&event.pubkey)
        {
            return false;
        }
        if let Some(kinds) = &self.kinds
            && !kinds.contains(&event.kind)
        {
            return false;
        }
        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }
        if let Some(query) = &self.search
            && !event
                .content
                .to_lowercase()
                .contains(&query.to_lowercase())
        {
            return false;
        }

        self.tags.iter().all(|(key, values)| {
            let name = key.trim_start_matches('#');
            event
                .tag_values(name)
                .any(|value| values.iter().any(|v| v == value))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn event() -> Event {
        Event {
            id: "abc123".to_string(),
            pubkey: "pubkey123".to_string(),
            created_at: 1234567890,
            kind: 42,
            tags: vec![
                vec!["h".to_string(), "room".to_string()],
                vec!["p".to_string(), "alice".to_string()],
                vec!["p".to_string(), "bob".to_string()],
            ],
            content: "Hello Relay".to_string(),
            sig: "sig123".to_string(),
        }
    }

    #[test]
    fn test_client_message_event() {
        let json = ClientMessage::Event(event()).to_json().unwrap();
        assert!(json.starts_with(r#"["EVENT",{"#));
        assert!(json.contains("abc123"));
    }

    #[test]
    fn test_client_message_req_flat_tags() {
        let filter = Filter::new()
            .kinds(vec![42])
            .tag("h", vec!["room".to_string()])
            .limit(10);

        let msg = ClientMessage::Req {
            subscription_id: "sub1".to_string(),
            filters: vec![filter.clone()],
        };

        let json = msg.to_json().unwrap();
        assert_eq!(
            json,
            r##"["REQ","sub1",{"kinds":[42],"limit":10,"#h":["room"]}]"##
        );

        let parsed = ClientMessage::from_json(&json).unwrap();
        assert_eq!(
            parsed,
            ClientMessage::Req {
                subscription_id: "sub1".to_string(),
                filters: vec![filter],
            }
        );
    }

    #[test]
    fn test_client_message_close() {
        let msg = ClientMessage::Close {
            subscription_id: "sub1".to_string(),
        };
        assert_eq!(msg.to_json().unwrap(), r#"["CLOSE","sub1"]"#);
    }

    #[test]
    fn test_relay_message_event() {
        let json = r#"["EVENT","sub1",{"id":"abc","pubkey":"pk","created_at":123,"kind":1,"tags":[],"content":"Hello","sig":"sig"}]"#;
        match RelayMessage::from_json(json).unwrap() {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                assert_eq!(subscription_id, "sub1");
                assert_eq!(event.id, "abc");
                assert_eq!(event.content, "Hello");
            }
            other => panic!("wrong message type: {other:?}"),
        }
    }

    #[test]
    fn test_relay_message_ok_failure() {
        let json = r#"["OK","event123",false,"duplicate: already have this event"]"#;
        match RelayMessage::from_json(json).unwrap() {
            RelayMessage::Ok {
                event_id,
                success,
                message,
            } => {
                assert_eq!(event_id, "event123");
                assert!(!success);
                assert!(message.contains("duplicate"));
            }
            other => panic!("wrong message type: {other:?}"),
        }
    }

    #[test]
    fn test_relay_message_eose_closed_notice() {
        assert_eq!(
            RelayMessage::from_json(r#"["EOSE","sub1"]"#).unwrap(),
            RelayMessage::Eose {
                subscription_id: "sub1".to_string()
            }
        );
        assert_eq!(
            RelayMessage::from_json(r#"["CLOSED","sub1","error: too many subscriptions"]"#)
                .unwrap(),
            RelayMessage::Closed {
                subscription_id: "sub1".to_string(),
                message: "error: too many subscriptions".to_string(),
            }
        );
        assert_eq!(
            RelayMessage::from_json(r#"["NOTICE","rate limited"]"#).unwrap(),
            RelayMessage::Notice {
                message: "rate limited".to_string()
            }
        );
    }

    #[test]
    fn test_relay_message_encodes_back() {
        let msg = RelayMessage::Event {
            subscription_id: "s".to_string(),
            event: event(),
        };
        assert_eq!(RelayMessage::from_json(&msg.to_json()).unwrap(), msg);
        assert_eq!(
            RelayMessage::Eose {
                subscription_id: "s".to_string()
            }
            .to_json(),
            r#"["EOSE","s"]"#
        );
    }

    #[test]
    fn test_invalid_message() {
        assert!(RelayMessage::from_json("not valid json").is_err());
        assert!(RelayMessage::from_json("[]").is_err());
        assert!(RelayMessage::from_json("[1]").is_err());
        assert!(RelayMessage::from_json(r#"["UNKNOWN"]"#).is_err());
        assert!(RelayMessage::from_json(r#"["EVENT","sub1"]"#).is_err());
        assert!(RelayMessage::from_json(r#"["EVENT","sub1",{"id":1}]"#).is_err());
    }

    #[test]
    fn test_filter_serialization_skips_empty() {
        let json = serde_json::to_string(&Filter::new().kinds(vec![1]).search("rust")).unwrap();
        assert!(json.contains("\"kinds\":[1]"));
        assert!(json.contains("\"search\":\"rust\""));
        assert!(!json.contains("authors"));
        assert!(!json.contains('#'));
    }

    #[test]
    fn test_filter_matches() {
        let event = event();

        assert!(Filter::new().kinds(vec![42]).matches(&event));
        assert!(!Filter::new().kinds(vec![1]).matches(&event));
        assert!(Filter::new().since(1234567890).matches(&event));
        assert!(!Filter::new().since(1234567891).matches(&event));
        assert!(!Filter::new().until(1234567889).matches(&event));

        // Values within a tag key are OR'd.
        assert!(
            Filter::new()
                .pubkey_refs(vec!["carol".to_string(), "bob".to_string()])
                .matches(&event)
        );
        assert!(
            !Filter::new()
                .pubkey_refs(vec!["carol".to_string()])
                .matches(&event)
        );

        // Distinct tag keys are AND'd.
        assert!(
            !Filter::new()
                .tag("h", vec!["room".to_string()])
                .tag("t", vec!["rust".to_string()])
                .matches(&event)
        );

        assert!(Filter::new().search("hello").matches(&event));
        assert!(!Filter::new().search("goodbye").matches(&event));
    }
}
