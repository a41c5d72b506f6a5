//! NIP-57: Lightning Zaps
//!
//! Only the receipt side is handled here: a kind 9735 receipt published by the
//! recipient's wallet, carrying the paid `bolt11` invoice and the original
//! kind 9734 zap request as JSON in its `description` tag.

use crate::kinds::{ZAP_RECEIPT_KIND, ZAP_REQUEST_KIND};
use crate::nip01::Event;
use thiserror::Error;

/// Errors that can occur during NIP-57 operations
#[derive(Debug, Error)]
pub enum Nip57Error {
    #[error("invalid zap receipt: {0}")]
    InvalidZapReceipt(String),

    #[error("invalid zap request: {0}")]
    InvalidZapRequest(String),

    #[error("missing required tag: {0}")]
    MissingTag(String),

    #[error("invalid tag value: {0}")]
    InvalidTagValue(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A zap receipt (kind 9735)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZapReceipt {
    /// Recipient's public key
    pub recipient_pubkey: String,
    /// Sender's public key (`P` tag, else the zap request author)
    pub sender_pubkey: Option<String>,
    /// Event that was zapped, if any
    pub zapped_event: Option<String>,
    /// BOLT-11 invoice that was paid
    pub bolt11: String,
    /// JSON-encoded zap request
    pub description: String,
    /// Amount from the zap request's `amount` tag
    pub amount_msats: Option<u64>,
    /// Comment carried by the zap request
    pub comment: String,
}

impl ZapReceipt {
    pub fn from_event(event: &Event) -> Result<Self, Nip57Error> {
        if event.kind != ZAP_RECEIPT_KIND {
            return Err(Nip57Error::InvalidZapReceipt(format!(
                "expected kind {}, got {}",
                ZAP_RECEIPT_KIND, event.kind
            )));
        }

        let recipient_pubkey = event
            .first_tag("p")
            .ok_or_else(|| Nip57Error::MissingTag("p tag (recipient pubkey)".to_string()))?
            .to_string();
        let bolt11 = event
            .first_tag("bolt11")
            .ok_or_else(|| Nip57Error::MissingTag("bolt11 tag".to_string()))?
            .to_string();
        let description = event
            .first_tag("description")
            .ok_or_else(|| Nip57Error::MissingTag("description tag".to_string()))?
            .to_string();

        // A receipt with an unreadable request is still a receipt; it just
        // has no amount or comment.
        let request = zap_request(&description).ok();

        let amount_msats = match request.as_ref().and_then(|r| r.first_tag("amount")) {
            Some(raw) => Some(raw.parse::<u64>().map_err(|_| {
                Nip57Error::InvalidTagValue(format!("invalid amount: {raw}"))
            })?),
            None => None,
        };

        Ok(Self {
            sender_pubkey: event
                .first_tag("P")
                .map(str::to_string)
                .or_else(|| request.as_ref().map(|r| r.pubkey.clone())),
            zapped_event: event.first_tag("e").map(str::to_string),
            comment: request.map(|r| r.content).unwrap_or_default(),
            recipient_pubkey,
            bolt11,
            description,
            amount_msats,
        })
    }

    /// Amount in whole sats, rounded down.
    pub fn amount_sats(&self) -> Option<u64> {
        self.amount_msats.map(|msats| msats / 1000)
    }

    /// The embedded zap request.
    pub fn zap_request(&self) -> Result<Event, Nip57Error> {
        zap_request(&self.description)
    }
}

fn zap_request(description: &str) -> Result<Event, Nip57Error> {
    let event: Event = serde_json::from_str(description)?;
    if event.kind != ZAP_REQUEST_KIND {
        return Err(Nip57Error::InvalidZapRequest(format!(
            "expected kind {}, got {}",
            ZAP_REQUEST_KIND, event.kind
        )));
    }
    Ok(event)
}
