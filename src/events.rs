//! Event admission checks and tag helpers.
//!
//! Every event entering the pipeline is verified here before anything else
//! looks at it: the id must equal the hash of the canonical serialization and
//! the Schnorr signature must verify against the author key.

use lightning_invoice::SignedRawBolt11Invoice;
use nostr_sdk::prelude::*;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EventError {
    #[error("Event signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("Event malformed: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, EventError>;

/// Verifies id and signature of an inbound event. Events failing this check
/// are never admitted to the pipeline.
pub fn verify_event(event: &Event) -> Result<()> {
    event
        .verify()
        .map_err(|e| EventError::SignatureInvalid(e.to_string()))
}

/// First `e` tag content, if any.
pub fn first_e_tag(tags: &Tags) -> Option<EventId> {
    tags.iter()
        .find(|tag| tag.kind() == TagKind::SingleLetter(SingleLetterTag::lowercase(Alphabet::E)))
        .and_then(|tag| tag.content())
        .and_then(|content| EventId::parse(content).ok())
}

/// All `e` tag contents, in tag order.
pub fn e_tags(tags: &Tags) -> Vec<EventId> {
    tags.iter()
        .filter(|tag| tag.kind() == TagKind::SingleLetter(SingleLetterTag::lowercase(Alphabet::E)))
        .filter_map(|tag| tag.content())
        .filter_map(|content| EventId::parse(content).ok())
        .collect()
}

/// First `p` tag content, if any.
pub fn first_p_tag(tags: &Tags) -> Option<PublicKey> {
    tags.iter()
        .find(|tag| tag.kind() == TagKind::SingleLetter(SingleLetterTag::lowercase(Alphabet::P)))
        .and_then(|tag| tag.content())
        .and_then(|content| PublicKey::parse(content).ok())
}

/// First `q` tag content: the reply target of a chat message.
pub fn reply_to_id(tags: &Tags) -> Option<EventId> {
    tags.iter()
        .find(|tag| tag.kind() == TagKind::SingleLetter(SingleLetterTag::lowercase(Alphabet::Q)))
        .and_then(|tag| tag.content())
        .and_then(|content| EventId::parse(content).ok())
}

/// First `h` tag content: the Nostr group id an MLS wrapper event routes on.
pub fn h_tag(tags: &Tags) -> Option<String> {
    tags.iter()
        .find(|tag| tag.kind() == TagKind::h())
        .and_then(|tag| tag.content())
        .map(|content| content.to_string())
}

/// A parsed `['bolt11', invoice, msats, description?]` tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Bolt11Tag {
    pub invoice: String,
    pub amount_msats: u64,
    pub description: Option<String>,
}

/// First `bolt11` tag, if present and well formed.
pub fn bolt11_tag(tags: &Tags) -> Option<Bolt11Tag> {
    let tag = tags
        .iter()
        .find(|tag| tag.kind() == TagKind::from("bolt11"))?;
    let parts = tag.clone().to_vec();
    if parts.len() < 3 {
        return None;
    }
    let amount_msats = parts[2].parse::<u64>().ok()?;
    Some(Bolt11Tag {
        invoice: parts[1].clone(),
        amount_msats,
        description: parts.get(3).cloned().filter(|d| !d.is_empty()),
    })
}

/// First `preimage` tag content: the payment proof for a settled invoice.
pub fn preimage_tag(tags: &Tags) -> Option<String> {
    tags.iter()
        .find(|tag| tag.kind() == TagKind::from("preimage"))
        .and_then(|tag| tag.content())
        .map(|content| content.to_string())
}

/// Parses a message body for BOLT11 invoices and returns the corresponding
/// `bolt11` tags to attach to the outgoing event.
pub fn bolt11_invoice_tags(message: &str) -> Vec<Tag> {
    let mut tags = Vec::new();

    // Bitcoin network prefixes according to BOLT-11 spec
    const NETWORK_PREFIXES: [&str; 4] = ["lnbc", "lntb", "lntbs", "lnbcrt"];

    if let Some(word) = message.split_whitespace().find(|w| {
        let w_lower = w.to_lowercase();
        NETWORK_PREFIXES
            .iter()
            .any(|prefix| w_lower.starts_with(prefix))
    }) {
        if let Ok(invoice) = SignedRawBolt11Invoice::from_str(word) {
            let amount_msats = invoice
                .raw_invoice()
                .amount_pico_btc()
                .map(|pico_btc| (pico_btc as f64 * 0.1) as u64);

            if let Some(msats) = amount_msats {
                tags.push(Tag::custom(
                    TagKind::from("bolt11"),
                    vec![word.to_string(), msats.to_string()],
                ));
            }
        }
    }

    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags_from(raw: Vec<Vec<&str>>) -> Tags {
        Tags::new(
            raw.into_iter()
                .map(|tag| Tag::parse(tag).expect("Failed to parse tag"))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_verify_event_round_trip() {
        let keys = Keys::generate();
        let event = EventBuilder::text_note("hello")
            .sign(&keys)
            .await
            .expect("Failed to sign");
        assert!(verify_event(&event).is_ok());
    }

    #[tokio::test]
    async fn test_verify_event_rejects_tampered_content() {
        let keys = Keys::generate();
        let event = EventBuilder::text_note("hello")
            .sign(&keys)
            .await
            .expect("Failed to sign");
        let mut json: serde_json::Value =
            serde_json::from_str(&event.as_json()).expect("Failed to parse");
        json["content"] = serde_json::json!("tampered");
        let tampered = Event::from_json(json.to_string()).expect("Failed to rebuild");
        assert!(verify_event(&tampered).is_err());
    }

    #[test]
    fn test_reply_to_id_uses_first_q_tag() {
        let id_a = "5c83da77af1dec6d7289834998ad7aafbd9e2191396d75ec3cc27f5a77226f36";
        let id_b = "7b1c3bd66a3e2a4c4c6c63e7ee0b6c25a33b723d4f7a83c366e0632b8e8e8e60";
        let tags = tags_from(vec![vec!["q", id_a], vec!["q", id_b]]);
        assert_eq!(reply_to_id(&tags), Some(EventId::parse(id_a).unwrap()));
    }

    #[test]
    fn test_bolt11_tag_parsing() {
        let tags = tags_from(vec![vec!["bolt11", "lnbc1...", "21000", "Bitdevs pizza"]]);
        let parsed = bolt11_tag(&tags).expect("Should parse");
        assert_eq!(parsed.invoice, "lnbc1...");
        assert_eq!(parsed.amount_msats, 21000);
        assert_eq!(parsed.description.as_deref(), Some("Bitdevs pizza"));
    }

    #[test]
    fn test_bolt11_tag_without_description() {
        let tags = tags_from(vec![vec!["bolt11", "lnbc1...", "21000"]]);
        let parsed = bolt11_tag(&tags).expect("Should parse");
        assert_eq!(parsed.description, None);
    }

    #[test]
    fn test_bolt11_tag_missing_amount_is_ignored() {
        let tags = tags_from(vec![vec!["bolt11", "lnbc1..."]]);
        assert!(bolt11_tag(&tags).is_none());
    }

    #[test]
    fn test_preimage_tag() {
        let tags = tags_from(vec![vec!["preimage", "deadbeef"]]);
        assert_eq!(preimage_tag(&tags).as_deref(), Some("deadbeef"));
    }

    #[test]
    fn test_h_tag() {
        let tags = tags_from(vec![vec!["h", "abcd1234"]]);
        assert_eq!(h_tag(&tags).as_deref(), Some("abcd1234"));
    }

    #[test]
    fn test_bolt11_invoice_tags_detects_invoice() {
        let invoice = "lnbc15u1p3xnhl2pp5jptserfk3zk4qy42tlucycrfwxhydvlemu9pqr93tuzlv9cc7g3sdqsvfhkcap3xyhx7un8cqzpgxqzjcsp5f8c52y2stc300gl6s4xswtjpc37hrnnr3c9wvtgjfuvqmpm35evq9qyyssqy4lgd8tj637qcjp05rdpxxykjenthxftej7a2zzmwrmrl70fyj9hvj0rewhzj7jfyuwkwcg9g2jpwtk3wkjtwnkdks84hsnu8xps5vsq4gj5hs";
        let message = format!("Please pay me here: {}", invoice);
        let tags = bolt11_invoice_tags(&message);
        assert_eq!(tags.len(), 1);
        let parts = tags[0].clone().to_vec();
        assert_eq!(parts[0], "bolt11");
        assert_eq!(parts[1], invoice);
        assert!(!parts[2].is_empty());
    }

    #[test]
    fn test_bolt11_invoice_tags_ignores_regular_text() {
        assert!(bolt11_invoice_tags("just a regular message").is_empty());
        assert!(bolt11_invoice_tags("lnbc1invalid").is_empty());
    }
}
