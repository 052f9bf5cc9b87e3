//! Builds the per-group chat view out of raw transcript events.
//!
//! The transcript table stores inner events exactly as they were decrypted;
//! everything the UI renders on top of them (replies, reactions, deletions,
//! invoice/payment pairing) is derived here and never written back.

use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};

use crate::events;
use crate::messages::TEMP_EVENT_ID;

/// Chat message kinds the aggregator renders. Kind 4 and 14 are legacy
/// unencrypted-to-the-relay DMs shown read-only and flagged insecure.
const CHAT_KIND: u16 = 9;
const LEGACY_DM_KIND: u16 = 4;
const LEGACY_GIFT_WRAPPED_DM_KIND: u16 = 14;
const REACTION_KIND: u16 = 7;
const DELETION_KIND: u16 = 5;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Reaction {
    pub id: String,
    pub author: PublicKey,
    pub content: String,
    pub created_at: Timestamp,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LightningInvoiceData {
    pub invoice: String,
    /// Amount in sats (the tag carries millisats).
    pub amount: u64,
    pub description: Option<String>,
    pub is_paid: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LightningPaymentData {
    pub preimage: String,
    pub is_paid: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatMessage {
    pub id: String,
    pub author: PublicKey,
    pub content: String,
    pub created_at: Timestamp,
    pub kind: u16,
    pub reply_to_id: Option<String>,
    pub is_mine: bool,
    /// Hidden from list queries, retained for audit.
    pub is_deleted: bool,
    /// Legacy kind 4/14 traffic leaks metadata to relay operators.
    pub is_insecure: bool,
    pub reactions: Vec<Reaction>,
    pub lightning_invoice: Option<LightningInvoiceData>,
    pub lightning_payment: Option<LightningPaymentData>,
    pub event: UnsignedEvent,
}

fn event_id_string(event: &UnsignedEvent) -> String {
    event
        .id
        .map(|id| id.to_string())
        .unwrap_or_else(|| TEMP_EVENT_ID.to_string())
}

/// Aggregates raw transcript events into the ordered chat view.
///
/// Entries come back in ascending (created_at, id) order, including deleted
/// entries (callers filter with [`list_messages`] for display).
pub fn aggregate_messages_for_group(
    events: &[UnsignedEvent],
    my_pubkey: &PublicKey,
) -> Vec<ChatMessage> {
    let mut messages: Vec<ChatMessage> = Vec::new();

    for event in events {
        let kind = event.kind.as_u16();
        if kind != CHAT_KIND && kind != LEGACY_DM_KIND && kind != LEGACY_GIFT_WRAPPED_DM_KIND {
            continue;
        }
        let invoice = events::bolt11_tag(&event.tags).map(|tag| LightningInvoiceData {
            invoice: tag.invoice,
            amount: tag.amount_msats / 1000,
            description: tag.description,
            is_paid: false,
        });
        let payment = events::preimage_tag(&event.tags).map(|preimage| LightningPaymentData {
            preimage,
            is_paid: false,
        });
        messages.push(ChatMessage {
            id: event_id_string(event),
            author: event.pubkey,
            content: event.content.clone(),
            created_at: event.created_at,
            kind,
            reply_to_id: events::reply_to_id(&event.tags).map(|id| id.to_string()),
            is_mine: event.pubkey == *my_pubkey,
            is_deleted: false,
            is_insecure: kind == LEGACY_DM_KIND || kind == LEGACY_GIFT_WRAPPED_DM_KIND,
            reactions: Vec::new(),
            lightning_invoice: invoice,
            lightning_payment: payment,
            event: event.clone(),
        });
    }

    // Deletions are valid only when authored by the target's author. They
    // apply to chat messages and to reactions alike.
    let mut deleted_ids: Vec<String> = Vec::new();
    for event in events {
        if event.kind.as_u16() != DELETION_KIND {
            continue;
        }
        for target_id in events::e_tags(&event.tags) {
            let target_id = target_id.to_string();
            let target_author = messages
                .iter()
                .find(|m| m.id == target_id)
                .map(|m| m.author)
                .or_else(|| {
                    events
                        .iter()
                        .find(|e| event_id_string(e) == target_id)
                        .map(|e| e.pubkey)
                });
            if target_author == Some(event.pubkey) {
                deleted_ids.push(target_id);
            }
        }
    }
    for message in messages.iter_mut() {
        if deleted_ids.contains(&message.id) {
            message.is_deleted = true;
        }
    }

    // Reactions attach to their target's reaction list.
    for event in events {
        if event.kind.as_u16() != REACTION_KIND {
            continue;
        }
        let reaction_id = event_id_string(event);
        if deleted_ids.contains(&reaction_id) {
            continue;
        }
        let Some(target_id) = events::first_e_tag(&event.tags) else {
            continue;
        };
        let target_id = target_id.to_string();
        if let Some(target) = messages.iter_mut().find(|m| m.id == target_id) {
            target.reactions.push(Reaction {
                id: reaction_id,
                author: event.pubkey,
                content: event.content.clone(),
                created_at: event.created_at,
            });
        }
    }

    // Pair payments with the invoices they settle. A payment whose reply
    // target carries an invoice in this group marks both sides paid; a
    // deletion never flips an invoice back to unpaid.
    let mut paid_invoice_ids: Vec<String> = Vec::new();
    for message in messages.iter() {
        if message.lightning_payment.is_none() {
            continue;
        }
        if let Some(reply_to) = &message.reply_to_id {
            let target_has_invoice = messages
                .iter()
                .any(|m| &m.id == reply_to && m.lightning_invoice.is_some());
            if target_has_invoice {
                paid_invoice_ids.push(reply_to.clone());
            }
        }
    }
    for message in messages.iter_mut() {
        let settles_invoice = message
            .reply_to_id
            .as_ref()
            .map(|reply_to| paid_invoice_ids.contains(reply_to))
            .unwrap_or(false);
        if settles_invoice {
            if let Some(payment) = message.lightning_payment.as_mut() {
                payment.is_paid = true;
            }
        }
        if paid_invoice_ids.contains(&message.id) {
            if let Some(invoice) = message.lightning_invoice.as_mut() {
                invoice.is_paid = true;
            }
        }
    }

    messages.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    messages
}

/// The display list: deleted entries are hidden, everything else stays.
pub fn list_messages(
    events: &[UnsignedEvent],
    my_pubkey: &PublicKey,
    limit: Option<usize>,
) -> Vec<ChatMessage> {
    let mut messages: Vec<ChatMessage> = aggregate_messages_for_group(events, my_pubkey)
        .into_iter()
        .filter(|m| !m.is_deleted)
        .collect();
    if let Some(limit) = limit {
        let skip = messages.len().saturating_sub(limit);
        messages.drain(..skip);
    }
    messages
}

/// Finds an entry by id, deleted or not.
pub fn find_message(
    events: &[UnsignedEvent],
    my_pubkey: &PublicKey,
    event_id: &str,
) -> Option<ChatMessage> {
    aggregate_messages_for_group(events, my_pubkey)
        .into_iter()
        .find(|m| m.id == event_id)
}

/// Walks the reply chain from an entry back to its root, returning entries
/// root first and ending with the entry itself.
pub fn reply_chain(
    events: &[UnsignedEvent],
    my_pubkey: &PublicKey,
    event_id: &str,
) -> Vec<ChatMessage> {
    let messages = aggregate_messages_for_group(events, my_pubkey);
    let mut chain: Vec<ChatMessage> = Vec::new();
    let mut current = messages.iter().find(|m| m.id == event_id).cloned();
    while let Some(message) = current {
        chain.push(message.clone());
        current = match &message.reply_to_id {
            // Guard against reply cycles
            Some(parent_id) if !chain.iter().any(|m| &m.id == parent_id) => {
                messages.iter().find(|m| &m.id == parent_id).cloned()
            }
            _ => None,
        };
    }
    chain.reverse();
    chain
}

/// Reaction multiset for an entry: (emoji, count), count descending, emoji
/// code point ascending on ties. Counts only non-deleted reactions.
pub fn reactions_summary(
    events: &[UnsignedEvent],
    my_pubkey: &PublicKey,
    event_id: &str,
) -> Vec<(String, usize)> {
    let messages = aggregate_messages_for_group(events, my_pubkey);
    let Some(message) = messages.iter().find(|m| m.id == event_id) else {
        return Vec::new();
    };
    let mut counts: Vec<(String, usize)> = Vec::new();
    for reaction in &message.reactions {
        match counts.iter_mut().find(|(emoji, _)| emoji == &reaction.content) {
            Some((_, count)) => *count += 1,
            None => counts.push((reaction.content.clone(), 1)),
        }
    }
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unsigned(
        keys: &Keys,
        kind: u16,
        content: &str,
        created_at: u64,
        tags: Vec<Tag>,
    ) -> UnsignedEvent {
        let mut event = UnsignedEvent::new(
            keys.public_key(),
            Timestamp::from(created_at),
            Kind::Custom(kind),
            tags,
            content,
        );
        event.ensure_id();
        event
    }

    fn id_of(event: &UnsignedEvent) -> String {
        event.id.unwrap().to_string()
    }

    #[test]
    fn test_messages_ordered_by_created_at_then_id() {
        let alice = Keys::generate();
        let me = alice.public_key();
        let m1 = unsigned(&alice, 9, "first", 1000, vec![]);
        let m2 = unsigned(&alice, 9, "second", 2000, vec![]);
        let m3 = unsigned(&alice, 9, "also-second", 2000, vec![]);

        let out = aggregate_messages_for_group(&[m2.clone(), m3.clone(), m1.clone()], &me);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].content, "first");
        // Tie broken by id lexicographic ascending
        let (a, b) = (id_of(&m2), id_of(&m3));
        let expected_second = if a < b { "second" } else { "also-second" };
        assert_eq!(out[1].content, expected_second);
        assert!(out[0].is_mine);
    }

    #[test]
    fn test_reply_to_uses_first_q_tag() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let root = unsigned(&alice, 9, "root", 1000, vec![]);
        let reply = unsigned(
            &bob,
            9,
            "reply",
            2000,
            vec![Tag::parse(["q", &id_of(&root)]).unwrap()],
        );

        let events = vec![root.clone(), reply.clone()];
        let chain = reply_chain(&events, &alice.public_key(), &id_of(&reply));
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].content, "root");
        assert_eq!(chain[1].content, "reply");
    }

    #[test]
    fn test_invoice_and_payment_pairing() {
        // Spec scenario: A sends an invoice, B replies with the preimage.
        let alice = Keys::generate();
        let bob = Keys::generate();
        let invoice_msg = unsigned(
            &alice,
            9,
            "pay me",
            1000,
            vec![Tag::parse(["bolt11", "INV", "21000", "Bitdevs pizza"]).unwrap()],
        );
        let payment_msg = unsigned(
            &bob,
            9,
            "paid!",
            2000,
            vec![
                Tag::parse(["q", &id_of(&invoice_msg), "relay", &alice.public_key().to_hex()])
                    .unwrap(),
                Tag::parse(["preimage", "PRE"]).unwrap(),
            ],
        );

        let events = vec![invoice_msg.clone(), payment_msg.clone()];
        let out = aggregate_messages_for_group(&events, &alice.public_key());

        let invoice = out.iter().find(|m| m.id == id_of(&invoice_msg)).unwrap();
        let lightning_invoice = invoice.lightning_invoice.as_ref().unwrap();
        assert!(lightning_invoice.is_paid);
        assert_eq!(lightning_invoice.amount, 21);
        assert_eq!(lightning_invoice.description.as_deref(), Some("Bitdevs pizza"));

        let payment = out.iter().find(|m| m.id == id_of(&payment_msg)).unwrap();
        assert!(payment.lightning_payment.as_ref().unwrap().is_paid);

        // No reactions were involved
        assert!(reactions_summary(&events, &alice.public_key(), &id_of(&invoice_msg)).is_empty());
    }

    #[test]
    fn test_payment_without_matching_invoice_stays_unpaid() {
        let bob = Keys::generate();
        let lone_payment = unsigned(
            &bob,
            9,
            "paid",
            1000,
            vec![Tag::parse(["preimage", "PRE"]).unwrap()],
        );
        let out = aggregate_messages_for_group(&[lone_payment], &bob.public_key());
        assert!(!out[0].lightning_payment.as_ref().unwrap().is_paid);
    }

    #[test]
    fn test_deletion_by_author_hides_from_list_but_find_returns_it() {
        let alice = Keys::generate();
        let msg = unsigned(&alice, 9, "oops", 1000, vec![]);
        let deletion = unsigned(
            &alice,
            5,
            "",
            2000,
            vec![Tag::parse(["e", &id_of(&msg)]).unwrap()],
        );

        let events = vec![msg.clone(), deletion];
        let me = alice.public_key();

        let listed = list_messages(&events, &me, None);
        assert!(listed.iter().all(|m| m.id != id_of(&msg)));

        let found = find_message(&events, &me, &id_of(&msg)).unwrap();
        assert!(found.is_deleted);
        assert_eq!(found.content, "oops");
    }

    #[test]
    fn test_deletion_by_non_author_is_ignored() {
        let alice = Keys::generate();
        let mallory = Keys::generate();
        let msg = unsigned(&alice, 9, "keep me", 1000, vec![]);
        let deletion = unsigned(
            &mallory,
            5,
            "",
            2000,
            vec![Tag::parse(["e", &id_of(&msg)]).unwrap()],
        );

        let events = vec![msg.clone(), deletion];
        let listed = list_messages(&events, &alice.public_key(), None);
        assert!(listed.iter().any(|m| m.id == id_of(&msg)));
    }

    #[test]
    fn test_reactions_summary_sorted_by_count_then_codepoint() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let carol = Keys::generate();
        let msg = unsigned(&alice, 9, "react to me", 1000, vec![]);
        let target_tag = Tag::parse(["e", &id_of(&msg)]).unwrap();

        let events = vec![
            msg.clone(),
            unsigned(&bob, 7, "🔥", 1100, vec![target_tag.clone()]),
            unsigned(&carol, 7, "🔥", 1200, vec![target_tag.clone()]),
            unsigned(&bob, 7, "🍕", 1300, vec![target_tag.clone()]),
            unsigned(&carol, 7, "👍", 1400, vec![target_tag.clone()]),
        ];

        let summary = reactions_summary(&events, &alice.public_key(), &id_of(&msg));
        assert_eq!(summary.len(), 3);
        assert_eq!(summary[0], ("🔥".to_string(), 2));
        // Tie at 1 broken by code point ascending: 🍕 (U+1F355) < 👍 (U+1F44D)
        assert_eq!(summary[1], ("🍕".to_string(), 1));
        assert_eq!(summary[2], ("👍".to_string(), 1));
    }

    #[test]
    fn test_deleted_reaction_leaves_summary() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let msg = unsigned(&alice, 9, "react", 1000, vec![]);
        let reaction = unsigned(
            &bob,
            7,
            "🔥",
            1100,
            vec![Tag::parse(["e", &id_of(&msg)]).unwrap()],
        );
        let retraction = unsigned(
            &bob,
            5,
            "",
            1200,
            vec![Tag::parse(["e", &id_of(&reaction)]).unwrap()],
        );

        let events = vec![msg.clone(), reaction, retraction];
        let summary = reactions_summary(&events, &alice.public_key(), &id_of(&msg));
        assert!(summary.is_empty());
    }

    #[test]
    fn test_legacy_kinds_flagged_insecure() {
        let alice = Keys::generate();
        let legacy = unsigned(&alice, 4, "old dm", 1000, vec![]);
        let wrapped = unsigned(&alice, 14, "newer but leaky", 2000, vec![]);
        let modern = unsigned(&alice, 9, "mls", 3000, vec![]);

        let out =
            aggregate_messages_for_group(&[legacy, wrapped, modern], &alice.public_key());
        assert_eq!(out.len(), 3);
        assert!(out[0].is_insecure);
        assert!(out[1].is_insecure);
        assert!(!out[2].is_insecure);
    }

    #[test]
    fn test_list_limit_keeps_newest() {
        let alice = Keys::generate();
        let events: Vec<UnsignedEvent> = (0..5)
            .map(|i| unsigned(&alice, 9, &format!("m{}", i), 1000 + i, vec![]))
            .collect();
        let out = list_messages(&events, &alice.public_key(), Some(2));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].content, "m3");
        assert_eq!(out[1].content, "m4");
    }
}
