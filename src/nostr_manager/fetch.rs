//! One-shot fetches against the relay mesh: per-user lookups used during
//! login and group creation, plus the catch-up fetch run on identity
//! activation.

use nostr_sdk::prelude::*;

use crate::nostr_manager::event_processor::classify;
use crate::nostr_manager::{NostrManager, Result};
use crate::relays::{Relay, RelayMeta};

impl NostrManager {
    pub async fn fetch_user_metadata(&self, pubkey: PublicKey) -> Result<Option<Metadata>> {
        let events = self
            .client
            .fetch_events(
                vec![Filter::new().kind(Kind::Metadata).author(pubkey).limit(1)],
                self.timeout().await,
            )
            .await?;
        Ok(match events.first() {
            Some(event) => Some(Metadata::from_json(&event.content)?),
            None => None,
        })
    }

    async fn fetch_relay_list(&self, pubkey: PublicKey, kind: Kind) -> Result<Vec<(String, RelayMeta)>> {
        let events = self
            .client
            .fetch_events(
                vec![Filter::new().kind(kind).author(pubkey).limit(1)],
                self.timeout().await,
            )
            .await?;
        Ok(events
            .first()
            .map(Relay::parse_relay_list_event)
            .unwrap_or_default())
    }

    /// The user's general relay list (kind 10002, `r` tags with modes).
    pub async fn fetch_user_relays(&self, pubkey: PublicKey) -> Result<Vec<(String, RelayMeta)>> {
        self.fetch_relay_list(pubkey, Kind::RelayList).await
    }

    /// The user's inbox relays (kind 10050), where gift-wrapped welcomes go.
    pub async fn fetch_user_inbox_relays(
        &self,
        pubkey: PublicKey,
    ) -> Result<Vec<(String, RelayMeta)>> {
        self.fetch_relay_list(pubkey, Kind::InboxRelays).await
    }

    /// The user's key package relays (kind 10051). Key packages must be
    /// world-readable, so these are separate from inbox relays.
    pub async fn fetch_user_key_package_relays(
        &self,
        pubkey: PublicKey,
    ) -> Result<Vec<(String, RelayMeta)>> {
        self.fetch_relay_list(pubkey, Kind::MlsKeyPackageRelays).await
    }

    /// Outstanding key package events (kind 443) for a user.
    pub async fn fetch_user_key_packages(&self, pubkey: PublicKey) -> Result<Vec<Event>> {
        let events = self
            .client
            .fetch_events(
                vec![Filter::new().kind(Kind::MlsKeyPackage).author(pubkey)],
                self.timeout().await,
            )
            .await?;
        Ok(events.into_iter().collect())
    }

    /// Catch-up fetch on identity activation: replays gift wraps addressed
    /// to us plus group traffic since the last sync, through the same
    /// pipeline live subscriptions feed. Dedup makes replays harmless.
    pub async fn fetch_for_user(
        &self,
        pubkey: PublicKey,
        last_synced: Timestamp,
        nostr_group_ids: Vec<String>,
    ) -> Result<()> {
        // Gift wrap timestamps are randomized by the sender, so the since
        // filter would lose welcomes; always replay them all.
        let giftwrap_filter = Filter::new().kind(Kind::GiftWrap).pubkey(pubkey);

        let legacy_filter = Filter::new()
            .kind(Kind::EncryptedDirectMessage)
            .pubkey(pubkey)
            .since(last_synced);

        let mut filters = vec![giftwrap_filter, legacy_filter];
        if !nostr_group_ids.is_empty() {
            filters.push(
                Filter::new()
                    .kind(Kind::MlsGroupMessage)
                    .custom_tag(SingleLetterTag::lowercase(Alphabet::H), nostr_group_ids)
                    .since(last_synced),
            );
        }

        let events = self
            .client
            .fetch_events(filters, self.timeout().await)
            .await?;

        tracing::debug!(
            target: "murmur::nostr_manager::fetch::fetch_for_user",
            "Fetched {} events for catch-up",
            events.len()
        );

        for event in events.into_iter() {
            if let Some(processable) = classify(event) {
                self.event_processor.queue_event(processable);
            }
        }

        Ok(())
    }
}
