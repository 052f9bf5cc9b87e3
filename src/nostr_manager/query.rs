//! Enriched-contact queries: metadata plus messaging capability flags
//! (inbox relays for NIP-17, key packages for MLS) for contacts.

use nostr_sdk::prelude::*;
use std::collections::HashMap;

use crate::nostr_manager::{NostrManager, Result};
use crate::types::EnrichedContact;

impl NostrManager {
    /// Builds the enriched view of a single contact.
    pub async fn query_enriched_contact(&self, pubkey: PublicKey) -> Result<EnrichedContact> {
        let metadata = self
            .fetch_user_metadata(pubkey)
            .await?
            .unwrap_or_default();
        let inbox_relays = self.fetch_user_inbox_relays(pubkey).await?;
        let key_package_relays = self.fetch_user_key_package_relays(pubkey).await?;
        let key_packages = self.fetch_user_key_packages(pubkey).await?;

        Ok(EnrichedContact {
            metadata,
            nip17: !inbox_relays.is_empty(),
            nip104: !key_packages.is_empty(),
            inbox_relays: inbox_relays.into_iter().map(|(url, _)| url).collect(),
            key_package_relays: key_package_relays
                .into_iter()
                .map(|(url, _)| url)
                .collect(),
        })
    }

    /// Enriched view of the whole contact list, batched per kind.
    pub async fn fetch_enriched_contacts(&self) -> Result<HashMap<String, EnrichedContact>> {
        let contact_pubkeys = self
            .client
            .get_contact_list_public_keys(self.timeout().await)
            .await?;

        if contact_pubkeys.is_empty() {
            return Ok(HashMap::new());
        }

        let metadata_filter = Filter::new()
            .kind(Kind::Metadata)
            .authors(contact_pubkeys.clone());
        let relay_lists_filter = Filter::new()
            .kinds(vec![Kind::InboxRelays, Kind::MlsKeyPackageRelays])
            .authors(contact_pubkeys.clone());
        let key_package_filter = Filter::new()
            .kind(Kind::MlsKeyPackage)
            .authors(contact_pubkeys.clone());

        let events = self
            .client
            .fetch_events(
                vec![metadata_filter, relay_lists_filter, key_package_filter],
                self.timeout().await,
            )
            .await?;

        let mut contacts: HashMap<String, EnrichedContact> = contact_pubkeys
            .into_iter()
            .map(|pubkey| (pubkey.to_hex(), EnrichedContact::default()))
            .collect();

        for event in events.into_iter() {
            let Some(contact) = contacts.get_mut(&event.pubkey.to_hex()) else {
                continue;
            };
            match event.kind {
                Kind::Metadata => {
                    if let Ok(metadata) = Metadata::from_json(&event.content) {
                        contact.metadata = metadata;
                    }
                }
                Kind::InboxRelays => {
                    contact.inbox_relays = crate::relays::Relay::parse_relay_list_event(&event)
                        .into_iter()
                        .map(|(url, _)| url)
                        .collect();
                    contact.nip17 = !contact.inbox_relays.is_empty();
                }
                Kind::MlsKeyPackageRelays => {
                    contact.key_package_relays =
                        crate::relays::Relay::parse_relay_list_event(&event)
                            .into_iter()
                            .map(|(url, _)| url)
                            .collect();
                }
                Kind::MlsKeyPackage => {
                    contact.nip104 = true;
                }
                _ => {}
            }
        }

        Ok(contacts)
    }
}
