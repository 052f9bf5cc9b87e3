//! Contact search over relay-side NIP-50 metadata search.

use nostr_sdk::prelude::*;
use std::collections::HashMap;

use crate::nostr_manager::{NostrManager, Result};
use crate::types::EnrichedContact;

const SEARCH_LIMIT: usize = 20;

impl NostrManager {
    /// Searches relays for profiles matching the query and enriches each hit.
    pub async fn search_for_enriched_contacts(
        &self,
        query: String,
    ) -> Result<HashMap<String, EnrichedContact>> {
        let search_filter = Filter::new()
            .kind(Kind::Metadata)
            .search(&query)
            .limit(SEARCH_LIMIT);

        let events = self
            .client
            .fetch_events(vec![search_filter], self.timeout().await)
            .await?;

        let mut results: HashMap<String, EnrichedContact> = HashMap::new();
        for event in events.into_iter() {
            let Ok(metadata) = Metadata::from_json(&event.content) else {
                continue;
            };
            let inbox_relays = self
                .fetch_user_inbox_relays(event.pubkey)
                .await
                .unwrap_or_default();
            let key_packages = self
                .fetch_user_key_packages(event.pubkey)
                .await
                .unwrap_or_default();
            let key_package_relays = self
                .fetch_user_key_package_relays(event.pubkey)
                .await
                .unwrap_or_default();

            results.insert(
                event.pubkey.to_hex(),
                EnrichedContact {
                    metadata,
                    nip17: !inbox_relays.is_empty(),
                    nip104: !key_packages.is_empty(),
                    inbox_relays: inbox_relays.into_iter().map(|(url, _)| url).collect(),
                    key_package_relays: key_package_relays
                        .into_iter()
                        .map(|(url, _)| url)
                        .collect(),
                },
            );
        }

        Ok(results)
    }
}
