use nostr_sdk::prelude::*;
use std::collections::HashMap;

use crate::accounts::Account;
use crate::commands::{CommandError, Result};
use crate::relays::{Relay, RelayMeta, RelayType};
use crate::types::EnrichedContact;
use crate::Murmur;

/// Per-relay connection status for the UI's relay screen.
pub async fn fetch_relays(murmur: &Murmur) -> Result<HashMap<String, String>> {
    Ok(murmur.nostr.relay_statuses().await.into_iter().collect())
}

/// Publishes a relay list (10002, 10050, or 10051) for the active account
/// and stores the new set locally first. The stored set survives a publish
/// failure; reconnect retries the publish.
pub async fn publish_relay_list(
    relays: Vec<(String, Option<String>)>,
    kind: u64,
    murmur: &Murmur,
) -> Result<()> {
    let account = Account::get_active(&murmur.database).await?;
    let kind = Kind::from(kind as u16);
    let relay_type = RelayType::from_kind(kind)
        .ok_or_else(|| CommandError::new("EventMalformed", "Not a relay list kind"))?;

    let entries: Vec<(String, RelayMeta)> = relays
        .into_iter()
        .map(|(url, mode)| (url, RelayMeta::from(mode)))
        .collect();

    Relay::replace_for_account(&account.pubkey, relay_type, &entries, &murmur.database).await?;

    let keys = account.keys(&murmur.secrets)?;
    let event = EventBuilder::new(kind, "")
        .tags(Relay::relay_list_tags(&entries))
        .sign(&keys)
        .await
        .map_err(|e| CommandError::new("Internal", e))?;

    let mut targets = account.relays(RelayType::Nostr, &murmur.database).await?;
    if targets.is_empty() {
        targets = murmur.nostr.relays().await;
    }
    murmur.nostr.publish_event_to(targets, event).await?;
    Ok(())
}

/// Publishes kind 0 metadata for the active account and mirrors it locally.
pub async fn publish_metadata(metadata: Metadata, murmur: &Murmur) -> Result<()> {
    let mut account = Account::get_active(&murmur.database).await?;
    let keys = account.keys(&murmur.secrets)?;

    let event = EventBuilder::metadata(&metadata)
        .sign(&keys)
        .await
        .map_err(|e| CommandError::new("Internal", e))?;

    let mut targets = account.relays(RelayType::Nostr, &murmur.database).await?;
    if targets.is_empty() {
        targets = murmur.nostr.relays().await;
    }
    murmur.nostr.publish_event_to(targets, event).await?;

    account.metadata = metadata;
    account.save(&murmur.database).await?;
    Ok(())
}

pub async fn fetch_enriched_contacts(murmur: &Murmur) -> Result<HashMap<String, EnrichedContact>> {
    murmur
        .nostr
        .fetch_enriched_contacts()
        .await
        .map_err(CommandError::from)
}

pub async fn query_enriched_contact(
    pubkey: String,
    update_account: bool,
    murmur: &Murmur,
) -> Result<EnrichedContact> {
    let public_key =
        PublicKey::from_hex(&pubkey).map_err(|e| CommandError::new("InvalidKey", e))?;
    let contact = murmur.nostr.query_enriched_contact(public_key).await?;

    if update_account {
        if let Ok(mut account) = Account::find_by_pubkey(&pubkey, &murmur.database).await {
            account.metadata = contact.metadata.clone();
            account.save(&murmur.database).await?;

            let inbox: Vec<(String, RelayMeta)> = contact
                .inbox_relays
                .iter()
                .map(|url| (url.clone(), RelayMeta::ReadWrite))
                .collect();
            let key_package: Vec<(String, RelayMeta)> = contact
                .key_package_relays
                .iter()
                .map(|url| (url.clone(), RelayMeta::ReadWrite))
                .collect();
            Relay::replace_for_account(&pubkey, RelayType::Inbox, &inbox, &murmur.database).await?;
            Relay::replace_for_account(
                &pubkey,
                RelayType::KeyPackage,
                &key_package,
                &murmur.database,
            )
            .await?;
        }
    }

    Ok(contact)
}

pub async fn search_for_enriched_contacts(
    query: String,
    murmur: &Murmur,
) -> Result<HashMap<String, EnrichedContact>> {
    murmur
        .nostr
        .search_for_enriched_contacts(query)
        .await
        .map_err(CommandError::from)
}

/// Manual catch-up: replays gift wraps and group traffic since the last
/// sync through the inbox pipeline.
pub async fn fetch_and_process_mls_messages(murmur: &Murmur) -> Result<()> {
    let account = Account::get_active(&murmur.database).await?;
    let pubkey =
        PublicKey::from_hex(&account.pubkey).map_err(|e| CommandError::new("InvalidKey", e))?;
    let group_ids = account.nostr_group_ids(&murmur.database).await?;

    murmur
        .nostr
        .fetch_for_user(pubkey, account.last_synced, group_ids)
        .await?;
    Account::update_last_synced(&account.pubkey, &murmur.database).await?;
    Ok(())
}
