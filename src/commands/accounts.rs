use nostr_sdk::prelude::*;
use std::sync::Arc;

use crate::accounts::Account;
use crate::commands::{CommandError, Result};
use crate::relays::{Relay, RelayType};
use crate::signals::Signal;
use crate::Murmur;

/// Generates a fresh identity, names it, and makes it active.
pub async fn create_identity(name: String, murmur: &Arc<Murmur>) -> Result<Account> {
    let mut account = Account::new(&murmur.database, &murmur.secrets).await?;
    account.metadata = Metadata::new().name(name);
    account.save(&murmur.database).await?;

    let account = murmur.set_active_account(&account.pubkey).await?;
    Ok(account)
}

/// Logs in with an nsec or hex secret key. New accounts get their metadata
/// and relay lists seeded from the mesh; either way the account becomes
/// active.
pub async fn login(nsec_or_hex: String, murmur: &Arc<Murmur>) -> Result<Account> {
    let keys = Account::keys_from_secret(&nsec_or_hex)?;
    let pubkey = keys.public_key();

    if Account::find_by_pubkey(&pubkey.to_hex(), &murmur.database)
        .await
        .is_err()
    {
        let mut account = Account::add_from_keys(&keys, &murmur.database, &murmur.secrets).await?;

        // Seed metadata, relay lists, and onboarding flags from the mesh.
        // Fetch failures are fine; onboarding just starts unchecked.
        if let Ok(Some(metadata)) = murmur.nostr.fetch_user_metadata(pubkey).await {
            account.metadata = metadata;
        }
        let nostr_relays = murmur
            .nostr
            .fetch_user_relays(pubkey)
            .await
            .unwrap_or_default();
        let inbox_relays = murmur
            .nostr
            .fetch_user_inbox_relays(pubkey)
            .await
            .unwrap_or_default();
        let key_package_relays = murmur
            .nostr
            .fetch_user_key_package_relays(pubkey)
            .await
            .unwrap_or_default();
        let key_packages = murmur
            .nostr
            .fetch_user_key_packages(pubkey)
            .await
            .unwrap_or_default();

        account.onboarding.inbox_relays = !inbox_relays.is_empty();
        account.onboarding.key_package_relays = !key_package_relays.is_empty();
        account.onboarding.publish_key_package = !key_packages.is_empty();
        account.save(&murmur.database).await?;

        Relay::replace_for_account(&account.pubkey, RelayType::Nostr, &nostr_relays, &murmur.database)
            .await?;
        Relay::replace_for_account(&account.pubkey, RelayType::Inbox, &inbox_relays, &murmur.database)
            .await?;
        Relay::replace_for_account(
            &account.pubkey,
            RelayType::KeyPackage,
            &key_package_relays,
            &murmur.database,
        )
        .await?;
    }

    let account = murmur.set_active_account(&pubkey.to_hex()).await?;
    Ok(account)
}

/// Removes the account and all derived state. If other accounts remain the
/// first one becomes active; otherwise the next activation must be explicit.
pub async fn logout(pubkey: String, murmur: &Arc<Murmur>) -> Result<()> {
    let account = Account::find_by_pubkey(&pubkey, &murmur.database)
        .await
        .map_err(|_| CommandError::new("NoAccount", "Account not found"))?;

    murmur.signals.emit(Signal::AccountChanging {
        pubkey: account.pubkey.clone(),
    });

    let next_active = account.remove(&murmur.database, &murmur.secrets).await?;
    murmur.nostr.event_processor.clear_queue();

    match next_active {
        Some(next_pubkey) => {
            murmur.set_active_account(&next_pubkey).await?;
        }
        None => {
            murmur.nostr_mls.set_current_identity(None);
            murmur.signals.emit(Signal::AccountChanged { pubkey: None });
        }
    }
    Ok(())
}

pub async fn set_active_account(hex_pubkey: String, murmur: &Arc<Murmur>) -> Result<Account> {
    Ok(murmur.set_active_account(&hex_pubkey).await?)
}

/// All accounts, sorted by pubkey.
pub async fn get_accounts(murmur: &Murmur) -> Result<Vec<Account>> {
    Ok(Account::all(&murmur.database).await?)
}

pub async fn update_account_onboarding(
    pubkey: String,
    inbox_relays: bool,
    key_package_relays: bool,
    publish_key_package: bool,
    murmur: &Murmur,
) -> Result<()> {
    Account::update_onboarding(
        &pubkey,
        inbox_relays,
        key_package_relays,
        publish_key_package,
        &murmur.database,
    )
    .await?;
    Ok(())
}

/// Exports the active account's secret key in bech32 form. Never logged.
pub async fn export_nsec(murmur: &Murmur) -> Result<String> {
    let account = Account::get_active(&murmur.database).await?;
    let keys = account.keys(&murmur.secrets)?;
    keys.secret_key()
        .to_bech32()
        .map_err(|e| CommandError::new("Internal", e))
}
