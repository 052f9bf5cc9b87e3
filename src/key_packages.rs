//! The key package service: publishes, fetches, consumes, and revokes the
//! kind 443 events that let others add this account to MLS groups.

use nostr_sdk::prelude::*;
use openmls::prelude::KeyPackage;
use thiserror::Error;

use crate::accounts::{Account, AccountError};
use crate::nostr_manager::{NostrManagerError, KEY_PACKAGE_FETCH_TIMEOUT};
use crate::nostr_mls::NostrMlsError;
use crate::relays::RelayType;
use crate::secrets_store::SecretsStoreError;
use crate::Murmur;

/// Publication failures are retried this many times before surfacing.
const PUBLISH_ATTEMPTS: u32 = 3;

#[derive(Error, Debug)]
pub enum KeyPackageError {
    #[error("No valid key package found: {0}")]
    NoValidKeyPackage(String),
    #[error("Error fetching key package: {0}")]
    FetchingKeyPackage(String),
    #[error("Key package already used")]
    AlreadyUsed,
    #[error("Account Error: {0}")]
    Account(#[from] AccountError),
    #[error("Nostr Error: {0}")]
    NostrManager(#[from] NostrManagerError),
    #[error("Nostr Client Error: {0}")]
    NostrClient(#[from] nostr_sdk::client::Error),
    #[error("Nostr Signer Error: {0}")]
    NostrSigner(#[from] nostr_sdk::signer::SignerError),
    #[error("Nostr Event Error: {0}")]
    NostrEvent(#[from] nostr_sdk::event::builder::Error),
    #[error("Nostr MLS Error: {0}")]
    NostrMls(#[from] NostrMlsError),
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Secrets store error: {0}")]
    SecretsStore(#[from] SecretsStoreError),
}

pub type Result<T> = std::result::Result<T, KeyPackageError>;

/// A member's fetched and validated key package, with its event id so the
/// welcome can reference (and so consume) it.
#[derive(Debug, Clone)]
pub struct MemberKeyPackage {
    pub pubkey: String,
    pub event_id: EventId,
    pub key_package: KeyPackage,
}

pub async fn fetch_key_packages_for_members(
    member_pubkeys: &[String],
    murmur: &Murmur,
) -> Result<Vec<MemberKeyPackage>> {
    let mut member_key_packages: Vec<MemberKeyPackage> = Vec::new();

    tracing::debug!(
        target: "murmur::key_packages::fetch_key_packages_for_members",
        "Member pubkeys: {:?}",
        member_pubkeys
    );

    for pubkey in member_pubkeys.iter() {
        let key_package = match fetch_key_package_for_pubkey(pubkey.clone(), murmur).await {
            Ok(Some(kp)) => kp,
            Ok(None) => {
                return Err(KeyPackageError::NoValidKeyPackage(format!(
                    "No valid key package found for member: {}",
                    pubkey
                )));
            }
            Err(e) => {
                tracing::error!(
                    target: "murmur::key_packages::fetch_key_packages_for_members",
                    "Error fetching key package for {}: {}",
                    pubkey,
                    e
                );
                return Err(KeyPackageError::FetchingKeyPackage(format!(
                    "Error fetching valid key package for member: {}",
                    pubkey
                )));
            }
        };
        member_key_packages.push(key_package);
    }
    Ok(member_key_packages)
}

/// Fetches the first valid, unconsumed key package for a user from their
/// key package relays.
pub async fn fetch_key_package_for_pubkey(
    pubkey: String,
    murmur: &Murmur,
) -> Result<Option<MemberKeyPackage>> {
    tracing::debug!(
        target: "murmur::key_packages::fetch_key_package_for_pubkey",
        "Fetching key package for pubkey: {:?}",
        pubkey
    );
    let public_key = PublicKey::from_hex(&pubkey).map_err(AccountError::PublicKey)?;
    let key_package_filter = Filter::new().kind(Kind::MlsKeyPackage).author(public_key);
    let fetch = murmur
        .nostr
        .client
        .fetch_events(vec![key_package_filter], murmur.nostr.timeout().await);
    let key_package_events = tokio::time::timeout(KEY_PACKAGE_FETCH_TIMEOUT, fetch)
        .await
        .map_err(|_| NostrManagerError::Timeout)?
        .map_err(NostrManagerError::Client)?;

    for event in key_package_events.iter() {
        // A package a welcome already referenced must never be reused
        if is_consumed(&event.id.to_string(), murmur).await? {
            continue;
        }
        match murmur.nostr_mls.parse_key_package(&event.content) {
            Ok(kp) if kp.last_resort() => {
                tracing::debug!(
                    target: "murmur::key_packages::fetch_key_package_for_pubkey",
                    "Found valid key package for user {:?}",
                    pubkey
                );
                return Ok(Some(MemberKeyPackage {
                    pubkey: pubkey.clone(),
                    event_id: event.id,
                    key_package: kp,
                }));
            }
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(
                    target: "murmur::key_packages::fetch_key_package_for_pubkey",
                    "Skipping unusable key package: {}",
                    e
                );
                continue;
            }
        }
    }

    tracing::debug!(
        target: "murmur::key_packages::fetch_key_package_for_pubkey",
        "No valid key package found for user {:?}",
        pubkey
    );
    Ok(None)
}

/// Generates a fresh key package for the active account and publishes it as
/// a kind 443 event to the account's key package relays. Retries up to
/// [`PUBLISH_ATTEMPTS`] times before surfacing the failure.
pub async fn publish_key_package(murmur: &Murmur) -> Result<EventId> {
    let account = Account::get_active(&murmur.database).await?;
    let keys = account.keys(&murmur.secrets)?;

    let key_package_hex = murmur.nostr_mls.build_key_package_hex(&account.pubkey)?;

    let mut relays = account
        .relays(RelayType::KeyPackage, &murmur.database)
        .await?;
    if relays.is_empty() {
        relays = murmur.nostr.relays().await;
    }

    let event = EventBuilder::new(Kind::MlsKeyPackage, key_package_hex)
        .tags(vec![
            Tag::custom(TagKind::Custom("mls_protocol_version".into()), ["1.0"]),
            Tag::custom(
                TagKind::Custom("ciphersuite".into()),
                [murmur.nostr_mls.ciphersuite_value().to_string()],
            ),
            Tag::custom(
                TagKind::Custom("extensions".into()),
                [murmur.nostr_mls.extensions_value()],
            ),
            Tag::custom(TagKind::Custom("client".into()), ["murmur"]),
            Tag::custom(TagKind::Custom("relays".into()), relays.clone()),
        ])
        .sign(&keys)
        .await?;

    let mut last_error = None;
    for attempt in 0..PUBLISH_ATTEMPTS {
        match murmur
            .nostr
            .publish_event_to(relays.clone(), event.clone())
            .await
        {
            Ok(output) => {
                let event_id = *output.id();
                sqlx::query(
                    "INSERT OR REPLACE INTO key_packages (event_id, account_pubkey, ciphersuite, created_at, consumed) VALUES (?, ?, ?, ?, 0)",
                )
                .bind(event_id.to_string())
                .bind(&account.pubkey)
                .bind(murmur.nostr_mls.ciphersuite_value() as i64)
                .bind(Timestamp::now().as_u64() as i64)
                .execute(&murmur.database.pool)
                .await?;

                // The init key's private material only exists in MLS
                // storage; snapshot so it survives a restart.
                murmur
                    .persist_mls_snapshot(&[], 0)
                    .await
                    .map_err(KeyPackageError::NostrMls)?;

                tracing::debug!(
                    target: "murmur::key_packages::publish_key_package",
                    "Key package event published: {}",
                    event_id
                );
                return Ok(event_id);
            }
            Err(e) => {
                tracing::warn!(
                    target: "murmur::key_packages::publish_key_package",
                    "Key package publish attempt {} failed: {}",
                    attempt + 1,
                    e
                );
                last_error = Some(e);
                if attempt + 1 < PUBLISH_ATTEMPTS {
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }
    Err(last_error
        .map(KeyPackageError::NostrManager)
        .unwrap_or_else(|| {
            KeyPackageError::NostrManager(NostrManagerError::PublishUnreachable)
        }))
}

/// Deletes a specific key package event from relays with a kind 5 deletion
/// request, optionally dropping its private material from MLS storage.
pub async fn delete_key_package_from_relays(
    murmur: &Murmur,
    event_id: &EventId,
    key_package_relays: &[String],
    delete_mls_stored_keys: bool,
) -> Result<()> {
    let account = Account::get_active(&murmur.database).await?;
    let current_pubkey = PublicKey::from_hex(&account.pubkey).map_err(AccountError::PublicKey)?;
    let key_package_events = murmur
        .nostr
        .client
        .fetch_events(
            vec![Filter::new()
                .id(*event_id)
                .kind(Kind::MlsKeyPackage)
                .author(current_pubkey)],
            murmur.nostr.timeout().await,
        )
        .await
        .map_err(NostrManagerError::Client)?;

    if let Some(event) = key_package_events.first() {
        if delete_mls_stored_keys {
            let key_package = murmur.nostr_mls.parse_key_package(&event.content)?;
            murmur
                .nostr_mls
                .delete_key_package_from_storage(&key_package)?;
        }
        let builder = EventBuilder::delete(vec![event.id]);
        let keys = account.keys(&murmur.secrets)?;
        let deletion = builder.sign(&keys).await?;
        murmur
            .nostr
            .publish_event_to(key_package_relays.to_vec(), deletion)
            .await?;
    }
    Ok(())
}

/// Revokes every outstanding key package authored by the active account:
/// one deletion request per event, to the key package relays.
pub async fn delete_key_packages(murmur: &Murmur) -> Result<()> {
    let account = Account::get_active(&murmur.database).await?;
    let pubkey = PublicKey::from_hex(&account.pubkey).map_err(AccountError::PublicKey)?;

    let mut relays = account
        .relays(RelayType::KeyPackage, &murmur.database)
        .await?;
    if relays.is_empty() {
        relays = murmur.nostr.relays().await;
    }

    let key_package_events = murmur.nostr.fetch_user_key_packages(pubkey).await?;
    if key_package_events.is_empty() {
        return Ok(());
    }

    let keys = account.keys(&murmur.secrets)?;
    let deletion = EventBuilder::delete(key_package_events.iter().map(|event| event.id))
        .sign(&keys)
        .await?;
    murmur.nostr.publish_event_to(relays, deletion).await?;

    sqlx::query("DELETE FROM key_packages WHERE account_pubkey = ?")
        .bind(&account.pubkey)
        .execute(&murmur.database.pool)
        .await?;

    tracing::debug!(
        target: "murmur::key_packages::delete_key_packages",
        "Revoked {} key packages",
        key_package_events.len()
    );
    Ok(())
}

/// Marks a key package consumed by a welcome. A second consumption attempt
/// for the same package fails.
pub async fn mark_consumed(
    account_pubkey: &str,
    event_id: &EventId,
    database: &crate::database::Database,
) -> Result<()> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT consumed FROM key_packages WHERE account_pubkey = ? AND event_id = ?",
    )
    .bind(account_pubkey)
    .bind(event_id.to_string())
    .fetch_optional(&database.pool)
    .await?;

    if let Some((consumed,)) = row {
        if consumed != 0 {
            return Err(KeyPackageError::AlreadyUsed);
        }
        sqlx::query(
            "UPDATE key_packages SET consumed = 1 WHERE account_pubkey = ? AND event_id = ?",
        )
        .bind(account_pubkey)
        .bind(event_id.to_string())
        .execute(&database.pool)
        .await?;
    } else {
        // The package predates this install; record it directly as consumed.
        sqlx::query(
            "INSERT INTO key_packages (event_id, account_pubkey, ciphersuite, created_at, consumed) VALUES (?, ?, 0, ?, 1)",
        )
        .bind(event_id.to_string())
        .bind(account_pubkey)
        .bind(Timestamp::now().as_u64() as i64)
        .execute(&database.pool)
        .await?;
    }
    Ok(())
}

async fn is_consumed(event_id: &str, murmur: &Murmur) -> Result<bool> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT consumed FROM key_packages WHERE event_id = ?")
            .bind(event_id)
            .fetch_optional(&murmur.database.pool)
            .await?;
    Ok(matches!(row, Some((consumed,)) if consumed != 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_mark_consumed_rejects_second_use() {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path()).await.unwrap();
        let event_id =
            EventId::parse("5c83da77af1dec6d7289834998ad7aafbd9e2191396d75ec3cc27f5a77226f36")
                .unwrap();

        sqlx::query(
            "INSERT INTO key_packages (event_id, account_pubkey, ciphersuite, created_at, consumed) VALUES (?, 'pk', 1, 0, 0)",
        )
        .bind(event_id.to_string())
        .execute(&db.pool)
        .await
        .unwrap();

        mark_consumed("pk", &event_id, &db).await.unwrap();
        assert!(matches!(
            mark_consumed("pk", &event_id, &db).await,
            Err(KeyPackageError::AlreadyUsed)
        ));
    }

    #[tokio::test]
    async fn test_mark_consumed_records_unknown_packages() {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path()).await.unwrap();
        let event_id =
            EventId::parse("7b1c3bd66a3e2a4c4c6c63e7ee0b6c25a33b723d4f7a83c366e0632b8e8e8e60")
                .unwrap();

        mark_consumed("pk", &event_id, &db).await.unwrap();
        assert!(matches!(
            mark_consumed("pk", &event_id, &db).await,
            Err(KeyPackageError::AlreadyUsed)
        ));
    }
}
