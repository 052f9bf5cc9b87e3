use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::database::{Database, DatabaseError};
use crate::relays::{RelayType, RelayError};
use crate::secrets_store::{SecretsStore, SecretsStoreError};

#[derive(Error, Debug)]
pub enum AccountError {
    #[error("Missing required pubkey")]
    MissingPubkey,

    #[error("Account not found")]
    AccountNotFound,

    #[error("No active account found")]
    NoActiveAccount,

    #[error("Invalid key")]
    InvalidKey,

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to parse public key: {0}")]
    PublicKey(#[from] nostr_sdk::key::Error),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Error with secrets store: {0}")]
    SecretsStore(#[from] SecretsStoreError),
}

pub type Result<T> = std::result::Result<T, AccountError>;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AccountSettings {
    pub dark_theme: bool,
    pub dev_mode: bool,
    pub lockdown_mode: bool,
}

impl Default for AccountSettings {
    fn default() -> Self {
        Self {
            dark_theme: true,
            dev_mode: false,
            lockdown_mode: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct AccountOnboarding {
    pub inbox_relays: bool,
    pub key_package_relays: bool,
    pub publish_key_package: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AccountRow {
    pub pubkey: String,
    pub metadata: String,
    pub settings: String,
    pub onboarding: String,
    pub last_used: i64,
    pub last_synced: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Account {
    pub pubkey: String,
    pub metadata: Metadata,
    pub settings: AccountSettings,
    pub onboarding: AccountOnboarding,
    pub last_used: Timestamp,
    pub last_synced: Timestamp,
}

impl TryFrom<AccountRow> for Account {
    type Error = AccountError;

    fn try_from(row: AccountRow) -> Result<Account> {
        Ok(Account {
            pubkey: row.pubkey,
            metadata: serde_json::from_str(&row.metadata)?,
            settings: serde_json::from_str(&row.settings)?,
            onboarding: serde_json::from_str(&row.onboarding)?,
            last_used: Timestamp::from(row.last_used as u64),
            last_synced: Timestamp::from(row.last_synced as u64),
        })
    }
}

impl Account {
    /// Generates a new keypair and saves a mostly blank account.
    pub async fn new(database: &Database, secrets: &SecretsStore) -> Result<Account> {
        let keys = Keys::generate();
        let account = Account {
            pubkey: keys.public_key().to_hex(),
            metadata: Metadata::default(),
            settings: AccountSettings::default(),
            onboarding: AccountOnboarding::default(),
            last_used: Timestamp::now(),
            last_synced: Timestamp::zero(),
        };
        account.save(database).await?;

        // If the record saves, add the keys to the secret store
        secrets.store_private_key(&keys)?;

        Ok(account)
    }

    /// Adds an account from an existing keypair. Metadata and relay lists are
    /// filled in later by the catch-up fetch once the identity is active.
    pub async fn add_from_keys(
        keys: &Keys,
        database: &Database,
        secrets: &SecretsStore,
    ) -> Result<Account> {
        let pubkey = keys.public_key();
        tracing::debug!(target: "murmur::accounts", "Adding account for pubkey: {}", pubkey.to_hex());

        let account = Account {
            pubkey: pubkey.to_hex(),
            metadata: Metadata::default(),
            settings: AccountSettings::default(),
            onboarding: AccountOnboarding::default(),
            last_used: Timestamp::now(),
            last_synced: Timestamp::zero(),
        };

        account.save(database).await?;
        secrets.store_private_key(keys)?;

        tracing::debug!(target: "murmur::accounts", "Account added from keys and secret saved");
        Ok(account)
    }

    /// Parses an nsec (bech32) or raw 32-byte hex secret key.
    pub fn keys_from_secret(nsec_or_hex: &str) -> Result<Keys> {
        Keys::parse(nsec_or_hex).map_err(|_| AccountError::InvalidKey)
    }

    pub async fn find_by_pubkey(pubkey: &str, database: &Database) -> Result<Account> {
        if pubkey.is_empty() {
            return Err(AccountError::MissingPubkey);
        }
        let row = sqlx::query_as::<_, AccountRow>("SELECT * FROM accounts WHERE pubkey = ?")
            .bind(pubkey)
            .fetch_optional(&database.pool)
            .await?
            .ok_or(AccountError::AccountNotFound)?;
        row.try_into()
    }

    /// Returns all accounts, sorted by pubkey.
    pub async fn all(database: &Database) -> Result<Vec<Account>> {
        let rows = sqlx::query_as::<_, AccountRow>("SELECT * FROM accounts ORDER BY pubkey ASC")
            .fetch_all(&database.pool)
            .await?;
        rows.into_iter().map(Account::try_from).collect()
    }

    pub async fn get_active_pubkey(database: &Database) -> Result<String> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT pubkey FROM active_account WHERE id = 1")
                .fetch_optional(&database.pool)
                .await?;
        row.map(|(pubkey,)| pubkey)
            .ok_or(AccountError::NoActiveAccount)
    }

    /// Returns the currently active account.
    pub async fn get_active(database: &Database) -> Result<Account> {
        let pubkey = Self::get_active_pubkey(database).await?;
        Self::find_by_pubkey(&pubkey, database)
            .await
            .map_err(|_| AccountError::NoActiveAccount)
    }

    /// Marks this account active and bumps its last-used timestamp. The caller
    /// is responsible for switching the Nostr identity and emitting signals.
    pub async fn set_active(&self, database: &Database) -> Result<Account> {
        let mut txn = database.pool.begin().await?;
        sqlx::query("INSERT OR REPLACE INTO active_account (id, pubkey) VALUES (1, ?)")
            .bind(&self.pubkey)
            .execute(&mut *txn)
            .await?;
        sqlx::query("UPDATE accounts SET last_used = ? WHERE pubkey = ?")
            .bind(Timestamp::now().as_u64() as i64)
            .bind(&self.pubkey)
            .execute(&mut *txn)
            .await?;
        txn.commit().await?;
        Ok(self.clone())
    }

    /// Returns the relay URLs of the given type stored for this account.
    pub async fn relays(&self, relay_type: RelayType, database: &Database) -> Result<Vec<String>> {
        Ok(crate::relays::Relay::urls_for_account(&self.pubkey, relay_type, database).await?)
    }

    /// Returns the Nostr group ids of all groups this account has joined.
    pub async fn nostr_group_ids(&self, database: &Database) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT nostr_group_id FROM groups WHERE account_pubkey = ?")
                .bind(&self.pubkey)
                .fetch_all(&database.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub fn keys(&self, secrets: &SecretsStore) -> Result<Keys> {
        Ok(secrets.get_nostr_keys_for_pubkey(self.pubkey.as_str())?)
    }

    /// Saves the account.
    pub async fn save(&self, database: &Database) -> Result<Account> {
        if self.pubkey.is_empty() {
            return Err(AccountError::MissingPubkey);
        }

        let mut txn = database.pool.begin().await?;
        sqlx::query(
            "INSERT OR REPLACE INTO accounts (pubkey, metadata, settings, onboarding, last_used, last_synced) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.pubkey)
        .bind(serde_json::to_string(&self.metadata)?)
        .bind(serde_json::to_string(&self.settings)?)
        .bind(serde_json::to_string(&self.onboarding)?)
        .bind(self.last_used.as_u64() as i64)
        .bind(self.last_synced.as_u64() as i64)
        .execute(&mut *txn)
        .await?;
        txn.commit().await?;

        Ok(self.clone())
    }

    pub async fn update_onboarding(
        pubkey: &str,
        inbox_relays: bool,
        key_package_relays: bool,
        publish_key_package: bool,
        database: &Database,
    ) -> Result<()> {
        let mut account = Self::find_by_pubkey(pubkey, database).await?;
        account.onboarding.inbox_relays = inbox_relays;
        account.onboarding.key_package_relays = key_package_relays;
        account.onboarding.publish_key_package = publish_key_package;
        account.save(database).await?;
        Ok(())
    }

    pub async fn update_last_synced(pubkey: &str, database: &Database) -> Result<()> {
        sqlx::query("UPDATE accounts SET last_synced = ? WHERE pubkey = ?")
            .bind(Timestamp::now().as_u64() as i64)
            .bind(pubkey)
            .execute(&database.pool)
            .await?;
        Ok(())
    }

    /// Removes the account record and all derived state in one transaction,
    /// then deletes its private key. Returns the next active pubkey, if any.
    pub async fn remove(
        &self,
        database: &Database,
        secrets: &SecretsStore,
    ) -> Result<Option<String>> {
        let mut txn = database.pool.begin().await?;

        for table in [
            "relays",
            "key_packages",
            "groups",
            "mls_epoch_state",
            "messages",
            "processed_messages",
            "invites",
            "processed_invites",
            "seen_events",
        ] {
            sqlx::query(&format!("DELETE FROM {} WHERE account_pubkey = ?", table))
                .bind(&self.pubkey)
                .execute(&mut *txn)
                .await?;
        }
        sqlx::query("DELETE FROM accounts WHERE pubkey = ?")
            .bind(&self.pubkey)
            .execute(&mut *txn)
            .await?;

        // Promote the first remaining account (if any) to active
        let next: Option<(String,)> =
            sqlx::query_as("SELECT pubkey FROM accounts ORDER BY pubkey ASC LIMIT 1")
                .fetch_optional(&mut *txn)
                .await?;
        match &next {
            Some((pubkey,)) => {
                sqlx::query("INSERT OR REPLACE INTO active_account (id, pubkey) VALUES (1, ?)")
                    .bind(pubkey)
                    .execute(&mut *txn)
                    .await?;
            }
            None => {
                sqlx::query("DELETE FROM active_account WHERE id = 1")
                    .execute(&mut *txn)
                    .await?;
            }
        }
        txn.commit().await?;

        // If the database update succeeded, continue with the other steps
        secrets.remove_private_key_for_pubkey(&self.pubkey)?;
        let _ = secrets.remove_nostr_wallet_connect_uri(&self.pubkey);

        Ok(next.map(|(pubkey,)| pubkey))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn setup() -> (Database, SecretsStore) {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path()).await.unwrap();
        let secrets = SecretsStore::new(dir.path());
        secrets.unlock().unwrap();
        std::mem::forget(dir);
        (db, secrets)
    }

    #[tokio::test]
    async fn test_create_and_activate_account() {
        let (db, secrets) = setup().await;
        let account = Account::new(&db, &secrets).await.unwrap();

        account.set_active(&db).await.unwrap();
        let active = Account::get_active(&db).await.unwrap();
        assert_eq!(active.pubkey, account.pubkey);

        // Keys round-trip through the secrets store
        let keys = active.keys(&secrets).unwrap();
        assert_eq!(keys.public_key().to_hex(), account.pubkey);
    }

    #[tokio::test]
    async fn test_keys_from_secret_accepts_nsec_and_hex() {
        let keys = Keys::generate();
        let hex = keys.secret_key().to_secret_hex();
        let parsed = Account::keys_from_secret(&hex).unwrap();
        assert_eq!(parsed.public_key(), keys.public_key());

        let nsec = keys.secret_key().to_bech32().unwrap();
        let parsed = Account::keys_from_secret(&nsec).unwrap();
        assert_eq!(parsed.public_key(), keys.public_key());

        assert!(matches!(
            Account::keys_from_secret("garbage"),
            Err(AccountError::InvalidKey)
        ));
    }

    #[tokio::test]
    async fn test_accounts_sorted_by_pubkey() {
        let (db, secrets) = setup().await;
        Account::new(&db, &secrets).await.unwrap();
        Account::new(&db, &secrets).await.unwrap();
        Account::new(&db, &secrets).await.unwrap();

        let accounts = Account::all(&db).await.unwrap();
        let pubkeys: Vec<String> = accounts.iter().map(|a| a.pubkey.clone()).collect();
        let mut sorted = pubkeys.clone();
        sorted.sort();
        assert_eq!(pubkeys.len(), 3);
        assert_eq!(pubkeys, sorted);
    }

    #[tokio::test]
    async fn test_remove_account_promotes_next_and_clears_state() {
        let (db, secrets) = setup().await;
        let first = Account::new(&db, &secrets).await.unwrap();
        let second = Account::new(&db, &secrets).await.unwrap();
        first.set_active(&db).await.unwrap();

        let next = first.remove(&db, &secrets).await.unwrap();
        assert!(next.is_some());

        let active = Account::get_active(&db).await.unwrap();
        assert_ne!(active.pubkey, first.pubkey);

        // Removed account's keys are gone from the secrets store
        assert!(secrets.get_nostr_keys_for_pubkey(&first.pubkey).is_err());
        assert!(secrets.get_nostr_keys_for_pubkey(&second.pubkey).is_ok());

        // Removing the last account clears the active slot
        let last = Account::get_active(&db).await.unwrap();
        let next = last.remove(&db, &secrets).await.unwrap();
        assert!(next.is_none());
        assert!(matches!(
            Account::get_active(&db).await,
            Err(AccountError::NoActiveAccount)
        ));
    }

    #[tokio::test]
    async fn test_update_onboarding() {
        let (db, secrets) = setup().await;
        let account = Account::new(&db, &secrets).await.unwrap();

        Account::update_onboarding(&account.pubkey, true, true, false, &db)
            .await
            .unwrap();
        let reloaded = Account::find_by_pubkey(&account.pubkey, &db).await.unwrap();
        assert!(reloaded.onboarding.inbox_relays);
        assert!(reloaded.onboarding.key_package_relays);
        assert!(!reloaded.onboarding.publish_key_package);
    }
}
