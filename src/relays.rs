use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::database::Database;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// A row in the relays table
#[derive(Serialize, Deserialize, Debug, Clone, sqlx::FromRow)]
pub struct RelayRow {
    pub url: String,
    pub relay_type: String,
    pub account_pubkey: String,
    pub group_id: Option<Vec<u8>>,
    pub relay_meta: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Relay {
    pub url: String,
    pub relay_type: RelayType,
    pub account_pubkey: String,
    pub group_id: Option<Vec<u8>>,
    pub relay_meta: RelayMeta,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Copy)]
pub enum RelayType {
    Nostr,
    Inbox,
    KeyPackage,
    Group,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Copy)]
pub enum RelayMeta {
    Read,
    Write,
    ReadWrite,
}

impl RelayType {
    /// The replaceable relay-list kind that carries this relay set.
    pub fn kind(&self) -> Option<Kind> {
        match self {
            RelayType::Nostr => Some(Kind::RelayList),
            RelayType::Inbox => Some(Kind::InboxRelays),
            RelayType::KeyPackage => Some(Kind::MlsKeyPackageRelays),
            RelayType::Group => None,
        }
    }

    pub fn from_kind(kind: Kind) -> Option<Self> {
        match kind {
            Kind::RelayList => Some(RelayType::Nostr),
            Kind::InboxRelays => Some(RelayType::Inbox),
            Kind::MlsKeyPackageRelays => Some(RelayType::KeyPackage),
            _ => None,
        }
    }
}

impl From<String> for RelayType {
    fn from(s: String) -> Self {
        match s.to_lowercase().as_str() {
            "nostr" => RelayType::Nostr,
            "inbox" => RelayType::Inbox,
            "key_package" => RelayType::KeyPackage,
            "group" => RelayType::Group,
            _ => panic!("Invalid relay type: {}", s),
        }
    }
}

impl From<RelayType> for String {
    fn from(relay_type: RelayType) -> Self {
        match relay_type {
            RelayType::Nostr => "nostr".to_string(),
            RelayType::Inbox => "inbox".to_string(),
            RelayType::KeyPackage => "key_package".to_string(),
            RelayType::Group => "group".to_string(),
        }
    }
}

impl From<String> for RelayMeta {
    fn from(s: String) -> Self {
        match s.as_str() {
            "read" => RelayMeta::Read,
            "write" => RelayMeta::Write,
            "read-write" => RelayMeta::ReadWrite,
            _ => panic!("Invalid relay metadata: {}", s),
        }
    }
}

impl From<RelayMeta> for String {
    fn from(relay_meta: RelayMeta) -> Self {
        match relay_meta {
            RelayMeta::Read => "read".to_string(),
            RelayMeta::Write => "write".to_string(),
            RelayMeta::ReadWrite => "read-write".to_string(),
        }
    }
}

impl From<Option<String>> for RelayMeta {
    fn from(s: Option<String>) -> Self {
        s.map(|s| s.into()).unwrap_or(RelayMeta::ReadWrite)
    }
}

impl RelayMeta {
    pub fn to_relay_metadata(&self) -> Option<RelayMetadata> {
        match self {
            RelayMeta::Read => Some(RelayMetadata::Read),
            RelayMeta::Write => Some(RelayMetadata::Write),
            RelayMeta::ReadWrite => None,
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(self, RelayMeta::Read | RelayMeta::ReadWrite)
    }

    pub fn is_write(&self) -> bool {
        matches!(self, RelayMeta::Write | RelayMeta::ReadWrite)
    }
}

impl From<RelayRow> for Relay {
    fn from(row: RelayRow) -> Self {
        Relay {
            url: row.url,
            relay_type: RelayType::from(row.relay_type),
            account_pubkey: row.account_pubkey,
            group_id: row.group_id,
            relay_meta: RelayMeta::from(row.relay_meta),
        }
    }
}

impl Relay {
    /// Returns the relays (with read/write policy) of the given type for an
    /// account.
    pub async fn for_account(
        account_pubkey: &str,
        relay_type: RelayType,
        database: &Database,
    ) -> Result<Vec<Relay>> {
        let rows = sqlx::query_as::<_, RelayRow>(
            "SELECT * FROM relays WHERE account_pubkey = ? AND relay_type = ?",
        )
        .bind(account_pubkey)
        .bind(String::from(relay_type))
        .fetch_all(&database.pool)
        .await?;
        Ok(rows.into_iter().map(Relay::from).collect())
    }

    /// Returns the relay URLs of the given type for an account.
    pub async fn urls_for_account(
        account_pubkey: &str,
        relay_type: RelayType,
        database: &Database,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query_as::<_, RelayRow>(
            "SELECT * FROM relays WHERE account_pubkey = ? AND relay_type = ?",
        )
        .bind(account_pubkey)
        .bind(String::from(relay_type))
        .fetch_all(&database.pool)
        .await?;
        Ok(rows.into_iter().map(|row| row.url).collect())
    }

    /// Returns the relay URLs used by a specific group.
    pub async fn urls_for_group(
        account_pubkey: &str,
        mls_group_id: &[u8],
        database: &Database,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query_as::<_, RelayRow>(
            "SELECT * FROM relays WHERE account_pubkey = ? AND relay_type = 'group' AND group_id = ?",
        )
        .bind(account_pubkey)
        .bind(mls_group_id)
        .fetch_all(&database.pool)
        .await?;
        Ok(rows.into_iter().map(|row| row.url).collect())
    }

    /// Replaces the stored relay set of one type for an account in a single
    /// transaction.
    pub async fn replace_for_account(
        account_pubkey: &str,
        relay_type: RelayType,
        relays: &[(String, RelayMeta)],
        database: &Database,
    ) -> Result<()> {
        for (url, _) in relays {
            if !crate::utils::is_valid_relay_url(url) {
                return Err(RelayError::InvalidUrl(url.clone()));
            }
        }

        let mut txn = database.pool.begin().await?;
        sqlx::query("DELETE FROM relays WHERE account_pubkey = ? AND relay_type = ?")
            .bind(account_pubkey)
            .bind(String::from(relay_type))
            .execute(&mut *txn)
            .await?;
        for (url, meta) in relays {
            sqlx::query(
                "INSERT OR REPLACE INTO relays (url, relay_type, account_pubkey, group_id, relay_meta) VALUES (?, ?, ?, NULL, ?)",
            )
            .bind(url)
            .bind(String::from(relay_type))
            .bind(account_pubkey)
            .bind(String::from(*meta))
            .execute(&mut *txn)
            .await?;
        }
        txn.commit().await?;
        Ok(())
    }

    /// Stores the relay set a group uses for its MLS traffic.
    pub async fn replace_for_group(
        account_pubkey: &str,
        mls_group_id: &[u8],
        urls: &[String],
        database: &Database,
    ) -> Result<()> {
        let mut txn = database.pool.begin().await?;
        sqlx::query(
            "DELETE FROM relays WHERE account_pubkey = ? AND relay_type = 'group' AND group_id = ?",
        )
        .bind(account_pubkey)
        .bind(mls_group_id)
        .execute(&mut *txn)
        .await?;
        for url in urls {
            sqlx::query(
                "INSERT OR REPLACE INTO relays (url, relay_type, account_pubkey, group_id, relay_meta) VALUES (?, 'group', ?, ?, 'read-write')",
            )
            .bind(url)
            .bind(account_pubkey)
            .bind(mls_group_id)
            .execute(&mut *txn)
            .await?;
        }
        txn.commit().await?;
        Ok(())
    }

    /// Extracts `(url, meta)` pairs from the `r` tags of a relay-list event.
    pub fn parse_relay_list_event(event: &Event) -> Vec<(String, RelayMeta)> {
        event
            .tags
            .iter()
            .filter(|tag| {
                tag.kind() == TagKind::SingleLetter(SingleLetterTag::lowercase(Alphabet::R))
                    || tag.kind() == TagKind::Relay
            })
            .filter_map(|tag| {
                let parts = tag.clone().to_vec();
                let url = parts.get(1)?.clone();
                if !crate::utils::is_valid_relay_url(&url) {
                    return None;
                }
                let meta = match parts.get(2).map(|s| s.as_str()) {
                    Some("read") => RelayMeta::Read,
                    Some("write") => RelayMeta::Write,
                    _ => RelayMeta::ReadWrite,
                };
                Some((url, meta))
            })
            .collect()
    }

    /// Builds the `r` tags for a relay-list publish (10002/10050/10051).
    pub fn relay_list_tags(relays: &[(String, RelayMeta)]) -> Vec<Tag> {
        relays
            .iter()
            .map(|(url, meta)| {
                let mut values = vec![url.clone()];
                if let Some(mode) = Option::<String>::from(*meta) {
                    values.push(mode);
                }
                Tag::custom(
                    TagKind::SingleLetter(SingleLetterTag::lowercase(Alphabet::R)),
                    values,
                )
            })
            .collect()
    }
}

impl From<RelayMeta> for Option<String> {
    fn from(relay_meta: RelayMeta) -> Self {
        match relay_meta {
            RelayMeta::Read => Some("read".to_string()),
            RelayMeta::Write => Some("write".to_string()),
            RelayMeta::ReadWrite => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use tempfile::tempdir;

    async fn setup_db() -> Database {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path()).await.unwrap();
        std::mem::forget(dir);
        db
    }

    #[tokio::test]
    async fn test_replace_and_fetch_account_relays() {
        let db = setup_db().await;
        let pubkey = "aa4fc8665f5696e33db7e1a572e3b0f5b3d615837b0f362dcb1c8068b098c7b4";

        Relay::replace_for_account(
            pubkey,
            RelayType::Inbox,
            &[
                ("wss://relay.damus.io".to_string(), RelayMeta::ReadWrite),
                ("wss://nos.lol".to_string(), RelayMeta::Read),
            ],
            &db,
        )
        .await
        .unwrap();

        let mut urls = Relay::urls_for_account(pubkey, RelayType::Inbox, &db)
            .await
            .unwrap();
        urls.sort();
        assert_eq!(urls, vec!["wss://nos.lol", "wss://relay.damus.io"]);

        // Replacing swaps the whole set
        Relay::replace_for_account(
            pubkey,
            RelayType::Inbox,
            &[("wss://purplepag.es".to_string(), RelayMeta::ReadWrite)],
            &db,
        )
        .await
        .unwrap();
        let urls = Relay::urls_for_account(pubkey, RelayType::Inbox, &db)
            .await
            .unwrap();
        assert_eq!(urls, vec!["wss://purplepag.es"]);
    }

    #[tokio::test]
    async fn test_replace_rejects_non_websocket_urls() {
        let db = setup_db().await;
        let result = Relay::replace_for_account(
            "pk",
            RelayType::Nostr,
            &[("https://example.com".to_string(), RelayMeta::ReadWrite)],
            &db,
        )
        .await;
        assert!(matches!(result, Err(RelayError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_group_relays_round_trip() {
        let db = setup_db().await;
        let group_id = vec![1u8, 2, 3];
        Relay::replace_for_group("pk", &group_id, &["wss://relay.damus.io".to_string()], &db)
            .await
            .unwrap();
        let urls = Relay::urls_for_group("pk", &group_id, &db).await.unwrap();
        assert_eq!(urls, vec!["wss://relay.damus.io"]);
    }

    #[test]
    fn test_relay_meta_policy() {
        assert!(RelayMeta::ReadWrite.is_read());
        assert!(RelayMeta::ReadWrite.is_write());
        assert!(RelayMeta::Read.is_read());
        assert!(!RelayMeta::Read.is_write());
        assert!(!RelayMeta::Write.is_read());
    }

    #[test]
    fn test_relay_list_tags_include_mode() {
        let tags = Relay::relay_list_tags(&[
            ("wss://a.example".to_string(), RelayMeta::Read),
            ("wss://b.example".to_string(), RelayMeta::ReadWrite),
        ]);
        assert_eq!(tags.len(), 2);
        let first = tags[0].clone().to_vec();
        assert_eq!(first, vec!["r", "wss://a.example", "read"]);
        let second = tags[1].clone().to_vec();
        assert_eq!(second, vec!["r", "wss://b.example"]);
    }
}
