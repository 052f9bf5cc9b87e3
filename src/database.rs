use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

const DB_NAME: &str = "murmur.sqlite";

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Failed to create data directory: {0}")]
    DataDir(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DatabaseError>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    pubkey TEXT PRIMARY KEY,
    metadata TEXT NOT NULL,
    settings TEXT NOT NULL,
    onboarding TEXT NOT NULL,
    last_used INTEGER NOT NULL,
    last_synced INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS active_account (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    pubkey TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS relays (
    url TEXT NOT NULL,
    relay_type TEXT NOT NULL,
    account_pubkey TEXT NOT NULL,
    group_id BLOB,
    relay_meta TEXT,
    PRIMARY KEY (url, relay_type, account_pubkey)
);

CREATE TABLE IF NOT EXISTS key_packages (
    event_id TEXT NOT NULL,
    account_pubkey TEXT NOT NULL,
    ciphersuite INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    consumed INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (account_pubkey, event_id)
);

CREATE TABLE IF NOT EXISTS groups (
    account_pubkey TEXT NOT NULL,
    mls_group_id BLOB NOT NULL,
    nostr_group_id TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    admin_pubkeys TEXT NOT NULL,
    last_message_id TEXT,
    last_message_at INTEGER,
    group_type TEXT NOT NULL,
    epoch INTEGER NOT NULL,
    state TEXT NOT NULL,
    PRIMARY KEY (account_pubkey, mls_group_id)
);

CREATE TABLE IF NOT EXISTS mls_epoch_state (
    account_pubkey TEXT NOT NULL,
    mls_group_id BLOB NOT NULL,
    epoch INTEGER NOT NULL,
    state BLOB NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (account_pubkey, mls_group_id, epoch)
);

CREATE TABLE IF NOT EXISTS messages (
    event_id TEXT NOT NULL,
    account_pubkey TEXT NOT NULL,
    author_pubkey TEXT NOT NULL,
    mls_group_id BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    content TEXT NOT NULL,
    tags TEXT NOT NULL,
    event TEXT NOT NULL,
    outer_event_id TEXT NOT NULL,
    PRIMARY KEY (account_pubkey, event_id)
);

CREATE INDEX IF NOT EXISTS idx_messages_group
    ON messages (account_pubkey, mls_group_id, created_at);

CREATE TABLE IF NOT EXISTS processed_messages (
    event_id TEXT NOT NULL,
    message_event_id TEXT,
    account_pubkey TEXT NOT NULL,
    processed_at INTEGER NOT NULL,
    state TEXT NOT NULL,
    failure_reason TEXT NOT NULL,
    PRIMARY KEY (account_pubkey, event_id)
);

CREATE TABLE IF NOT EXISTS invites (
    event_id TEXT NOT NULL,
    account_pubkey TEXT NOT NULL,
    event TEXT NOT NULL,
    mls_group_id BLOB NOT NULL,
    nostr_group_id TEXT NOT NULL,
    group_name TEXT NOT NULL,
    group_description TEXT NOT NULL,
    group_admin_pubkeys TEXT NOT NULL,
    group_relays TEXT NOT NULL,
    inviter TEXT NOT NULL,
    member_count INTEGER NOT NULL,
    outer_event_id TEXT NOT NULL,
    state TEXT NOT NULL,
    PRIMARY KEY (account_pubkey, event_id)
);

CREATE TABLE IF NOT EXISTS processed_invites (
    event_id TEXT NOT NULL,
    invite_event_id TEXT NOT NULL,
    account_pubkey TEXT NOT NULL,
    processed_at INTEGER NOT NULL,
    state TEXT NOT NULL,
    failure_reason TEXT NOT NULL,
    PRIMARY KEY (account_pubkey, event_id)
);

CREATE TABLE IF NOT EXISTS seen_events (
    account_pubkey TEXT NOT NULL,
    event_id TEXT NOT NULL,
    seen_at INTEGER NOT NULL,
    PRIMARY KEY (account_pubkey, event_id)
);
"#;

/// Number of rows retained in the persistent seen-events set per account.
pub const SEEN_EVENTS_CAP: i64 = 16_384;

#[derive(Debug, Clone)]
pub struct Database {
    pub pool: SqlitePool,
    path: PathBuf,
}

impl Database {
    /// Opens (or creates) the SQLite database under the given data directory
    /// and applies the schema.
    pub async fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(DB_NAME);
        tracing::debug!(target: "murmur::database::new", "Opening database at: {:?}", path);

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        Ok(Self { pool, path })
    }

    /// Trims the persistent seen-events set for an account down to
    /// [`SEEN_EVENTS_CAP`], oldest rows first.
    pub async fn trim_seen_events(&self, account_pubkey: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM seen_events WHERE account_pubkey = ? AND event_id NOT IN (
                SELECT event_id FROM seen_events WHERE account_pubkey = ?
                ORDER BY seen_at DESC LIMIT ?
            )",
        )
        .bind(account_pubkey)
        .bind(account_pubkey)
        .bind(SEEN_EVENTS_CAP)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Deletes all rows from every table. Used by the `delete_data` command.
    pub async fn delete_data(&self) -> Result<()> {
        let start = Instant::now();
        tracing::debug!(target: "murmur::database::delete_data", "Deleting all data");
        let mut txn = self.pool.begin().await?;
        for table in [
            "accounts",
            "active_account",
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
            sqlx::query(&format!("DELETE FROM {}", table))
                .execute(&mut *txn)
                .await?;
        }
        txn.commit().await?;
        tracing::debug!(
            target: "murmur::database::delete_data",
            "Database cleared in {:#?}",
            start.elapsed()
        );
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    pub(crate) async fn setup_test_db() -> Database {
        let temp_dir = tempdir().expect("Couldn't create temp dir");
        let db = Database::new(temp_dir.path())
            .await
            .expect("Couldn't create database for test");
        // Keep the tempdir alive for the duration of the pool.
        std::mem::forget(temp_dir);
        db
    }

    #[tokio::test]
    async fn test_schema_applies_and_wipes() {
        let db = setup_test_db().await;

        sqlx::query("INSERT INTO seen_events (account_pubkey, event_id, seen_at) VALUES (?, ?, ?)")
            .bind("pk")
            .bind("ev")
            .bind(1i64)
            .execute(&db.pool)
            .await
            .expect("Failed to insert");

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM seen_events")
            .fetch_one(&db.pool)
            .await
            .expect("Failed to count");
        assert_eq!(count.0, 1);

        db.delete_data().await.expect("Failed to delete data");

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM seen_events")
            .fetch_one(&db.pool)
            .await
            .expect("Failed to count");
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn test_trim_seen_events_keeps_newest() {
        let db = setup_test_db().await;
        for i in 0..10 {
            sqlx::query(
                "INSERT INTO seen_events (account_pubkey, event_id, seen_at) VALUES (?, ?, ?)",
            )
            .bind("pk")
            .bind(format!("ev{}", i))
            .bind(i as i64)
            .execute(&db.pool)
            .await
            .unwrap();
        }
        // The cap is far above 10, so nothing should be trimmed.
        db.trim_seen_events("pk").await.unwrap();
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM seen_events")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count.0, 10);
    }
}
