use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::accounts::AccountError;
use crate::database::Database;

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Event error: {0}")]
    Event(#[from] nostr_sdk::event::unsigned::Error),

    #[error("Account error: {0}")]
    Account(#[from] AccountError),

    #[error("Message not found")]
    NotFound,
}

pub type Result<T> = std::result::Result<T, MessageError>;

/// Id used for the optimistic local entry inserted before the relay
/// acknowledges the real event.
pub const TEMP_EVENT_ID: &str = "temp";

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct MessageRow {
    pub event_id: String,
    pub account_pubkey: String,
    pub author_pubkey: String,
    pub mls_group_id: Vec<u8>,
    pub created_at: i64,
    pub content: String,
    pub tags: String,  // JSON string for Tags
    pub event: String, // JSON string for UnsignedEvent
    pub outer_event_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Message {
    pub event_id: String,
    pub account_pubkey: PublicKey,
    pub author_pubkey: PublicKey,
    pub mls_group_id: Vec<u8>,
    pub created_at: Timestamp,
    pub content: String,
    pub event: UnsignedEvent,
    pub outer_event_id: String,
}

impl TryFrom<MessageRow> for Message {
    type Error = MessageError;

    fn try_from(row: MessageRow) -> Result<Message> {
        Ok(Message {
            event_id: row.event_id,
            account_pubkey: PublicKey::from_hex(&row.account_pubkey)
                .map_err(AccountError::PublicKey)?,
            author_pubkey: PublicKey::from_hex(&row.author_pubkey)
                .map_err(AccountError::PublicKey)?,
            mls_group_id: row.mls_group_id,
            created_at: Timestamp::from(row.created_at as u64),
            content: row.content,
            event: UnsignedEvent::from_json(&row.event)?,
            outer_event_id: row.outer_event_id,
        })
    }
}

impl Message {
    /// Inserts a transcript row for a processed inner event and updates the
    /// group's last-message pointers in the same transaction.
    pub async fn save(
        account_pubkey: &str,
        mls_group_id: &[u8],
        outer_event_id: &str,
        event: &UnsignedEvent,
        database: &Database,
    ) -> Result<()> {
        let event_id = event
            .id
            .map(|id| id.to_string())
            .unwrap_or_else(|| TEMP_EVENT_ID.to_string());

        let mut txn = database.pool.begin().await?;
        sqlx::query(
            "INSERT OR REPLACE INTO messages (event_id, account_pubkey, author_pubkey, mls_group_id, created_at, content, tags, event, outer_event_id) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event_id)
        .bind(account_pubkey)
        .bind(event.pubkey.to_hex())
        .bind(mls_group_id)
        .bind(event.created_at.as_u64() as i64)
        .bind(&event.content)
        .bind(serde_json::to_string(&event.tags)?)
        .bind(serde_json::to_string(event)?)
        .bind(outer_event_id)
        .execute(&mut *txn)
        .await?;

        sqlx::query(
            "UPDATE groups SET last_message_id = ?, last_message_at = ? WHERE account_pubkey = ? AND mls_group_id = ? AND (last_message_at IS NULL OR last_message_at <= ?)",
        )
        .bind(&event_id)
        .bind(event.created_at.as_u64() as i64)
        .bind(account_pubkey)
        .bind(mls_group_id)
        .bind(event.created_at.as_u64() as i64)
        .execute(&mut *txn)
        .await?;
        txn.commit().await?;
        Ok(())
    }

    /// Inserts the optimistic `"temp"` row for a message we are about to
    /// publish. Replaced by [`Message::replace_temp`] on acknowledgement.
    pub async fn save_temp(
        account_pubkey: &str,
        mls_group_id: &[u8],
        event: &UnsignedEvent,
        database: &Database,
    ) -> Result<()> {
        let mut stripped = event.clone();
        stripped.id = None;
        Self::save(account_pubkey, mls_group_id, "", &stripped, database).await
    }

    /// Drops the optimistic row without a replacement. Used when a send is
    /// cancelled before anything reached the mesh.
    pub async fn delete_temp(account_pubkey: &str, database: &Database) -> Result<()> {
        sqlx::query("DELETE FROM messages WHERE account_pubkey = ? AND event_id = ?")
            .bind(account_pubkey)
            .bind(TEMP_EVENT_ID)
            .execute(&database.pool)
            .await?;
        Ok(())
    }

    /// Replaces the temp row with the acknowledged event, keyed by its
    /// eventual id. The acknowledged created_at wins.
    pub async fn replace_temp(
        account_pubkey: &str,
        mls_group_id: &[u8],
        outer_event_id: &str,
        event: &UnsignedEvent,
        database: &Database,
    ) -> Result<()> {
        let mut txn = database.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE account_pubkey = ? AND event_id = ?")
            .bind(account_pubkey)
            .bind(TEMP_EVENT_ID)
            .execute(&mut *txn)
            .await?;
        txn.commit().await?;
        Self::save(account_pubkey, mls_group_id, outer_event_id, event, database).await
    }

    /// All messages for a group in ascending (created_at, event_id) order,
    /// bounded by optional timestamps.
    pub async fn for_group(
        account_pubkey: &str,
        mls_group_id: &[u8],
        start_time: Option<u64>,
        end_time: Option<u64>,
        database: &Database,
    ) -> Result<Vec<UnsignedEvent>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages WHERE account_pubkey = ? AND mls_group_id = ? AND created_at >= ? AND created_at <= ? ORDER BY created_at ASC, event_id ASC",
        )
        .bind(account_pubkey)
        .bind(mls_group_id)
        .bind(start_time.unwrap_or(0) as i64)
        .bind(end_time.map(|t| t as i64).unwrap_or(i64::MAX))
        .fetch_all(&database.pool)
        .await?;

        rows.into_iter()
            .map(|row| UnsignedEvent::from_json(&row.event).map_err(MessageError::from))
            .collect()
    }

    /// Finds a single message row by inner event id, deleted or not.
    pub async fn find_by_event_id(
        account_pubkey: &str,
        event_id: &str,
        database: &Database,
    ) -> Result<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages WHERE account_pubkey = ? AND event_id = ?",
        )
        .bind(account_pubkey)
        .bind(event_id)
        .fetch_optional(&database.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(row.try_into()?)),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum ProcessedMessageState {
    Processed,
    Failed,
}

impl From<String> for ProcessedMessageState {
    fn from(s: String) -> Self {
        match s.to_lowercase().as_str() {
            "processed" => ProcessedMessageState::Processed,
            "failed" => ProcessedMessageState::Failed,
            _ => panic!("Invalid processed message state: {}", s),
        }
    }
}

impl From<ProcessedMessageState> for String {
    fn from(state: ProcessedMessageState) -> Self {
        match state {
            ProcessedMessageState::Processed => "processed".to_string(),
            ProcessedMessageState::Failed => "failed".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct ProcessedMessageRow {
    pub event_id: String,
    pub message_event_id: Option<String>,
    pub account_pubkey: String,
    pub processed_at: i64,
    pub state: String,
    pub failure_reason: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProcessedMessage {
    pub event_id: String,
    pub message_event_id: Option<String>,
    pub account_pubkey: String,
    pub processed_at: u64,
    pub state: ProcessedMessageState,
    pub failure_reason: String,
}

impl From<ProcessedMessageRow> for ProcessedMessage {
    fn from(row: ProcessedMessageRow) -> Self {
        ProcessedMessage {
            event_id: row.event_id,
            message_event_id: row.message_event_id,
            account_pubkey: row.account_pubkey,
            processed_at: row.processed_at as u64,
            state: ProcessedMessageState::from(row.state),
            failure_reason: row.failure_reason,
        }
    }
}

impl ProcessedMessage {
    /// Looks up the ledger row for an outer wrapper event id.
    pub async fn find_by_event_id(
        account_pubkey: &str,
        event_id: &str,
        database: &Database,
    ) -> Result<Option<ProcessedMessage>> {
        let row = sqlx::query_as::<_, ProcessedMessageRow>(
            "SELECT * FROM processed_messages WHERE event_id = ? AND account_pubkey = ?",
        )
        .bind(event_id)
        .bind(account_pubkey)
        .fetch_optional(&database.pool)
        .await?;
        Ok(row.map(|row| row.into()))
    }

    /// Writes the terminal outcome for one processed wrapper event.
    pub async fn create_with_state_and_reason(
        account_pubkey: &str,
        event_id: &str,
        message_event_id: Option<String>,
        state: ProcessedMessageState,
        reason: String,
        database: &Database,
    ) -> Result<ProcessedMessage> {
        let processed_at = chrono::Utc::now().timestamp() as u64;
        let mut txn = database.pool.begin().await?;
        sqlx::query(
            "INSERT OR REPLACE INTO processed_messages (event_id, message_event_id, account_pubkey, processed_at, state, failure_reason) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(event_id)
        .bind(&message_event_id)
        .bind(account_pubkey)
        .bind(processed_at as i64)
        .bind(String::from(state.clone()))
        .bind(reason.clone())
        .execute(&mut *txn)
        .await?;
        txn.commit().await?;

        Ok(ProcessedMessage {
            event_id: event_id.to_string(),
            message_event_id,
            account_pubkey: account_pubkey.to_string(),
            processed_at,
            state,
            failure_reason: reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn setup_db() -> Database {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path()).await.unwrap();
        std::mem::forget(dir);
        db
    }

    fn unsigned(keys: &Keys, content: &str, created_at: u64) -> UnsignedEvent {
        let mut event = UnsignedEvent::new(
            keys.public_key(),
            Timestamp::from(created_at),
            Kind::Custom(9),
            vec![],
            content,
        );
        event.ensure_id();
        event
    }

    #[tokio::test]
    async fn test_messages_sorted_by_created_at_then_id() {
        let db = setup_db().await;
        let keys = Keys::generate();
        let group_id = vec![1u8; 4];
        let account = "account";

        let later = unsigned(&keys, "later", 2000);
        let earlier = unsigned(&keys, "earlier", 1000);
        Message::save(account, &group_id, "outer1", &later, &db)
            .await
            .unwrap();
        Message::save(account, &group_id, "outer2", &earlier, &db)
            .await
            .unwrap();

        let events = Message::for_group(account, &group_id, None, None, &db)
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].content, "earlier");
        assert_eq!(events[1].content, "later");

        // Bounded by since
        let events = Message::for_group(account, &group_id, Some(1500), None, &db)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].content, "later");
    }

    #[tokio::test]
    async fn test_save_updates_group_last_message() {
        let db = setup_db().await;
        let keys = Keys::generate();
        let group_id = vec![2u8; 4];
        let account = "account";

        sqlx::query(
            "INSERT INTO groups (account_pubkey, mls_group_id, nostr_group_id, name, description, admin_pubkeys, group_type, epoch, state) VALUES (?, ?, 'ng', 'n', '', '[]', 'group', 0, 'active')",
        )
        .bind(account)
        .bind(&group_id)
        .execute(&db.pool)
        .await
        .unwrap();

        let event = unsigned(&keys, "hello", 1234);
        Message::save(account, &group_id, "outer", &event, &db)
            .await
            .unwrap();

        let row: (Option<String>, Option<i64>) = sqlx::query_as(
            "SELECT last_message_id, last_message_at FROM groups WHERE account_pubkey = ? AND mls_group_id = ?",
        )
        .bind(account)
        .bind(&group_id)
        .fetch_one(&db.pool)
        .await
        .unwrap();
        assert_eq!(row.0, event.id.map(|id| id.to_string()));
        assert_eq!(row.1, Some(1234));
    }

    #[tokio::test]
    async fn test_temp_entry_replaced_by_acknowledged_id() {
        let db = setup_db().await;
        let keys = Keys::generate();
        let group_id = vec![3u8; 4];
        let account = "account";

        let unconfirmed = unsigned(&keys, "optimistic", 1000);
        Message::save_temp(account, &group_id, &unconfirmed, &db)
            .await
            .unwrap();

        let temp = Message::find_by_event_id(account, TEMP_EVENT_ID, &db)
            .await
            .unwrap();
        assert!(temp.is_some());

        // Server acknowledges with the signed id and its own created_at
        let mut acked = unconfirmed.clone();
        acked.created_at = Timestamp::from(1050u64);
        acked.id = None;
        acked.ensure_id();
        Message::replace_temp(account, &group_id, "outer", &acked, &db)
            .await
            .unwrap();

        assert!(Message::find_by_event_id(account, TEMP_EVENT_ID, &db)
            .await
            .unwrap()
            .is_none());
        let replaced = Message::find_by_event_id(
            account,
            &acked.id.unwrap().to_string(),
            &db,
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(replaced.created_at.as_u64(), 1050);
    }

    #[tokio::test]
    async fn test_processed_message_ledger_round_trip() {
        let db = setup_db().await;
        let account = "account";

        assert!(ProcessedMessage::find_by_event_id(account, "outer", &db)
            .await
            .unwrap()
            .is_none());

        ProcessedMessage::create_with_state_and_reason(
            account,
            "outer",
            Some("inner".to_string()),
            ProcessedMessageState::Failed,
            "decrypt failed".to_string(),
            &db,
        )
        .await
        .unwrap();

        let found = ProcessedMessage::find_by_event_id(account, "outer", &db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.state, ProcessedMessageState::Failed);
        assert_eq!(found.failure_reason, "decrypt failed");
    }
}
