use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::accounts::AccountError;
use crate::database::Database;

#[derive(Error, Debug)]
pub enum InviteError {
    #[error("Invite not found")]
    NotFound,

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Event error: {0}")]
    Event(#[from] nostr_sdk::event::unsigned::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Account error: {0}")]
    Account(#[from] AccountError),
}

pub type Result<T> = std::result::Result<T, InviteError>;

#[derive(Serialize, Deserialize, Debug, Clone, sqlx::FromRow)]
pub struct InviteRow {
    pub event_id: String,
    pub account_pubkey: String,
    pub event: String, // JSON string for UnsignedEvent
    pub mls_group_id: Vec<u8>,
    pub nostr_group_id: String,
    pub group_name: String,
    pub group_description: String,
    pub group_admin_pubkeys: String, // JSON array of strings
    pub group_relays: String,        // JSON array of strings
    pub inviter: String,
    pub member_count: i64,
    pub outer_event_id: String,
    pub state: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Invite {
    /// The event id of the welcome rumor
    pub event_id: String,
    /// The account that owns this invite
    pub account_pubkey: String,
    /// The rumor event that contains the welcome message
    pub event: UnsignedEvent,
    /// MLS group id
    pub mls_group_id: Vec<u8>,
    /// Nostr group id (from NostrGroupDataExtension)
    pub nostr_group_id: String,
    /// Group name (from NostrGroupDataExtension)
    pub group_name: String,
    /// Group description (from NostrGroupDataExtension)
    pub group_description: String,
    /// Group admin pubkeys (from NostrGroupDataExtension)
    pub group_admin_pubkeys: Vec<String>,
    /// Group relays (from NostrGroupDataExtension)
    pub group_relays: Vec<String>,
    /// Pubkey of the user that sent the invite
    pub inviter: String,
    /// Member count of the group
    pub member_count: u32,
    /// The state of the invite
    pub state: InviteState,
    /// The event id of the gift-wrap event that delivered the invite
    pub outer_event_id: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub enum InviteState {
    Pending,
    Accepted,
    Declined,
}

impl From<String> for InviteState {
    fn from(s: String) -> Self {
        match s.to_lowercase().as_str() {
            "pending" => InviteState::Pending,
            "accepted" => InviteState::Accepted,
            "declined" => InviteState::Declined,
            _ => panic!("Invalid invite state: {}", s),
        }
    }
}

impl From<InviteState> for String {
    fn from(state: InviteState) -> Self {
        match state {
            InviteState::Pending => "pending".to_string(),
            InviteState::Accepted => "accepted".to_string(),
            InviteState::Declined => "declined".to_string(),
        }
    }
}

impl TryFrom<InviteRow> for Invite {
    type Error = InviteError;

    fn try_from(row: InviteRow) -> Result<Invite> {
        Ok(Invite {
            event_id: row.event_id,
            account_pubkey: row.account_pubkey,
            event: UnsignedEvent::from_json(&row.event)?,
            mls_group_id: row.mls_group_id,
            nostr_group_id: row.nostr_group_id,
            group_name: row.group_name,
            group_description: row.group_description,
            group_admin_pubkeys: serde_json::from_str(&row.group_admin_pubkeys)?,
            group_relays: serde_json::from_str(&row.group_relays)?,
            inviter: row.inviter,
            member_count: row.member_count as u32,
            state: InviteState::from(row.state),
            outer_event_id: row.outer_event_id,
        })
    }
}

impl Invite {
    pub async fn find_by_id(
        account_pubkey: &str,
        invite_event_id: &str,
        database: &Database,
    ) -> Result<Invite> {
        let row = sqlx::query_as::<_, InviteRow>(
            "SELECT * FROM invites WHERE account_pubkey = ? AND event_id = ?",
        )
        .bind(account_pubkey)
        .bind(invite_event_id)
        .fetch_optional(&database.pool)
        .await?
        .ok_or(InviteError::NotFound)?;
        row.try_into()
    }

    pub async fn pending(account_pubkey: &str, database: &Database) -> Result<Vec<Invite>> {
        let rows = sqlx::query_as::<_, InviteRow>(
            "SELECT * FROM invites WHERE state = 'pending' AND account_pubkey = ?",
        )
        .bind(account_pubkey)
        .fetch_all(&database.pool)
        .await?;
        rows.into_iter().map(Invite::try_from).collect()
    }

    pub async fn save(&self, database: &Database) -> Result<Invite> {
        let mut txn = database.pool.begin().await?;
        sqlx::query(
            "INSERT OR REPLACE INTO invites (event_id, account_pubkey, event, mls_group_id, nostr_group_id, group_name, group_description, group_admin_pubkeys, group_relays, inviter, member_count, outer_event_id, state) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.event_id)
        .bind(&self.account_pubkey)
        .bind(serde_json::to_string(&self.event)?)
        .bind(&self.mls_group_id)
        .bind(&self.nostr_group_id)
        .bind(&self.group_name)
        .bind(&self.group_description)
        .bind(serde_json::to_string(&self.group_admin_pubkeys)?)
        .bind(serde_json::to_string(&self.group_relays)?)
        .bind(&self.inviter)
        .bind(self.member_count as i64)
        .bind(&self.outer_event_id)
        .bind(String::from(self.state.clone()))
        .execute(&mut *txn)
        .await?;
        txn.commit().await?;
        Ok(self.clone())
    }

    pub async fn set_state(&mut self, state: InviteState, database: &Database) -> Result<()> {
        self.state = state;
        sqlx::query("UPDATE invites SET state = ? WHERE account_pubkey = ? AND event_id = ?")
            .bind(String::from(self.state.clone()))
            .bind(&self.account_pubkey)
            .bind(&self.event_id)
            .execute(&database.pool)
            .await?;
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub enum ProcessedInviteState {
    Processed,
    Failed,
}

impl From<String> for ProcessedInviteState {
    fn from(s: String) -> Self {
        match s.to_lowercase().as_str() {
            "processed" => ProcessedInviteState::Processed,
            "failed" => ProcessedInviteState::Failed,
            _ => panic!("Invalid processed invite state: {}", s),
        }
    }
}

impl From<ProcessedInviteState> for String {
    fn from(state: ProcessedInviteState) -> Self {
        match state {
            ProcessedInviteState::Processed => "processed".to_string(),
            ProcessedInviteState::Failed => "failed".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, sqlx::FromRow)]
pub struct ProcessedInviteRow {
    pub event_id: String,
    pub invite_event_id: String,
    pub account_pubkey: String,
    pub processed_at: i64,
    pub state: String,
    pub failure_reason: String,
}

/// The processed-invite ledger. One terminal row per welcome event and
/// account; consulted before any welcome processing attempt so a welcome is
/// applied at most once.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProcessedInvite {
    pub event_id: String,
    pub invite_event_id: String,
    pub account_pubkey: String,
    pub processed_at: u64,
    pub state: ProcessedInviteState,
    pub failure_reason: String,
}

impl From<ProcessedInviteRow> for ProcessedInvite {
    fn from(row: ProcessedInviteRow) -> Self {
        ProcessedInvite {
            event_id: row.event_id,
            invite_event_id: row.invite_event_id,
            account_pubkey: row.account_pubkey,
            processed_at: row.processed_at as u64,
            state: ProcessedInviteState::from(row.state),
            failure_reason: row.failure_reason,
        }
    }
}

impl ProcessedInvite {
    /// Looks up the ledger row for a welcome event id.
    pub async fn find_by_welcome_event_id(
        account_pubkey: &str,
        event_id: &str,
        database: &Database,
    ) -> Result<Option<ProcessedInvite>> {
        let row = sqlx::query_as::<_, ProcessedInviteRow>(
            "SELECT * FROM processed_invites WHERE event_id = ? AND account_pubkey = ?",
        )
        .bind(event_id)
        .bind(account_pubkey)
        .fetch_optional(&database.pool)
        .await?;
        Ok(row.map(|row| row.into()))
    }

    pub async fn failed_with_reason(
        account_pubkey: &str,
        database: &Database,
    ) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query_as::<_, ProcessedInviteRow>(
            "SELECT * FROM processed_invites WHERE state = 'failed' AND account_pubkey = ?",
        )
        .bind(account_pubkey)
        .fetch_all(&database.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.event_id, row.failure_reason))
            .collect())
    }

    /// Writes the terminal outcome for a welcome. The first write wins;
    /// subsequent attempts for the same welcome are answered from the ledger
    /// instead of reprocessing.
    pub async fn create_with_state_and_reason(
        account_pubkey: &str,
        event_id: &str,
        invite_event_id: &str,
        state: ProcessedInviteState,
        reason: String,
        database: &Database,
    ) -> Result<ProcessedInvite> {
        let processed_at = chrono::Utc::now().timestamp() as u64;
        let mut txn = database.pool.begin().await?;
        sqlx::query(
            "INSERT OR IGNORE INTO processed_invites (event_id, invite_event_id, account_pubkey, processed_at, state, failure_reason) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(event_id)
        .bind(invite_event_id)
        .bind(account_pubkey)
        .bind(processed_at as i64)
        .bind(String::from(state.clone()))
        .bind(reason.clone())
        .execute(&mut *txn)
        .await?;
        txn.commit().await?;

        Ok(ProcessedInvite {
            event_id: event_id.to_string(),
            invite_event_id: invite_event_id.to_string(),
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

    fn test_invite(account_pubkey: &str, event: UnsignedEvent) -> Invite {
        Invite {
            event_id: event.id.unwrap().to_string(),
            account_pubkey: account_pubkey.to_string(),
            event,
            mls_group_id: vec![1, 2, 3],
            nostr_group_id: "abcd".to_string(),
            group_name: "Secure DM".to_string(),
            group_description: "".to_string(),
            group_admin_pubkeys: vec!["a".to_string(), "b".to_string()],
            group_relays: vec!["wss://relay.damus.io".to_string()],
            inviter: "a".to_string(),
            member_count: 2,
            state: InviteState::Pending,
            outer_event_id: "outer".to_string(),
        }
    }

    fn welcome_rumor(keys: &Keys) -> UnsignedEvent {
        let mut event = UnsignedEvent::new(
            keys.public_key(),
            Timestamp::now(),
            Kind::MlsWelcome,
            vec![],
            "deadbeef",
        );
        event.ensure_id();
        event
    }

    #[tokio::test]
    async fn test_invite_round_trip_and_pending_query() {
        let db = setup_db().await;
        let keys = Keys::generate();
        let account = "account";
        let invite = test_invite(account, welcome_rumor(&keys));
        invite.save(&db).await.unwrap();

        let pending = Invite::pending(account, &db).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].group_name, "Secure DM");
        assert_eq!(pending[0].member_count, 2);
        assert_eq!(pending[0].state, InviteState::Pending);

        let mut found = Invite::find_by_id(account, &invite.event_id, &db)
            .await
            .unwrap();
        found.set_state(InviteState::Declined, &db).await.unwrap();

        // Declined invites leave the pending list
        assert!(Invite::pending(account, &db).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ledger_written_exactly_once_per_welcome() {
        let db = setup_db().await;
        let account = "account";

        ProcessedInvite::create_with_state_and_reason(
            account,
            "welcome-1",
            "invite-1",
            ProcessedInviteState::Processed,
            "".to_string(),
            &db,
        )
        .await
        .unwrap();

        // Second terminal write for the same welcome does not overwrite
        ProcessedInvite::create_with_state_and_reason(
            account,
            "welcome-1",
            "invite-1",
            ProcessedInviteState::Failed,
            "should not win".to_string(),
            &db,
        )
        .await
        .unwrap();

        let rows: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM processed_invites WHERE account_pubkey = ?")
                .bind(account)
                .fetch_one(&db.pool)
                .await
                .unwrap();
        assert_eq!(rows.0, 1);

        let found = ProcessedInvite::find_by_welcome_event_id(account, "welcome-1", &db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.state, ProcessedInviteState::Processed);
    }

    #[tokio::test]
    async fn test_failed_with_reason_lists_failures() {
        let db = setup_db().await;
        ProcessedInvite::create_with_state_and_reason(
            "account",
            "welcome-2",
            "invite-2",
            ProcessedInviteState::Failed,
            "Error decrypting welcome event".to_string(),
            &db,
        )
        .await
        .unwrap();

        let failed = ProcessedInvite::failed_with_reason("account", &db)
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, "welcome-2");
        assert!(failed[0].1.contains("decrypting"));
    }
}
