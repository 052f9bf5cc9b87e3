use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::accounts::{Account, AccountError};
use crate::database::Database;
use crate::nostr_mls::nostr_group_data::NostrGroupDataExtension;
use crate::nostr_mls::NostrMlsError;
use crate::relays::{Relay, RelayError};
use crate::secrets_store::SecretsStoreError;
use crate::utils::is_valid_hex_pubkey;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Group {
    /// This is the MLS group ID, this serves as the PK in the DB and doesn't change
    pub mls_group_id: Vec<u8>,
    /// Hex encoded (same value as the NostrGroupDataExtension) group_id used in Nostr events
    pub nostr_group_id: String,
    /// UTF-8 encoded (same value as the NostrGroupDataExtension)
    pub name: String,
    /// UTF-8 encoded (same value as the NostrGroupDataExtension)
    pub description: String,
    /// Hex encoded (same value as the NostrGroupDataExtension)
    pub admin_pubkeys: Vec<String>,
    /// Hex encoded Nostr event ID of the last message in the group
    pub last_message_id: Option<String>,
    /// Timestamp of the last message in the group
    pub last_message_at: Option<Timestamp>,
    /// Type of Nostr MLS group
    pub group_type: GroupType,
    /// Epoch of the group
    pub epoch: u64,
    /// The state of the group
    pub state: GroupState,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum GroupType {
    /// A group with only two members
    DirectMessage,
    /// A group with more than two members
    Group,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum GroupState {
    /// Normal operation
    Active,
    /// Messages for a future epoch are buffered until the commit arrives
    EpochBuffered,
    /// We published our self-remove proposal and are waiting for the commit
    Leaving,
    /// We are no longer a member
    Closed,
    /// A commit for our epoch did not apply to the stored tree. Terminal.
    Forked,
}

impl TryFrom<String> for GroupType {
    type Error = GroupError;

    fn try_from(s: String) -> Result<Self> {
        match s.as_str() {
            "direct_message" => Ok(GroupType::DirectMessage),
            "group" => Ok(GroupType::Group),
            _ => Err(GroupError::InvalidParameters(format!(
                "Invalid group type: {}",
                s
            ))),
        }
    }
}

impl From<GroupType> for String {
    fn from(group_type: GroupType) -> Self {
        match group_type {
            GroupType::DirectMessage => "direct_message".to_string(),
            GroupType::Group => "group".to_string(),
        }
    }
}

impl TryFrom<String> for GroupState {
    type Error = GroupError;

    fn try_from(s: String) -> Result<Self> {
        match s.as_str() {
            "active" => Ok(GroupState::Active),
            "epoch_buffered" => Ok(GroupState::EpochBuffered),
            "leaving" => Ok(GroupState::Leaving),
            "closed" => Ok(GroupState::Closed),
            "forked" => Ok(GroupState::Forked),
            _ => Err(GroupError::InvalidParameters(format!(
                "Invalid group state: {}",
                s
            ))),
        }
    }
}

impl From<GroupState> for String {
    fn from(state: GroupState) -> Self {
        match state {
            GroupState::Active => "active".to_string(),
            GroupState::EpochBuffered => "epoch_buffered".to_string(),
            GroupState::Leaving => "leaving".to_string(),
            GroupState::Closed => "closed".to_string(),
            GroupState::Forked => "forked".to_string(),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GroupRow {
    pub account_pubkey: String,
    pub mls_group_id: Vec<u8>,
    pub nostr_group_id: String,
    pub name: String,
    pub description: String,
    pub admin_pubkeys: String,
    pub last_message_id: Option<String>,
    pub last_message_at: Option<i64>,
    pub group_type: String,
    pub epoch: i64,
    pub state: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GroupWithRelays {
    pub group: Group,
    pub relays: Vec<String>,
}

#[derive(Error, Debug)]
pub enum GroupError {
    #[error("Group not found")]
    GroupNotFound,

    #[error("Group is closed")]
    GroupClosed,

    #[error("Group is forked")]
    GroupForked,

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Account error: {0}")]
    Account(#[from] AccountError),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MLS error: {0}")]
    Mls(#[from] NostrMlsError),

    #[error("Key error: {0}")]
    Key(#[from] nostr_sdk::key::Error),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Secrets store error: {0}")]
    SecretsStore(#[from] SecretsStoreError),
}

pub type Result<T> = std::result::Result<T, GroupError>;

impl TryFrom<GroupRow> for Group {
    type Error = GroupError;

    fn try_from(row: GroupRow) -> Result<Group> {
        Ok(Group {
            mls_group_id: row.mls_group_id,
            nostr_group_id: row.nostr_group_id,
            name: row.name,
            description: row.description,
            admin_pubkeys: serde_json::from_str(&row.admin_pubkeys)?,
            last_message_id: row.last_message_id,
            last_message_at: row.last_message_at.map(|t| Timestamp::from(t as u64)),
            group_type: GroupType::try_from(row.group_type)?,
            epoch: row.epoch as u64,
            state: GroupState::try_from(row.state)?,
        })
    }
}

impl Group {
    /// Validates the members and admins of a group during creation.
    ///
    /// Creator must be an admin with a valid key but not appear in the member
    /// list; members and admins must all be valid keys; every admin other
    /// than the creator must be a member.
    pub fn validate_group_members(
        creator_pubkey: &String,
        member_pubkeys: &[String],
        admin_pubkeys: &[String],
    ) -> Result<bool> {
        // Creator must be an admin
        if !admin_pubkeys.contains(creator_pubkey) {
            return Err(GroupError::InvalidParameters(
                "Creator must be an admin".to_string(),
            ));
        }

        // Creator must not be included as a member
        if member_pubkeys.contains(creator_pubkey) {
            return Err(GroupError::InvalidParameters(
                "Creator must not be included as a member".to_string(),
            ));
        }

        // Creator must be valid pubkey
        if !is_valid_hex_pubkey(creator_pubkey) {
            return Err(GroupError::InvalidParameters(format!(
                "Invalid creator pubkey: {}",
                creator_pubkey
            )));
        }

        // Check that members are valid pubkeys
        for pubkey in member_pubkeys.iter() {
            if !is_valid_hex_pubkey(pubkey) {
                return Err(GroupError::InvalidParameters(format!(
                    "Invalid member pubkey: {}",
                    pubkey
                )));
            }
        }

        // Check that admins are valid pubkeys and are members
        for pubkey in admin_pubkeys.iter() {
            if !is_valid_hex_pubkey(pubkey) {
                return Err(GroupError::InvalidParameters(format!(
                    "Invalid admin pubkey: {}",
                    pubkey
                )));
            }
            if !member_pubkeys.contains(pubkey) && creator_pubkey != pubkey {
                return Err(GroupError::InvalidParameters(
                    "Admin must be a member".to_string(),
                ));
            }
        }
        Ok(true)
    }

    /// Create and save a new group row from MLS group data.
    pub async fn new(
        account_pubkey: &str,
        mls_group_id: Vec<u8>,
        mls_group_epoch: u64,
        group_type: GroupType,
        group_data: &NostrGroupDataExtension,
        database: &Database,
    ) -> Result<Group> {
        tracing::debug!(
            target: "murmur::groups::new",
            "Creating group with ID: {:?}",
            hex::encode(&mls_group_id)
        );

        let group = Group {
            mls_group_id,
            nostr_group_id: group_data.nostr_group_id(),
            name: group_data.name(),
            description: group_data.description(),
            admin_pubkeys: group_data.admin_pubkeys(),
            last_message_id: None,
            last_message_at: None,
            group_type,
            epoch: mls_group_epoch,
            state: GroupState::Active,
        };

        group.save(account_pubkey, database).await?;
        Relay::replace_for_group(
            account_pubkey,
            &group.mls_group_id,
            &group_data.relays(),
            database,
        )
        .await?;

        Ok(group)
    }

    /// Find a group by its mls_group_id for the active account.
    pub async fn find_by_mls_group_id(mls_group_id: &[u8], database: &Database) -> Result<Group> {
        let account_pubkey = Account::get_active_pubkey(database).await?;
        let row = sqlx::query_as::<_, GroupRow>(
            "SELECT * FROM groups WHERE account_pubkey = ? AND mls_group_id = ?",
        )
        .bind(&account_pubkey)
        .bind(mls_group_id)
        .fetch_optional(&database.pool)
        .await?
        .ok_or(GroupError::GroupNotFound)?;
        row.try_into()
    }

    pub async fn get_by_nostr_group_id(
        nostr_group_id: &str,
        database: &Database,
    ) -> Result<Group> {
        let account_pubkey = Account::get_active_pubkey(database).await?;
        let row = sqlx::query_as::<_, GroupRow>(
            "SELECT * FROM groups WHERE account_pubkey = ? AND nostr_group_id = ?",
        )
        .bind(&account_pubkey)
        .bind(nostr_group_id)
        .fetch_optional(&database.pool)
        .await?
        .ok_or(GroupError::GroupNotFound)?;
        row.try_into()
    }

    /// Gets all groups for the active account.
    pub async fn get_all_groups(database: &Database) -> Result<Vec<Group>> {
        let account_pubkey = Account::get_active_pubkey(database).await?;
        let rows = sqlx::query_as::<_, GroupRow>("SELECT * FROM groups WHERE account_pubkey = ?")
            .bind(&account_pubkey)
            .fetch_all(&database.pool)
            .await?;
        rows.into_iter().map(Group::try_from).collect()
    }

    /// Save the group row.
    pub async fn save(&self, account_pubkey: &str, database: &Database) -> Result<Group> {
        let mut txn = database.pool.begin().await?;
        sqlx::query(
            "INSERT OR REPLACE INTO groups (account_pubkey, mls_group_id, nostr_group_id, name, description, admin_pubkeys, last_message_id, last_message_at, group_type, epoch, state) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(account_pubkey)
        .bind(&self.mls_group_id)
        .bind(&self.nostr_group_id)
        .bind(&self.name)
        .bind(&self.description)
        .bind(serde_json::to_string(&self.admin_pubkeys)?)
        .bind(&self.last_message_id)
        .bind(self.last_message_at.map(|t| t.as_u64() as i64))
        .bind(String::from(self.group_type.clone()))
        .bind(self.epoch as i64)
        .bind(String::from(self.state.clone()))
        .execute(&mut *txn)
        .await?;
        txn.commit().await?;
        Ok(self.clone())
    }

    /// Fails unless the group can accept new application messages.
    pub fn ensure_can_send(&self) -> Result<()> {
        match self.state {
            GroupState::Active | GroupState::EpochBuffered => Ok(()),
            GroupState::Leaving | GroupState::Closed => Err(GroupError::GroupClosed),
            GroupState::Forked => Err(GroupError::GroupForked),
        }
    }

    pub async fn set_state(
        &mut self,
        state: GroupState,
        account_pubkey: &str,
        database: &Database,
    ) -> Result<()> {
        self.state = state;
        sqlx::query("UPDATE groups SET state = ? WHERE account_pubkey = ? AND mls_group_id = ?")
            .bind(String::from(self.state.clone()))
            .bind(account_pubkey)
            .bind(&self.mls_group_id)
            .execute(&database.pool)
            .await?;
        Ok(())
    }

    pub async fn set_epoch(
        &mut self,
        epoch: u64,
        account_pubkey: &str,
        database: &Database,
    ) -> Result<()> {
        self.epoch = epoch;
        sqlx::query("UPDATE groups SET epoch = ? WHERE account_pubkey = ? AND mls_group_id = ?")
            .bind(epoch as i64)
            .bind(account_pubkey)
            .bind(&self.mls_group_id)
            .execute(&database.pool)
            .await?;
        Ok(())
    }

    /// The relays this group publishes its MLS traffic to.
    pub async fn relays(&self, database: &Database) -> Result<Vec<String>> {
        let account_pubkey = Account::get_active_pubkey(database).await?;
        Ok(Relay::urls_for_group(&account_pubkey, &self.mls_group_id, database).await?)
    }

    pub fn admins(&self) -> Result<Vec<PublicKey>> {
        self.admin_pubkeys.iter().try_fold(
            Vec::with_capacity(self.admin_pubkeys.len()),
            |mut acc, pk| {
                acc.push(PublicKey::parse(pk)?);
                Ok(acc)
            },
        )
    }

    /// Persists a serialized MLS state snapshot for this group at an epoch.
    pub async fn save_epoch_state(
        &self,
        account_pubkey: &str,
        epoch: u64,
        state: &[u8],
        database: &Database,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO mls_epoch_state (account_pubkey, mls_group_id, epoch, state, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(account_pubkey)
        .bind(&self.mls_group_id)
        .bind(epoch as i64)
        .bind(state)
        .bind(Timestamp::now().as_u64() as i64)
        .execute(&database.pool)
        .await?;
        Ok(())
    }

    /// Loads the most recent MLS state snapshot stored for an account,
    /// across all of its groups.
    pub async fn latest_epoch_state(
        account_pubkey: &str,
        database: &Database,
    ) -> Result<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as(
            "SELECT state FROM mls_epoch_state WHERE account_pubkey = ? ORDER BY updated_at DESC, epoch DESC LIMIT 1",
        )
        .bind(account_pubkey)
        .fetch_optional(&database.pool)
        .await?;
        Ok(row.map(|(state,)| state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets_store::SecretsStore;
    use tempfile::tempdir;

    const VALID_A: &str = "aa4fc8665f5696e33db7e1a572e3b0f5b3d615837b0f362dcb1c8068b098c7b4";
    const VALID_B: &str = "5c83da77af1dec6d7289834998ad7aafbd9e2191396d75ec3cc27f5a77226f36";

    #[test]
    fn test_validate_group_members() {
        let creator = VALID_A.to_string();
        let members = vec![VALID_B.to_string()];
        let admins = vec![VALID_A.to_string(), VALID_B.to_string()];
        assert!(Group::validate_group_members(&creator, &members, &admins).is_ok());

        // Creator must be an admin
        assert!(Group::validate_group_members(&creator, &members, &[VALID_B.to_string()]).is_err());

        // Creator must not be a member
        assert!(Group::validate_group_members(
            &creator,
            &[VALID_A.to_string(), VALID_B.to_string()],
            &admins
        )
        .is_err());

        // Admin that is not a member is rejected
        let stray_admin = "7b1c3bd66a3e2a4c4c6c63e7ee0b6c25a33b723d4f7a83c366e0632b8e8e8e60";
        assert!(Group::validate_group_members(
            &creator,
            &members,
            &[creator.clone(), stray_admin.to_string()]
        )
        .is_err());

        // Invalid pubkeys rejected
        assert!(
            Group::validate_group_members(&"garbage".to_string(), &members, &admins).is_err()
        );
    }

    #[test]
    fn test_enum_conversions_reject_unknown_values() {
        assert_eq!(
            GroupType::try_from("direct_message".to_string()).unwrap(),
            GroupType::DirectMessage
        );
        assert_eq!(
            GroupState::try_from("forked".to_string()).unwrap(),
            GroupState::Forked
        );
        assert!(matches!(
            GroupType::try_from("channel".to_string()),
            Err(GroupError::InvalidParameters(_))
        ));
        assert!(matches!(
            GroupState::try_from("bogus".to_string()),
            Err(GroupError::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_ensure_can_send_by_state() {
        let mut group = Group {
            mls_group_id: vec![1],
            nostr_group_id: "abc".to_string(),
            name: "g".to_string(),
            description: "".to_string(),
            admin_pubkeys: vec![],
            last_message_id: None,
            last_message_at: None,
            group_type: GroupType::Group,
            epoch: 0,
            state: GroupState::Active,
        };
        assert!(group.ensure_can_send().is_ok());

        group.state = GroupState::EpochBuffered;
        assert!(group.ensure_can_send().is_ok());

        group.state = GroupState::Leaving;
        assert!(matches!(
            group.ensure_can_send(),
            Err(GroupError::GroupClosed)
        ));

        group.state = GroupState::Forked;
        assert!(matches!(
            group.ensure_can_send(),
            Err(GroupError::GroupForked)
        ));
    }

    #[tokio::test]
    async fn test_group_row_round_trip() {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path()).await.unwrap();
        let secrets = SecretsStore::new(dir.path());
        secrets.unlock().unwrap();

        let account = Account::new(&db, &secrets).await.unwrap();
        account.set_active(&db).await.unwrap();

        let group_data = NostrGroupDataExtension::new(
            "Secure DM".to_string(),
            "".to_string(),
            vec![VALID_A.to_string(), VALID_B.to_string()],
            vec!["wss://relay.damus.io".to_string()],
        );
        let group = Group::new(
            &account.pubkey,
            vec![9u8; 16],
            1,
            GroupType::DirectMessage,
            &group_data,
            &db,
        )
        .await
        .unwrap();

        let found = Group::find_by_mls_group_id(&group.mls_group_id, &db)
            .await
            .unwrap();
        assert_eq!(found.nostr_group_id, group_data.nostr_group_id());
        assert_eq!(found.group_type, GroupType::DirectMessage);
        assert_eq!(found.state, GroupState::Active);
        assert_eq!(found.admin_pubkeys.len(), 2);

        let by_nostr_id = Group::get_by_nostr_group_id(&group.nostr_group_id, &db)
            .await
            .unwrap();
        assert_eq!(by_nostr_id.mls_group_id, group.mls_group_id);

        let relays = found.relays(&db).await.unwrap();
        assert_eq!(relays, vec!["wss://relay.damus.io"]);
    }

    #[tokio::test]
    async fn test_epoch_state_snapshots() {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path()).await.unwrap();
        let secrets = SecretsStore::new(dir.path());
        secrets.unlock().unwrap();
        let account = Account::new(&db, &secrets).await.unwrap();
        account.set_active(&db).await.unwrap();

        let group_data =
            NostrGroupDataExtension::new("g".to_string(), "".to_string(), vec![], vec![]);
        let group = Group::new(
            &account.pubkey,
            vec![7u8; 16],
            0,
            GroupType::Group,
            &group_data,
            &db,
        )
        .await
        .unwrap();

        group
            .save_epoch_state(&account.pubkey, 0, b"state-0", &db)
            .await
            .unwrap();
        group
            .save_epoch_state(&account.pubkey, 1, b"state-1", &db)
            .await
            .unwrap();

        let latest = Group::latest_epoch_state(&account.pubkey, &db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest, b"state-1");
    }
}
