// --- Sub-Modules ---
pub mod accounts;
pub mod commands;
pub mod database;
pub mod events;
pub mod groups;
pub mod invites;
pub mod key_packages;
pub mod message_aggregator;
pub mod messages;
pub mod nostr_manager;
pub mod nostr_mls;
pub mod payments;
pub mod relays;
pub mod secrets_store;
pub mod signals;
pub mod types;
pub mod utils;

// --- Re-Exports ---
pub use commands::CommandError;
pub use signals::{Signal, SignalBus};

// --- Imports ---
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::accounts::Account;
use crate::database::Database;
use crate::groups::Group;
use crate::nostr_manager::event_processor::EventProcessor;
use crate::nostr_manager::NostrManager;
use crate::nostr_mls::{NostrMls, NostrMlsError};
use crate::secrets_store::SecretsStore;

#[derive(Error, Debug)]
pub enum InitError {
    #[error("Database error: {0}")]
    Database(#[from] crate::database::DatabaseError),

    #[error("Secrets store error: {0}")]
    SecretsStore(#[from] crate::secrets_store::SecretsStoreError),

    #[error("Nostr error: {0}")]
    Nostr(#[from] crate::nostr_manager::NostrManagerError),

    #[error("MLS error: {0}")]
    Mls(#[from] NostrMlsError),

    #[error("Account error: {0}")]
    Account(#[from] crate::accounts::AccountError),
}

/// The messaging core. One instance per process; the UI bridge calls
/// [`commands`] functions against it and subscribes to [`SignalBus`] for
/// everything that changes underneath.
pub struct Murmur {
    pub database: Database,
    pub secrets: SecretsStore,
    pub nostr: NostrManager,
    pub nostr_mls: NostrMls,
    pub signals: SignalBus,
    pub data_dir: PathBuf,
    pub(crate) shutdown: CancellationToken,
}

impl Murmur {
    /// Builds the core against a data directory and restores the active
    /// account's MLS state, without touching the network beyond connecting
    /// the default relay set.
    pub async fn new(data_dir: PathBuf) -> Result<Arc<Self>, InitError> {
        tracing::debug!(
            target: "murmur::new",
            "Creating Murmur instance with data_dir: {:?}",
            data_dir
        );
        let database = Database::new(&data_dir).await?;
        let secrets = SecretsStore::new(&data_dir);

        let active_pubkey = Account::get_active_pubkey(&database).await.ok();

        // Lockdown accounts keep the secrets store locked until the bridge
        // runs the session unlock explicitly.
        let lockdown = match &active_pubkey {
            Some(pubkey) => Account::find_by_pubkey(pubkey, &database)
                .await
                .map(|account| account.settings.lockdown_mode)
                .unwrap_or(false),
            None => false,
        };
        if !lockdown {
            secrets.unlock()?;
        }

        let event_processor = Arc::new(EventProcessor::new());
        let nostr = NostrManager::new(event_processor).await?;
        let nostr_mls = NostrMls::new(active_pubkey.clone());
        if let Some(pubkey) = &active_pubkey {
            if let Ok(Some(snapshot)) = Group::latest_epoch_state(pubkey, &database).await {
                nostr_mls.restore_state(&snapshot)?;
            }
        }

        Ok(Arc::new(Self {
            database,
            secrets,
            nostr,
            nostr_mls,
            signals: SignalBus::new(),
            data_dir,
            shutdown: CancellationToken::new(),
        }))
    }

    /// Spawns the long-lived background tasks: the inbox pipeline, the relay
    /// notification drain, and the relay status monitor.
    pub fn start(self: &Arc<Self>) {
        let processor_handle = Arc::clone(self);
        tokio::spawn(async move {
            EventProcessor::run(processor_handle).await;
        });

        let notifications_handle = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = notifications_handle.nostr.handle_notifications() => {}
                _ = notifications_handle.shutdown.cancelled() => {}
            }
        });

        let status_handle = Arc::clone(self);
        tokio::spawn(async move {
            status_handle.monitor_relay_statuses().await;
        });
    }

    /// Emits a `relay_status` signal whenever a relay's connection state
    /// changes.
    async fn monitor_relay_statuses(&self) {
        let mut known: HashMap<String, String> = HashMap::new();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                _ = self.shutdown.cancelled() => return,
            }
            for (url, status) in self.nostr.relay_statuses().await {
                if known.get(&url) != Some(&status) {
                    known.insert(url.clone(), status.clone());
                    self.signals.emit(Signal::RelayStatus { url, status });
                }
            }
        }
    }

    /// Switches the active account: persists the switch, swaps the Nostr
    /// signer and MLS identity, reinstalls subscriptions, and replays missed
    /// traffic. `account_changing` fires before any visible mutation.
    pub async fn set_active_account(self: &Arc<Self>, pubkey: &str) -> Result<Account, InitError> {
        let account = Account::find_by_pubkey(pubkey, &self.database).await?;

        self.signals.emit(Signal::AccountChanging {
            pubkey: account.pubkey.clone(),
        });

        let account = account.set_active(&self.database).await?;

        // Drop anything queued for the previous identity
        self.nostr.event_processor.clear_queue();

        let keys = self.secrets.get_nostr_keys_for_pubkey(&account.pubkey)?;
        self.nostr
            .set_nostr_identity(&account, keys, &self.database)
            .await?;
        self.signals.emit(Signal::NostrReady);

        // Swap MLS state to the new identity
        self.nostr_mls
            .set_current_identity(Some(account.pubkey.clone()));
        if let Ok(Some(snapshot)) = Group::latest_epoch_state(&account.pubkey, &self.database).await
        {
            self.nostr_mls.restore_state(&snapshot)?;
        }

        // Subscriptions catch future events; the fetch replays the past.
        let subs_handle = Arc::clone(self);
        let subs_account = account.clone();
        tokio::spawn(async move {
            let group_ids = subs_account
                .nostr_group_ids(&subs_handle.database)
                .await
                .unwrap_or_default();
            let pubkey = match nostr_sdk::PublicKey::from_hex(&subs_account.pubkey) {
                Ok(pubkey) => pubkey,
                Err(_) => return,
            };
            if let Err(e) = subs_handle
                .nostr
                .setup_subscriptions(pubkey, group_ids.clone())
                .await
            {
                tracing::error!(
                    target: "murmur::set_active_account",
                    "Error subscribing to events: {}",
                    e
                );
            }
            match subs_handle
                .nostr
                .fetch_for_user(pubkey, subs_account.last_synced, group_ids)
                .await
            {
                Ok(_) => {
                    if let Err(e) =
                        Account::update_last_synced(&subs_account.pubkey, &subs_handle.database)
                            .await
                    {
                        tracing::error!(
                            target: "murmur::set_active_account",
                            "Error updating last_synced: {}",
                            e
                        );
                    }
                }
                Err(e) => {
                    tracing::error!(
                        target: "murmur::set_active_account",
                        "Error in catch-up fetch: {}",
                        e
                    );
                }
            }
        });

        self.signals.emit(Signal::AccountChanged {
            pubkey: Some(account.pubkey.clone()),
        });

        Ok(account)
    }

    /// Persists the full MLS store snapshot under (group, epoch). Whole
    /// snapshots are self-contained, so restoring the newest row restores
    /// every group.
    pub async fn persist_mls_snapshot(
        &self,
        mls_group_id: &[u8],
        epoch: u64,
    ) -> Result<(), NostrMlsError> {
        let Some(account_pubkey) = self.nostr_mls.current_identity() else {
            return Ok(());
        };
        let snapshot = self.nostr_mls.serialize_state()?;
        sqlx::query(
            "INSERT OR REPLACE INTO mls_epoch_state (account_pubkey, mls_group_id, epoch, state, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&account_pubkey)
        .bind(mls_group_id)
        .bind(epoch as i64)
        .bind(snapshot)
        .bind(nostr_sdk::Timestamp::now().as_u64() as i64)
        .execute(&self.database.pool)
        .await
        .map_err(|e| NostrMlsError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Wipes every store: database rows, MLS state, wrapped secrets, relay
    /// pool state. Accounts must log in again afterwards.
    pub async fn delete_all_data(&self) -> Result<(), InitError> {
        self.database.delete_data().await?;
        self.nostr_mls.delete_data();
        self.nostr_mls.set_current_identity(None);
        self.secrets.delete_data()?;
        self.nostr.delete_all_data().await?;
        self.signals.emit(Signal::AccountChanged { pubkey: None });
        Ok(())
    }

    /// Cancels all background tasks.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_new_instance_has_no_active_account() {
        let dir = tempdir().unwrap();
        let murmur = Murmur::new(dir.path().to_path_buf()).await.unwrap();

        assert!(Account::get_active(&murmur.database).await.is_err());
        assert!(murmur.nostr_mls.current_identity().is_none());
        murmur.stop();
    }

    #[tokio::test]
    async fn test_create_identity_activates_account_and_mls_identity() {
        let dir = tempdir().unwrap();
        let murmur = Murmur::new(dir.path().to_path_buf()).await.unwrap();
        let mut signals = murmur.signals.subscribe();

        let account = commands::accounts::create_identity("alice".to_string(), &murmur)
            .await
            .unwrap();

        let active = Account::get_active(&murmur.database).await.unwrap();
        assert_eq!(active.pubkey, account.pubkey);
        assert_eq!(active.metadata.name.as_deref(), Some("alice"));
        assert_eq!(
            murmur.nostr_mls.current_identity().as_deref(),
            Some(account.pubkey.as_str())
        );

        // account_changing fires before account_changed
        let mut saw_changing = false;
        while let Ok(signal) = signals.try_recv() {
            match signal {
                Signal::AccountChanging { .. } => saw_changing = true,
                Signal::AccountChanged { pubkey } => {
                    assert!(saw_changing);
                    assert_eq!(pubkey, Some(account.pubkey.clone()));
                }
                _ => {}
            }
        }
        murmur.stop();
    }

    #[tokio::test]
    async fn test_delete_all_data_wipes_accounts() {
        let dir = tempdir().unwrap();
        let murmur = Murmur::new(dir.path().to_path_buf()).await.unwrap();

        commands::accounts::create_identity("bob".to_string(), &murmur)
            .await
            .unwrap();
        assert_eq!(Account::all(&murmur.database).await.unwrap().len(), 1);

        murmur.delete_all_data().await.unwrap();
        assert!(Account::all(&murmur.database).await.unwrap().is_empty());
        assert!(murmur.nostr_mls.current_identity().is_none());
        murmur.stop();
    }
}

/// Sets up tracing for the embedding app: env-filtered stderr plus a daily
/// rotated log file under the data directory. Returns the appender guard;
/// dropping it stops the file writer.
pub fn init_logging(data_dir: &std::path::Path) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(data_dir.join("logs"), "murmur.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .try_init();

    guard
}
