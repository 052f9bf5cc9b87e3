use nostr_sdk::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::accounts::Account;
use crate::nostr_manager::event_processor::EventProcessor;
use crate::relays::RelayType;
use crate::secrets_store::SecretsStoreError;

pub mod event_processor;
pub mod fetch;
pub mod query;
pub mod search;
pub mod subscriptions;

/// Publish acknowledgement deadline.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(15);
/// Key package fetch deadline.
pub const KEY_PACKAGE_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
/// Welcome processing deadline.
pub const WELCOME_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Error, Debug)]
pub enum NostrManagerError {
    #[error("Client Error: {0}")]
    Client(#[from] nostr_sdk::client::Error),
    #[error("Metadata Error: {0}")]
    Metadata(#[from] nostr_sdk::types::metadata::Error),
    #[error("Signer Error: {0}")]
    Signer(#[from] nostr_sdk::signer::SignerError),
    #[error("Event Builder Error: {0}")]
    EventBuilder(#[from] nostr_sdk::event::builder::Error),
    #[error("Error with secrets store: {0}")]
    SecretsStore(#[from] SecretsStoreError),
    #[error("No relay acknowledged the publish")]
    PublishUnreachable,
    #[error("Failed to install subscription: {0}")]
    SubscribeFailed(String),
    #[error("Operation timed out")]
    Timeout,
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Failed to queue event: {0}")]
    FailedToQueueEvent(String),
}

pub type Result<T> = std::result::Result<T, NostrManagerError>;

#[derive(Debug, Clone)]
pub struct NostrManagerSettings {
    pub timeout: Duration,
    pub relays: Vec<String>,
}

impl Default for NostrManagerSettings {
    fn default() -> Self {
        let mut relays = vec![];
        if cfg!(feature = "local-relays") {
            relays.push("ws://localhost:8080".to_string());
            relays.push("ws://localhost:7777".to_string());
            relays.push("wss://purplepag.es".to_string());
        } else {
            relays.push("wss://relay.damus.io".to_string());
            relays.push("wss://purplepag.es".to_string());
            relays.push("wss://relay.primal.net".to_string());
            relays.push("wss://nostr.oxtr.dev".to_string());
        }

        Self {
            timeout: Duration::from_secs(5),
            relays,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NostrManager {
    pub client: Client,
    pub settings: Arc<Mutex<NostrManagerSettings>>,
    pub(crate) event_processor: Arc<EventProcessor>,
}

impl NostrManager {
    pub async fn new(event_processor: Arc<EventProcessor>) -> Result<Self> {
        let client = Client::builder().opts(Options::default()).build();

        let settings = NostrManagerSettings::default();

        // Add and connect to the default relays
        for relay in &settings.relays {
            client.add_relay(relay).await?;
        }
        client.connect().await;

        Ok(Self {
            client,
            settings: Arc::new(Mutex::new(settings)),
            event_processor,
        })
    }

    pub async fn timeout(&self) -> Duration {
        self.settings.lock().await.timeout
    }

    pub async fn relays(&self) -> Vec<String> {
        self.settings.lock().await.relays.clone()
    }

    /// Per-relay connection status, keyed by URL.
    pub async fn relay_statuses(&self) -> Vec<(String, String)> {
        self.client
            .relays()
            .await
            .into_iter()
            .map(|(url, relay)| (url.to_string(), format!("{}", relay.status())))
            .collect()
    }

    /// Publishes an event to the given relays and waits for at least one
    /// acknowledgement. All-relay failure surfaces `PublishUnreachable`;
    /// missing the deadline surfaces `Timeout`.
    pub async fn publish_event_to(
        &self,
        relays: Vec<String>,
        event: Event,
    ) -> Result<Output<EventId>> {
        let send = self.client.send_event_to(relays, event);
        let output = tokio::time::timeout(PUBLISH_TIMEOUT, send)
            .await
            .map_err(|_| NostrManagerError::Timeout)?
            .map_err(|e| {
                tracing::error!(
                    target: "murmur::nostr_manager::publish_event_to",
                    "Publish failed on all relays: {}",
                    e
                );
                NostrManagerError::PublishUnreachable
            })?;

        if output.success.is_empty() {
            return Err(NostrManagerError::PublishUnreachable);
        }
        Ok(output)
    }

    /// Switches the client to a new account identity: resets the pool,
    /// installs the signer, and reconnects default plus account relays.
    pub async fn set_nostr_identity(
        &self,
        account: &Account,
        keys: Keys,
        database: &crate::database::Database,
    ) -> Result<()> {
        tracing::debug!(
            target: "murmur::nostr_manager::set_nostr_identity",
            "Starting Nostr identity update for {}",
            account.pubkey
        );

        // Reset the client and set the new signer
        self.client.reset().await?;
        self.client.set_signer(keys).await;

        // Add the default relays
        for relay in self.relays().await {
            self.client.add_relay(relay).await?;
        }
        self.client.connect().await;

        // Add the account's own relay sets, honoring read/write policy:
        // events from write-only relays are never read. With the
        // local-relays feature only the local development relays are used.
        if !cfg!(feature = "local-relays") {
            let nostr_relays =
                crate::relays::Relay::for_account(&account.pubkey, RelayType::Nostr, database)
                    .await
                    .unwrap_or_default();
            for relay in nostr_relays.iter() {
                match (relay.relay_meta.is_read(), relay.relay_meta.is_write()) {
                    (true, true) => {
                        self.client.add_relay(&relay.url).await?;
                    }
                    (true, false) => {
                        self.client.add_read_relay(&relay.url).await?;
                    }
                    (false, true) => {
                        self.client.add_write_relay(&relay.url).await?;
                    }
                    (false, false) => continue,
                }
                self.client.connect_relay(&relay.url).await?;
            }

            let inbox_relays = account
                .relays(RelayType::Inbox, database)
                .await
                .unwrap_or_default();
            for relay in inbox_relays.iter() {
                self.client.add_read_relay(relay).await?;
                self.client.connect_relay(relay).await?;
            }

            let key_package_relays = account
                .relays(RelayType::KeyPackage, database)
                .await
                .unwrap_or_default();
            for relay in key_package_relays.iter() {
                self.client.add_relay(relay).await?;
                self.client.connect_relay(relay).await?;
            }
        }

        tracing::debug!(
            target: "murmur::nostr_manager::set_nostr_identity",
            "Connected to relays: {:?}",
            self.client
                .relays()
                .await
                .keys()
                .map(|url| url.to_string())
                .collect::<Vec<_>>()
        );

        Ok(())
    }

    pub async fn delete_all_data(&self) -> Result<()> {
        tracing::debug!(
            target: "murmur::nostr_manager::delete_all_data",
            "Deleting Nostr data"
        );
        self.client.reset().await?;
        Ok(())
    }
}
