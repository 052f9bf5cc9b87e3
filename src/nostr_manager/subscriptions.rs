//! Subscription functions for NostrManager
//! Installs the standing subscriptions for an identity and feeds the
//! notification stream into the inbox pipeline.

use nostr_sdk::prelude::*;

use crate::nostr_manager::event_processor::classify;
use crate::nostr_manager::{NostrManager, Result};

const MLS_MESSAGES_SUB: &str = "mls_messages";

impl NostrManager {
    async fn subscribe_metadata(&self, pubkey: PublicKey) -> Result<Output<SubscriptionId>> {
        let metadata_filter = Filter::new()
            .kind(Kind::Metadata)
            .author(pubkey)
            .since(Timestamp::now());

        Ok(self.client.subscribe(vec![metadata_filter], None).await?)
    }

    async fn subscribe_relay_lists(&self, pubkey: PublicKey) -> Result<Output<SubscriptionId>> {
        let relay_list_filter = Filter::new()
            .kinds(vec![
                Kind::RelayList,
                Kind::InboxRelays,
                Kind::MlsKeyPackageRelays,
            ])
            .author(pubkey)
            .since(Timestamp::now());

        Ok(self.client.subscribe(vec![relay_list_filter], None).await?)
    }

    /// Informational: other users' key package publishes addressed to us.
    async fn subscribe_key_packages(&self, pubkey: PublicKey) -> Result<Output<SubscriptionId>> {
        let key_package_filter = Filter::new()
            .kind(Kind::MlsKeyPackage)
            .pubkey(pubkey)
            .since(Timestamp::now());

        Ok(self.client.subscribe(vec![key_package_filter], None).await?)
    }

    /// Gift-wrapped welcomes (and legacy NIP-17 traffic) addressed to us.
    async fn subscribe_giftwraps(&self, pubkey: PublicKey) -> Result<Output<SubscriptionId>> {
        // This is a hack to get the client to do the initial authenticate on
        // relays that require it.
        // https://github.com/rust-nostr/nostr/issues/509
        let null_filter = Filter::new().kind(Kind::GiftWrap).pubkey(pubkey).limit(0);
        self.client
            .fetch_events(vec![null_filter], self.timeout().await)
            .await?;

        let giftwrap_filter = Filter::new()
            .kind(Kind::GiftWrap)
            .pubkey(pubkey)
            .since(Timestamp::now());

        Ok(self.client.subscribe(vec![giftwrap_filter], None).await?)
    }

    /// Legacy kind 4 DMs, rendered read-only.
    async fn subscribe_legacy_dms(&self, pubkey: PublicKey) -> Result<Output<SubscriptionId>> {
        let legacy_filter = Filter::new()
            .kind(Kind::EncryptedDirectMessage)
            .pubkey(pubkey)
            .since(Timestamp::now());

        Ok(self.client.subscribe(vec![legacy_filter], None).await?)
    }

    /// MLS group traffic scoped by the `h` tags of all joined groups. Kept
    /// under a fixed id so joining a group replaces the old filter.
    pub async fn subscribe_mls_group_messages(&self, group_ids: Vec<String>) -> Result<Output<()>> {
        let sub_id = SubscriptionId::new(MLS_MESSAGES_SUB);
        let mls_message_filter = Filter::new()
            .kind(Kind::MlsGroupMessage)
            .custom_tag(SingleLetterTag::lowercase(Alphabet::H), group_ids)
            .since(Timestamp::now());

        Ok(self
            .client
            .subscribe_with_id(sub_id, vec![mls_message_filter], None)
            .await?)
    }

    /// Installs every standing subscription for an identity. The underlying
    /// pool re-installs them automatically on reconnect.
    pub async fn setup_subscriptions(
        &self,
        pubkey: PublicKey,
        nostr_group_ids: Vec<String>,
    ) -> Result<()> {
        self.subscribe_metadata(pubkey).await?;
        self.subscribe_relay_lists(pubkey).await?;
        self.subscribe_key_packages(pubkey).await?;
        self.subscribe_giftwraps(pubkey).await?;
        self.subscribe_legacy_dms(pubkey).await?;

        if !nostr_group_ids.is_empty() {
            self.subscribe_mls_group_messages(nostr_group_ids).await?;
        }

        Ok(())
    }

    /// Drains pool notifications into the inbox pipeline until shutdown.
    pub async fn handle_notifications(&self) -> Result<()> {
        if let Err(e) = self
            .client
            .handle_notifications(|notification| async {
                match notification {
                    RelayPoolNotification::Event { event, .. } => {
                        self.handle_event(*event)?;
                        Ok(false)
                    }
                    RelayPoolNotification::Message { relay_url, message } => {
                        self.handle_message(relay_url, message)?;
                        Ok(false)
                    }
                    RelayPoolNotification::Shutdown => {
                        self.handle_shutdown()?;
                        Ok(true)
                    }
                    _ => {
                        tracing::debug!(
                            target: "murmur::nostr_manager::subscriptions::handle_notifications",
                            "Received unknown notification: {:?}",
                            notification
                        );
                        Ok(false)
                    }
                }
            })
            .await
        {
            tracing::error!(
                target: "murmur::nostr_manager::subscriptions::handle_notifications",
                "Notification handler error: {:?}",
                e
            );
        }

        Ok(())
    }

    fn handle_event(&self, event: Event) -> Result<()> {
        tracing::debug!(
            target: "murmur::nostr_manager::subscriptions::handle_event",
            "Received event: {:?}",
            event.id
        );
        if let Some(processable) = classify(event) {
            self.event_processor.queue_event(processable);
        }
        Ok(())
    }

    fn handle_message(&self, relay_url: RelayUrl, message: RelayMessage) -> Result<()> {
        let variant_name = match message {
            RelayMessage::Event { .. } => "Event",
            RelayMessage::Ok { .. } => "Ok",
            RelayMessage::Notice { .. } => "Notice",
            RelayMessage::Closed { .. } => "Closed",
            RelayMessage::EndOfStoredEvents(_) => "EndOfStoredEvents",
            RelayMessage::Auth { .. } => "Auth",
            RelayMessage::Count { .. } => "Count",
            RelayMessage::NegMsg { .. } => "NegMsg",
            RelayMessage::NegErr { .. } => "NegErr",
        };
        tracing::debug!(
            target: "murmur::nostr_manager::subscriptions::handle_message",
            "Received message from {}: {}",
            relay_url,
            variant_name
        );
        Ok(())
    }

    fn handle_shutdown(&self) -> Result<()> {
        tracing::debug!(
            target: "murmur::nostr_manager::subscriptions::handle_shutdown",
            "Relay pool shutdown"
        );
        Ok(())
    }
}
