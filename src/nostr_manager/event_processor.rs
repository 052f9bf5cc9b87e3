//! The inbox pipeline: a bounded queue of validated inbound events,
//! deduplicated and dispatched to the invite manager, the MLS engine, or the
//! transcript. Delivery is at-least-once; everything downstream is
//! idempotent.

use lru::LruCache;
use nostr_sdk::prelude::*;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::Notify;

use crate::accounts::{Account, AccountError};
use crate::events;
use crate::groups::{Group, GroupError, GroupState};
use crate::invites::{Invite, InviteError, InviteState, ProcessedInvite, ProcessedInviteState};
use crate::key_packages::{self, KeyPackageError};
use crate::messages::{Message, MessageError, ProcessedMessage, ProcessedMessageState};
use crate::nostr_mls::messages::ProcessMessageResult;
use crate::nostr_mls::NostrMlsError;
use crate::relays::{Relay, RelayType};
use crate::signals::Signal;
use crate::Murmur;

/// Bounded intake queue. On overflow the oldest event is dropped.
pub const QUEUE_CAPACITY: usize = 1024;
/// In-memory dedup window; the persistent seen set backs it.
pub const SEEN_CACHE_CAPACITY: usize = 16_384;

/// How many past epochs we try when unwrapping the outer NIP-44 layer of a
/// group message. Senders can be slightly behind after a commit races a
/// message.
const EPOCH_LOOKBEHIND: u64 = 2;

#[derive(Error, Debug)]
pub enum EventProcessorError {
    #[error("Error getting account")]
    NoAccount(#[from] AccountError),
    #[error("Error decoding hex")]
    UndecodableHex(#[from] nostr_sdk::util::hex::Error),
    #[error("Error saving invite: {0}")]
    BadInvite(#[from] InviteError),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Key package error: {0}")]
    KeyPackage(#[from] KeyPackageError),
    #[error("Group error: {0}")]
    Group(#[from] GroupError),
    #[error("NIP44 encryption error: {0}")]
    Encryption(#[from] nostr_sdk::nips::nip44::Error),
    #[error("MLS error: {0}")]
    Mls(#[from] NostrMlsError),
    #[error("Key parsing error: {0}")]
    UnparseableKey(#[from] nostr_sdk::key::Error),
    #[error("Message error: {0}")]
    Message(#[from] MessageError),
    #[error("Secrets store error: {0}")]
    SecretsStore(#[from] crate::secrets_store::SecretsStoreError),
}

pub type Result<T> = std::result::Result<T, EventProcessorError>;

#[derive(Debug, Clone)]
pub enum ProcessableEvent {
    GiftWrap(Event),
    MlsMessage(Event),
    LegacyDm(Event),
    RelayList(Event),
}

impl ProcessableEvent {
    fn event(&self) -> &Event {
        match self {
            ProcessableEvent::GiftWrap(event) => event,
            ProcessableEvent::MlsMessage(event) => event,
            ProcessableEvent::LegacyDm(event) => event,
            ProcessableEvent::RelayList(event) => event,
        }
    }
}

#[derive(Debug)]
pub struct EventProcessor {
    queue: Mutex<VecDeque<ProcessableEvent>>,
    notify: Notify,
    queue_dropped: AtomicU64,
    seen_cache: Mutex<LruCache<String, ()>>,
}

impl Default for EventProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl EventProcessor {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            queue_dropped: AtomicU64::new(0),
            seen_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(SEEN_CACHE_CAPACITY).unwrap(),
            )),
        }
    }

    /// Admits an inbound event: signature verified, queued with drop-oldest
    /// backpressure.
    pub fn queue_event(&self, processable: ProcessableEvent) {
        if events::verify_event(processable.event()).is_err() {
            tracing::warn!(
                target: "murmur::nostr_manager::event_processor::queue_event",
                "Dropping event with invalid signature: {}",
                processable.event().id
            );
            return;
        }

        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= QUEUE_CAPACITY {
            queue.pop_front();
            self.queue_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                target: "murmur::nostr_manager::event_processor::queue_event",
                "Inbound queue overflow, dropped oldest event"
            );
        }
        queue.push_back(processable);
        drop(queue);
        self.notify.notify_one();
    }

    pub fn queue_dropped_count(&self) -> u64 {
        self.queue_dropped.load(Ordering::Relaxed)
    }

    async fn next_event(&self) -> ProcessableEvent {
        loop {
            if let Some(event) = self.queue.lock().unwrap().pop_front() {
                return event;
            }
            self.notify.notified().await;
        }
    }

    /// Clears any queued events. Used on account switch.
    pub fn clear_queue(&self) {
        self.queue.lock().unwrap().clear();
    }

    /// At-least-once dedup: in-memory LRU in front of the persistent seen
    /// set. Returns true when the event was already seen for this account.
    async fn check_and_mark_seen(
        &self,
        murmur: &Murmur,
        account_pubkey: &str,
        event_id: &EventId,
    ) -> Result<bool> {
        let cache_key = format!("{}:{}", account_pubkey, event_id);
        {
            let mut cache = self.seen_cache.lock().unwrap();
            if cache.put(cache_key, ()).is_some() {
                return Ok(true);
            }
        }

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT event_id FROM seen_events WHERE account_pubkey = ? AND event_id = ?",
        )
        .bind(account_pubkey)
        .bind(event_id.to_string())
        .fetch_optional(&murmur.database.pool)
        .await?;
        if existing.is_some() {
            return Ok(true);
        }

        sqlx::query(
            "INSERT OR IGNORE INTO seen_events (account_pubkey, event_id, seen_at) VALUES (?, ?, ?)",
        )
        .bind(account_pubkey)
        .bind(event_id.to_string())
        .bind(Timestamp::now().as_u64() as i64)
        .execute(&murmur.database.pool)
        .await?;
        let _ = murmur.database.trim_seen_events(account_pubkey).await;
        Ok(false)
    }

    /// The processing loop. Spawned once by [`Murmur::start`]; exits on
    /// shutdown.
    pub async fn run(murmur: Arc<Murmur>) {
        let shutdown = murmur.shutdown.clone();
        loop {
            let processable = tokio::select! {
                processable = murmur.nostr.event_processor.next_event() => processable,
                _ = shutdown.cancelled() => {
                    tracing::debug!(
                        target: "murmur::nostr_manager::event_processor::run",
                        "Shutting down event processor"
                    );
                    break;
                }
            };

            let account = match Account::get_active(&murmur.database).await {
                Ok(account) => account,
                Err(_) => continue,
            };

            let outer_id = processable.event().id;
            match murmur
                .nostr
                .event_processor
                .check_and_mark_seen(&murmur, &account.pubkey, &outer_id)
                .await
            {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        target: "murmur::nostr_manager::event_processor::run",
                        "Dedup check failed: {}",
                        e
                    );
                    continue;
                }
            }

            let result = match processable {
                ProcessableEvent::GiftWrap(event) => {
                    Self::process_giftwrap(&murmur, &account, event).await
                }
                ProcessableEvent::MlsMessage(event) => {
                    Self::process_mls_message(&murmur, &account, event).await
                }
                ProcessableEvent::LegacyDm(event) => {
                    Self::process_legacy_dm(&murmur, &account, event).await
                }
                ProcessableEvent::RelayList(event) => {
                    Self::process_relay_list(&murmur, &account, event).await
                }
            };
            if let Err(e) = result {
                tracing::error!(
                    target: "murmur::nostr_manager::event_processor::run",
                    "Error processing event: {}",
                    e
                );
            }
        }
    }

    async fn process_giftwrap(murmur: &Murmur, account: &Account, event: Event) -> Result<()> {
        let keys = account.keys(&murmur.secrets)?;
        if let Ok(unwrapped) = extract_rumor(&keys, &event).await {
            match unwrapped.rumor.kind {
                Kind::MlsWelcome => {
                    Self::process_invite(murmur, account, event, unwrapped.rumor).await?;
                }
                Kind::PrivateDirectMessage => {
                    // Legacy NIP-17 DM: read-only, flagged insecure.
                    Self::save_legacy_entry(murmur, account, unwrapped.rumor).await?;
                }
                _ => {
                    tracing::debug!(
                        target: "murmur::nostr_manager::event_processor::process_giftwrap",
                        "Received unhandled giftwrap of kind {:?}",
                        unwrapped.rumor.kind
                    );
                }
            }
        }
        Ok(())
    }

    async fn process_invite(
        murmur: &Murmur,
        account: &Account,
        outer_event: Event,
        rumor_event: UnsignedEvent,
    ) -> Result<()> {
        let mut rumor_event = rumor_event;
        rumor_event.ensure_id();
        let welcome_event_id = rumor_event.id.expect("id ensured above").to_string();

        // The ledger is consulted before any welcome processing attempt
        if ProcessedInvite::find_by_welcome_event_id(
            &account.pubkey,
            &welcome_event_id,
            &murmur.database,
        )
        .await?
        .is_some()
        {
            return Ok(());
        }
        if Invite::find_by_id(&account.pubkey, &welcome_event_id, &murmur.database)
            .await
            .is_ok()
        {
            // Already surfaced as a pending invite; nothing new to do.
            return Ok(());
        }

        let hex_content = match hex::decode(&rumor_event.content) {
            Ok(content) => content,
            Err(e) => {
                let error_string = format!("Error hex decoding welcome event: {:?}", e);
                let processed_invite = ProcessedInvite::create_with_state_and_reason(
                    &account.pubkey,
                    &welcome_event_id,
                    &welcome_event_id,
                    ProcessedInviteState::Failed,
                    error_string.clone(),
                    &murmur.database,
                )
                .await?;
                tracing::error!(target: "murmur::nostr_manager::event_processor::process_invite", "{}", error_string);
                murmur.signals.emit(Signal::InviteFailedToProcess {
                    processed: processed_invite,
                });
                return Ok(());
            }
        };

        let welcome_preview = match murmur.nostr_mls.preview_welcome_event(hex_content) {
            Ok(preview) => preview,
            Err(e) => {
                let error_string = format!("Error decrypting welcome event: {:?}", e);
                let processed_invite = ProcessedInvite::create_with_state_and_reason(
                    &account.pubkey,
                    &welcome_event_id,
                    &welcome_event_id,
                    ProcessedInviteState::Failed,
                    error_string.clone(),
                    &murmur.database,
                )
                .await?;
                tracing::error!(target: "murmur::nostr_manager::event_processor::process_invite", "{}", error_string);
                murmur.signals.emit(Signal::InviteFailedToProcess {
                    processed: processed_invite,
                });
                return Ok(());
            }
        };

        let nostr_group_id = welcome_preview.nostr_group_data.nostr_group_id();
        let invite = Invite {
            event_id: welcome_event_id.clone(),
            account_pubkey: account.pubkey.clone(),
            event: rumor_event.clone(),
            mls_group_id: welcome_preview
                .staged_welcome
                .group_context()
                .group_id()
                .to_vec(),
            nostr_group_id: nostr_group_id.clone(),
            group_name: welcome_preview.nostr_group_data.name(),
            group_description: welcome_preview.nostr_group_data.description(),
            group_admin_pubkeys: welcome_preview.nostr_group_data.admin_pubkeys(),
            group_relays: welcome_preview.nostr_group_data.relays(),
            inviter: rumor_event.pubkey.to_hex(),
            member_count: welcome_preview.staged_welcome.members().count() as u32,
            state: InviteState::Pending,
            outer_event_id: outer_event.id.to_string(),
        };

        // Welcomes for groups we already joined are auto-accepted
        // idempotently: the ledger answers without reapplying.
        if Group::get_by_nostr_group_id(&nostr_group_id, &murmur.database)
            .await
            .is_ok()
        {
            let mut invite = invite;
            invite.state = InviteState::Accepted;
            invite.save(&murmur.database).await?;
            ProcessedInvite::create_with_state_and_reason(
                &account.pubkey,
                &welcome_event_id,
                &welcome_event_id,
                ProcessedInviteState::Processed,
                "group already joined".to_string(),
                &murmur.database,
            )
            .await?;
            return Ok(());
        }

        invite.save(&murmur.database).await?;

        murmur.signals.emit(Signal::InviteProcessed {
            invite: invite.clone(),
        });

        // The welcome's `e` tag names the key package it consumed: retire it
        // from the relays and publish a replacement.
        let key_package_event_id = events::first_e_tag(&rumor_event.tags);
        if let Some(key_package_event_id) = key_package_event_id {
            if let Err(e) =
                key_packages::mark_consumed(&account.pubkey, &key_package_event_id, &murmur.database)
                    .await
            {
                tracing::debug!(
                    target: "murmur::nostr_manager::event_processor::process_invite",
                    "Key package already consumed: {}",
                    e
                );
            }
            let key_package_relays = account.relays(RelayType::KeyPackage, &murmur.database).await?;
            if let Err(e) = key_packages::delete_key_package_from_relays(
                murmur,
                &key_package_event_id,
                &key_package_relays,
                false, // Keep the private material until the welcome is accepted
            )
            .await
            {
                tracing::warn!(
                    target: "murmur::nostr_manager::event_processor::process_invite",
                    "Failed to delete used key package from relays: {}",
                    e
                );
            }
            if let Err(e) = key_packages::publish_key_package(murmur).await {
                tracing::warn!(
                    target: "murmur::nostr_manager::event_processor::process_invite",
                    "Failed to publish replacement key package: {}",
                    e
                );
            }
        }

        Ok(())
    }

    /// Decrypts the outer NIP-44 layer of a kind 445 wrapper with the stored
    /// exporter secret, walking back a couple of epochs for late senders.
    async fn decrypt_wrapper(
        murmur: &Murmur,
        group: &Group,
        event: &Event,
    ) -> Option<Vec<u8>> {
        let newest = group.epoch;
        let oldest = newest.saturating_sub(EPOCH_LOOKBEHIND);
        for epoch in (oldest..=newest).rev() {
            if let Ok(keys) = murmur
                .secrets
                .get_export_secret_keys_for_group(&group.mls_group_id, epoch)
            {
                if let Ok(decrypted) = nip44::decrypt_to_bytes(
                    keys.secret_key(),
                    &keys.public_key(),
                    &event.content,
                ) {
                    return Some(decrypted);
                }
            }
        }

        // Secrets store may be cold (first message after a restore): fall
        // back to the engine's current exporter secret.
        if let Ok((secret_hex, epoch)) = murmur
            .nostr_mls
            .exporter_secret_hex_and_epoch(&group.mls_group_id)
        {
            let _ = murmur
                .secrets
                .store_mls_export_secret(&group.mls_group_id, epoch, &secret_hex);
            if let Ok(keys) = Keys::parse(&secret_hex) {
                if let Ok(decrypted) = nip44::decrypt_to_bytes(
                    keys.secret_key(),
                    &keys.public_key(),
                    &event.content,
                ) {
                    return Some(decrypted);
                }
            }
        }
        None
    }

    pub(crate) async fn process_mls_message(
        murmur: &Murmur,
        account: &Account,
        event: Event,
    ) -> Result<()> {
        // Consumer-side idempotency for at-least-once delivery
        if ProcessedMessage::find_by_event_id(
            &account.pubkey,
            &event.id.to_string(),
            &murmur.database,
        )
        .await?
        .is_some()
        {
            return Ok(());
        }

        let Some(group_id_tag) = events::h_tag(&event.tags) else {
            tracing::debug!(
                target: "murmur::nostr_manager::event_processor::process_mls_message",
                "Group message without h tag, ignoring"
            );
            return Ok(());
        };

        let mut group = match Group::get_by_nostr_group_id(&group_id_tag, &murmur.database).await {
            Ok(group) => group,
            Err(GroupError::GroupNotFound) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if group.state == GroupState::Forked {
            tracing::debug!(
                target: "murmur::nostr_manager::event_processor::process_mls_message",
                "Ignoring traffic for forked group {}",
                group.nostr_group_id
            );
            return Ok(());
        }

        // Per-group exclusive section: one consumer mutates MLS state at a time
        let lock = murmur.nostr_mls.group_lock(&group.mls_group_id);
        let _guard = lock.lock().await;

        let Some(decrypted_content) = Self::decrypt_wrapper(murmur, &group, &event).await else {
            // Likely encrypted to an epoch ahead of ours; park it until the
            // commit arrives.
            murmur
                .nostr_mls
                .buffer_out_of_epoch(&group.mls_group_id, event);
            group
                .set_state(GroupState::EpochBuffered, &account.pubkey, &murmur.database)
                .await?;
            return Ok(());
        };

        let process_result = murmur
            .nostr_mls
            .process_message_for_group(&group.mls_group_id, &decrypted_content);

        match process_result {
            Ok(ProcessMessageResult::ApplicationMessage(json_event)) => {
                let members = murmur.nostr_mls.member_pubkeys(&group.mls_group_id)?;
                if !members.contains(&json_event.pubkey.to_hex()) {
                    tracing::error!(
                        target: "murmur::nostr_manager::event_processor::process_mls_message",
                        "Message from non-member: {:?}",
                        json_event.pubkey
                    );
                    ProcessedMessage::create_with_state_and_reason(
                        &account.pubkey,
                        &event.id.to_string(),
                        json_event.id.map(|id| id.to_string()),
                        ProcessedMessageState::Failed,
                        "Message from non-member".to_string(),
                        &murmur.database,
                    )
                    .await?;
                    return Ok(());
                }

                Message::save(
                    &account.pubkey,
                    &group.mls_group_id,
                    &event.id.to_string(),
                    &json_event,
                    &murmur.database,
                )
                .await?;
                ProcessedMessage::create_with_state_and_reason(
                    &account.pubkey,
                    &event.id.to_string(),
                    json_event.id.map(|id| id.to_string()),
                    ProcessedMessageState::Processed,
                    "".to_string(),
                    &murmur.database,
                )
                .await?;

                murmur.signals.emit(Signal::MlsMessageReceived {
                    group_id: group.mls_group_id.clone(),
                    event: json_event.clone(),
                });
                murmur.signals.emit(Signal::MlsMessageProcessed {
                    group: group.clone(),
                    event: json_event,
                });
            }
            Ok(ProcessMessageResult::Commit {
                new_epoch,
                new_exporter_secret_hex,
            }) => {
                murmur.secrets.store_mls_export_secret(
                    &group.mls_group_id,
                    new_epoch,
                    &new_exporter_secret_hex,
                )?;
                group
                    .set_epoch(new_epoch, &account.pubkey, &murmur.database)
                    .await?;
                murmur
                    .persist_mls_snapshot(&group.mls_group_id, new_epoch)
                    .await?;
                ProcessedMessage::create_with_state_and_reason(
                    &account.pubkey,
                    &event.id.to_string(),
                    None,
                    ProcessedMessageState::Processed,
                    "commit".to_string(),
                    &murmur.database,
                )
                .await?;

                // Members may have changed; DM groups can collapse to Closed
                // when we were removed.
                let members = murmur.nostr_mls.member_pubkeys(&group.mls_group_id)?;
                if !members.contains(&account.pubkey) {
                    group
                        .set_state(GroupState::Closed, &account.pubkey, &murmur.database)
                        .await?;
                }

                // Retry traffic that raced ahead of this commit, in its
                // original (created_at, id) order.
                let buffered = murmur.nostr_mls.take_buffered(&group.mls_group_id);
                drop(_guard);
                for buffered_event in buffered {
                    Box::pin(Self::process_mls_message(murmur, account, buffered_event)).await?;
                }

                // Replays can re-buffer traffic that is still a further
                // epoch ahead; only an empty buffer ends the buffered state.
                if murmur.nostr_mls.buffered_count(&group.mls_group_id) == 0 {
                    let mut group =
                        Group::find_by_mls_group_id(&group.mls_group_id, &murmur.database).await?;
                    if group.state == GroupState::EpochBuffered {
                        group
                            .set_state(GroupState::Active, &account.pubkey, &murmur.database)
                            .await?;
                    }
                }
            }
            Ok(ProcessMessageResult::Proposal) => {
                ProcessedMessage::create_with_state_and_reason(
                    &account.pubkey,
                    &event.id.to_string(),
                    None,
                    ProcessedMessageState::Processed,
                    "proposal stored".to_string(),
                    &murmur.database,
                )
                .await?;
            }
            Ok(ProcessMessageResult::StaleCommitIgnored) => {
                ProcessedMessage::create_with_state_and_reason(
                    &account.pubkey,
                    &event.id.to_string(),
                    None,
                    ProcessedMessageState::Processed,
                    "stale commit ignored".to_string(),
                    &murmur.database,
                )
                .await?;
            }
            Err(NostrMlsError::CannotDecryptOwnMessage) => {
                // Our own send path already stored the message
                ProcessedMessage::create_with_state_and_reason(
                    &account.pubkey,
                    &event.id.to_string(),
                    None,
                    ProcessedMessageState::Processed,
                    "own message".to_string(),
                    &murmur.database,
                )
                .await?;
            }
            Err(NostrMlsError::FutureEpoch { .. }) => {
                murmur
                    .nostr_mls
                    .buffer_out_of_epoch(&group.mls_group_id, event);
                group
                    .set_state(GroupState::EpochBuffered, &account.pubkey, &murmur.database)
                    .await?;
            }
            Err(NostrMlsError::Fork) => {
                tracing::error!(
                    target: "murmur::nostr_manager::event_processor::process_mls_message",
                    "Group {} forked",
                    group.nostr_group_id
                );
                group
                    .set_state(GroupState::Forked, &account.pubkey, &murmur.database)
                    .await?;
                ProcessedMessage::create_with_state_and_reason(
                    &account.pubkey,
                    &event.id.to_string(),
                    None,
                    ProcessedMessageState::Failed,
                    "group forked".to_string(),
                    &murmur.database,
                )
                .await?;
            }
            Err(e) => {
                let error_string = format!("Error processing message for group: {}", e);
                tracing::error!(
                    target: "murmur::nostr_manager::event_processor::process_mls_message",
                    "{}",
                    error_string
                );
                ProcessedMessage::create_with_state_and_reason(
                    &account.pubkey,
                    &event.id.to_string(),
                    None,
                    ProcessedMessageState::Failed,
                    error_string,
                    &murmur.database,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Legacy kind 4 traffic: appended to the transcript read-only, never
    /// decrypted, never handed to the MLS engine.
    async fn process_legacy_dm(murmur: &Murmur, account: &Account, event: Event) -> Result<()> {
        let tagged_pubkey = events::first_p_tag(&event.tags);
        let account_pubkey = PublicKey::from_hex(&account.pubkey)?;
        if tagged_pubkey != Some(account_pubkey) && event.pubkey != account_pubkey {
            return Ok(());
        }

        let mut rumor = UnsignedEvent::new(
            event.pubkey,
            event.created_at,
            event.kind,
            event.tags.to_vec(),
            event.content.clone(),
        );
        rumor.ensure_id();
        Self::save_legacy_entry(murmur, account, rumor).await
    }

    /// Legacy DMs have no MLS group; they are filed under a synthetic
    /// per-peer transcript id so the UI can render the old thread.
    async fn save_legacy_entry(
        murmur: &Murmur,
        account: &Account,
        rumor: UnsignedEvent,
    ) -> Result<()> {
        let account_pubkey = PublicKey::from_hex(&account.pubkey)?;
        let peer = if rumor.pubkey == account_pubkey {
            events::first_p_tag(&rumor.tags).unwrap_or(rumor.pubkey)
        } else {
            rumor.pubkey
        };
        let mut legacy_group_id = b"legacy:".to_vec();
        legacy_group_id.extend_from_slice(&peer.to_bytes());

        Message::save(
            &account.pubkey,
            &legacy_group_id,
            "",
            &rumor,
            &murmur.database,
        )
        .await?;
        Ok(())
    }

    /// Relay list events (10002/10050/10051) from the account itself update
    /// the stored relay sets.
    async fn process_relay_list(murmur: &Murmur, account: &Account, event: Event) -> Result<()> {
        if event.pubkey.to_hex() != account.pubkey {
            return Ok(());
        }
        let Some(relay_type) = RelayType::from_kind(event.kind) else {
            return Ok(());
        };
        let relays = Relay::parse_relay_list_event(&event);
        if let Err(e) =
            Relay::replace_for_account(&account.pubkey, relay_type, &relays, &murmur.database).await
        {
            tracing::warn!(
                target: "murmur::nostr_manager::event_processor::process_relay_list",
                "Failed to store relay list: {}",
                e
            );
        }
        Ok(())
    }
}

// Keep the variants exhaustively matched at classification time; unknown
// kinds never enter the queue.
pub(crate) fn classify(event: Event) -> Option<ProcessableEvent> {
    match event.kind {
        Kind::GiftWrap => Some(ProcessableEvent::GiftWrap(event)),
        Kind::MlsGroupMessage => Some(ProcessableEvent::MlsMessage(event)),
        Kind::EncryptedDirectMessage => Some(ProcessableEvent::LegacyDm(event)),
        Kind::RelayList | Kind::InboxRelays | Kind::MlsKeyPackageRelays => {
            Some(ProcessableEvent::RelayList(event))
        }
        Kind::MlsKeyPackage => {
            // Informational; key packages are fetched on demand
            None
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn signed_event(kind: Kind, content: &str) -> Event {
        let keys = Keys::generate();
        EventBuilder::new(kind, content)
            .sign(&keys)
            .await
            .expect("Failed to sign")
    }

    #[tokio::test]
    async fn test_queue_drops_oldest_on_overflow() {
        let processor = EventProcessor::new();
        for _ in 0..(QUEUE_CAPACITY + 5) {
            let event = signed_event(Kind::MlsGroupMessage, "x").await;
            processor.queue_event(ProcessableEvent::MlsMessage(event));
        }
        assert_eq!(processor.queue_dropped_count(), 5);
        assert_eq!(processor.queue.lock().unwrap().len(), QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn test_queue_rejects_invalid_signature() {
        let processor = EventProcessor::new();
        let event = signed_event(Kind::MlsGroupMessage, "valid").await;
        let mut json: serde_json::Value =
            serde_json::from_str(&event.as_json()).expect("Failed to parse");
        json["content"] = serde_json::json!("tampered");
        let tampered = Event::from_json(json.to_string()).expect("Failed to rebuild");

        processor.queue_event(ProcessableEvent::MlsMessage(tampered));
        assert!(processor.queue.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_classify_dispatches_by_kind() {
        let giftwrap = signed_event(Kind::GiftWrap, "").await;
        assert!(matches!(
            classify(giftwrap),
            Some(ProcessableEvent::GiftWrap(_))
        ));

        let mls = signed_event(Kind::MlsGroupMessage, "").await;
        assert!(matches!(
            classify(mls),
            Some(ProcessableEvent::MlsMessage(_))
        ));

        let legacy = signed_event(Kind::EncryptedDirectMessage, "").await;
        assert!(matches!(
            classify(legacy),
            Some(ProcessableEvent::LegacyDm(_))
        ));

        let relay_list = signed_event(Kind::RelayList, "").await;
        assert!(matches!(
            classify(relay_list),
            Some(ProcessableEvent::RelayList(_))
        ));

        let unknown = signed_event(Kind::TextNote, "").await;
        assert!(classify(unknown).is_none());
    }
}
