use nostr_sdk::prelude::*;
use std::ops::Add;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::accounts::Account;
use crate::commands::{CommandError, Result};
use crate::events;
use crate::groups::{Group, GroupState, GroupType, GroupWithRelays};
use crate::key_packages::{self, MemberKeyPackage};
use crate::message_aggregator::{self, ChatMessage};
use crate::messages::Message;
use crate::nostr_mls::groups::PendingCommitResult;
use crate::signals::Signal;
use crate::Murmur;

/// Welcome fan-out retries per member before the whole create fails.
const WELCOME_PUBLISH_ATTEMPTS: u32 = 5;

/// Gets all MLS groups that the active account is a member of.
pub async fn get_groups(murmur: &Murmur) -> Result<Vec<Group>> {
    Ok(Group::get_all_groups(&murmur.database).await?)
}

/// Gets a single MLS group with the relays it publishes on.
pub async fn get_group(group_id: &str, murmur: &Murmur) -> Result<GroupWithRelays> {
    let mls_group_id =
        hex::decode(group_id).map_err(|e| CommandError::new("GroupNotFound", e))?;
    let group = Group::find_by_mls_group_id(&mls_group_id, &murmur.database).await?;
    let relays = group.relays(&murmur.database).await?;
    Ok(GroupWithRelays { group, relays })
}

/// Gets a group together with its aggregated transcript (deleted entries
/// hidden).
pub async fn get_group_and_messages(
    group_id: &str,
    murmur: &Murmur,
) -> Result<(Group, Vec<ChatMessage>)> {
    let account = Account::get_active(&murmur.database).await?;
    let mls_group_id =
        hex::decode(group_id).map_err(|e| CommandError::new("GroupNotFound", e))?;
    let group = Group::find_by_mls_group_id(&mls_group_id, &murmur.database).await?;

    let events = Message::for_group(&account.pubkey, &mls_group_id, None, None, &murmur.database)
        .await?;
    let my_pubkey =
        PublicKey::from_hex(&account.pubkey).map_err(|e| CommandError::new("InvalidKey", e))?;
    let messages = message_aggregator::list_messages(&events, &my_pubkey, None);
    Ok((group, messages))
}

pub async fn get_group_members(group_id: &str, murmur: &Murmur) -> Result<Vec<String>> {
    let mls_group_id =
        hex::decode(group_id).map_err(|e| CommandError::new("GroupNotFound", e))?;
    // Ensure the group exists for this account before asking the engine
    Group::find_by_mls_group_id(&mls_group_id, &murmur.database).await?;
    Ok(murmur.nostr_mls.member_pubkeys(&mls_group_id)?)
}

pub async fn get_group_admins(group_id: &str, murmur: &Murmur) -> Result<Vec<String>> {
    let mls_group_id =
        hex::decode(group_id).map_err(|e| CommandError::new("GroupNotFound", e))?;
    let group = Group::find_by_mls_group_id(&mls_group_id, &murmur.database).await?;
    Ok(group.admin_pubkeys)
}

/// Creates a new MLS group with the given members and admins.
///
/// Fetches a fresh key package for every invitee, builds the group, then
/// fans the gift-wrapped welcome out to each invitee's inbox relays. A
/// two-member group is recorded as a direct message.
pub async fn create_group(
    creator_pubkey: String,
    member_pubkeys: Vec<String>,
    admin_pubkeys: Vec<String>,
    group_name: String,
    description: String,
    cancel: Option<CancellationToken>,
    murmur: &Arc<Murmur>,
) -> Result<Group> {
    let cancel = cancel.unwrap_or_else(|| murmur.shutdown.child_token());
    let active_account = Account::get_active(&murmur.database).await?;

    if active_account.pubkey != creator_pubkey {
        return Err(CommandError::new(
            "NoAccount",
            "You cannot create a group for another account",
        ));
    }

    Group::validate_group_members(&creator_pubkey, &member_pubkeys, &admin_pubkeys)?;

    let member_key_packages = key_packages::fetch_key_packages_for_members(&member_pubkeys, murmur)
        .await?;

    // TODO: Let the creator pick relays for the group
    let group_relays = murmur.nostr.relays().await;

    let create_result = murmur.nostr_mls.create_group(
        group_name,
        description,
        creator_pubkey.clone(),
        member_key_packages
            .iter()
            .map(|member| member.key_package.clone())
            .collect(),
        admin_pubkeys,
        group_relays,
    )?;

    // Fan the welcome out to every member; on failure or cancellation undo
    // the local group so no partial state survives.
    if let Err(e) = fan_out_welcomes(
        murmur,
        &member_key_packages,
        &create_result.serialized_welcome_message,
        &cancel,
    )
    .await
    {
        let _ = murmur.nostr_mls.delete_group(&create_result.mls_group_id);
        return Err(e);
    }

    let group_type = if create_result.member_count == 2 {
        GroupType::DirectMessage
    } else {
        GroupType::Group
    };

    let group = Group::new(
        &active_account.pubkey,
        create_result.mls_group_id.clone(),
        create_result.epoch,
        group_type,
        &create_result.nostr_group_data,
        &murmur.database,
    )
    .await?;

    // Invitees' packages are single use; never pick them again
    for member in &member_key_packages {
        let _ = key_packages::mark_consumed(
            &active_account.pubkey,
            &member.event_id,
            &murmur.database,
        )
        .await;
    }

    // Seed the exporter secret and persist engine state for the new group
    let (secret_hex, epoch) = murmur
        .nostr_mls
        .exporter_secret_hex_and_epoch(&create_result.mls_group_id)?;
    murmur
        .secrets
        .store_mls_export_secret(&create_result.mls_group_id, epoch, &secret_hex)?;
    murmur
        .persist_mls_snapshot(&create_result.mls_group_id, epoch)
        .await?;

    // Widen the MLS traffic subscription to include the new group
    let group_ids = active_account.nostr_group_ids(&murmur.database).await?;
    murmur
        .nostr
        .subscribe_mls_group_messages(group_ids)
        .await
        .map_err(CommandError::from)?;

    Ok(group)
}

async fn fan_out_welcomes(
    murmur: &Murmur,
    member_key_packages: &[MemberKeyPackage],
    serialized_welcome_message: &[u8],
    cancel: &CancellationToken,
) -> Result<()> {
    let signer = murmur
        .nostr
        .client
        .signer()
        .await
        .map_err(|e| CommandError::new("Internal", e))?;

    for member in member_key_packages {
        let member_pubkey =
            PublicKey::from_hex(&member.pubkey).map_err(|e| CommandError::new("InvalidKey", e))?;
        let contact = murmur
            .nostr
            .query_enriched_contact(member_pubkey)
            .await
            .unwrap_or_default();

        let relay_urls: Vec<String> = if cfg!(feature = "local-relays") {
            vec!["ws://localhost:8080".to_string()]
        } else if !contact.inbox_relays.is_empty() {
            contact.inbox_relays
        } else {
            murmur.nostr.relays().await
        };

        let welcome_rumor =
            EventBuilder::new(Kind::MlsWelcome, hex::encode(serialized_welcome_message)).tags(
                vec![
                    Tag::from_standardized(TagStandard::Relays(
                        relay_urls
                            .iter()
                            .filter_map(|r| RelayUrl::parse(r).ok())
                            .map(Url::from)
                            .collect(),
                    )),
                    Tag::event(member.event_id),
                ],
            );

        // Expire the gift wrap a month out; consumed welcomes are useless
        let one_month_future = Timestamp::now().add(30 * 24 * 60 * 60);
        let wrapped_event = EventBuilder::gift_wrap(
            &signer,
            &member_pubkey,
            welcome_rumor,
            vec![Tag::expiration(one_month_future)],
        )
        .await
        .map_err(|e| CommandError::new("Internal", e))?;

        let mut attempts = 0;
        loop {
            let publish = murmur
                .nostr
                .publish_event_to(relay_urls.clone(), wrapped_event.clone());
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(CommandError::new("Cancelled", "Operation cancelled"));
                }
                result = publish => result,
            };
            match result {
                Ok(_) => {
                    tracing::debug!(
                        target: "murmur::commands::groups::create_group",
                        "Published welcome to {:?} on {:?}",
                        member_pubkey,
                        relay_urls
                    );
                    break;
                }
                Err(e) => {
                    attempts += 1;
                    tracing::error!(
                        target: "murmur::commands::groups::create_group",
                        "Failed to send welcome to {:?} (attempt {}): {:?}",
                        member_pubkey,
                        attempts,
                        e
                    );
                    if attempts >= WELCOME_PUBLISH_ATTEMPTS {
                        return Err(e.into());
                    }
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }
    Ok(())
}

/// Encrypts and publishes an application message into a group. Inserts an
/// optimistic temp transcript entry that is replaced once a relay
/// acknowledges the signed wrapper.
pub async fn send_mls_message(
    group: Group,
    message: String,
    kind: Option<u16>,
    tags: Option<Vec<Tag>>,
    cancel: Option<CancellationToken>,
    murmur: &Murmur,
) -> Result<UnsignedEvent> {
    group.ensure_can_send()?;
    let cancel = cancel.unwrap_or_else(|| murmur.shutdown.child_token());

    let account = Account::get_active(&murmur.database).await?;
    let keys = account.keys(&murmur.secrets)?;
    let kind = kind.unwrap_or(9);

    let inner_event = create_unsigned_nostr_event(keys.public_key(), message, kind, tags);
    let json_event_string =
        serde_json::to_string(&inner_event).map_err(|e| CommandError::new("Internal", e))?;

    Message::save_temp(
        &account.pubkey,
        &group.mls_group_id,
        &inner_event,
        &murmur.database,
    )
    .await?;

    // Per-group exclusive section: sends serialize with inbound processing
    let lock = murmur.nostr_mls.group_lock(&group.mls_group_id);
    let _guard = lock.lock().await;

    let serialized_message = murmur
        .nostr_mls
        .create_message_for_group(&group.mls_group_id, &json_event_string)?;

    let (export_secret_hex, epoch) = murmur
        .nostr_mls
        .exporter_secret_hex_and_epoch(&group.mls_group_id)?;
    murmur
        .secrets
        .store_mls_export_secret(&group.mls_group_id, epoch, &export_secret_hex)?;

    let export_nostr_keys =
        Keys::parse(&export_secret_hex).map_err(|e| CommandError::new("Internal", e))?;

    let encrypted_content = nip44::encrypt(
        export_nostr_keys.secret_key(),
        &export_nostr_keys.public_key(),
        &serialized_message,
        nip44::Version::V2,
    )
    .map_err(|e| CommandError::new("Internal", e))?;

    let ephemeral_nostr_keys = Keys::generate();
    let published_message_event = EventBuilder::new(Kind::MlsGroupMessage, encrypted_content)
        .tags(vec![Tag::custom(
            TagKind::h(),
            vec![group.nostr_group_id.clone()],
        )])
        .sign(&ephemeral_nostr_keys)
        .await
        .map_err(|e| CommandError::new("Internal", e))?;

    tracing::debug!(
        target: "murmur::commands::groups::send_mls_message",
        "Publishing MLS message event to group relays"
    );

    let relays = group.relays(&murmur.database).await?;
    let publish = murmur.nostr.publish_event_to(relays, published_message_event);
    let output = tokio::select! {
        _ = cancel.cancelled() => {
            // Nothing reached the mesh; drop the optimistic entry
            Message::delete_temp(&account.pubkey, &murmur.database).await?;
            return Err(CommandError::new("Cancelled", "Operation cancelled"));
        }
        result = publish => result?,
    };

    // Relay acknowledged: swap the temp entry for the real one and persist
    // the advanced ratchet state.
    Message::replace_temp(
        &account.pubkey,
        &group.mls_group_id,
        &output.id().to_string(),
        &inner_event,
        &murmur.database,
    )
    .await?;
    murmur.persist_mls_snapshot(&group.mls_group_id, epoch).await?;

    murmur.signals.emit(Signal::MlsMessageProcessed {
        group: group.clone(),
        event: inner_event.clone(),
    });

    Ok(inner_event)
}

/// Creates an unsigned nostr event with the given parameters, scanning the
/// body for BOLT11 invoices to tag.
fn create_unsigned_nostr_event(
    pubkey: PublicKey,
    message: String,
    kind: u16,
    tags: Option<Vec<Tag>>,
) -> UnsignedEvent {
    let mut final_tags = tags.unwrap_or_default();
    final_tags.extend(events::bolt11_invoice_tags(&message));

    let mut inner_event = UnsignedEvent::new(
        pubkey,
        Timestamp::now(),
        kind.into(),
        final_tags,
        message,
    );
    inner_event.ensure_id();
    inner_event
}

/// Publishes a pending commit to the group relays; merges local state only
/// after a relay acknowledges, rolling back otherwise.
async fn publish_commit(
    murmur: &Murmur,
    group: &mut Group,
    account_pubkey: &str,
    pending: PendingCommitResult,
    merge_after_publish: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let last_epoch_export_keys = Keys::parse(&pending.current_exporter_secret_hex)
        .map_err(|e| CommandError::new("Internal", e))?;

    let encrypted_content = nip44::encrypt(
        last_epoch_export_keys.secret_key(),
        &last_epoch_export_keys.public_key(),
        &pending.serialized_commit,
        nip44::Version::V2,
    )
    .map_err(|e| CommandError::new("Internal", e))?;

    let ephemeral_nostr_keys = Keys::generate();
    let commit_message_event = EventBuilder::new(Kind::MlsGroupMessage, encrypted_content)
        .tags(vec![Tag::custom(
            TagKind::h(),
            vec![group.nostr_group_id.clone()],
        )])
        .sign(&ephemeral_nostr_keys)
        .await
        .map_err(|e| CommandError::new("Internal", e))?;

    let relays = group.relays(&murmur.database).await?;
    let publish = murmur.nostr.publish_event_to(relays, commit_message_event);
    let publish_result = tokio::select! {
        _ = cancel.cancelled() => {
            // Applied in memory but never published: roll back
            murmur.nostr_mls.rollback_pending_commit(&group.mls_group_id)?;
            return Err(CommandError::new("Cancelled", "Operation cancelled"));
        }
        result = publish => result,
    };
    match publish_result {
        Ok(_) => {
            if merge_after_publish {
                let (new_epoch, new_secret_hex) =
                    murmur.nostr_mls.merge_pending_commit(&group.mls_group_id)?;
                murmur.secrets.store_mls_export_secret(
                    &group.mls_group_id,
                    new_epoch,
                    &new_secret_hex,
                )?;
                group
                    .set_epoch(new_epoch, account_pubkey, &murmur.database)
                    .await?;
                murmur
                    .persist_mls_snapshot(&group.mls_group_id, new_epoch)
                    .await?;
            }
            Ok(())
        }
        Err(e) => {
            // The mesh never saw the commit; local state must not advance
            murmur.nostr_mls.rollback_pending_commit(&group.mls_group_id)?;
            Err(e.into())
        }
    }
}

/// Rotates our own leaf keys in the group (post-compromise security).
pub async fn rotate_key_in_group(
    group_id: &str,
    cancel: Option<CancellationToken>,
    murmur: &Murmur,
) -> Result<()> {
    let mls_group_id =
        hex::decode(group_id).map_err(|e| CommandError::new("GroupNotFound", e))?;
    let mut group = Group::find_by_mls_group_id(&mls_group_id, &murmur.database).await?;
    group.ensure_can_send()?;
    let account = Account::get_active(&murmur.database).await?;
    let cancel = cancel.unwrap_or_else(|| murmur.shutdown.child_token());

    let lock = murmur.nostr_mls.group_lock(&mls_group_id);
    let _guard = lock.lock().await;

    let pending = murmur.nostr_mls.self_update(&mls_group_id)?;
    publish_commit(murmur, &mut group, &account.pubkey, pending, true, &cancel).await
}

/// Adds a member to the group: commit to the group, welcome to the invitee.
pub async fn add_member_to_group(
    group_id: &str,
    member_pubkey: String,
    cancel: Option<CancellationToken>,
    murmur: &Arc<Murmur>,
) -> Result<()> {
    let mls_group_id =
        hex::decode(group_id).map_err(|e| CommandError::new("GroupNotFound", e))?;
    let mut group = Group::find_by_mls_group_id(&mls_group_id, &murmur.database).await?;
    group.ensure_can_send()?;
    let account = Account::get_active(&murmur.database).await?;
    let cancel = cancel.unwrap_or_else(|| murmur.shutdown.child_token());

    let member_key_package =
        key_packages::fetch_key_package_for_pubkey(member_pubkey.clone(), murmur)
            .await?
            .ok_or_else(|| {
                CommandError::new("NoKeyPackage", format!("No key package for {}", member_pubkey))
            })?;

    let lock = murmur.nostr_mls.group_lock(&mls_group_id);
    let _guard = lock.lock().await;

    let pending = murmur
        .nostr_mls
        .add_members(&mls_group_id, vec![member_key_package.key_package.clone()])?;
    let serialized_welcome = pending.serialized_welcome.clone();

    publish_commit(murmur, &mut group, &account.pubkey, pending, true, &cancel).await?;

    if let Some(serialized_welcome) = serialized_welcome {
        fan_out_welcomes(
            murmur,
            std::slice::from_ref(&member_key_package),
            &serialized_welcome,
            &cancel,
        )
        .await?;
    }
    let _ = key_packages::mark_consumed(
        &account.pubkey,
        &member_key_package.event_id,
        &murmur.database,
    )
    .await;
    Ok(())
}

/// Removes a member from the group.
pub async fn remove_member_from_group(
    group_id: &str,
    member_pubkey: String,
    cancel: Option<CancellationToken>,
    murmur: &Murmur,
) -> Result<()> {
    let mls_group_id =
        hex::decode(group_id).map_err(|e| CommandError::new("GroupNotFound", e))?;
    let mut group = Group::find_by_mls_group_id(&mls_group_id, &murmur.database).await?;
    group.ensure_can_send()?;
    let account = Account::get_active(&murmur.database).await?;
    let cancel = cancel.unwrap_or_else(|| murmur.shutdown.child_token());

    let lock = murmur.nostr_mls.group_lock(&mls_group_id);
    let _guard = lock.lock().await;

    let pending = murmur.nostr_mls.remove_member(&mls_group_id, &member_pubkey)?;
    publish_commit(murmur, &mut group, &account.pubkey, pending, true, &cancel).await
}

/// Leaves the group: publishes our self-remove proposal and marks the group
/// Leaving. Another member's commit finalizes the removal.
pub async fn leave_group(
    group_id: &str,
    cancel: Option<CancellationToken>,
    murmur: &Murmur,
) -> Result<()> {
    let mls_group_id =
        hex::decode(group_id).map_err(|e| CommandError::new("GroupNotFound", e))?;
    let mut group = Group::find_by_mls_group_id(&mls_group_id, &murmur.database).await?;
    group.ensure_can_send()?;
    let account = Account::get_active(&murmur.database).await?;
    let cancel = cancel.unwrap_or_else(|| murmur.shutdown.child_token());

    let lock = murmur.nostr_mls.group_lock(&mls_group_id);
    let _guard = lock.lock().await;

    let pending = murmur.nostr_mls.leave(&mls_group_id)?;
    publish_commit(murmur, &mut group, &account.pubkey, pending, false, &cancel).await?;

    group
        .set_state(GroupState::Leaving, &account.pubkey, &murmur.database)
        .await?;
    Ok(())
}
