use std::sync::Arc;

use crate::accounts::Account;
use crate::commands::{CommandError, Result};
use crate::groups::{Group, GroupType};
use crate::invites::{Invite, InviteState, ProcessedInvite, ProcessedInviteState};
use crate::nostr_manager::WELCOME_TIMEOUT;
use crate::signals::Signal;
use crate::Murmur;

/// Pending invites for a user.
pub async fn fetch_invites_for_user(pubkey: String, murmur: &Murmur) -> Result<Vec<Invite>> {
    Ok(Invite::pending(&pubkey, &murmur.database).await?)
}

/// Accepts a pending invite: applies the welcome, persists the joined
/// group, and subscribes to its traffic. Calling it again for the same
/// invite is answered from the ledger without reapplying the welcome.
pub async fn accept_invite(invite: Invite, murmur: &Arc<Murmur>) -> Result<()> {
    let account = Account::get_active(&murmur.database).await?;
    let mut invite = Invite::find_by_id(&account.pubkey, &invite.event_id, &murmur.database)
        .await?;

    // The ledger is consulted before any application attempt
    if let Some(processed) = ProcessedInvite::find_by_welcome_event_id(
        &account.pubkey,
        &invite.event_id,
        &murmur.database,
    )
    .await?
    {
        return match processed.state {
            ProcessedInviteState::Processed => Ok(()),
            ProcessedInviteState::Failed => Err(CommandError::new(
                "DecryptFailed",
                processed.failure_reason,
            )),
        };
    }

    let welcome_bytes = hex::decode(&invite.event.content)
        .map_err(|e| CommandError::new("DecryptFailed", e))?;

    let join_result = tokio::time::timeout(WELCOME_TIMEOUT, async {
        murmur.nostr_mls.join_group_from_welcome(welcome_bytes)
    })
    .await
    .map_err(|_| CommandError::new("Timeout", "Welcome processing timed out"))?;

    let joined = match join_result {
        Ok(joined) => joined,
        Err(e) => {
            // A welcome that no longer matches a stored key package was
            // already applied once.
            let (token, reason) = if Group::get_by_nostr_group_id(&invite.nostr_group_id, &murmur.database)
                .await
                .is_ok()
            {
                ("WelcomeReplay", format!("Welcome already applied: {}", e))
            } else {
                ("DecryptFailed", format!("Error applying welcome: {}", e))
            };
            ProcessedInvite::create_with_state_and_reason(
                &account.pubkey,
                &invite.event_id,
                &invite.event_id,
                ProcessedInviteState::Failed,
                reason.clone(),
                &murmur.database,
            )
            .await?;
            return Err(CommandError::new(token, reason));
        }
    };

    let group_type = if joined.member_count == 2 {
        GroupType::DirectMessage
    } else {
        GroupType::Group
    };
    let group = Group::new(
        &account.pubkey,
        joined.mls_group_id.clone(),
        joined.epoch,
        group_type,
        &joined.nostr_group_data,
        &murmur.database,
    )
    .await?;

    // Seed the exporter secret for inbound traffic and persist MLS state
    let (secret_hex, epoch) = murmur
        .nostr_mls
        .exporter_secret_hex_and_epoch(&joined.mls_group_id)?;
    murmur
        .secrets
        .store_mls_export_secret(&joined.mls_group_id, epoch, &secret_hex)?;
    murmur
        .persist_mls_snapshot(&joined.mls_group_id, epoch)
        .await?;

    invite.set_state(InviteState::Accepted, &murmur.database).await?;
    ProcessedInvite::create_with_state_and_reason(
        &account.pubkey,
        &invite.event_id,
        &invite.event_id,
        ProcessedInviteState::Processed,
        "".to_string(),
        &murmur.database,
    )
    .await?;

    // Start listening for the new group's traffic
    let group_ids = account.nostr_group_ids(&murmur.database).await?;
    murmur
        .nostr
        .subscribe_mls_group_messages(group_ids)
        .await
        .map_err(CommandError::from)?;

    murmur.signals.emit(Signal::InviteAccepted {
        group_id: group.nostr_group_id.clone(),
    });

    Ok(())
}

/// Declines a pending invite. Local only; nothing is published to relays.
pub async fn decline_invite(invite: Invite, murmur: &Murmur) -> Result<()> {
    let account = Account::get_active(&murmur.database).await?;
    let mut invite =
        Invite::find_by_id(&account.pubkey, &invite.event_id, &murmur.database).await?;

    invite.set_state(InviteState::Declined, &murmur.database).await?;
    ProcessedInvite::create_with_state_and_reason(
        &account.pubkey,
        &invite.event_id,
        &invite.event_id,
        ProcessedInviteState::Processed,
        "declined by user".to_string(),
        &murmur.database,
    )
    .await?;
    Ok(())
}
