use nostr_sdk::prelude::*;

use crate::accounts::Account;
use crate::commands::groups::send_mls_message;
use crate::commands::{CommandError, Result};
use crate::groups::Group;
use crate::messages::Message;
use crate::Murmur;

/// Publishes a deletion (kind 5) for one of our own messages into the
/// group. The transcript hides the target but keeps it for audit.
pub async fn delete_message(
    group: Group,
    message_id: String,
    murmur: &Murmur,
) -> Result<UnsignedEvent> {
    let account = Account::get_active(&murmur.database).await?;

    let target = Message::find_by_event_id(&account.pubkey, &message_id, &murmur.database)
        .await?
        .ok_or_else(|| CommandError::new("GroupNotFound", "Message not found"))?;

    // Deletions are valid only from the original author
    if target.author_pubkey.to_hex() != account.pubkey {
        return Err(CommandError::new(
            "NotAuthor",
            "Only the author can delete a message",
        ));
    }

    let tags = vec![Tag::event(
        EventId::parse(&message_id).map_err(|e| CommandError::new("EventMalformed", e))?,
    )];
    send_mls_message(group, "".to_string(), Some(5), Some(tags), None, murmur).await
}

/// Looks up a transcript entry by id; returns the raw inner event even when
/// a deletion hides it from list queries.
pub async fn query_message(message_id: String, murmur: &Murmur) -> Result<Option<UnsignedEvent>> {
    let account = Account::get_active(&murmur.database).await?;
    let message = Message::find_by_event_id(&account.pubkey, &message_id, &murmur.database).await?;
    Ok(message.map(|message| message.event))
}
