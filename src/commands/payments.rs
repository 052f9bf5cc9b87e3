use nostr_sdk::prelude::*;

use crate::accounts::Account;
use crate::commands::groups::send_mls_message;
use crate::commands::{CommandError, Result};
use crate::groups::Group;
use crate::payments::{pay_bolt11_invoice, PaymentError};
use crate::Murmur;

/// Pays a BOLT11 invoice through the account's NWC wallet and posts the
/// payment proof into the group. The caller supplies the reply (`q`) tags
/// pointing at the invoice message so the transcript can pair them.
pub async fn pay_invoice(
    group: Group,
    tags: Option<Vec<Tag>>,
    bolt11: String,
    murmur: &Murmur,
) -> Result<UnsignedEvent> {
    let account = Account::get_active(&murmur.database).await?;

    let nwc_uri = murmur
        .secrets
        .get_nostr_wallet_connect_uri(&account.pubkey)
        .map_err(|_| PaymentError::WalletUnavailable)?;

    let preimage = pay_bolt11_invoice(&bolt11, &nwc_uri).await?;

    let mut final_tags = tags.unwrap_or_default();
    final_tags.push(Tag::custom(
        TagKind::from("preimage"),
        vec![preimage.clone()],
    ));

    send_mls_message(group, "".to_string(), Some(9), Some(final_tags), None, murmur).await
}

/// Whether the active account has a wallet endpoint configured.
pub async fn has_nostr_wallet_connect_uri(murmur: &Murmur) -> Result<bool> {
    let account = Account::get_active(&murmur.database).await?;
    Ok(murmur
        .secrets
        .get_nostr_wallet_connect_uri(&account.pubkey)
        .is_ok())
}

/// Stores the NWC wallet URI for the active account, wrapped at rest.
pub async fn set_nostr_wallet_connect_uri(nwc_uri: String, murmur: &Murmur) -> Result<()> {
    if !nwc_uri.starts_with("nostr+walletconnect://") {
        return Err(CommandError::new(
            "WalletUnavailable",
            "Invalid Nostr Wallet Connect URI",
        ));
    }
    let account = Account::get_active(&murmur.database).await?;
    murmur
        .secrets
        .store_nostr_wallet_connect_uri(&account.pubkey, &nwc_uri)?;
    Ok(())
}

pub async fn remove_nostr_wallet_connect_uri(murmur: &Murmur) -> Result<()> {
    let account = Account::get_active(&murmur.database).await?;
    murmur
        .secrets
        .remove_nostr_wallet_connect_uri(&account.pubkey)?;
    Ok(())
}
