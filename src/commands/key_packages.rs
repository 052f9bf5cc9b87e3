use openmls::prelude::*;

use crate::commands::Result;
use crate::key_packages;
use crate::types::KeyPackageView;
use crate::Murmur;

/// Generates and publishes a fresh key package for the active account.
/// Returns the event id.
pub async fn publish_key_package(murmur: &Murmur) -> Result<String> {
    let event_id = key_packages::publish_key_package(murmur).await?;
    Ok(event_id.to_string())
}

/// Revokes every outstanding key package authored by the active account.
pub async fn delete_key_packages(murmur: &Murmur) -> Result<()> {
    key_packages::delete_key_packages(murmur).await?;
    Ok(())
}

/// Decodes a hex key package for inspection.
pub fn parse_key_package(key_package_hex: String, murmur: &Murmur) -> Result<KeyPackageView> {
    let key_package = murmur.nostr_mls.parse_key_package(&key_package_hex)?;

    let identity = BasicCredential::try_from(key_package.leaf_node().credential().clone())
        .map(|credential| String::from_utf8_lossy(credential.identity()).to_string())
        .unwrap_or_default();

    Ok(KeyPackageView {
        ciphersuite: key_package.ciphersuite().into(),
        identity,
        last_resort: key_package.last_resort(),
    })
}

/// Whether a user currently has a usable key package on their relays.
pub async fn valid_key_package_exists_for_user(
    pubkey: String,
    murmur: &Murmur,
) -> Result<bool> {
    let key_package = key_packages::fetch_key_package_for_pubkey(pubkey, murmur).await?;
    Ok(key_package.is_some())
}
