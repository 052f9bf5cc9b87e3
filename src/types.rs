use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};

/// A contact enriched with Nostr metadata and relay information.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EnrichedContact {
    /// The Nostr metadata of the contact.
    pub metadata: Metadata,
    /// Whether the contact supports NIP-17.
    pub nip17: bool,
    /// Whether the contact supports MLS messaging (NIP-104).
    pub nip104: bool,
    /// The relays for the contact's inbox.
    pub inbox_relays: Vec<String>,
    /// The relays for the contact's key package.
    pub key_package_relays: Vec<String>,
}

/// A parsed view of a key package for inspection from the UI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyPackageView {
    /// Ciphersuite identifier as advertised in the package.
    pub ciphersuite: u16,
    /// Hex pubkey of the credential identity.
    pub identity: String,
    /// Whether the package is marked last-resort.
    pub last_resort: bool,
}
