use openmls::prelude::*;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tls_codec::{
    DeserializeBytes, TlsDeserialize, TlsDeserializeBytes, TlsSerialize, TlsSerializeBytes, TlsSize,
};

use super::{NostrMlsError, Result};

/// # Nostr Group Extension
/// This is an MLS Group Context extension used to store the group's name,
/// description, ID, admin identities, and relays.
#[derive(
    PartialEq,
    Eq,
    Clone,
    Debug,
    Serialize,
    Deserialize,
    TlsSerialize,
    TlsDeserialize,
    TlsDeserializeBytes,
    TlsSerializeBytes,
    TlsSize,
)]
pub struct NostrGroupDataExtension {
    pub nostr_group_id: [u8; 32],
    pub name: Vec<u8>,
    pub description: Vec<u8>,
    pub admin_identities: Vec<Vec<u8>>,
    pub relays: Vec<Vec<u8>>,
}

pub const NOSTR_GROUP_DATA_EXTENSION_TYPE: u16 = 0xFF69;

impl NostrGroupDataExtension {
    pub fn extension_type(&self) -> u16 {
        NOSTR_GROUP_DATA_EXTENSION_TYPE
    }

    pub fn new(
        name: String,
        description: String,
        admin_identities: Vec<String>,
        relays: Vec<String>,
    ) -> Self {
        // Generate a random 32-byte group ID
        let random_bytes: [u8; 32] = rand::thread_rng().gen();

        Self {
            nostr_group_id: random_bytes,
            name: name.into_bytes(),
            description: description.into_bytes(),
            admin_identities: admin_identities
                .into_iter()
                .map(|identity| identity.into_bytes())
                .collect(),
            relays: relays.into_iter().map(|relay| relay.into_bytes()).collect(),
        }
    }

    pub fn from_group_context(group_context: &GroupContext) -> Result<Self> {
        let group_data_extension = match group_context
            .extensions()
            .iter()
            .find(|ext| ext.extension_type() == ExtensionType::Unknown(NOSTR_GROUP_DATA_EXTENSION_TYPE))
        {
            Some(Extension::Unknown(_, ext)) => ext,
            Some(_) => {
                return Err(NostrMlsError::Group(
                    "Unexpected extension type".to_string(),
                ))
            }
            None => {
                return Err(NostrMlsError::Group(
                    "Nostr group data extension not found".to_string(),
                ))
            }
        };

        let (deserialized, _) = Self::tls_deserialize_bytes(&group_data_extension.0)
            .map_err(|e| NostrMlsError::Group(format!("Failed to deserialize extension: {}", e)))?;

        Ok(deserialized)
    }

    pub fn from_group(group: &MlsGroup) -> Result<Self> {
        let group_data_extension = match group
            .extensions()
            .iter()
            .find(|ext| ext.extension_type() == ExtensionType::Unknown(NOSTR_GROUP_DATA_EXTENSION_TYPE))
        {
            Some(Extension::Unknown(_, ext)) => ext,
            Some(_) => {
                return Err(NostrMlsError::Group(
                    "Unexpected extension type".to_string(),
                ))
            }
            None => {
                return Err(NostrMlsError::Group(
                    "Nostr group data extension not found".to_string(),
                ))
            }
        };

        let (deserialized, _) = Self::tls_deserialize_bytes(&group_data_extension.0)
            .map_err(|e| NostrMlsError::Group(format!("Failed to deserialize extension: {}", e)))?;

        Ok(deserialized)
    }

    /// Hex encoded group id used as the `h` tag on wrapper events.
    pub fn nostr_group_id(&self) -> String {
        hex::encode(self.nostr_group_id)
    }

    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.name).to_string()
    }

    pub fn description(&self) -> String {
        String::from_utf8_lossy(&self.description).to_string()
    }

    pub fn admin_pubkeys(&self) -> Vec<String> {
        self.admin_identities
            .iter()
            .map(|identity| String::from_utf8_lossy(identity).to_string())
            .collect()
    }

    pub fn relays(&self) -> Vec<String> {
        self.relays
            .iter()
            .map(|relay| String::from_utf8_lossy(relay).to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tls_codec::Serialize as TlsSerializeTrait;

    #[test]
    fn test_round_trip_through_tls_codec() {
        let data = NostrGroupDataExtension::new(
            "Secure DM".to_string(),
            "".to_string(),
            vec!["admin1".to_string(), "admin2".to_string()],
            vec!["wss://relay.damus.io".to_string()],
        );

        let serialized = data.tls_serialize_detached().expect("serialize failed");
        let (deserialized, _) =
            NostrGroupDataExtension::tls_deserialize_bytes(&serialized).expect("deserialize failed");

        assert_eq!(data, deserialized);
        assert_eq!(deserialized.name(), "Secure DM");
        assert_eq!(deserialized.admin_pubkeys(), vec!["admin1", "admin2"]);
        assert_eq!(deserialized.relays(), vec!["wss://relay.damus.io"]);
        assert_eq!(deserialized.nostr_group_id().len(), 64);
    }

    #[test]
    fn test_group_ids_are_random() {
        let a = NostrGroupDataExtension::new("a".into(), "".into(), vec![], vec![]);
        let b = NostrGroupDataExtension::new("b".into(), "".into(), vec![], vec![]);
        assert_ne!(a.nostr_group_id, b.nostr_group_id);
    }
}
