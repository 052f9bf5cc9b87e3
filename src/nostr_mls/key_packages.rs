use openmls::prelude::*;
use openmls_basic_credential::SignatureKeyPair;
use openmls_traits::storage::StorageProvider as _;
use tls_codec::{Deserialize as TlsDeserializeTrait, Serialize as TlsSerializeTrait};

use super::{NostrMls, NostrMlsError, Result};

impl NostrMls {
    /// Generates a credential with a signing key for MLS operations and
    /// stores the key pair in the provider's storage.
    pub fn generate_credential_with_key(
        &self,
        identity: String,
    ) -> Result<(CredentialWithKey, SignatureKeyPair)> {
        let credential = BasicCredential::new(identity.clone().into());
        let signature_keypair = SignatureKeyPair::new(self.ciphersuite.signature_algorithm())
            .map_err(|e| NostrMlsError::KeyPackageInvalid(e.to_string()))?;

        tracing::debug!(
            target: "murmur::nostr_mls::key_packages::generate_credential_with_key",
            "MLS credential keypair generated for {:?}",
            &identity
        );

        signature_keypair
            .store(self.provider.storage())
            .map_err(|e| NostrMlsError::Storage(e.to_string()))?;

        Ok((
            CredentialWithKey {
                credential: credential.into(),
                signature_key: signature_keypair.public().into(),
            },
            signature_keypair,
        ))
    }

    /// Builds a fresh key package for the given identity and returns it hex
    /// encoded, ready to be wrapped into a kind 443 event.
    pub fn build_key_package_hex(&self, identity: &str) -> Result<String> {
        let (credential, signer) = self.generate_credential_with_key(identity.to_string())?;

        let key_package_bundle = KeyPackage::builder()
            .leaf_node_capabilities(self.capabilities())
            .key_package_extensions(Extensions::single(Extension::LastResort(
                LastResortExtension::default(),
            )))
            .build(self.ciphersuite, &self.provider, &signer, credential)
            .map_err(|e| NostrMlsError::KeyPackageInvalid(e.to_string()))?;

        let key_package_serialized = key_package_bundle
            .key_package()
            .tls_serialize_detached()
            .map_err(NostrMlsError::Tls)?;

        Ok(hex::encode(key_package_serialized))
    }

    /// Parses and validates a hex encoded key package. The ciphersuite must
    /// match ours and the signature must verify.
    pub fn parse_key_package(&self, key_package_hex: &str) -> Result<KeyPackage> {
        let key_package_bytes = hex::decode(key_package_hex)
            .map_err(|e| NostrMlsError::KeyPackageMalformed(e.to_string()))?;

        let key_package_in = KeyPackageIn::tls_deserialize(&mut key_package_bytes.as_slice())
            .map_err(|e| {
                NostrMlsError::KeyPackageMalformed(format!("Could not deserialize KeyPackage: {}", e))
            })?;

        let key_package = key_package_in
            .validate(self.provider.crypto(), ProtocolVersion::Mls10)
            .map_err(|e| NostrMlsError::KeyPackageInvalid(format!("Invalid KeyPackage: {}", e)))?;

        if key_package.ciphersuite() != self.ciphersuite {
            return Err(NostrMlsError::UnsupportedCiphersuite);
        }

        Ok(key_package)
    }

    /// Removes the private key material for a published key package from MLS
    /// storage. Used when revoking key packages.
    pub fn delete_key_package_from_storage(&self, key_package: &KeyPackage) -> Result<()> {
        let hash_ref = key_package
            .hash_ref(self.provider.crypto())
            .map_err(|e| NostrMlsError::Storage(e.to_string()))?;
        self.provider
            .storage()
            .delete_key_package(&hash_ref)
            .map_err(|e| NostrMlsError::Storage(e.to_string()))?;
        Ok(())
    }
}
