use openmls::prelude::*;
use openmls::treesync::LeafNodeParameters;
use openmls_basic_credential::SignatureKeyPair;
use tls_codec::Serialize as TlsSerializeTrait;

use super::nostr_group_data::{NostrGroupDataExtension, NOSTR_GROUP_DATA_EXTENSION_TYPE};
use super::{NostrMls, NostrMlsError, Result};

/// Label used when exporting the per-epoch secret that wraps group traffic.
pub const EXPORTER_SECRET_LABEL: &str = "nostr";
pub const EXPORTER_SECRET_LEN: usize = 32;

#[derive(Debug)]
pub struct CreateGroupResult {
    pub mls_group_id: Vec<u8>,
    pub epoch: u64,
    pub member_count: usize,
    pub serialized_welcome_message: Vec<u8>,
    pub nostr_group_data: NostrGroupDataExtension,
}

/// A commit that exists only as a pending change. The caller publishes the
/// serialized commit and then either merges or rolls the change back; local
/// state must never advance before a relay has acknowledged the publish.
#[derive(Debug)]
pub struct PendingCommitResult {
    pub serialized_commit: Vec<u8>,
    pub serialized_welcome: Option<Vec<u8>>,
    pub current_epoch: u64,
    pub current_exporter_secret_hex: String,
}

impl NostrMls {
    pub(crate) fn load_group(&self, mls_group_id: &[u8]) -> Result<MlsGroup> {
        MlsGroup::load(
            self.provider.storage(),
            &GroupId::from_slice(mls_group_id),
        )
        .map_err(|e| NostrMlsError::Storage(e.to_string()))?
        .ok_or(NostrMlsError::GroupNotFound)
    }

    pub(crate) fn load_signer(&self, group: &MlsGroup) -> Result<SignatureKeyPair> {
        let own_leaf = group
            .own_leaf_node()
            .ok_or_else(|| NostrMlsError::Group("No own leaf node in group".to_string()))?;
        SignatureKeyPair::read(
            self.provider.storage(),
            own_leaf.signature_key().as_slice(),
            self.ciphersuite.signature_algorithm(),
        )
        .ok_or_else(|| NostrMlsError::Group("Could not load MLS signer".to_string()))
    }

    /// Creates a new group, adding every invitee via its validated key
    /// package. The creator's commit is merged immediately; the returned
    /// welcome is fanned out to the invitees by the caller.
    pub fn create_group(
        &self,
        name: String,
        description: String,
        creator_pubkey: String,
        member_key_packages: Vec<KeyPackage>,
        admin_pubkeys: Vec<String>,
        group_relays: Vec<String>,
    ) -> Result<CreateGroupResult> {
        let (credential, signer) = self.generate_credential_with_key(creator_pubkey)?;

        let group_data =
            NostrGroupDataExtension::new(name, description, admin_pubkeys, group_relays);
        let serialized_group_data = group_data
            .tls_serialize_detached()
            .map_err(NostrMlsError::Tls)?;

        let required_capabilities = Extension::RequiredCapabilities(
            RequiredCapabilitiesExtension::new(
                &[ExtensionType::Unknown(NOSTR_GROUP_DATA_EXTENSION_TYPE)],
                &[],
                &[],
            ),
        );
        let group_context_extensions = Extensions::from_vec(vec![
            required_capabilities,
            Extension::Unknown(
                NOSTR_GROUP_DATA_EXTENSION_TYPE,
                UnknownExtension(serialized_group_data),
            ),
        ])
        .map_err(|e| NostrMlsError::Group(e.to_string()))?;

        let group_create_config = MlsGroupCreateConfig::builder()
            .ciphersuite(self.ciphersuite)
            .use_ratchet_tree_extension(true)
            .capabilities(self.capabilities())
            .with_group_context_extensions(group_context_extensions)
            .map_err(|e| NostrMlsError::Group(e.to_string()))?
            .build();

        let mut group = MlsGroup::new(
            &self.provider,
            &signer,
            &group_create_config,
            credential,
        )
        .map_err(|e| NostrMlsError::Group(e.to_string()))?;

        let (_commit, welcome, _group_info) = group
            .add_members(&self.provider, &signer, &member_key_packages)
            .map_err(|e| NostrMlsError::Group(e.to_string()))?;

        group
            .merge_pending_commit(&self.provider)
            .map_err(|e| NostrMlsError::Group(e.to_string()))?;

        let serialized_welcome_message =
            welcome.tls_serialize_detached().map_err(NostrMlsError::Tls)?;

        tracing::debug!(
            target: "murmur::nostr_mls::groups::create_group",
            "Created group {:?} at epoch {}",
            group_data.nostr_group_id(),
            group.epoch().as_u64()
        );

        Ok(CreateGroupResult {
            mls_group_id: group.group_id().to_vec(),
            epoch: group.epoch().as_u64(),
            member_count: group.members().count(),
            serialized_welcome_message,
            nostr_group_data: group_data,
        })
    }

    /// Rotates our own leaf keys. Returns the pending commit; the epoch does
    /// not advance until [`NostrMls::merge_pending_commit`] is called.
    pub fn self_update(&self, mls_group_id: &[u8]) -> Result<PendingCommitResult> {
        let mut group = self.load_group(mls_group_id)?;
        let signer = self.load_signer(&group)?;
        let (current_exporter_secret_hex, current_epoch) =
            self.exporter_secret_hex_and_epoch(mls_group_id)?;

        let bundle = group
            .self_update(&self.provider, &signer, LeafNodeParameters::default())
            .map_err(|e| NostrMlsError::Group(e.to_string()))?;
        let (commit, _welcome, _group_info) = bundle.into_messages();

        Ok(PendingCommitResult {
            serialized_commit: commit.tls_serialize_detached().map_err(NostrMlsError::Tls)?,
            serialized_welcome: None,
            current_epoch,
            current_exporter_secret_hex,
        })
    }

    /// Adds members by key package. Returns the pending commit together with
    /// the welcome for the new members.
    pub fn add_members(
        &self,
        mls_group_id: &[u8],
        key_packages: Vec<KeyPackage>,
    ) -> Result<PendingCommitResult> {
        let mut group = self.load_group(mls_group_id)?;
        let signer = self.load_signer(&group)?;
        let (current_exporter_secret_hex, current_epoch) =
            self.exporter_secret_hex_and_epoch(mls_group_id)?;

        let (commit, welcome, _group_info) = group
            .add_members(&self.provider, &signer, &key_packages)
            .map_err(|e| NostrMlsError::Group(e.to_string()))?;

        Ok(PendingCommitResult {
            serialized_commit: commit.tls_serialize_detached().map_err(NostrMlsError::Tls)?,
            serialized_welcome: Some(
                welcome.tls_serialize_detached().map_err(NostrMlsError::Tls)?,
            ),
            current_epoch,
            current_exporter_secret_hex,
        })
    }

    /// Removes a member by pubkey. Returns the pending commit.
    pub fn remove_member(
        &self,
        mls_group_id: &[u8],
        member_pubkey: &str,
    ) -> Result<PendingCommitResult> {
        let mut group = self.load_group(mls_group_id)?;
        let signer = self.load_signer(&group)?;
        let (current_exporter_secret_hex, current_epoch) =
            self.exporter_secret_hex_and_epoch(mls_group_id)?;

        let leaf_index = group
            .members()
            .find(|member| {
                BasicCredential::try_from(member.credential.clone())
                    .map(|credential| credential.identity() == member_pubkey.as_bytes())
                    .unwrap_or(false)
            })
            .map(|member| member.index)
            .ok_or_else(|| {
                NostrMlsError::Group(format!("Member not found: {}", member_pubkey))
            })?;

        let (commit, _welcome, _group_info) = group
            .remove_members(&self.provider, &signer, &[leaf_index])
            .map_err(|e| NostrMlsError::Group(e.to_string()))?;

        Ok(PendingCommitResult {
            serialized_commit: commit.tls_serialize_detached().map_err(NostrMlsError::Tls)?,
            serialized_welcome: None,
            current_epoch,
            current_exporter_secret_hex,
        })
    }

    /// Leaves the group by emitting a self-remove proposal. Another member's
    /// commit finalizes the removal; locally the group transitions to
    /// Leaving as soon as the proposal is published.
    pub fn leave(&self, mls_group_id: &[u8]) -> Result<PendingCommitResult> {
        let mut group = self.load_group(mls_group_id)?;
        let signer = self.load_signer(&group)?;
        let (current_exporter_secret_hex, current_epoch) =
            self.exporter_secret_hex_and_epoch(mls_group_id)?;

        let proposal = group
            .leave_group(&self.provider, &signer)
            .map_err(|e| NostrMlsError::Group(e.to_string()))?;

        Ok(PendingCommitResult {
            serialized_commit: proposal
                .tls_serialize_detached()
                .map_err(NostrMlsError::Tls)?,
            serialized_welcome: None,
            current_epoch,
            current_exporter_secret_hex,
        })
    }

    /// Merges the pending commit, advancing the epoch. Returns the new epoch
    /// and its exporter secret.
    pub fn merge_pending_commit(&self, mls_group_id: &[u8]) -> Result<(u64, String)> {
        let mut group = self.load_group(mls_group_id)?;
        group
            .merge_pending_commit(&self.provider)
            .map_err(|e| NostrMlsError::Group(e.to_string()))?;
        let (secret_hex, epoch) = self.exporter_secret_hex_and_epoch(mls_group_id)?;
        Ok((epoch, secret_hex))
    }

    /// Discards the pending commit. Called when a publish fails or an
    /// operation is cancelled after the commit was staged.
    pub fn rollback_pending_commit(&self, mls_group_id: &[u8]) -> Result<()> {
        let mut group = self.load_group(mls_group_id)?;
        group
            .clear_pending_commit(self.provider.storage())
            .map_err(|e| NostrMlsError::Storage(e.to_string()))?;
        group
            .clear_pending_proposals(self.provider.storage())
            .map_err(|e| NostrMlsError::Storage(e.to_string()))?;
        Ok(())
    }

    /// The current epoch's exporter secret, hex encoded, with the epoch.
    pub fn exporter_secret_hex_and_epoch(&self, mls_group_id: &[u8]) -> Result<(String, u64)> {
        let group = self.load_group(mls_group_id)?;
        let secret = group
            .export_secret(
                self.provider.crypto(),
                EXPORTER_SECRET_LABEL,
                &[],
                EXPORTER_SECRET_LEN,
            )
            .map_err(|e| NostrMlsError::Group(e.to_string()))?;
        Ok((hex::encode(secret), group.epoch().as_u64()))
    }

    /// Member identities (hex pubkeys) at the current epoch.
    pub fn member_pubkeys(&self, mls_group_id: &[u8]) -> Result<Vec<String>> {
        let group = self.load_group(mls_group_id)?;
        group
            .members()
            .map(|member| {
                BasicCredential::try_from(member.credential.clone())
                    .map_err(|e| NostrMlsError::Group(e.to_string()))
                    .map(|credential| {
                        String::from_utf8_lossy(credential.identity()).to_string()
                    })
            })
            .collect()
    }

    pub fn group_epoch(&self, mls_group_id: &[u8]) -> Result<u64> {
        Ok(self.load_group(mls_group_id)?.epoch().as_u64())
    }

    /// Removes a group's state from storage. Used to undo a creation whose
    /// welcome fan-out never reached a relay.
    pub fn delete_group(&self, mls_group_id: &[u8]) -> Result<()> {
        let mut group = self.load_group(mls_group_id)?;
        group
            .delete(self.provider.storage())
            .map_err(|e| NostrMlsError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Group metadata from the group context extension.
    pub fn group_data(&self, mls_group_id: &[u8]) -> Result<NostrGroupDataExtension> {
        let group = self.load_group(mls_group_id)?;
        NostrGroupDataExtension::from_group(&group)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::create_test_mls;
    use super::*;
    use nostr_sdk::prelude::Keys;

    fn test_group(mls: &NostrMls, invitee: &NostrMls) -> (CreateGroupResult, String, String) {
        let creator = mls.current_identity().unwrap();
        let member = invitee.current_identity().unwrap();
        let member_kp_hex = invitee.build_key_package_hex(&member).unwrap();
        let member_kp = mls.parse_key_package(&member_kp_hex).unwrap();

        let result = mls
            .create_group(
                "Secure DM".to_string(),
                "".to_string(),
                creator.clone(),
                vec![member_kp],
                vec![creator.clone(), member.clone()],
                vec!["wss://relay.damus.io".to_string()],
            )
            .unwrap();
        (result, creator, member)
    }

    #[test]
    fn test_create_group_includes_both_members() {
        let alice = create_test_mls();
        let bob = create_test_mls();
        let (result, creator, member) = test_group(&alice, &bob);

        assert_eq!(result.member_count, 2);
        assert_eq!(result.epoch, 1);
        assert!(!result.serialized_welcome_message.is_empty());

        let mut members = alice.member_pubkeys(&result.mls_group_id).unwrap();
        members.sort();
        let mut expected = vec![creator, member];
        expected.sort();
        assert_eq!(members, expected);
    }

    #[test]
    fn test_group_data_round_trips_through_context() {
        let alice = create_test_mls();
        let bob = create_test_mls();
        let (result, creator, member) = test_group(&alice, &bob);

        let data = alice.group_data(&result.mls_group_id).unwrap();
        assert_eq!(data.name(), "Secure DM");
        assert_eq!(data.admin_pubkeys(), vec![creator, member]);
        assert_eq!(data.nostr_group_id(), result.nostr_group_data.nostr_group_id());
    }

    #[test]
    fn test_self_update_is_pending_until_merged() {
        let alice = create_test_mls();
        let bob = create_test_mls();
        let (result, _, _) = test_group(&alice, &bob);
        let group_id = result.mls_group_id;

        let epoch_before = alice.group_epoch(&group_id).unwrap();
        let pending = alice.self_update(&group_id).unwrap();
        assert_eq!(pending.current_epoch, epoch_before);
        assert!(!pending.serialized_commit.is_empty());

        // Not merged yet
        assert_eq!(alice.group_epoch(&group_id).unwrap(), epoch_before);

        let (new_epoch, new_secret) = alice.merge_pending_commit(&group_id).unwrap();
        assert_eq!(new_epoch, epoch_before + 1);
        assert_ne!(new_secret, pending.current_exporter_secret_hex);
    }

    #[test]
    fn test_rollback_discards_pending_commit() {
        let alice = create_test_mls();
        let bob = create_test_mls();
        let (result, _, _) = test_group(&alice, &bob);
        let group_id = result.mls_group_id;

        let epoch_before = alice.group_epoch(&group_id).unwrap();
        let secret_before = alice.exporter_secret_hex_and_epoch(&group_id).unwrap().0;

        alice.self_update(&group_id).unwrap();
        alice.rollback_pending_commit(&group_id).unwrap();

        assert_eq!(alice.group_epoch(&group_id).unwrap(), epoch_before);
        assert_eq!(
            alice.exporter_secret_hex_and_epoch(&group_id).unwrap().0,
            secret_before
        );
    }

    #[test]
    fn test_remove_member_unknown_pubkey_fails() {
        let alice = create_test_mls();
        let bob = create_test_mls();
        let (result, _, _) = test_group(&alice, &bob);

        let stranger = Keys::generate().public_key().to_hex();
        assert!(alice.remove_member(&result.mls_group_id, &stranger).is_err());
    }

    #[test]
    fn test_unknown_group_is_not_found() {
        let alice = create_test_mls();
        assert!(matches!(
            alice.group_epoch(&[0u8; 8]),
            Err(NostrMlsError::GroupNotFound)
        ));
    }
}
