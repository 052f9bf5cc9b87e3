use openmls::prelude::*;
use tls_codec::Deserialize as TlsDeserializeTrait;

use super::nostr_group_data::NostrGroupDataExtension;
use super::{NostrMls, NostrMlsError, Result};

/// A staged welcome inspected without being applied. Used to build the
/// pending invite shown to the user.
pub struct WelcomePreview {
    pub staged_welcome: StagedWelcome,
    pub nostr_group_data: NostrGroupDataExtension,
}

/// The result of applying a welcome: a joined group.
#[derive(Debug)]
pub struct JoinedGroupResult {
    pub mls_group_id: Vec<u8>,
    pub epoch: u64,
    pub member_count: usize,
    pub nostr_group_data: NostrGroupDataExtension,
}

impl NostrMls {
    fn parse_serialized_welcome(&self, welcome_bytes: &[u8]) -> Result<Welcome> {
        let mut bytes = welcome_bytes;
        let welcome_message = MlsMessageIn::tls_deserialize(&mut bytes)
            .map_err(|e| NostrMlsError::Welcome(e.to_string()))?;
        match welcome_message.extract() {
            MlsMessageBodyIn::Welcome(welcome) => Ok(welcome),
            _ => Err(NostrMlsError::Welcome(
                "Message did not contain a welcome".to_string(),
            )),
        }
    }

    fn join_config(&self) -> MlsGroupJoinConfig {
        MlsGroupJoinConfig::builder()
            .use_ratchet_tree_extension(true)
            .build()
    }

    /// Stages a welcome and extracts the group metadata without joining.
    /// The staged state is not persisted; accepting re-derives it.
    pub fn preview_welcome_event(&self, welcome_bytes: Vec<u8>) -> Result<WelcomePreview> {
        let welcome = self.parse_serialized_welcome(&welcome_bytes)?;

        let staged_welcome =
            StagedWelcome::new_from_welcome(&self.provider, &self.join_config(), welcome, None)
                .map_err(|e| NostrMlsError::Welcome(e.to_string()))?;

        let nostr_group_data =
            NostrGroupDataExtension::from_group_context(staged_welcome.group_context())?;

        Ok(WelcomePreview {
            staged_welcome,
            nostr_group_data,
        })
    }

    /// Applies a welcome, producing the joined group. Fails if the key
    /// package the welcome references is no longer in storage (replayed or
    /// already consumed welcomes).
    pub fn join_group_from_welcome(&self, welcome_bytes: Vec<u8>) -> Result<JoinedGroupResult> {
        let preview = self.preview_welcome_event(welcome_bytes)?;

        let group = preview
            .staged_welcome
            .into_group(&self.provider)
            .map_err(|e| NostrMlsError::Welcome(e.to_string()))?;

        tracing::debug!(
            target: "murmur::nostr_mls::welcomes::join_group_from_welcome",
            "Joined group {:?} at epoch {}",
            preview.nostr_group_data.nostr_group_id(),
            group.epoch().as_u64()
        );

        Ok(JoinedGroupResult {
            mls_group_id: group.group_id().to_vec(),
            epoch: group.epoch().as_u64(),
            member_count: group.members().count(),
            nostr_group_data: preview.nostr_group_data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::create_test_mls;
    use super::*;

    #[test]
    fn test_preview_then_join() {
        let alice = create_test_mls();
        let bob = create_test_mls();

        let creator = alice.current_identity().unwrap();
        let member = bob.current_identity().unwrap();
        let bob_kp_hex = bob.build_key_package_hex(&member).unwrap();
        let bob_kp = alice.parse_key_package(&bob_kp_hex).unwrap();

        let result = alice
            .create_group(
                "Secure DM".to_string(),
                "a description".to_string(),
                creator.clone(),
                vec![bob_kp],
                vec![creator.clone(), member.clone()],
                vec!["wss://relay.damus.io".to_string()],
            )
            .unwrap();

        let preview = bob
            .preview_welcome_event(result.serialized_welcome_message.clone())
            .unwrap();
        assert_eq!(preview.nostr_group_data.name(), "Secure DM");
        assert_eq!(preview.staged_welcome.members().count(), 2);

        let joined = bob
            .join_group_from_welcome(result.serialized_welcome_message)
            .unwrap();
        assert_eq!(joined.mls_group_id, result.mls_group_id);
        assert_eq!(joined.member_count, 2);
        assert_eq!(
            joined.nostr_group_data.nostr_group_id(),
            result.nostr_group_data.nostr_group_id()
        );
        assert_eq!(bob.group_epoch(&joined.mls_group_id).unwrap(), joined.epoch);
    }

    #[test]
    fn test_welcome_for_someone_else_fails() {
        let alice = create_test_mls();
        let bob = create_test_mls();
        let carol = create_test_mls();

        let creator = alice.current_identity().unwrap();
        let member = bob.current_identity().unwrap();
        let bob_kp_hex = bob.build_key_package_hex(&member).unwrap();
        let bob_kp = alice.parse_key_package(&bob_kp_hex).unwrap();

        let result = alice
            .create_group(
                "chat".to_string(),
                "".to_string(),
                creator.clone(),
                vec![bob_kp],
                vec![creator, member],
                vec![],
            )
            .unwrap();

        // Carol has no matching key package in her storage
        assert!(carol
            .join_group_from_welcome(result.serialized_welcome_message)
            .is_err());
    }

    #[test]
    fn test_garbage_welcome_is_rejected() {
        let bob = create_test_mls();
        assert!(matches!(
            bob.preview_welcome_event(vec![0u8; 32]),
            Err(NostrMlsError::Welcome(_))
        ));
    }
}
