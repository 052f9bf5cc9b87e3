use nostr_sdk::prelude::UnsignedEvent;
use nostr_sdk::JsonUtil;
use openmls::prelude::*;
use tls_codec::{Deserialize as TlsDeserializeTrait, Serialize as TlsSerializeTrait};

use super::{NostrMls, NostrMlsError, Result};

/// Outcome of processing one decrypted MLS protocol message.
#[derive(Debug)]
pub enum ProcessMessageResult {
    /// An application message carrying the inner unsigned Nostr event.
    ApplicationMessage(UnsignedEvent),
    /// A commit was merged; the group advanced to `new_epoch`.
    Commit {
        new_epoch: u64,
        new_exporter_secret_hex: String,
    },
    /// A proposal was stored for a later commit.
    Proposal,
    /// A commit for an epoch we already passed; ignored.
    StaleCommitIgnored,
}

impl NostrMls {
    /// Encrypts an application payload (the JSON of an unsigned inner event)
    /// into a serialized MLS message for the group.
    pub fn create_message_for_group(
        &self,
        mls_group_id: &[u8],
        json_event: &str,
    ) -> Result<Vec<u8>> {
        let mut group = self.load_group(mls_group_id)?;
        let signer = self.load_signer(&group)?;

        let message_out = group
            .create_message(&self.provider, &signer, json_event.as_bytes())
            .map_err(|e| NostrMlsError::Message(e.to_string()))?;

        message_out
            .tls_serialize_detached()
            .map_err(NostrMlsError::Tls)
    }

    /// Processes a decrypted MLS message for a group.
    ///
    /// Commits for epochs we already passed are ignored; messages encoded at
    /// a future epoch surface [`NostrMlsError::FutureEpoch`] so the caller
    /// can buffer them; a current-epoch commit that fails to apply to the
    /// stored tree surfaces [`NostrMlsError::Fork`].
    pub fn process_message_for_group(
        &self,
        mls_group_id: &[u8],
        message_bytes: &[u8],
    ) -> Result<ProcessMessageResult> {
        let mut group = self.load_group(mls_group_id)?;

        let mls_message = MlsMessageIn::tls_deserialize(&mut &message_bytes[..])
            .map_err(|e| NostrMlsError::Message(e.to_string()))?;
        let protocol_message = mls_message
            .try_into_protocol_message()
            .map_err(|e| NostrMlsError::Message(e.to_string()))?;

        if protocol_message.group_id() != group.group_id() {
            return Err(NostrMlsError::ProtocolGroupIdMismatch);
        }

        let current_epoch = group.epoch().as_u64();
        let message_epoch = protocol_message.epoch().as_u64();
        let is_commit = protocol_message.content_type() == ContentType::Commit;

        if is_commit && message_epoch < current_epoch {
            tracing::debug!(
                target: "murmur::nostr_mls::messages::process_message_for_group",
                "Ignoring stale commit for epoch {} (current {})",
                message_epoch,
                current_epoch
            );
            return Ok(ProcessMessageResult::StaleCommitIgnored);
        }
        if message_epoch > current_epoch {
            return Err(NostrMlsError::FutureEpoch {
                message_epoch,
                current_epoch,
            });
        }

        let processed_message = match group.process_message(&self.provider, protocol_message) {
            Ok(processed_message) => processed_message,
            Err(ProcessMessageError::ValidationError(
                ValidationError::CannotDecryptOwnMessage,
            )) => {
                return Err(NostrMlsError::CannotDecryptOwnMessage);
            }
            Err(e) if is_commit => {
                // A commit for our epoch that the stored tree rejects: the
                // group history has diverged.
                tracing::error!(
                    target: "murmur::nostr_mls::messages::process_message_for_group",
                    "Commit for current epoch failed to apply: {}",
                    e
                );
                return Err(NostrMlsError::Fork);
            }
            Err(e) => {
                return Err(NostrMlsError::Message(e.to_string()));
            }
        };

        match processed_message.into_content() {
            ProcessedMessageContent::ApplicationMessage(application_message) => {
                let bytes = application_message.into_bytes();
                let rumor = UnsignedEvent::from_json(bytes)
                    .map_err(|e| NostrMlsError::Message(e.to_string()))?;
                Ok(ProcessMessageResult::ApplicationMessage(rumor))
            }
            ProcessedMessageContent::ProposalMessage(staged_proposal) => {
                group
                    .store_pending_proposal(self.provider.storage(), *staged_proposal)
                    .map_err(|e| NostrMlsError::Storage(e.to_string()))?;
                Ok(ProcessMessageResult::Proposal)
            }
            ProcessedMessageContent::StagedCommitMessage(staged_commit) => {
                group
                    .merge_staged_commit(&self.provider, *staged_commit)
                    .map_err(|_| NostrMlsError::Fork)?;
                let (new_exporter_secret_hex, new_epoch) =
                    self.exporter_secret_hex_and_epoch(mls_group_id)?;
                tracing::debug!(
                    target: "murmur::nostr_mls::messages::process_message_for_group",
                    "Merged commit, group now at epoch {}",
                    new_epoch
                );
                Ok(ProcessMessageResult::Commit {
                    new_epoch,
                    new_exporter_secret_hex,
                })
            }
            ProcessedMessageContent::ExternalJoinProposalMessage(_) => {
                Ok(ProcessMessageResult::Proposal)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::create_test_mls;
    use super::*;
    use nostr_sdk::prelude::*;

    fn joined_pair() -> (super::super::NostrMls, super::super::NostrMls, Vec<u8>) {
        let alice = create_test_mls();
        let bob = create_test_mls();

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

        let joined = bob
            .join_group_from_welcome(result.serialized_welcome_message.clone())
            .unwrap();
        assert_eq!(joined.mls_group_id, result.mls_group_id);

        (alice, bob, result.mls_group_id)
    }

    fn rumor(keys: &Keys, content: &str, created_at: u64) -> UnsignedEvent {
        let mut rumor = UnsignedEvent::new(
            keys.public_key(),
            Timestamp::from(created_at),
            Kind::Custom(9),
            vec![],
            content,
        );
        rumor.ensure_id();
        rumor
    }

    #[test]
    fn test_application_message_round_trip() {
        let (alice, bob, group_id) = joined_pair();
        let alice_keys = Keys::generate();

        let inner = rumor(&alice_keys, "hello bob", 1000);
        let serialized = alice
            .create_message_for_group(&group_id, &inner.as_json())
            .unwrap();

        match bob.process_message_for_group(&group_id, &serialized).unwrap() {
            ProcessMessageResult::ApplicationMessage(event) => {
                assert_eq!(event.content, "hello bob");
                assert_eq!(event.id, inner.id);
            }
            other => panic!("Expected application message, got {:?}", other),
        }
    }

    #[test]
    fn test_own_message_cannot_be_decrypted() {
        let (alice, _bob, group_id) = joined_pair();
        let keys = Keys::generate();
        let inner = rumor(&keys, "to myself", 1000);
        let serialized = alice
            .create_message_for_group(&group_id, &inner.as_json())
            .unwrap();

        assert!(matches!(
            alice.process_message_for_group(&group_id, &serialized),
            Err(NostrMlsError::CannotDecryptOwnMessage)
        ));
    }

    #[test]
    fn test_commit_advances_receiver_epoch() {
        let (alice, bob, group_id) = joined_pair();

        let pending = alice.self_update(&group_id).unwrap();
        let (new_epoch, _) = alice.merge_pending_commit(&group_id).unwrap();

        match bob
            .process_message_for_group(&group_id, &pending.serialized_commit)
            .unwrap()
        {
            ProcessMessageResult::Commit {
                new_epoch: bob_epoch,
                ..
            } => {
                assert_eq!(bob_epoch, new_epoch);
            }
            other => panic!("Expected commit, got {:?}", other),
        }
        assert_eq!(bob.group_epoch(&group_id).unwrap(), new_epoch);
    }

    #[test]
    fn test_future_epoch_message_surfaces_for_buffering() {
        let (alice, bob, group_id) = joined_pair();

        // Alice advances an epoch and then sends a message at the new epoch.
        let pending = alice.self_update(&group_id).unwrap();
        alice.merge_pending_commit(&group_id).unwrap();
        let keys = Keys::generate();
        let inner = rumor(&keys, "from the future", 2000);
        let serialized = alice
            .create_message_for_group(&group_id, &inner.as_json())
            .unwrap();

        // Bob sees the message before the commit
        match bob.process_message_for_group(&group_id, &serialized) {
            Err(NostrMlsError::FutureEpoch {
                message_epoch,
                current_epoch,
            }) => {
                assert_eq!(current_epoch + 1, message_epoch);
            }
            other => panic!("Expected FutureEpoch, got {:?}", other),
        }

        // After the commit arrives the same bytes process cleanly
        bob.process_message_for_group(&group_id, &pending.serialized_commit)
            .unwrap();
        match bob.process_message_for_group(&group_id, &serialized).unwrap() {
            ProcessMessageResult::ApplicationMessage(event) => {
                assert_eq!(event.content, "from the future");
            }
            other => panic!("Expected application message, got {:?}", other),
        }
    }

    #[test]
    fn test_stale_commit_is_ignored() {
        let (alice, bob, group_id) = joined_pair();

        let first = alice.self_update(&group_id).unwrap();
        alice.merge_pending_commit(&group_id).unwrap();
        bob.process_message_for_group(&group_id, &first.serialized_commit)
            .unwrap();

        // Replaying the old commit is a no-op
        match bob
            .process_message_for_group(&group_id, &first.serialized_commit)
            .unwrap()
        {
            ProcessMessageResult::StaleCommitIgnored => {}
            other => panic!("Expected stale commit, got {:?}", other),
        }
    }
}
