//! The request/response surface consumed by the UI bridge.
//!
//! Every command completes with a typed result or a [`CommandError`] whose
//! `kind` is a stable token the UI maps to localized strings. Long-running
//! commands emit progress through the signal bus instead of blocking.

use serde::Serialize;

use crate::accounts::AccountError;
use crate::groups::GroupError;
use crate::invites::InviteError;
use crate::key_packages::KeyPackageError;
use crate::messages::MessageError;
use crate::nostr_manager::NostrManagerError;
use crate::nostr_mls::NostrMlsError;
use crate::payments::PaymentError;
use crate::relays::RelayError;
use crate::secrets_store::SecretsStoreError;
use crate::InitError;

pub mod accounts;
pub mod groups;
pub mod invites;
pub mod key_packages;
pub mod messages;
pub mod nostr;
pub mod payments;

#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct CommandError {
    pub kind: String,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, CommandError>;

impl CommandError {
    pub fn new(kind: &str, message: impl std::fmt::Display) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.to_string(),
        }
    }
}

impl From<AccountError> for CommandError {
    fn from(err: AccountError) -> Self {
        let kind = match &err {
            AccountError::InvalidKey | AccountError::PublicKey(_) => "InvalidKey",
            AccountError::MissingPubkey
            | AccountError::AccountNotFound
            | AccountError::NoActiveAccount => "NoAccount",
            _ => "Internal",
        };
        CommandError::new(kind, err)
    }
}

impl From<NostrManagerError> for CommandError {
    fn from(err: NostrManagerError) -> Self {
        let kind = match &err {
            NostrManagerError::PublishUnreachable => "PublishUnreachable",
            NostrManagerError::SubscribeFailed(_) => "SubscribeFailed",
            NostrManagerError::Timeout => "Timeout",
            NostrManagerError::Cancelled => "Cancelled",
            _ => "Internal",
        };
        CommandError::new(kind, err)
    }
}

impl From<NostrMlsError> for CommandError {
    fn from(err: NostrMlsError) -> Self {
        let kind = match &err {
            NostrMlsError::KeyPackageMalformed(_) => "KeyPackageMalformed",
            NostrMlsError::KeyPackageInvalid(_) => "KeyPackageInvalid",
            NostrMlsError::UnsupportedCiphersuite => "KeyPackageCiphersuiteUnsupported",
            NostrMlsError::GroupNotFound => "GroupNotFound",
            NostrMlsError::Fork => "GroupForked",
            NostrMlsError::Welcome(_)
            | NostrMlsError::Message(_)
            | NostrMlsError::CannotDecryptOwnMessage
            | NostrMlsError::FutureEpoch { .. } => "DecryptFailed",
            _ => "Internal",
        };
        CommandError::new(kind, err)
    }
}

impl From<GroupError> for CommandError {
    fn from(err: GroupError) -> Self {
        match err {
            GroupError::GroupNotFound => CommandError::new("GroupNotFound", err),
            GroupError::GroupClosed => CommandError::new("GroupClosed", err),
            GroupError::GroupForked => CommandError::new("GroupForked", err),
            GroupError::InvalidParameters(_) => CommandError::new("EventMalformed", err),
            GroupError::Account(inner) => inner.into(),
            GroupError::Mls(inner) => inner.into(),
            _ => CommandError::new("Internal", err),
        }
    }
}

impl From<KeyPackageError> for CommandError {
    fn from(err: KeyPackageError) -> Self {
        match err {
            KeyPackageError::NoValidKeyPackage(_) | KeyPackageError::FetchingKeyPackage(_) => {
                CommandError::new("NoKeyPackage", err)
            }
            KeyPackageError::AlreadyUsed => CommandError::new("KeyPackageAlreadyUsed", err),
            KeyPackageError::NostrMls(inner) => inner.into(),
            KeyPackageError::NostrManager(inner) => inner.into(),
            KeyPackageError::Account(inner) => inner.into(),
            _ => CommandError::new("Internal", err),
        }
    }
}

impl From<InviteError> for CommandError {
    fn from(err: InviteError) -> Self {
        match err {
            InviteError::NotFound => CommandError::new("GroupNotFound", err),
            InviteError::Account(inner) => inner.into(),
            _ => CommandError::new("Internal", err),
        }
    }
}

impl From<MessageError> for CommandError {
    fn from(err: MessageError) -> Self {
        match err {
            MessageError::Account(inner) => inner.into(),
            _ => CommandError::new("Internal", err),
        }
    }
}

impl From<PaymentError> for CommandError {
    fn from(err: PaymentError) -> Self {
        CommandError::new("WalletUnavailable", err)
    }
}

impl From<RelayError> for CommandError {
    fn from(err: RelayError) -> Self {
        match &err {
            RelayError::InvalidUrl(_) => CommandError::new("EventMalformed", err),
            _ => CommandError::new("Internal", err),
        }
    }
}

impl From<SecretsStoreError> for CommandError {
    fn from(err: SecretsStoreError) -> Self {
        CommandError::new("Internal", err)
    }
}

impl From<InitError> for CommandError {
    fn from(err: InitError) -> Self {
        match err {
            InitError::Account(inner) => inner.into(),
            InitError::Nostr(inner) => inner.into(),
            InitError::Mls(inner) => inner.into(),
            _ => CommandError::new("Internal", err),
        }
    }
}

/// Wipes all local data: database, MLS state, wrapped secrets.
pub async fn delete_data(murmur: &crate::Murmur) -> Result<()> {
    murmur.delete_all_data().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_tokens_are_stable() {
        let err: CommandError = AccountError::InvalidKey.into();
        assert_eq!(err.kind, "InvalidKey");

        let err: CommandError = AccountError::NoActiveAccount.into();
        assert_eq!(err.kind, "NoAccount");

        let err: CommandError = NostrManagerError::PublishUnreachable.into();
        assert_eq!(err.kind, "PublishUnreachable");

        let err: CommandError = NostrManagerError::Timeout.into();
        assert_eq!(err.kind, "Timeout");

        let err: CommandError = NostrMlsError::UnsupportedCiphersuite.into();
        assert_eq!(err.kind, "KeyPackageCiphersuiteUnsupported");

        let err: CommandError = GroupError::GroupForked.into();
        assert_eq!(err.kind, "GroupForked");

        let err: CommandError = KeyPackageError::AlreadyUsed.into();
        assert_eq!(err.kind, "KeyPackageAlreadyUsed");

        // Nested errors keep their specific token through the wrapper
        let err: CommandError =
            KeyPackageError::NostrMls(NostrMlsError::KeyPackageMalformed("bad".into())).into();
        assert_eq!(err.kind, "KeyPackageMalformed");
    }
}
