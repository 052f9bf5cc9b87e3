//! The Nostr MLS engine.
//!
//! Owns all MLS state: credentials, key packages, group state, epoch
//! secrets. Everything here is synchronous; async orchestration (publishes,
//! per-group serialization of inbound traffic) lives in the callers.

pub mod groups;
pub mod key_packages;
pub mod messages;
pub mod nostr_group_data;
pub mod welcomes;

use nostr_sdk::prelude::Event;
use openmls::prelude::*;
use openmls_memory_storage::MemoryStorage;
use openmls_rust_crypto::RustCrypto;
use openmls_traits::OpenMlsProvider;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;

pub const DEFAULT_CIPHERSUITE: Ciphersuite = Ciphersuite::MLS_128_DHKEMX25519_AES128GCM_SHA256_Ed25519;
pub const DEFAULT_EXTENSIONS: &[ExtensionType] = &[
    ExtensionType::RequiredCapabilities,
    ExtensionType::LastResort,
    ExtensionType::Unknown(0xFF69),
];

/// Out-of-epoch messages buffered per group before the matching commit
/// arrives. Beyond this the oldest buffered message is dropped.
pub const EPOCH_BUFFER_CAP: usize = 64;

#[derive(Error, Debug)]
pub enum NostrMlsError {
    #[error("Key package malformed: {0}")]
    KeyPackageMalformed(String),

    #[error("Key package invalid: {0}")]
    KeyPackageInvalid(String),

    #[error("Key package ciphersuite unsupported")]
    UnsupportedCiphersuite,

    #[error("Group error: {0}")]
    Group(String),

    #[error("Group not found")]
    GroupNotFound,

    #[error("Welcome error: {0}")]
    Welcome(String),

    #[error("Message error: {0}")]
    Message(String),

    #[error("Cannot decrypt own message")]
    CannotDecryptOwnMessage,

    #[error("Message epoch {message_epoch} is ahead of group epoch {current_epoch}")]
    FutureEpoch {
        message_epoch: u64,
        current_epoch: u64,
    },

    #[error("Commit does not apply to the stored tree")]
    Fork,

    #[error("Protocol message group id does not match")]
    ProtocolGroupIdMismatch,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("TLS codec error: {0}")]
    Tls(#[from] tls_codec::Error),
}

pub type Result<T> = std::result::Result<T, NostrMlsError>;

pub struct NostrMlsProvider {
    crypto: RustCrypto,
    key_store: MemoryStorage,
}

impl OpenMlsProvider for NostrMlsProvider {
    type CryptoProvider = RustCrypto;
    type RandProvider = RustCrypto;
    type StorageProvider = MemoryStorage;

    fn storage(&self) -> &Self::StorageProvider {
        &self.key_store
    }

    fn crypto(&self) -> &Self::CryptoProvider {
        &self.crypto
    }

    fn rand(&self) -> &Self::RandProvider {
        &self.crypto
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StateSnapshot {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

pub struct NostrMls {
    pub ciphersuite: Ciphersuite,
    pub extensions: Vec<ExtensionType>,
    pub(crate) provider: NostrMlsProvider,
    current_identity: RwLock<Option<String>>,
    group_locks: Mutex<HashMap<Vec<u8>, Arc<tokio::sync::Mutex<()>>>>,
    epoch_buffers: Mutex<HashMap<Vec<u8>, VecDeque<Event>>>,
    buffered_dropped: AtomicU64,
}

impl NostrMls {
    pub fn new(current_identity: Option<String>) -> Self {
        Self {
            ciphersuite: DEFAULT_CIPHERSUITE,
            extensions: DEFAULT_EXTENSIONS.to_vec(),
            provider: NostrMlsProvider {
                crypto: RustCrypto::default(),
                key_store: MemoryStorage::default(),
            },
            current_identity: RwLock::new(current_identity),
            group_locks: Mutex::new(HashMap::new()),
            epoch_buffers: Mutex::new(HashMap::new()),
            buffered_dropped: AtomicU64::new(0),
        }
    }

    pub fn current_identity(&self) -> Option<String> {
        self.current_identity.read().unwrap().clone()
    }

    /// Switches the engine to a different identity. All in-memory MLS state
    /// belongs to a single identity, so the store is cleared; the caller
    /// restores the latest persisted snapshot for the new identity.
    pub fn set_current_identity(&self, current_identity: Option<String>) {
        *self.current_identity.write().unwrap() = current_identity.clone();
        self.provider.key_store.values.write().unwrap().clear();
        self.group_locks.lock().unwrap().clear();
        self.epoch_buffers.lock().unwrap().clear();
        tracing::debug!(
            target: "murmur::nostr_mls::set_current_identity",
            "Switched MLS identity to {:?}",
            current_identity
        );
    }

    pub fn ciphersuite_value(&self) -> u16 {
        self.ciphersuite.into()
    }

    pub fn extensions_value(&self) -> String {
        self.extensions
            .iter()
            .map(|e| format!("{:?}", e))
            .collect::<Vec<String>>()
            .join(",")
    }

    pub(crate) fn capabilities(&self) -> Capabilities {
        Capabilities::new(
            None,
            Some(&[self.ciphersuite]),
            Some(&self.extensions),
            None,
            None,
        )
    }

    /// Serializes the whole MLS store. Persisted after every state mutation
    /// so group state survives restarts.
    pub fn serialize_state(&self) -> Result<Vec<u8>> {
        let entries = self
            .provider
            .key_store
            .values
            .read()
            .map_err(|_| NostrMlsError::Storage("poisoned storage lock".to_string()))?
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        serde_json::to_vec(&StateSnapshot { entries })
            .map_err(|e| NostrMlsError::Storage(e.to_string()))
    }

    /// Restores the MLS store from a snapshot produced by
    /// [`NostrMls::serialize_state`].
    pub fn restore_state(&self, bytes: &[u8]) -> Result<()> {
        let snapshot: StateSnapshot =
            serde_json::from_slice(bytes).map_err(|e| NostrMlsError::Storage(e.to_string()))?;
        let values: HashMap<Vec<u8>, Vec<u8>> = snapshot.entries.into_iter().collect();
        *self
            .provider
            .key_store
            .values
            .write()
            .map_err(|_| NostrMlsError::Storage("poisoned storage lock".to_string()))? = values;
        Ok(())
    }

    /// Returns the exclusive section for a group. Inbound processing and
    /// commit creation for the same group must hold this lock.
    pub fn group_lock(&self, mls_group_id: &[u8]) -> Arc<tokio::sync::Mutex<()>> {
        self.group_locks
            .lock()
            .unwrap()
            .entry(mls_group_id.to_vec())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Buffers an event that arrived encrypted to a future epoch. Bounded at
    /// [`EPOCH_BUFFER_CAP`]; overflow drops the oldest buffered event.
    pub fn buffer_out_of_epoch(&self, mls_group_id: &[u8], event: Event) {
        let mut buffers = self.epoch_buffers.lock().unwrap();
        let buffer = buffers.entry(mls_group_id.to_vec()).or_default();
        if buffer.iter().any(|e| e.id == event.id) {
            return;
        }
        if buffer.len() >= EPOCH_BUFFER_CAP {
            buffer.pop_front();
            self.buffered_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                target: "murmur::nostr_mls::buffer_out_of_epoch",
                "Epoch buffer overflow for group {}, dropped oldest",
                hex::encode(mls_group_id)
            );
        }
        buffer.push_back(event);
    }

    /// Drains the buffered events for a group in (created_at, id) order.
    /// Called after a commit advances the epoch.
    pub fn take_buffered(&self, mls_group_id: &[u8]) -> Vec<Event> {
        let mut buffers = self.epoch_buffers.lock().unwrap();
        let mut events: Vec<Event> = buffers
            .remove(mls_group_id)
            .map(|buffer| buffer.into_iter().collect())
            .unwrap_or_default();
        events.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.to_hex().cmp(&b.id.to_hex()))
        });
        events
    }

    pub fn buffered_count(&self, mls_group_id: &[u8]) -> usize {
        self.epoch_buffers
            .lock()
            .unwrap()
            .get(mls_group_id)
            .map(|buffer| buffer.len())
            .unwrap_or(0)
    }

    pub fn dropped_buffered_count(&self) -> u64 {
        self.buffered_dropped.load(Ordering::Relaxed)
    }

    /// Clears all in-memory state. Used by `delete_data`.
    pub fn delete_data(&self) {
        tracing::debug!(target: "murmur::nostr_mls::delete_data", "Deleting MLS data");
        self.provider.key_store.values.write().unwrap().clear();
        self.group_locks.lock().unwrap().clear();
        self.epoch_buffers.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_sdk::prelude::*;

    pub(crate) fn create_test_mls() -> NostrMls {
        NostrMls::new(Some(Keys::generate().public_key().to_hex()))
    }

    async fn test_event(created_at: u64, content: &str) -> Event {
        let keys = Keys::generate();
        EventBuilder::new(Kind::MlsGroupMessage, content)
            .custom_created_at(Timestamp::from(created_at))
            .sign(&keys)
            .await
            .expect("Failed to sign")
    }

    #[tokio::test]
    async fn test_epoch_buffer_orders_by_created_at_then_id() {
        let mls = create_test_mls();
        let group_id = vec![1u8; 8];

        let late = test_event(2000, "late").await;
        let early = test_event(1000, "early").await;
        mls.buffer_out_of_epoch(&group_id, late.clone());
        mls.buffer_out_of_epoch(&group_id, early.clone());

        let drained = mls.take_buffered(&group_id);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].id, early.id);
        assert_eq!(drained[1].id, late.id);
        assert_eq!(mls.buffered_count(&group_id), 0);
    }

    #[tokio::test]
    async fn test_epoch_buffer_drops_oldest_beyond_cap() {
        let mls = create_test_mls();
        let group_id = vec![2u8; 8];

        let first = test_event(1, "first").await;
        mls.buffer_out_of_epoch(&group_id, first.clone());
        for i in 0..EPOCH_BUFFER_CAP {
            mls.buffer_out_of_epoch(&group_id, test_event(100 + i as u64, "filler").await);
        }

        assert_eq!(mls.buffered_count(&group_id), EPOCH_BUFFER_CAP);
        assert_eq!(mls.dropped_buffered_count(), 1);
        let drained = mls.take_buffered(&group_id);
        assert!(drained.iter().all(|e| e.id != first.id));
    }

    #[tokio::test]
    async fn test_epoch_buffer_dedups_by_event_id() {
        let mls = create_test_mls();
        let group_id = vec![3u8; 8];
        let event = test_event(1000, "dup").await;
        mls.buffer_out_of_epoch(&group_id, event.clone());
        mls.buffer_out_of_epoch(&group_id, event);
        assert_eq!(mls.buffered_count(&group_id), 1);
    }

    #[test]
    fn test_state_snapshot_round_trip() {
        let mls = create_test_mls();
        mls.provider
            .key_store
            .values
            .write()
            .unwrap()
            .insert(b"key".to_vec(), b"value".to_vec());

        let snapshot = mls.serialize_state().expect("serialize failed");

        let other = create_test_mls();
        other.restore_state(&snapshot).expect("restore failed");
        let values = other.provider.key_store.values.read().unwrap();
        assert_eq!(values.get(&b"key".to_vec()), Some(&b"value".to_vec()));
    }
}
