use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose, Engine as _};
use nostr_sdk::Keys;
use rand::RngCore;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

const SECRETS_FILE: &str = "secrets.json";
const MASTER_KEY_FILE: &str = "master.key";
const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum SecretsStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Key error: {0}")]
    Key(#[from] nostr_sdk::key::Error),

    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    #[error("Encryption error")]
    Encryption,

    #[error("Store is locked, unlock required")]
    Locked,
}

pub type Result<T> = std::result::Result<T, SecretsStoreError>;

/// Encrypted at-rest storage for account secret keys, per-epoch MLS exporter
/// secrets, and NWC wallet URIs.
///
/// Every value is wrapped with a process master key (AES-256-GCM) before it
/// touches disk. With lockdown mode the master key is dropped from memory on
/// account switch and must be re-loaded with [`SecretsStore::unlock`] before
/// any secret can be read.
pub struct SecretsStore {
    file_path: PathBuf,
    master_key_path: PathBuf,
    master_key: Mutex<Option<[u8; 32]>>,
}

impl SecretsStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            file_path: data_dir.join(SECRETS_FILE),
            master_key_path: data_dir.join(MASTER_KEY_FILE),
            master_key: Mutex::new(None),
        }
    }

    /// Loads (or creates on first run) the process master key.
    pub fn unlock(&self) -> Result<()> {
        let key = if self.master_key_path.exists() {
            let encoded = fs::read_to_string(&self.master_key_path)?;
            let bytes = general_purpose::STANDARD_NO_PAD.decode(encoded.trim())?;
            let mut key = [0u8; 32];
            if bytes.len() != 32 {
                return Err(SecretsStoreError::Encryption);
            }
            key.copy_from_slice(&bytes);
            key
        } else {
            let mut key = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut key);
            fs::write(
                &self.master_key_path,
                general_purpose::STANDARD_NO_PAD.encode(key),
            )?;
            key
        };
        *self.master_key.lock().unwrap() = Some(key);
        Ok(())
    }

    /// Drops the cached master key. Subsequent reads fail with `Locked` until
    /// [`SecretsStore::unlock`] is called again. Used by lockdown mode.
    pub fn lock(&self) {
        *self.master_key.lock().unwrap() = None;
    }

    pub fn is_locked(&self) -> bool {
        self.master_key.lock().unwrap().is_none()
    }

    fn master_key(&self) -> Result<[u8; 32]> {
        self.master_key
            .lock()
            .unwrap()
            .ok_or(SecretsStoreError::Locked)
    }

    fn wrap(&self, plaintext: &str) -> Result<String> {
        let key_bytes = self.master_key()?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| SecretsStoreError::Encryption)?;
        let mut out = nonce_bytes.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(general_purpose::STANDARD_NO_PAD.encode(out))
    }

    fn unwrap(&self, wrapped: &str) -> Result<String> {
        let key_bytes = self.master_key()?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        let decoded = general_purpose::STANDARD_NO_PAD.decode(wrapped)?;
        if decoded.len() < NONCE_LEN {
            return Err(SecretsStoreError::Encryption);
        }
        let (nonce_bytes, ciphertext) = decoded.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| SecretsStoreError::Encryption)?;
        String::from_utf8(plaintext).map_err(|_| SecretsStoreError::Encryption)
    }

    fn read_secrets_file(&self) -> Result<Value> {
        let content = fs::read_to_string(&self.file_path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn write_secrets_file(&self, secrets: &Value) -> Result<()> {
        let content = serde_json::to_string_pretty(secrets)?;
        fs::write(&self.file_path, content)?;
        Ok(())
    }

    fn put(&self, name: &str, value: &str) -> Result<()> {
        let mut secrets = self.read_secrets_file().unwrap_or(json!({}));
        secrets[name] = json!(self.wrap(value)?);
        self.write_secrets_file(&secrets)
    }

    fn get(&self, name: &str) -> Result<String> {
        let secrets = self.read_secrets_file()?;
        let wrapped = secrets[name]
            .as_str()
            .ok_or_else(|| SecretsStoreError::SecretNotFound(name.to_string()))?;
        self.unwrap(wrapped)
    }

    fn remove(&self, name: &str) -> Result<()> {
        if let Ok(mut secrets) = self.read_secrets_file() {
            if let Some(obj) = secrets.as_object_mut() {
                obj.remove(name);
            }
            self.write_secrets_file(&secrets)?;
        }
        Ok(())
    }

    /// Stores the private key for the given keypair, keyed by public key.
    pub fn store_private_key(&self, keys: &Keys) -> Result<()> {
        self.put(
            &keys.public_key().to_hex(),
            keys.secret_key().to_secret_hex().as_str(),
        )
    }

    /// Retrieves the keypair for a given hex public key.
    pub fn get_nostr_keys_for_pubkey(&self, pubkey: &str) -> Result<Keys> {
        let private_key = self.get(pubkey)?;
        Ok(Keys::parse(&private_key)?)
    }

    /// Removes the private key for a given hex public key. Idempotent.
    pub fn remove_private_key_for_pubkey(&self, pubkey: &str) -> Result<()> {
        self.remove(pubkey)
    }

    /// Stores the MLS exporter secret for a specific group and epoch.
    pub fn store_mls_export_secret(
        &self,
        group_id: &[u8],
        epoch: u64,
        secret_hex: &str,
    ) -> Result<()> {
        let name = format!("{}:{}", hex::encode(group_id), epoch);
        self.put(&name, secret_hex)
    }

    /// Retrieves the exporter secret for a (group, epoch) as Nostr keys.
    pub fn get_export_secret_keys_for_group(&self, group_id: &[u8], epoch: u64) -> Result<Keys> {
        let name = format!("{}:{}", hex::encode(group_id), epoch);
        let secret = self.get(&name)?;
        Ok(Keys::parse(&secret)?)
    }

    /// Stores the NWC wallet URI for an account.
    pub fn store_nostr_wallet_connect_uri(&self, pubkey: &str, uri: &str) -> Result<()> {
        self.put(&format!("nwc:{}", pubkey), uri)
    }

    pub fn get_nostr_wallet_connect_uri(&self, pubkey: &str) -> Result<String> {
        self.get(&format!("nwc:{}", pubkey))
    }

    pub fn remove_nostr_wallet_connect_uri(&self, pubkey: &str) -> Result<()> {
        self.remove(&format!("nwc:{}", pubkey))
    }

    /// Deletes the secrets file and the cached master key.
    pub fn delete_data(&self) -> Result<()> {
        if self.file_path.exists() {
            fs::remove_file(&self.file_path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup_store() -> SecretsStore {
        let dir = tempdir().expect("Couldn't create temp dir");
        let store = SecretsStore::new(dir.path());
        store.unlock().expect("Couldn't unlock store");
        std::mem::forget(dir);
        store
    }

    #[test]
    fn test_store_and_retrieve_private_key() {
        let store = setup_store();
        let keys = Keys::generate();
        let pubkey = keys.public_key().to_hex();

        store.store_private_key(&keys).expect("store failed");

        let retrieved_keys = store
            .get_nostr_keys_for_pubkey(&pubkey)
            .expect("retrieve failed");

        assert_eq!(keys.public_key(), retrieved_keys.public_key());
        assert_eq!(keys.secret_key(), retrieved_keys.secret_key());
    }

    #[test]
    fn test_remove_private_key() {
        let store = setup_store();
        let keys = Keys::generate();
        let pubkey = keys.public_key().to_hex();

        store.store_private_key(&keys).expect("store failed");
        store
            .remove_private_key_for_pubkey(&pubkey)
            .expect("remove failed");

        assert!(store.get_nostr_keys_for_pubkey(&pubkey).is_err());
    }

    #[test]
    fn test_get_nonexistent_key() {
        let store = setup_store();
        assert!(store.get_nostr_keys_for_pubkey("nonexistent").is_err());
    }

    #[test]
    fn test_store_and_retrieve_mls_export_secret() {
        let store = setup_store();
        let group_id = b"test_group".to_vec();
        let epoch = 42;
        let secret = "9b9da9c6ee9a62016ab2db1a3397d267a575c02266c6ca9b5ec8e015db67c30e";

        store
            .store_mls_export_secret(&group_id, epoch, secret)
            .expect("store failed");

        let retrieved_keys = store
            .get_export_secret_keys_for_group(&group_id, epoch)
            .expect("retrieve failed");

        assert_eq!(retrieved_keys.secret_key().to_secret_hex(), secret);
    }

    #[test]
    fn test_get_nonexistent_mls_export_secret() {
        let store = setup_store();
        assert!(store
            .get_export_secret_keys_for_group(b"nonexistent", 999)
            .is_err());
    }

    #[test]
    fn test_locked_store_refuses_reads() {
        let store = setup_store();
        let keys = Keys::generate();
        store.store_private_key(&keys).expect("store failed");

        store.lock();
        assert!(store.is_locked());
        assert!(matches!(
            store.get_nostr_keys_for_pubkey(&keys.public_key().to_hex()),
            Err(SecretsStoreError::Locked)
        ));

        store.unlock().expect("Couldn't unlock store");
        assert!(store
            .get_nostr_keys_for_pubkey(&keys.public_key().to_hex())
            .is_ok());
    }

    #[test]
    fn test_wallet_connect_uri_round_trip() {
        let store = setup_store();
        let pubkey = "aa4fc8665f5696e33db7e1a572e3b0f5b3d615837b0f362dcb1c8068b098c7b4";
        let uri = "nostr+walletconnect://b889...?relay=wss://relay.example.com&secret=71a8...";

        store
            .store_nostr_wallet_connect_uri(pubkey, uri)
            .expect("store failed");
        assert_eq!(
            store.get_nostr_wallet_connect_uri(pubkey).expect("get"),
            uri
        );
        store
            .remove_nostr_wallet_connect_uri(pubkey)
            .expect("remove failed");
        assert!(store.get_nostr_wallet_connect_uri(pubkey).is_err());
    }
}
