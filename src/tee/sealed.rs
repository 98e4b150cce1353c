//! Sealed storage: AES-256-GCM encryption bound to enclave identity.
//!
//! Wire format of a sealed entry: `IV (12 bytes) || TAG (16 bytes) || CIPHERTEXT`,
//! with the UTF-8 logical name as additional authenticated data. An entry
//! moved under another name, or opened by a store with a different sealing
//! key, fails authentication.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use aes_gcm::aead::{AeadCore, AeadInPlace, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{KmsError, Result};
use crate::lock::{read_lock, write_lock};
use crate::tee::boundary::Protected;

pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

const SEAL_KEY_PREFIX: &str = "tee-seal-key:";

/// 32-byte AES-256 sealing key, zeroized on drop.
pub type SealingKey = Zeroizing<[u8; 32]>;

/// Storage for secrets that only the current enclave identity can read back.
#[async_trait]
pub trait SealedStorage: Send + Sync {
    /// Encrypt `data` and store it under `name`, replacing any previous entry.
    async fn seal(&self, name: &str, data: &[u8]) -> Result<()>;

    /// Decrypt the entry stored under `name`.
    ///
    /// Any authentication failure is reported as `TamperDetected`.
    async fn unseal(&self, name: &str) -> Result<Protected<Vec<u8>>>;

    async fn has(&self, name: &str) -> bool;

    /// Remove an entry. Returns `true` if it existed.
    async fn delete(&self, name: &str) -> bool;

    /// Logical names of all sealed entries.
    async fn list(&self) -> Vec<String>;
}

/// Derive the sealing key from an enclave measurement.
pub fn derive_sealing_key(measurement: &str) -> SealingKey {
    let digest = Sha256::digest(format!("{SEAL_KEY_PREFIX}{measurement}").as_bytes());
    Zeroizing::new(digest.into())
}

/// Encrypt `data` into a sealed blob bound to `name`.
pub fn seal_blob(key: &[u8; 32], name: &str, data: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| KmsError::SealFailure(format!("Invalid sealing key: {e}")))?;

    let iv = Aes256Gcm::generate_nonce(&mut OsRng);
    let mut buffer = data.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(&iv, name.as_bytes(), &mut buffer)
        .map_err(|_| KmsError::SealFailure("Encryption failed".to_string()))?;

    let mut blob = Vec::with_capacity(IV_LEN + TAG_LEN + buffer.len());
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(&tag);
    blob.extend_from_slice(&buffer);
    Ok(blob)
}

/// Decrypt a sealed blob that was bound to `name`.
pub fn open_blob(key: &[u8; 32], name: &str, blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < IV_LEN + TAG_LEN {
        return Err(KmsError::TamperDetected);
    }

    let (iv, rest) = blob.split_at(IV_LEN);
    let (tag, ciphertext) = rest.split_at(TAG_LEN);

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| KmsError::SealFailure(format!("Invalid sealing key: {e}")))?;

    let mut buffer = ciphertext.to_vec();
    match cipher.decrypt_in_place_detached(
        Nonce::from_slice(iv),
        name.as_bytes(),
        &mut buffer,
        Tag::from_slice(tag),
    ) {
        Ok(()) => Ok(buffer),
        Err(_) => {
            buffer.zeroize();
            Err(KmsError::TamperDetected)
        }
    }
}

/// In-memory sealed store with a single AES-256-GCM sealing key.
///
/// The simulator builds it directly from its measurement. Hardware runtimes
/// create it empty and install a key obtained from the platform during
/// `initialize()`; until then every operation fails.
pub struct AesGcmSealedStore {
    key: OnceLock<SealingKey>,
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl AesGcmSealedStore {
    /// Store whose sealing key is derived from `measurement`.
    pub fn from_measurement(measurement: &str) -> Self {
        Self::with_key(derive_sealing_key(measurement))
    }

    pub fn with_key(key: SealingKey) -> Self {
        let store = Self::uninitialized();
        let _ = store.key.set(key);
        store
    }

    /// Store without a sealing key. Call [`install_key`](Self::install_key) before use.
    pub fn uninitialized() -> Self {
        Self {
            key: OnceLock::new(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Install the sealing key once. Re-installing the same key is a no-op.
    pub fn install_key(&self, key: SealingKey) -> Result<()> {
        match self.key.set(key) {
            Ok(()) => Ok(()),
            Err(rejected) => {
                if self.key.get().map(|k| k.as_slice()) == Some(rejected.as_slice()) {
                    Ok(())
                } else {
                    Err(KmsError::SealFailure(
                        "Sealing key already installed".to_string(),
                    ))
                }
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.key.get().is_some()
    }

    /// Drop every sealed entry. The sealing key is kept.
    pub fn clear(&self) {
        write_lock(&self.entries).clear();
    }

    /// Raw sealed blob for `name`, for provider-defined persistence.
    pub fn export_sealed(&self, name: &str) -> Option<Vec<u8>> {
        read_lock(&self.entries).get(name).cloned()
    }

    /// Store a raw sealed blob as-is. It is authenticated on unseal.
    pub fn import_sealed(&self, name: &str, blob: Vec<u8>) {
        write_lock(&self.entries).insert(name.to_string(), blob);
    }

    fn key(&self) -> Result<&SealingKey> {
        self.key
            .get()
            .ok_or_else(|| KmsError::SealFailure("Sealed storage not initialized".to_string()))
    }
}

#[async_trait]
impl SealedStorage for AesGcmSealedStore {
    async fn seal(&self, name: &str, data: &[u8]) -> Result<()> {
        let blob = seal_blob(self.key()?, name, data)?;
        write_lock(&self.entries).insert(name.to_string(), blob);
        tracing::debug!(name, "Sealed entry stored");
        Ok(())
    }

    async fn unseal(&self, name: &str) -> Result<Protected<Vec<u8>>> {
        let key = self.key()?;
        let blob = read_lock(&self.entries)
            .get(name)
            .cloned()
            .ok_or_else(|| KmsError::SealedEntryNotFound(name.to_string()))?;
        let plaintext = open_blob(key, name, &blob)?;
        Ok(Protected::locked(plaintext, format!("sealed:{name}")))
    }

    async fn has(&self, name: &str) -> bool {
        read_lock(&self.entries).contains_key(name)
    }

    async fn delete(&self, name: &str) -> bool {
        let removed = write_lock(&self.entries).remove(name).is_some();
        if removed {
            tracing::debug!(name, "Sealed entry deleted");
        }
        removed
    }

    async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = read_lock(&self.entries).keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_seal_unseal_roundtrip() {
        let store = AesGcmSealedStore::from_measurement("test-measurement");
        store.seal("secret", b"hello world").await.unwrap();
        let out = store.unseal("secret").await.unwrap();
        assert_eq!(out.expose().as_slice(), b"hello world");
    }

    #[tokio::test]
    async fn test_unseal_missing_entry() {
        let store = AesGcmSealedStore::from_measurement("m");
        let err = store.unseal("nope").await.unwrap_err();
        assert!(matches!(err, KmsError::SealedEntryNotFound(ref n) if n == "nope"));
    }

    #[tokio::test]
    async fn test_reseal_overwrites() {
        let store = AesGcmSealedStore::from_measurement("m");
        store.seal("k", b"first").await.unwrap();
        store.seal("k", b"second").await.unwrap();
        assert_eq!(store.unseal("k").await.unwrap().expose().as_slice(), b"second");
        assert_eq!(store.list().await, vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn test_has_delete_list() {
        let store = AesGcmSealedStore::from_measurement("m");
        store.seal("b", b"2").await.unwrap();
        store.seal("a", b"1").await.unwrap();
        assert!(store.has("a").await);
        assert_eq!(store.list().await, vec!["a".to_string(), "b".to_string()]);

        assert!(store.delete("a").await);
        assert!(!store.delete("a").await);
        assert!(!store.has("a").await);
        assert_eq!(store.list().await, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_blob_layout() {
        let store = AesGcmSealedStore::from_measurement("m");
        store.seal("k", &[0u8; 40]).await.unwrap();
        let blob = store.export_sealed("k").unwrap();
        assert_eq!(blob.len(), IV_LEN + TAG_LEN + 40);
    }

    #[tokio::test]
    async fn test_fresh_iv_per_seal() {
        let store = AesGcmSealedStore::from_measurement("m");
        store.seal("k", b"same").await.unwrap();
        let first = store.export_sealed("k").unwrap();
        store.seal("k", b"same").await.unwrap();
        let second = store.export_sealed("k").unwrap();
        assert_ne!(first[..IV_LEN], second[..IV_LEN]);
    }

    #[tokio::test]
    async fn test_tampered_ciphertext_detected() {
        let store = AesGcmSealedStore::from_measurement("m");
        store.seal("k", b"payload").await.unwrap();
        let mut blob = store.export_sealed("k").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        store.import_sealed("k", blob);
        let err = store.unseal("k").await.unwrap_err();
        assert!(matches!(err, KmsError::TamperDetected));
    }

    #[tokio::test]
    async fn test_renamed_entry_detected() {
        let store = AesGcmSealedStore::from_measurement("m");
        store.seal("derived:a", b"key-a").await.unwrap();
        let blob = store.export_sealed("derived:a").unwrap();
        store.import_sealed("derived:b", blob);
        let err = store.unseal("derived:b").await.unwrap_err();
        assert!(matches!(err, KmsError::TamperDetected));
    }

    #[tokio::test]
    async fn test_truncated_blob_detected() {
        let store = AesGcmSealedStore::from_measurement("m");
        store.import_sealed("short", vec![0u8; IV_LEN + TAG_LEN - 1]);
        let err = store.unseal("short").await.unwrap_err();
        assert!(matches!(err, KmsError::TamperDetected));
    }

    #[tokio::test]
    async fn test_other_measurement_cannot_unseal() {
        let m1 = AesGcmSealedStore::from_measurement("enclave-one");
        let m2 = AesGcmSealedStore::from_measurement("enclave-two");
        m1.seal("k", b"bound to m1").await.unwrap();
        m2.import_sealed("k", m1.export_sealed("k").unwrap());
        let err = m2.unseal("k").await.unwrap_err();
        assert!(matches!(err, KmsError::TamperDetected));
    }

    #[tokio::test]
    async fn test_uninitialized_store_fails() {
        let store = AesGcmSealedStore::uninitialized();
        assert!(!store.is_initialized());
        let err = store.seal("k", b"x").await.unwrap_err();
        assert!(err.to_string().contains("not initialized"));
        let err = store.unseal("k").await.unwrap_err();
        assert!(err.to_string().contains("not initialized"));
    }

    #[tokio::test]
    async fn test_install_key_once() {
        let store = AesGcmSealedStore::uninitialized();
        store.install_key(derive_sealing_key("m")).unwrap();
        store.install_key(derive_sealing_key("m")).unwrap();
        assert!(store.install_key(derive_sealing_key("other")).is_err());
        store.seal("k", b"v").await.unwrap();
        assert_eq!(store.unseal("k").await.unwrap().expose().as_slice(), b"v");
    }

    #[tokio::test]
    async fn test_clear_removes_entries() {
        let store = AesGcmSealedStore::from_measurement("m");
        store.seal("k", b"v").await.unwrap();
        store.clear();
        assert!(store.list().await.is_empty());
        assert!(store.is_initialized());
    }

    #[test]
    fn test_sealing_key_is_deterministic() {
        assert_eq!(*derive_sealing_key("m"), *derive_sealing_key("m"));
        assert_ne!(*derive_sealing_key("m"), *derive_sealing_key("n"));
    }

    proptest! {
        #[test]
        fn prop_seal_open_roundtrip(
            name in "[a-z:/0-9-]{1,40}",
            data in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let key = derive_sealing_key("prop-measurement");
            let blob = seal_blob(&key, &name, &data).unwrap();
            prop_assert_eq!(open_blob(&key, &name, &blob).unwrap(), data);
        }

        #[test]
        fn prop_cross_measurement_always_tampered(
            m1 in "[a-f0-9]{8,64}",
            m2 in "[a-f0-9]{8,64}",
            data in proptest::collection::vec(any::<u8>(), 0..256),
        ) {
            prop_assume!(m1 != m2);
            let blob = seal_blob(&derive_sealing_key(&m1), "entry", &data).unwrap();
            let err = open_blob(&derive_sealing_key(&m2), "entry", &blob).unwrap_err();
            prop_assert!(matches!(err, KmsError::TamperDetected));
        }
    }
}
