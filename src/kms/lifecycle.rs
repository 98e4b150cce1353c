//! Key lifecycle: create, rotate and revoke agent keys.
//!
//! State machine per key: `active -> rotated` or `active -> revoked`.
//! Operations on one agent are serialized by a per-agent async mutex, so
//! epochs stay strictly increasing and an agent never has two keys racing
//! into the same epoch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::OwnedMutexGuard;

use crate::error::{KmsError, Result};
use crate::kms::derivation::{
    build_key_id, derive_address, derive_child_key, public_key_hex, DerivationPath,
};
use crate::kms::key_store::KeyMetadataStore;
use crate::kms::root_key::RootKeyManager;
use crate::kms::types::{
    CreateKeyRequest, CreatedKey, KeyMetadata, KeyStatus, RotatedKey,
};
use crate::lock::lock;
use crate::tee::boundary::Protected;
use crate::tee::sealed::SealedStorage;

pub struct KeyLifecycleManager {
    root_keys: Arc<RootKeyManager>,
    key_store: Arc<KeyMetadataStore>,
    storage: Arc<dyn SealedStorage>,
    agent_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Fail with `KeyNotActive` unless the key can still sign.
pub fn ensure_active(meta: &KeyMetadata) -> Result<()> {
    if meta.is_active() {
        Ok(())
    } else {
        Err(KmsError::KeyNotActive {
            key_id: meta.id.to_string(),
            status: meta.status.to_string(),
        })
    }
}

impl KeyLifecycleManager {
    pub fn new(
        root_keys: Arc<RootKeyManager>,
        key_store: Arc<KeyMetadataStore>,
        storage: Arc<dyn SealedStorage>,
    ) -> Self {
        Self {
            root_keys,
            key_store,
            storage,
            agent_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn key_store(&self) -> &Arc<KeyMetadataStore> {
        &self.key_store
    }

    pub fn sealed_storage(&self) -> &Arc<dyn SealedStorage> {
        &self.storage
    }

    /// Acquire the lifecycle lock of an agent.
    ///
    /// Signing holds the same guard while it checks key status and signs,
    /// so a rotation cannot interleave with a signature.
    pub async fn lock_agent(&self, agent_id: &str) -> OwnedMutexGuard<()> {
        let agent_lock = lock(&self.agent_locks)
            .entry(agent_id.to_string())
            .or_default()
            .clone();
        agent_lock.lock_owned().await
    }

    /// Derive, seal and register the next-epoch key for an agent.
    pub async fn create_key(&self, request: &CreateKeyRequest) -> Result<CreatedKey> {
        let _guard = self.lock_agent(&request.agent_id).await;
        self.create_key_locked(request).await
    }

    async fn create_key_locked(&self, request: &CreateKeyRequest) -> Result<CreatedKey> {
        let epoch = match self.key_store.get_current_epoch(&request.agent_id) {
            Some(current) => current.checked_add(1).ok_or_else(|| {
                KmsError::InvalidInput(format!("Epoch overflow for agent {}", request.agent_id))
            })?,
            None => 0,
        };

        let path = DerivationPath::new(request.agent_id.clone(), request.purpose, epoch);
        let key_id = build_key_id(&path);

        let child_key = {
            let root_key = self.root_keys.private_key().await?;
            derive_child_key(root_key.expose(), &path)?
        };
        let address = derive_address(child_key.expose())?;
        let public_key = public_key_hex(child_key.expose())?;

        self.storage
            .seal(&key_id.sealed_name(), child_key.expose())
            .await?;
        drop(child_key);

        self.key_store.register(KeyMetadata {
            id: key_id.clone(),
            algorithm: request.algorithm,
            status: KeyStatus::Active,
            purpose: request.purpose,
            agent_id: request.agent_id.clone(),
            epoch,
            ethereum_address: address.clone(),
            created_at: Utc::now(),
            rotated_at: None,
            revoked_at: None,
        })?;

        tracing::info!(
            key_id = %key_id,
            agent_id = %request.agent_id,
            epoch,
            address = %address,
            "Key created"
        );

        Ok(CreatedKey {
            key_id,
            address,
            public_key,
        })
    }

    /// Retire an active key and mint the agent's next epoch.
    pub async fn rotate_key(&self, key_id: &str) -> Result<RotatedKey> {
        let agent_id = self.lookup(key_id)?.agent_id;
        let _guard = self.lock_agent(&agent_id).await;

        let meta = self.lookup(key_id)?;
        ensure_active(&meta)?;

        // The old key stays active until its successor is sealed and registered.
        let created = self
            .create_key_locked(&CreateKeyRequest {
                agent_id: meta.agent_id.clone(),
                purpose: meta.purpose,
                algorithm: meta.algorithm,
            })
            .await?;
        self.key_store.update_status(key_id, KeyStatus::Rotated)?;

        let epoch = self
            .key_store
            .get(created.key_id.as_str())
            .map(|m| m.epoch)
            .ok_or_else(|| KmsError::KeyNotFound(created.key_id.to_string()))?;

        tracing::info!(
            previous_key_id = %meta.id,
            new_key_id = %created.key_id,
            epoch,
            "Key rotated"
        );

        Ok(RotatedKey {
            previous_key_id: meta.id,
            new_key_id: created.key_id,
            new_address: created.address,
            new_public_key: created.public_key,
            epoch,
        })
    }

    /// Permanently revoke a key and destroy its sealed secret.
    pub async fn revoke_key(&self, key_id: &str) -> Result<()> {
        let meta = self.lookup(key_id)?;
        let _guard = self.lock_agent(&meta.agent_id).await;

        self.key_store.update_status(key_id, KeyStatus::Revoked)?;
        self.storage.delete(&meta.id.sealed_name()).await;

        tracing::info!(key_id = %meta.id, agent_id = %meta.agent_id, "Key revoked");
        Ok(())
    }

    /// Unseal the private key of an active key.
    ///
    /// Never hand the result across the enclave boundary.
    pub async fn private_key(&self, key_id: &str) -> Result<Protected<Vec<u8>>> {
        let meta = self.lookup(key_id)?;
        ensure_active(&meta)?;
        self.storage.unseal(&meta.id.sealed_name()).await
    }

    fn lookup(&self, key_id: &str) -> Result<KeyMetadata> {
        self.key_store
            .get(key_id)
            .ok_or_else(|| KmsError::KeyNotFound(key_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::root_key::ROOT_PRIVATE_KEY_NAME;
    use crate::kms::types::KeyPurpose;
    use crate::tee::sealed::AesGcmSealedStore;

    async fn setup() -> (Arc<KeyLifecycleManager>, Arc<KeyMetadataStore>, Arc<AesGcmSealedStore>) {
        let store = Arc::new(AesGcmSealedStore::from_measurement("lifecycle-test"));
        let root = Arc::new(RootKeyManager::new(store.clone()));
        root.initialize(None).await.unwrap();
        let key_store = Arc::new(KeyMetadataStore::new());
        let lifecycle = Arc::new(KeyLifecycleManager::new(
            root,
            key_store.clone(),
            store.clone(),
        ));
        (lifecycle, key_store, store)
    }

    fn signing(agent: &str) -> CreateKeyRequest {
        CreateKeyRequest::new(agent, KeyPurpose::Signing)
    }

    #[tokio::test]
    async fn test_create_key() {
        let (lifecycle, key_store, store) = setup().await;
        let created = lifecycle.create_key(&signing("agent-1")).await.unwrap();
        assert_eq!(created.key_id.as_str(), "agent-1/signing/epoch-0");
        assert!(created.address.starts_with("0x"));
        assert_eq!(created.public_key.len(), 130);

        let meta = key_store.get(created.key_id.as_str()).unwrap();
        assert_eq!(meta.status, KeyStatus::Active);
        assert_eq!(meta.ethereum_address, created.address);
        assert!(store.has("derived:agent-1/signing/epoch-0").await);
    }

    #[tokio::test]
    async fn test_epochs_increase_and_rotation_continues() {
        let (lifecycle, key_store, _) = setup().await;
        let mut epochs = Vec::new();
        for _ in 0..3 {
            let created = lifecycle.create_key(&signing("a")).await.unwrap();
            epochs.push(key_store.get(created.key_id.as_str()).unwrap().epoch);
        }
        assert_eq!(epochs, vec![0, 1, 2]);

        let rotated = lifecycle.rotate_key("a/signing/epoch-0").await.unwrap();
        assert_eq!(rotated.epoch, 3);
        assert_eq!(rotated.previous_key_id.as_str(), "a/signing/epoch-0");
        assert_eq!(rotated.new_key_id.as_str(), "a/signing/epoch-3");
        assert_eq!(
            key_store.get("a/signing/epoch-0").unwrap().status,
            KeyStatus::Rotated
        );
        assert!(key_store.get("a/signing/epoch-0").unwrap().rotated_at.is_some());
    }

    #[tokio::test]
    async fn test_agents_have_independent_epochs() {
        let (lifecycle, _, _) = setup().await;
        lifecycle.create_key(&signing("a")).await.unwrap();
        lifecycle.create_key(&signing("a")).await.unwrap();
        let b = lifecycle.create_key(&signing("b")).await.unwrap();
        assert_eq!(b.key_id.as_str(), "b/signing/epoch-0");
    }

    #[tokio::test]
    async fn test_created_key_matches_sealed_secret() {
        let (lifecycle, _, _) = setup().await;
        let created = lifecycle.create_key(&signing("a")).await.unwrap();
        let secret = lifecycle.private_key(created.key_id.as_str()).await.unwrap();
        assert_eq!(secret.len(), 32);
        assert_eq!(derive_address(secret.expose()).unwrap(), created.address);
        assert_eq!(public_key_hex(secret.expose()).unwrap(), created.public_key);
    }

    #[tokio::test]
    async fn test_rotate_unknown_key() {
        let (lifecycle, _, _) = setup().await;
        let err = lifecycle.rotate_key("nope/signing/epoch-0").await.unwrap_err();
        assert!(matches!(err, KmsError::KeyNotFound(_)));
    }

    #[tokio::test]
    async fn test_rotate_twice_fails() {
        let (lifecycle, _, _) = setup().await;
        let created = lifecycle.create_key(&signing("a")).await.unwrap();
        lifecycle.rotate_key(created.key_id.as_str()).await.unwrap();
        let err = lifecycle.rotate_key(created.key_id.as_str()).await.unwrap_err();
        assert!(matches!(err, KmsError::KeyNotActive { .. }));
    }

    #[tokio::test]
    async fn test_failed_rotation_keeps_old_key_active() {
        let (lifecycle, key_store, store) = setup().await;
        let created = lifecycle.create_key(&signing("a")).await.unwrap();
        store.delete(ROOT_PRIVATE_KEY_NAME).await;

        let err = lifecycle.rotate_key(created.key_id.as_str()).await.unwrap_err();
        assert!(matches!(err, KmsError::SealedEntryNotFound(_)));

        let meta = key_store.get(created.key_id.as_str()).unwrap();
        assert_eq!(meta.status, KeyStatus::Active);
        assert!(meta.rotated_at.is_none());
        assert_eq!(key_store.get_active_by_agent("a").len(), 1);
        assert!(lifecycle.private_key(created.key_id.as_str()).await.is_ok());
    }

    #[tokio::test]
    async fn test_rotated_key_keeps_secret_but_is_unusable() {
        let (lifecycle, _, store) = setup().await;
        let created = lifecycle.create_key(&signing("a")).await.unwrap();
        lifecycle.rotate_key(created.key_id.as_str()).await.unwrap();

        assert!(store.has(&created.key_id.sealed_name()).await);
        let err = lifecycle.private_key(created.key_id.as_str()).await.unwrap_err();
        assert!(matches!(err, KmsError::KeyNotActive { .. }));
    }

    #[tokio::test]
    async fn test_revoke_deletes_secret() {
        let (lifecycle, key_store, store) = setup().await;
        let created = lifecycle.create_key(&signing("a")).await.unwrap();
        lifecycle.revoke_key(created.key_id.as_str()).await.unwrap();

        let meta = key_store.get(created.key_id.as_str()).unwrap();
        assert_eq!(meta.status, KeyStatus::Revoked);
        assert!(meta.revoked_at.is_some());
        assert!(!store.has(&created.key_id.sealed_name()).await);

        let err = lifecycle.private_key(created.key_id.as_str()).await.unwrap_err();
        assert!(matches!(err, KmsError::KeyNotActive { .. }));
        let err = lifecycle.rotate_key(created.key_id.as_str()).await.unwrap_err();
        assert!(matches!(err, KmsError::KeyNotActive { .. }));
    }

    #[tokio::test]
    async fn test_revoke_rotated_key_destroys_retained_secret() {
        let (lifecycle, key_store, store) = setup().await;
        let created = lifecycle.create_key(&signing("a")).await.unwrap();
        lifecycle.rotate_key(created.key_id.as_str()).await.unwrap();
        lifecycle.revoke_key(created.key_id.as_str()).await.unwrap();
        assert_eq!(
            key_store.get(created.key_id.as_str()).unwrap().status,
            KeyStatus::Revoked
        );
        assert!(!store.has(&created.key_id.sealed_name()).await);
    }

    #[tokio::test]
    async fn test_revoke_unknown_key() {
        let (lifecycle, _, _) = setup().await;
        let err = lifecycle.revoke_key("nope").await.unwrap_err();
        assert!(matches!(err, KmsError::KeyNotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_get_distinct_epochs() {
        let (lifecycle, key_store, _) = setup().await;
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lifecycle = lifecycle.clone();
            handles.push(tokio::spawn(async move {
                lifecycle.create_key(&signing("busy")).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let epochs: Vec<u32> = key_store.get_by_agent("busy").iter().map(|m| m.epoch).collect();
        assert_eq!(epochs, (0..8).collect::<Vec<u32>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_rotations_of_one_key() {
        let (lifecycle, key_store, _) = setup().await;
        let created = lifecycle.create_key(&signing("a")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let lifecycle = lifecycle.clone();
            let key_id = created.key_id.to_string();
            handles.push(tokio::spawn(async move { lifecycle.rotate_key(&key_id).await }));
        }
        let mut ok = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(e) => assert!(matches!(e, KmsError::KeyNotActive { .. })),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(key_store.get_active_by_agent("a").len(), 1);
    }
}
