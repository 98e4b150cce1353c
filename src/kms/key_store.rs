//! In-memory registry of key metadata and per-key policy configuration.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;

use crate::error::{KmsError, Result};
use crate::kms::types::{KeyId, KeyMetadata, KeyStatus};
use crate::lock::{read_lock, write_lock};
use crate::policy::PolicyRuleConfig;

/// Registry of public key metadata. Holds no secret material.
#[derive(Default)]
pub struct KeyMetadataStore {
    keys: RwLock<HashMap<KeyId, KeyMetadata>>,
    policies: RwLock<HashMap<KeyId, Vec<PolicyRuleConfig>>>,
}

impl KeyMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly created key. Ids are never reused.
    pub fn register(&self, metadata: KeyMetadata) -> Result<()> {
        let mut keys = write_lock(&self.keys);
        if keys.contains_key(&metadata.id) {
            return Err(KmsError::InvalidInput(format!(
                "Key already registered: {}",
                metadata.id
            )));
        }
        keys.insert(metadata.id.clone(), metadata);
        Ok(())
    }

    pub fn get(&self, key_id: &str) -> Option<KeyMetadata> {
        read_lock(&self.keys).get(key_id).cloned()
    }

    /// All keys of an agent, ordered by epoch.
    pub fn get_by_agent(&self, agent_id: &str) -> Vec<KeyMetadata> {
        let mut keys: Vec<KeyMetadata> = read_lock(&self.keys)
            .values()
            .filter(|m| m.agent_id == agent_id)
            .cloned()
            .collect();
        keys.sort_by_key(|m| m.epoch);
        keys
    }

    pub fn get_active_by_agent(&self, agent_id: &str) -> Vec<KeyMetadata> {
        self.get_by_agent(agent_id)
            .into_iter()
            .filter(KeyMetadata::is_active)
            .collect()
    }

    /// Move a key to `status`, stamping `rotatedAt` / `revokedAt`.
    ///
    /// Allowed transitions: active to rotated, active or rotated to revoked.
    /// Revoking a revoked key leaves it unchanged.
    pub fn update_status(&self, key_id: &str, status: KeyStatus) -> Result<KeyMetadata> {
        let mut keys = write_lock(&self.keys);
        let meta = keys
            .get_mut(key_id)
            .ok_or_else(|| KmsError::KeyNotFound(key_id.to_string()))?;

        match (meta.status, status) {
            (KeyStatus::Active, KeyStatus::Rotated) => {
                meta.status = KeyStatus::Rotated;
                meta.rotated_at = Some(Utc::now());
            }
            (KeyStatus::Active | KeyStatus::Rotated, KeyStatus::Revoked) => {
                meta.status = KeyStatus::Revoked;
                meta.revoked_at = Some(Utc::now());
            }
            (KeyStatus::Revoked, KeyStatus::Revoked) => {}
            (from, to) => {
                return Err(KmsError::InvalidInput(format!(
                    "Cannot move key {key_id} from {from} to {to}"
                )))
            }
        }
        Ok(meta.clone())
    }

    /// Every registered key, ordered by agent then epoch.
    pub fn list_all(&self) -> Vec<KeyMetadata> {
        let mut keys: Vec<KeyMetadata> = read_lock(&self.keys).values().cloned().collect();
        keys.sort_by(|a, b| a.agent_id.cmp(&b.agent_id).then(a.epoch.cmp(&b.epoch)));
        keys
    }

    /// Highest epoch issued to an agent, `None` if it has no keys yet.
    pub fn get_current_epoch(&self, agent_id: &str) -> Option<u32> {
        read_lock(&self.keys)
            .values()
            .filter(|m| m.agent_id == agent_id)
            .map(|m| m.epoch)
            .max()
    }

    pub fn set_policy(&self, key_id: &str, rules: Vec<PolicyRuleConfig>) {
        write_lock(&self.policies).insert(KeyId::from(key_id), rules);
    }

    /// Policy rules of a key, empty if none were set.
    pub fn get_policy(&self, key_id: &str) -> Vec<PolicyRuleConfig> {
        read_lock(&self.policies)
            .get(key_id)
            .cloned()
            .unwrap_or_default()
    }
}
