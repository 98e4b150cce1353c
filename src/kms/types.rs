//! Key identifiers, metadata and lifecycle results.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::KmsError;

/// Identifier of a derived key: `"{agentId}/{purpose}/epoch-{n}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
    pub fn new(agent_id: &str, purpose: KeyPurpose, epoch: u32) -> Self {
        Self(format!("{agent_id}/{purpose}/epoch-{epoch}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the sealed entry holding this key's private scalar.
    pub fn sealed_name(&self) -> String {
        format!("derived:{}", self.0)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for KeyId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for KeyId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::borrow::Borrow<str> for KeyId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// What a derived key is used for. Part of the derivation path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyPurpose {
    Signing,
    Encryption,
}

impl KeyPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyPurpose::Signing => "signing",
            KeyPurpose::Encryption => "encryption",
        }
    }
}

impl fmt::Display for KeyPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for KeyPurpose {
    type Err = KmsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "signing" => Ok(KeyPurpose::Signing),
            "encryption" => Ok(KeyPurpose::Encryption),
            other => Err(KmsError::InvalidInput(format!(
                "Unknown key purpose '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithm {
    #[default]
    Secp256k1,
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyAlgorithm::Secp256k1 => write!(f, "secp256k1"),
        }
    }
}

/// Lifecycle state of a key. `Rotated` and `Revoked` are terminal for signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Rotated,
    Revoked,
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStatus::Active => write!(f, "active"),
            KeyStatus::Rotated => write!(f, "rotated"),
            KeyStatus::Revoked => write!(f, "revoked"),
        }
    }
}

/// Public metadata of a derived key. Never holds secret material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMetadata {
    pub id: KeyId,
    pub algorithm: KeyAlgorithm,
    pub status: KeyStatus,
    pub purpose: KeyPurpose,
    pub agent_id: String,
    pub epoch: u32,
    pub ethereum_address: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

impl KeyMetadata {
    pub fn is_active(&self) -> bool {
        self.status == KeyStatus::Active
    }
}

/// Request to mint a new key for an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateKeyRequest {
    pub agent_id: String,
    pub purpose: KeyPurpose,
    #[serde(default)]
    pub algorithm: KeyAlgorithm,
}

impl CreateKeyRequest {
    pub fn new(agent_id: impl Into<String>, purpose: KeyPurpose) -> Self {
        Self {
            agent_id: agent_id.into(),
            purpose,
            algorithm: KeyAlgorithm::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedKey {
    pub key_id: KeyId,
    pub address: String,
    /// Uncompressed secp256k1 public key, hex without prefix.
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotatedKey {
    pub previous_key_id: KeyId,
    pub new_key_id: KeyId,
    pub new_address: String,
    pub new_public_key: String,
    pub epoch: u32,
}
