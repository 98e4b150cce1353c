//! Hierarchical key derivation.
//!
//! `child = HKDF-SHA256(ikm = root key, salt = agentId, info = "{purpose}:epoch-{n}")`,
//! 32 bytes, validated as a secp256k1 scalar. Derivation is a pure function
//! of its inputs, so a sealed root key reproduces every agent key.

use alloy::primitives::keccak256;
use hkdf::Hkdf;
use k256::ecdsa::{SigningKey, VerifyingKey};
use sha2::Sha256;

use crate::error::{KmsError, Result};
use crate::kms::types::{KeyId, KeyPurpose};
use crate::tee::boundary::{wipe, Protected};

/// Position of a key in the derivation tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivationPath {
    pub agent_id: String,
    pub purpose: KeyPurpose,
    pub epoch: u32,
}

impl DerivationPath {
    pub fn new(agent_id: impl Into<String>, purpose: KeyPurpose, epoch: u32) -> Self {
        Self {
            agent_id: agent_id.into(),
            purpose,
            epoch,
        }
    }

    fn info(&self) -> String {
        format!("{}:epoch-{}", self.purpose, self.epoch)
    }
}

/// Derive the child private key for `path` from the root private key.
pub fn derive_child_key(root_key: &[u8], path: &DerivationPath) -> Result<Protected<Vec<u8>>> {
    let info = path.info();
    let mut okm = hkdf_expand(root_key, &path.agent_id, &info)?;

    if SigningKey::from_slice(&okm).is_err() {
        // Zero or >= curve order: astronomically unlikely, but defined.
        wipe(&mut okm);
        okm = hkdf_expand(root_key, &path.agent_id, &format!("{info}:retry"))?;
        if SigningKey::from_slice(&okm).is_err() {
            wipe(&mut okm);
            return Err(KmsError::Crypto(
                "Derived key is not a valid secp256k1 scalar".to_string(),
            ));
        }
    }

    Ok(Protected::locked(okm, format!("child key {}", build_key_id(path))))
}

fn hkdf_expand(ikm: &[u8], salt: &str, info: &str) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha256>::new(Some(salt.as_bytes()), ikm);
    let mut okm = vec![0u8; 32];
    hk.expand(info.as_bytes(), &mut okm)
        .map_err(|e| KmsError::Crypto(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}

/// `"{agentId}/{purpose}/epoch-{epoch}"`.
pub fn build_key_id(path: &DerivationPath) -> KeyId {
    KeyId::new(&path.agent_id, path.purpose, path.epoch)
}

fn signing_key(private_key: &[u8]) -> Result<SigningKey> {
    SigningKey::from_slice(private_key)
        .map_err(|_| KmsError::InvalidInput("Invalid secp256k1 private key".to_string()))
}

/// Uncompressed public key (65 bytes, `0x04` prefix) for a private key.
pub fn public_key_bytes(private_key: &[u8]) -> Result<Vec<u8>> {
    let key = signing_key(private_key)?;
    Ok(key
        .verifying_key()
        .to_encoded_point(false)
        .as_bytes()
        .to_vec())
}

/// Uncompressed public key as lowercase hex, no `0x` prefix.
pub fn public_key_hex(private_key: &[u8]) -> Result<String> {
    Ok(hex::encode(public_key_bytes(private_key)?))
}

/// Ethereum address of a private key: `0x` + hex of the low 20 bytes of
/// `keccak256(pubkey[1..])`.
pub fn derive_address(private_key: &[u8]) -> Result<String> {
    let key = signing_key(private_key)?;
    Ok(address_of(key.verifying_key()))
}

/// Ethereum address of a public key.
pub fn address_of(public_key: &VerifyingKey) -> String {
    let point = public_key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    format!("0x{}", hex::encode(&hash[12..]))
}
