//! Root secp256k1 key pair, generated once inside the enclave and sealed.

use std::sync::Arc;

use k256::ecdsa::SigningKey;
use rand::rngs::OsRng;

use crate::error::{KmsError, Result};
use crate::kms::derivation::public_key_bytes;
use crate::tee::boundary::Protected;
use crate::tee::sealed::SealedStorage;

/// Sealed entry holding the root private scalar.
pub const ROOT_PRIVATE_KEY_NAME: &str = "root-key:secp256k1";
/// Sealed entry holding the uncompressed root public key.
pub const ROOT_PUBLIC_KEY_NAME: &str = "root-key:public";

/// Manages the root key pair every agent key is derived from.
pub struct RootKeyManager {
    storage: Arc<dyn SealedStorage>,
}

impl RootKeyManager {
    pub fn new(storage: Arc<dyn SealedStorage>) -> Self {
        Self { storage }
    }

    /// Generate and seal the root key pair if absent, otherwise load it.
    ///
    /// `entropy` supplies the private scalar for deterministic setups.
    /// Returns the root public key as hex.
    pub async fn initialize(&self, entropy: Option<&[u8]>) -> Result<String> {
        if self.storage.has(ROOT_PRIVATE_KEY_NAME).await {
            let public_key = self.public_key().await?;
            tracing::info!(root_public_key = %public_key, "Root key loaded from sealed storage");
            return Ok(public_key);
        }

        let signing_key = match entropy {
            Some(bytes) => SigningKey::from_slice(bytes).map_err(|_| {
                KmsError::InvalidInput("Root key entropy is not a valid secp256k1 scalar".to_string())
            })?,
            None => SigningKey::random(&mut OsRng),
        };
        let private_key = Protected::new(signing_key.to_bytes().to_vec(), "root private key");
        let public_key = public_key_bytes(private_key.expose())?;

        self.storage
            .seal(ROOT_PRIVATE_KEY_NAME, private_key.expose())
            .await?;
        self.storage.seal(ROOT_PUBLIC_KEY_NAME, &public_key).await?;

        let public_key = hex::encode(public_key);
        tracing::info!(root_public_key = %public_key, "Root key generated and sealed");
        Ok(public_key)
    }

    /// Root public key as uncompressed hex. Does not touch the private half.
    pub async fn public_key(&self) -> Result<String> {
        let bytes = self.storage.unseal(ROOT_PUBLIC_KEY_NAME).await?;
        Ok(hex::encode(bytes.expose()))
    }

    /// Root private key. For derivation inside the enclave only.
    pub async fn private_key(&self) -> Result<Protected<Vec<u8>>> {
        self.storage.unseal(ROOT_PRIVATE_KEY_NAME).await
    }

    pub async fn is_initialized(&self) -> bool {
        self.storage.has(ROOT_PRIVATE_KEY_NAME).await
    }
}
