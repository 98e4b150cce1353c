//! Agent key management: root key, derivation, lifecycle and signing.

pub mod derivation;
pub mod key_store;
pub mod lifecycle;
pub mod root_key;
pub mod signer;
pub mod types;

pub use derivation::{build_key_id, derive_address, derive_child_key, DerivationPath};
pub use key_store::KeyMetadataStore;
pub use lifecycle::KeyLifecycleManager;
pub use root_key::RootKeyManager;
pub use signer::{SignedMessage, SignedTransaction, TeeSigner, TransactionRequest};
pub use types::{
    CreateKeyRequest, CreatedKey, KeyAlgorithm, KeyId, KeyMetadata, KeyPurpose, KeyStatus,
    RotatedKey,
};
