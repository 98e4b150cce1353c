#[derive(Debug, thiserror::Error)]
pub enum KmsError {
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Key {key_id} is not active (status: {status})")]
    KeyNotActive { key_id: String, status: String },

    #[error("Policy denied by rule '{rule_name}': {reason}")]
    PolicyDenied { rule_name: String, reason: String },

    #[error("Sealed entry not found: {0}")]
    SealedEntryNotFound(String),

    /// Every authentication failure on unseal maps here, whatever the cause.
    #[error("Sealed data could not be authenticated (tampering detected)")]
    TamperDetected,

    #[error("Sealing failed: {0}")]
    SealFailure(String),

    #[error("Attestation invalid: {reason}")]
    AttestationInvalid { reason: String },

    #[error("TEE runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

pub type Result<T> = std::result::Result<T, KmsError>;

impl KmsError {
    /// Whether this error is an authorization failure raised by the policy engine.
    pub fn is_policy_denial(&self) -> bool {
        matches!(self, KmsError::PolicyDenied { .. })
    }

    /// Whether this error means the key exists but can no longer be used.
    pub fn is_key_inactive(&self) -> bool {
        matches!(self, KmsError::KeyNotActive { .. })
    }
}
