use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dirs;
use crate::error::{KmsError, Result};
use crate::tee::attestation::TeeProviderKind;
use crate::tee::simulator::DEFAULT_SIGNER_IDENTITY;

/// User-configurable settings for the key manager and CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KmsConfig {
    /// TEE backend: `simulator` (default) or `dstack`.
    #[serde(default = "default_provider")]
    pub provider: TeeProviderKind,

    /// Simulator measurement, used verbatim instead of hashing sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_measurement: Option<String>,

    /// Files or directories the simulator hashes into its measurement.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_paths: Vec<PathBuf>,

    /// Identity hashed into the simulator's mrSigner.
    #[serde(default = "default_signer_identity")]
    pub signer_identity: String,

    /// Base URL of the dstack guest agent (default: http://localhost:8090).
    #[serde(default = "default_dstack_endpoint")]
    pub dstack_endpoint: String,

    /// Timeout for calls to the dstack guest agent, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Maximum age of an attestation report accepted by the verifier, in seconds.
    #[serde(default = "default_max_report_age_secs")]
    pub max_report_age_secs: u64,
}

fn default_provider() -> TeeProviderKind {
    TeeProviderKind::Simulator
}

fn default_signer_identity() -> String {
    DEFAULT_SIGNER_IDENTITY.to_string()
}

fn default_dstack_endpoint() -> String {
    "http://localhost:8090".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_max_report_age_secs() -> u64 {
    300
}

impl Default for KmsConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            fixed_measurement: None,
            source_paths: Vec::new(),
            signer_identity: default_signer_identity(),
            dstack_endpoint: default_dstack_endpoint(),
            request_timeout_secs: default_request_timeout_secs(),
            max_report_age_secs: default_max_report_age_secs(),
        }
    }
}

impl KmsConfig {
    /// Load configuration from the default config file path.
    /// Returns default config if the file does not exist.
    ///
    /// Environment overrides are applied after the file is read.
    pub fn load() -> Result<Self> {
        Self::load_at(&dirs::config_path())
    }

    /// Read a config file at an explicit path, then apply environment overrides.
    pub fn load_at(path: &Path) -> Result<Self> {
        let mut config = Self::load_from(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Read a config file without applying environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            KmsError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Apply environment variable overrides.
    ///
    /// Supported variables:
    /// - `A3S_KMS_TEE_PROVIDER`: `simulator` or `dstack`
    /// - `A3S_KMS_MEASUREMENT`: fixed simulator measurement
    /// - `A3S_KMS_SIGNER_IDENTITY`: simulator signer identity
    /// - `A3S_KMS_DSTACK_ENDPOINT`: dstack guest agent URL
    /// - `A3S_KMS_MAX_REPORT_AGE`: report freshness window in seconds
    /// - `A3S_KMS_DEBUG`: enable debug logging (`"1"` or `"true"`)
    ///
    /// Unparseable values are ignored.
    fn apply_env_overrides(&mut self) {
        if let Ok(provider_str) = std::env::var("A3S_KMS_TEE_PROVIDER") {
            if let Ok(provider) = provider_str.parse::<TeeProviderKind>() {
                self.provider = provider;
            }
        }

        if let Ok(measurement) = std::env::var("A3S_KMS_MEASUREMENT") {
            if !measurement.is_empty() {
                self.fixed_measurement = Some(measurement);
            }
        }

        if let Ok(identity) = std::env::var("A3S_KMS_SIGNER_IDENTITY") {
            if !identity.is_empty() {
                self.signer_identity = identity;
            }
        }

        if let Ok(endpoint) = std::env::var("A3S_KMS_DSTACK_ENDPOINT") {
            if !endpoint.is_empty() {
                self.dstack_endpoint = endpoint.trim_end_matches('/').to_string();
            }
        }

        if let Ok(age_str) = std::env::var("A3S_KMS_MAX_REPORT_AGE") {
            if let Ok(age) = age_str.parse::<u64>() {
                self.max_report_age_secs = age;
            }
        }

        if let Ok(debug_str) = std::env::var("A3S_KMS_DEBUG") {
            if debug_str == "1" || debug_str.eq_ignore_ascii_case("true") {
                if std::env::var("RUST_LOG").is_err() {
                    std::env::set_var("RUST_LOG", "debug");
                }
            }
        }
    }

    /// Save the current configuration to the default config file path.
    pub fn save(&self) -> Result<()> {
        let path = dirs::config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn max_report_age(&self) -> Duration {
        Duration::from_secs(self.max_report_age_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ENV_VARS: &[&str] = &[
        "A3S_KMS_TEE_PROVIDER",
        "A3S_KMS_MEASUREMENT",
        "A3S_KMS_SIGNER_IDENTITY",
        "A3S_KMS_DSTACK_ENDPOINT",
        "A3S_KMS_MAX_REPORT_AGE",
        "A3S_KMS_DEBUG",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config() {
        let config = KmsConfig::default();
        assert_eq!(config.provider, TeeProviderKind::Simulator);
        assert!(config.fixed_measurement.is_none());
        assert_eq!(config.signer_identity, "akm-tee-simulator-v1");
        assert_eq!(config.dstack_endpoint, "http://localhost:8090");
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.max_report_age(), Duration::from_secs(300));
    }

    #[test]
    fn test_config_deserialize_partial() {
        let toml_str = r#"
            provider = "dstack"
            dstack_endpoint = "http://10.0.0.2:8090"
        "#;
        let config: KmsConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.provider, TeeProviderKind::Dstack);
        assert_eq!(config.dstack_endpoint, "http://10.0.0.2:8090");
        assert_eq!(config.request_timeout_secs, 10);
    }

    #[test]
    fn test_config_serialize() {
        let config = KmsConfig {
            fixed_measurement: Some("abc".to_string()),
            source_paths: vec![PathBuf::from("src")],
            ..KmsConfig::default()
        };
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("provider = \"simulator\""));
        assert!(toml_str.contains("fixed_measurement = \"abc\""));
        let parsed: KmsConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_unknown_provider_rejected_in_file() {
        let result: std::result::Result<KmsConfig, _> = toml::from_str("provider = \"sgx\"");
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn test_config_roundtrip_through_home() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("A3S_KMS_HOME", dir.path());

        let config = KmsConfig {
            fixed_measurement: Some("saved".to_string()),
            max_report_age_secs: 60,
            ..KmsConfig::default()
        };
        config.save().unwrap();
        assert!(dir.path().join("config.toml").exists());

        let loaded = KmsConfig::load().unwrap();
        assert_eq!(loaded, config);

        std::env::remove_var("A3S_KMS_HOME");
    }

    #[test]
    #[serial]
    fn test_load_missing_file_gives_default() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("A3S_KMS_HOME", dir.path());
        assert_eq!(KmsConfig::load().unwrap(), KmsConfig::default());
        std::env::remove_var("A3S_KMS_HOME");
    }

    #[test]
    #[serial]
    fn test_load_at_applies_env_overrides() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "fixed_measurement = \"from-file\"\nmax_report_age_secs = 30\n").unwrap();
        std::env::set_var("A3S_KMS_TEE_PROVIDER", "dstack");

        let config = KmsConfig::load_at(&path).unwrap();
        assert_eq!(config.provider, TeeProviderKind::Dstack);
        assert_eq!(config.fixed_measurement.as_deref(), Some("from-file"));
        assert_eq!(config.max_report_age_secs, 30);

        assert_eq!(
            KmsConfig::load_from(&path).unwrap().provider,
            TeeProviderKind::Simulator
        );
        clear_env();
    }

    #[test]
    fn test_load_from_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "provider = [").unwrap();
        assert!(matches!(
            KmsConfig::load_from(&path).unwrap_err(),
            KmsError::TomlDe(_)
        ));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var("A3S_KMS_TEE_PROVIDER", "dstack");
        std::env::set_var("A3S_KMS_MEASUREMENT", "env-measurement");
        std::env::set_var("A3S_KMS_SIGNER_IDENTITY", "ci-signer");
        std::env::set_var("A3S_KMS_DSTACK_ENDPOINT", "http://tappd:8090/");
        std::env::set_var("A3S_KMS_MAX_REPORT_AGE", "120");

        let mut config = KmsConfig::default();
        config.apply_env_overrides();
        assert_eq!(config.provider, TeeProviderKind::Dstack);
        assert_eq!(config.fixed_measurement.as_deref(), Some("env-measurement"));
        assert_eq!(config.signer_identity, "ci-signer");
        assert_eq!(config.dstack_endpoint, "http://tappd:8090");
        assert_eq!(config.max_report_age_secs, 120);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_invalid_values_ignored() {
        clear_env();
        std::env::set_var("A3S_KMS_TEE_PROVIDER", "sgx");
        std::env::set_var("A3S_KMS_MAX_REPORT_AGE", "soon");

        let mut config = KmsConfig::default();
        config.apply_env_overrides();
        assert_eq!(config, KmsConfig::default());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_debug_sets_rust_log() {
        clear_env();
        std::env::remove_var("RUST_LOG");
        std::env::set_var("A3S_KMS_DEBUG", "true");
        let mut config = KmsConfig::default();
        config.apply_env_overrides();
        assert_eq!(std::env::var("RUST_LOG").unwrap(), "debug");
        clear_env();
        std::env::remove_var("RUST_LOG");
    }

    #[test]
    #[serial]
    fn test_env_debug_does_not_override_existing_rust_log() {
        clear_env();
        std::env::set_var("RUST_LOG", "trace");
        std::env::set_var("A3S_KMS_DEBUG", "1");
        let mut config = KmsConfig::default();
        config.apply_env_overrides();
        assert_eq!(std::env::var("RUST_LOG").unwrap(), "trace");
        clear_env();
        std::env::remove_var("RUST_LOG");
    }
}
