//! TEE attestation: report types and attestation providers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Which TEE backend produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TeeProviderKind {
    /// Software simulator for development and tests.
    Simulator,
    /// dstack (Intel TDX) confidential VM.
    Dstack,
}

impl std::fmt::Display for TeeProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TeeProviderKind::Simulator => write!(f, "simulator"),
            TeeProviderKind::Dstack => write!(f, "dstack"),
        }
    }
}

impl std::str::FromStr for TeeProviderKind {
    type Err = crate::error::KmsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simulator" => Ok(TeeProviderKind::Simulator),
            "dstack" => Ok(TeeProviderKind::Dstack),
            other => Err(crate::error::KmsError::Config(format!(
                "Unknown TEE provider '{other}' (expected 'simulator' or 'dstack')"
            ))),
        }
    }
}

/// Identity of the code running inside the enclave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeMeasurements {
    /// Hash of the enclave code and configuration.
    pub mr_enclave: String,
    /// Hash of the identity that signed the enclave.
    pub mr_signer: String,
    pub product_id: u32,
    /// Security version number.
    pub svn: u32,
}

/// Attestation report produced by a TEE provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationReport {
    pub provider: TeeProviderKind,
    /// Unix time in milliseconds.
    pub timestamp: i64,
    pub measurements: CodeMeasurements,
    /// Hex data bound into the report by the requester.
    pub user_data: String,
    /// Provider-specific signature: a SHA-256 MAC for the simulator, the raw
    /// TDX quote for dstack.
    pub signature: String,
}

/// Report bound to a nonce and the enclave's root public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationQuote {
    pub report: AttestationReport,
    pub nonce: String,
    pub root_public_key: String,
}

/// Trait for TEE attestation providers.
#[async_trait]
pub trait AttestationProvider: Send + Sync {
    /// Generate a report over `user_data`.
    async fn generate_report(&self, user_data: &str) -> Result<AttestationReport>;

    /// Code measurements this provider reports.
    async fn measurements(&self) -> Result<CodeMeasurements>;

    fn provider(&self) -> TeeProviderKind;
}

/// User data binding a quote to its nonce and root public key:
/// `hex(sha256(nonce ":" rootPublicKey))`.
pub fn quote_user_data(nonce: &str, root_public_key: &str) -> String {
    hex::encode(Sha256::digest(format!("{nonce}:{root_public_key}").as_bytes()))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignedReportBody<'a> {
    measurements: &'a CodeMeasurements,
    user_data: &'a str,
    timestamp: i64,
}

/// Signature the simulator puts on a report.
///
/// `hex(sha256("sim-attest-key:" + mrEnclave + ":" + json))` where `json`
/// serializes `{measurements, userData, timestamp}` in that key order.
pub fn simulated_report_signature(
    measurements: &CodeMeasurements,
    user_data: &str,
    timestamp: i64,
) -> Result<String> {
    let body = serde_json::to_string(&SignedReportBody {
        measurements,
        user_data,
        timestamp,
    })?;
    let signing_secret = format!("sim-attest-key:{}", measurements.mr_enclave);
    Ok(hex::encode(Sha256::digest(
        format!("{signing_secret}:{body}").as_bytes(),
    )))
}

/// Attestation provider backed by the simulator's fixed measurements.
pub struct SimulatedAttestation {
    measurements: CodeMeasurements,
}

impl SimulatedAttestation {
    pub fn new(measurements: CodeMeasurements) -> Self {
        Self { measurements }
    }
}

#[async_trait]
impl AttestationProvider for SimulatedAttestation {
    async fn generate_report(&self, user_data: &str) -> Result<AttestationReport> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let signature = simulated_report_signature(&self.measurements, user_data, timestamp)?;
        Ok(AttestationReport {
            provider: TeeProviderKind::Simulator,
            timestamp,
            measurements: self.measurements.clone(),
            user_data: user_data.to_string(),
            signature,
        })
    }

    async fn measurements(&self) -> Result<CodeMeasurements> {
        Ok(self.measurements.clone())
    }

    fn provider(&self) -> TeeProviderKind {
        TeeProviderKind::Simulator
    }
}
