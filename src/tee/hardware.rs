//! Hardware-backed TEE runtime (dstack / Intel TDX).
//!
//! Key derivation and quoting are delegated to the platform agent through a
//! [`TeeClient`]. [`HttpTeeClient`] speaks the dstack tappd JSON API; tests
//! substitute an in-process client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use zeroize::Zeroizing;

use crate::error::{KmsError, Result};
use crate::tee::attestation::{
    AttestationProvider, AttestationReport, CodeMeasurements, TeeProviderKind,
};
use crate::tee::boundary::Protected;
use crate::tee::runtime::TeeRuntime;
use crate::tee::sealed::{AesGcmSealedStore, SealedStorage};

/// Derivation path of the sealed-storage key.
pub const SEALING_KEY_PATH: &str = "akm/sealed-storage/v1";

/// Hash algorithm requested for TDX quote report data.
const QUOTE_HASH_ALGORITHM: &str = "sha256";

/// Identity information reported by the platform agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeeInfo {
    pub app_id: String,
    /// TDX measurement of the initial TD contents.
    pub mrtd: String,
}

/// Client for the platform agent running alongside the confidential VM.
#[async_trait]
pub trait TeeClient: Send + Sync {
    async fn info(&self) -> Result<TeeInfo>;

    /// Deterministic key material bound to the app identity and `path`.
    async fn derive_key(&self, path: &str) -> Result<Protected<Vec<u8>>>;

    /// Produce a TDX quote over `report_data_hex`. Returns the quote as hex.
    async fn tdx_quote(&self, report_data_hex: &str, hash_algorithm: &str) -> Result<String>;
}

/// dstack tappd client over HTTP.
pub struct HttpTeeClient {
    endpoint: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct DeriveKeyResponse {
    key: String,
}

#[derive(Deserialize)]
struct TdxQuoteResponse {
    quote: String,
}

impl HttpTeeClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call(&self, method: &str, body: Value) -> Result<Value> {
        let url = format!("{}/prpc/Tappd.{}", self.endpoint, method);
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl TeeClient for HttpTeeClient {
    async fn info(&self) -> Result<TeeInfo> {
        let body = self.call("Info", serde_json::json!({})).await?;
        parse_info(&body)
    }

    async fn derive_key(&self, path: &str) -> Result<Protected<Vec<u8>>> {
        let body = self
            .call("DeriveKey", serde_json::json!({ "path": path, "subject": path }))
            .await?;
        let resp: DeriveKeyResponse = serde_json::from_value(body)?;
        Ok(Protected::locked(
            key_material(&resp.key),
            format!("derived key {path}"),
        ))
    }

    async fn tdx_quote(&self, report_data_hex: &str, hash_algorithm: &str) -> Result<String> {
        let body = self
            .call(
                "TdxQuote",
                serde_json::json!({
                    "report_data": report_data_hex,
                    "hash_algorithm": hash_algorithm,
                }),
            )
            .await?;
        let resp: TdxQuoteResponse = serde_json::from_value(body)?;
        Ok(resp.quote)
    }
}

/// Parse a tappd `Info` response.
///
/// `tcb_info` is either an object or a JSON document encoded as a string.
pub fn parse_info(body: &Value) -> Result<TeeInfo> {
    let app_id = body
        .get("app_id")
        .and_then(Value::as_str)
        .ok_or_else(|| KmsError::RuntimeUnavailable("Info response missing app_id".to_string()))?
        .to_string();

    let tcb_info = match body.get("tcb_info") {
        Some(Value::String(encoded)) => serde_json::from_str::<Value>(encoded)?,
        Some(other) => other.clone(),
        None => {
            return Err(KmsError::RuntimeUnavailable(
                "Info response missing tcb_info".to_string(),
            ))
        }
    };

    let mrtd = tcb_info
        .get("mrtd")
        .and_then(Value::as_str)
        .ok_or_else(|| KmsError::RuntimeUnavailable("tcb_info missing mrtd".to_string()))?
        .to_string();

    Ok(TeeInfo { app_id, mrtd })
}

/// Raw bytes of a derived key: hex-decoded when the agent returns hex,
/// otherwise the encoded key text itself (e.g. PEM).
fn key_material(key: &str) -> Vec<u8> {
    let trimmed = key.trim();
    hex::decode(trimmed.strip_prefix("0x").unwrap_or(trimmed))
        .unwrap_or_else(|_| trimmed.as_bytes().to_vec())
}

/// Attestation provider backed by TDX quotes.
///
/// Measurements come from the agent's `info()` and are fetched once.
pub struct HardwareAttestation<C> {
    client: Arc<C>,
    measurements: OnceCell<CodeMeasurements>,
}

impl<C: TeeClient> HardwareAttestation<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self {
            client,
            measurements: OnceCell::new(),
        }
    }

    async fn cached_measurements(&self) -> Result<&CodeMeasurements> {
        self.measurements
            .get_or_try_init(|| async {
                let info = self.client.info().await?;
                Ok::<_, KmsError>(measurements_from_info(&info))
            })
            .await
    }

    fn prime(&self, info: &TeeInfo) {
        let _ = self.measurements.set(measurements_from_info(info));
    }
}

fn measurements_from_info(info: &TeeInfo) -> CodeMeasurements {
    CodeMeasurements {
        mr_enclave: info.mrtd.clone(),
        mr_signer: info.app_id.clone(),
        product_id: 0,
        svn: 0,
    }
}

#[async_trait]
impl<C: TeeClient + 'static> AttestationProvider for HardwareAttestation<C> {
    async fn generate_report(&self, user_data: &str) -> Result<AttestationReport> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let report_data = hex::encode(Sha256::digest(user_data.as_bytes()));
        let quote = self
            .client
            .tdx_quote(&report_data, QUOTE_HASH_ALGORITHM)
            .await?;
        let measurements = self.cached_measurements().await?.clone();

        Ok(AttestationReport {
            provider: TeeProviderKind::Dstack,
            timestamp,
            measurements,
            user_data: user_data.to_string(),
            signature: quote,
        })
    }

    async fn measurements(&self) -> Result<CodeMeasurements> {
        Ok(self.cached_measurements().await?.clone())
    }

    fn provider(&self) -> TeeProviderKind {
        TeeProviderKind::Dstack
    }
}

/// TEE runtime backed by a dstack platform agent.
pub struct HardwareRuntime<C> {
    client: Arc<C>,
    sealed: Arc<AesGcmSealedStore>,
    attestation: Arc<HardwareAttestation<C>>,
}

impl<C: TeeClient + 'static> HardwareRuntime<C> {
    pub fn new(client: C) -> Self {
        let client = Arc::new(client);
        Self {
            attestation: Arc::new(HardwareAttestation::new(client.clone())),
            sealed: Arc::new(AesGcmSealedStore::uninitialized()),
            client,
        }
    }

    /// The concrete sealed store, for raw blob export/import.
    pub fn store(&self) -> &Arc<AesGcmSealedStore> {
        &self.sealed
    }
}

fn unavailable(err: KmsError) -> KmsError {
    match err {
        KmsError::RuntimeUnavailable(_) => err,
        other => KmsError::RuntimeUnavailable(other.to_string()),
    }
}

#[async_trait]
impl<C: TeeClient + 'static> TeeRuntime for HardwareRuntime<C> {
    fn provider(&self) -> TeeProviderKind {
        TeeProviderKind::Dstack
    }

    fn sealed_storage(&self) -> Arc<dyn SealedStorage> {
        self.sealed.clone()
    }

    fn attestation_provider(&self) -> Arc<dyn AttestationProvider> {
        self.attestation.clone()
    }

    async fn measurement(&self) -> Result<String> {
        Ok(self.attestation.cached_measurements().await?.mr_enclave.clone())
    }

    async fn initialize(&self) -> Result<()> {
        let info = self.client.info().await.map_err(unavailable)?;
        self.attestation.prime(&info);

        let material = self
            .client
            .derive_key(SEALING_KEY_PATH)
            .await
            .map_err(unavailable)?;
        let key: [u8; 32] = Sha256::digest(material.expose()).into();
        self.sealed.install_key(Zeroizing::new(key))?;

        tracing::info!(
            mrtd = %info.mrtd,
            app_id = %info.app_id,
            "Hardware TEE runtime initialized"
        );
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.sealed.clear();
        tracing::info!("Hardware TEE runtime destroyed");
        Ok(())
    }
}
