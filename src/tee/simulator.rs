//! Simulated TEE runtime for development and testing.
//!
//! Provides the same interface as a hardware TEE but runs in normal process
//! memory. The measurement is either fixed or a hash over a set of source
//! files, so test identities are reproducible.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::tee::attestation::{
    AttestationProvider, CodeMeasurements, SimulatedAttestation, TeeProviderKind,
};
use crate::tee::runtime::TeeRuntime;
use crate::tee::sealed::{AesGcmSealedStore, SealedStorage};

pub const DEFAULT_SIGNER_IDENTITY: &str = "akm-tee-simulator-v1";

const SIMULATOR_PRODUCT_ID: u32 = 1;
const SIMULATOR_SVN: u32 = 1;

/// File extensions included when hashing a source directory.
const MEASURED_EXTENSIONS: &[&str] = &["rs", "toml", "ts", "js"];

/// Options for [`SimulatedRuntime`].
#[derive(Debug, Clone, Default)]
pub struct SimulatorOptions {
    /// Measurement used verbatim (overrides source path hashing).
    pub fixed_measurement: Option<String>,
    /// Files or directories hashed into the measurement.
    pub source_paths: Vec<PathBuf>,
    /// Identity hashed into mrSigner. Defaults to [`DEFAULT_SIGNER_IDENTITY`].
    pub signer_identity: Option<String>,
}

/// Hash source files into a simulated enclave measurement.
///
/// Paths are visited in sorted order; directories are walked recursively in
/// sorted entry order and only source files are hashed. Missing paths are
/// skipped.
pub fn compute_measurement(source_paths: &[PathBuf]) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut paths = source_paths.to_vec();
    paths.sort();

    for path in &paths {
        if path.is_dir() {
            hash_directory(&mut hasher, path)?;
        } else if path.is_file() {
            hasher.update(std::fs::read(path)?);
        } else {
            tracing::warn!(path = %path.display(), "Measurement source not found, skipping");
        }
    }

    Ok(hex::encode(hasher.finalize()))
}

fn hash_directory(hasher: &mut Sha256, dir: &Path) -> Result<()> {
    let mut entries = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();

    for path in entries {
        if path.is_dir() {
            hash_directory(hasher, &path)?;
        } else if is_measured_source(&path) {
            hasher.update(std::fs::read(&path)?);
        }
    }
    Ok(())
}

fn is_measured_source(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| MEASURED_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

/// Deterministic mrSigner value for a signer identity string.
pub fn signer_measurement(signer_identity: &str) -> String {
    hex::encode(Sha256::digest(signer_identity.as_bytes()))
}

/// Simulated TEE runtime.
pub struct SimulatedRuntime {
    measurement: String,
    sealed: Arc<AesGcmSealedStore>,
    attestation: Arc<SimulatedAttestation>,
    measurements: CodeMeasurements,
}

impl SimulatedRuntime {
    pub fn new(options: SimulatorOptions) -> Result<Self> {
        let measurement = match options.fixed_measurement {
            Some(fixed) if !fixed.is_empty() => fixed,
            _ => compute_measurement(&options.source_paths)?,
        };
        let signer_identity = options
            .signer_identity
            .unwrap_or_else(|| DEFAULT_SIGNER_IDENTITY.to_string());

        let measurements = CodeMeasurements {
            mr_enclave: measurement.clone(),
            mr_signer: signer_measurement(&signer_identity),
            product_id: SIMULATOR_PRODUCT_ID,
            svn: SIMULATOR_SVN,
        };

        Ok(Self {
            sealed: Arc::new(AesGcmSealedStore::from_measurement(&measurement)),
            attestation: Arc::new(SimulatedAttestation::new(measurements.clone())),
            measurement,
            measurements,
        })
    }

    /// Simulator with a fixed measurement and the default signer identity.
    pub fn with_measurement(measurement: &str) -> Self {
        let measurement = measurement.to_string();
        let measurements = CodeMeasurements {
            mr_enclave: measurement.clone(),
            mr_signer: signer_measurement(DEFAULT_SIGNER_IDENTITY),
            product_id: SIMULATOR_PRODUCT_ID,
            svn: SIMULATOR_SVN,
        };
        Self {
            sealed: Arc::new(AesGcmSealedStore::from_measurement(&measurement)),
            attestation: Arc::new(SimulatedAttestation::new(measurements.clone())),
            measurement,
            measurements,
        }
    }

    /// The concrete sealed store, for raw blob export/import.
    pub fn store(&self) -> &Arc<AesGcmSealedStore> {
        &self.sealed
    }

    pub fn code_measurements(&self) -> &CodeMeasurements {
        &self.measurements
    }
}

#[async_trait]
impl TeeRuntime for SimulatedRuntime {
    fn provider(&self) -> TeeProviderKind {
        TeeProviderKind::Simulator
    }

    fn sealed_storage(&self) -> Arc<dyn SealedStorage> {
        self.sealed.clone()
    }

    fn attestation_provider(&self) -> Arc<dyn AttestationProvider> {
        self.attestation.clone()
    }

    async fn measurement(&self) -> Result<String> {
        Ok(self.measurement.clone())
    }

    async fn initialize(&self) -> Result<()> {
        tracing::info!(
            measurement = %self.measurement,
            mr_signer = %self.measurements.mr_signer,
            "Simulated TEE runtime initialized"
        );
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.sealed.clear();
        tracing::info!("Simulated TEE runtime destroyed");
        Ok(())
    }
}
