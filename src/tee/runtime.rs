//! TEE runtime abstraction shared by the simulator and hardware providers.

use std::sync::Arc;

use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::config::KmsConfig;
use crate::error::Result;
use crate::tee::attestation::{AttestationProvider, TeeProviderKind};
use crate::tee::hardware::{HardwareRuntime, HttpTeeClient};
use crate::tee::sealed::SealedStorage;
use crate::tee::simulator::{SimulatedRuntime, SimulatorOptions};

/// A trusted execution environment the key manager runs inside.
///
/// Everything above this trait (sealing, key derivation, attestation) runs
/// unchanged against the simulator and against real hardware.
#[async_trait]
pub trait TeeRuntime: Send + Sync {
    fn provider(&self) -> TeeProviderKind;

    fn sealed_storage(&self) -> Arc<dyn SealedStorage>;

    fn attestation_provider(&self) -> Arc<dyn AttestationProvider>;

    /// Cryptographically secure random bytes.
    fn random_bytes(&self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        OsRng.fill_bytes(&mut buf);
        buf
    }

    /// Enclave measurement (identity hash). Cached after the first call.
    async fn measurement(&self) -> Result<String>;

    /// Bring the runtime up. Hardware runtimes fail with
    /// `RuntimeUnavailable` if the platform cannot be reached.
    async fn initialize(&self) -> Result<()>;

    /// Tear the runtime down, discarding sealed entries.
    async fn destroy(&self) -> Result<()>;
}

/// Build the runtime selected by `config`.
///
/// The runtime is returned uninitialized.
pub fn from_config(config: &KmsConfig) -> Result<Arc<dyn TeeRuntime>> {
    let runtime: Arc<dyn TeeRuntime> = match config.provider {
        TeeProviderKind::Simulator => Arc::new(SimulatedRuntime::new(SimulatorOptions {
            fixed_measurement: config.fixed_measurement.clone(),
            source_paths: config.source_paths.clone(),
            signer_identity: Some(config.signer_identity.clone()),
        })?),
        TeeProviderKind::Dstack => {
            let client = HttpTeeClient::new(&config.dstack_endpoint, config.request_timeout())?;
            Arc::new(HardwareRuntime::new(client))
        }
    };
    tracing::info!(provider = %runtime.provider(), "TEE runtime selected");
    Ok(runtime)
}
