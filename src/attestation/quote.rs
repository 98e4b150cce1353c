//! Quotes binding an attestation report to a nonce and the root public key.

use std::sync::Arc;

use crate::error::Result;
use crate::tee::attestation::{quote_user_data, AttestationQuote};
use crate::tee::runtime::TeeRuntime;

const NONCE_LEN: usize = 32;

/// Produces attestation quotes from the runtime's attestation provider.
pub struct QuoteGenerator {
    runtime: Arc<dyn TeeRuntime>,
}

impl QuoteGenerator {
    pub fn new(runtime: Arc<dyn TeeRuntime>) -> Self {
        Self { runtime }
    }

    /// Quote over `root_public_key`. Without a nonce, 32 random bytes
    /// (hex) are used.
    pub async fn generate(
        &self,
        root_public_key: &str,
        nonce: Option<&str>,
    ) -> Result<AttestationQuote> {
        let nonce = match nonce {
            Some(n) => n.to_string(),
            None => hex::encode(self.runtime.random_bytes(NONCE_LEN)),
        };
        let user_data = quote_user_data(&nonce, root_public_key);
        let report = self
            .runtime
            .attestation_provider()
            .generate_report(&user_data)
            .await?;

        tracing::info!(
            provider = %report.provider,
            mr_enclave = %report.measurements.mr_enclave,
            "Attestation quote generated"
        );

        Ok(AttestationQuote {
            report,
            nonce,
            root_public_key: root_public_key.to_string(),
        })
    }
}
