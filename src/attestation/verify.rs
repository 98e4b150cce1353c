//! Offline verification of attestation quotes.
//!
//! Checks, in order, stopping at the first failure:
//!
//! 1. **Binding**: `userData == hex(sha256(nonce ":" rootPublicKey))`.
//! 2. **Signature**: recomputed for simulator reports; delegated to a
//!    [`ReportVerifier`] for hardware reports.
//! 3. **Measurements**: `mrEnclave` / `mrSigner` against pinned values.
//! 4. **Freshness**: report timestamp within the allowed age of now.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::error::{KmsError, Result};
use crate::tee::attestation::{
    quote_user_data, simulated_report_signature, AttestationQuote, AttestationReport,
    TeeProviderKind,
};

/// Default freshness window.
pub const DEFAULT_MAX_REPORT_AGE: Duration = Duration::from_secs(5 * 60);

// ============================================================================
// Public types
// ============================================================================

/// Measurements a verifier pins. Unset fields are not checked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedMeasurements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mr_enclave: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mr_signer: Option<String>,
}

/// Extension point for hardware report signatures.
///
/// Implement this to check a TDX quote against the Intel PCS
/// certificate chain.
pub trait ReportVerifier: Send + Sync {
    /// `Ok(())` if the report's signature is genuine.
    fn verify_signature(&self, report: &AttestationReport) -> Result<()>;
}

/// Verdict on a quote. `report` is set only when valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOutcome {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<AttestationReport>,
}

impl VerifyOutcome {
    fn valid(report: AttestationReport) -> Self {
        Self {
            valid: true,
            reason: None,
            report: Some(report),
        }
    }

    fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
            report: None,
        }
    }

    /// Turn a failed verification into `AttestationInvalid`.
    pub fn into_result(self) -> Result<AttestationReport> {
        match (self.valid, self.report) {
            (true, Some(report)) => Ok(report),
            _ => Err(KmsError::AttestationInvalid {
                reason: self
                    .reason
                    .unwrap_or_else(|| "Attestation verification failed".to_string()),
            }),
        }
    }
}

// ============================================================================
// Verifier
// ============================================================================

pub struct AttestationVerifier {
    max_report_age: Duration,
    report_verifier: Option<Arc<dyn ReportVerifier>>,
}

impl Default for AttestationVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl AttestationVerifier {
    pub fn new() -> Self {
        Self {
            max_report_age: DEFAULT_MAX_REPORT_AGE,
            report_verifier: None,
        }
    }

    pub fn with_max_report_age(mut self, max_report_age: Duration) -> Self {
        self.max_report_age = max_report_age;
        self
    }

    pub fn with_report_verifier(mut self, verifier: Arc<dyn ReportVerifier>) -> Self {
        self.report_verifier = Some(verifier);
        self
    }

    pub fn max_report_age(&self) -> Duration {
        self.max_report_age
    }

    pub fn verify(
        &self,
        quote: &AttestationQuote,
        expected: Option<&ExpectedMeasurements>,
    ) -> VerifyOutcome {
        let outcome = self.check(quote, expected);
        match &outcome.reason {
            Some(reason) => tracing::warn!(reason = %reason, "Attestation quote rejected"),
            None => tracing::debug!(
                mr_enclave = %quote.report.measurements.mr_enclave,
                "Attestation quote verified"
            ),
        }
        outcome
    }

    fn check(
        &self,
        quote: &AttestationQuote,
        expected: Option<&ExpectedMeasurements>,
    ) -> VerifyOutcome {
        let report = &quote.report;

        // 1. userData binding
        let expected_user_data = quote_user_data(&quote.nonce, &quote.root_public_key);
        if !digests_match(&report.user_data, &expected_user_data) {
            return VerifyOutcome::invalid(
                "Quote userData does not match nonce + rootPublicKey binding",
            );
        }

        // 2. Report signature
        if let Err(reason) = self.check_signature(report) {
            return VerifyOutcome::invalid(reason);
        }

        // 3. Pinned measurements
        if let Some(expected) = expected {
            let pinned = [
                ("mrEnclave", &expected.mr_enclave, &report.measurements.mr_enclave),
                ("mrSigner", &expected.mr_signer, &report.measurements.mr_signer),
            ];
            for (field, want, got) in pinned {
                if let Some(want) = want {
                    if want != got {
                        return VerifyOutcome::invalid(format!(
                            "{field} mismatch: expected {want}, got {got}"
                        ));
                    }
                }
            }
        }

        // 4. Freshness
        let age_ms = chrono::Utc::now()
            .timestamp_millis()
            .saturating_sub(report.timestamp)
            .unsigned_abs();
        if u128::from(age_ms) > self.max_report_age.as_millis() {
            return VerifyOutcome::invalid(format!(
                "Attestation report is stale (older than {})",
                describe_window(self.max_report_age)
            ));
        }

        VerifyOutcome::valid(report.clone())
    }

    fn check_signature(&self, report: &AttestationReport) -> std::result::Result<(), String> {
        const INVALID: &str = "Attestation report signature is invalid (tampered or wrong enclave)";
        match report.provider {
            TeeProviderKind::Simulator => {
                let expected = simulated_report_signature(
                    &report.measurements,
                    &report.user_data,
                    report.timestamp,
                )
                .map_err(|_| INVALID.to_string())?;
                if digests_match(&report.signature, &expected) {
                    Ok(())
                } else {
                    Err(INVALID.to_string())
                }
            }
            provider => match &self.report_verifier {
                Some(verifier) => verifier
                    .verify_signature(report)
                    .map_err(|_| INVALID.to_string()),
                None => Err(format!(
                    "No signature verifier configured for {provider} attestation reports"
                )),
            },
        }
    }
}

fn describe_window(window: Duration) -> String {
    let secs = window.as_secs();
    match (secs / 60, secs % 60) {
        (1, 0) => "1 minute".to_string(),
        (minutes, 0) if minutes > 0 => format!("{minutes} minutes"),
        _ if secs == 1 => "1 second".to_string(),
        _ => format!("{secs} seconds"),
    }
}

/// Compare two hex digests without early exit on the first differing byte.
fn digests_match(actual: &str, expected: &str) -> bool {
    actual.as_bytes().ct_eq(expected.as_bytes()).into()
}

// ============================================================================
// Tests
// ============================================================================
