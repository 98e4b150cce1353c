//! TEE (Trusted Execution Environment) layer.
//!
//! Everything that must stay inside the enclave boundary lives here:
//! - Sealed storage (AES-256-GCM bound to the enclave measurement)
//! - Runtime abstraction over the simulator and dstack (Intel TDX)
//! - Attestation report generation
//! - `Protected` wrapper for unsealed secrets (redacted, zeroized, mlocked)

pub mod attestation;
pub mod boundary;
pub mod hardware;
pub mod runtime;
pub mod sealed;
pub mod simulator;

pub use attestation::{
    AttestationProvider, AttestationQuote, AttestationReport, CodeMeasurements, TeeProviderKind,
};
pub use boundary::Protected;
pub use runtime::TeeRuntime;
pub use sealed::SealedStorage;
