//! Attestation quotes for remote parties: generation and verification.

pub mod quote;
pub mod verify;

pub use quote::QuoteGenerator;
pub use verify::{AttestationVerifier, ExpectedMeasurements, ReportVerifier, VerifyOutcome};
