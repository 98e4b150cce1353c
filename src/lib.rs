pub mod attestation;
pub mod cli;
pub mod config;
pub mod dirs;
pub mod error;
pub mod kms;
pub(crate) mod lock;
pub mod policy;
pub mod service;
pub mod tee;
