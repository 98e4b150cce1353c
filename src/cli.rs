//! CLI argument parsing for a3s-kms.
//!
//! Subcommands:
//!   info   Show provider, measurement and root public key
//!   quote  Print an attestation quote as JSON
//!   demo   Create a key, apply a policy and sign with it
//!   config Print the effective configuration

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// A3S KMS: TEE-backed key management for autonomous agents.
#[derive(Parser, Debug)]
#[command(name = "a3s-kms", version, about, long_about = None)]
pub struct Cli {
    /// Config file path (default: $A3S_KMS_HOME/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show TEE provider, measurement and root public key
    Info,

    /// Generate an attestation quote
    Quote(QuoteArgs),

    /// Walk through key creation, policy enforcement and signing
    Demo(DemoArgs),

    /// Print the effective configuration
    Config,
}

#[derive(Parser, Debug)]
pub struct QuoteArgs {
    /// Nonce to bind into the quote (random if omitted)
    #[arg(long)]
    pub nonce: Option<String>,
}

#[derive(Parser, Debug)]
pub struct DemoArgs {
    /// Agent the demo key is created for
    #[arg(long, default_value = "demo-agent")]
    pub agent: String,

    /// Message to sign
    #[arg(long, default_value = "hello from a3s-kms")]
    pub message: String,
}
