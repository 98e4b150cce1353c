//! a3s-kms-verify: offline verification of a3s-kms attestation quotes.
//!
//! Reads an `AttestationQuote` JSON file (as printed by `a3s-kms quote`),
//! checks the nonce/root-key binding, the report signature, optional pinned
//! measurements and freshness. Exits non-zero if the quote is invalid.
//!
//! # Usage
//!
//! ```text
//! a3s-kms quote --nonce deadbeef > quote.json
//! a3s-kms-verify --file quote.json --mr-enclave <hex> --mr-signer <hex>
//! ```

use std::process;
use std::time::Duration;

use anyhow::Context;

use a3s_kms::attestation::{AttestationVerifier, ExpectedMeasurements};
use a3s_kms::tee::attestation::AttestationQuote;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    match run(&args[1..]) {
        Ok(true) => {}
        Ok(false) => process::exit(2),
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    }
}

fn run(args: &[String]) -> anyhow::Result<bool> {
    let opts = parse_args(args)?;

    let content = std::fs::read_to_string(&opts.file)
        .with_context(|| format!("failed to read quote file {}", opts.file))?;
    let quote: AttestationQuote =
        serde_json::from_str(&content).context("quote file is not a valid attestation quote")?;

    let expected = ExpectedMeasurements {
        mr_enclave: opts.mr_enclave,
        mr_signer: opts.mr_signer,
    };
    let mut verifier = AttestationVerifier::new();
    if let Some(secs) = opts.max_age_secs {
        verifier = verifier.with_max_report_age(Duration::from_secs(secs));
    }

    let outcome = verifier.verify(&quote, Some(&expected));

    println!("Provider:    {}", quote.report.provider);
    println!("Timestamp:   {}", quote.report.timestamp);
    println!("mrEnclave:   {}", quote.report.measurements.mr_enclave);
    println!("mrSigner:    {}", quote.report.measurements.mr_signer);
    println!("Root key:    {}", quote.root_public_key);

    match outcome.reason {
        None => {
            println!("\nAttestation OK");
            Ok(true)
        }
        Some(reason) => {
            println!("\nAttestation INVALID: {reason}");
            Ok(false)
        }
    }
}

// ============================================================================
// Argument parsing
// ============================================================================

struct CliOpts {
    /// Path to a JSON file containing an AttestationQuote
    file: String,
    /// Expected mrEnclave
    mr_enclave: Option<String>,
    /// Expected mrSigner
    mr_signer: Option<String>,
    /// Freshness window in seconds
    max_age_secs: Option<u64>,
}

fn parse_args(args: &[String]) -> anyhow::Result<CliOpts> {
    let mut file = None;
    let mut mr_enclave = None;
    let mut mr_signer = None;
    let mut max_age_secs = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                process::exit(0);
            }
            "--file" => file = Some(next_arg(args, &mut i, "--file")?),
            "--mr-enclave" => mr_enclave = Some(next_arg(args, &mut i, "--mr-enclave")?),
            "--mr-signer" => mr_signer = Some(next_arg(args, &mut i, "--mr-signer")?),
            "--max-age" => {
                let value = next_arg(args, &mut i, "--max-age")?;
                max_age_secs = Some(
                    value
                        .parse()
                        .map_err(|e| anyhow::anyhow!("invalid --max-age '{value}': {e}"))?,
                );
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
        i += 1;
    }

    let file = file.ok_or_else(|| {
        anyhow::anyhow!("--file is required. Run with --help for usage.")
    })?;

    Ok(CliOpts {
        file,
        mr_enclave,
        mr_signer,
        max_age_secs,
    })
}

fn next_arg(args: &[String], i: &mut usize, flag: &str) -> anyhow::Result<String> {
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("{flag} requires a value"))
}

fn print_help() {
    println!(
        r#"a3s-kms-verify: verify attestation quotes from a3s-kms

USAGE:
    a3s-kms-verify --file <PATH> [OPTIONS]

OPTIONS:
    --file <PATH>          Quote JSON file (output of `a3s-kms quote`)
    --mr-enclave <HEX>     Expected enclave measurement
    --mr-signer <HEX>      Expected signer measurement
    --max-age <SECS>       Freshness window in seconds (default: 300)
    -h, --help             Print this help

EXIT STATUS:
    0  quote is valid
    1  usage or input error
    2  quote is invalid"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_all_flags() {
        let opts = parse_args(&args(&[
            "--file", "q.json", "--mr-enclave", "aa", "--mr-signer", "bb", "--max-age", "60",
        ]))
        .unwrap();
        assert_eq!(opts.file, "q.json");
        assert_eq!(opts.mr_enclave.as_deref(), Some("aa"));
        assert_eq!(opts.mr_signer.as_deref(), Some("bb"));
        assert_eq!(opts.max_age_secs, Some(60));
    }

    #[test]
    fn test_file_required() {
        assert!(parse_args(&args(&["--mr-enclave", "aa"])).is_err());
    }

    #[test]
    fn test_missing_value() {
        assert!(parse_args(&args(&["--file"])).is_err());
    }

    #[test]
    fn test_unknown_flag() {
        assert!(parse_args(&args(&["--file", "q.json", "--url", "x"])).is_err());
    }
}
