use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use a3s_kms::cli::{Cli, Command, DemoArgs, QuoteArgs};
use a3s_kms::config::KmsConfig;
use a3s_kms::kms::{CreateKeyRequest, KeyPurpose, TransactionRequest};
use a3s_kms::policy::PolicyRuleConfig;
use a3s_kms::service::KmsService;

const ONE_ETH: u128 = 1_000_000_000_000_000_000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => KmsConfig::load_at(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => KmsConfig::load().context("failed to load config")?,
    };
    init_tracing();

    match cli.command {
        Command::Info => run_info(&config).await?,
        Command::Quote(args) => run_quote(&config, args).await?,
        Command::Demo(args) => run_demo(&config, args).await?,
        Command::Config => print!("{}", toml::to_string_pretty(&config)?),
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn start(config: &KmsConfig) -> anyhow::Result<KmsService> {
    KmsService::from_config(config)
        .await
        .with_context(|| format!("failed to start {} TEE runtime", config.provider))
}

async fn run_info(config: &KmsConfig) -> anyhow::Result<()> {
    let service = start(config).await?;
    println!("Provider:        {}", service.provider());
    println!("Measurement:     {}", service.measurement().await?);
    println!("Root public key: {}", service.root_public_key().await?);
    service.shutdown().await?;
    Ok(())
}

async fn run_quote(config: &KmsConfig, args: QuoteArgs) -> anyhow::Result<()> {
    let service = start(config).await?;
    let quote = service.generate_quote(args.nonce.as_deref()).await?;
    println!("{}", serde_json::to_string_pretty(&quote)?);
    service.shutdown().await?;
    Ok(())
}

async fn run_demo(config: &KmsConfig, args: DemoArgs) -> anyhow::Result<()> {
    let service = start(config).await?;

    let created = service
        .create_key(&CreateKeyRequest::new(&args.agent, KeyPurpose::Signing))
        .await?;
    let key_id = created.key_id.as_str();
    println!("Created key {key_id}");
    println!("  address:    {}", created.address);
    println!("  public key: {}", created.public_key);

    service.set_policy(
        key_id,
        vec![
            PolicyRuleConfig::Caller {
                allowed_callers: vec![args.agent.clone()],
            },
            PolicyRuleConfig::SpendingLimit {
                max_value_per_tx: ONE_ETH,
                max_value_per_day: 5 * ONE_ETH,
            },
        ],
    )?;
    println!("\nPolicy: caller = {}, spend <= 1 ETH/tx, 5 ETH/day", args.agent);

    let signed = service
        .sign_message(key_id, &args.agent, args.message.as_bytes())
        .await?;
    println!("\nSigned message {:?}", args.message);
    println!("  signature: {}", signed.signature);

    match service
        .sign_message(key_id, "intruder", args.message.as_bytes())
        .await
    {
        Ok(_) => println!("\nUnexpected: intruder was allowed to sign"),
        Err(e) => println!("\nIntruder rejected: {e}"),
    }

    let tx = TransactionRequest {
        to: Some("0x000000000000000000000000000000000000dEaD".to_string()),
        value: Some(ONE_ETH / 10),
        chain_id: 1,
        gas_limit: 21_000,
        max_fee_per_gas: 30_000_000_000,
        max_priority_fee_per_gas: 1_000_000_000,
        ..Default::default()
    };
    let signed_tx = service.sign_transaction(key_id, &args.agent, &tx).await?;
    println!("\nSigned 0.1 ETH transfer");
    println!("  hash: {}", signed_tx.hash);

    let too_big = TransactionRequest {
        value: Some(2 * ONE_ETH),
        nonce: 1,
        ..tx
    };
    match service.sign_transaction(key_id, &args.agent, &too_big).await {
        Ok(_) => println!("\nUnexpected: 2 ETH transfer was allowed"),
        Err(e) => println!("\n2 ETH transfer rejected: {e}"),
    }

    let rotated = service.rotate_key(key_id).await?;
    println!(
        "\nRotated {} -> {} (epoch {})",
        rotated.previous_key_id, rotated.new_key_id, rotated.epoch
    );

    service.shutdown().await?;
    Ok(())
}
