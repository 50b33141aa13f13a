//! Bundle Guard CLI
//!
//! - `validate`: run the full validation pass against a live node and print
//!   the per-transaction results as JSON
//! - `check`: offline gateway checks on signed transactions

#![deny(unused_imports)]
#![deny(unused_mut)]
#![deny(unused_variables)]
#![warn(unused_must_use)]

use anyhow::{Context, Result};
use bundle_guard::chain::SolanaRpcNode;
use bundle_guard::config::{GuardConfig, PersistenceBackend};
use bundle_guard::gateway::{decode_transaction, encode_transaction, signatures, JitoBundleTransport, SubmissionGateway};
use bundle_guard::metrics::metrics;
use bundle_guard::orchestrator::{BundleOrchestrator, BundleStatus, BundleStore, MemoryBundleStore, SledBundleStore};
use bundle_guard::BundleTransaction;
use clap::{Parser, Subcommand};
use solana_sdk::{pubkey::Pubkey, transaction::VersionedTransaction};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "bundle_guard.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate and simulate an unsigned bundle
    Validate {
        /// JSON array of base64 bincode transactions
        #[arg(short, long)]
        bundle: PathBuf,

        /// Owner recorded on the bundle record
        #[arg(short, long)]
        owner: String,

        /// Also print the unsigned transactions (with assertion companions) to sign
        #[arg(long)]
        emit_unsigned: bool,

        /// Print Prometheus metrics after the pass
        #[arg(long)]
        print_metrics: bool,
    },

    /// Check size, blockhash and fee-payer constraints of a signed bundle
    Check {
        /// JSON array of base64 bincode transactions
        #[arg(short, long)]
        bundle: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = GuardConfig::from_file_with_env(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;
    init_logging(&config, args.verbose, args.json_logs);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting bundle guard");

    match args.command {
        Command::Validate {
            bundle,
            owner,
            emit_unsigned,
            print_metrics,
        } => validate(&config, &bundle, &owner, emit_unsigned, print_metrics).await,
        Command::Check { bundle } => check(&config, &bundle),
    }
}

/// Initialize logging subsystem
///
/// `RUST_LOG` wins over the configured filter. Logs go to stderr so stdout
/// stays machine-readable.
fn init_logging(config: &GuardConfig, verbose: bool, json_flag: bool) {
    let default_filter = if verbose {
        "bundle_guard=debug,info".to_string()
    } else {
        config.logging.filter.clone()
    };
    let json = json_flag || config.logging.json || cfg!(feature = "json-logs");

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
        }))
        .with((!json).then(|| {
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
        }))
        .init();
}

fn read_bundle(path: &Path) -> Result<Vec<VersionedTransaction>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read bundle file {}", path.display()))?;
    let encoded: Vec<String> =
        serde_json::from_str(&content).context("Bundle file must be a JSON array of base64 strings")?;
    encoded
        .iter()
        .enumerate()
        .map(|(i, s)| decode_transaction(s).with_context(|| format!("Failed to decode tx {}", i)))
        .collect()
}

fn open_store(config: &GuardConfig) -> Result<Arc<dyn BundleStore>> {
    let store: Arc<dyn BundleStore> = match config.persistence.backend {
        PersistenceBackend::Memory => Arc::new(MemoryBundleStore::new()),
        PersistenceBackend::Sled => Arc::new(
            SledBundleStore::open(&config.persistence.path).context("Failed to open bundle store")?,
        ),
    };
    Ok(store)
}

async fn validate(
    config: &GuardConfig,
    bundle: &Path,
    owner: &str,
    emit_unsigned: bool,
    print_metrics: bool,
) -> Result<()> {
    let owner = Pubkey::from_str(owner).context("Invalid owner pubkey")?;
    let transactions = read_bundle(bundle)?
        .iter()
        .map(BundleTransaction::from_versioned)
        .collect::<Result<Vec<_>, _>>()
        .context("Unsupported transaction in bundle")?;

    let commitment = config.rpc.commitment_config()?;
    let node = Arc::new(SolanaRpcNode::new(
        config.rpc.url.clone(),
        Duration::from_millis(config.rpc.timeout_ms),
        commitment,
    ));
    let transport = Arc::new(JitoBundleTransport::new(
        config.gateway.block_engine_url.clone(),
        Duration::from_millis(config.gateway.submit_timeout_ms),
    )?);

    info!(rpc = %node.url(), tx_count = transactions.len(), "Validating bundle");
    let orchestrator = BundleOrchestrator::new(config, node, transport, open_store(config)?)?;
    let validation = orchestrator.validate_bundle(transactions, &owner).await?;

    let mut output = serde_json::json!({ "validation": &validation });
    if emit_unsigned && validation.status == BundleStatus::Simulated {
        let unsigned = validation
            .submission_transactions()?
            .iter()
            .map(encode_transaction)
            .collect::<Result<Vec<_>, _>>()?;
        output["unsigned"] = serde_json::json!(unsigned);
    }
    println!("{}", serde_json::to_string_pretty(&output)?);

    if print_metrics {
        eprintln!("{}", metrics().encode_text()?);
    }

    if validation.status != BundleStatus::Simulated {
        std::process::exit(2);
    }
    Ok(())
}

fn check(config: &GuardConfig, bundle: &Path) -> Result<()> {
    let transactions = read_bundle(bundle)?;
    let transport = Arc::new(JitoBundleTransport::new(
        config.gateway.block_engine_url.clone(),
        Duration::from_millis(config.gateway.submit_timeout_ms),
    )?);
    let gateway = SubmissionGateway::new(
        transport,
        config.gateway.max_bundle_size,
        Duration::from_millis(config.gateway.submit_timeout_ms),
    );

    gateway.check_constraints(&transactions)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "ok": true,
            "signatures": signatures(&transactions),
        }))?
    );
    Ok(())
}
