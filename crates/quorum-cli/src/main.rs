//! `quorum`: run one agent through the harness and print its summary.

use anyhow::{bail, Context};
use clap::Parser;
use quorum_agents::{CloserAgent, CollectorAgent, Harness};
use quorum_types::record::Metadata;
use quorum_types::QuorumConfig;
use serde_json::json;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quorum", version, about = "Run a Quorum agent")]
struct Cli {
    /// Agent to run: closer or collector.
    agent: String,

    /// Lookback window for the closer, e.g. 12h or 2d.
    #[arg(long, default_value = "24h")]
    since: String,

    /// Files to ingest via the collector.
    #[arg(value_name = "PATH")]
    paths: Vec<PathBuf>,

    /// Log filter, e.g. info or quorum_agents=debug.
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Parse a lookback like `12h` or `2d` into hours.
fn parse_since(value: &str) -> anyhow::Result<i64> {
    let (number, unit) = value.split_at(value.len().saturating_sub(1));
    let amount: i64 = number
        .parse()
        .with_context(|| format!("invalid lookback: {value}"))?;
    if amount <= 0 {
        bail!("lookback must be positive: {value}");
    }
    match unit {
        "h" => Ok(amount),
        "d" => Ok(amount * 24),
        _ => bail!("lookback must end in h or d: {value}"),
    }
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = QuorumConfig::from_env();
    let mut harness = Harness::new(config);

    let summary = match cli.agent.as_str() {
        "closer" => {
            let hours = parse_since(&cli.since)?;
            let mut agent = CloserAgent::new(hours);
            harness.execute(&mut agent).await?
        }
        "collector" => {
            let mut agent = CollectorAgent::new();
            for path in &cli.paths {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let mut metadata = Metadata::new();
                metadata.insert(
                    "filename".to_string(),
                    json!(path.file_name().map(|n| n.to_string_lossy().to_string())),
                );
                agent.queue_item("file", &content, metadata);
            }
            harness.execute(&mut agent).await?
        }
        other => bail!("unknown agent: {other} (expected closer or collector)"),
    };

    println!("{summary}");
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    if let Err(e) = run(cli).await {
        tracing::error!(error = %e, "Run failed");
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
