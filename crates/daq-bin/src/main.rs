//! CLI entry point for daq-blocks
//!
//! Provides:
//! - `serve`: assemble the blocks in a config file, publish them and run
//!   until Ctrl-C
//! - `scan`: one-shot demo, a SCAN block driving a simulated detector,
//!   watched through a block server channel
//!
//! # Usage
//!
//! ```bash
//! daq-blocks serve --config config/blocks.toml
//! daq-blocks scan --steps 20 --exposure 0.05
//! daq-blocks scan --steps 20 --fault-at 7
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use tokio::signal;
use tracing::info;

use daq_bin::assemble;
use daq_core::changes::Change;
use daq_core::config::{BlockDefinition, BlockKind, ProcessConfig};
use daq_core::logging::{self, TracingConfig};
use daq_server::{ChannelClient, Invocation, SessionEvent};

#[derive(Parser)]
#[command(name = "daq-blocks")]
#[command(about = "Device-control blocks served over shared channels", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assemble and serve the configured blocks until Ctrl-C
    Serve {
        /// Process configuration file (TOML format)
        #[arg(long, default_value = "config/blocks.toml")]
        config: PathBuf,
    },

    /// Run one scan over a simulated detector and print what a client sees
    Scan {
        /// Number of steps
        #[arg(long, default_value = "10")]
        steps: i64,

        /// Exposure per step in seconds
        #[arg(long, default_value = "0.1")]
        exposure: f64,

        /// Make the detector fault at this step
        #[arg(long)]
        fault_at: Option<i64>,

        /// Simulated time per step in milliseconds
        #[arg(long, default_value = "20")]
        step_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => serve(config).await,
        Commands::Scan {
            steps,
            exposure,
            fault_at,
            step_ms,
        } => scan_once(steps, exposure, fault_at, step_ms).await,
    }
}

async fn serve(path: PathBuf) -> Result<()> {
    let config = ProcessConfig::load_from(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    config.validate()?;
    logging::init_from_config(&config)?;

    let assembly = assemble(&config)?;
    assembly.process.start().await?;
    info!(
        config = %path.display(),
        published = ?assembly.process.published(),
        "Serving blocks, Ctrl-C to stop"
    );

    signal::ctrl_c().await?;
    info!("Shutting down");
    assembly.process.stop().await?;
    Ok(())
}

fn demo_config(fault_at: Option<i64>, step_ms: u64) -> ProcessConfig {
    let mut config = ProcessConfig::default();
    config.application.name = "scan-demo".to_string();
    config.blocks = vec![
        BlockDefinition {
            mri: "DET".to_string(),
            kind: BlockKind::Detector,
            child: None,
            steps_interval_ms: step_ms,
            fault_at_step: fault_at,
            publish: true,
        },
        BlockDefinition {
            mri: "SCAN".to_string(),
            kind: BlockKind::Scan,
            child: Some("DET".to_string()),
            steps_interval_ms: step_ms,
            fault_at_step: None,
            publish: true,
        },
    ];
    config
}

fn describe(change: &Change) -> Option<String> {
    match change {
        Change::Update { path, value } if path.last().map(String::as_str) == Some("value") => {
            let field = path.first()?;
            matches!(field.as_str(), "state" | "completedSteps" | "health")
                .then(|| format!("{field} = {value}"))
        }
        _ => None,
    }
}

async fn watch(mut client: ChannelClient) {
    while let Some(event) = client.recv().await {
        match event {
            SessionEvent::Open { snapshot } => {
                println!("open: state = {}", snapshot["state"]["value"]);
            }
            SessionEvent::Update { changes } => {
                for line in changes.iter().filter_map(describe) {
                    println!("  {line}");
                }
            }
            SessionEvent::Close => {
                println!("closed");
                break;
            }
        }
    }
}

async fn call(client: &ChannelClient, method: &str, query: Map<String, Value>) -> Result<Value> {
    client
        .rpc(Invocation::Explicit {
            path: vec!["SCAN".to_string(), method.to_string()],
            query,
        })
        .await
        .with_context(|| format!("SCAN.{method}"))
}

async fn scan_once(steps: i64, exposure: f64, fault_at: Option<i64>, step_ms: u64) -> Result<()> {
    logging::init(TracingConfig::new(tracing::Level::WARN))?;

    let assembly = assemble(&demo_config(fault_at, step_ms))?;
    assembly.process.start().await?;

    let channel = assembly.server.make_channel("SCAN")?;
    let watcher = tokio::spawn(watch(channel.connect().await?));
    let client = channel.connect().await?;

    let mut query = Map::new();
    query.insert("steps".to_string(), json!(steps));
    query.insert("exposure".to_string(), json!(exposure));
    let outcome = async {
        call(&client, "configure", query).await?;
        call(&client, "run", Map::new()).await
    }
    .await;

    let scan = assembly.block("SCAN")?;
    let summary = format!(
        "{} after {} of {steps} steps ({})",
        scan.state(),
        scan.completed_steps(),
        scan.health()
    );
    client.disconnect().await?;
    assembly.process.stop().await?;
    watcher.await?;

    match outcome {
        Ok(_) => {
            println!("{summary}");
            Ok(())
        }
        Err(err) => bail!("scan failed: {summary}: {err:#}"),
    }
}
