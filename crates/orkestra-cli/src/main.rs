//! `orkestra`: run, validate and audit task graphs from the command line.

mod config;

use clap::{Parser, Subcommand};
use orkestra_orchestrator::{Orchestrator, TaskGraph};
use orkestra_security::verify_chain;
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Exit status when the ledger fails verification.
const EXIT_INTEGRITY_ALARM: u8 = 2;

#[derive(Parser)]
#[command(name = "orkestra", about = "Orkestra: audited DAG task orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "orkestra.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a task graph
    Run {
        /// JSON graph file (`{"tasks": [...]}`)
        #[arg(short, long)]
        graph: PathBuf,
        /// Dispatch across the configured worker pool
        #[arg(long)]
        distributed: bool,
    },
    /// Check a task graph for missing dependencies and cycles
    Validate {
        #[arg(short, long)]
        graph: PathBuf,
    },
    /// Verify the forensic ledger's hash chain
    Verify {
        /// Ledger file (overrides config)
        #[arg(long)]
        ledger: Option<PathBuf>,
    },
    /// Print the configured worker pool
    Workers,
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = config::load_config(&cli.config).await?;

    match cli.command {
        Commands::Run { graph, distributed } => {
            let mut graph = TaskGraph::load(&graph).await?;
            let kernel = Orchestrator::new(config)?;
            info!(
                session_id = %kernel.session_id(),
                tasks = graph.len(),
                distributed,
                "starting run"
            );

            let summary = if distributed {
                kernel.run_distributed(&mut graph).await?
            } else {
                kernel.run(&mut graph).await?
            };

            if distributed {
                print_json(&json!({
                    "summary": summary,
                    "cluster": kernel.cluster_summary(),
                }))?;
            } else {
                print_json(&summary)?;
            }
            Ok(if summary.succeeded() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Validate { graph } => {
            let graph = TaskGraph::load(&graph).await?;
            match graph.validate() {
                Ok(order) => {
                    print_json(&json!({ "valid": true, "order": order }))?;
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    print_json(&json!({ "valid": false, "error": e.to_string() }))?;
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Commands::Verify { ledger } => {
            let path = ledger.unwrap_or(config.ledger.path);
            let verification = verify_chain(&path).await?;
            print_json(&verification)?;
            match verification.alarm(&path) {
                Some(alarm) => {
                    error!(alarm = %alarm, "forensic ledger integrity alarm");
                    Ok(ExitCode::from(EXIT_INTEGRITY_ALARM))
                }
                None => Ok(ExitCode::SUCCESS),
            }
        }
        Commands::Workers => {
            print_json(&json!({
                "strategy": config.cluster.strategy,
                "workers": config.cluster.workers,
                "failover": config.cluster.failover,
                "heartbeat": config.cluster.heartbeat,
            }))?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
