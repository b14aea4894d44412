use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use querywatch::config::{LoggingConfig, PipelineConfig};
use querywatch::storage::checkpoint::CheckpointStore;

#[derive(Parser)]
#[command(
    name = "querywatch",
    about = "Continuous anomaly detection and escalation for database query logs",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the detection pipeline
    Run {
        /// Run a single cycle, print its summary and exit
        #[arg(long)]
        once: bool,
    },

    /// Inspect or move the ingestion checkpoint
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Index JSON-lines log documents into the source index
    Replay {
        /// JSON-lines input file
        #[arg(long)]
        file: PathBuf,

        /// Target index (defaults to the source pattern with `*` -> `replay`)
        #[arg(long)]
        index: Option<String>,
    },

    /// Print the severity a score maps to under the configured thresholds
    Classify {
        /// Anomaly score, e.g. -0.2
        #[arg(allow_negative_numbers = true)]
        score: f64,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Print the stored checkpoint and the effective lower bound
    Show,

    /// Overwrite the checkpoint
    Set {
        /// RFC 3339 timestamp
        timestamp: DateTime<Utc>,
    },

    /// Delete the checkpoint; the next cycle starts from the fallback window
    Reset,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = PipelineConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Run { once: true } => {
            let report = querywatch::run_once(&config).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Run { once: false } => {
            let token = CancellationToken::new();
            let signal_token = token.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupt received, shutting down");
                    signal_token.cancel();
                }
            });
            tracing::info!(backend = ?config.store.backend, "starting querywatch");
            querywatch::run(&config, token).await?;
        }
        Commands::Checkpoint { action } => {
            let checkpoint = CheckpointStore::new(
                config.ingest.checkpoint_path.clone(),
                config.ingest.fallback_window_mins,
            );
            match action {
                CheckpointAction::Show => {
                    match checkpoint.read() {
                        Some(ts) => println!("stored:    {}", ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
                        None => println!("stored:    (none)"),
                    }
                    println!(
                        "effective: {}",
                        checkpoint.load().to_rfc3339_opts(SecondsFormat::AutoSi, true)
                    );
                    println!("path:      {}", checkpoint.path().display());
                }
                CheckpointAction::Set { timestamp } => {
                    checkpoint.commit(timestamp).await?;
                    println!("checkpoint set to {}", timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true));
                }
                CheckpointAction::Reset => {
                    checkpoint.reset()?;
                    println!("checkpoint removed");
                }
            }
        }
        Commands::Replay { file, index } => {
            let index = index.unwrap_or_else(|| config.indices.source.replace('*', "replay"));
            let reader = BufReader::new(
                File::open(&file).with_context(|| format!("failed to open {}", file.display()))?,
            );
            let store = querywatch::storage::open_store(&config.store)?;
            let count = querywatch::ingest::replay::replay_lines(
                store.as_ref(),
                &index,
                reader,
                config.store.timeout(),
            )
            .await?;
            println!("indexed {} documents into {}", count, index);
        }
        Commands::Classify { score } => {
            println!("{}", config.severity.classify(score));
        }
    }

    Ok(())
}
