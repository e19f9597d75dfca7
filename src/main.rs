use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use anomaly_detector::config::{DetectorConfig, LogFormat, LoggingConfig};
use anomaly_detector::detect::{AnomalyEngine, ResolutionStatus};
use anomaly_detector::scheduler::CycleRunner;
use anomaly_detector::sink::{self, AnomalySink, JsonLinesSink, MemorySink, RetryPolicy};
use anomaly_detector::source::{replay, ReplaySource, ResourceSampler};
use anomaly_detector::storage::{self, AnomalyStore};

#[derive(Parser)]
#[command(
    name = "anomaly-detector",
    about = "Baseline-driven anomaly detection for request-serving metrics",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (cycle loop + delivery workers + API server)
    Serve {
        /// Bind address, overrides [api] bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Evaluate recorded metric batches, one cycle per line
    Replay {
        /// JSON-lines file of metric batches
        #[arg(long)]
        input: PathBuf,

        /// Append anomalies to this JSON-lines file
        #[arg(long, conflicts_with = "db")]
        out: Option<PathBuf>,

        /// Store anomalies in this SQLite database
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Inspect and manage stored anomalies
    Anomalies {
        /// Database path, overrides [storage] db_path
        #[arg(long)]
        db: Option<PathBuf>,

        #[command(subcommand)]
        action: AnomalyAction,
    },

    /// Validate the configuration and exit
    CheckConfig,
}

#[derive(Subcommand)]
enum AnomalyAction {
    /// List anomalies, newest first
    List {
        /// Only this status: open, acknowledged or resolved
        #[arg(long)]
        status: Option<ResolutionStatus>,

        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Mark an anomaly as acknowledged
    Acknowledge { id: String },

    /// Mark an anomaly as resolved
    Resolve { id: String },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = DetectorConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.api.bind = bind;
            }
            config.validate().context("invalid configuration")?;
            tracing::info!(bind = %config.api.bind, "Starting anomaly detector");
            anomaly_detector::serve(config).await?;
        }
        Commands::Replay { input, out, db } => {
            config.validate().context("invalid configuration")?;
            run_replay(&config, &input, out, db).await?;
        }
        Commands::Anomalies { db, action } => {
            let path = db.unwrap_or_else(|| config.storage.db_path.clone());
            let store = AnomalyStore::new(storage::open_pool(&path)?);
            match action {
                AnomalyAction::List { status, limit } => {
                    let anomalies = store.list(status, limit)?;
                    for anomaly in &anomalies {
                        println!("{}", serde_json::to_string(anomaly)?);
                    }
                    eprintln!("{} anomalies", anomalies.len());
                }
                AnomalyAction::Acknowledge { id } => {
                    let anomaly = store.transition(&id, ResolutionStatus::Acknowledged)?;
                    println!("{} is now {}", id, anomaly.status);
                }
                AnomalyAction::Resolve { id } => {
                    let anomaly = store.transition(&id, ResolutionStatus::Resolved)?;
                    println!("{} is now {}", id, anomaly.status);
                }
            }
        }
        Commands::CheckConfig => {
            config.validate().context("invalid configuration")?;
            println!("configuration OK");
            println!(
                "  baseline: min_samples={} window_size={} max_age_secs={}",
                config.baseline.min_samples, config.baseline.window_size, config.baseline.max_age_secs
            );
            let mut metrics: Vec<&String> = config.thresholds.metrics.keys().collect();
            metrics.sort();
            for metric in metrics {
                let t = &config.thresholds.metrics[metric];
                println!(
                    "  {}: warning>={} critical>={} or |pct|>={} (floor {})",
                    metric,
                    t.warning_deviation,
                    t.critical_deviation,
                    t.critical_percentage_change,
                    t.min_absolute_change
                );
            }
        }
    }

    Ok(())
}

async fn run_replay(
    config: &DetectorConfig,
    input: &std::path::Path,
    out: Option<PathBuf>,
    db: Option<PathBuf>,
) -> Result<()> {
    let batches = replay::read_batches(input)?;
    let count = batches.len();

    let memory = Arc::new(MemorySink::new());
    let sink: Arc<dyn AnomalySink> = match (&out, &db) {
        (Some(path), _) => Arc::new(JsonLinesSink::open(path).await?),
        (None, Some(path)) => Arc::new(AnomalyStore::new(storage::open_pool(path)?)),
        (None, None) => memory.clone(),
    };
    let (emitter, worker) = sink::attach(sink, config.sink.queue_capacity, RetryPolicy::from(&config.sink));

    // Recorded batches carry their own context; the live host is irrelevant.
    let runner = CycleRunner::new(
        AnomalyEngine::from_config(config),
        Arc::new(ReplaySource::new(batches)),
        emitter,
        Arc::new(ResourceSampler::disabled()),
    );

    let (mut anomalies, mut warming_up, mut failed) = (0usize, 0usize, 0usize);
    for _ in 0..count {
        let report = runner.run_once().await?;
        anomalies += report.records.len();
        warming_up += report.warming_up.len();
        failed += report.failed.len();
    }
    drop(runner);
    worker.await.context("delivery worker panicked")?;

    if out.is_none() && db.is_none() {
        for record in memory.records().await {
            println!("{}", serde_json::to_string(&record)?);
        }
    }
    println!(
        "replayed {} batches: {} anomalies, {} warming up, {} failed",
        count, anomalies, warming_up, failed
    );
    Ok(())
}
