//! foldwatch daemon
//!
//! Polls folding workers, reconciles their log, unit-info and queue files,
//! keeps per-project frame-time benchmarks and decides each worker's status.

#![forbid(unsafe_code)]

mod aggregator;
mod benchmarks;
mod events;
mod history;
mod poller;
mod status;
mod transport;
mod worker;

use anyhow::{Context, Result, bail};
use benchmarks::BenchmarkStore;
use clap::{Parser, Subcommand, ValueEnum};
use events::EventBus;
use foldwatch_common::config::{FoldwatchConfig, Severity};
use foldwatch_common::logging::{LogConfig, init_logging};
use foldwatch_common::types::WorkerName;
use history::CompletedUnitHistory;
use poller::{PollContext, PollSettings, Poller, PollerConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use transport::TransportFetcher;
use worker::{DisplayedUnits, WorkerRegistry, WorkerView};

const BENCHMARKS_FILE: &str = "benchmarks.json";
const HISTORY_FILE: &str = "completed.jsonl";
const DISPLAYED_FILE: &str = "displayed.json";
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "foldwatchd")]
#[command(author, version, about = "foldwatch daemon - folding worker status monitor")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "FOLDWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll all workers forever (default)
    Run,

    /// Poll every worker once and print the results
    Poll {
        #[arg(long, value_enum, default_value_t = OutputFormat::Pretty)]
        format: OutputFormat,
    },

    /// Print the stored frame-time benchmarks
    Benchmarks {
        /// Only show this worker
        #[arg(long)]
        worker: Option<String>,

        /// Delete the benchmarks of --worker instead of printing them
        #[arg(long, requires = "worker")]
        forget: bool,

        #[arg(long, value_enum, default_value_t = OutputFormat::Pretty)]
        format: OutputFormat,
    },

    /// Print recently completed units
    History {
        /// Only show this worker
        #[arg(long)]
        worker: Option<String>,

        /// Maximum number of units to show
        #[arg(long, default_value = "20")]
        limit: usize,

        #[arg(long, value_enum, default_value_t = OutputFormat::Pretty)]
        format: OutputFormat,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Pretty,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = FoldwatchConfig::load(cli.config.as_deref())?;
    let env_errors = config.apply_env_overrides();

    let mut log_config = LogConfig::from_env(&config.general.log_level).with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    if let Some(dir) = config.general.log_dir.as_ref() {
        log_config = log_config.with_file_dir(dir);
    }
    let _guards = init_logging(&log_config)?;

    for error in env_errors {
        warn!(error = %error, "Ignoring environment override");
    }
    validate(&config)?;

    let data_dir = config.general.resolved_data_dir();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&config, data_dir.as_deref()).await,
        Commands::Poll { format } => poll(&config, data_dir.as_deref(), format).await,
        Commands::Benchmarks {
            worker,
            forget: true,
            ..
        } => forget_benchmarks(data_dir.as_deref(), worker.as_deref()),
        Commands::Benchmarks { worker, format, .. } => {
            print_benchmarks(data_dir.as_deref(), worker.as_deref(), format)
        }
        Commands::History {
            worker,
            limit,
            format,
        } => print_history(&config, data_dir.as_deref(), worker.as_deref(), limit, format),
    }
}

fn validate(config: &FoldwatchConfig) -> Result<()> {
    let mut errors = Vec::new();
    for issue in config.validate() {
        match issue.severity {
            Severity::Warning => warn!("Configuration: {}", issue.message),
            Severity::Error => errors.push(issue.message),
        }
    }
    if !errors.is_empty() {
        bail!("invalid configuration: {}", errors.join("; "));
    }
    Ok(())
}

fn load_benchmarks(data_dir: Option<&Path>) -> BenchmarkStore {
    let Some(path) = data_dir.map(|dir| dir.join(BENCHMARKS_FILE)) else {
        return BenchmarkStore::new();
    };
    if !path.exists() {
        debug!(path = %path.display(), "No benchmark file yet");
        return BenchmarkStore::new();
    }
    match BenchmarkStore::load_from_file(&path) {
        Ok(store) => {
            info!(path = %path.display(), benchmarks = store.len(), "Loaded benchmarks");
            store
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to load benchmarks, starting empty");
            BenchmarkStore::new()
        }
    }
}

fn load_history(data_dir: Option<&Path>, capacity: usize) -> CompletedUnitHistory {
    let Some(path) = data_dir.map(|dir| dir.join(HISTORY_FILE)) else {
        info!("Completed-unit history in-memory only (no data directory)");
        return CompletedUnitHistory::new(capacity);
    };
    let history = if path.exists() {
        match CompletedUnitHistory::load_from_file(&path, capacity) {
            Ok(history) => {
                info!(path = %path.display(), units = history.len(), "Loaded completed-unit history");
                history
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to load completed-unit history");
                CompletedUnitHistory::new(capacity)
            }
        }
    } else {
        CompletedUnitHistory::new(capacity)
    };
    history.with_persistence(path)
}

fn load_displayed(data_dir: &Path) -> DisplayedUnits {
    let path = data_dir.join(DISPLAYED_FILE);
    match DisplayedUnits::load(&path) {
        Ok(displayed) => displayed,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Discarding displayed units, frames may be counted again");
            DisplayedUnits::at(path)
        }
    }
}

struct Daemon {
    registry: Arc<WorkerRegistry>,
    context: Arc<PollContext>,
    history: Arc<CompletedUnitHistory>,
}

fn build_daemon(config: &FoldwatchConfig, data_dir: Option<&Path>) -> Daemon {
    let registry = Arc::new(WorkerRegistry::from_configs(config.workers.iter().cloned()));
    let benchmarks = Arc::new(load_benchmarks(data_dir));
    let history = Arc::new(load_history(data_dir, config.general.history_capacity));

    let mut context = PollContext::new(
        Arc::new(TransportFetcher::new(HTTP_TIMEOUT)),
        benchmarks,
        Arc::clone(&history),
        EventBus::default(),
        PollSettings::from_config(&config.general),
    );
    if let Some(dir) = data_dir {
        context = context
            .with_benchmarks_path(dir.join(BENCHMARKS_FILE))
            .with_displayed_units(load_displayed(dir));
    }
    registry.resume(&context.displayed);

    Daemon {
        registry,
        context: Arc::new(context),
        history,
    }
}

async fn run(config: &FoldwatchConfig, data_dir: Option<&Path>) -> Result<()> {
    info!("Starting foldwatch daemon...");
    let daemon = build_daemon(config, data_dir);
    for worker in daemon.registry.all() {
        info!(
            worker = %worker.name(),
            path = %worker.config.path,
            transport = ?worker.config.transport,
            kind = ?worker.config.kind,
            "Monitoring worker"
        );
    }

    let mut events = daemon.context.events.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => debug!(event = %event, "Event"),
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "Event log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    info!(
        workers = daemon.registry.len(),
        interval = %humantime::format_duration(config.general.poll_interval),
        "Polling"
    );
    let poller = Poller::new(
        Arc::clone(&daemon.registry),
        Arc::clone(&daemon.context),
        PollerConfig {
            poll_interval: config.general.poll_interval,
        },
    );
    let handle = poller.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutting down");
    handle.abort();
    daemon.history.flush().await;
    Ok(())
}

async fn poll(config: &FoldwatchConfig, data_dir: Option<&Path>, format: OutputFormat) -> Result<()> {
    let daemon = build_daemon(config, data_dir);
    let poller = Poller::new(
        Arc::clone(&daemon.registry),
        Arc::clone(&daemon.context),
        PollerConfig::default(),
    );
    let outcomes = poller.poll_all().await;
    debug!(?outcomes, "Poll finished");
    daemon.history.flush().await;

    let views = daemon.registry.views();
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&views)?),
        OutputFormat::Pretty => {
            for view in &views {
                println!("{}", describe(view));
            }
        }
    }
    Ok(())
}

fn describe(view: &WorkerView) -> String {
    let mut line = format!("{:<20} {}", view.name.as_str(), view.status);
    if let Some(identity) = view.current_unit().and_then(|unit| unit.identity) {
        line.push_str(&format!("  {}", identity.tag()));
    }
    if let Some(percent) = view.progress_percent {
        line.push_str(&format!("  {percent}%"));
    }
    if view.frame_time_secs > 0 {
        line.push_str(&format!(
            "  frame {}",
            humantime::format_duration(Duration::from_secs(view.frame_time_secs))
        ));
    }
    if let Some(error) = view.error.as_deref() {
        line.push_str(&format!("  ({error})"));
    }
    line
}

fn print_benchmarks(data_dir: Option<&Path>, worker: Option<&str>, format: OutputFormat) -> Result<()> {
    let store = load_benchmarks(data_dir);
    let worker = worker.map(WorkerName::new);
    let summaries = store.summaries(worker.as_ref());

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summaries)?),
        OutputFormat::Pretty => {
            if summaries.is_empty() {
                println!("No benchmarks recorded");
            }
            for summary in &summaries {
                println!(
                    "{:<20} P{:<6} {:>4} frames  min {}  avg {}",
                    summary.key.worker_name.as_str(),
                    summary.key.project,
                    summary.samples,
                    humantime::format_duration(Duration::from_secs(summary.minimum_secs)),
                    humantime::format_duration(Duration::from_secs(summary.average_secs)),
                );
            }
        }
    }
    Ok(())
}

fn forget_benchmarks(data_dir: Option<&Path>, worker: Option<&str>) -> Result<()> {
    let Some(dir) = data_dir else {
        bail!("no data directory configured");
    };
    let Some(worker) = worker else {
        bail!("--forget needs --worker");
    };
    let path = dir.join(BENCHMARKS_FILE);
    let store = load_benchmarks(Some(dir));
    let removed = store.remove_worker(&WorkerName::new(worker));
    if removed > 0 {
        store
            .save_to_file(&path)
            .with_context(|| format!("failed to save {}", path.display()))?;
    }
    println!("Removed {removed} benchmark(s) of {worker}");
    Ok(())
}

fn print_history(
    config: &FoldwatchConfig,
    data_dir: Option<&Path>,
    worker: Option<&str>,
    limit: usize,
    format: OutputFormat,
) -> Result<()> {
    let history = load_history(data_dir, config.general.history_capacity);
    let units = match worker {
        Some(name) => history.by_worker(&WorkerName::new(name), limit),
        None => history.recent(limit),
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&units)?),
        OutputFormat::Pretty => {
            if units.is_empty() {
                println!("No completed units recorded");
            }
            for unit in &units {
                let finished = unit
                    .finished_time
                    .map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string());
                println!(
                    "{:<20} {:<22} {:<16} {:>3} frames  {}",
                    unit.worker_name.as_str(),
                    unit.identity.tag(),
                    finished,
                    unit.frames_completed,
                    unit.protein_name.as_deref().unwrap_or("-"),
                );
            }
        }
    }
    Ok(())
}
