//! Benchmark worker launcher.
//!
//! Trains this worker's slice of the architecture space and appends one
//! record per architecture to its result log. Re-running with the same
//! arguments resumes where the previous run stopped.
//!
//! Exit codes: 0 done, 2 configuration, 3 persistence, 4 data/training,
//! 130 cancelled, 1 anything else.

use std::fs::{self, File};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use clap::{ArgAction, Parser};
use nb_engine::{
    exit_code, open_data, CancelToken, DriverError, DriverState, MlpTrainer, RunDriver,
    RunOutcome, RunSummary, Trainer, WorkerConfig,
};
use nb_types::{Device, NbError, NbResult, SpaceId};
use tokio::signal;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "nb-worker", about = "Train one worker's slice of a NAS benchmark")]
struct Cli {
    /// JSON file holding any subset of the worker configuration.
    /// Flags given on the command line take precedence.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long = "search_space")]
    search_space: Option<SpaceId>,
    #[arg(long = "num_layers")]
    num_layers: Option<usize>,
    #[arg(long = "hidden_choice_len")]
    hidden_choice_len: Option<usize>,
    #[arg(long)]
    nfeat: Option<usize>,
    #[arg(long)]
    nfield: Option<usize>,
    #[arg(long)]
    nemb: Option<usize>,
    #[arg(long = "num_labels")]
    num_labels: Option<usize>,

    #[arg(long = "batch_size")]
    batch_size: Option<usize>,
    #[arg(long)]
    lr: Option<f64>,
    #[arg(long)]
    epoch: Option<usize>,
    #[arg(long = "iter_per_epoch")]
    iter_per_epoch: Option<usize>,
    /// `cpu`, or an accelerator such as `cuda:0`.
    #[arg(long)]
    device: Option<Device>,
    /// Log progress every N iterations.
    #[arg(long = "report_freq")]
    report_freq: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,

    /// Dataset name under `base_dir`, or `synthetic`.
    #[arg(long)]
    dataset: Option<String>,
    #[arg(long = "worker_id")]
    worker_id: Option<usize>,
    #[arg(long = "total_workers")]
    total_workers: Option<usize>,
    /// Data-loader threads. Does not change which architectures this worker owns.
    #[arg(long)]
    workers: Option<usize>,
    /// Maximum architectures to process, -1 for the whole assignment.
    #[arg(long = "total_models_per_worker", allow_hyphen_values = true)]
    total_models_per_worker: Option<i64>,

    #[arg(long = "base_dir")]
    base_dir: Option<PathBuf>,
    #[arg(long = "result_dir")]
    result_dir: Option<PathBuf>,
    #[arg(long = "log_folder")]
    log_folder: Option<String>,
    #[arg(long = "log_name")]
    log_name: Option<String>,

    /// JSON object mapping worker ids to architecture encodings.
    #[arg(long = "pre_partitioned_file")]
    pre_partitioned_file: Option<PathBuf>,
    /// Train every assigned architecture again, even if already recorded.
    #[arg(long)]
    retrain: bool,

    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    /// Defaults, then the config file, then explicit flags.
    fn into_config(self) -> NbResult<WorkerConfig> {
        let mut config = match &self.config {
            Some(path) => WorkerConfig::from_json_file(path)?,
            None => WorkerConfig::default(),
        };

        macro_rules! apply {
            ($($field:ident),* $(,)?) => {
                $(
                    if let Some(value) = self.$field {
                        config.$field = value;
                    }
                )*
            };
        }
        apply!(
            search_space,
            num_layers,
            hidden_choice_len,
            nfeat,
            nfield,
            nemb,
            num_labels,
            batch_size,
            lr,
            epoch,
            iter_per_epoch,
            device,
            report_freq,
            seed,
            dataset,
            worker_id,
            total_workers,
            workers,
            total_models_per_worker,
            base_dir,
            result_dir,
            log_folder,
            log_name,
        );
        if self.pre_partitioned_file.is_some() {
            config.pre_partitioned_file = self.pre_partitioned_file;
        }
        config.retrain |= self.retrain;

        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(config: &WorkerConfig, verbose: u8) -> std::io::Result<PathBuf> {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    fs::create_dir_all(config.log_dir())?;
    let log_path = config.log_file(chrono::Utc::now().timestamp());
    let log_file = File::create(&log_path)?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(log_file)))
        .init();
    Ok(log_path)
}

/// Cancel `cancel` on the first SIGINT or SIGTERM. Handlers are installed
/// before this returns.
fn spawn_signal_watcher(cancel: CancelToken) -> std::io::Result<JoinHandle<()>> {
    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        #[cfg(unix)]
        let received = tokio::select! {
            Ok(()) = signal::ctrl_c() => "Interrupt",
            Some(()) = terminate.recv() => "Termination signal",
            else => return,
        };
        #[cfg(not(unix))]
        let received = match signal::ctrl_c().await {
            Ok(()) => "Interrupt",
            Err(_) => return,
        };
        warn!("{received} received, stopping after the current iteration");
        cancel.cancel();
    }))
}

/// The whole worker run, on a blocking thread.
fn run_blocking(config: WorkerConfig, cancel: CancelToken) -> Result<RunSummary, DriverError> {
    let trainer = MlpTrainer::new(config.space_config()).with_cancel(cancel.clone());
    // Fail on the device before the dataset is loaded.
    trainer
        .check_device(&config.device)
        .map_err(DriverError::at_init)?;
    let data = open_data(&config)?;
    let mut driver = RunDriver::init(config, trainer, data, cancel)?;
    driver.run()
}

fn panicked(err: JoinError) -> DriverError {
    DriverError {
        stage: DriverState::Training,
        index: None,
        source: NbError::Internal(format!("worker task panicked: {err}")),
    }
}

async fn run_worker(config: WorkerConfig) -> Result<RunOutcome, DriverError> {
    let cancel = CancelToken::new();
    let watcher = spawn_signal_watcher(cancel.clone()).map_err(|e| {
        DriverError::at_init(NbError::Internal(format!("cannot install signal handlers: {e}")))
    })?;

    let worker = tokio::task::spawn_blocking(move || run_blocking(config, cancel));
    let joined = worker.await;
    watcher.abort();

    let summary = joined.map_err(panicked)??;
    info!(
        "Run summary: {}",
        serde_json::to_string(&summary).unwrap_or_else(|_| format!("{summary:?}"))
    );
    Ok(summary.outcome)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let verbose = cli.verbose;

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("nb-worker: {e}");
            return ExitCode::from(exit_code(e.kind()) as u8);
        }
    };

    let log_path = match init_tracing(&config, verbose) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("nb-worker: cannot open log file under {}: {e}", config.log_dir().display());
            return ExitCode::from(3);
        }
    };
    info!("Logging to {}", log_path.display());
    info!(
        "Configuration: {}",
        serde_json::to_string(&config).unwrap_or_else(|_| format!("{config:?}"))
    );

    match run_worker(config).await {
        Ok(RunOutcome::Done) => ExitCode::SUCCESS,
        Ok(RunOutcome::Cancelled) => {
            warn!("Worker stopped early; completed records are durable");
            ExitCode::from(130)
        }
        Err(e) => {
            error!("{} (kind: {:?})", e, e.kind());
            ExitCode::from(exit_code(e.kind()) as u8)
        }
    }
}
