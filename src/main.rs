use anyhow::{Context, Result};
use clap::Parser;
use shardlease::config::{
    CoordinatorBackend, CoordinatorConfig, DocumentStoreSettings, PostgresSettings,
    build_coordinator,
};
use shardlease::driver::{DocumentsRunner, MigrationSettings};
use shardlease::pipeline::{HttpBulkSink, LocalSnapshotDirectory};
use shardlease::preparer::{ShardPrepRetryPolicy, ShardWorkPreparer};
use shardlease::watchdog::LeaseExpirationWatchdog;
use shardlease::worker::{EXIT_FATAL, EXIT_LEASE_EXPIRED, WorkerOutcome, exit_code_for_error, run_worker};
use shardlease::{Clock, CoordinationError, SystemClock};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "shardlease")]
#[command(about = "Migrates one snapshot shard per run, coordinating with other workers through leases")]
struct Args {
    /// document-store | postgres
    #[arg(long, default_value = "document-store")]
    backend: CoordinatorBackend,

    /// Coordination store endpoint (cluster url or postgres:// url)
    #[arg(long)]
    coordinator_url: String,

    #[arg(long)]
    coordinator_username: Option<String>,

    #[arg(long)]
    coordinator_password: Option<String>,

    /// Suffix of the working-state index (document store only)
    #[arg(long, default_value = "")]
    index_suffix: String,

    /// Work item table (postgres only)
    #[arg(long, default_value = "work_items")]
    postgres_table: String,

    /// Defaults to a random id
    #[arg(long)]
    worker_id: Option<String>,

    #[arg(long)]
    snapshot_name: String,

    /// Directory holding exported snapshots
    #[arg(long)]
    snapshot_dir: PathBuf,

    #[arg(long)]
    target_url: String,

    #[arg(long)]
    target_username: Option<String>,

    #[arg(long)]
    target_password: Option<String>,

    /// Comma separated; empty migrates every non-system index
    #[arg(long, value_delimiter = ',')]
    index_allowlist: Vec<String>,

    #[arg(long, default_value_t = 600)]
    initial_lease_duration_secs: u64,

    #[arg(long, default_value_t = shardlease::driver::DEFAULT_MAX_SHARD_SIZE_BYTES)]
    max_shard_size_bytes: u64,

    #[arg(long)]
    max_docs_per_batch: Option<usize>,

    #[arg(long, default_value_t = shardlease::driver::DEFAULT_MAX_BYTES_PER_BATCH)]
    max_bytes_per_batch: usize,

    /// Hand the rest of a shard to a successor this long before the lease ends
    #[arg(long)]
    checkpoint_lead_secs: Option<u64>,

    #[arg(long, default_value_t = 5)]
    tolerable_clock_skew_secs: u64,

    #[arg(long, default_value_t = 30)]
    request_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    match run(args).await {
        Ok(outcome) => {
            info!(outcome = ?outcome, "Worker finished");
            ExitCode::from(outcome.exit_code() as u8)
        }
        Err(err) => {
            let code = err
                .downcast_ref::<CoordinationError>()
                .map(exit_code_for_error)
                .unwrap_or(EXIT_FATAL);
            error!(error = %format!("{:#}", err), exit_code = code, "Worker failed");
            ExitCode::from(code as u8)
        }
    }
}

async fn run(args: Args) -> Result<WorkerOutcome> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let config = coordinator_config(&args);
    let coordinator = build_coordinator(&config, clock.clone())
        .await
        .context("failed to build work coordinator")?;

    // A worker past its lease must not keep writing; the supervisor restarts it.
    let watchdog = LeaseExpirationWatchdog::new(clock, |work_item_id: &str| {
        error!(work_item_id = %work_item_id, "Terminating worker after lease expiry");
        std::process::exit(EXIT_LEASE_EXPIRED);
    });

    let mut settings = MigrationSettings::new(&args.snapshot_name)
        .initial_lease_duration(Duration::from_secs(args.initial_lease_duration_secs))
        .max_shard_size_bytes(args.max_shard_size_bytes)
        .max_bytes_per_batch(args.max_bytes_per_batch);
    if let Some(max_docs) = args.max_docs_per_batch {
        settings = settings.max_docs_per_batch(max_docs);
    }
    if let Some(lead) = args.checkpoint_lead_secs {
        settings = settings.checkpoint_lead_time(Duration::from_secs(lead));
    }
    settings.validate().context("invalid migration settings")?;

    let snapshot = Arc::new(LocalSnapshotDirectory::new(&args.snapshot_dir));
    let mut sink = HttpBulkSink::new(
        &args.target_url,
        Duration::from_secs(args.request_timeout_secs),
        3,
    )
    .context("failed to build bulk client")?;
    if let Some(username) = &args.target_username {
        sink = sink.credentials(username, args.target_password.as_deref().unwrap_or_default());
    }

    let runner = DocumentsRunner::with_watchdog(
        coordinator,
        watchdog,
        config.tolerable_clock_skew,
        snapshot.clone(),
        snapshot.clone(),
        Arc::new(sink),
        settings,
    );
    let mut preparer = ShardWorkPreparer::new(snapshot, &args.snapshot_name, args.index_allowlist);

    info!(
        worker_id = %config.worker_id,
        snapshot = %args.snapshot_name,
        "Starting worker"
    );
    Ok(run_worker(&runner, &mut preparer, ShardPrepRetryPolicy::default()).await?)
}

fn coordinator_config(args: &Args) -> CoordinatorConfig {
    let config = match args.backend {
        CoordinatorBackend::DocumentStore => {
            let mut settings = DocumentStoreSettings::new(&args.coordinator_url)
                .index_suffix(&args.index_suffix)
                .request_timeout(Duration::from_secs(args.request_timeout_secs));
            if let Some(username) = &args.coordinator_username {
                settings = settings.credentials(
                    username,
                    args.coordinator_password.as_deref().unwrap_or_default(),
                );
            }
            CoordinatorConfig::document_store(settings)
        }
        CoordinatorBackend::Postgres => CoordinatorConfig::postgres(
            PostgresSettings::new(&args.coordinator_url).table_name(&args.postgres_table),
        ),
    };

    let config = config.tolerable_clock_skew(Duration::from_secs(args.tolerable_clock_skew_secs));
    match &args.worker_id {
        Some(worker_id) => config.worker_id(worker_id),
        None => config,
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("shardlease=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
