mod artifact;
mod config;
mod engine;
mod market;
mod queue;
mod research;
mod shutdown;
mod storage;

use anyhow::{bail, Context};
use chrono::Local;
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::artifact::ArtifactStore;
use crate::config::{RuntimeSettings, WorkerConfig};
use crate::engine::{ExecutionEngine, ProcessEngine};
use crate::market::{BinanceHistory, MarketDataCache};
use crate::queue::{JobQueue, MemoryQueue, SqsJobQueue};
use crate::research::{Disposition, ResearchService, ResearchWorker, ServiceOptions, WorkerOptions};
use crate::storage::RunStore;

#[derive(Parser)]
#[command(name = "research-worker", version, about = "Queue-driven research job worker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Consume jobs from SQS until SIGTERM/SIGINT (default).
    Worker,
    /// Process a single job file against a local directory used as the artifact store.
    RunLocal {
        /// Job message body (JSON).
        #[arg(long)]
        job: PathBuf,
        /// Artifact root; `manifestKey` is resolved inside it and outputs land under it.
        #[arg(long)]
        out: PathBuf,
        /// Run store URL, e.g. `sqlite://runs.db?mode=rwc`. Falls back to DATABASE_URL.
        #[arg(long)]
        database: Option<String>,
    },
}

fn init_logging() -> std::io::Result<()> {
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(log::LevelFilter::Warn)
        .filter_module("research_worker", log::LevelFilter::Info)
        .filter_module("sqlx", log::LevelFilter::Error)
        .filter_module("sea_orm", log::LevelFilter::Error);
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }

    if let Some(dir) = std::env::var_os("WORKER_LOG_DIR").filter(|d| !d.is_empty()) {
        let dir = PathBuf::from(dir);
        std::fs::create_dir_all(&dir)?;
        let ts = Local::now().format("%Y%m%d-%H%M%S").to_string();
        let log_file = std::fs::File::create(dir.join(format!("worker-{}.log", ts)))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }

    builder.init();
    Ok(())
}

fn build_engine(
    rt: &RuntimeSettings,
    store: Option<ArtifactStore>,
) -> anyhow::Result<Arc<dyn ExecutionEngine>> {
    let history = BinanceHistory::new(&rt.history_base_url)?;
    let market = MarketDataCache::new(rt.market_cache_dir.clone(), store, Arc::new(history));
    let engine = ProcessEngine::new(rt.engine_bin.clone())
        .with_args(rt.engine_args.clone())
        .with_market_data(Arc::new(market));
    Ok(Arc::new(engine))
}

fn service_options(rt: &RuntimeSettings) -> ServiceOptions {
    ServiceOptions {
        backoff_floor: Duration::from_secs(1),
        backoff_cap: rt.backoff_max,
        idle_log_every: rt.idle_log_every,
        failure_pause: rt.failure_pause,
    }
}

fn worker_options(rt: &RuntimeSettings) -> WorkerOptions {
    WorkerOptions {
        workdir_root: rt.workdir.clone(),
        lease: rt.visibility,
        child_estimate: rt.child_estimate,
    }
}

async fn run_worker() -> anyhow::Result<()> {
    let cfg = WorkerConfig::from_env().context("worker configuration")?;
    let rt = &cfg.runtime;

    let artifacts = ArtifactStore::s3(&cfg.bucket, &cfg.region)?;
    let runs = RunStore::connect(rt.database_url.as_deref()).await;
    let engine = build_engine(rt, Some(artifacts.clone()))?;
    let worker = Arc::new(ResearchWorker::new(artifacts, runs, engine, worker_options(rt)));

    let queue: Arc<dyn JobQueue> = Arc::new(
        SqsJobQueue::connect(&cfg.queue_url, &cfg.region, rt.queue_wait, rt.visibility).await,
    );

    let (trigger, shutdown) = shutdown::channel();
    shutdown::install_signal_handler(trigger);

    info!(
        "🚀 research worker up: bucket={} workdir={} engine={}",
        cfg.bucket,
        rt.workdir.display(),
        rt.engine_bin
    );
    let stats = ResearchService::new(queue, worker, service_options(rt))
        .run(shutdown)
        .await;
    info!("research worker exiting ({:?})", stats);
    Ok(())
}

async fn run_local(job: PathBuf, out: PathBuf, database: Option<String>) -> anyhow::Result<()> {
    let rt = RuntimeSettings::from_env().context("runtime configuration")?;
    let body = std::fs::read_to_string(&job)
        .with_context(|| format!("reading job file {}", job.display()))?;

    let artifacts = ArtifactStore::local(&out)?;
    let runs = RunStore::connect(database.as_deref().or(rt.database_url.as_deref())).await;
    let engine = build_engine(&rt, Some(artifacts.clone()))?;
    let worker = Arc::new(ResearchWorker::new(artifacts, runs, engine, worker_options(&rt)));

    let queue = Arc::new(MemoryQueue::new(Duration::ZERO, rt.visibility));
    queue.push(body);
    let service = ResearchService::new(queue, worker, service_options(&rt));

    match service.poll_once().await? {
        Some(Disposition::Acknowledge) => {
            info!("✓ job processed; outputs under {}", out.display());
            Ok(())
        }
        Some(Disposition::Release) => bail!("job failed; see log for details"),
        None => bail!("job file produced no message"),
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_logging()?;

    match Cli::parse().command.unwrap_or(Command::Worker) {
        Command::Worker => run_worker().await,
        Command::RunLocal { job, out, database } => run_local(job, out, database).await,
    }
}
