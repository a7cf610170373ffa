//! CLI command definitions and drivers.
//!
//! Four subcommands: `backfill` walks an hour range through the ingestion
//! pipeline, `hallmonitor` runs the metadata refresh pool, `bouncer` runs
//! the consent verification worker, and `migrate` applies schema to both
//! stores. Invalid flags exit with code 2 (clap's parse-error code); any
//! failed work exits 1.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use crate::archive::{ArchiveCache, HttpHourFetcher, RetentionPolicy};
use crate::backfill::BackfillRunner;
use crate::cancel::Scope;
use crate::clock::SystemClock;
use crate::config::Config;
use crate::consent::verify::{VerifyConfig, VerifyWorker};
use crate::consent::ConsentStore;
use crate::detect::{Detector, Rulepack};
use crate::github::GithubClient;
use crate::hallmonitor::{CatalogQueue, HallmonitorPool};
use crate::hour::HourKey;
use crate::storage::{CatalogStore, Database, FactsStore, HourStore, SubjectKind};

/// Archive profanity mining pipeline.
#[derive(Parser)]
#[command(name = "saltmine")]
#[command(about = "Mine the GitHub event archive for profanity/anger utterances")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Backfill an inclusive UTC hour range through the ingestion pipeline.
    Backfill(BackfillArgs),

    /// Run the repo/actor metadata refresh worker pool.
    Hallmonitor(HallmonitorArgs),

    /// Run the consent verification worker.
    Bouncer(BouncerArgs),

    /// Apply control-plane and facts-store schema.
    Migrate,
}

/// Arguments for the backfill command.
#[derive(Parser, Debug)]
pub struct BackfillArgs {
    /// First hour to process, UTC, e.g. 2015-01-02T03.
    #[arg(long)]
    pub start: HourKey,

    /// Last hour to process, inclusive.
    #[arg(long)]
    pub end: HourKey,

    /// Run the detector and write hits (overrides CORE_BACKFILL_DETECT).
    #[arg(long)]
    pub detect: bool,

    /// Detector version stamp (overrides CORE_DETECT_VERSION).
    #[arg(long)]
    pub detver: Option<i32>,

    /// Load the rulepack from a file instead of the bundled pack.
    #[arg(long)]
    pub rulepack: Option<PathBuf>,
}

/// Arguments for the hallmonitor command.
#[derive(Parser, Debug)]
pub struct HallmonitorArgs {
    /// Worker count (overrides CORE_HALLMONITOR_WORKERS).
    #[arg(long)]
    pub workers: Option<usize>,
}

/// Arguments for the bouncer command.
#[derive(Parser, Debug)]
pub struct BouncerArgs {
    /// Exit after one lease round instead of looping.
    #[arg(long)]
    pub once: bool,
}

/// Installs the global tracing subscriber. `RUST_LOG`, when set, overrides
/// the `--log-level` flag.
pub fn init_tracing(flag_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(flag_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Run the parsed command.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Backfill(args) => run_backfill(args).await,
        Commands::Hallmonitor(args) => run_hallmonitor(args).await,
        Commands::Bouncer(args) => run_bouncer(args).await,
        Commands::Migrate => run_migrate().await,
    }
}

/// Root scope whose token flips on Ctrl-C.
fn signal_scope() -> Scope {
    let scope = Scope::root();
    let token = scope.token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            token.cancel();
        }
    });
    scope
}

async fn run_migrate() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let scope = signal_scope();

    let db = Database::connect(&config.pg).await?;
    db.run_migrations().await?;
    info!("control plane ready");

    let facts = FactsStore::new(&config.clickhouse);
    facts.ensure_schema(&scope).await?;
    info!("facts-store schema applied");
    Ok(())
}

async fn run_backfill(args: BackfillArgs) -> anyhow::Result<()> {
    let mut config = Config::from_env()?;
    if args.detect {
        config.backfill.detect = true;
    }
    if let Some(detver) = args.detver {
        config.backfill.detect_version = detver;
    }
    if args.start > args.end {
        anyhow::bail!("--start {} is after --end {}", args.start, args.end);
    }

    let scope = signal_scope();
    let db = Database::connect(&config.pg).await?;
    db.run_migrations().await?;
    let facts = FactsStore::new(&config.clickhouse);
    facts.ensure_schema(&scope).await?;

    let cache = Arc::new(ArchiveCache::new(
        &config.archive.cache_dir,
        Arc::new(HttpHourFetcher::new(config.github.user_agent.clone())),
        Arc::new(SystemClock),
        config.archive.refresh_recent,
        RetentionPolicy {
            max_age: config.archive.retain_max_age,
            max_bytes: config.archive.retain_max_bytes,
        },
    )?);

    let detector = if config.backfill.detect {
        let pack = match &args.rulepack {
            Some(path) => Rulepack::from_path(path)?,
            None => Rulepack::bundled()?,
        };
        info!(
            pack_version = pack.version,
            detector_version = config.backfill.detect_version,
            "detection enabled"
        );
        Some(Arc::new(Detector::new(
            Arc::new(pack),
            config.backfill.detect_version,
        )))
    } else {
        None
    };

    let runner = BackfillRunner::new(
        cache,
        HourStore::new(db.clone()),
        facts,
        ConsentStore::new(db.clone()),
        CatalogStore::new(db.clone()),
        Arc::new(CatalogQueue::new(db.clone(), SubjectKind::Repo)),
        Arc::new(CatalogQueue::new(db.clone(), SubjectKind::Actor)),
        detector,
        config.backfill.clone(),
    );

    info!(start = %args.start, end = %args.end, "backfill starting");
    let summary = runner.run_range(args.start, args.end, &scope).await;
    info!(
        hours_ok = summary.hours_ok,
        hours_error = summary.hours_error,
        utterances = summary.utterances,
        hits = summary.hits,
        "backfill finished"
    );

    if summary.hours_error > 0 {
        anyhow::bail!("{} hour(s) finished in error", summary.hours_error);
    }
    Ok(())
}

async fn run_hallmonitor(args: HallmonitorArgs) -> anyhow::Result<()> {
    let mut config = Config::from_env()?;
    if let Some(workers) = args.workers {
        config.hallmonitor.num_workers = workers.max(1);
    }

    let scope = signal_scope();
    let db = Database::connect(&config.pg).await?;
    db.run_migrations().await?;

    let pool = Arc::new(HallmonitorPool::new(
        CatalogQueue::new(db.clone(), SubjectKind::Repo),
        CatalogQueue::new(db.clone(), SubjectKind::Actor),
        CatalogStore::new(db.clone()),
        ConsentStore::new(db.clone()),
        GithubClient::new(&config.github),
        config.hallmonitor.clone(),
    ));
    let stats = pool.run(scope).await;

    if stats.jobs_failed > 0 {
        warn!(failed = stats.jobs_failed, "pool finished with failed jobs");
    }
    Ok(())
}

async fn run_bouncer(args: BouncerArgs) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let scope = signal_scope();
    let db = Database::connect(&config.pg).await?;
    db.run_migrations().await?;

    let worker = VerifyWorker::new(
        db,
        GithubClient::new(&config.github),
        VerifyConfig::default(),
    );

    loop {
        let handled = worker.run_once(&scope).await?;
        if args.once {
            info!(handled, "verification round complete");
            return Ok(());
        }
        if scope.is_cancelled() {
            return Ok(());
        }
        if handled == 0 && !scope.sleep(config.hallmonitor.idle_sleep).await {
            return Ok(());
        }
    }
}
