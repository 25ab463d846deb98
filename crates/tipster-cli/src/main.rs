use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tipster_adapters::{ArchiveDetailFetcher, DetailFetcher, HttpDetailFetcher, RetryingFetcher};
use tipster_core::WorkPhase;
use tipster_storage::{ArtifactStore, EntityStore, PageClient};
use tipster_sync::{build_job_scheduler, ingest_file, BatchReport, BatchScheduler, PacingConfig, PassRunner, SyncConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod logging;

#[derive(Debug, Parser)]
#[command(name = "tipster")]
#[command(about = "Resolve placeholder races and enrich them from detail pages")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    /// Load scraped predictor sightings from a JSON file.
    Ingest { file: PathBuf },
    /// Resolve placeholder races to canonical ids.
    Resolve(PassArgs),
    /// Fill race attributes for canonical races.
    Enrich(PassArgs),
    /// Resolve, then enrich.
    Run(PassArgs),
    /// Run resolve and enrich on the configured cron schedule until Ctrl-C.
    Schedule(PassArgs),
    /// Show backlog and predictor counts.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Clear quarantine counters so failed races are retried.
    Requeue {
        #[arg(value_enum)]
        phase: PhaseArg,
    },
    /// List races that are fully resolved and enriched.
    Races {
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PhaseArg {
    Resolve,
    Enrich,
}

impl From<PhaseArg> for WorkPhase {
    fn from(value: PhaseArg) -> Self {
        match value {
            PhaseArg::Resolve => WorkPhase::Resolve,
            PhaseArg::Enrich => WorkPhase::Enrich,
        }
    }
}

#[derive(Debug, Args)]
struct PassArgs {
    #[arg(long)]
    page_size: Option<u32>,
    #[arg(long)]
    item_delay_secs: Option<u64>,
    /// Units between cooldowns.
    #[arg(long)]
    batch_size: Option<u32>,
    #[arg(long)]
    cooldown_secs: Option<u64>,
    /// Failures before a race is left out of the backlog; 0 never quarantines.
    #[arg(long)]
    quarantine_after: Option<u32>,
    /// Only work on races that carry a grade.
    #[arg(long)]
    grade_only: bool,
    /// Replay saved pages from this directory instead of fetching live.
    #[arg(long)]
    archive: Option<PathBuf>,
    /// Print reports as JSON on stdout.
    #[arg(long)]
    json: bool,
}

impl PassArgs {
    fn pacing(&self, base: PacingConfig) -> PacingConfig {
        let base = if self.archive.is_some() {
            PacingConfig {
                item_delay: Duration::ZERO,
                cooldown: Duration::ZERO,
                ..base
            }
        } else {
            base
        };
        PacingConfig {
            page_size: self.page_size.unwrap_or(base.page_size),
            item_delay: self.item_delay_secs.map(Duration::from_secs).unwrap_or(base.item_delay),
            batch_size: self.batch_size.unwrap_or(base.batch_size),
            cooldown: self.cooldown_secs.map(Duration::from_secs).unwrap_or(base.cooldown),
            quarantine_after: self.quarantine_after.unwrap_or(base.quarantine_after),
            graded_only: self.grade_only || base.graded_only,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    logging::LoggingConfig::from_env().init();
    let cli = Cli::parse();
    let config = SyncConfig::from_env().with_pacing_profile()?;

    let store = EntityStore::connect(&config.database_url)
        .await
        .with_context(|| format!("connecting to {}", config.database_url))?;
    store.migrate().await.context("applying migrations")?;

    match cli.command {
        Commands::Migrate => {
            println!("migrations applied to {}", config.database_url);
        }
        Commands::Ingest { file } => {
            let report = ingest_file(&store, &file).await?;
            println!(
                "ingested {} sightings: {} new predictions, {} already known",
                report.sightings, report.inserted, report.skipped
            );
        }
        Commands::Resolve(args) => return run_passes(&config, store, &args, Some(WorkPhase::Resolve)).await,
        Commands::Enrich(args) => return run_passes(&config, store, &args, Some(WorkPhase::Enrich)).await,
        Commands::Run(args) => return run_passes(&config, store, &args, None).await,
        Commands::Schedule(args) => schedule(&config, store, &args).await?,
        Commands::Status { json } => status(&store, config.pacing.quarantine_after, json).await?,
        Commands::Requeue { phase } => {
            let phase = WorkPhase::from(phase);
            let cleared = store.clear_failures(phase).await?;
            println!("requeued {cleared} races for {phase}");
        }
        Commands::Races { limit } => {
            for summary in store.completed_races(limit).await? {
                let race = summary.race;
                println!(
                    "{}\t{}\t{}\t{}\t{}m\t{}\t{} predictions",
                    race.key,
                    race.race_date.map(|d| d.to_string()).unwrap_or_default(),
                    race.venue.unwrap_or_default(),
                    race.surface,
                    race.distance_m,
                    race.grade.map(|g| g.to_string()).unwrap_or_else(|| "-".into()),
                    summary.prediction_count
                );
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn build_fetcher(config: &SyncConfig, archive: Option<&Path>) -> Result<Arc<dyn DetailFetcher>> {
    if let Some(dir) = archive {
        if !dir.is_dir() {
            bail!("archive directory {} does not exist", dir.display());
        }
        info!(dir = %dir.display(), "replaying archived pages");
        return Ok(Arc::new(ArchiveDetailFetcher::new(dir)));
    }
    let client = PageClient::new(config.http_client_config()).context("building http client")?;
    let live = HttpDetailFetcher::new(client, config.urls.clone())
        .with_captures(ArtifactStore::new(config.artifacts_dir.clone()));
    Ok(Arc::new(RetryingFetcher::new(live, config.backoff())))
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current unit");
            token.cancel();
        }
    });
    cancel
}

/// Runs one phase, or both under a shared run id when `phase` is `None`.
async fn run_passes(
    config: &SyncConfig,
    store: EntityStore,
    args: &PassArgs,
    phase: Option<WorkPhase>,
) -> Result<ExitCode> {
    let fetcher = build_fetcher(config, args.archive.as_deref())?;
    let scheduler = BatchScheduler::new(store, fetcher, args.pacing(config.pacing));
    let cancel = cancel_on_ctrl_c();

    let reports = match phase {
        Some(WorkPhase::Resolve) => vec![scheduler.run_resolve_pass(&cancel).await?],
        Some(WorkPhase::Enrich) => vec![scheduler.run_enrich_pass(&cancel).await?],
        None => scheduler.run_both(&cancel).await?,
    };

    print_reports(&reports, args.json)?;
    Ok(exit_code(&reports))
}

async fn schedule(config: &SyncConfig, store: EntityStore, args: &PassArgs) -> Result<()> {
    if !config.scheduler_enabled {
        bail!("scheduled runs are disabled; set TIPSTER_SCHEDULER_ENABLED=1");
    }
    let fetcher = build_fetcher(config, args.archive.as_deref())?;
    let runner = PassRunner::new(BatchScheduler::new(store, fetcher, args.pacing(config.pacing)));
    let cancel = CancellationToken::new();

    let mut sched = build_job_scheduler(&config.cron, runner.clone(), cancel.clone()).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.cron, "scheduler running; Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    warn!("interrupt received; stopping scheduler");
    cancel.cancel();
    sched.shutdown().await.context("stopping scheduler")?;
    runner.wait_idle().await;
    info!("scheduler stopped");
    Ok(())
}

async fn status(store: &EntityStore, quarantine_after: u32, json: bool) -> Result<()> {
    let backlog = store.backlog(quarantine_after).await?;
    let tiers = store.predictor_tier_counts().await?;
    if json {
        let body = serde_json::json!({ "backlog": backlog, "tiers": tiers });
        println!("{}", serde_json::to_string_pretty(&body).context("serializing status")?);
        return Ok(());
    }
    println!("predictors:           {}", backlog.predictors);
    println!("predictions:          {}", backlog.predictions);
    println!("races:                {}", backlog.races);
    println!("  placeholders:       {}", backlog.placeholders);
    println!("  unenriched:         {}", backlog.unenriched);
    println!("  quarantined/resolve {}", backlog.quarantined_resolve);
    println!("  quarantined/enrich  {}", backlog.quarantined_enrich);
    for (tier, count) in tiers {
        println!("reliability {:<8} {count}", tier.as_str());
    }
    Ok(())
}

fn print_reports(reports: &[BatchReport], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(reports).context("serializing reports")?);
        return Ok(());
    }
    for r in reports {
        println!(
            "{} run={} attempted={} succeeded={} merged={} partial={} failed={} skipped={} quarantined={} cooldowns={} remaining={}{}",
            r.phase,
            r.run_id,
            r.attempted,
            r.succeeded,
            r.merged,
            r.partial,
            r.failed,
            r.skipped,
            r.quarantined,
            r.cooldowns,
            r.remaining,
            if r.interrupted { " (interrupted)" } else { "" }
        );
    }
    Ok(())
}

/// 2 when failed, partially enriched or quarantined units are still pending,
/// 130 when stopped early.
fn exit_code(reports: &[BatchReport]) -> ExitCode {
    if reports.iter().any(BatchReport::has_failures) {
        ExitCode::from(2)
    } else if reports.iter().any(|r| r.interrupted) {
        ExitCode::from(130)
    } else {
        ExitCode::SUCCESS
    }
}
