use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::scheduler::{BatchReport, BatchScheduler};

/// Serializes passes so a scheduled run never overlaps a running one.
#[derive(Clone)]
pub struct PassRunner {
    scheduler: Arc<BatchScheduler>,
    lock: Arc<Mutex<()>>,
}

impl PassRunner {
    pub fn new(scheduler: BatchScheduler) -> Self {
        Self {
            scheduler: Arc::new(scheduler),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn scheduler(&self) -> &BatchScheduler {
        &self.scheduler
    }

    /// Waits for any pass in flight, then runs resolve followed by enrich.
    pub async fn run_both(&self, cancel: &CancellationToken) -> Result<Vec<BatchReport>> {
        let _guard = self.lock.lock().await;
        self.scheduler.run_both(cancel).await
    }

    /// Returns once no pass is in flight.
    pub async fn wait_idle(&self) {
        let _guard = self.lock.lock().await;
    }
}

/// Builds a cron job that runs both passes on `cron` (six fields, seconds first).
pub async fn build_job_scheduler(
    cron: &str,
    runner: PassRunner,
    cancel: CancellationToken,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let runner = runner.clone();
        let cancel = cancel.clone();
        Box::pin(async move {
            if cancel.is_cancelled() {
                warn!("scheduled run skipped; shutdown in progress");
                return;
            }
            info!("scheduled run triggered");
            match runner.run_both(&cancel).await {
                Ok(reports) => {
                    for report in reports {
                        info!(
                            phase = %report.phase,
                            succeeded = report.succeeded,
                            merged = report.merged,
                            failed = report.failed,
                            remaining = report.remaining,
                            "scheduled pass complete"
                        );
                    }
                }
                Err(err) => error!(error = format!("{err:#}"), "scheduled run aborted"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
