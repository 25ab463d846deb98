//! Drives the resolver and the enricher over the backlog, one unit at a time.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tipster_adapters::DetailFetcher;
use tipster_core::{RaceRowId, WorkPhase};
use tipster_storage::{EntityStore, PendingPage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::PacingConfig;
use crate::enrich::{EnrichOutcome, Enricher};
use crate::resolve::{ResolveFailure, ResolveOutcome, Resolver};

/// Cumulative counts for one pass over one backlog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub phase: WorkPhase,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attempted: u64,
    pub succeeded: u64,
    pub merged: u64,
    /// Enrichment writes that still left a sentinel in place. Also in `succeeded`.
    pub partial: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Units that crossed the quarantine threshold during this pass.
    pub quarantined: u64,
    pub cooldowns: u64,
    pub interrupted: bool,
    /// Backlog left for this phase after the pass, quarantined units included.
    pub remaining: i64,
    /// Part of `remaining` held back by quarantine, from this pass or earlier ones.
    pub quarantined_remaining: i64,
}

impl BatchReport {
    fn new(run_id: Uuid, phase: WorkPhase) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            phase,
            started_at: now,
            finished_at: now,
            attempted: 0,
            succeeded: 0,
            merged: 0,
            partial: 0,
            failed: 0,
            skipped: 0,
            quarantined: 0,
            cooldowns: 0,
            interrupted: false,
            remaining: 0,
            quarantined_remaining: 0,
        }
    }

    /// True when units that could not be completed are still pending: failures
    /// and partial writes from this pass, or quarantined units from any pass.
    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.partial > 0 || self.quarantined_remaining > 0
    }
}

enum UnitResult {
    Done,
    Merged,
    Partial,
    Skipped,
    Failed(String),
}

pub struct BatchScheduler {
    store: EntityStore,
    resolver: Resolver<Arc<dyn DetailFetcher>>,
    enricher: Enricher<Arc<dyn DetailFetcher>>,
    pacing: PacingConfig,
}

impl BatchScheduler {
    pub fn new(store: EntityStore, fetcher: Arc<dyn DetailFetcher>, pacing: PacingConfig) -> Self {
        Self {
            resolver: Resolver::new(store.clone(), fetcher.clone()),
            enricher: Enricher::new(store.clone(), fetcher),
            store,
            pacing,
        }
    }

    pub fn pacing(&self) -> &PacingConfig {
        &self.pacing
    }

    pub async fn run_resolve_pass(&self, cancel: &CancellationToken) -> Result<BatchReport> {
        self.run_pass(WorkPhase::Resolve, Uuid::new_v4(), cancel).await
    }

    pub async fn run_enrich_pass(&self, cancel: &CancellationToken) -> Result<BatchReport> {
        self.run_pass(WorkPhase::Enrich, Uuid::new_v4(), cancel).await
    }

    /// A resolve pass followed by an enrich pass under one run id. The enrich
    /// pass is skipped when the resolve pass was interrupted.
    pub async fn run_both(&self, cancel: &CancellationToken) -> Result<Vec<BatchReport>> {
        let run_id = Uuid::new_v4();
        let resolve = self.run_pass(WorkPhase::Resolve, run_id, cancel).await?;
        if resolve.interrupted {
            return Ok(vec![resolve]);
        }
        let enrich = self.run_pass(WorkPhase::Enrich, run_id, cancel).await?;
        Ok(vec![resolve, enrich])
    }

    /// Walks the backlog for `phase` until a pull comes back empty or `cancel`
    /// fires. Pages are selected by predicate above a row-id watermark, so units
    /// that fail stay pending without being retried within the same pass.
    pub async fn run_pass(
        &self,
        phase: WorkPhase,
        run_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let span = info_span!("batch_pass", %run_id, %phase);
        async {
            let mut report = BatchReport::new(run_id, phase);
            let mut watermark = RaceRowId(0);
            let mut since_cooldown = 0u32;
            info!(
                page_size = self.pacing.page_size,
                batch_size = self.pacing.batch_size,
                item_delay_ms = self.pacing.item_delay.as_millis() as u64,
                cooldown_secs = self.pacing.cooldown.as_secs(),
                "pass started"
            );

            'pass: loop {
                if cancel.is_cancelled() {
                    report.interrupted = true;
                    break;
                }

                let page = PendingPage {
                    after: watermark,
                    limit: self.pacing.page_size.max(1),
                    quarantine_after: self.pacing.quarantine_after,
                    graded_only: self.pacing.graded_only,
                };
                let units = match phase {
                    WorkPhase::Resolve => self.store.pending_resolution(&page).await,
                    WorkPhase::Enrich => self.store.pending_enrichment(&page).await,
                }
                .with_context(|| format!("pulling pending {phase} units after {watermark}"))?;

                if units.is_empty() {
                    break;
                }
                debug!(count = units.len(), after = %watermark, "pulled pending page");

                for unit in units {
                    if cancel.is_cancelled() {
                        report.interrupted = true;
                        break 'pass;
                    }
                    watermark = unit;
                    report.attempted += 1;
                    self.process(phase, unit, &mut report).await?;

                    since_cooldown += 1;
                    let pause = if self.pacing.batch_size > 0 && since_cooldown >= self.pacing.batch_size {
                        since_cooldown = 0;
                        report.cooldowns += 1;
                        info!(
                            processed = report.attempted,
                            cooldown_secs = self.pacing.cooldown.as_secs(),
                            "batch boundary reached; cooling down"
                        );
                        self.pacing.cooldown
                    } else {
                        self.pacing.item_delay
                    };
                    if !pause_unless_cancelled(pause, cancel).await {
                        report.interrupted = true;
                        break 'pass;
                    }
                }
            }

            let backlog = self
                .store
                .backlog(self.pacing.quarantine_after)
                .await
                .context("counting remaining backlog")?;
            (report.remaining, report.quarantined_remaining) = match phase {
                WorkPhase::Resolve => (backlog.placeholders, backlog.quarantined_resolve),
                WorkPhase::Enrich => (backlog.unenriched, backlog.quarantined_enrich),
            };
            report.finished_at = Utc::now();

            info!(
                attempted = report.attempted,
                succeeded = report.succeeded,
                merged = report.merged,
                partial = report.partial,
                failed = report.failed,
                skipped = report.skipped,
                quarantined = report.quarantined,
                cooldowns = report.cooldowns,
                remaining = report.remaining,
                quarantined_remaining = report.quarantined_remaining,
                interrupted = report.interrupted,
                "pass finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn process(&self, phase: WorkPhase, unit: RaceRowId, report: &mut BatchReport) -> Result<()> {
        let result = match phase {
            WorkPhase::Resolve => {
                match self
                    .resolver
                    .resolve(unit)
                    .await
                    .with_context(|| format!("resolving race {unit}"))?
                {
                    ResolveOutcome::Updated => UnitResult::Done,
                    ResolveOutcome::Merged { into, moved_predictions } => {
                        debug!(race = %unit, %into, moved_predictions, "merged");
                        UnitResult::Merged
                    }
                    ResolveOutcome::Failed(ResolveFailure::NoLookupKey) => {
                        UnitResult::Failed("no prediction with a lookup key".to_string())
                    }
                    ResolveOutcome::Failed(ResolveFailure::Fetch(err)) => UnitResult::Failed(err.to_string()),
                }
            }
            WorkPhase::Enrich => {
                match self
                    .enricher
                    .enrich(unit)
                    .await
                    .with_context(|| format!("enriching race {unit}"))?
                {
                    EnrichOutcome::Updated { partial: false } => UnitResult::Done,
                    EnrichOutcome::Updated { partial: true } => UnitResult::Partial,
                    EnrichOutcome::Skipped => UnitResult::Skipped,
                    EnrichOutcome::Failed(err) => UnitResult::Failed(err.to_string()),
                }
            }
        };

        match result {
            UnitResult::Done => report.succeeded += 1,
            UnitResult::Merged => report.merged += 1,
            UnitResult::Skipped => report.skipped += 1,
            UnitResult::Partial => {
                report.succeeded += 1;
                report.partial += 1;
                self.count_failure(phase, unit, "race still missing surface or distance", report)
                    .await?;
            }
            UnitResult::Failed(reason) => {
                report.failed += 1;
                self.count_failure(phase, unit, &reason, report).await?;
            }
        }
        Ok(())
    }

    async fn count_failure(
        &self,
        phase: WorkPhase,
        unit: RaceRowId,
        reason: &str,
        report: &mut BatchReport,
    ) -> Result<()> {
        let failures = self
            .store
            .record_failure(unit, phase)
            .await
            .with_context(|| format!("recording {phase} failure for race {unit}"))?;
        let threshold = self.pacing.quarantine_after;
        if threshold > 0 && failures == threshold {
            report.quarantined += 1;
            warn!(race = %unit, failures, reason, "unit quarantined");
        } else {
            warn!(race = %unit, failures, reason, "unit failed; left pending");
        }
        Ok(())
    }
}

/// Sleeps for `duration`; returns `false` if `cancel` fired first.
async fn pause_unless_cancelled(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
