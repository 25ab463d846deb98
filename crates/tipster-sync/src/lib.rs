//! Backlog orchestration: ingestion, identifier resolution, enrichment and
//! the paced batch scheduler that drives them.

mod config;
mod cron;
mod enrich;
mod ingest;
mod resolve;
mod scheduler;

pub use config::{PacingConfig, PacingProfile, SyncConfig};
pub use cron::{build_job_scheduler, PassRunner};
pub use enrich::{EnrichOutcome, Enricher};
pub use ingest::{ingest_file, ingest_sightings, IngestReport};
pub use resolve::{ResolveFailure, ResolveOutcome, Resolver};
pub use scheduler::{BatchReport, BatchScheduler};

pub const CRATE_NAME: &str = "tipster-sync";
