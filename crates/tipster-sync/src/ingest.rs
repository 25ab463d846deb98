use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tipster_core::PredictorSighting;
use tipster_storage::EntityStore;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IngestReport {
    pub sightings: u64,
    pub inserted: u64,
    pub skipped: u64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SightingFile {
    Many(Vec<PredictorSighting>),
    One(PredictorSighting),
}

/// Loads a JSON file holding one sighting or an array of them and records
/// each in its own transaction.
pub async fn ingest_file(store: &EntityStore, path: &Path) -> Result<IngestReport> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let sightings = match serde_json::from_str::<SightingFile>(&text)
        .with_context(|| format!("parsing {}", path.display()))?
    {
        SightingFile::Many(all) => all,
        SightingFile::One(one) => vec![one],
    };
    ingest_sightings(store, &sightings).await
}

pub async fn ingest_sightings(store: &EntityStore, sightings: &[PredictorSighting]) -> Result<IngestReport> {
    let mut report = IngestReport::default();
    for sighting in sightings {
        let summary = store
            .ingest_sighting(sighting)
            .await
            .with_context(|| format!("ingesting predictor {}", sighting.external_key))?;
        report.sightings += 1;
        report.inserted += summary.inserted;
        report.skipped += summary.skipped;
    }
    info!(
        sightings = report.sightings,
        inserted = report.inserted,
        skipped = report.skipped,
        "ingest complete"
    );
    Ok(report)
}
