use tipster_adapters::{DetailFetcher, FetchError};
use tipster_core::RaceRowId;
use tipster_storage::{EntityStore, StoreError};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrichOutcome {
    /// Attributes were written. `partial` means the race is still missing a
    /// surface or a distance afterwards.
    Updated { partial: bool },
    Skipped,
    Failed(FetchError),
}

/// Fills descriptive attributes of canonical races from their race page.
#[derive(Debug, Clone)]
pub struct Enricher<F> {
    store: EntityStore,
    fetcher: F,
}

impl<F: DetailFetcher> Enricher<F> {
    pub fn new(store: EntityStore, fetcher: F) -> Self {
        Self { store, fetcher }
    }

    pub async fn enrich(&self, race: RaceRowId) -> Result<EnrichOutcome, StoreError> {
        let Some(current) = self.store.race(race).await? else {
            return Ok(EnrichOutcome::Skipped);
        };
        if current.is_enriched() {
            return Ok(EnrichOutcome::Skipped);
        }
        let Some(canonical) = current.key.canonical() else {
            return Ok(EnrichOutcome::Skipped);
        };

        let attrs = match self.fetcher.fetch_race(canonical).await {
            Ok(attrs) => attrs,
            Err(err) => return Ok(EnrichOutcome::Failed(err)),
        };
        if attrs.is_empty() {
            return Ok(EnrichOutcome::Failed(FetchError::parse_failure(
                canonical.as_str(),
                "no usable race attributes",
            )));
        }

        match self.store.apply_race_attributes(race, &attrs).await? {
            Some(stored) => {
                let partial = !stored.is_enriched();
                debug!(%race, partial, "race attributes written");
                Ok(EnrichOutcome::Updated { partial })
            }
            None => Ok(EnrichOutcome::Skipped),
        }
    }
}
