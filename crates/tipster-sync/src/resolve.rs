use tipster_adapters::{DetailFetcher, FetchError};
use tipster_core::RaceRowId;
use tipster_storage::{AssignOutcome, EntityStore, StoreError};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveFailure {
    /// No prediction under the race carries a lookup key to drive the fetch.
    NoLookupKey,
    Fetch(FetchError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    Updated,
    Merged {
        into: RaceRowId,
        moved_predictions: u64,
    },
    Failed(ResolveFailure),
}

/// Turns a placeholder race into a canonical one, merging into an existing
/// race when the canonical id is already taken.
#[derive(Debug, Clone)]
pub struct Resolver<F> {
    store: EntityStore,
    fetcher: F,
}

impl<F: DetailFetcher> Resolver<F> {
    pub fn new(store: EntityStore, fetcher: F) -> Self {
        Self { store, fetcher }
    }

    /// Safe to repeat: a race that is already canonical, or was merged away,
    /// comes back as `Updated` without touching the store.
    pub async fn resolve(&self, race: RaceRowId) -> Result<ResolveOutcome, StoreError> {
        let Some(current) = self.store.race(race).await? else {
            debug!(%race, "race no longer exists; nothing to resolve");
            return Ok(ResolveOutcome::Updated);
        };
        if !current.is_placeholder() {
            return Ok(ResolveOutcome::Updated);
        }

        let Some(lookup_key) = self.store.lookup_key_for_race(race).await? else {
            return Ok(ResolveOutcome::Failed(ResolveFailure::NoLookupKey));
        };

        let canonical = match self.fetcher.fetch_prediction(lookup_key).await {
            Ok(id) => id,
            Err(err) => return Ok(ResolveOutcome::Failed(ResolveFailure::Fetch(err))),
        };

        Ok(match self.store.assign_canonical_id(race, &canonical).await? {
            AssignOutcome::Updated | AssignOutcome::AlreadyResolved => ResolveOutcome::Updated,
            AssignOutcome::Merged {
                into,
                moved_predictions,
            } => ResolveOutcome::Merged {
                into,
                moved_predictions,
            },
        })
    }
}
