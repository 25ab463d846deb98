#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tipster_adapters::{DetailFetcher, FetchError};
use tipster_core::{
    CanonicalRaceId, Grade, Outcome, PredictionId, PredictorId, RaceAttributes, RaceKey, RaceRowId, Surface,
};
use tipster_storage::{EntityStore, NewPrediction};
use tokio_util::sync::CancellationToken;

/// In-memory detail source. Unknown keys come back as `NotFound`.
#[derive(Default)]
pub struct ScriptedFetcher {
    predictions: Mutex<HashMap<i64, Result<CanonicalRaceId, FetchError>>>,
    races: Mutex<HashMap<String, Result<RaceAttributes, FetchError>>>,
    calls: AtomicU64,
    cancel_on_call: Mutex<Option<CancellationToken>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prediction(self, lookup_key: i64, race: &str) -> Self {
        self.predictions
            .lock()
            .unwrap()
            .insert(lookup_key, Ok(CanonicalRaceId::parse(race).unwrap()));
        self
    }

    pub fn prediction_error(self, lookup_key: i64, err: FetchError) -> Self {
        self.predictions.lock().unwrap().insert(lookup_key, Err(err));
        self
    }

    pub fn race(self, race: &str, attrs: RaceAttributes) -> Self {
        self.races.lock().unwrap().insert(race.to_string(), Ok(attrs));
        self
    }

    pub fn race_error(self, race: &str, err: FetchError) -> Self {
        self.races.lock().unwrap().insert(race.to_string(), Err(err));
        self
    }

    /// Cancels `token` the first time any page is fetched.
    pub fn cancelling(self, token: CancellationToken) -> Self {
        *self.cancel_on_call.lock().unwrap() = Some(token);
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = self.cancel_on_call.lock().unwrap().as_ref() {
            token.cancel();
        }
    }
}

#[async_trait]
impl DetailFetcher for ScriptedFetcher {
    async fn fetch_prediction(&self, lookup_key: i64) -> Result<CanonicalRaceId, FetchError> {
        self.touch();
        self.predictions
            .lock()
            .unwrap()
            .get(&lookup_key)
            .cloned()
            .unwrap_or(Err(FetchError::NotFound {
                key: lookup_key.to_string(),
            }))
    }

    async fn fetch_race(&self, race: &CanonicalRaceId) -> Result<RaceAttributes, FetchError> {
        self.touch();
        self.races
            .lock()
            .unwrap()
            .get(race.as_str())
            .cloned()
            .unwrap_or(Err(FetchError::NotFound {
                key: race.to_string(),
            }))
    }
}

pub fn full_attributes() -> RaceAttributes {
    RaceAttributes {
        name: Some("アルゼンチン共和国杯".into()),
        venue: Some("東京".into()),
        surface: Some(Surface::Turf),
        distance_m: Some(2500),
        grade: Some(Grade::G2),
        field_size: Some(18),
        track_condition: Some("良".into()),
        ..Default::default()
    }
}

pub fn parse_failure(key: &str) -> FetchError {
    FetchError::parse_failure(key, "page links to no race")
}

pub async fn store() -> EntityStore {
    EntityStore::open_in_memory().await.unwrap()
}

pub async fn race(store: &EntityStore, key: &str) -> RaceRowId {
    store
        .insert_race(&RaceKey::parse(key).unwrap(), "アルゼンチン共和国杯", None)
        .await
        .unwrap()
}

pub async fn prediction(
    store: &EntityStore,
    predictor: PredictorId,
    race: RaceRowId,
    lookup_key: Option<i64>,
) -> PredictionId {
    let new = NewPrediction {
        lookup_key,
        outcome: Outcome::Unknown,
        payout: None,
        roi: None,
    };
    store.insert_prediction(predictor, race, &new).await.unwrap()
}
