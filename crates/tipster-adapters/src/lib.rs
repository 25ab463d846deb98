//! Detail fetcher contract plus the live, archived and retrying implementations.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tipster_core::{CanonicalRaceId, RaceAttributes};

mod archive;
pub mod extract;
mod live;
mod retry;

pub use archive::ArchiveDetailFetcher;
pub use live::{HttpDetailFetcher, UrlTemplates, DEFAULT_PREDICTION_URL, DEFAULT_RACE_URL};
pub use retry::{RetryStats, RetryingFetcher};

pub const CRATE_NAME: &str = "tipster-adapters";

/// Typed outcome of a single detail fetch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("timed out fetching {key}")]
    Timeout { key: String },
    #[error("nothing found for {key}")]
    NotFound { key: String },
    #[error("blocked fetching {key}: {detail}")]
    Blocked { key: String, detail: String },
    #[error("unparseable page for {key}: {detail}")]
    ParseFailure { key: String, detail: String },
}

impl FetchError {
    /// Timeouts and temporary blocks may succeed on another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Blocked { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::NotFound { .. } => "not_found",
            Self::Blocked { .. } => "blocked",
            Self::ParseFailure { .. } => "parse_failure",
        }
    }

    pub fn parse_failure(key: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ParseFailure {
            key: key.into(),
            detail: detail.into(),
        }
    }
}

/// One externally costly page visit per call. Implementations do not retry;
/// wrap them in [`RetryingFetcher`] for that.
#[async_trait]
pub trait DetailFetcher: Send + Sync {
    /// Visits the prediction page for `lookup_key` and returns the canonical
    /// race identifier it links to.
    async fn fetch_prediction(&self, lookup_key: i64) -> Result<CanonicalRaceId, FetchError>;

    /// Visits the race page for `race` and returns whatever attributes could
    /// be extracted with confidence.
    async fn fetch_race(&self, race: &CanonicalRaceId) -> Result<RaceAttributes, FetchError>;
}

#[async_trait]
impl<T: DetailFetcher + ?Sized> DetailFetcher for Arc<T> {
    async fn fetch_prediction(&self, lookup_key: i64) -> Result<CanonicalRaceId, FetchError> {
        (**self).fetch_prediction(lookup_key).await
    }

    async fn fetch_race(&self, race: &CanonicalRaceId) -> Result<RaceAttributes, FetchError> {
        (**self).fetch_race(race).await
    }
}

#[async_trait]
impl<T: DetailFetcher + ?Sized> DetailFetcher for Box<T> {
    async fn fetch_prediction(&self, lookup_key: i64) -> Result<CanonicalRaceId, FetchError> {
        (**self).fetch_prediction(lookup_key).await
    }

    async fn fetch_race(&self, race: &CanonicalRaceId) -> Result<RaceAttributes, FetchError> {
        (**self).fetch_race(race).await
    }
}
