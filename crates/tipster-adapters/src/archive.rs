use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tipster_core::{CanonicalRaceId, RaceAttributes};
use tracing::debug;

use crate::extract::{parse_prediction_page, parse_race_page};
use crate::{DetailFetcher, FetchError};

/// Replays previously saved pages from a directory laid out as
/// `prediction_{lookup_key}.html` and `race_{race_id}.html`.
#[derive(Debug, Clone)]
pub struct ArchiveDetailFetcher {
    root: PathBuf,
}

impl ArchiveDetailFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn prediction_path(&self, lookup_key: i64) -> PathBuf {
        self.root.join(format!("prediction_{lookup_key}.html"))
    }

    pub fn race_path(&self, race: &CanonicalRaceId) -> PathBuf {
        self.root.join(format!("race_{race}.html"))
    }

    async fn read(&self, key: &str, path: &Path) -> Result<String, FetchError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                debug!(path = %path.display(), bytes = bytes.len(), "archived page loaded");
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Err(FetchError::NotFound {
                key: key.to_string(),
            }),
            Err(err) => Err(FetchError::parse_failure(
                key,
                format!("reading {}: {err}", path.display()),
            )),
        }
    }
}

#[async_trait]
impl DetailFetcher for ArchiveDetailFetcher {
    async fn fetch_prediction(&self, lookup_key: i64) -> Result<CanonicalRaceId, FetchError> {
        let key = lookup_key.to_string();
        let html = self.read(&key, &self.prediction_path(lookup_key)).await?;
        parse_prediction_page(&html).map_err(|err| FetchError::parse_failure(key, err.to_string()))
    }

    async fn fetch_race(&self, race: &CanonicalRaceId) -> Result<RaceAttributes, FetchError> {
        let html = self.read(race.as_str(), &self.race_path(race)).await?;
        let attrs = parse_race_page(&html)
            .map_err(|err| FetchError::parse_failure(race.as_str(), err.to_string()))?;
        if attrs.is_empty() {
            return Err(FetchError::parse_failure(race.as_str(), "no race attributes on page"));
        }
        Ok(attrs)
    }
}
