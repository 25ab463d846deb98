use async_trait::async_trait;
use chrono::Utc;
use tipster_core::{CanonicalRaceId, RaceAttributes};
use tipster_storage::{ArtifactStore, FetchedPage, HttpError, PageClient, RetryDisposition};
use tracing::{debug, info_span, warn, Instrument};

use crate::extract::{parse_prediction_page, parse_race_page};
use crate::{DetailFetcher, FetchError};

pub const DEFAULT_PREDICTION_URL: &str = "https://yoso.netkeiba.com/?pid=yoso_detail&id={key}";
pub const DEFAULT_RACE_URL: &str = "https://race.netkeiba.com/race/result.html?race_id={key}";

/// Page URL patterns; `{key}` is replaced by the lookup key or race id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplates {
    pub prediction: String,
    pub race: String,
}

impl Default for UrlTemplates {
    fn default() -> Self {
        Self {
            prediction: DEFAULT_PREDICTION_URL.to_string(),
            race: DEFAULT_RACE_URL.to_string(),
        }
    }
}

impl UrlTemplates {
    pub fn prediction_url(&self, lookup_key: i64) -> String {
        self.prediction.replace("{key}", &lookup_key.to_string())
    }

    pub fn race_url(&self, race: &CanonicalRaceId) -> String {
        self.race.replace("{key}", race.as_str())
    }
}

/// Fetches detail pages over HTTP, one request per call. Pages that fail to
/// parse are captured to the artifact store when one is configured.
#[derive(Debug, Clone)]
pub struct HttpDetailFetcher {
    client: PageClient,
    urls: UrlTemplates,
    captures: Option<ArtifactStore>,
}

impl HttpDetailFetcher {
    pub fn new(client: PageClient, urls: UrlTemplates) -> Self {
        Self {
            client,
            urls,
            captures: None,
        }
    }

    pub fn with_captures(mut self, store: ArtifactStore) -> Self {
        self.captures = Some(store);
        self
    }

    async fn get(&self, key: &str, url: &str) -> Result<FetchedPage, FetchError> {
        self.client
            .get(url)
            .await
            .map_err(|err| fetch_error(key, err))
    }

    async fn capture(&self, page_kind: &str, key: &str, page: &FetchedPage) {
        let Some(store) = &self.captures else {
            return;
        };
        match store
            .store_page(page_kind, key, Utc::now(), "html", &page.body)
            .await
        {
            Ok(stored) => warn!(
                page_kind,
                key,
                path = %stored.absolute_path.display(),
                deduplicated = stored.deduplicated,
                "captured unparseable page"
            ),
            Err(err) => warn!(page_kind, key, error = %err, "failed to capture unparseable page"),
        }
    }
}

#[async_trait]
impl DetailFetcher for HttpDetailFetcher {
    async fn fetch_prediction(&self, lookup_key: i64) -> Result<CanonicalRaceId, FetchError> {
        let key = lookup_key.to_string();
        let url = self.urls.prediction_url(lookup_key);
        async {
            let page = self.get(&key, &url).await?;
            match parse_prediction_page(&page.text()) {
                Ok(id) => {
                    debug!(race_id = %id, "prediction page resolved");
                    Ok(id)
                }
                Err(err) => {
                    self.capture("prediction", &key, &page).await;
                    Err(FetchError::parse_failure(key.as_str(), err.to_string()))
                }
            }
        }
        .instrument(info_span!("detail_fetch", kind = "prediction", key = %lookup_key))
        .await
    }

    async fn fetch_race(&self, race: &CanonicalRaceId) -> Result<RaceAttributes, FetchError> {
        let key = race.as_str();
        let url = self.urls.race_url(race);
        async {
            let page = self.get(key, &url).await?;
            let parsed = parse_race_page(&page.text())
                .map_err(|err| err.to_string())
                .and_then(|attrs| {
                    if attrs.is_empty() {
                        Err("no race attributes on page".to_string())
                    } else {
                        Ok(attrs)
                    }
                });
            match parsed {
                Ok(attrs) => Ok(attrs),
                Err(detail) => {
                    self.capture("race", key, &page).await;
                    Err(FetchError::parse_failure(key, detail))
                }
            }
        }
        .instrument(info_span!("detail_fetch", kind = "race", key))
        .await
    }
}

/// Missing pages are terminal; statuses the server may stop returning are blocks.
fn fetch_error(key: &str, err: HttpError) -> FetchError {
    let key = key.to_string();
    match err {
        HttpError::Timeout { .. } | HttpError::Transport { .. } => FetchError::Timeout { key },
        HttpError::Status {
            status: 404 | 410, ..
        } => FetchError::NotFound { key },
        err => match err.disposition() {
            RetryDisposition::Retryable => FetchError::Blocked {
                key,
                detail: err.to_string(),
            },
            RetryDisposition::NonRetryable => FetchError::NotFound { key },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_substitute_keys() {
        let urls = UrlTemplates::default();
        assert_eq!(
            urls.prediction_url(5528852),
            "https://yoso.netkeiba.com/?pid=yoso_detail&id=5528852"
        );
        let race = CanonicalRaceId::parse("202505050211").unwrap();
        assert_eq!(
            urls.race_url(&race),
            "https://race.netkeiba.com/race/result.html?race_id=202505050211"
        );
    }

    #[test]
    fn http_errors_map_onto_fetch_taxonomy() {
        let status = |status| HttpError::Status {
            status,
            url: "https://example.test".into(),
        };
        assert_eq!(fetch_error("k", status(404)), FetchError::NotFound { key: "k".into() });
        assert_eq!(fetch_error("k", status(400)), FetchError::NotFound { key: "k".into() });
        assert!(matches!(fetch_error("k", status(429)), FetchError::Blocked { .. }));
        assert!(matches!(fetch_error("k", status(403)), FetchError::Blocked { .. }));
        assert!(matches!(fetch_error("k", status(503)), FetchError::Blocked { .. }));
        assert_eq!(
            fetch_error(
                "k",
                HttpError::Timeout {
                    url: "https://example.test".into()
                }
            ),
            FetchError::Timeout { key: "k".into() }
        );
    }
}
