use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tipster_core::{CanonicalRaceId, RaceAttributes};
use tipster_storage::BackoffPolicy;
use tracing::warn;

use crate::{DetailFetcher, FetchError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryStats {
    pub calls: u64,
    pub attempts: u64,
    pub retries: u64,
}

/// Retries transient failures of the wrapped fetcher with capped exponential
/// backoff. `NotFound` and `ParseFailure` are returned on first sight.
#[derive(Debug)]
pub struct RetryingFetcher<F> {
    inner: F,
    policy: BackoffPolicy,
    calls: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
}

impl<F: DetailFetcher> RetryingFetcher<F> {
    pub fn new(inner: F, policy: BackoffPolicy) -> Self {
        Self {
            inner,
            policy,
            calls: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }

    pub fn stats(&self) -> RetryStats {
        RetryStats {
            calls: self.calls.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }

    async fn with_retries<T, Op, Fut>(&self, target: &str, op: Op) -> Result<T, FetchError>
    where
        Op: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, FetchError>> + Send,
        T: Send,
    {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let mut attempt = 0usize;
        loop {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.policy.max_retries => {
                    let delay = self.policy.delay_for_attempt(attempt);
                    warn!(
                        target_key = target,
                        attempt = attempt + 1,
                        max_retries = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient fetch failure; retrying"
                    );
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl<F: DetailFetcher> DetailFetcher for RetryingFetcher<F> {
    async fn fetch_prediction(&self, lookup_key: i64) -> Result<CanonicalRaceId, FetchError> {
        let target = lookup_key.to_string();
        self.with_retries(&target, || self.inner.fetch_prediction(lookup_key))
            .await
    }

    async fn fetch_race(&self, race: &CanonicalRaceId) -> Result<RaceAttributes, FetchError> {
        self.with_retries(race.as_str(), || self.inner.fetch_race(race))
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    struct Scripted {
        results: Mutex<VecDeque<Result<CanonicalRaceId, FetchError>>>,
    }

    impl Scripted {
        fn new(results: Vec<Result<CanonicalRaceId, FetchError>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
            }
        }
    }

    #[async_trait]
    impl DetailFetcher for Scripted {
        async fn fetch_prediction(&self, lookup_key: i64) -> Result<CanonicalRaceId, FetchError> {
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(FetchError::NotFound {
                    key: lookup_key.to_string(),
                }))
        }

        async fn fetch_race(&self, race: &CanonicalRaceId) -> Result<RaceAttributes, FetchError> {
            Err(FetchError::NotFound {
                key: race.to_string(),
            })
        }
    }

    fn no_wait(max_retries: usize) -> BackoffPolicy {
        BackoffPolicy {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    fn timeout() -> FetchError {
        FetchError::Timeout { key: "5528852".into() }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let id = CanonicalRaceId::parse("202505050211").unwrap();
        let fetcher = RetryingFetcher::new(
            Scripted::new(vec![
                Err(timeout()),
                Err(FetchError::Blocked {
                    key: "5528852".into(),
                    detail: "http status 429".into(),
                }),
                Ok(id.clone()),
            ]),
            no_wait(3),
        );

        assert_eq!(fetcher.fetch_prediction(5528852).await, Ok(id));
        assert_eq!(
            fetcher.stats(),
            RetryStats {
                calls: 1,
                attempts: 3,
                retries: 2
            }
        );
    }

    #[tokio::test]
    async fn retries_stop_at_the_bound() {
        let fetcher = RetryingFetcher::new(
            Scripted::new(vec![Err(timeout()), Err(timeout()), Err(timeout()), Err(timeout())]),
            no_wait(2),
        );

        assert_eq!(fetcher.fetch_prediction(5528852).await, Err(timeout()));
        assert_eq!(fetcher.stats().attempts, 3);
    }

    #[tokio::test]
    async fn terminal_failures_surface_immediately() {
        let parse = FetchError::parse_failure("5528852", "page links to no race");
        let fetcher = RetryingFetcher::new(Scripted::new(vec![Err(parse.clone())]), no_wait(3));

        assert_eq!(fetcher.fetch_prediction(5528852).await, Err(parse));
        assert_eq!(fetcher.stats().attempts, 1);
        assert_eq!(fetcher.stats().retries, 0);
    }
}
