//! Single-shot page fetches. Retrying is the caller's business; this client
//! only reports what happened and whether trying again could help.

use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Server errors, throttling and explicit refusals are treated as temporary.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::FORBIDDEN
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub body: Vec<u8>,
}

impl FetchedPage {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("transport failure for {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl HttpError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Client(_) => RetryDisposition::NonRetryable,
            Self::Timeout { .. } | Self::Transport { .. } => RetryDisposition::Retryable,
            Self::Status { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PageClient {
    client: reqwest::Client,
}

impl PageClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, HttpError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().map_err(HttpError::Client)?;
        Ok(Self { client })
    }

    /// One GET, no retries. Non-2xx statuses come back as `HttpError::Status`.
    pub async fn get(&self, url: &str) -> Result<FetchedPage, HttpError> {
        let span = info_span!("page_fetch", url);
        async {
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|err| request_error(url, err))?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            debug!(status = status.as_u16(), %final_url, "response received");

            if !status.is_success() {
                return Err(HttpError::Status {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp
                .bytes()
                .await
                .map_err(|err| request_error(url, err))?
                .to_vec();
            Ok(FetchedPage { body })
        }
        .instrument(span)
        .await
    }
}

fn request_error(url: &str, err: reqwest::Error) -> HttpError {
    if err.is_timeout() {
        HttpError::Timeout {
            url: url.to_string(),
        }
    } else {
        HttpError::Transport {
            url: url.to_string(),
            source: err,
        }
    }
}
