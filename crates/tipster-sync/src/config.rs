use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tipster_adapters::{UrlTemplates, DEFAULT_PREDICTION_URL, DEFAULT_RACE_URL};
use tipster_storage::{BackoffPolicy, HttpClientConfig};

/// How fast a pass walks the backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingConfig {
    pub page_size: u32,
    pub item_delay: Duration,
    /// Units between cooldowns. 0 disables cooldowns.
    pub batch_size: u32,
    pub cooldown: Duration,
    /// Failures after which a unit is left out of the backlog. 0 disables.
    pub quarantine_after: u32,
    pub graded_only: bool,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            item_delay: Duration::from_secs(2),
            batch_size: 100,
            cooldown: Duration::from_secs(1800),
            quarantine_after: 3,
            graded_only: false,
        }
    }
}

impl PacingConfig {
    /// No delays at all; for replaying archives and for tests.
    pub fn unpaced() -> Self {
        Self {
            item_delay: Duration::ZERO,
            cooldown: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Optional YAML overlay for [`PacingConfig`]; absent keys keep the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PacingProfile {
    pub page_size: Option<u32>,
    pub item_delay_secs: Option<u64>,
    pub batch_size: Option<u32>,
    pub cooldown_secs: Option<u64>,
    pub quarantine_after: Option<u32>,
    pub graded_only: Option<bool>,
}

impl PacingProfile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading pacing profile {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing pacing profile {}", path.display()))
    }

    pub fn apply(&self, base: PacingConfig) -> PacingConfig {
        PacingConfig {
            page_size: self.page_size.unwrap_or(base.page_size),
            item_delay: self.item_delay_secs.map(Duration::from_secs).unwrap_or(base.item_delay),
            batch_size: self.batch_size.unwrap_or(base.batch_size),
            cooldown: self.cooldown_secs.map(Duration::from_secs).unwrap_or(base.cooldown),
            quarantine_after: self.quarantine_after.unwrap_or(base.quarantine_after),
            graded_only: self.graded_only.unwrap_or(base.graded_only),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub artifacts_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub urls: UrlTemplates,
    pub max_retries: usize,
    pub pacing: PacingConfig,
    pub pacing_file: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = PacingConfig::default();
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://data/tipster.db".to_string()),
            artifacts_dir: std::env::var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./artifacts")),
            user_agent: std::env::var("TIPSTER_USER_AGENT")
                .unwrap_or_else(|_| "tipster-bot/0.1".to_string()),
            http_timeout_secs: env_or("TIPSTER_HTTP_TIMEOUT_SECS", 30),
            urls: UrlTemplates {
                prediction: std::env::var("TIPSTER_PREDICTION_URL")
                    .unwrap_or_else(|_| DEFAULT_PREDICTION_URL.to_string()),
                race: std::env::var("TIPSTER_RACE_URL").unwrap_or_else(|_| DEFAULT_RACE_URL.to_string()),
            },
            max_retries: env_or("TIPSTER_MAX_RETRIES", 3),
            pacing: PacingConfig {
                page_size: env_or("TIPSTER_PAGE_SIZE", defaults.page_size),
                item_delay: Duration::from_secs(env_or("TIPSTER_ITEM_DELAY_SECS", 2)),
                batch_size: env_or("TIPSTER_BATCH_SIZE", defaults.batch_size),
                cooldown: Duration::from_secs(env_or("TIPSTER_COOLDOWN_SECS", 1800)),
                quarantine_after: env_or("TIPSTER_QUARANTINE_AFTER", defaults.quarantine_after),
                graded_only: false,
            },
            pacing_file: std::env::var("TIPSTER_PACING_FILE").ok().map(PathBuf::from),
            scheduler_enabled: std::env::var("TIPSTER_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            cron: std::env::var("TIPSTER_CRON").unwrap_or_else(|_| "0 0 3 * * *".to_string()),
        }
    }

    /// Folds the YAML pacing profile, if one is configured, into `pacing`.
    pub fn with_pacing_profile(mut self) -> Result<Self> {
        if let Some(path) = &self.pacing_file {
            let profile = PacingProfile::load(path)?;
            self.pacing = profile.apply(self.pacing);
        }
        Ok(self)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            ..BackoffPolicy::default()
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
