//! Environment configuration for the pipeline worker.
//!
//! Durations use humantime syntax (`30s`, `48h`, `1h 30m`). Unset or empty
//! variables take their defaults.

use std::str::FromStr;
use std::time::Duration;

use appreview_core::AppId;

use crate::feed::{DEFAULT_FEED_TIMEOUT, DEFAULT_FEED_URL_TEMPLATE, DEFAULT_MAX_PAGES};
use crate::queue::{QueueOptions, RetryLimit};
use crate::workers::ConsumerOptions;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://data/database.db";
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_CONSUMER_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_REVIEWS_TIME_LIMIT: Duration = Duration::from_secs(48 * 3600);
/// Long enough for a full ten-page fetch at the default request timeout.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {key}={value:?}: {reason}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

impl ConfigError {
    fn new(key: &'static str, value: &str, reason: impl Into<String>) -> Self {
        Self {
            key,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Which loops this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineRole {
    Scheduler,
    Consumer,
    All,
}

impl PipelineRole {
    pub fn runs_scheduler(&self) -> bool {
        matches!(self, PipelineRole::Scheduler | PipelineRole::All)
    }

    pub fn runs_consumer(&self) -> bool {
        matches!(self, PipelineRole::Consumer | PipelineRole::All)
    }
}

impl FromStr for PipelineRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "scheduler" => Ok(PipelineRole::Scheduler),
            "consumer" => Ok(PipelineRole::Consumer),
            "all" => Ok(PipelineRole::All),
            other => Err(format!("expected scheduler, consumer or all, got {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub database_url: String,
    /// Defaults to `database_url`.
    pub queue_database_url: String,
    /// Applications registered in the catalog at startup.
    pub app_ids: Vec<AppId>,
    pub polling_interval: Duration,
    pub consumer_interval: Duration,
    pub reviews_time_limit: Duration,
    pub queue: QueueOptions,
    pub feed_url_template: String,
    pub feed_timeout: Duration,
    pub feed_max_pages: usize,
    pub role: PipelineRole,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let database_url = get("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
        let queue_database_url = get("QUEUE_DATABASE_URL").unwrap_or_else(|| database_url.clone());

        let app_ids = match get("APP_IDS") {
            Some(raw) => parse_app_ids(&raw)?,
            None => Vec::new(),
        };

        let max_retries = match get("MAX_RETRIES") {
            Some(raw) => parse_retry_limit(&raw)?,
            None => RetryLimit::Limited(DEFAULT_MAX_RETRIES),
        };

        let feed_max_pages = match get("FEED_MAX_PAGES") {
            Some(raw) => match raw.parse::<usize>() {
                Ok(n) if n > 0 => n,
                Ok(_) => return Err(ConfigError::new("FEED_MAX_PAGES", &raw, "must be at least 1")),
                Err(e) => return Err(ConfigError::new("FEED_MAX_PAGES", &raw, e.to_string())),
            },
            None => DEFAULT_MAX_PAGES,
        };

        let role = match get("PIPELINE_ROLE") {
            Some(raw) => raw
                .parse()
                .map_err(|reason: String| ConfigError::new("PIPELINE_ROLE", &raw, reason))?,
            None => PipelineRole::All,
        };

        Ok(Self {
            queue_database_url,
            database_url,
            app_ids,
            polling_interval: duration(&get, "POLLING_INTERVAL", DEFAULT_POLLING_INTERVAL, false)?,
            consumer_interval: duration(&get, "CONSUMER_INTERVAL", DEFAULT_CONSUMER_INTERVAL, false)?,
            reviews_time_limit: duration(&get, "REVIEWS_TIME_LIMIT", DEFAULT_REVIEWS_TIME_LIMIT, true)?,
            queue: QueueOptions {
                visibility_timeout: duration(&get, "VISIBILITY_TIMEOUT", DEFAULT_VISIBILITY_TIMEOUT, false)?,
                retry_backoff: duration(&get, "RETRY_BACKOFF", DEFAULT_RETRY_BACKOFF, true)?,
                max_retries,
            },
            feed_url_template: get("FEED_URL_TEMPLATE")
                .unwrap_or_else(|| DEFAULT_FEED_URL_TEMPLATE.to_string()),
            feed_timeout: duration(&get, "FEED_TIMEOUT", DEFAULT_FEED_TIMEOUT, false)?,
            feed_max_pages,
            role,
        })
    }

    pub fn consumer_options(&self) -> ConsumerOptions {
        ConsumerOptions {
            visibility_timeout: self.queue.visibility_timeout,
            reviews_time_limit: self.reviews_time_limit,
        }
    }
}

fn duration<G>(get: &G, key: &'static str, default: Duration, allow_zero: bool) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(key) else {
        return Ok(default);
    };
    let parsed = humantime::parse_duration(&raw).map_err(|e| ConfigError::new(key, &raw, e.to_string()))?;
    if parsed.is_zero() && !allow_zero {
        return Err(ConfigError::new(key, &raw, "must be greater than zero"));
    }
    Ok(parsed)
}

fn parse_app_ids(raw: &str) -> Result<Vec<AppId>, ConfigError> {
    let mut ids: Vec<AppId> = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let id = AppId::new(part).map_err(|e| ConfigError::new("APP_IDS", raw, e.to_string()))?;
        if !id.is_numeric() {
            return Err(ConfigError::new("APP_IDS", raw, format!("app id {part:?} is not numeric")));
        }
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    Ok(ids)
}

fn parse_retry_limit(raw: &str) -> Result<RetryLimit, ConfigError> {
    if raw.eq_ignore_ascii_case("infinite") {
        return Ok(RetryLimit::Infinite);
    }
    raw.parse::<u32>()
        .map(RetryLimit::Limited)
        .map_err(|e| ConfigError::new("MAX_RETRIES", raw, format!("{e}; use a count or \"infinite\"")))
}
