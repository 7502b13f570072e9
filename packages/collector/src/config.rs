use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::dedup::FilterPolicy;
use crate::error::{CollectorError, Result};

/// Subject new-job events are published on.
pub const DEFAULT_JOBS_NEW_SUBJECT: &str = "jobs.new";

/// Collector configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub nats_url: String,
    pub jobs_new_subject: String,
    pub tg_api_id: i32,
    pub tg_api_hash: String,
    pub rate_limit: RateLimitSettings,
    pub scrape: ScrapeSettings,
}

/// Outbound protocol call budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitSettings {
    pub requests_per_second: f64,
    pub burst: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_second: 2.0,
            burst: 1,
        }
    }
}

/// Crawl loop tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeSettings {
    /// Pause between consecutive history pages
    pub batch_delay: Duration,
    /// Upper bound on pages fetched per source in one run
    pub max_batches: u32,
    pub filter_policy: FilterPolicy,
}

impl Default for ScrapeSettings {
    fn default() -> Self {
        Self {
            batch_delay: Duration::from_millis(100),
            max_batches: 100,
            filter_policy: FilterPolicy::Smart,
        }
    }
}

/// Tuning shared by the collector's components.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CollectorSettings {
    pub rate_limit: RateLimitSettings,
    pub scrape: ScrapeSettings,
}

impl From<&Config> for CollectorSettings {
    fn from(config: &Config) -> Self {
        Self {
            rate_limit: config.rate_limit,
            scrape: config.scrape,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key).ok_or_else(|| CollectorError::Config(format!("{key} must be set")))
        };

        let rate_limit = RateLimitSettings {
            requests_per_second: parse_or(&lookup, "TG_RATE_LIMIT_RPS", 2.0)?,
            burst: parse_or(&lookup, "TG_RATE_LIMIT_BURST", 1)?,
        };
        let rps = rate_limit.requests_per_second;
        if rps.is_nan() || rps <= 0.0 || rate_limit.burst == 0 {
            return Err(CollectorError::Config(
                "TG_RATE_LIMIT_RPS and TG_RATE_LIMIT_BURST must be positive".into(),
            ));
        }

        let scrape = ScrapeSettings {
            batch_delay: Duration::from_millis(parse_or(&lookup, "COLLECTOR_BATCH_DELAY_MS", 100)?),
            max_batches: parse_or(&lookup, "COLLECTOR_MAX_BATCHES", 100)?,
            filter_policy: parse_or(&lookup, "COLLECTOR_FILTER_POLICY", FilterPolicy::Smart)?,
        };

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            nats_url: lookup("NATS_URL").unwrap_or_else(|| "nats://localhost:4222".to_string()),
            jobs_new_subject: lookup("NATS_SUBJECT_JOBS_NEW")
                .unwrap_or_else(|| DEFAULT_JOBS_NEW_SUBJECT.to_string()),
            tg_api_id: required("TG_API_ID")?
                .parse()
                .map_err(|_| CollectorError::Config("TG_API_ID must be a valid number".into()))?,
            tg_api_hash: required("TG_API_HASH")?,
            rate_limit,
            scrape,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| CollectorError::Config(format!("{key} has an invalid value: {raw}"))),
        None => Ok(default),
    }
}
