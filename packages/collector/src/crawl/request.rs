//! Crawl requests and options.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::{CollectorError, Result};

/// What a crawl should cover.
///
/// ```rust,ignore
/// let opts = ScrapeOptions::builder().channel("rust_jobs").limit(500).build();
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct ScrapeOptions {
    /// Existing target to crawl; wins over `channel`
    #[builder(default, setter(strip_option))]
    pub target_id: Option<Uuid>,

    /// Channel username, without `@`
    #[builder(default, setter(into))]
    pub channel: String,

    /// Cap on messages fetched in this run
    #[builder(default, setter(strip_option))]
    pub limit: Option<u64>,

    /// Messages posted before this instant are not turned into jobs
    #[builder(default, setter(strip_option))]
    pub until: Option<DateTime<Utc>>,

    /// Forum topics to crawl instead of the main history
    #[builder(default)]
    pub topic_ids: Vec<i64>,
}

impl ScrapeOptions {
    pub(crate) fn ensure_target(&self) -> Result<()> {
        if self.target_id.is_none() && self.channel.trim_start_matches('@').is_empty() {
            return Err(CollectorError::validation(
                "either target_id or channel is required",
            ));
        }
        Ok(())
    }
}

/// A crawl request as received from an API caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<Uuid>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel: String,

    /// Zero means no cap
    #[serde(default)]
    pub limit: i64,

    /// `YYYY-MM-DD`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub until: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topic_ids: Vec<i64>,
}

impl ScrapeRequest {
    /// Check the request and normalize the channel name.
    pub fn validate(&mut self) -> Result<()> {
        self.channel = self.channel.trim().trim_start_matches('@').to_string();

        if self.target_id.is_none() && self.channel.is_empty() {
            return Err(CollectorError::validation(
                "either target_id or channel is required",
            ));
        }

        if self.limit < 0 {
            return Err(CollectorError::validation("limit must be non-negative"));
        }

        if let Some(until) = self.until_time()? {
            if until > Utc::now() {
                return Err(CollectorError::validation("until date cannot be in the future"));
            }
        }

        Ok(())
    }

    /// Midnight UTC of the `until` date.
    pub fn until_time(&self) -> Result<Option<DateTime<Utc>>> {
        if self.until.is_empty() {
            return Ok(None);
        }
        let date = NaiveDate::parse_from_str(&self.until, "%Y-%m-%d").map_err(|_| {
            CollectorError::validation("until date must be in YYYY-MM-DD format")
        })?;
        Ok(Some(date.and_time(NaiveTime::default()).and_utc()))
    }

    /// Validate and convert into crawl options.
    pub fn into_options(mut self) -> Result<ScrapeOptions> {
        self.validate()?;
        let until = self.until_time()?;
        Ok(ScrapeOptions {
            target_id: self.target_id,
            channel: self.channel,
            limit: (self.limit > 0).then_some(self.limit as u64),
            until,
            topic_ids: self.topic_ids,
        })
    }
}
