//! Work items produced by a crawl.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Status of a freshly collected job.
pub const JOB_STATUS_RAW: &str = "RAW";

/// A stored work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub target_id: Uuid,

    /// Message id as a string
    pub external_id: String,
    /// Hex SHA-256 of `raw_content`
    pub content_hash: String,

    pub raw_content: String,

    pub source_url: Option<String>,
    pub source_date: Option<DateTime<Utc>>,

    pub tg_message_id: Option<i64>,
    pub tg_topic_id: Option<i64>,

    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// A job about to be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub target_id: Uuid,
    pub external_id: String,
    pub raw_content: String,
    pub source_url: Option<String>,
    pub source_date: Option<DateTime<Utc>>,
    pub tg_message_id: Option<i64>,
    pub tg_topic_id: Option<i64>,
}

impl NewJob {
    /// Materialize into a stored job with a fresh id and `RAW` status.
    pub fn into_job(self) -> Job {
        let content_hash = content_hash(&self.raw_content);
        Job {
            id: Uuid::new_v4(),
            target_id: self.target_id,
            external_id: self.external_id,
            content_hash,
            raw_content: self.raw_content,
            source_url: self.source_url,
            source_date: self.source_date,
            tg_message_id: self.tg_message_id,
            tg_topic_id: self.tg_topic_id,
            status: JOB_STATUS_RAW.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Hex SHA-256 of job content.
pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Event published for every newly created job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobNewEvent {
    pub job_id: Uuid,
    pub target_id: Uuid,
    pub external_id: String,
    pub raw_content: String,
    pub created_at: DateTime<Utc>,
}

impl From<&Job> for JobNewEvent {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            target_id: job.target_id,
            external_id: job.external_id.clone(),
            raw_content: job.raw_content.clone(),
            created_at: job.created_at,
        }
    }
}

/// Tally of one crawl run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeResult {
    pub total_fetched: u64,
    pub new_jobs: u64,
    /// Messages already covered by the watermark
    pub skipped_old: u64,
    /// Messages with no text
    pub skipped_empty: u64,
    /// Messages older than the cutoff date
    pub skipped_outdated: u64,
    pub errors: u64,
    pub batches: u64,
}
