//! Storage traits for sessions, targets, watermarks and jobs.
//!
//! The storage layer is split into focused traits:
//! - `SessionStore`: the single authorized-session blob
//! - `TargetStore`: scraping targets
//! - `RangeStore`: per-target processed-id watermark
//! - `JobStore`: collected work items
//! - `CollectorStore`: composite trait combining all four

use async_trait::async_trait;
use std::collections::HashSet;
use uuid::Uuid;

use crate::dedup::ParsedRange;
use crate::error::Result;
use crate::types::{Job, NewJob, NewTarget, Session, Target, TargetType};

/// Persists the one authorized session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load the session, `None` when nobody has logged in yet.
    async fn load_session(&self) -> Result<Option<Session>>;

    /// Overwrite the stored session.
    async fn save_session(&self, session: &Session) -> Result<()>;
}

/// Scraping targets.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TargetStore: Send + Sync {
    async fn get_target(&self, id: Uuid) -> Result<Option<Target>>;

    /// Look up a target by channel username.
    async fn get_target_by_url(&self, url: &str) -> Result<Option<Target>>;

    async fn create_target(&self, target: NewTarget) -> Result<Target>;

    /// Record resolved protocol identifiers.
    async fn update_telegram_info(&self, id: Uuid, channel_id: i64, access_hash: i64)
        -> Result<()>;

    /// Stamp the last crawl time and, when known, the newest message id.
    async fn update_last_scraped(&self, id: Uuid, last_message_id: Option<i64>) -> Result<()>;

    async fn update_target_type(&self, id: Uuid, target_type: TargetType) -> Result<()>;
}

/// Per-target watermark of processed message ids.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RangeStore: Send + Sync {
    /// Current watermark; the empty range when nothing was processed.
    async fn get_range(&self, target_id: Uuid) -> Result<ParsedRange>;

    /// Widen the stored watermark to cover `[min_id, max_id]`.
    ///
    /// Never shrinks an existing range.
    async fn upsert_range(&self, target_id: Uuid, min_id: i64, max_id: i64) -> Result<()>;
}

/// Collected work items.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: NewJob) -> Result<Job>;

    async fn job_exists(&self, target_id: Uuid, external_id: &str) -> Result<bool>;

    /// Message ids within `[min_id, max_id]` that already have a job.
    async fn existing_message_ids(
        &self,
        target_id: Uuid,
        min_id: i64,
        max_id: i64,
    ) -> Result<HashSet<i64>>;
}

/// Composite storage trait combining every store.
///
/// This is the main trait used by the collector service.
pub trait CollectorStore: SessionStore + TargetStore + RangeStore + JobStore {}

// Blanket implementation
impl<T: SessionStore + TargetStore + RangeStore + JobStore> CollectorStore for T {}
