//! Downstream event sink.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::JobNewEvent;

/// Publishes collector events to the downstream pipeline.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Announce a newly created job.
    async fn publish_job_new(&self, event: &JobNewEvent) -> Result<()>;
}
