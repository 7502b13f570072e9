//! NATS-backed event publishing.

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::config::DEFAULT_JOBS_NEW_SUBJECT;
use crate::error::Result;
use crate::traits::publisher::EventPublisher;
use crate::types::JobNewEvent;

/// A published message.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub subject: String,
    pub payload: Bytes,
}

/// Trait for NATS publish operations.
///
/// This allows swapping between real NATS and test mocks.
#[async_trait]
pub trait NatsPublisher: Send + Sync {
    /// Publish a message to a subject.
    async fn publish(&self, subject: String, payload: Bytes) -> Result<()>;
}

/// Real NATS client publisher.
#[cfg(feature = "nats")]
pub struct NatsClientPublisher {
    client: async_nats::Client,
}

#[cfg(feature = "nats")]
impl NatsClientPublisher {
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }

    /// Connect to the NATS server at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| crate::error::CollectorError::Publish(Box::new(e)))?;
        Ok(Self::new(client))
    }
}

#[cfg(feature = "nats")]
#[async_trait]
impl NatsPublisher for NatsClientPublisher {
    async fn publish(&self, subject: String, payload: Bytes) -> Result<()> {
        self.client
            .publish(subject, payload)
            .await
            .map_err(|e| crate::error::CollectorError::Publish(Box::new(e)))?;
        Ok(())
    }
}

/// Publishes job events as JSON on a fixed subject.
pub struct JobEventPublisher<P> {
    transport: P,
    subject: String,
}

impl<P: NatsPublisher> JobEventPublisher<P> {
    /// Publish on the default `jobs.new` subject.
    pub fn new(transport: P) -> Self {
        Self::with_subject(transport, DEFAULT_JOBS_NEW_SUBJECT)
    }

    pub fn with_subject(transport: P, subject: impl Into<String>) -> Self {
        Self {
            transport,
            subject: subject.into(),
        }
    }

    pub fn transport(&self) -> &P {
        &self.transport
    }
}

#[async_trait]
impl<P: NatsPublisher> EventPublisher for JobEventPublisher<P> {
    async fn publish_job_new(&self, event: &JobNewEvent) -> Result<()> {
        let payload = serde_json::to_vec(event)?;
        self.transport
            .publish(self.subject.clone(), Bytes::from(payload))
            .await?;
        debug!(job_id = %event.job_id, subject = %self.subject, "Published job event");
        Ok(())
    }
}
