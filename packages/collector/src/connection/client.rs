//! Rate-limited access to the current protocol client.

use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::connection::manager::{ConnectionManager, ConnectionStatus};
use crate::error::{CollectorError, ProtocolError, ProtocolResult, Result};
use crate::ratelimit::RateLimiter;
use crate::traits::protocol::ProtocolClient;
use crate::types::{Channel, Message, Topic};

/// Protocol façade used by the crawl loop.
///
/// Every call waits on the shared [`RateLimiter`], then fetches the client
/// handle from the [`ConnectionManager`] so a re-login is picked up by the
/// next call. Server backoff replies install a cooldown on the limiter.
#[derive(Clone)]
pub struct GuardedClient {
    connection: Arc<ConnectionManager>,
    limiter: Arc<RateLimiter>,
}

impl GuardedClient {
    pub fn new(connection: Arc<ConnectionManager>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            connection,
            limiter,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    async fn call<T, F, Fut>(&self, cancel: &CancellationToken, op: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn ProtocolClient>) -> Fut,
        Fut: Future<Output = ProtocolResult<T>>,
    {
        self.limiter.wait(cancel).await?;
        let client = self.connection.client().ok_or(CollectorError::NotConnected)?;

        op(client).await.map_err(|e| {
            if let Some(seconds) = e.flood_wait() {
                warn!(wait_seconds = seconds, "Server requested backoff");
                self.limiter.set_cooldown(seconds);
            }
            match e {
                ProtocolError::ChannelNotFound => CollectorError::ChannelNotFound,
                ProtocolError::NotAChannel => CollectorError::NotAChannel,
                ProtocolError::Cancelled => CollectorError::Cancelled,
                other => CollectorError::Protocol(other),
            }
        })
    }

    pub async fn resolve_channel(&self, cancel: &CancellationToken, username: &str) -> Result<Channel> {
        self.call(cancel, |client| async move {
            client.resolve_channel(cancel, username).await
        })
        .await
    }

    pub async fn get_messages(
        &self,
        cancel: &CancellationToken,
        channel: &Channel,
        offset_id: i64,
        limit: usize,
    ) -> Result<Vec<Message>> {
        self.call(cancel, |client| async move {
            client.get_messages(cancel, channel, offset_id, limit).await
        })
        .await
    }

    /// Forum topics; empty for ordinary channels.
    pub async fn get_topics(&self, cancel: &CancellationToken, channel: &Channel) -> Result<Vec<Topic>> {
        if !channel.is_forum {
            return Ok(Vec::new());
        }
        self.call(cancel, |client| async move { client.get_topics(cancel, channel).await })
            .await
    }

    pub async fn get_topic_messages(
        &self,
        cancel: &CancellationToken,
        channel: &Channel,
        topic_id: i64,
        offset_id: i64,
        limit: usize,
    ) -> Result<Vec<Message>> {
        self.call(cancel, |client| async move {
            client
                .get_topic_messages(cancel, channel, topic_id, offset_id, limit)
                .await
        })
        .await
    }
}
