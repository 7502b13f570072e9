//! Remote protocol client boundary.
//!
//! The wire protocol itself lives outside this crate. The collector only
//! needs an authorized client that can page through channel history, and a
//! raw client that can run the QR login handshake.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::ProtocolResult;
use crate::types::{Channel, Message, SessionData, Topic};

/// Callback receiving each fresh login URL.
pub type TokenCallback<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// An authorized protocol client.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Resolve a public username to a channel.
    async fn resolve_channel(
        &self,
        cancel: &CancellationToken,
        username: &str,
    ) -> ProtocolResult<Channel>;

    /// Fetch up to `limit` messages older than `offset_id`, newest first.
    ///
    /// `offset_id == 0` starts from the newest message.
    async fn get_messages(
        &self,
        cancel: &CancellationToken,
        channel: &Channel,
        offset_id: i64,
        limit: usize,
    ) -> ProtocolResult<Vec<Message>>;

    /// List forum topics. Non-forum channels yield an empty list.
    async fn get_topics(
        &self,
        cancel: &CancellationToken,
        channel: &Channel,
    ) -> ProtocolResult<Vec<Topic>>;

    /// Fetch messages posted in one forum topic, newest first.
    async fn get_topic_messages(
        &self,
        cancel: &CancellationToken,
        channel: &Channel,
        topic_id: i64,
        offset_id: i64,
        limit: usize,
    ) -> ProtocolResult<Vec<Message>>;

    /// Disconnect. Calls after this fail on their own.
    async fn stop(&self);
}

/// Builds authorized clients from a stored session.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(&self, session: &SessionData) -> ProtocolResult<Arc<dyn ProtocolClient>>;
}

/// A raw, unauthorized client backed by ephemeral in-memory session storage.
#[async_trait]
pub trait LoginClient: Send + Sync {
    /// Run the QR login-token exchange.
    ///
    /// `on_token` is invoked with every fresh login URL. Returns the
    /// authorized session once the user confirms, or
    /// [`ProtocolError::Cancelled`](crate::error::ProtocolError::Cancelled)
    /// when `cancel` fires.
    async fn authorize(
        &self,
        cancel: &CancellationToken,
        on_token: TokenCallback<'_>,
    ) -> ProtocolResult<SessionData>;
}

/// Builds raw clients for the QR flow.
#[async_trait]
pub trait LoginClientFactory: Send + Sync {
    async fn create(&self) -> ProtocolResult<Box<dyn LoginClient>>;
}
