//! Test doubles for the collector's collaborators.
//!
//! - [`MockProtocolClient`]: scripted channel history, topics and failures
//! - [`MockClientFactory`] / [`MockLoginFactory`]: authorized and QR clients
//! - [`TestNats`]: records everything published
//!
//! # Example
//!
//! ```rust,ignore
//! use collector::testing::{sample_channel, MockProtocolClient};
//!
//! let client = MockProtocolClient::new()
//!     .with_channel(sample_channel("rust_jobs"))
//!     .with_messages("rust_jobs", vec![/* ... */]);
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::{CollectorError, ProtocolError, ProtocolResult, Result};
use crate::publishers::nats::{NatsPublisher, PublishedMessage};
use crate::traits::protocol::{ClientFactory, LoginClient, LoginClientFactory, ProtocolClient, TokenCallback};
use crate::types::{Channel, Message, SessionData, Topic};

/// Session material for tests.
pub fn sample_session_data() -> SessionData {
    SessionData {
        dc_id: 2,
        addr: "149.154.167.50:443".to_string(),
        auth_key: vec![0xAB; 256],
        auth_key_id: vec![1, 2, 3, 4, 5, 6, 7, 8],
        salt: 0x5EED,
    }
}

/// An ordinary broadcast channel.
pub fn sample_channel(username: &str) -> Channel {
    Channel {
        id: 1_000 + username.len() as i64,
        access_hash: 9_000,
        username: username.to_string(),
        title: format!("{username} title"),
        is_forum: false,
    }
}

/// A forum supergroup.
pub fn sample_forum(username: &str) -> Channel {
    Channel {
        is_forum: true,
        ..sample_channel(username)
    }
}

/// A message `age_days` old.
pub fn message(id: i64, text: &str, age_days: i64) -> Message {
    Message::new(id, text, Utc::now() - ChronoDuration::days(age_days))
}

/// A message posted at `date`.
pub fn message_at(id: i64, text: &str, date: DateTime<Utc>) -> Message {
    Message::new(id, text, date)
}

fn page(messages: &[Message], offset_id: i64, limit: usize, ignore_offset: bool) -> Vec<Message> {
    let mut sorted: Vec<Message> = messages.to_vec();
    sorted.sort_by(|a, b| b.id.cmp(&a.id));
    sorted
        .into_iter()
        .filter(|m| ignore_offset || offset_id == 0 || m.id < offset_id)
        .take(limit)
        .collect()
}

/// Scripted protocol client.
///
/// History is served newest first and paged by `offset_id` the way the real
/// protocol does.
#[derive(Default)]
pub struct MockProtocolClient {
    channels: RwLock<HashMap<String, Channel>>,
    history: RwLock<HashMap<String, Vec<Message>>>,
    topics: RwLock<HashMap<String, Vec<Topic>>>,
    topic_history: RwLock<HashMap<(String, i64), Vec<Message>>>,
    fetch_failures: RwLock<VecDeque<ProtocolError>>,
    ignore_offset: AtomicBool,
    calls: RwLock<Vec<String>>,
    stopped: AtomicBool,
}

impl MockProtocolClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a channel resolvable.
    pub fn with_channel(self, channel: Channel) -> Self {
        self.channels
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(channel.username.clone(), channel);
        self
    }

    pub fn with_messages(self, username: &str, messages: Vec<Message>) -> Self {
        self.set_messages(username, messages);
        self
    }

    pub fn with_topics(self, username: &str, topics: Vec<Topic>) -> Self {
        self.topics
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(username.to_string(), topics);
        self
    }

    pub fn with_topic_messages(self, username: &str, topic_id: i64, messages: Vec<Message>) -> Self {
        self.topic_history
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((username.to_string(), topic_id), messages);
        self
    }

    /// Serve the same first page no matter the offset.
    pub fn with_ignored_offset(self) -> Self {
        self.ignore_offset.store(true, Ordering::SeqCst);
        self
    }

    /// Replace a channel's history.
    pub fn set_messages(&self, username: &str, messages: Vec<Message>) {
        self.history
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(username.to_string(), messages);
    }

    /// Fail the next history fetch with `error`.
    pub fn fail_next_fetch(&self, error: ProtocolError) {
        self.fetch_failures.write().unwrap_or_else(|e| e.into_inner()).push_back(error);
    }

    /// Calls made so far, e.g. `get_messages(rust_jobs,0,100)`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn record(&self, call: String) {
        self.calls.write().unwrap_or_else(|e| e.into_inner()).push(call);
    }

    fn check(&self, cancel: &CancellationToken) -> ProtocolResult<()> {
        if cancel.is_cancelled() {
            return Err(ProtocolError::Cancelled);
        }
        if self.is_stopped() {
            return Err(ProtocolError::Rpc("client stopped".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolClient for MockProtocolClient {
    async fn resolve_channel(&self, cancel: &CancellationToken, username: &str) -> ProtocolResult<Channel> {
        self.record(format!("resolve_channel({username})"));
        self.check(cancel)?;
        self.channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(username)
            .cloned()
            .ok_or(ProtocolError::ChannelNotFound)
    }

    async fn get_messages(
        &self,
        cancel: &CancellationToken,
        channel: &Channel,
        offset_id: i64,
        limit: usize,
    ) -> ProtocolResult<Vec<Message>> {
        self.record(format!("get_messages({},{offset_id},{limit})", channel.username));
        self.check(cancel)?;
        if let Some(error) = self.fetch_failures.write().unwrap_or_else(|e| e.into_inner()).pop_front() {
            return Err(error);
        }
        let history = self.history.read().unwrap_or_else(|e| e.into_inner());
        let messages = history.get(&channel.username).map(Vec::as_slice).unwrap_or(&[]);
        Ok(page(messages, offset_id, limit, self.ignore_offset.load(Ordering::SeqCst)))
    }

    async fn get_topics(&self, cancel: &CancellationToken, channel: &Channel) -> ProtocolResult<Vec<Topic>> {
        self.record(format!("get_topics({})", channel.username));
        self.check(cancel)?;
        if !channel.is_forum {
            return Ok(Vec::new());
        }
        Ok(self
            .topics
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&channel.username)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_topic_messages(
        &self,
        cancel: &CancellationToken,
        channel: &Channel,
        topic_id: i64,
        offset_id: i64,
        limit: usize,
    ) -> ProtocolResult<Vec<Message>> {
        self.record(format!(
            "get_topic_messages({},{topic_id},{offset_id},{limit})",
            channel.username
        ));
        self.check(cancel)?;
        if let Some(error) = self.fetch_failures.write().unwrap_or_else(|e| e.into_inner()).pop_front() {
            return Err(error);
        }
        let history = self.topic_history.read().unwrap_or_else(|e| e.into_inner());
        let messages = history
            .get(&(channel.username.clone(), topic_id))
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        Ok(page(messages, offset_id, limit, false)
            .into_iter()
            .map(|m| m.with_topic(topic_id))
            .collect())
    }

    async fn stop(&self) {
        self.record("stop".to_string());
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Authorized-client factory returning a shared mock or a fixed error.
#[derive(Clone)]
pub struct MockClientFactory {
    outcome: std::result::Result<Arc<MockProtocolClient>, ProtocolError>,
    connects: Arc<AtomicUsize>,
}

impl MockClientFactory {
    pub fn connecting(client: Arc<MockProtocolClient>) -> Self {
        Self {
            outcome: Ok(client),
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(error: ProtocolError) -> Self {
        Self {
            outcome: Err(error),
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientFactory for MockClientFactory {
    async fn connect(&self, _session: &SessionData) -> ProtocolResult<Arc<dyn ProtocolClient>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        match &self.outcome {
            Ok(client) => Ok(client.clone() as Arc<dyn ProtocolClient>),
            Err(error) => Err(error.clone()),
        }
    }
}

#[derive(Clone)]
enum LoginOutcome {
    Succeed(SessionData),
    /// Wait until cancelled
    Pending,
    Fail(ProtocolError),
}

/// QR login factory with a scripted exchange.
pub struct MockLoginFactory {
    tokens: Vec<String>,
    outcome: LoginOutcome,
}

impl MockLoginFactory {
    /// Emit `tokens`, then authorize with `data`.
    pub fn succeeding(tokens: Vec<String>, data: SessionData) -> Self {
        Self {
            tokens,
            outcome: LoginOutcome::Succeed(data),
        }
    }

    /// Emit `tokens`, then wait for cancellation.
    pub fn pending(tokens: Vec<String>) -> Self {
        Self {
            tokens,
            outcome: LoginOutcome::Pending,
        }
    }

    pub fn failing(error: ProtocolError) -> Self {
        Self {
            tokens: Vec::new(),
            outcome: LoginOutcome::Fail(error),
        }
    }
}

struct MockLoginClient {
    tokens: Vec<String>,
    outcome: LoginOutcome,
}

#[async_trait]
impl LoginClient for MockLoginClient {
    async fn authorize(
        &self,
        cancel: &CancellationToken,
        on_token: TokenCallback<'_>,
    ) -> ProtocolResult<SessionData> {
        for token in &self.tokens {
            on_token(token);
        }
        match &self.outcome {
            LoginOutcome::Succeed(data) => Ok(data.clone()),
            LoginOutcome::Pending => {
                cancel.cancelled().await;
                Err(ProtocolError::Cancelled)
            }
            LoginOutcome::Fail(error) => Err(error.clone()),
        }
    }
}

#[async_trait]
impl LoginClientFactory for MockLoginFactory {
    async fn create(&self) -> ProtocolResult<Box<dyn LoginClient>> {
        Ok(Box::new(MockLoginClient {
            tokens: self.tokens.clone(),
            outcome: self.outcome.clone(),
        }))
    }
}

/// Mock NATS client that tracks published messages for testing.
#[derive(Default)]
pub struct TestNats {
    published: RwLock<Vec<PublishedMessage>>,
    failing: AtomicBool,
}

impl TestNats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every publish fails.
    pub fn failing() -> Self {
        let nats = Self::default();
        nats.failing.store(true, Ordering::SeqCst);
        nats
    }

    /// Get all published messages.
    pub fn published_messages(&self) -> Vec<PublishedMessage> {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Get published messages for a specific subject.
    pub fn messages_for_subject(&self, subject: &str) -> Vec<PublishedMessage> {
        self.published_messages()
            .into_iter()
            .filter(|m| m.subject == subject)
            .collect()
    }

    /// Check if any message was published to a subject.
    pub fn was_published_to(&self, subject: &str) -> bool {
        self.published_messages().iter().any(|m| m.subject == subject)
    }
}

#[async_trait]
impl NatsPublisher for TestNats {
    async fn publish(&self, subject: String, payload: Bytes) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CollectorError::Publish("nats unavailable".into()));
        }
        self.published
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(PublishedMessage { subject, payload });
        Ok(())
    }
}

#[async_trait]
impl NatsPublisher for Arc<TestNats> {
    async fn publish(&self, subject: String, payload: Bytes) -> Result<()> {
        self.as_ref().publish(subject, payload).await
    }
}
