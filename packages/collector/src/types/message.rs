//! Values returned by the remote protocol client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single channel message.
///
/// `id` is assigned by the server and is monotonically increasing within a
/// channel; the dedup watermark relies on that.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub channel_id: i64,
    pub text: String,
    pub date: DateTime<Utc>,
    /// Forum topic the message was posted in
    pub topic_id: Option<i64>,
    pub views: i32,
    pub forwards: i32,
}

impl Message {
    /// Create a message with the given id, text and date.
    pub fn new(id: i64, text: impl Into<String>, date: DateTime<Utc>) -> Self {
        Self {
            id,
            channel_id: 0,
            text: text.into(),
            date,
            topic_id: None,
            views: 0,
            forwards: 0,
        }
    }

    /// Set the forum topic.
    pub fn with_topic(mut self, topic_id: i64) -> Self {
        self.topic_id = Some(topic_id);
        self
    }

    /// Whether the message carries no text worth processing.
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// A resolved channel peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub access_hash: i64,
    pub username: String,
    pub title: String,
    pub is_forum: bool,
}

/// A forum topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub id: i64,
    pub title: String,
    pub top_message: i64,
    pub closed: bool,
    pub pinned: bool,
}
