//! Typed errors for the collector.
//!
//! [`CollectorError`] is what callers of the control plane see.
//! [`ProtocolError`] is the vocabulary of the remote protocol client boundary;
//! the guarded client and the crawl loop translate it into collector errors
//! (or absorb it) before it reaches a caller.

use thiserror::Error;

/// Errors surfaced by collector operations.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// A crawl job is already running in this process
    #[error("scrape already running")]
    AlreadyRunning,

    /// A QR login attempt is already in flight
    #[error("QR login already in progress")]
    LoginInProgress,

    /// The connection is already authorized
    #[error("already logged in")]
    AlreadyLoggedIn,

    /// The QR login attempt was cancelled before it completed
    #[error("login cancelled")]
    LoginCancelled,

    /// Operation was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// No authorized protocol client is available
    #[error("client not initialized")]
    NotConnected,

    /// The requested channel does not exist upstream
    #[error("channel not found")]
    ChannelNotFound,

    /// The resolved username belongs to a user or bot
    #[error("specified username is not a channel")]
    NotAChannel,

    /// No target with the given id
    #[error("target not found: {id}")]
    TargetNotFound { id: uuid::Uuid },

    /// Topic ids were supplied for a target that is not a forum
    #[error("topic_ids can only be used with TG_FORUM targets")]
    TopicsForForumOnly,

    /// At least one topic id is missing from the forum
    #[error("one or more topic_ids not found in the forum")]
    TopicNotFound,

    /// Request failed validation
    #[error("{reason}")]
    Validation { reason: String },

    /// Remote protocol failure
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Storage operation failed
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Event publication failed
    #[error("publish error: {0}")]
    Publish(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// JSON encode/decode failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),
}

impl CollectorError {
    /// Shorthand for a validation failure.
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// Whether this error came from a cancelled operation.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::LoginCancelled | Self::Protocol(ProtocolError::Cancelled)
        )
    }
}

/// Errors reported by a remote protocol client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Server asked us to back off for the given number of seconds
    #[error("FLOOD_WAIT_{seconds}")]
    FloodWait { seconds: u64 },

    /// Username did not resolve
    #[error("channel not found")]
    ChannelNotFound,

    /// Username resolved to a non-channel peer
    #[error("not a channel")]
    NotAChannel,

    /// Session is missing or was rejected
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Call abandoned through its cancellation token
    #[error("cancelled")]
    Cancelled,

    /// Any other RPC failure, carrying the server's message
    #[error("rpc error: {0}")]
    Rpc(String),
}

impl ProtocolError {
    /// Server-requested backoff carried by this error, if any.
    ///
    /// Clients that only surface raw RPC messages are covered too: any
    /// message containing `FLOOD_WAIT_<n>` yields `n`.
    pub fn flood_wait(&self) -> Option<u64> {
        match self {
            Self::FloodWait { seconds } => Some(*seconds),
            Self::Rpc(message) => parse_flood_wait(message),
            _ => None,
        }
    }
}

/// Extracts the wait seconds from a `FLOOD_WAIT_<n>` marker in `message`.
pub fn parse_flood_wait(message: &str) -> Option<u64> {
    const MARKER: &str = "FLOOD_WAIT_";
    let start = message.find(MARKER)? + MARKER.len();
    let digits: String = message[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Result type alias for collector operations.
pub type Result<T> = std::result::Result<T, CollectorError>;

/// Result type alias for protocol client calls.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;
