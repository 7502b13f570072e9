//! Range-based message deduplication.
//!
//! Each target keeps one inclusive `[min_id, max_id]` watermark of message
//! ids that have already been processed. Message ids grow monotonically per
//! channel, so the watermark stays tiny no matter how much history is
//! crawled, and it tolerates partial runs and out-of-order backfills:
//! anything outside the window is new, and `extend` only ever widens it.
//!
//! The window alone cannot see gaps left by a crawl that stopped halfway
//! through a backfill. [`MessageFilter::Smart`] closes that hole by also
//! consulting the set of message ids that actually have a job record.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::error::CollectorError;
use crate::types::Message;

/// Inclusive watermark of processed message ids.
///
/// `(0, 0)` means nothing has been processed yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedRange {
    pub min_id: i64,
    pub max_id: i64,
}

impl ParsedRange {
    pub fn new(min_id: i64, max_id: i64) -> Self {
        Self { min_id, max_id }
    }

    pub fn is_empty(&self) -> bool {
        self.min_id == 0 && self.max_id == 0
    }

    /// Whether `id` falls inside a non-empty window.
    pub fn contains(&self, id: i64) -> bool {
        !self.is_empty() && id >= self.min_id && id <= self.max_id
    }

    /// Widen the window to cover `[new_min, new_max]`.
    ///
    /// The first extension of an empty range adopts the new bounds.
    pub fn extend(&mut self, new_min: i64, new_max: i64) {
        if self.is_empty() {
            self.min_id = new_min;
            self.max_id = new_max;
            return;
        }
        self.min_id = self.min_id.min(new_min);
        self.max_id = self.max_id.max(new_max);
    }

    /// Messages strictly outside the window.
    pub fn filter_new(&self, messages: &[Message]) -> Vec<Message> {
        messages
            .iter()
            .filter(|m| !self.contains(m.id))
            .cloned()
            .collect()
    }

    /// Messages outside the window, plus those inside it without a job.
    pub fn filter_new_smart(&self, messages: &[Message], existing: &HashSet<i64>) -> Vec<Message> {
        messages
            .iter()
            .filter(|m| !self.contains(m.id) || !existing.contains(&m.id))
            .cloned()
            .collect()
    }
}

impl fmt::Display for ParsedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min_id, self.max_id)
    }
}

/// How in-range ids are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterPolicy {
    /// Watermark only
    Range,
    /// Watermark plus job-existence check
    #[default]
    Smart,
}

impl FromStr for FilterPolicy {
    type Err = CollectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "range" => Ok(Self::Range),
            "smart" => Ok(Self::Smart),
            other => Err(CollectorError::Config(format!(
                "unknown filter policy: {other}"
            ))),
        }
    }
}

/// A watermark paired with the evidence a policy needs.
#[derive(Debug, Clone)]
pub enum MessageFilter {
    Range(ParsedRange),
    Smart {
        range: ParsedRange,
        existing: HashSet<i64>,
    },
}

impl MessageFilter {
    /// Whether `message` has not been processed yet.
    pub fn is_new(&self, message: &Message) -> bool {
        match self {
            Self::Range(range) => !range.contains(message.id),
            Self::Smart { range, existing } => {
                !range.contains(message.id) || !existing.contains(&message.id)
            }
        }
    }

    /// The new messages in `messages`, in input order. Never `None`.
    pub fn filter(&self, messages: &[Message]) -> Vec<Message> {
        match self {
            Self::Range(range) => range.filter_new(messages),
            Self::Smart { range, existing } => range.filter_new_smart(messages, existing),
        }
    }

    pub fn range(&self) -> ParsedRange {
        match self {
            Self::Range(range) | Self::Smart { range, .. } => *range,
        }
    }
}
