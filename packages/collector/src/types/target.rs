//! Scraping targets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::CollectorError;

/// Kind of source a target points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetType {
    TgChannel,
    TgGroup,
    TgForum,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TgChannel => "TG_CHANNEL",
            Self::TgGroup => "TG_GROUP",
            Self::TgForum => "TG_FORUM",
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetType {
    type Err = CollectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TG_CHANNEL" => Ok(Self::TgChannel),
            "TG_GROUP" => Ok(Self::TgGroup),
            "TG_FORUM" => Ok(Self::TgForum),
            other => Err(CollectorError::validation(format!(
                "unknown target type: {other}"
            ))),
        }
    }
}

/// A persisted source of messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub target_type: TargetType,
    /// Channel username without a leading `@`
    pub url: String,

    pub tg_channel_id: Option<i64>,
    pub tg_access_hash: Option<i64>,

    pub last_scraped_at: Option<DateTime<Utc>>,
    pub last_message_id: Option<i64>,
    pub is_active: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields needed to create a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTarget {
    pub name: String,
    pub target_type: TargetType,
    pub url: String,
}

impl NewTarget {
    /// A channel target named after its username.
    pub fn channel(username: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            name: username.clone(),
            target_type: TargetType::TgChannel,
            url: username,
        }
    }

    /// Materialize into a stored target.
    pub fn into_target(self) -> Target {
        let now = Utc::now();
        Target {
            id: Uuid::new_v4(),
            name: self.name,
            target_type: self.target_type,
            url: self.url,
            tg_channel_id: None,
            tg_access_hash: None,
            last_scraped_at: None,
            last_message_id: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}
