use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;

/// Delivery channel a nudge is sent through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NudgeChannel {
    Chat,
    Email,
}

impl NudgeChannel {
    /// Returns the canonical database representation for the channel.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Email => "email",
        }
    }
}

impl Default for NudgeChannel {
    fn default() -> Self {
        Self::Chat
    }
}

impl FromStr for NudgeChannel {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "chat" => Ok(Self::Chat),
            "email" => Ok(Self::Email),
            _ => Err(()),
        }
    }
}

/// Queue job status persisted in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Sent,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

/// Status recorded on a nudge log row. Moves forward only: a `queued` row
/// becomes `sent` or `failed`, never the reverse. `skipped` rows are written
/// once at dispatch time when a dedupe collision is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Queued,
    Sent,
    Failed,
    Skipped,
}

impl LogStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl FromStr for LogStatus {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "queued" => Ok(Self::Queued),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(()),
        }
    }
}

/// Fully rendered nudge ready to be enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedNudge {
    pub hub_id: String,
    pub member_id: String,
    pub recipe: String,
    pub channel: NudgeChannel,
    pub message: String,
    pub variables: Map<String, Value>,
    pub dedupe_key: String,
}

/// Domain view of a queue row as returned by a lease dequeue.
#[derive(Debug, Clone, PartialEq)]
pub struct LeasedNudgeJob {
    pub id: String,
    pub hub_id: String,
    pub member_id: String,
    pub recipe: String,
    pub channel: NudgeChannel,
    pub message: String,
    pub variables: Map<String, Value>,
    pub attempt: u32,
    pub available_at: DateTime<Utc>,
    pub log_id: String,
}
