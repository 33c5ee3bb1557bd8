use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Errors that can occur while parsing an inbound platform event.
#[derive(Debug, Error)]
pub enum EventParseError {
    #[error("missing event type in payload")]
    MissingType,
    #[error("missing event id in payload")]
    MissingEventId,
    #[error("missing data block in payload")]
    MissingData,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("failed to parse payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid timestamp for field '{field}': {source}")]
    InvalidTimestamp {
        field: &'static str,
        source: chrono::ParseError,
    },
}

/// Closed set of platform events the pipeline reacts to.
///
/// Event types outside this set parse into [`ExternalEvent::Unknown`] so new
/// upstream kinds flow through as a no-op instead of an error.
#[derive(Debug, Clone, PartialEq)]
pub enum ExternalEvent {
    MemberCreated {
        external_event_id: String,
        member_external_id: String,
        display_name: Option<String>,
        email: Option<String>,
        joined_at: Option<DateTime<Utc>>,
    },
    MessageCreated {
        external_event_id: String,
        member_external_id: Option<String>,
        occurred_at: Option<DateTime<Utc>>,
        payload: Value,
    },
    PaymentSucceeded {
        external_event_id: String,
        member_external_id: Option<String>,
        occurred_at: Option<DateTime<Utc>>,
        payload: Value,
    },
    BountyCompleted {
        external_event_id: String,
        member_external_id: String,
        bounty_id: Option<String>,
        occurred_at: Option<DateTime<Utc>>,
    },
    Unknown {
        event_type: String,
    },
}

impl ExternalEvent {
    /// Returns the canonical kind string used across logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MemberCreated { .. } => "member.created",
            Self::MessageCreated { .. } => "message.created",
            Self::PaymentSucceeded { .. } => "payment.succeeded",
            Self::BountyCompleted { .. } => "bounty.completed",
            Self::Unknown { .. } => "unknown",
        }
    }

    /// Parses the raw webhook envelope `{"id", "type", "data"}`.
    pub fn parse(payload: &Value) -> Result<Self, EventParseError> {
        let event_type = payload
            .get("type")
            .and_then(Value::as_str)
            .ok_or(EventParseError::MissingType)?;

        match event_type {
            "member.created" => Self::parse_member_created(payload),
            "message.created" => Self::parse_activity(payload, false),
            "payment.succeeded" => Self::parse_activity(payload, true),
            "bounty.completed" | "challenge.completed" => Self::parse_bounty_completed(payload),
            other => Ok(Self::Unknown {
                event_type: other.to_string(),
            }),
        }
    }

    fn parse_member_created(payload: &Value) -> Result<Self, EventParseError> {
        let envelope: Envelope<MemberData> = serde_json::from_value(payload.clone())?;
        let external_event_id = envelope.id.ok_or(EventParseError::MissingEventId)?;
        let data = envelope.data.ok_or(EventParseError::MissingData)?;
        let member_external_id = data.id.ok_or(EventParseError::MissingField("data.id"))?;
        let joined_at = parse_optional_timestamp(data.joined_at.as_deref(), "joined_at")?;

        Ok(Self::MemberCreated {
            external_event_id,
            member_external_id,
            display_name: data.display_name,
            email: data.email,
            joined_at,
        })
    }

    fn parse_activity(payload: &Value, payment: bool) -> Result<Self, EventParseError> {
        let envelope: Envelope<ActivityData> = serde_json::from_value(payload.clone())?;
        let external_event_id = envelope.id.ok_or(EventParseError::MissingEventId)?;
        let data = envelope.data.ok_or(EventParseError::MissingData)?;
        let occurred_at = parse_optional_timestamp(data.occurred_at.as_deref(), "occurred_at")?;
        let body = payload.get("data").cloned().unwrap_or(Value::Null);

        if payment {
            Ok(Self::PaymentSucceeded {
                external_event_id,
                member_external_id: data.member_id,
                occurred_at,
                payload: body,
            })
        } else {
            Ok(Self::MessageCreated {
                external_event_id,
                member_external_id: data.member_id,
                occurred_at,
                payload: body,
            })
        }
    }

    fn parse_bounty_completed(payload: &Value) -> Result<Self, EventParseError> {
        let envelope: Envelope<BountyData> = serde_json::from_value(payload.clone())?;
        let external_event_id = envelope.id.ok_or(EventParseError::MissingEventId)?;
        let data = envelope.data.ok_or(EventParseError::MissingData)?;
        let member_external_id = data
            .member_id
            .ok_or(EventParseError::MissingField("data.member_id"))?;
        let occurred_at = parse_optional_timestamp(data.completed_at.as_deref(), "completed_at")?;

        Ok(Self::BountyCompleted {
            external_event_id,
            member_external_id,
            bounty_id: data.bounty_id,
            occurred_at,
        })
    }
}

fn parse_optional_timestamp(
    raw: Option<&str>,
    field: &'static str,
) -> Result<Option<DateTime<Utc>>, EventParseError> {
    let Some(value) = raw else {
        return Ok(None);
    };
    DateTime::parse_from_rfc3339(value)
        .map(|dt| Some(dt.with_timezone(&Utc)))
        .map_err(|source| EventParseError::InvalidTimestamp { field, source })
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    id: Option<String>,
    #[allow(dead_code)]
    #[serde(rename = "type")]
    event_type: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct MemberData {
    id: Option<String>,
    display_name: Option<String>,
    email: Option<String>,
    joined_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ActivityData {
    member_id: Option<String>,
    #[serde(alias = "sent_at", alias = "paid_at")]
    occurred_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BountyData {
    member_id: Option<String>,
    bounty_id: Option<String>,
    completed_at: Option<String>,
}
