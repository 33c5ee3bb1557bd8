use chrono::{DateTime, Utc};
use metrics::counter;
use thiserror::Error;
use tracing::debug;

use everly_core::ExternalEvent;
use everly_storage::{
    Database, EventError, MemberError, NewActivityEvent, NewBountyEvent, UpsertMember,
};

/// Result of applying one platform event to storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapperOutcome {
    /// The event produced a new write.
    Applied,
    /// The external event id was seen before; storage is unchanged.
    AlreadyApplied,
    /// The event kind carries no mapping; nothing was written.
    Ignored,
}

#[derive(Debug, Error)]
pub enum MapperError {
    #[error("hub is not provisioned")]
    MissingHub,
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<MemberError> for MapperError {
    fn from(value: MemberError) -> Self {
        match value {
            MemberError::MissingHub => Self::MissingHub,
            MemberError::Database(err) => Self::Database(err),
        }
    }
}

impl From<EventError> for MapperError {
    fn from(value: EventError) -> Self {
        match value {
            EventError::MissingHub => Self::MissingHub,
            EventError::Database(err) => Self::Database(err),
        }
    }
}

/// Applies a verified platform event to storage. Replays of the same
/// external event id report [`MapperOutcome::AlreadyApplied`] and leave
/// every table untouched.
pub async fn apply_event(
    database: &Database,
    hub_id: &str,
    event: &ExternalEvent,
    received_at: DateTime<Utc>,
) -> Result<MapperOutcome, MapperError> {
    let outcome = match event {
        ExternalEvent::MemberCreated {
            member_external_id,
            display_name,
            email,
            joined_at,
            ..
        } => {
            database
                .members()
                .upsert(&UpsertMember {
                    hub_id,
                    external_id: member_external_id,
                    display_name: display_name.as_deref(),
                    email: email.as_deref(),
                    joined_at: joined_at.unwrap_or(received_at),
                    updated_at: received_at,
                })
                .await?;
            MapperOutcome::Applied
        }
        ExternalEvent::MessageCreated {
            external_event_id,
            member_external_id,
            occurred_at,
            payload,
        } => {
            let payload_json = payload.to_string();
            let inserted = database
                .activity_events()
                .insert(&NewActivityEvent {
                    hub_id,
                    external_event_id,
                    member_external_id: member_external_id.as_deref(),
                    kind: "message",
                    payload_json: &payload_json,
                    occurred_at: occurred_at.unwrap_or(received_at),
                    received_at,
                })
                .await?;
            if inserted.is_duplicate() {
                MapperOutcome::AlreadyApplied
            } else {
                MapperOutcome::Applied
            }
        }
        ExternalEvent::PaymentSucceeded {
            external_event_id,
            member_external_id,
            occurred_at,
            payload,
        } => {
            let payload_json = payload.to_string();
            let inserted = database
                .activity_events()
                .insert(&NewActivityEvent {
                    hub_id,
                    external_event_id,
                    member_external_id: member_external_id.as_deref(),
                    kind: "payment",
                    payload_json: &payload_json,
                    occurred_at: occurred_at.unwrap_or(received_at),
                    received_at,
                })
                .await?;
            if inserted.is_duplicate() {
                MapperOutcome::AlreadyApplied
            } else {
                MapperOutcome::Applied
            }
        }
        ExternalEvent::BountyCompleted {
            external_event_id,
            member_external_id,
            bounty_id,
            occurred_at,
        } => {
            let inserted = database
                .bounty_events()
                .insert(&NewBountyEvent {
                    hub_id,
                    external_event_id,
                    member_external_id,
                    bounty_id: bounty_id.as_deref(),
                    occurred_at: occurred_at.unwrap_or(received_at),
                    received_at,
                })
                .await?;
            if inserted.is_duplicate() {
                MapperOutcome::AlreadyApplied
            } else {
                MapperOutcome::Applied
            }
        }
        ExternalEvent::Unknown { event_type } => {
            debug!(hub_id = %hub_id, kind = %event_type, "ignoring unmapped event type");
            MapperOutcome::Ignored
        }
    };

    counter!("mapper_events_total", "kind" => event.kind()).increment(1);
    Ok(outcome)
}
