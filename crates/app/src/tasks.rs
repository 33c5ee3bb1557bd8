use chrono::{DateTime, Utc};
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use everly_core::ExternalEvent;
use everly_storage::Database;

use crate::mapper;

/// A verified webhook event waiting to be applied to storage.
#[derive(Debug)]
pub struct MapperTask {
    pub hub_id: String,
    pub event: ExternalEvent,
    pub received_at: DateTime<Utc>,
}

/// Bounded background queue for event mapping. Webhook handlers submit
/// tasks here so the HTTP response does not wait on storage writes.
#[derive(Clone)]
pub struct TaskRunner {
    tx: mpsc::Sender<MapperTask>,
}

impl TaskRunner {
    /// Spawns the mapper loop. The returned handle completes when the
    /// runner is dropped and the channel drains.
    pub fn spawn(database: Database, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<MapperTask>(capacity);
        let handle = tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                match mapper::apply_event(&database, &task.hub_id, &task.event, task.received_at)
                    .await
                {
                    Ok(_) => {}
                    Err(err) => {
                        counter!("mapper_failures_total").increment(1);
                        error!(
                            hub_id = %task.hub_id,
                            kind = task.event.kind(),
                            error = %err,
                            "failed to apply webhook event"
                        );
                    }
                }
            }
        });
        (Self { tx }, handle)
    }

    /// Attempts to queue a task without waiting. Returns the task back to
    /// the caller when the channel is full or closed, so the caller can
    /// apply it inline.
    pub fn try_submit(&self, task: MapperTask) -> Result<(), MapperTask> {
        match self.tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(task)) => {
                warn!("mapper queue full, applying event inline");
                Err(task)
            }
            Err(mpsc::error::TrySendError::Closed(task)) => {
                warn!("mapper queue closed, applying event inline");
                Err(task)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration as StdDuration;

    async fn test_database() -> Database {
        crate::router::test_database().await
    }

    #[tokio::test]
    async fn background_runner_applies_member_created() {
        let database = test_database().await;
        database
            .hubs()
            .create("hub-1", "Test Hub", Utc::now())
            .await
            .expect("create hub");

        let (runner, _handle) = TaskRunner::spawn(database.clone(), 8);
        let event = ExternalEvent::parse(&serde_json::json!({
            "id": "evt-1",
            "type": "member.created",
            "data": {"id": "member-1", "display_name": "ada"}
        }))
        .expect("parse event");

        runner
            .try_submit(MapperTask {
                hub_id: "hub-1".into(),
                event,
                received_at: Utc::now(),
            })
            .expect("submit task");

        // The runner applies the task asynchronously; poll until visible.
        let mut applied = false;
        for _ in 0..50 {
            let count = database
                .members()
                .count_for_hub("hub-1")
                .await
                .expect("count members");
            if count == 1 {
                applied = true;
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        assert!(applied, "mapper task was not applied within timeout");
    }

    #[tokio::test]
    async fn full_channel_returns_task_to_caller() {
        let database = test_database().await;
        let (runner, handle) = TaskRunner::spawn(database.clone(), 1);
        // Stop the consumer so the channel stays full.
        handle.abort();
        let _ = handle.await;

        let make_task = || MapperTask {
            hub_id: "hub-1".into(),
            event: ExternalEvent::Unknown {
                event_type: "noop".into(),
            },
            received_at: Utc::now(),
        };

        // First submit fills the single slot (or fails closed); either way
        // a follow-up submit must hand the task back.
        let _ = runner.try_submit(make_task());
        assert!(runner.try_submit(make_task()).is_err());
    }
}
