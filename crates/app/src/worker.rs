use axum::{extract::State, http::HeaderMap, Json};
use metrics::{counter, histogram};
use serde::Serialize;
use subtle::ConstantTimeEq;
use tracing::{error, info, warn};
use uuid::Uuid;

use everly_storage::FailureOutcome;

use crate::delivery::DeliveryRequest;
use crate::problem::ProblemResponse;
use crate::router::AppState;

const BATCH_LIMIT: u32 = 20;

/// Result of one worker invocation.
#[derive(Debug, Default, Serialize)]
pub struct WorkerSummary {
    pub ok: bool,
    /// Jobs leased in this batch.
    pub taken: usize,
    pub sent: usize,
    pub failed: usize,
    pub requeued: usize,
}

pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<WorkerSummary>, ProblemResponse> {
    authorize(&state, &headers)?;

    if !state.nudges_enabled() {
        return Err(ProblemResponse::service_unavailable(
            "nudge delivery is disabled for this deployment",
        ));
    }

    let summary = run_once(&state).await.map_err(|err| {
        error!(stage = "worker", error = %err, "worker batch failed");
        ProblemResponse::internal("storage_error", "failed to lease nudge batch")
    })?;
    Ok(Json(summary))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ProblemResponse> {
    let provided = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| ProblemResponse::unauthorized("missing bearer token"))?;

    let expected = state.worker_secret();
    if provided.as_bytes().ct_eq(expected.as_ref()).into() {
        Ok(())
    } else {
        Err(ProblemResponse::unauthorized("invalid bearer token"))
    }
}

/// Leases one batch and walks every job to a success or failure
/// transition. Per-job errors are recorded on the job and never abort the
/// rest of the batch.
pub async fn run_once(state: &AppState) -> Result<WorkerSummary, everly_storage::NudgeQueueError> {
    let now = state.now();
    let worker_id = format!("worker-{}", Uuid::new_v4());
    let queue = state.storage().nudge_queue();
    let jobs = queue.dequeue(BATCH_LIMIT, &worker_id, now).await?;
    histogram!("nudge_worker_batch_size").record(jobs.len() as f64);

    let mut summary = WorkerSummary {
        ok: true,
        taken: jobs.len(),
        ..WorkerSummary::default()
    };

    for job in &jobs {
        let request = DeliveryRequest {
            hub_id: job.hub_id.clone(),
            member_id: job.member_id.clone(),
            channel: job.channel,
            message: job.message.clone(),
            variables: job.variables.clone(),
        };

        match state.provider().send(&request).await {
            Ok(()) => {
                let now = state.now();
                if let Err(err) = queue.mark_success(job, now).await {
                    error!(
                        stage = "worker",
                        job_id = %job.id,
                        error = %err,
                        "failed to record delivery success"
                    );
                    continue;
                }
                counter!("nudge_delivery_total", "outcome" => "sent").increment(1);
                info!(
                    stage = "worker",
                    job_id = %job.id,
                    hub_id = %job.hub_id,
                    member_id = %job.member_id,
                    attempt = job.attempt + 1,
                    "nudge delivered"
                );
                summary.sent += 1;
            }
            Err(send_err) => {
                let now = state.now();
                let detail = send_err.to_string();
                match queue
                    .mark_failure(job, &detail, state.max_retries(), now)
                    .await
                {
                    Ok(FailureOutcome::Terminal) => {
                        counter!("nudge_delivery_total", "outcome" => "terminal").increment(1);
                        warn!(
                            stage = "worker",
                            job_id = %job.id,
                            hub_id = %job.hub_id,
                            attempt = job.attempt + 1,
                            error = %detail,
                            "nudge failed terminally"
                        );
                        summary.failed += 1;
                    }
                    Ok(FailureOutcome::Requeued { available_at }) => {
                        counter!("nudge_delivery_total", "outcome" => "retry").increment(1);
                        warn!(
                            stage = "worker",
                            job_id = %job.id,
                            hub_id = %job.hub_id,
                            attempt = job.attempt + 1,
                            retry_at = %available_at.to_rfc3339(),
                            error = %detail,
                            "nudge delivery failed, requeued"
                        );
                        summary.requeued += 1;
                    }
                    Err(err) => {
                        error!(
                            stage = "worker",
                            job_id = %job.id,
                            error = %err,
                            "failed to record delivery failure"
                        );
                    }
                }
            }
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::{DateTime, Duration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tower::ServiceExt;

    use everly_core::NudgeChannel;
    use everly_storage::NewNudgeJob;

    use crate::delivery::{DeliveryError, DeliveryProvider};
    use crate::router::{app_router, test_state, TEST_WORKER_SECRET};

    struct CountingProvider {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingProvider {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl DeliveryProvider for CountingProvider {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn send(&self, _request: &DeliveryRequest) -> Result<(), DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(DeliveryError::Failed("provider offline".into()))
            } else {
                Ok(())
            }
        }
    }

    async fn enqueue_one(state: &AppState, dedupe_key: &str) {
        let now = state.now();
        state
            .storage()
            .nudge_queue()
            .enqueue(&NewNudgeJob {
                hub_id: "hub-1",
                member_id: "mem-1",
                recipe: "welcome",
                channel: NudgeChannel::Chat,
                message: "hello",
                variables_json: "{}",
                dedupe_key,
                available_at: now,
                created_at: now,
            })
            .await
            .expect("enqueue");
    }

    fn shifting_clock() -> (Arc<Mutex<DateTime<Utc>>>, Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>)
    {
        let current = Arc::new(Mutex::new(Utc::now()));
        let handle = current.clone();
        let clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync> =
            Arc::new(move || *handle.lock().expect("clock lock"));
        (current, clock)
    }

    #[tokio::test]
    async fn successful_delivery_marks_job_sent() {
        let provider = CountingProvider::new(false);
        let state = test_state(None).await.with_provider(provider.clone());
        enqueue_one(&state, "key-success").await;

        let summary = run_once(&state).await.expect("run batch");
        assert_eq!(summary.taken, 1);
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        // The job is terminal; nothing is left to lease.
        let followup = run_once(&state).await.expect("second batch");
        assert_eq!(followup.taken, 0);
    }

    #[tokio::test]
    async fn failing_job_is_retried_to_the_ceiling_then_terminal() {
        let provider = CountingProvider::new(true);
        let (current, clock) = shifting_clock();
        let state = test_state(None)
            .await
            .with_provider(provider.clone())
            .with_clock(clock);
        enqueue_one(&state, "key-retries").await;

        for round in 1..=3 {
            let summary = run_once(&state).await.expect("run batch");
            assert_eq!(summary.taken, 1, "round {round} should lease the job");
            // Push the clock past the longest backoff before the next round.
            let mut now = current.lock().expect("clock lock");
            *now += Duration::minutes(10);
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);

        // Attempt ceiling reached; the job never surfaces again.
        {
            let mut now = current.lock().expect("clock lock");
            *now += Duration::hours(1);
        }
        let summary = run_once(&state).await.expect("final batch");
        assert_eq!(summary.taken, 0);
    }

    #[tokio::test]
    async fn retried_job_is_not_eligible_before_backoff_elapses() {
        let provider = CountingProvider::new(true);
        let (current, clock) = shifting_clock();
        let state = test_state(None)
            .await
            .with_provider(provider.clone())
            .with_clock(clock);
        enqueue_one(&state, "key-backoff").await;

        let first = run_once(&state).await.expect("first batch");
        assert_eq!(first.requeued, 1);

        // One second later the backoff window is still open.
        {
            let mut now = current.lock().expect("clock lock");
            *now += Duration::seconds(1);
        }
        let second = run_once(&state).await.expect("second batch");
        assert_eq!(second.taken, 0);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn worker_endpoint_requires_bearer_token() {
        let state = test_state(None).await;
        let app = app_router(state);

        let unauthorized = Request::builder()
            .method("POST")
            .uri("/api/nudges/worker")
            .body(Body::empty())
            .expect("build request");
        let response = app.clone().oneshot(unauthorized).await.expect("request");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let wrong = Request::builder()
            .method("POST")
            .uri("/api/nudges/worker")
            .header("authorization", "Bearer wrong-token")
            .body(Body::empty())
            .expect("build request");
        let response = app.clone().oneshot(wrong).await.expect("request");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let authorized = Request::builder()
            .method("POST")
            .uri("/api/nudges/worker")
            .header("authorization", format!("Bearer {TEST_WORKER_SECRET}"))
            .body(Body::empty())
            .expect("build request");
        let response = app.oneshot(authorized).await.expect("request");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn disabled_flag_returns_service_unavailable() {
        let state = test_state(None).await.with_nudges_enabled(false);
        let app = app_router(state);

        let request = Request::builder()
            .method("POST")
            .uri("/api/nudges/worker")
            .header("authorization", format!("Bearer {TEST_WORKER_SECRET}"))
            .body(Body::empty())
            .expect("build request");
        let response = app.oneshot(request).await.expect("request");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
