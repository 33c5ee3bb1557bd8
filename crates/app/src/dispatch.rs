use axum::{
    extract::{rejection::JsonRejection, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Duration;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info};

use everly_core::{dedupe_key, template, DedupePeriod, NudgeChannel, RenderedNudge};
use everly_storage::{EnqueueOutcome, NewNudgeJob, NudgeQueueError, SkippedNudge};

use crate::problem::ProblemResponse;
use crate::router::AppState;

const RATE_WINDOW: Duration = Duration::seconds(60);
const MAX_PER_IP: usize = 60;
const MAX_PER_HUB: usize = 30;

/// Inbound dispatch request: one hub, one or more nudges.
#[derive(Debug, Deserialize)]
pub struct DispatchRequest {
    pub hub_id: String,
    pub nudges: Vec<DispatchNudge>,
}

#[derive(Debug, Deserialize)]
pub struct DispatchNudge {
    pub member_id: String,
    pub recipe_name: String,
    pub message: String,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub channel: NudgeChannel,
    #[serde(default)]
    pub period: DedupePeriod,
}

#[derive(Debug, Serialize)]
pub struct DispatchResponse {
    pub enqueued: usize,
    pub skipped: usize,
    pub results: Vec<DispatchResult>,
}

#[derive(Debug, Serialize)]
pub struct DispatchResult {
    pub member_id: String,
    pub recipe_name: String,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<DispatchRequest>, JsonRejection>,
) -> Result<Response, ProblemResponse> {
    if !state.nudges_enabled() {
        return Err(ProblemResponse::service_unavailable(
            "nudge dispatch is disabled for this deployment",
        ));
    }

    let Json(request) = payload.map_err(|rejection| {
        ProblemResponse::bad_request("invalid_request", rejection.body_text())
    })?;

    validate(&request)?;

    let now = state.now();
    let client_ip = client_ip(&headers);
    if !state
        .limiter()
        .check("ip", client_ip, RATE_WINDOW, MAX_PER_IP, now)
    {
        counter!("rate_limited_total", "scope" => "ip").increment(1);
        return Err(ProblemResponse::too_many_requests(
            "too many dispatch requests from this address",
        ));
    }
    if !state
        .limiter()
        .check("hub", &request.hub_id, RATE_WINDOW, MAX_PER_HUB, now)
    {
        counter!("rate_limited_total", "scope" => "hub").increment(1);
        return Err(ProblemResponse::too_many_requests(
            "too many dispatch requests for this hub",
        ));
    }

    let hub_exists = state
        .storage()
        .hubs()
        .exists(&request.hub_id)
        .await
        .map_err(|err| {
            error!(stage = "dispatch", hub_id = %request.hub_id, error = %err, "failed to look up hub");
            ProblemResponse::internal("storage_error", "failed to look up hub")
        })?;
    if !hub_exists {
        return Err(ProblemResponse::not_found(
            "missing_hub",
            "hub is not provisioned for nudge dispatch",
        ));
    }

    let queue = state.storage().nudge_queue();
    let log = state.storage().nudge_log();
    let mut enqueued = 0usize;
    let mut skipped = 0usize;
    let mut results = Vec::with_capacity(request.nudges.len());

    for nudge in &request.nudges {
        let rendered = render_nudge(&request.hub_id, nudge, now);
        let variables_json = Value::Object(rendered.variables.clone()).to_string();
        let outcome = queue
            .enqueue(&NewNudgeJob {
                hub_id: &rendered.hub_id,
                member_id: &rendered.member_id,
                recipe: &rendered.recipe,
                channel: rendered.channel,
                message: &rendered.message,
                variables_json: &variables_json,
                dedupe_key: &rendered.dedupe_key,
                available_at: now,
                created_at: now,
            })
            .await
            .map_err(|err| match err {
                NudgeQueueError::MissingHub => ProblemResponse::not_found(
                    "missing_hub",
                    "hub is not provisioned for nudge dispatch",
                ),
                NudgeQueueError::Database(db_err) => {
                    error!(
                        stage = "dispatch",
                        hub_id = %rendered.hub_id,
                        member_id = %rendered.member_id,
                        error = %db_err,
                        "failed to enqueue nudge"
                    );
                    ProblemResponse::internal("storage_error", "failed to enqueue nudge")
                }
            })?;

        match outcome {
            EnqueueOutcome::Enqueued { job_id, .. } => {
                counter!("nudges_enqueued_total").increment(1);
                info!(
                    stage = "dispatch",
                    hub_id = %rendered.hub_id,
                    member_id = %rendered.member_id,
                    recipe = %rendered.recipe,
                    job_id = %job_id,
                    "nudge enqueued"
                );
                enqueued += 1;
                results.push(DispatchResult {
                    member_id: rendered.member_id,
                    recipe_name: rendered.recipe,
                    outcome: "enqueued",
                    reason: None,
                });
            }
            EnqueueOutcome::Duplicate => {
                counter!("nudges_skipped_total").increment(1);
                if let Err(err) = log
                    .record_skipped(&SkippedNudge {
                        hub_id: &rendered.hub_id,
                        member_id: &rendered.member_id,
                        recipe: &rendered.recipe,
                        channel: rendered.channel,
                        message: &rendered.message,
                        scheduled_at: now,
                    })
                    .await
                {
                    error!(
                        stage = "dispatch",
                        hub_id = %rendered.hub_id,
                        member_id = %rendered.member_id,
                        error = %err,
                        "failed to record skipped nudge"
                    );
                }
                skipped += 1;
                results.push(DispatchResult {
                    member_id: rendered.member_id,
                    recipe_name: rendered.recipe,
                    outcome: "skipped",
                    reason: Some("duplicate"),
                });
            }
        }
    }

    Ok(Json(DispatchResponse {
        enqueued,
        skipped,
        results,
    })
    .into_response())
}

fn validate(request: &DispatchRequest) -> Result<(), ProblemResponse> {
    if request.hub_id.trim().is_empty() {
        return Err(ProblemResponse::bad_request(
            "invalid_request",
            "hub_id must not be blank",
        ));
    }
    if request.nudges.is_empty() {
        return Err(ProblemResponse::bad_request(
            "invalid_request",
            "nudges must contain at least one entry",
        ));
    }
    for nudge in &request.nudges {
        if nudge.member_id.trim().is_empty() {
            return Err(ProblemResponse::bad_request(
                "invalid_request",
                "member_id must not be blank",
            ));
        }
        if nudge.recipe_name.trim().is_empty() {
            return Err(ProblemResponse::bad_request(
                "invalid_request",
                "recipe_name must not be blank",
            ));
        }
        if nudge.message.trim().is_empty() {
            return Err(ProblemResponse::bad_request(
                "invalid_request",
                "message must not be blank",
            ));
        }
    }
    Ok(())
}

fn render_nudge(
    hub_id: &str,
    nudge: &DispatchNudge,
    now: chrono::DateTime<chrono::Utc>,
) -> RenderedNudge {
    let message = template::render(&nudge.message, &nudge.variables);
    let key = dedupe_key(hub_id, &nudge.recipe_name, &nudge.member_id, nudge.period, now);
    RenderedNudge {
        hub_id: hub_id.to_owned(),
        member_id: nudge.member_id.clone(),
        recipe: nudge.recipe_name.clone(),
        channel: nudge.channel,
        message,
        variables: nudge.variables.clone(),
        dedupe_key: key,
    }
}

fn client_ip(headers: &HeaderMap) -> &str {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("unknown")
}
