use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tracing::error;

use everly_storage::Database;

use crate::delivery::DeliveryProvider;
use crate::problem::ProblemResponse;
use crate::ratelimit::RateLimiter;
use crate::tasks::TaskRunner;
use crate::{dispatch, telemetry, webhook, worker};

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    webhook_secret: Option<Arc<[u8]>>,
    worker_secret: Arc<[u8]>,
    nudges_enabled: bool,
    max_retries: u32,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    provider: Arc<dyn DeliveryProvider>,
    limiter: Arc<dyn RateLimiter>,
    tasks: Option<TaskRunner>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        webhook_secret: Option<Vec<u8>>,
        worker_secret: Vec<u8>,
        nudges_enabled: bool,
        max_retries: u32,
        provider: Arc<dyn DeliveryProvider>,
        limiter: Arc<dyn RateLimiter>,
        tasks: Option<TaskRunner>,
    ) -> Self {
        let clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync> = Arc::new(Utc::now);
        Self {
            metrics,
            storage,
            webhook_secret: webhook_secret.map(|secret| Arc::from(secret.into_boxed_slice())),
            worker_secret: Arc::from(worker_secret.into_boxed_slice()),
            nudges_enabled,
            max_retries,
            clock,
            provider,
            limiter,
            tasks,
        }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn webhook_secret(&self) -> Option<Arc<[u8]>> {
        self.webhook_secret.clone()
    }

    pub fn worker_secret(&self) -> Arc<[u8]> {
        self.worker_secret.clone()
    }

    pub fn nudges_enabled(&self) -> bool {
        self.nudges_enabled
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn provider(&self) -> &Arc<dyn DeliveryProvider> {
        &self.provider
    }

    pub fn limiter(&self) -> &Arc<dyn RateLimiter> {
        &self.limiter
    }

    pub fn tasks(&self) -> Option<&TaskRunner> {
        self.tasks.as_ref()
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    #[cfg(test)]
    pub fn with_provider(mut self, provider: Arc<dyn DeliveryProvider>) -> Self {
        self.provider = provider;
        self
    }

    #[cfg(test)]
    pub fn with_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    #[cfg(test)]
    pub fn with_nudges_enabled(mut self, enabled: bool) -> Self {
        self.nudges_enabled = enabled;
        self
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/webhooks/whop", post(webhook::handle))
        .route("/api/nudges/dispatch", post(dispatch::handle))
        .route("/api/nudges/worker", post(worker::handle))
        .route("/api/nudges/log", get(nudge_log))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> Response {
    let body = telemetry::render_metrics(state.metrics());
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

const DEFAULT_LOG_LIMIT: u32 = 50;
const MAX_LOG_LIMIT: u32 = 500;

#[derive(Debug, Deserialize)]
struct LogQuery {
    hub_id: String,
    limit: Option<u32>,
}

#[derive(Debug, Serialize)]
struct LogEntry {
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_id: Option<String>,
    member_id: String,
    recipe: String,
    channel: String,
    status: String,
    message_preview: String,
    attempt: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    scheduled_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sent_at: Option<String>,
}

async fn nudge_log(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Vec<LogEntry>>, ProblemResponse> {
    if query.hub_id.trim().is_empty() {
        return Err(ProblemResponse::bad_request(
            "invalid_request",
            "hub_id must not be blank",
        ));
    }
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LOG_LIMIT)
        .clamp(1, MAX_LOG_LIMIT);

    let rows = state
        .storage()
        .nudge_log()
        .list_for_hub(&query.hub_id, limit)
        .await
        .map_err(|err| {
            error!(stage = "log", hub_id = %query.hub_id, error = %err, "failed to list nudge log");
            ProblemResponse::internal("storage_error", "failed to list nudge log")
        })?;

    let entries = rows
        .into_iter()
        .map(|row| LogEntry {
            id: row.id,
            job_id: row.job_id,
            member_id: row.member_id,
            recipe: row.recipe,
            channel: row.channel,
            status: row.status,
            message_preview: row.message_preview,
            attempt: row.attempt,
            error: row.error,
            scheduled_at: row.scheduled_at.to_rfc3339(),
            sent_at: row.sent_at.map(|at| at.to_rfc3339()),
        })
        .collect();

    Ok(Json(entries))
}

#[cfg(test)]
pub(crate) const TEST_WORKER_SECRET: &str = "test-worker-secret";

/// Builds a ready state over a fresh in-memory database with `hub-1`
/// provisioned. Event mapping runs inline so tests observe writes as soon
/// as the response returns.
#[cfg(test)]
pub(crate) async fn test_state(webhook_secret: Option<Vec<u8>>) -> AppState {
    use crate::delivery::LogDeliveryProvider;
    use crate::ratelimit::SlidingWindowLimiter;
    use everly_core::retry::DEFAULT_MAX_RETRIES;

    let metrics = telemetry::init_metrics().expect("metrics init");
    let database = test_database().await;
    database
        .hubs()
        .create("hub-1", "Test Hub", Utc::now())
        .await
        .expect("create hub");

    AppState::new(
        metrics,
        database,
        webhook_secret,
        TEST_WORKER_SECRET.as_bytes().to_vec(),
        true,
        DEFAULT_MAX_RETRIES,
        Arc::new(LogDeliveryProvider),
        Arc::new(SlidingWindowLimiter::new()),
        None,
    )
}

/// Connects a migrated, uniquely named in-memory database so the pool's
/// connections share data without bleeding across tests.
#[cfg(test)]
pub(crate) async fn test_database() -> Database {
    let url = format!(
        "sqlite:file:app-test-{}?mode=memory&cache=shared",
        uuid::Uuid::new_v4()
    );
    let database = Database::connect(&url).await.expect("connect");
    database.run_migrations().await.expect("migrations");
    database
}
