mod delivery;
mod dispatch;
mod mapper;
mod problem;
mod ratelimit;
mod router;
mod tasks;
mod telemetry;
mod webhook;
mod worker;

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use everly_storage::Database;
use everly_util::{load_env_file, AppConfig};

const MAPPER_QUEUE_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;

    let (task_runner, _mapper_handle) = tasks::TaskRunner::spawn(database.clone(), MAPPER_QUEUE_CAPACITY);
    let provider = delivery::provider_by_name(&config.delivery_provider);
    let limiter = Arc::new(ratelimit::SlidingWindowLimiter::new());

    let state = router::AppState::new(
        metrics,
        database,
        config.webhook_secret.map(String::into_bytes),
        config.worker_secret.into_bytes(),
        config.nudges_enabled,
        config.max_retries,
        provider,
        limiter,
        Some(task_runner),
    );

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
