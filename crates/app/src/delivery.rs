use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use everly_core::NudgeChannel;

/// A rendered nudge handed to a provider for transport.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub hub_id: String,
    pub member_id: String,
    pub channel: NudgeChannel,
    pub message: String,
    pub variables: Map<String, Value>,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("delivery failed: {0}")]
    Failed(String),
}

/// Transport seam for sending nudges. The worker treats any `Err` as a
/// retryable failure; providers must not panic on malformed input.
#[async_trait]
pub trait DeliveryProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, request: &DeliveryRequest) -> Result<(), DeliveryError>;
}

/// Default provider: writes the nudge to the log and reports success.
/// Useful in development and as the fallback when no real transport is
/// configured.
pub struct LogDeliveryProvider;

#[async_trait]
impl DeliveryProvider for LogDeliveryProvider {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, request: &DeliveryRequest) -> Result<(), DeliveryError> {
        info!(
            hub_id = %request.hub_id,
            member_id = %request.member_id,
            channel = request.channel.as_str(),
            message = %request.message,
            "delivering nudge"
        );
        Ok(())
    }
}

/// Resolves a provider from its configured name. Unknown names fall back
/// to the log provider with a warning.
pub fn provider_by_name(name: &str) -> Arc<dyn DeliveryProvider> {
    match name {
        "log" => Arc::new(LogDeliveryProvider),
        other => {
            tracing::warn!(provider = %other, "unknown delivery provider, using log provider");
            Arc::new(LogDeliveryProvider)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_provider_accepts_any_request() {
        let provider = LogDeliveryProvider;
        let request = DeliveryRequest {
            hub_id: "hub-1".into(),
            member_id: "member-1".into(),
            channel: NudgeChannel::Chat,
            message: "hello".into(),
            variables: Map::new(),
        };
        assert!(provider.send(&request).await.is_ok());
        assert_eq!(provider.name(), "log");
    }

    #[test]
    fn unknown_provider_name_falls_back_to_log() {
        let provider = provider_by_name("smoke-signals");
        assert_eq!(provider.name(), "log");
    }
}
