use std::time::Instant;

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use hmac::{Hmac, Mac};
use metrics::{counter, histogram};
use serde_json::{json, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{error, info, warn};

use everly_core::ExternalEvent;

use crate::mapper;
use crate::problem::ProblemResponse;
use crate::router::AppState;
use crate::tasks::MapperTask;

const HEADER_SIGNATURE: &str = "x-whop-signature";
const HEADER_SIGNATURE_ALT: &str = "whop-signature";
const HEADER_HUB_ID: &str = "x-whop-hub-id";

/// Outcome of checking the request signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureCheck {
    Valid,
    /// No signing secret is configured; verification is skipped.
    Bypassed,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SignatureError {
    MissingSignature,
    Mismatch,
}

impl SignatureError {
    fn detail(&self) -> &'static str {
        match self {
            Self::MissingSignature => "request is missing a signature header",
            Self::Mismatch => "signature does not match the request body",
        }
    }
}

pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProblemResponse> {
    let start = Instant::now();
    let result = handle_inner(&state, &headers, &body).await;
    histogram!("webhook_ack_latency_seconds").record(start.elapsed().as_secs_f64());
    result
}

async fn handle_inner(
    state: &AppState,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Response, ProblemResponse> {
    let provided = signature_header(headers);
    let secret = state.webhook_secret();
    match verify_signature(secret.as_deref(), body, provided) {
        Ok(SignatureCheck::Valid) => {}
        Ok(SignatureCheck::Bypassed) => {
            warn!(stage = "ingress", "no webhook secret configured, accepting unsigned request");
        }
        Err(err) => {
            counter!("webhook_invalid_signature_total").increment(1);
            return Err(ProblemResponse::bad_request(
                "invalid_signature",
                err.detail(),
            ));
        }
    }

    let body_string = std::str::from_utf8(body).map_err(|_| {
        ProblemResponse::bad_request("invalid_payload", "request body must be valid UTF-8")
    })?;
    let payload: Value = serde_json::from_str(body_string).map_err(|err| {
        ProblemResponse::bad_request("invalid_json", format!("failed to parse payload: {err}"))
    })?;

    let hub_id = resolve_hub_id(headers, &payload).ok_or_else(|| {
        ProblemResponse::bad_request(
            "missing_hub",
            "unable to resolve hub id from header or payload",
        )
    })?;

    let hub_exists = state.storage().hubs().exists(&hub_id).await.map_err(|err| {
        error!(stage = "ingress", hub_id = %hub_id, error = %err, "failed to look up hub");
        ProblemResponse::internal("storage_error", "failed to look up hub")
    })?;
    if !hub_exists {
        return Err(ProblemResponse::bad_request(
            "missing_hub",
            "hub is not provisioned for webhook ingress",
        ));
    }

    let event = match ExternalEvent::parse(&payload) {
        Ok(event) => event,
        // A malformed event body is acknowledged so the sender stops
        // retrying; the payload is logged for inspection.
        Err(err) => {
            warn!(stage = "ingress", hub_id = %hub_id, error = %err, "discarding unparseable event");
            return Ok(ok_response());
        }
    };

    counter!("webhook_ingress_total", "kind" => event.kind()).increment(1);
    let received_at = state.now();

    let task = MapperTask {
        hub_id: hub_id.clone(),
        event,
        received_at,
    };
    let inline = match state.tasks() {
        Some(runner) => runner.try_submit(task).err(),
        None => Some(task),
    };
    if let Some(task) = inline {
        match mapper::apply_event(state.storage(), &task.hub_id, &task.event, task.received_at)
            .await
        {
            Ok(outcome) => {
                info!(
                    stage = "ingress",
                    hub_id = %task.hub_id,
                    kind = task.event.kind(),
                    outcome = ?outcome,
                    "applied webhook event inline"
                );
            }
            Err(err) => {
                counter!("mapper_failures_total").increment(1);
                error!(
                    stage = "ingress",
                    hub_id = %task.hub_id,
                    kind = task.event.kind(),
                    error = %err,
                    "failed to apply webhook event"
                );
            }
        }
    }

    Ok(ok_response())
}

fn ok_response() -> Response {
    Json(json!({"ok": true})).into_response()
}

fn signature_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(HEADER_SIGNATURE)
        .or_else(|| headers.get(HEADER_SIGNATURE_ALT))
        .and_then(|value| value.to_str().ok())
}

fn resolve_hub_id(headers: &HeaderMap, payload: &Value) -> Option<String> {
    headers
        .get(HEADER_HUB_ID)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
        .or_else(|| {
            payload
                .get("hub_id")
                .and_then(Value::as_str)
                .map(str::to_owned)
        })
}

/// Verifies the HMAC-SHA256 signature over the raw request body.
///
/// A missing secret bypasses verification entirely. The signature header
/// may carry an optional `sha256=` prefix; comparison is constant time.
pub fn verify_signature(
    secret: Option<&[u8]>,
    body: &[u8],
    provided: Option<&str>,
) -> Result<SignatureCheck, SignatureError> {
    let Some(secret) = secret else {
        return Ok(SignatureCheck::Bypassed);
    };
    let provided = provided.ok_or(SignatureError::MissingSignature)?;
    let hex_part = provided.strip_prefix("sha256=").unwrap_or(provided);
    let provided_bytes = hex::decode(hex_part).map_err(|_| SignatureError::Mismatch)?;

    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret).map_err(|_| SignatureError::Mismatch)?;
    mac.update(body);
    let expected = mac.finalize().into_bytes();
    let expected_bytes: &[u8] = expected.as_ref();

    if expected_bytes.ct_eq(provided_bytes.as_slice()).into() {
        Ok(SignatureCheck::Valid)
    } else {
        Err(SignatureError::Mismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::router::{app_router, test_state};

    const SECRET: &[u8] = b"test-webhook-secret";

    fn sign(body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(SECRET).expect("init mac");
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn member_created_body() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": "evt-1",
            "type": "member.created",
            "data": {"id": "mem-1", "display_name": "Casey"}
        }))
        .expect("serialize body")
    }

    fn signed_request(body: Vec<u8>, signature: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/webhooks/whop")
            .header("content-type", "application/json")
            .header(HEADER_SIGNATURE, signature)
            .header(HEADER_HUB_ID, "hub-1")
            .body(Body::from(body))
            .expect("build request")
    }

    #[test]
    fn verify_accepts_matching_signature() {
        let body = b"{}";
        let signature = sign(body);
        assert_eq!(
            verify_signature(Some(SECRET), body, Some(&signature)),
            Ok(SignatureCheck::Valid)
        );
    }

    #[test]
    fn verify_accepts_unprefixed_hex() {
        let body = b"{}";
        let signature = sign(body);
        let bare = signature.strip_prefix("sha256=").unwrap();
        assert_eq!(
            verify_signature(Some(SECRET), body, Some(bare)),
            Ok(SignatureCheck::Valid)
        );
    }

    #[test]
    fn verify_rejects_mismatch_and_garbage() {
        let body = b"{}";
        let other = sign(b"{\"a\":1}");
        assert_eq!(
            verify_signature(Some(SECRET), body, Some(&other)),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify_signature(Some(SECRET), body, Some("not-hex!")),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify_signature(Some(SECRET), body, None),
            Err(SignatureError::MissingSignature)
        );
    }

    #[test]
    fn verify_bypasses_without_secret() {
        assert_eq!(
            verify_signature(None, b"{}", None),
            Ok(SignatureCheck::Bypassed)
        );
    }

    #[tokio::test]
    async fn signed_event_is_accepted_and_applied() {
        let state = test_state(Some(SECRET.to_vec())).await;
        let database = state.storage().clone();
        let app = app_router(state);

        let body = member_created_body();
        let signature = sign(&body);
        let response = app
            .oneshot(signed_request(body, &signature))
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        let json: Value = serde_json::from_slice(&bytes).expect("parse body");
        assert_eq!(json, json!({"ok": true}));

        assert_eq!(
            database.members().count_for_hub("hub-1").await.expect("count"),
            1
        );
    }

    #[tokio::test]
    async fn replayed_event_does_not_duplicate_rows() {
        let state = test_state(Some(SECRET.to_vec())).await;
        let database = state.storage().clone();
        let app = app_router(state);

        let body = serde_json::to_vec(&json!({
            "id": "evt-replay",
            "type": "message.created",
            "data": {"member_id": "mem-1", "body": "hi"}
        }))
        .expect("serialize body");
        let signature = sign(&body);

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(signed_request(body.clone(), &signature))
                .await
                .expect("request");
            assert_eq!(response.status(), StatusCode::OK);
        }

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM activity_events WHERE hub_id = 'hub-1'")
                .fetch_one(database.pool())
                .await
                .expect("count events");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn tampered_body_is_rejected() {
        let state = test_state(Some(SECRET.to_vec())).await;
        let app = app_router(state);

        let mut body = member_created_body();
        let signature = sign(&body);
        body[0] ^= 0x01;

        let response = app
            .oneshot(signed_request(body, &signature))
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_signature_is_rejected() {
        let state = test_state(Some(SECRET.to_vec())).await;
        let app = app_router(state);

        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/whop")
            .header("content-type", "application/json")
            .header(HEADER_HUB_ID, "hub-1")
            .body(Body::from(member_created_body()))
            .expect("build request");
        let response = app.oneshot(request).await.expect("request");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_hub_is_rejected() {
        let state = test_state(Some(SECRET.to_vec())).await;
        let app = app_router(state);

        let body = member_created_body();
        let signature = sign(&body);
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/whop")
            .header("content-type", "application/json")
            .header(HEADER_SIGNATURE, &signature)
            .header(HEADER_HUB_ID, "hub-nope")
            .body(Body::from(body))
            .expect("build request");
        let response = app.oneshot(request).await.expect("request");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn bypass_mode_accepts_unsigned_requests() {
        let state = test_state(None).await;
        let database = state.storage().clone();
        let app = app_router(state);

        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/whop")
            .header("content-type", "application/json")
            .header(HEADER_HUB_ID, "hub-1")
            .body(Body::from(member_created_body()))
            .expect("build request");
        let response = app.oneshot(request).await.expect("request");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            database.members().count_for_hub("hub-1").await.expect("count"),
            1
        );
    }

    #[tokio::test]
    async fn unknown_event_type_is_acknowledged_without_rows() {
        let state = test_state(Some(SECRET.to_vec())).await;
        let database = state.storage().clone();
        let app = app_router(state);

        let body = serde_json::to_vec(&json!({
            "id": "evt-x",
            "type": "refund.created",
            "data": {}
        }))
        .expect("serialize body");
        let signature = sign(&body);
        let response = app
            .oneshot(signed_request(body, &signature))
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            database.members().count_for_hub("hub-1").await.expect("count"),
            0
        );
    }

    #[tokio::test]
    async fn hub_id_falls_back_to_payload() {
        let state = test_state(Some(SECRET.to_vec())).await;
        let database = state.storage().clone();
        let app = app_router(state);

        let body = serde_json::to_vec(&json!({
            "id": "evt-p",
            "type": "member.created",
            "hub_id": "hub-1",
            "data": {"id": "mem-2"}
        }))
        .expect("serialize body");
        let signature = sign(&body);
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/whop")
            .header("content-type", "application/json")
            .header(HEADER_SIGNATURE, &signature)
            .body(Body::from(body))
            .expect("build request");
        let response = app.oneshot(request).await.expect("request");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            database.members().count_for_hub("hub-1").await.expect("count"),
            1
        );
    }
}
