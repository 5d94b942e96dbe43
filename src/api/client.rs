//! Caller-facing API: OpenAI-compatible chat completions plus model listing.
//!
//! Handlers are a thin layer: parse, call the router, hand the decision to
//! the dispatcher, translate the outcome into HTTP. All routing logic lives
//! in [`crate::routing`]; all upstream I/O in [`crate::dispatch`].

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::dispatch::DispatchReport;
use crate::error::AppError;
use crate::routing::RoutingRequest;
use crate::state::GatewayState;
use crate::tags::extract_tags;

/// Build the caller-facing axum router.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/health", get(crate::api::health::health))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .with_state(state)
}

/// `POST /v1/chat/completions` — route, dispatch, relay.
pub async fn chat_completions(
    State(state): State<Arc<GatewayState>>,
    Json(body): Json<Value>,
) -> Result<Response, AppError> {
    let request = RoutingRequest::from_body(&body)?;
    let decision = state.router.route(&request)?;
    let max_attempts = state.router.max_retry_attempts();

    tracing::debug!(
        model = %request.model,
        strategy = %decision.strategy,
        candidates = decision.ranked.len(),
        from_cache = decision.from_cache,
        "routed"
    );

    if request.stream {
        let (stream, report) = state
            .dispatcher
            .dispatch_stream(&decision, &body, max_attempts)
            .await?;

        let response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .header("x-lmr-channel", sanitize_header(&report.channel_id))
            .header("x-lmr-model", sanitize_header(&report.model_id))
            .body(Body::from_stream(stream))
            .map_err(anyhow::Error::from)?;
        Ok(response)
    } else {
        let (upstream, report) = state
            .dispatcher
            .dispatch(&decision, &body, max_attempts)
            .await?;
        Ok(buffered_response(upstream, &report))
    }
}

fn buffered_response(upstream: Value, report: &DispatchReport) -> Response {
    (
        StatusCode::OK,
        [
            ("x-lmr-channel", sanitize_header(&report.channel_id)),
            ("x-lmr-model", sanitize_header(&report.model_id)),
            ("x-lmr-latency-ms", report.latency_ms.to_string()),
        ],
        Json(upstream),
    )
        .into_response()
}

fn sanitize_header(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_graphic() || *c == ' ')
        .collect()
}

/// `GET /v1/models` — canonical model ids plus `tag:` virtual ids.
pub async fn list_models(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let router = &state.router;

    let mut models: BTreeSet<String> = BTreeSet::new();
    let mut tags: BTreeSet<String> = BTreeSet::new();

    for channel in router.registry.get_enabled() {
        if channel.model_name != "auto" {
            models.insert(channel.model_name.clone());
        }
        for tag in &channel.tags {
            if !tag.is_empty() {
                tags.insert(tag.to_lowercase());
            }
        }
    }

    for snapshot in router.catalog.iter_snapshots() {
        if !router.registry.is_enabled(&snapshot.channel_id) {
            continue;
        }
        for model in &snapshot.models {
            models.insert(model.clone());
            for tag in extract_tags(model) {
                tags.insert(tag);
            }
        }
    }

    let data: Vec<Value> = models
        .iter()
        .map(|id| json!({ "id": id, "object": "model", "owned_by": "lm-router" }))
        .chain(tags.iter().map(|tag| {
            json!({ "id": format!("tag:{tag}"), "object": "model", "owned_by": "virtual" })
        }))
        .collect();

    Json(json!({ "object": "list", "data": data }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::state_for;
    use axum::http::Request;
    use tower::ServiceExt;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn send(
        app: Router,
        body: Value,
    ) -> (StatusCode, axum::http::HeaderMap, Value) {
        let response = app
            .oneshot(
                Request::post("/v1/chat/completions")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, headers, value)
    }

    // -----------------------------------------------------------------------
    // End-to-end over HTTP
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn chat_completion_routes_and_proxies() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({ "model": "gpt-4o" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "choices": [{ "index": 0, "message": { "role": "assistant", "content": "hello" }, "finish_reason": "stop" }],
            })))
            .expect(1)
            .mount(&server)
            .await;

        let state = state_for(&server.uri(), &["gpt-4o"]);
        let app = router(state);

        let (status, headers, body) = send(
            app,
            json!({
                "model": "gpt-4o",
                "messages": [{ "role": "user", "content": "hi" }],
                "routing_strategy": "balanced",
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["choices"][0]["message"]["content"], "hello");
        assert_eq!(headers["x-lmr-channel"], "c1");
        assert_eq!(headers["x-lmr-model"], "gpt-4o");
    }

    #[tokio::test]
    async fn unknown_model_returns_503() {
        let server = MockServer::start().await;
        let state = state_for(&server.uri(), &["gpt-4o"]);
        let (status, _, body) = send(
            router(state),
            json!({ "model": "never-heard-of-it", "messages": [] }),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["kind"], "no_candidates");
    }

    #[tokio::test]
    async fn missing_model_field_returns_400() {
        let server = MockServer::start().await;
        let state = state_for(&server.uri(), &["gpt-4o"]);
        let (status, _, body) = send(router(state), json!({ "messages": [] })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "request_malformed");
    }

    #[tokio::test]
    async fn tag_miss_returns_503_with_suggestions_shape() {
        let server = MockServer::start().await;
        let state = state_for(&server.uri(), &["claude-3-haiku"]);
        let (status, _, body) = send(
            router(state),
            json!({ "model": "tag:totally-unknown", "messages": [] }),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["kind"], "tag_not_found");
    }

    #[tokio::test]
    async fn upstream_exhaustion_returns_502_with_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let state = state_for(&server.uri(), &["gpt-4o"]);
        let (status, _, body) = send(
            router(state),
            json!({ "model": "gpt-4o", "messages": [] }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"]["kind"], "all_candidates_failed");
        assert!(body["error"]["attempts"].is_array());
    }

    // -----------------------------------------------------------------------
    // Streaming
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn streaming_request_returns_event_stream() {
        let sse = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\ndata: [DONE]\n\n";
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse),
            )
            .mount(&server)
            .await;

        let state = state_for(&server.uri(), &["gpt-4o"]);
        let response = router(state)
            .oneshot(
                Request::post("/v1/chat/completions")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({ "model": "gpt-4o", "messages": [], "stream": true }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/event-stream");
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.ends_with("data: [DONE]\n\n"));
    }

    // -----------------------------------------------------------------------
    // Model listing
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn model_listing_includes_physical_and_tag_ids() {
        let server = MockServer::start().await;
        let state = state_for(&server.uri(), &["claude-3-haiku-20240307"]);

        let response = router(state)
            .oneshot(Request::get("/v1/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        let ids: Vec<&str> = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|m| m["id"].as_str())
            .collect();

        assert!(ids.contains(&"claude-3-haiku-20240307"));
        assert!(ids.contains(&"tag:claude"));
        assert!(ids.contains(&"tag:claude-3-haiku"), "date-stripped segment tag missing");
    }

    // -----------------------------------------------------------------------
    // Health endpoint
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn health_reports_component_counts() {
        let server = MockServer::start().await;
        let state = state_for(&server.uri(), &["gpt-4o"]);

        let response = router(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["snapshots"], 1);
        assert_eq!(body["channels_enabled"], 1);
        assert!(body["cache"].is_object());
    }
}
