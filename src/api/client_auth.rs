//! Caller authentication for the gateway's own API.
//!
//! The gateway's auth is separate from upstream credentials: callers present
//! `Authorization: Bearer <token>` where the accepted tokens come from the
//! environment variables named in `server.client_keys_env`. With no tokens
//! configured the middleware is a no-op (suitable for loopback-only
//! deployments).

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::state::GatewayState;

pub async fn client_auth_middleware(
    State(state): State<Arc<GatewayState>>,
    req: Request,
    next: Next,
) -> Response {
    if state.client_tokens.is_empty() {
        return next.run(req).await;
    }

    let provided = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if state.client_tokens.iter().any(|t| t == token) => next.run(req).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Bearer realm=\"lm-router\"")],
            "Valid API key required.",
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
        middleware,
        routing::get,
        Router as AxumRouter,
    };
    use tower::ServiceExt;

    use crate::test_support::state_with_tokens;

    fn app(state: Arc<crate::state::GatewayState>) -> AxumRouter {
        AxumRouter::new()
            .route("/", get(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(
                Arc::clone(&state),
                super::client_auth_middleware,
            ))
            .with_state(state)
    }

    #[tokio::test]
    async fn no_tokens_configured_passes_through() {
        let state = state_with_tokens(vec![]);
        let resp = app(state)
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn valid_token_is_accepted() {
        let state = state_with_tokens(vec!["secret-token-1".into()]);
        let resp = app(state)
            .oneshot(
                Request::get("/")
                    .header("authorization", "Bearer secret-token-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn wrong_token_is_rejected() {
        let state = state_with_tokens(vec!["secret-token-1".into()]);
        let resp = app(state)
            .oneshot(
                Request::get("/")
                    .header("authorization", "Bearer nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn missing_token_is_rejected_when_auth_is_on() {
        let state = state_with_tokens(vec!["secret-token-1".into()]);
        let resp = app(state)
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(resp.headers().contains_key("www-authenticate"));
    }
}
