//! Error types for the routing core and the HTTP surface.
//!
//! [`RouteError`] is the routing core's discriminated error value: one variant
//! per failure kind, carrying structured details. Control flow dispatches on
//! the kind — the dispatcher's retry policy calls [`RouteError::is_retryable`]
//! and the HTTP layer calls [`RouteError::status`] — rather than matching on
//! message strings.
//!
//! [`AppError`] wraps either a [`RouteError`] (mapped status) or any
//! `anyhow::Error` (500) so axum handlers can return `Result<T, AppError>`
//! and propagate with `?`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// One dispatch attempt that failed, recorded for the 502 surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FailedAttempt {
    pub channel_id: String,
    pub model: String,
    pub kind: String,
}

/// Discriminated routing/dispatch error.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// A tag query matched nothing.
    #[error("no models match tags {tags:?}")]
    TagNotFound {
        tags: Vec<String>,
        /// Tags that exist in the registry and resemble the query — surfaced
        /// in the error body so callers can self-correct.
        suggestions: Vec<String>,
    },

    /// A parameter-size predicate failed to parse or matched nothing.
    #[error("parameter comparison `{query}` failed: {reason}")]
    ParameterComparisonFailed { query: String, reason: String },

    /// A plain-name query matched nothing.
    #[error("no candidate channels for model `{model}`")]
    NoCandidates { model: String },

    /// Every candidate lacks a required capability.
    #[error("no candidate supports required capabilities {missing:?}")]
    CapabilityMismatch { missing: Vec<String> },

    /// Upstream rejected the credential (401/403).
    #[error("upstream rejected credentials")]
    AuthInvalid,

    /// Upstream returned 429.
    #[error("upstream rate limited")]
    RateLimited,

    /// Upstream network timeout.
    #[error("upstream timed out")]
    UpstreamTimeout,

    /// Upstream 5xx.
    #[error("upstream server error (HTTP {status})")]
    UpstreamServerError { status: u16 },

    /// Upstream 400 with an identifiable cause — not retryable.
    #[error("upstream rejected request: {detail}")]
    RequestMalformed { detail: String },

    /// Every dispatch attempt failed; carries the attempt trail.
    #[error("all {} dispatch attempts failed", attempts.len())]
    AllCandidatesFailed { attempts: Vec<FailedAttempt> },

    /// Startup-time configuration problem. Never produced on the request path.
    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl RouteError {
    /// Short stable name for logs, blacklist entries, and error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TagNotFound { .. } => "tag_not_found",
            Self::ParameterComparisonFailed { .. } => "parameter_comparison_failed",
            Self::NoCandidates { .. } => "no_candidates",
            Self::CapabilityMismatch { .. } => "capability_mismatch",
            Self::AuthInvalid => "auth_invalid",
            Self::RateLimited => "rate_limited",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::UpstreamServerError { .. } => "upstream_server_error",
            Self::RequestMalformed { .. } => "request_malformed",
            Self::AllCandidatesFailed { .. } => "all_candidates_failed",
            Self::ConfigError(_) => "config_error",
        }
    }

    /// May the dispatcher try the next-ranked candidate after this failure?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AuthInvalid
                | Self::RateLimited
                | Self::UpstreamTimeout
                | Self::UpstreamServerError { .. }
        )
    }

    /// HTTP status this error surfaces as.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::TagNotFound { .. }
            | Self::NoCandidates { .. }
            | Self::CapabilityMismatch { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::ParameterComparisonFailed { reason, .. } => {
                // Unparsable predicate is the caller's fault; an empty cache
                // is ours.
                if reason.contains("cache") {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::BAD_REQUEST
                }
            }
            Self::RequestMalformed { .. } => StatusCode::BAD_REQUEST,
            Self::AllCandidatesFailed { .. } => StatusCode::BAD_GATEWAY,
            Self::AuthInvalid
            | Self::RateLimited
            | Self::UpstreamTimeout
            | Self::UpstreamServerError { .. } => StatusCode::BAD_GATEWAY,
            Self::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Structured JSON body for the HTTP surface.
    pub fn body(&self) -> serde_json::Value {
        let mut body = json!({
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
            }
        });
        match self {
            Self::TagNotFound { suggestions, .. } if !suggestions.is_empty() => {
                body["error"]["suggestions"] = json!(suggestions);
            }
            Self::AllCandidatesFailed { attempts } => {
                body["error"]["attempts"] = json!(attempts);
            }
            _ => {}
        }
        body
    }
}

/// Wraps errors so they can be returned from axum handlers.
///
/// [`RouteError`] keeps its status mapping; anything else is a 500. The
/// blanket `From<anyhow::Error>` means handlers can use `?` on both.
#[derive(Debug)]
pub enum AppError {
    Route(RouteError),
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            Self::Route(e) => {
                tracing::warn!(kind = e.kind(), error = %e, "routing error");
                (e.status(), Json(e.body())).into_response()
            }
            Self::Internal(e) => {
                tracing::warn!(error = %e, "handler error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": { "kind": "internal", "message": e.to_string() } })),
                )
                    .into_response()
            }
        }
    }
}

impl From<RouteError> for AppError {
    fn from(e: RouteError) -> Self {
        Self::Route(e)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e)
    }
}
