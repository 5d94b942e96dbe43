//! Provider adapters: protocol translation at the edge.
//!
//! Everything inside the router speaks OpenAI's chat-completions schema. An
//! [`Adapter`] owns the differences for one upstream protocol:
//!
//! - `transform_request` — canonical body → provider wire body;
//! - `transform_response` — provider body → canonical body;
//! - `stream_parse` — one SSE `data:` payload → canonical stream action;
//! - `auth_headers` — credential attachment per the provider's auth scheme;
//! - `classify_error` — HTTP failure → [`RouteError`] kind.
//!
//! [`select_adapter`] picks an adapter by declared [`ProviderKind`] first,
//! then by base-URL heuristics (`openrouter.ai` → openrouter,
//! `anthropic.com` → anthropic), defaulting to openai-compatible.

mod anthropic;
mod openai;
mod openrouter;

pub use anthropic::AnthropicAdapter;
pub use openai::OpenAIAdapter;
pub use openrouter::OpenRouterAdapter;

use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;

use crate::config::{AuthScheme, Provider, ProviderKind};
use crate::error::RouteError;

/// Request-scoped facts an adapter may need while translating.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    /// Physical model id to send upstream.
    pub model: String,
    /// Active strategy name (drives OpenRouter's price-sort hint).
    pub strategy: String,
    pub stream: bool,
    /// `openrouter_*` passthrough fields from the caller, suffix-keyed
    /// (`openrouter_sort: "price"` arrives here as `sort`).
    pub vendor_extra: serde_json::Map<String, Value>,
}

/// What to do with one parsed SSE `data:` payload.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamAction {
    /// Emit this canonical chunk to the caller.
    Emit(Value),
    /// Terminal event — emit `data: [DONE]` and close.
    Done,
    /// Bookkeeping event with nothing to forward.
    Ignore,
}

pub trait Adapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Chat-completion endpoint under a base URL.
    fn chat_endpoint(&self, base_url: &str) -> String;

    /// Model-listing endpoint under a base URL.
    fn models_endpoint(&self, base_url: &str) -> String;

    /// Canonical body → provider wire body. `body` has already been stripped
    /// of router extension fields and carries the resolved model id.
    fn transform_request(&self, body: Value, ctx: &DispatchContext) -> Value;

    /// Provider response body → canonical chat-completion body.
    fn transform_response(&self, response: Value) -> Result<Value, RouteError>;

    /// Does the upstream already emit OpenAI-shaped SSE? When true the
    /// dispatcher relays bytes verbatim and `stream_parse` is never called.
    fn native_sse(&self) -> bool {
        true
    }

    /// Translate one SSE `data:` payload. Only called when `native_sse()` is
    /// false.
    fn stream_parse(&self, _data: &str, _model: &str) -> StreamAction {
        StreamAction::Ignore
    }

    /// Attach credentials per the provider's auth scheme. The default covers
    /// bearer / api-key / named-header; adapters add vendor extras on top.
    fn auth_headers(&self, provider: &Provider, api_key: &str, headers: &mut HeaderMap) {
        attach_credential(provider, api_key, headers);
    }

    /// Classify an upstream HTTP failure. The default mapping covers the
    /// common cases; adapters refine where vendors deviate.
    fn classify_error(&self, status: u16, body: &str) -> RouteError {
        classify_by_status(status, body)
    }
}

/// Shared credential attachment. Panics on non-ASCII keys would only fire at
/// dispatch construction, so invalid secrets surface as a classified error
/// instead: bad header values are skipped and the upstream's 401 takes over.
pub(crate) fn attach_credential(provider: &Provider, api_key: &str, headers: &mut HeaderMap) {
    if api_key.is_empty() {
        return;
    }
    match provider.auth {
        AuthScheme::Bearer => {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {api_key}")) {
                headers.insert(reqwest::header::AUTHORIZATION, value);
            }
        }
        AuthScheme::ApiKey => {
            if let Ok(value) = HeaderValue::from_str(api_key) {
                headers.insert("x-api-key", value);
            }
        }
        AuthScheme::Header => {
            let name = provider.auth_header.as_deref().unwrap_or("x-api-key");
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(api_key),
            ) {
                headers.insert(name, value);
            }
        }
    }
}

pub(crate) fn classify_by_status(status: u16, body: &str) -> RouteError {
    match status {
        401 | 403 => RouteError::AuthInvalid,
        429 => RouteError::RateLimited,
        400 | 404 | 422 => RouteError::RequestMalformed {
            detail: truncate(body, 300),
        },
        s if s >= 500 => RouteError::UpstreamServerError { status: s },
        s => RouteError::UpstreamServerError { status: s },
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &text[..end])
    }
}

/// Pick an adapter: declared kind wins, then base-URL heuristics, then the
/// openai-compatible default.
pub fn select_adapter(kind: ProviderKind, base_url: &str) -> &'static dyn Adapter {
    static OPENAI: OpenAIAdapter = OpenAIAdapter;
    static ANTHROPIC: AnthropicAdapter = AnthropicAdapter;
    static OPENROUTER: OpenRouterAdapter = OpenRouterAdapter;

    match kind {
        ProviderKind::Anthropic => &ANTHROPIC,
        ProviderKind::OpenRouter => &OPENROUTER,
        ProviderKind::Siliconflow => &OPENAI,
        ProviderKind::OpenAI => {
            let lower = base_url.to_lowercase();
            if lower.contains("openrouter.ai") {
                &OPENROUTER
            } else if lower.contains("anthropic.com") {
                &ANTHROPIC
            } else {
                &OPENAI
            }
        }
    }
}
