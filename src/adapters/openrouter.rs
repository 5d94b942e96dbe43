//! OpenRouter adapter.
//!
//! OpenRouter speaks the OpenAI wire format, so translation defers to the
//! openai-compatible behaviour. What is specific here:
//!
//! - under a cost-centric strategy the request root gains
//!   `provider: {sort: "price"}` so OpenRouter's own routing agrees with ours;
//! - caller `openrouter_*` passthrough fields land under `provider`;
//! - the recommended `HTTP-Referer` / `X-Title` headers are attached.

use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Value};

use super::{attach_credential, openai::OpenAIAdapter, Adapter, DispatchContext};
use crate::config::Provider;
use crate::error::RouteError;
use crate::routing::scoring::is_cost_centric;

const REFERER: &str = "https://github.com/lm-router/lm-router-rs";
const TITLE: &str = "lm-router";

pub struct OpenRouterAdapter;

impl Adapter for OpenRouterAdapter {
    fn name(&self) -> &'static str {
        "openrouter"
    }

    fn chat_endpoint(&self, base_url: &str) -> String {
        OpenAIAdapter.chat_endpoint(base_url)
    }

    fn models_endpoint(&self, base_url: &str) -> String {
        OpenAIAdapter.models_endpoint(base_url)
    }

    fn transform_request(&self, body: Value, ctx: &DispatchContext) -> Value {
        let mut out = OpenAIAdapter.transform_request(body, ctx);

        let Some(obj) = out.as_object_mut() else { return out };

        // Caller passthrough first, strategy hint second — an explicit
        // `openrouter_sort` wins over the derived one.
        let mut provider_block = serde_json::Map::new();
        for (key, value) in &ctx.vendor_extra {
            provider_block.insert(key.clone(), value.clone());
        }
        if !provider_block.contains_key("sort") && is_cost_centric(&ctx.strategy) {
            provider_block.insert("sort".to_string(), json!("price"));
        }
        if !provider_block.is_empty() {
            obj.insert("provider".to_string(), Value::Object(provider_block));
        }

        out
    }

    fn transform_response(&self, response: Value) -> Result<Value, RouteError> {
        Ok(response)
    }

    fn auth_headers(&self, provider: &Provider, api_key: &str, headers: &mut HeaderMap) {
        attach_credential(provider, api_key, headers);
        headers.insert("HTTP-Referer", HeaderValue::from_static(REFERER));
        headers.insert("X-Title", HeaderValue::from_static(TITLE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn ctx(strategy: &str, extra: Map<String, Value>) -> DispatchContext {
        DispatchContext {
            model: "meta/llama-3-8b".to_string(),
            strategy: strategy.to_string(),
            stream: false,
            vendor_extra: extra,
        }
    }

    #[test]
    fn cost_centric_strategy_injects_price_sort() {
        let out = OpenRouterAdapter.transform_request(
            json!({ "model": "x", "messages": [] }),
            &ctx("cost_first", Map::new()),
        );
        assert_eq!(out["provider"]["sort"], "price");
    }

    #[test]
    fn quality_strategy_does_not_inject_sort() {
        let out = OpenRouterAdapter.transform_request(
            json!({ "model": "x", "messages": [] }),
            &ctx("quality_optimized", Map::new()),
        );
        assert!(out.get("provider").is_none());
    }

    #[test]
    fn caller_passthrough_wins_over_strategy_hint() {
        let mut extra = Map::new();
        extra.insert("sort".to_string(), json!("throughput"));
        let out = OpenRouterAdapter.transform_request(
            json!({ "model": "x", "messages": [] }),
            &ctx("cost_first", extra),
        );
        assert_eq!(out["provider"]["sort"], "throughput");
    }

    #[test]
    fn passthrough_fields_land_under_provider() {
        let mut extra = Map::new();
        extra.insert("allow_fallbacks".to_string(), json!(false));
        let out = OpenRouterAdapter.transform_request(
            json!({ "model": "x", "messages": [] }),
            &ctx("balanced", extra),
        );
        assert_eq!(out["provider"]["allow_fallbacks"], false);
    }

    #[test]
    fn auth_attaches_referer_and_title() {
        let provider = Provider::for_tests("https://openrouter.ai/api");
        let mut headers = HeaderMap::new();
        OpenRouterAdapter.auth_headers(&provider, "sk-or", &mut headers);
        assert_eq!(headers["authorization"], "Bearer sk-or");
        assert_eq!(headers["HTTP-Referer"], REFERER);
        assert_eq!(headers["X-Title"], TITLE);
    }

    #[test]
    fn model_rewrite_flows_through_the_openai_base() {
        let out = OpenRouterAdapter.transform_request(
            json!({ "model": "virtual", "messages": [] }),
            &ctx("balanced", Map::new()),
        );
        assert_eq!(out["model"], "meta/llama-3-8b");
    }
}
