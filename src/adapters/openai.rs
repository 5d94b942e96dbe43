//! OpenAI-compatible adapter.
//!
//! Covers any backend speaking `/v1/chat/completions` — OpenAI itself, LM
//! Studio, vLLM, LocalAI, Ollama's compat endpoint, SiliconFlow. The body is
//! forwarded nearly verbatim; the only rewrite is hoisting a top-level
//! `system` field into the message list when the caller used that shorthand.

use serde_json::Value;

use super::{Adapter, DispatchContext};
use crate::error::RouteError;

pub struct OpenAIAdapter;

impl Adapter for OpenAIAdapter {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn chat_endpoint(&self, base_url: &str) -> String {
        format!("{}/v1/chat/completions", base_url.trim_end_matches('/'))
    }

    fn models_endpoint(&self, base_url: &str) -> String {
        format!("{}/v1/models", base_url.trim_end_matches('/'))
    }

    fn transform_request(&self, mut body: Value, ctx: &DispatchContext) -> Value {
        if let Some(obj) = body.as_object_mut() {
            obj.insert("model".into(), Value::String(ctx.model.clone()));
            obj.insert("stream".into(), Value::Bool(ctx.stream));

            // `system` shorthand: inject as the first message unless the
            // caller already has a system message.
            if let Some(system) = obj.remove("system").and_then(|s| s.as_str().map(str::to_string))
            {
                let has_system = obj
                    .get("messages")
                    .and_then(Value::as_array)
                    .is_some_and(|m| m.iter().any(|msg| msg["role"] == "system"));
                if !has_system {
                    if let Some(messages) = obj.get_mut("messages").and_then(Value::as_array_mut) {
                        messages.insert(
                            0,
                            serde_json::json!({ "role": "system", "content": system }),
                        );
                    }
                }
            }
        }
        body
    }

    fn transform_response(&self, response: Value) -> Result<Value, RouteError> {
        // Already canonical.
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(model: &str, stream: bool) -> DispatchContext {
        DispatchContext {
            model: model.to_string(),
            strategy: "balanced".to_string(),
            stream,
            vendor_extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn rewrites_model_and_stream() {
        let adapter = OpenAIAdapter;
        let out = adapter.transform_request(
            json!({ "model": "virtual-name", "messages": [] }),
            &ctx("gpt-4o", true),
        );
        assert_eq!(out["model"], "gpt-4o");
        assert_eq!(out["stream"], true);
    }

    #[test]
    fn system_shorthand_becomes_first_message() {
        let adapter = OpenAIAdapter;
        let out = adapter.transform_request(
            json!({
                "model": "m",
                "system": "You are terse.",
                "messages": [{ "role": "user", "content": "hi" }],
            }),
            &ctx("m", false),
        );
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "You are terse.");
        assert!(out.get("system").is_none());
    }

    #[test]
    fn existing_system_message_is_not_duplicated() {
        let adapter = OpenAIAdapter;
        let out = adapter.transform_request(
            json!({
                "model": "m",
                "system": "shorthand",
                "messages": [
                    { "role": "system", "content": "already here" },
                    { "role": "user", "content": "hi" },
                ],
            }),
            &ctx("m", false),
        );
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["content"], "already here");
    }

    #[test]
    fn endpoints_are_under_v1() {
        let adapter = OpenAIAdapter;
        assert_eq!(
            adapter.chat_endpoint("http://localhost:11434"),
            "http://localhost:11434/v1/chat/completions"
        );
        assert_eq!(
            adapter.models_endpoint("http://localhost:11434/"),
            "http://localhost:11434/v1/models"
        );
    }

    #[test]
    fn response_passes_through_untouched() {
        let adapter = OpenAIAdapter;
        let body = json!({ "choices": [{ "message": { "content": "hi" } }] });
        assert_eq!(adapter.transform_response(body.clone()).unwrap(), body);
    }
}
