//! Anthropic Messages API adapter.
//!
//! Translates between the OpenAI chat-completions schema and Anthropic's
//! `/v1/messages` API, both buffered and streaming.
//!
//! | Concern | OpenAI | Anthropic |
//! |---|---|---|
//! | System prompt | `role: "system"` message | top-level `system` field |
//! | Max tokens | optional | **required** (default 4096 here) |
//! | Tools | `{type: function, function: {…}}` | `{name, description, input_schema}` |
//! | Finish reasons | `stop` / `length` / `tool_calls` | `end_turn` / `max_tokens` / `tool_use` |
//! | Response shape | `choices[].message` | `content[]` blocks |
//! | SSE | chunk deltas | typed events (`content_block_delta`, …) |
//! | Auth | `Authorization: Bearer` | `x-api-key` + `anthropic-version` |

use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Value};

use super::{attach_credential, Adapter, DispatchContext, StreamAction};
use crate::config::Provider;
use crate::error::RouteError;

/// Anthropic requires `max_tokens`; this is the ceiling when callers omit it.
const DEFAULT_MAX_TOKENS: u64 = 4096;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter;

impl Adapter for AnthropicAdapter {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn chat_endpoint(&self, base_url: &str) -> String {
        format!("{}/v1/messages", base_url.trim_end_matches('/'))
    }

    fn models_endpoint(&self, base_url: &str) -> String {
        format!("{}/v1/models", base_url.trim_end_matches('/'))
    }

    fn transform_request(&self, body: Value, ctx: &DispatchContext) -> Value {
        let max_tokens = body["max_tokens"].as_u64().unwrap_or(DEFAULT_MAX_TOKENS);

        // System content moves to the top-level field; multiple system
        // messages concatenate.
        let mut system_parts: Vec<String> = Vec::new();
        if let Some(s) = body["system"].as_str() {
            system_parts.push(s.to_string());
        }
        let mut messages: Vec<Value> = Vec::new();
        if let Some(raw) = body["messages"].as_array() {
            for msg in raw {
                if msg["role"] == "system" {
                    if let Some(content) = msg["content"].as_str() {
                        system_parts.push(content.to_string());
                    }
                } else {
                    messages.push(msg.clone());
                }
            }
        }

        let mut out = json!({
            "model": ctx.model,
            "max_tokens": max_tokens,
            "messages": messages,
        });

        if !system_parts.is_empty() {
            out["system"] = Value::String(system_parts.join("\n\n"));
        }
        if let Some(temp) = body["temperature"].as_f64() {
            out["temperature"] = json!(temp);
        }
        if let Some(stop) = body.get("stop") {
            out["stop_sequences"] = stop.clone();
        }
        if ctx.stream {
            out["stream"] = json!(true);
        }
        if let Some(tools) = body["tools"].as_array() {
            let rewritten: Vec<Value> = tools.iter().filter_map(rewrite_tool).collect();
            if !rewritten.is_empty() {
                out["tools"] = Value::Array(rewritten);
            }
        }

        out
    }

    fn transform_response(&self, resp: Value) -> Result<Value, RouteError> {
        let blocks = resp["content"].as_array().cloned().unwrap_or_default();

        let text: String = blocks
            .iter()
            .filter(|b| b["type"] == "text")
            .filter_map(|b| b["text"].as_str())
            .collect::<Vec<_>>()
            .join("");

        let tool_calls: Vec<Value> = blocks
            .iter()
            .filter(|b| b["type"] == "tool_use")
            .map(|b| {
                json!({
                    "id": b["id"],
                    "type": "function",
                    "function": {
                        "name": b["name"],
                        "arguments": b["input"].to_string(),
                    },
                })
            })
            .collect();

        if text.is_empty() && tool_calls.is_empty() {
            return Err(RouteError::RequestMalformed {
                detail: "empty content in upstream response".to_string(),
            });
        }

        let finish_reason = match resp["stop_reason"].as_str().unwrap_or("stop") {
            "end_turn" => "stop",
            "max_tokens" => "length",
            "tool_use" => "tool_calls",
            other => other,
        };

        let mut message = json!({ "role": "assistant", "content": text });
        if !tool_calls.is_empty() {
            message["tool_calls"] = Value::Array(tool_calls);
        }

        let input_tokens = resp["usage"]["input_tokens"].as_u64().unwrap_or(0);
        let output_tokens = resp["usage"]["output_tokens"].as_u64().unwrap_or(0);

        Ok(json!({
            "id": resp["id"],
            "object": "chat.completion",
            "model": resp["model"],
            "choices": [{
                "index": 0,
                "message": message,
                "finish_reason": finish_reason,
            }],
            "usage": {
                "prompt_tokens": input_tokens,
                "completion_tokens": output_tokens,
                "total_tokens": input_tokens + output_tokens,
            },
        }))
    }

    fn native_sse(&self) -> bool {
        false
    }

    /// Translate one Anthropic SSE `data:` payload into canonical chunks.
    fn stream_parse(&self, data: &str, model: &str) -> StreamAction {
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return StreamAction::Ignore;
        };

        match event["type"].as_str() {
            Some("content_block_delta") => {
                let text = event["delta"]["text"].as_str().unwrap_or_default();
                if text.is_empty() {
                    return StreamAction::Ignore;
                }
                StreamAction::Emit(json!({
                    "object": "chat.completion.chunk",
                    "model": model,
                    "choices": [{
                        "index": 0,
                        "delta": { "content": text },
                        "finish_reason": null,
                    }],
                }))
            }
            Some("message_delta") => {
                let finish = match event["delta"]["stop_reason"].as_str() {
                    Some("end_turn") => "stop",
                    Some("max_tokens") => "length",
                    Some("tool_use") => "tool_calls",
                    Some(other) => other,
                    None => return StreamAction::Ignore,
                };
                StreamAction::Emit(json!({
                    "object": "chat.completion.chunk",
                    "model": model,
                    "choices": [{
                        "index": 0,
                        "delta": {},
                        "finish_reason": finish,
                    }],
                }))
            }
            Some("message_stop") => StreamAction::Done,
            _ => StreamAction::Ignore,
        }
    }

    fn auth_headers(&self, provider: &Provider, api_key: &str, headers: &mut HeaderMap) {
        attach_credential(provider, api_key, headers);
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
    }
}

/// OpenAI `{type: function, function: {…}}` → Anthropic `{name, description,
/// input_schema}`. Non-function tools are dropped.
fn rewrite_tool(tool: &Value) -> Option<Value> {
    if tool["type"] != "function" {
        return None;
    }
    let function = tool.get("function")?;
    Some(json!({
        "name": function["name"],
        "description": function.get("description").cloned().unwrap_or(Value::String(String::new())),
        "input_schema": function.get("parameters").cloned().unwrap_or(json!({"type": "object"})),
    }))
}
