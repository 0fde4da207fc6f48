//! Shared driver for every provider that speaks the OpenAI
//! `/chat/completions` SSE wire format: OpenAI itself, Azure-OpenAI,
//! xAI, and the generic OpenAI-compatible adapter (local gateways,
//! self-hosted proxies).
//!
//! Auth differs per provider (`Authorization: Bearer` vs Azure's
//! `api-key` header) but the request/response shapes are identical, so
//! one adapter configured with an [`AuthStyle`] and a full chat-completions
//! URL covers all four.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use crate::error::LlmError;
use crate::provider::{ProviderAdapter, ProviderEventStream};
use crate::sse::{drain_complete_lines, sse_data};
use crate::wire::{ChatMessage, ChatRole, PipelineOptions, ProviderEvent, TokenUsage, ToolCallRequest, ToolDefinition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    Bearer,
    ApiKeyHeader,
    None,
}

pub struct OpenAiCompatAdapter {
    name: &'static str,
    chat_url: String,
    api_key: Option<String>,
    auth_style: AuthStyle,
    extra_headers: Vec<(String, String)>,
    client: reqwest::Client,
}

impl OpenAiCompatAdapter {
    pub fn new(
        name: &'static str,
        chat_url: impl Into<String>,
        api_key: Option<String>,
        auth_style: AuthStyle,
        extra_headers: Vec<(String, String)>,
    ) -> Self {
        Self {
            name,
            chat_url: chat_url.into(),
            api_key,
            auth_style,
            extra_headers,
            client: reqwest::Client::new(),
        }
    }
}

fn role_str(role: ChatRole) -> &'static str {
    match role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
        ChatRole::Tool => "tool",
    }
}

fn build_messages(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let mut entry = json!({
                "role": role_str(m.role),
                "content": m.content,
            });
            if let Some(id) = &m.tool_call_id {
                entry["tool_call_id"] = json!(id);
            }
            if let Some(calls) = &m.tool_calls {
                entry["tool_calls"] = json!(calls
                    .iter()
                    .map(|c| json!({
                        "id": c.id,
                        "type": "function",
                        "function": { "name": c.name, "arguments": c.arguments },
                    }))
                    .collect::<Vec<_>>());
            }
            entry
        })
        .collect()
}

fn build_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }
            })
        })
        .collect()
}

/// One `choices[0].delta` chunk, translated into zero or more provider events.
/// Tool-call argument deltas arrive keyed by `index`; the caller is
/// responsible for stitching `ToolCallArgumentsDelta` frames back together by
/// `id` (the pipeline does this before emitting `tool{tool-start}`).
fn parse_chunk(value: &Value) -> Vec<ProviderEvent> {
    let mut events = Vec::new();

    if let Some(usage) = value.get("usage").filter(|u| !u.is_null()) {
        let input_tokens = usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
        let output_tokens = usage.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0);
        let total_tokens = usage.get("total_tokens").and_then(Value::as_u64).unwrap_or(input_tokens + output_tokens);
        events.push(ProviderEvent::Finished {
            usage: Some(TokenUsage { input_tokens, output_tokens, total_tokens }),
        });
    }

    let Some(choice) = value.get("choices").and_then(|c| c.as_array()).and_then(|c| c.first()) else {
        return events;
    };
    let Some(delta) = choice.get("delta") else { return events };

    if let Some(content) = delta.get("content").and_then(Value::as_str) {
        if !content.is_empty() {
            events.push(ProviderEvent::TextDelta(content.to_string()));
        }
    }

    if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
        for call in tool_calls {
            let index = call.get("index").and_then(Value::as_u64).unwrap_or(0);
            let id = call.get("id").and_then(Value::as_str).map(ToString::to_string);
            let function = call.get("function");
            let name = function.and_then(|f| f.get("name")).and_then(Value::as_str).map(ToString::to_string);
            let arguments = function.and_then(|f| f.get("arguments")).and_then(Value::as_str).unwrap_or("");

            // A fresh id/name marks the start of a new call; subsequent
            // fragments for the same index only carry argument deltas.
            let synthetic_id = id.clone().unwrap_or_else(|| format!("idx-{index}"));
            if id.is_some() || name.is_some() {
                events.push(ProviderEvent::ToolCallStart {
                    id: synthetic_id.clone(),
                    name: name.unwrap_or_default(),
                });
            }
            if !arguments.is_empty() {
                events.push(ProviderEvent::ToolCallArgumentsDelta {
                    id: synthetic_id,
                    delta: arguments.to_string(),
                });
            }
        }
    }

    if choice.get("finish_reason").and_then(Value::as_str).is_some_and(|r| r != "null") {
        if !events.iter().any(|e| matches!(e, ProviderEvent::Finished { .. })) {
            events.push(ProviderEvent::Finished { usage: None });
        }
    }

    events
}

fn parse_sse_line(line: &str) -> Vec<ProviderEvent> {
    let Some(data) = sse_data(line) else { return Vec::new() };
    if data == "[DONE]" {
        return Vec::new();
    }
    match serde_json::from_str::<Value>(data) {
        Ok(value) => parse_chunk(&value),
        Err(_) => Vec::new(),
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatAdapter {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        opts: &PipelineOptions,
    ) -> Result<ProviderEventStream, LlmError> {
        let mut body = json!({
            "model": model,
            "messages": build_messages(messages),
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if let Some(temperature) = opts.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = opts.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if !tools.is_empty() {
            body["tools"] = json!(build_tools(tools));
        }

        let mut request = self.client.post(&self.chat_url).json(&body);
        request = match self.auth_style {
            AuthStyle::Bearer => {
                let key = self.api_key.as_deref().ok_or(LlmError::MissingCredentials(self.name))?;
                request.bearer_auth(key)
            }
            AuthStyle::ApiKeyHeader => {
                let key = self.api_key.as_deref().ok_or(LlmError::MissingCredentials(self.name))?;
                request.header("api-key", key)
            }
            AuthStyle::None => request,
        };
        for (name, value) in &self.extra_headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Provider { provider: self.name, status, body });
        }

        let provider = self.name;
        let byte_stream = response.bytes_stream();
        let event_stream = byte_stream
            .scan(String::new(), move |buf, chunk| {
                let events: Vec<Result<ProviderEvent, LlmError>> = match chunk {
                    Ok(bytes) => {
                        buf.push_str(&String::from_utf8_lossy(&bytes));
                        drain_complete_lines(buf)
                            .iter()
                            .flat_map(|line| parse_sse_line(line))
                            .map(Ok)
                            .collect()
                    }
                    Err(err) => vec![Err(LlmError::Transport(err))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        let _ = provider;
        Ok(Box::pin(event_stream))
    }
}

/// Accumulates `ToolCallStart`/`ToolCallArgumentsDelta` frames into complete
/// [`ToolCallRequest`]s, keyed by the id synthesized in [`parse_chunk`].
#[derive(Default)]
pub struct ToolCallAccumulator {
    order: Vec<String>,
    calls: HashMap<String, ToolCallRequest>,
}

impl ToolCallAccumulator {
    pub fn on_start(&mut self, id: &str, name: &str) {
        let entry = self.calls.entry(id.to_string()).or_insert_with(|| {
            self.order.push(id.to_string());
            ToolCallRequest { id: id.to_string(), name: String::new(), arguments: String::new() }
        });
        if !name.is_empty() {
            entry.name = name.to_string();
        }
    }

    pub fn on_arguments_delta(&mut self, id: &str, delta: &str) {
        self.calls.entry(id.to_string()).or_insert_with(|| {
            self.order.push(id.to_string());
            ToolCallRequest { id: id.to_string(), name: String::new(), arguments: String::new() }
        }).arguments.push_str(delta);
    }

    pub fn into_ordered(self) -> Vec<ToolCallRequest> {
        let Self { order, mut calls } = self;
        order.into_iter().filter_map(|id| calls.remove(&id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_delta() {
        let value: Value = serde_json::from_str(
            r#"{"choices":[{"delta":{"content":"hi"},"finish_reason":null}]}"#,
        )
        .unwrap();
        let events = parse_chunk(&value);
        assert!(matches!(&events[0], ProviderEvent::TextDelta(t) if t == "hi"));
    }

    #[test]
    fn parses_finish_reason_as_finished() {
        let value: Value = serde_json::from_str(
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
        )
        .unwrap();
        let events = parse_chunk(&value);
        assert!(matches!(events.last(), Some(ProviderEvent::Finished { usage: None })));
    }

    #[test]
    fn parses_usage_chunk() {
        let value: Value = serde_json::from_str(
            r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#,
        )
        .unwrap();
        let events = parse_chunk(&value);
        assert!(matches!(
            events[0],
            ProviderEvent::Finished { usage: Some(TokenUsage { input_tokens: 10, output_tokens: 5, total_tokens: 15 }) }
        ));
    }

    #[test]
    fn accumulator_stitches_argument_deltas_in_order() {
        let mut acc = ToolCallAccumulator::default();
        acc.on_start("call_1", "get_weather");
        acc.on_arguments_delta("call_1", "{\"city\":");
        acc.on_arguments_delta("call_1", "\"NYC\"}");
        let calls = acc.into_ordered();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "get_weather");
        assert_eq!(calls[0].arguments, "{\"city\":\"NYC\"}");
    }

    #[test]
    fn done_sentinel_produces_no_events() {
        assert!(parse_sse_line("data: [DONE]").is_empty());
    }
}
