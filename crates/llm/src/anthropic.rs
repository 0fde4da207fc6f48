//! Anthropic Messages API streaming adapter.
//!
//! Anthropic's SSE frames carry their own `type` discriminant in the JSON
//! body (`content_block_delta`, `message_delta`, ...), so the adapter
//! doesn't need the `event:` framing line at all — it parses whatever
//! `data:` line shows up and dispatches on `type`.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use crate::error::LlmError;
use crate::provider::{ProviderAdapter, ProviderEventStream};
use crate::sse::{drain_complete_lines, sse_data};
use crate::wire::{ChatMessage, ChatRole, PipelineOptions, ProviderEvent, TokenUsage, ToolDefinition};

const API_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1/messages";

pub struct AnthropicAdapter {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl AnthropicAdapter {
    pub fn new(api_key: Option<String>) -> Self {
        Self { base_url: DEFAULT_BASE_URL.to_string(), api_key, client: reqwest::Client::new() }
    }
}

fn build_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<Value>) {
    let mut system = None;
    let mut turns = Vec::new();
    for message in messages {
        match message.role {
            ChatRole::System => {
                system = Some(match system {
                    Some(existing) => format!("{existing}\n{}", message.content),
                    None => message.content.clone(),
                });
            }
            ChatRole::User => turns.push(json!({ "role": "user", "content": message.content })),
            ChatRole::Assistant => turns.push(json!({ "role": "assistant", "content": message.content })),
            ChatRole::Tool => turns.push(json!({
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
                    "content": message.content,
                }],
            })),
        }
    }
    (system, turns)
}

fn build_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| json!({ "name": t.name, "description": t.description, "input_schema": t.parameters }))
        .collect()
}

fn parse_frame(value: &Value) -> Vec<ProviderEvent> {
    let mut events = Vec::new();
    let Some(kind) = value.get("type").and_then(Value::as_str) else { return events };

    match kind {
        "content_block_start" => {
            if let Some(block) = value.get("content_block") {
                if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                    events.push(ProviderEvent::ToolCallStart {
                        id: block.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
                        name: block.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                    });
                }
            }
        }
        "content_block_delta" => {
            if let Some(delta) = value.get("delta") {
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        if let Some(text) = delta.get("text").and_then(Value::as_str) {
                            events.push(ProviderEvent::TextDelta(text.to_string()));
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(partial) = delta.get("partial_json").and_then(Value::as_str) {
                            // Anthropic doesn't repeat the tool_use id on delta
                            // frames; the pipeline correlates by content block
                            // index via the preceding `ToolCallStart`.
                            events.push(ProviderEvent::ToolCallArgumentsDelta {
                                id: String::new(),
                                delta: partial.to_string(),
                            });
                        }
                    }
                    _ => {}
                }
            }
        }
        "message_delta" => {
            if let Some(usage) = value.get("usage") {
                let output_tokens = usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0);
                events.push(ProviderEvent::Finished {
                    usage: Some(TokenUsage { input_tokens: 0, output_tokens, total_tokens: output_tokens }),
                });
            }
        }
        "message_stop" => {
            if !events.iter().any(|e| matches!(e, ProviderEvent::Finished { .. })) {
                events.push(ProviderEvent::Finished { usage: None });
            }
        }
        _ => {}
    }
    events
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        opts: &PipelineOptions,
    ) -> Result<ProviderEventStream, LlmError> {
        let (system, turns) = build_messages(messages);
        let mut body = json!({
            "model": model,
            "messages": turns,
            "stream": true,
            "max_tokens": opts.max_tokens.unwrap_or(4096),
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }
        if let Some(temperature) = opts.temperature {
            body["temperature"] = json!(temperature);
        }
        if !tools.is_empty() {
            body["tools"] = json!(build_tools(tools));
        }

        let key = self.api_key.as_deref().ok_or(LlmError::MissingCredentials("anthropic"))?;
        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Provider { provider: "anthropic", status, body });
        }

        let byte_stream = response.bytes_stream();
        let event_stream = byte_stream
            .scan(String::new(), move |buf, chunk| {
                let events: Vec<Result<ProviderEvent, LlmError>> = match chunk {
                    Ok(bytes) => {
                        buf.push_str(&String::from_utf8_lossy(&bytes));
                        drain_complete_lines(buf)
                            .iter()
                            .filter_map(|line| sse_data(line))
                            .filter_map(|data| serde_json::from_str::<Value>(data).ok())
                            .flat_map(|value| parse_frame(&value))
                            .map(Ok)
                            .collect()
                    }
                    Err(err) => vec![Err(LlmError::Transport(err))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_delta_frame() {
        let value: Value = serde_json::from_str(
            r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"hi"}}"#,
        )
        .unwrap();
        assert!(matches!(&parse_frame(&value)[0], ProviderEvent::TextDelta(t) if t == "hi"));
    }

    #[test]
    fn tool_use_start_frame() {
        let value: Value = serde_json::from_str(
            r#"{"type":"content_block_start","content_block":{"type":"tool_use","id":"toolu_1","name":"lookup"}}"#,
        )
        .unwrap();
        assert!(matches!(&parse_frame(&value)[0], ProviderEvent::ToolCallStart { id, name } if id == "toolu_1" && name == "lookup"));
    }

    #[test]
    fn message_stop_without_usage_finishes() {
        let value: Value = serde_json::from_str(r#"{"type":"message_stop"}"#).unwrap();
        assert!(matches!(parse_frame(&value)[0], ProviderEvent::Finished { usage: None }));
    }
}
