//! Ollama `/api/chat` streaming adapter. Ollama emits newline-delimited JSON
//! objects rather than SSE `data:` lines (no `event-stream` framing at all),
//! so this reuses the line-buffering helper but skips the `data:` strip.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use crate::error::LlmError;
use crate::provider::{ProviderAdapter, ProviderEventStream};
use crate::sse::drain_complete_lines;
use crate::wire::{ChatMessage, ChatRole, PipelineOptions, ProviderEvent, TokenUsage, ToolDefinition};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

pub struct OllamaAdapter {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaAdapter {
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
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
    messages.iter().map(|m| json!({ "role": role_str(m.role), "content": m.content })).collect()
}

fn build_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| json!({ "type": "function", "function": { "name": t.name, "description": t.description, "parameters": t.parameters } }))
        .collect()
}

fn parse_line(value: &Value) -> Vec<ProviderEvent> {
    let mut events = Vec::new();
    if let Some(content) = value.get("message").and_then(|m| m.get("content")).and_then(Value::as_str) {
        if !content.is_empty() {
            events.push(ProviderEvent::TextDelta(content.to_string()));
        }
    }
    if let Some(calls) = value.get("message").and_then(|m| m.get("tool_calls")).and_then(Value::as_array) {
        for (index, call) in calls.iter().enumerate() {
            let name = call.get("function").and_then(|f| f.get("name")).and_then(Value::as_str).unwrap_or_default();
            let id = format!("ollama-{index}");
            events.push(ProviderEvent::ToolCallStart { id: id.clone(), name: name.to_string() });
            if let Some(args) = call.get("function").and_then(|f| f.get("arguments")) {
                events.push(ProviderEvent::ToolCallArgumentsDelta { id, delta: args.to_string() });
            }
        }
    }
    if value.get("done").and_then(Value::as_bool) == Some(true) {
        let input_tokens = value.get("prompt_eval_count").and_then(Value::as_u64).unwrap_or(0);
        let output_tokens = value.get("eval_count").and_then(Value::as_u64).unwrap_or(0);
        events.push(ProviderEvent::Finished {
            usage: Some(TokenUsage { input_tokens, output_tokens, total_tokens: input_tokens + output_tokens }),
        });
    }
    events
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        opts: &PipelineOptions,
    ) -> Result<ProviderEventStream, LlmError> {
        let endpoint = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        let mut body = json!({
            "model": model,
            "messages": build_messages(messages),
            "stream": true,
        });
        let mut options = json!({});
        if let Some(temperature) = opts.temperature {
            options["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = opts.max_tokens {
            options["num_predict"] = json!(max_tokens);
        }
        if options.as_object().is_some_and(|o| !o.is_empty()) {
            body["options"] = options;
        }
        if !tools.is_empty() {
            body["tools"] = json!(build_tools(tools));
        }

        let response = self.client.post(&endpoint).json(&body).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Provider { provider: "ollama", status, body });
        }

        let byte_stream = response.bytes_stream();
        let event_stream = byte_stream
            .scan(String::new(), move |buf, chunk| {
                let events: Vec<Result<ProviderEvent, LlmError>> = match chunk {
                    Ok(bytes) => {
                        buf.push_str(&String::from_utf8_lossy(&bytes));
                        drain_complete_lines(buf)
                            .iter()
                            .filter(|line| !line.trim().is_empty())
                            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
                            .flat_map(|value| parse_line(&value))
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
    fn parses_content_delta() {
        let value: Value = serde_json::from_str(r#"{"message":{"role":"assistant","content":"hi"},"done":false}"#).unwrap();
        assert!(matches!(&parse_line(&value)[0], ProviderEvent::TextDelta(t) if t == "hi"));
    }

    #[test]
    fn done_true_carries_usage() {
        let value: Value = serde_json::from_str(
            r#"{"message":{"role":"assistant","content":""},"done":true,"prompt_eval_count":12,"eval_count":8}"#,
        )
        .unwrap();
        assert!(matches!(
            parse_line(&value)[0],
            ProviderEvent::Finished { usage: Some(TokenUsage { input_tokens: 12, output_tokens: 8, total_tokens: 20 }) }
        ));
    }
}
