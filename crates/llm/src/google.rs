//! Google Gemini streaming adapter, using the `streamGenerateContent?alt=sse`
//! endpoint so the wire shape stays within the same SSE-line-buffering
//! machinery as the other adapters instead of Gemini's default bare-JSON-array
//! chunked response.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use crate::error::LlmError;
use crate::provider::{ProviderAdapter, ProviderEventStream};
use crate::sse::{drain_complete_lines, sse_data};
use crate::wire::{ChatMessage, ChatRole, PipelineOptions, ProviderEvent, TokenUsage, ToolDefinition};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

pub struct GoogleAdapter {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl GoogleAdapter {
    pub fn new(api_key: Option<String>) -> Self {
        Self { base_url: DEFAULT_BASE_URL.to_string(), api_key, client: reqwest::Client::new() }
    }
}

fn build_contents(messages: &[ChatMessage]) -> (Option<Value>, Vec<Value>) {
    let mut system = None;
    let mut contents = Vec::new();
    for message in messages {
        match message.role {
            ChatRole::System => {
                system = Some(json!({ "parts": [{ "text": message.content }] }));
            }
            ChatRole::User | ChatRole::Tool => {
                contents.push(json!({ "role": "user", "parts": [{ "text": message.content }] }));
            }
            ChatRole::Assistant => {
                contents.push(json!({ "role": "model", "parts": [{ "text": message.content }] }));
            }
        }
    }
    (system, contents)
}

fn build_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    if tools.is_empty() {
        return Vec::new();
    }
    vec![json!({
        "functionDeclarations": tools.iter().map(|t| json!({
            "name": t.name,
            "description": t.description,
            "parameters": t.parameters,
        })).collect::<Vec<_>>(),
    })]
}

fn parse_chunk(value: &Value) -> Vec<ProviderEvent> {
    let mut events = Vec::new();
    let Some(candidate) = value.get("candidates").and_then(|c| c.as_array()).and_then(|c| c.first()) else {
        return events;
    };

    if let Some(parts) = candidate.get("content").and_then(|c| c.get("parts")).and_then(Value::as_array) {
        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                if !text.is_empty() {
                    events.push(ProviderEvent::TextDelta(text.to_string()));
                }
            }
            if let Some(call) = part.get("functionCall") {
                let name = call.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
                let id = format!("fc-{name}");
                events.push(ProviderEvent::ToolCallStart { id: id.clone(), name });
                if let Some(args) = call.get("args") {
                    events.push(ProviderEvent::ToolCallArgumentsDelta { id, delta: args.to_string() });
                }
            }
        }
    }

    if let Some(usage) = value.get("usageMetadata") {
        let input_tokens = usage.get("promptTokenCount").and_then(Value::as_u64).unwrap_or(0);
        let output_tokens = usage.get("candidatesTokenCount").and_then(Value::as_u64).unwrap_or(0);
        let total_tokens = usage.get("totalTokenCount").and_then(Value::as_u64).unwrap_or(input_tokens + output_tokens);
        events.push(ProviderEvent::Finished {
            usage: Some(TokenUsage { input_tokens, output_tokens, total_tokens }),
        });
    } else if candidate.get("finishReason").and_then(Value::as_str).is_some() {
        events.push(ProviderEvent::Finished { usage: None });
    }

    events
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    fn name(&self) -> &'static str {
        "google"
    }

    async fn stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        opts: &PipelineOptions,
    ) -> Result<ProviderEventStream, LlmError> {
        let (system, contents) = build_contents(messages);
        let mut body = json!({ "contents": contents });
        if let Some(system) = system {
            body["systemInstruction"] = system;
        }
        let mut generation_config = json!({});
        if let Some(temperature) = opts.temperature {
            generation_config["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = opts.max_tokens {
            generation_config["maxOutputTokens"] = json!(max_tokens);
        }
        if generation_config.as_object().is_some_and(|o| !o.is_empty()) {
            body["generationConfig"] = generation_config;
        }
        let tool_decls = build_tools(tools);
        if !tool_decls.is_empty() {
            body["tools"] = json!(tool_decls);
        }

        let key = self.api_key.as_deref().ok_or(LlmError::MissingCredentials("google"))?;
        let url = format!("{}/{model}:streamGenerateContent?alt=sse", self.base_url);
        let response = self.client.post(&url).header("x-goog-api-key", key).json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Provider { provider: "google", status, body });
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
                            .flat_map(|value| parse_chunk(&value))
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
    fn parses_text_candidate() {
        let value: Value = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"hi"}]}}]}"#,
        )
        .unwrap();
        assert!(matches!(&parse_chunk(&value)[0], ProviderEvent::TextDelta(t) if t == "hi"));
    }

    #[test]
    fn parses_usage_metadata_as_finished() {
        let value: Value = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[]}}],"usageMetadata":{"promptTokenCount":3,"candidatesTokenCount":2,"totalTokenCount":5}}"#,
        )
        .unwrap();
        assert!(matches!(
            parse_chunk(&value).last(),
            Some(ProviderEvent::Finished { usage: Some(TokenUsage { input_tokens: 3, output_tokens: 2, total_tokens: 5 }) })
        ));
    }
}
