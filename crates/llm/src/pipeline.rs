//! The LLM Pipeline (`spec.md` §4.4): prompt assembly, provider dispatch,
//! streaming → Event Bus translation, the tool-call loop, and the
//! wall-clock timeout that bounds one outer attempt.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use agentworld_eventbus::{
    SseEvent, SseEventType, ToolEvent, ToolEventType, TokenUsage as BusTokenUsage, WorldEventBus,
};

use crate::error::LlmError;
use crate::openai_compat::ToolCallAccumulator;
use crate::provider::ProviderAdapter;
use crate::wire::{ChatMessage, PipelineOptions, ProviderEvent, TokenUsage, ToolDefinition};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// Hard ceiling on provider↔tool round-trips within one outer attempt, so a
/// model that never stops requesting tools can't hang a mailbox forever.
const MAX_TOOL_ROUNDS: u32 = 8;

/// Executes a tool call requested by the model. The pipeline never decides
/// *what* a tool does — it only owns the request/result choreography
/// described in `spec.md` §4.4 step 3.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, arguments: &Value) -> Result<Value, String>;
}

pub struct PipelineRequest<'a> {
    pub message_id: Uuid,
    pub chat_id: Uuid,
    pub agent_name: &'a str,
    pub system_prompt: &'a str,
    pub variables: &'a HashMap<String, String>,
    pub working_directory: Option<&'a str>,
    /// Prior memory slice, oldest first, already role-tagged.
    pub memory: &'a [ChatMessage],
    pub user_message: &'a str,
    pub tools: &'a [ToolDefinition],
    pub options: PipelineOptions,
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

/// Substitutes `{{var}}` tokens from `world.variables` and appends the
/// mandatory `working directory: <value|./>` trailing line.
pub fn build_system_prompt(template: &str, variables: &HashMap<String, String>, working_directory: Option<&str>) -> String {
    let mut rendered = template.to_string();
    for (key, value) in variables {
        rendered = rendered.replace(&format!("{{{{{key}}}}}"), value);
    }
    let working_directory = working_directory.filter(|v| !v.is_empty()).unwrap_or("./");
    format!("{rendered}\nworking directory: {working_directory}")
}

/// `ceil(len(buffer)/4)`, used until the provider supplies an authoritative count.
fn estimate_output_tokens(buffer: &str) -> u64 {
    ((buffer.chars().count() + 3) / 4) as u64
}

pub struct Pipeline {
    adapter: Arc<dyn ProviderAdapter>,
    timeout_secs: u64,
}

impl Pipeline {
    pub fn new(adapter: Arc<dyn ProviderAdapter>) -> Self {
        Self { adapter, timeout_secs: DEFAULT_TIMEOUT_SECS }
    }

    pub fn with_timeout(adapter: Arc<dyn ProviderAdapter>, timeout_secs: u64) -> Self {
        Self { adapter, timeout_secs }
    }

    #[instrument(skip(self, bus, tool_executor, request), fields(agent = %request.agent_name, message_id = %request.message_id))]
    pub async fn run(
        &self,
        model: &str,
        bus: &WorldEventBus,
        tool_executor: Option<&dyn ToolExecutor>,
        request: PipelineRequest<'_>,
    ) -> Result<PipelineOutcome, LlmError> {
        let outcome = tokio::time::timeout(
            Duration::from_secs(self.timeout_secs),
            self.run_inner(model, bus, tool_executor, &request),
        )
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                bus.publish_sse(SseEvent {
                    event_type: SseEventType::Error,
                    message_id: request.message_id,
                    agent_name: request.agent_name.to_string(),
                    content: None,
                    error: Some("timeout".to_string()),
                    chat_id: Some(request.chat_id),
                    usage: None,
                });
                Err(LlmError::Timeout(self.timeout_secs))
            }
        }
    }

    async fn run_inner(
        &self,
        model: &str,
        bus: &WorldEventBus,
        tool_executor: Option<&dyn ToolExecutor>,
        request: &PipelineRequest<'_>,
    ) -> Result<PipelineOutcome, LlmError> {
        let system_prompt = build_system_prompt(request.system_prompt, request.variables, request.working_directory);

        let mut messages = Vec::with_capacity(request.memory.len() + 2);
        messages.push(ChatMessage::system(system_prompt));
        messages.extend(request.memory.iter().cloned());
        messages.push(ChatMessage::user(request.user_message));

        bus.publish_sse(SseEvent {
            event_type: SseEventType::Start,
            message_id: request.message_id,
            agent_name: request.agent_name.to_string(),
            content: None,
            error: None,
            chat_id: Some(request.chat_id),
            usage: None,
        });

        let mut buffer = String::new();
        let mut usage: Option<TokenUsage> = None;

        for round in 0..MAX_TOOL_ROUNDS {
            let stream_result = self.adapter.stream(model, &messages, request.tools, &request.options).await;
            let mut stream = match stream_result {
                Ok(stream) => stream,
                Err(err) => {
                    self.emit_error(bus, request, &err.to_string());
                    return Err(err);
                }
            };

            let mut accumulator = ToolCallAccumulator::default();
            let mut current_tool_id = String::new();
            let mut round_usage: Option<TokenUsage> = None;

            while let Some(event) = stream.next().await {
                match event {
                    Ok(ProviderEvent::TextDelta(delta)) => {
                        buffer.push_str(&delta);
                        bus.publish_sse(SseEvent {
                            event_type: SseEventType::Chunk,
                            message_id: request.message_id,
                            agent_name: request.agent_name.to_string(),
                            content: Some(delta),
                            error: None,
                            chat_id: Some(request.chat_id),
                            usage: None,
                        });
                    }
                    Ok(ProviderEvent::ToolCallStart { id, name }) => {
                        current_tool_id = id.clone();
                        accumulator.on_start(&id, &name);
                        bus.publish_tool(ToolEvent {
                            event_type: ToolEventType::ToolStart,
                            tool_use_id: id,
                            tool_name: name,
                            tool_input: None,
                            result: None,
                            error: None,
                            chat_id: Some(request.chat_id),
                        });
                    }
                    Ok(ProviderEvent::ToolCallArgumentsDelta { id, delta }) => {
                        let id = if id.is_empty() { current_tool_id.clone() } else { id };
                        accumulator.on_arguments_delta(&id, &delta);
                    }
                    Ok(ProviderEvent::ToolCallEnd { .. }) => {}
                    Ok(ProviderEvent::Finished { usage: finished_usage }) => {
                        round_usage = finished_usage;
                    }
                    Err(err) => {
                        self.emit_error(bus, request, &err.to_string());
                        return Err(err);
                    }
                }
            }

            let tool_calls = accumulator.into_ordered();
            if tool_calls.is_empty() {
                usage = round_usage;
                break;
            }

            info!(tool_call_count = tool_calls.len(), round, "dispatching tool calls before next provider turn");
            messages.push(ChatMessage::assistant_tool_calls(tool_calls.clone()));
            for call in &tool_calls {
                let arguments: Value = serde_json::from_str(&call.arguments).unwrap_or(Value::Null);
                bus.publish_tool(ToolEvent {
                    event_type: ToolEventType::ToolProgress,
                    tool_use_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    tool_input: Some(arguments.clone()),
                    result: None,
                    error: None,
                    chat_id: Some(request.chat_id),
                });

                let outcome = match tool_executor {
                    Some(executor) => executor.execute(&call.name, &arguments).await,
                    None => Err("no tool executor configured".to_string()),
                };

                match outcome {
                    Ok(result) => {
                        bus.publish_tool(ToolEvent {
                            event_type: ToolEventType::ToolResult,
                            tool_use_id: call.id.clone(),
                            tool_name: call.name.clone(),
                            tool_input: Some(arguments),
                            result: Some(result.clone()),
                            error: None,
                            chat_id: Some(request.chat_id),
                        });
                        messages.push(ChatMessage::tool_result(call.id.clone(), result.to_string()));
                    }
                    Err(error) => {
                        bus.publish_tool(ToolEvent {
                            event_type: ToolEventType::ToolError,
                            tool_use_id: call.id.clone(),
                            tool_name: call.name.clone(),
                            tool_input: Some(arguments),
                            result: None,
                            error: Some(error.clone()),
                            chat_id: Some(request.chat_id),
                        });
                        messages.push(ChatMessage::tool_result(call.id.clone(), format!("error: {error}")));
                    }
                }
            }
        }

        let usage = usage.or_else(|| {
            let estimated = estimate_output_tokens(&buffer);
            Some(TokenUsage { input_tokens: 0, output_tokens: estimated, total_tokens: estimated })
        });

        bus.publish_sse(SseEvent {
            event_type: SseEventType::End,
            message_id: request.message_id,
            agent_name: request.agent_name.to_string(),
            content: None,
            error: None,
            chat_id: Some(request.chat_id),
            usage: usage.map(to_bus_usage),
        });

        Ok(PipelineOutcome { content: buffer, usage })
    }

    fn emit_error(&self, bus: &WorldEventBus, request: &PipelineRequest<'_>, message: &str) {
        warn!(error = message, "llm pipeline provider error");
        bus.publish_sse(SseEvent {
            event_type: SseEventType::Error,
            message_id: request.message_id,
            agent_name: request.agent_name.to_string(),
            content: None,
            error: Some(message.to_string()),
            chat_id: Some(request.chat_id),
            usage: None,
        });
    }
}

fn to_bus_usage(usage: TokenUsage) -> BusTokenUsage {
    BusTokenUsage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        total_tokens: usage.total_tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_variables_and_appends_working_directory() {
        let mut vars = HashMap::new();
        vars.insert("topic".to_string(), "rust".to_string());
        let rendered = build_system_prompt("You love {{topic}}.", &vars, Some("/srv/app"));
        assert_eq!(rendered, "You love rust.\nworking directory: /srv/app");
    }

    #[test]
    fn missing_working_directory_defaults_to_dot_slash() {
        let rendered = build_system_prompt("hi", &HashMap::new(), None);
        assert_eq!(rendered, "hi\nworking directory: ./");
    }

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_output_tokens("abcde"), 2);
        assert_eq!(estimate_output_tokens(""), 0);
        assert_eq!(estimate_output_tokens("abcd"), 1);
    }
}
