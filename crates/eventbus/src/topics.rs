//! Wire payloads for the six Event Bus topics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A persisted, ordered chat message. Published once per successful mailbox
/// turn (human, agent, or world-attributed).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    pub message_id: Uuid,
    pub chat_id: Uuid,
    pub role: MessageRole,
    pub sender: String,
    pub content: String,
    pub reply_to_message_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SseEventType {
    Start,
    Chunk,
    End,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// One frame of a streaming LLM response. `start`/`chunk`/`end`/`error` for a
/// given `message_id` are always emitted in that order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SseEvent {
    pub event_type: SseEventType,
    pub message_id: Uuid,
    pub agent_name: String,
    pub content: Option<String>,
    pub error: Option<String>,
    pub chat_id: Option<Uuid>,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ToolEventType {
    ToolStart,
    ToolProgress,
    ToolResult,
    ToolError,
}

/// A provider-triggered tool-call lifecycle notification, independent of the
/// text chunks on the `sse` topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolEvent {
    pub event_type: ToolEventType,
    pub tool_use_id: String,
    pub tool_name: String,
    pub tool_input: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub chat_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ActivityEventType {
    ResponseStart,
    Update,
    Idle,
    ResponseEnd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub event_type: ActivityEventType,
    pub pending_operations: u32,
    pub activity_id: String,
    pub source: String,
    pub active_sources: Vec<String>,
    pub chat_id: Option<Uuid>,
}

/// Structured, free-form notifications: `chat-title-updated`,
/// `hitl-option-request`, and similar world-level announcements.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemEvent {
    pub kind: String,
    pub data: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// One process-wide structured log record, fanned out through the global
/// Log Stream and mirrored onto every world's `log` topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub level: LogLevel,
    pub category: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub data: Option<Value>,
    pub message_id: Option<Uuid>,
}
