// Session message DTOs and OpenAI-compatible chat message shapes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

/// Message role (OpenAI-compatible)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }
}

impl From<&str> for MessageRole {
    fn from(s: &str) -> Self {
        match s {
            "system" => MessageRole::System,
            "assistant" => MessageRole::Assistant,
            "tool" => MessageRole::Tool,
            _ => MessageRole::User,
        }
    }
}

/// Kind of a persisted session message
///
/// `Message` rows form the LLM-visible conversation; the other kinds are
/// step records surfaced to UIs but excluded from the LLM replay.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Message,
    StepStart,
    ToolCall,
    ToolResult,
    StepEnd,
    Thinking,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Message => "message",
            MessageType::StepStart => "step_start",
            MessageType::ToolCall => "tool_call",
            MessageType::ToolResult => "tool_result",
            MessageType::StepEnd => "step_end",
            MessageType::Thinking => "thinking",
            MessageType::Error => "error",
        }
    }
}

impl From<&str> for MessageType {
    fn from(s: &str) -> Self {
        match s {
            "step_start" => MessageType::StepStart,
            "tool_call" => MessageType::ToolCall,
            "tool_result" => MessageType::ToolResult,
            "step_end" => MessageType::StepEnd,
            "thinking" => MessageType::Thinking,
            "error" => MessageType::Error,
            _ => MessageType::Message,
        }
    }
}

/// Persisted session message with a per-session gap-free sequence
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SessionMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub seq: i64,
    pub role: MessageRole,
    /// Full OpenAI-shaped message object for `Message` rows; step payload otherwise
    pub content: Value,
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_number: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_data: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Message to append (sequence assigned by the store)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSessionMessage {
    pub role: MessageRole,
    pub content: Value,
    pub message_type: MessageType,
    pub step_number: Option<i32>,
    pub step_data: Option<Value>,
}

impl NewSessionMessage {
    pub fn conversation(message: &ChatMessage) -> Self {
        Self {
            role: MessageRole::from(message.role.as_str()),
            content: serde_json::to_value(message).unwrap_or(Value::Null),
            message_type: MessageType::Message,
            step_number: None,
            step_data: None,
        }
    }

    pub fn step(
        role: MessageRole,
        message_type: MessageType,
        step_number: i32,
        step_data: Value,
    ) -> Self {
        Self {
            role,
            content: Value::Null,
            message_type,
            step_number: Some(step_number),
            step_data: Some(step_data),
        }
    }
}

/// Function payload inside a tool call
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ToolFunctionPayload {
    pub name: String,
    /// JSON-encoded arguments string, as on the OpenAI wire
    pub arguments: String,
}

/// Tool call attached to an assistant message
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ToolCallPayload {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolFunctionPayload,
}

impl ToolCallPayload {
    pub fn function(id: impl Into<String>, name: impl Into<String>, arguments: &Value) -> Self {
        Self {
            id: id.into(),
            kind: "function".to_string(),
            function: ToolFunctionPayload {
                name: name.into(),
                arguments: serde_json::to_string(arguments).unwrap_or_default(),
            },
        }
    }
}

/// OpenAI-compatible chat message
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallPayload>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn text(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_tool_calls(tool_calls: Vec<ToolCallPayload>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: None,
            tool_calls: Some(tool_calls),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    /// Plain-text view of the content
    pub fn content_text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}
