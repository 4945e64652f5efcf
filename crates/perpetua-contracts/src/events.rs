// Typed step events streamed to clients over SSE
//
// Each variant maps to one SSE frame (`event: <kind>\ndata: <json>\n\n`).
// `Message` carries an OpenAI-compatible chat.completion.chunk delta.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Step event produced by the agent loop driver
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepEvent {
    StepStart(StepStartEvent),
    ToolCall(ToolCallEvent),
    ToolResult(ToolResultEvent),
    StepEnd(StepEndEvent),
    Thinking(ThinkingEvent),
    Error(ErrorEvent),
    Message(MessageEvent),
    Done(DoneEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepStartEvent {
    pub step: i32,
    pub max_steps: i32,
    pub description: String,
    pub status: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallEvent {
    pub step: i32,
    pub tool: String,
    pub args: Value,
    pub status: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResultEvent {
    pub step: i32,
    pub tool: String,
    pub result: Value,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepEndEvent {
    pub step: i32,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThinkingEvent {
    pub step: i32,
    pub content: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorEvent {
    pub step: i32,
    pub message: String,
    pub timestamp: i64,
}

/// OpenAI delta-style chunk payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageEvent {
    pub id: String,
    pub object: String,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkChoice {
    pub delta: ChunkDelta,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkDelta {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DoneEvent {
    pub finish_reason: String,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

impl StepEvent {
    pub fn step_start(step: i32, max_steps: i32, description: impl Into<String>) -> Self {
        StepEvent::StepStart(StepStartEvent {
            step,
            max_steps,
            description: description.into(),
            status: "running".to_string(),
            timestamp: now_millis(),
        })
    }

    pub fn tool_call(step: i32, tool: impl Into<String>, args: Value) -> Self {
        StepEvent::ToolCall(ToolCallEvent {
            step,
            tool: tool.into(),
            args,
            status: "running".to_string(),
            timestamp: now_millis(),
        })
    }

    pub fn tool_result(
        step: i32,
        tool: impl Into<String>,
        result: Value,
        success: bool,
        duration_ms: Option<i64>,
    ) -> Self {
        StepEvent::ToolResult(ToolResultEvent {
            step,
            tool: tool.into(),
            result,
            success,
            duration_ms,
            timestamp: now_millis(),
        })
    }

    pub fn step_end(step: i32, status: impl Into<String>, duration_ms: Option<i64>) -> Self {
        StepEvent::StepEnd(StepEndEvent {
            step,
            status: status.into(),
            duration_ms,
            timestamp: now_millis(),
        })
    }

    pub fn thinking(step: i32, content: impl Into<String>) -> Self {
        StepEvent::Thinking(ThinkingEvent {
            step,
            content: content.into(),
            timestamp: now_millis(),
        })
    }

    pub fn error(step: i32, message: impl Into<String>) -> Self {
        StepEvent::Error(ErrorEvent {
            step,
            message: message.into(),
            timestamp: now_millis(),
        })
    }

    pub fn message(session: impl Into<String>, model: impl Into<String>, delta: impl Into<String>) -> Self {
        StepEvent::Message(MessageEvent {
            id: session.into(),
            object: "chat.completion.chunk".to_string(),
            model: model.into(),
            choices: vec![ChunkChoice {
                delta: ChunkDelta {
                    content: delta.into(),
                },
            }],
        })
    }

    pub fn done(finish_reason: impl Into<String>) -> Self {
        StepEvent::Done(DoneEvent {
            finish_reason: finish_reason.into(),
        })
    }

    /// SSE event name for this variant
    pub fn kind(&self) -> &'static str {
        match self {
            StepEvent::StepStart(_) => "step_start",
            StepEvent::ToolCall(_) => "tool_call",
            StepEvent::ToolResult(_) => "tool_result",
            StepEvent::StepEnd(_) => "step_end",
            StepEvent::Thinking(_) => "thinking",
            StepEvent::Error(_) => "error",
            StepEvent::Message(_) => "message",
            StepEvent::Done(_) => "done",
        }
    }

    /// JSON payload as carried on the SSE `data:` line
    pub fn payload(&self) -> Value {
        match self {
            StepEvent::StepStart(e) => serde_json::to_value(e).unwrap_or(Value::Null),
            StepEvent::ToolCall(e) => serde_json::to_value(e).unwrap_or(Value::Null),
            StepEvent::ToolResult(e) => serde_json::to_value(e).unwrap_or(Value::Null),
            StepEvent::StepEnd(e) => serde_json::to_value(e).unwrap_or(Value::Null),
            StepEvent::Thinking(e) => serde_json::to_value(e).unwrap_or(Value::Null),
            StepEvent::Error(e) => serde_json::to_value(e).unwrap_or(Value::Null),
            StepEvent::Message(e) => serde_json::to_value(e).unwrap_or(Value::Null),
            StepEvent::Done(e) => serde_json::to_value(e).unwrap_or(Value::Null),
        }
    }

    /// Content delta carried by a `message` event, if any
    pub fn delta_content(&self) -> Option<&str> {
        match self {
            StepEvent::Message(e) => e.choices.first().map(|c| c.delta.content.as_str()),
            _ => None,
        }
    }

    /// Merge another `message` event's delta into this one (backpressure coalescing)
    pub fn coalesce_delta(&mut self, other: &StepEvent) -> bool {
        if let (StepEvent::Message(mine), StepEvent::Message(theirs)) = (&mut *self, other) {
            if let (Some(dst), Some(src)) = (mine.choices.first_mut(), theirs.choices.first()) {
                dst.delta.content.push_str(&src.delta.content);
                return true;
            }
        }
        false
    }
}
