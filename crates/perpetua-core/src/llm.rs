// LLM driver abstraction
//
// Drivers speak an OpenAI-style chat-completions protocol with streaming and
// tool calling. The loop consumes the stream incrementally so text deltas can
// be re-emitted to clients as they arrive.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde_json::{json, Value};

use perpetua_contracts::ChatMessage;

use crate::error::Result;

/// Function-tool schema presented to the LLM
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolSchema {
    pub fn to_openai(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// tool_choice parameter
#[derive(Debug, Clone, PartialEq)]
pub enum ToolChoice {
    Auto,
    Required,
    None,
    /// Force a specific function by name
    Function(String),
}

impl ToolChoice {
    pub fn to_value(&self) -> Value {
        match self {
            ToolChoice::Auto => json!("auto"),
            ToolChoice::Required => json!("required"),
            ToolChoice::None => json!("none"),
            ToolChoice::Function(name) => json!({
                "type": "function",
                "function": {"name": name}
            }),
        }
    }
}

/// Configuration for one chat-completions call
#[derive(Debug, Clone)]
pub struct LlmCallConfig {
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub tools: Vec<ToolSchema>,
    pub tool_choice: Option<ToolChoice>,
    pub parallel_tool_calls: bool,
    /// Structured-output response format (json_schema), if any
    pub response_format: Option<Value>,
    /// Per-call deadline
    pub timeout: Duration,
}

impl LlmCallConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: None,
            max_tokens: None,
            tools: Vec::new(),
            tool_choice: None,
            parallel_tool_calls: false,
            response_format: None,
            timeout: Duration::from_secs(120),
        }
    }
}

/// One tool call requested by the model, with decoded arguments
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Incremental event from a streaming completion
#[derive(Debug, Clone)]
pub enum LlmStreamEvent {
    /// Content delta
    TextDelta(String),
    /// Fully accumulated tool calls (emitted once, at finish)
    ToolCalls(Vec<ToolCallRequest>),
    /// Stream finished
    Done { finish_reason: Option<String> },
    /// Provider-side stream fault
    Error(String),
}

pub type LlmResponseStream = Pin<Box<dyn Stream<Item = Result<LlmStreamEvent>> + Send>>;

/// Accumulated result of one completion call
#[derive(Debug, Clone, Default)]
pub struct LlmTurn {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub finish_reason: Option<String>,
}

/// Streaming chat-completions driver
#[async_trait]
pub trait LlmDriver: Send + Sync {
    async fn chat_stream(
        &self,
        messages: Vec<ChatMessage>,
        config: &LlmCallConfig,
    ) -> Result<LlmResponseStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_choice_wire_forms() {
        assert_eq!(ToolChoice::Required.to_value(), json!("required"));
        assert_eq!(
            ToolChoice::Function("ReasoningTool".into()).to_value(),
            json!({"type": "function", "function": {"name": "ReasoningTool"}})
        );
    }

    #[test]
    fn tool_schema_openai_shape() {
        let schema = ToolSchema {
            name: "EchoTool".into(),
            description: "echo".into(),
            parameters: json!({"type": "object", "properties": {}}),
        };
        let wire = schema.to_openai();
        assert_eq!(wire["type"], "function");
        assert_eq!(wire["function"]["name"], "EchoTool");
    }
}
