// OpenAI protocol LLM driver
//
// Base implementation of the OpenAI chat-completions protocol, usable with
// any OpenAI-compatible endpoint. Supports streaming, tool calls, forced
// tool_choice, parallel tool calls, and structured response formats.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use perpetua_contracts::ChatMessage;

use crate::error::{Result, RuntimeError};
use crate::llm::{LlmCallConfig, LlmDriver, LlmResponseStream, LlmStreamEvent, ToolCallRequest};

const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-protocol driver over reqwest with SSE decoding
#[derive(Clone)]
pub struct OpenAiDriver {
    client: Client,
    api_key: String,
    api_url: String,
}

impl OpenAiDriver {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            api_url: DEFAULT_API_URL.to_string(),
        }
    }

    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| RuntimeError::llm("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self::new(api_key))
    }

    /// Driver against a custom OpenAI-compatible endpoint
    pub fn with_base_url(api_key: impl Into<String>, api_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            api_url: api_url.into(),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }
}

impl std::fmt::Debug for OpenAiDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiDriver")
            .field("api_url", &self.api_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl LlmDriver for OpenAiDriver {
    async fn chat_stream(
        &self,
        messages: Vec<ChatMessage>,
        config: &LlmCallConfig,
    ) -> Result<LlmResponseStream> {
        let tools: Option<Vec<Value>> = if config.tools.is_empty() {
            None
        } else {
            Some(config.tools.iter().map(|t| t.to_openai()).collect())
        };

        let request = OpenAiRequest {
            model: &config.model,
            messages: &messages,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            stream: true,
            tool_choice: config.tool_choice.as_ref().map(|c| c.to_value()),
            parallel_tool_calls: if tools.is_some() {
                Some(config.parallel_tool_calls)
            } else {
                None
            },
            tools,
            response_format: config.response_format.as_ref(),
        };

        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .timeout(config.timeout)
            .send()
            .await
            .map_err(|e| RuntimeError::llm(format!("failed to send request: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(RuntimeError::llm(format!(
                "chat completions error ({status}): {error_text}"
            )));
        }

        let event_stream = response.bytes_stream().eventsource();
        let accumulated_tool_calls = Arc::new(Mutex::new(Vec::<PartialToolCall>::new()));

        let converted: LlmResponseStream = Box::pin(event_stream.map(move |result| {
            let accumulated = Arc::clone(&accumulated_tool_calls);
            match result {
                Ok(event) => {
                    if event.data == "[DONE]" {
                        return Ok(LlmStreamEvent::Done {
                            finish_reason: None,
                        });
                    }
                    match serde_json::from_str::<StreamChunk>(&event.data) {
                        Ok(chunk) => Ok(process_chunk(chunk, &accumulated)),
                        Err(e) => Ok(LlmStreamEvent::Error(format!("failed to parse chunk: {e}"))),
                    }
                }
                Err(e) => Ok(LlmStreamEvent::Error(format!("stream error: {e}"))),
            }
        }));

        Ok(converted)
    }
}

fn process_chunk(chunk: StreamChunk, accumulated: &Mutex<Vec<PartialToolCall>>) -> LlmStreamEvent {
    let Some(choice) = chunk.choices.into_iter().next() else {
        return LlmStreamEvent::TextDelta(String::new());
    };

    if let Some(tool_calls) = choice.delta.tool_calls {
        let mut acc = accumulated.lock().unwrap_or_else(|e| e.into_inner());
        for tc in tool_calls {
            let idx = tc.index as usize;
            while acc.len() <= idx {
                acc.push(PartialToolCall::default());
            }
            if let Some(id) = tc.id {
                acc[idx].id = id;
            }
            if let Some(function) = tc.function {
                if let Some(name) = function.name {
                    acc[idx].name = name;
                }
                if let Some(args) = function.arguments {
                    acc[idx].arguments.push_str(&args);
                }
            }
        }
        return LlmStreamEvent::TextDelta(String::new());
    }

    if let Some(content) = choice.delta.content {
        return LlmStreamEvent::TextDelta(content);
    }

    if let Some(finish_reason) = choice.finish_reason {
        if finish_reason == "tool_calls" {
            let calls = {
                let mut acc = accumulated.lock().unwrap_or_else(|e| e.into_inner());
                std::mem::take(&mut *acc)
            };
            if !calls.is_empty() {
                return LlmStreamEvent::ToolCalls(
                    calls.into_iter().map(PartialToolCall::into_request).collect(),
                );
            }
        }
        return LlmStreamEvent::Done {
            finish_reason: Some(finish_reason),
        };
    }

    LlmStreamEvent::TextDelta(String::new())
}

/// Tool call under accumulation across stream chunks
#[derive(Debug, Default, Clone)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl PartialToolCall {
    fn into_request(self) -> ToolCallRequest {
        let arguments = if self.arguments.is_empty() {
            json!({})
        } else {
            serde_json::from_str(&self.arguments).unwrap_or(json!({}))
        };
        ToolCallRequest {
            id: self.id,
            name: self.name,
            arguments,
        }
    }
}

// Wire types

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parallel_tool_calls: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<&'a Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCall {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunction>,
}

#[derive(Debug, Deserialize)]
struct StreamFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(data: &str) -> StreamChunk {
        serde_json::from_str(data).unwrap()
    }

    #[test]
    fn content_delta_passes_through() {
        let acc = Mutex::new(Vec::new());
        let event = process_chunk(
            chunk(r#"{"choices":[{"delta":{"content":"hel"}}]}"#),
            &acc,
        );
        assert!(matches!(event, LlmStreamEvent::TextDelta(ref s) if s == "hel"));
    }

    #[test]
    fn tool_call_fragments_accumulate_across_chunks() {
        let acc = Mutex::new(Vec::new());
        process_chunk(
            chunk(
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"EchoTool","arguments":"{\"mess"}}]}}]}"#,
            ),
            &acc,
        );
        process_chunk(
            chunk(
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"age\":\"hi\"}"}}]}}]}"#,
            ),
            &acc,
        );
        let event = process_chunk(
            chunk(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#),
            &acc,
        );
        match event {
            LlmStreamEvent::ToolCalls(calls) => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].id, "call_1");
                assert_eq!(calls[0].name, "EchoTool");
                assert_eq!(calls[0].arguments["message"], "hi");
            }
            other => panic!("expected tool calls, got {other:?}"),
        }
    }

    #[test]
    fn parallel_tool_calls_keep_emission_order() {
        let acc = Mutex::new(Vec::new());
        process_chunk(
            chunk(
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"a","function":{"name":"WebSearchTool","arguments":"{}"}},{"index":1,"id":"b","function":{"name":"WebSearchTool","arguments":"{}"}}]}}]}"#,
            ),
            &acc,
        );
        let event = process_chunk(
            chunk(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#),
            &acc,
        );
        match event {
            LlmStreamEvent::ToolCalls(calls) => {
                assert_eq!(calls[0].id, "a");
                assert_eq!(calls[1].id, "b");
            }
            other => panic!("expected tool calls, got {other:?}"),
        }
    }

    #[test]
    fn plain_finish_reports_done() {
        let acc = Mutex::new(Vec::new());
        let event = process_chunk(
            chunk(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#),
            &acc,
        );
        assert!(matches!(
            event,
            LlmStreamEvent::Done { finish_reason: Some(ref r) } if r == "stop"
        ));
    }

    #[test]
    fn malformed_arguments_fall_back_to_empty_object() {
        let partial = PartialToolCall {
            id: "x".into(),
            name: "T".into(),
            arguments: "not json".into(),
        };
        assert_eq!(partial.into_request().arguments, json!({}));
    }
}
