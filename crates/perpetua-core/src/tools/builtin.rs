// Builtin tools
//
// The synthetic tools (Reasoning, FinalAnswer, Clarification) run entirely
// locally and drive the session state machine. The research tools are thin
// HTTP contracts; their backends are configured per catalog row.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use perpetua_contracts::SessionState;

use crate::context::ReasoningSummary;
use crate::tools::{AgentTool, ToolContext, ToolExecutionResult, ToolRegistry};
use crate::traits::ToolStore;

pub const REASONING_TOOL: &str = "ReasoningTool";
pub const FINAL_ANSWER_TOOL: &str = "FinalAnswerTool";
pub const CLARIFICATION_TOOL: &str = "ClarificationTool";

/// Case-insensitive name match against a canonical tool name
pub fn is_tool(name: &str, canonical: &str) -> bool {
    name.eq_ignore_ascii_case(canonical)
}

fn invalid_args(tool: &str, error: impl std::fmt::Display) -> ToolExecutionResult {
    ToolExecutionResult::tool_error(format!("invalid arguments for {tool}: {error}"))
}

// ============================================================================
// ReasoningTool
// ============================================================================

#[derive(Debug, Deserialize)]
struct ReasoningArgs {
    #[serde(default)]
    current_situation: String,
    #[serde(default)]
    enough_data: bool,
    #[serde(default)]
    remaining_steps: Vec<String>,
    #[serde(default)]
    task_completed: bool,
}

/// Adaptive planning step; always executed locally, never over the network
pub struct ReasoningTool;

#[async_trait]
impl AgentTool for ReasoningTool {
    fn name(&self) -> &'static str {
        REASONING_TOOL
    }

    fn description(&self) -> &'static str {
        "Determine the next reasoning step with adaptive planning. \
         Use this tool before any other tool execution. Keep all text fields concise."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "reasoning_steps": {
                    "type": "array", "items": {"type": "string"},
                    "description": "Step-by-step reasoning (brief, 1 sentence each)",
                    "minItems": 1, "maxItems": 10
                },
                "current_situation": {
                    "type": "string", "maxLength": 300,
                    "description": "Current research situation (2-3 sentences MAX)"
                },
                "plan_status": {
                    "type": "string", "maxLength": 150,
                    "description": "Status of current plan (1 sentence)"
                },
                "enough_data": {
                    "type": "boolean",
                    "description": "Sufficient data collected for a comprehensive answer?"
                },
                "remaining_steps": {
                    "type": "array", "items": {"type": "string"}, "maxItems": 10,
                    "description": "Remaining steps (empty if task_completed=true)"
                },
                "task_completed": {
                    "type": "boolean",
                    "description": "Is the task finished?"
                }
            },
            "required": ["reasoning_steps", "task_completed"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> ToolExecutionResult {
        let parsed: ReasoningArgs = match serde_json::from_value(args.clone()) {
            Ok(parsed) => parsed,
            Err(e) => return invalid_args(REASONING_TOOL, e),
        };
        ctx.with_context(|context| {
            context.last_reasoning = Some(ReasoningSummary {
                current_situation: parsed.current_situation,
                remaining_steps: parsed.remaining_steps,
                enough_data: parsed.enough_data,
                task_completed: parsed.task_completed,
            });
        });
        ToolExecutionResult::Success(args)
    }
}

// ============================================================================
// FinalAnswerTool
// ============================================================================

#[derive(Debug, Deserialize)]
struct FinalAnswerArgs {
    answer: String,
    status: FinalAnswerStatus,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
enum FinalAnswerStatus {
    Completed,
    Failed,
}

/// Finalize the task and complete the session
pub struct FinalAnswerTool;

#[async_trait]
impl AgentTool for FinalAnswerTool {
    fn name(&self) -> &'static str {
        FINAL_ANSWER_TOOL
    }

    fn description(&self) -> &'static str {
        "Finalize the task and provide the final answer to the user. \
         Call after all steps are completed and the answer is verified."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "reasoning": {
                    "type": "string",
                    "description": "Why the task is now complete and how the answer was verified"
                },
                "completed_steps": {
                    "type": "array", "items": {"type": "string"},
                    "minItems": 1, "maxItems": 5,
                    "description": "Summary of completed steps including verification"
                },
                "answer": {
                    "type": "string",
                    "description": "Comprehensive final answer with EXACT factual details"
                },
                "status": {
                    "type": "string", "enum": ["completed", "failed"],
                    "description": "Task completion status"
                }
            },
            "required": ["answer", "status"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> ToolExecutionResult {
        let parsed: FinalAnswerArgs = match serde_json::from_value(args.clone()) {
            Ok(parsed) => parsed,
            Err(e) => return invalid_args(FINAL_ANSWER_TOOL, e),
        };
        let state = match parsed.status {
            FinalAnswerStatus::Completed => SessionState::Completed,
            FinalAnswerStatus::Failed => SessionState::Failed,
        };
        ctx.request_state(state);
        ctx.with_context(|context| {
            context.execution_result = Some(parsed.answer);
        });
        ToolExecutionResult::Success(args)
    }
}

// ============================================================================
// ClarificationTool
// ============================================================================

#[derive(Debug, Deserialize)]
struct ClarificationArgs {
    questions: Vec<String>,
}

/// Ask clarifying questions; suspends the session durably
///
/// Sets the session state to WAITING_FOR_CLARIFICATION. The run completes
/// and the next user message resumes the session.
pub struct ClarificationTool;

#[async_trait]
impl AgentTool for ClarificationTool {
    fn name(&self) -> &'static str {
        CLARIFICATION_TOOL
    }

    fn description(&self) -> &'static str {
        "Ask clarifying questions when facing an ambiguous request. \
         Keep reasoning brief, terms short, and questions clear and direct."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "reasoning": {
                    "type": "string", "maxLength": 200,
                    "description": "Why clarification is needed (1-2 sentences MAX)"
                },
                "unclear_terms": {
                    "type": "array", "items": {"type": "string"},
                    "minItems": 1, "maxItems": 3,
                    "description": "List of unclear terms (brief, 1-3 words each)"
                },
                "assumptions": {
                    "type": "array", "items": {"type": "string"},
                    "minItems": 2, "maxItems": 3,
                    "description": "Possible interpretations (short, 1 sentence each)"
                },
                "questions": {
                    "type": "array", "items": {"type": "string"},
                    "minItems": 1, "maxItems": 3,
                    "description": "Specific clarifying questions (short and direct)"
                }
            },
            "required": ["questions"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> ToolExecutionResult {
        let parsed: ClarificationArgs = match serde_json::from_value(args) {
            Ok(parsed) => parsed,
            Err(e) => return invalid_args(CLARIFICATION_TOOL, e),
        };
        let already_requested = ctx.with_context(|context| {
            if context.clarification_requested {
                return true;
            }
            context.clarification_requested = true;
            context.pending_clarification = parsed.questions.clone();
            false
        });
        if already_requested {
            return ToolExecutionResult::tool_error(
                "clarification already requested for this session; proceed with other tools",
            );
        }
        ctx.request_state(SessionState::WaitingForClarification);
        ToolExecutionResult::Success(Value::String(parsed.questions.join("\n")))
    }
}

// ============================================================================
// WebSearchTool
// ============================================================================

#[derive(Debug, Deserialize)]
struct WebSearchArgs {
    query: String,
    #[serde(default)]
    max_results: Option<u32>,
}

/// Web search over a Tavily-style HTTP backend
///
/// Config keys: `endpoint`, `api_key` (usually via `api_key_ref`),
/// `max_results`.
pub struct WebSearchTool {
    http: reqwest::Client,
}

impl WebSearchTool {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl AgentTool for WebSearchTool {
    fn name(&self) -> &'static str {
        "WebSearchTool"
    }

    fn description(&self) -> &'static str {
        "Search the web for current information and facts. \
         Returns ranked results with title, url, and content snippets."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Search query"},
                "max_results": {
                    "type": "integer", "minimum": 1, "maximum": 10,
                    "description": "Number of results to return"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> ToolExecutionResult {
        let parsed: WebSearchArgs = match serde_json::from_value(args) {
            Ok(parsed) => parsed,
            Err(e) => return invalid_args("WebSearchTool", e),
        };
        let Some(endpoint) = ctx.config_str("endpoint").map(str::to_string) else {
            return ToolExecutionResult::tool_error("search backend not configured");
        };
        let api_key = ctx.config_str("api_key").unwrap_or_default().to_string();
        let max_results = parsed
            .max_results
            .or_else(|| ctx.config.get("max_results").and_then(Value::as_u64).map(|v| v as u32))
            .unwrap_or(5);

        let response = self
            .http
            .post(&endpoint)
            .json(&json!({
                "api_key": api_key,
                "query": parsed.query,
                "max_results": max_results,
            }))
            .send()
            .await;

        let response = match response {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                return ToolExecutionResult::tool_error(format!(
                    "search backend returned {}",
                    r.status()
                ))
            }
            Err(e) => return ToolExecutionResult::internal_error(format!("search request failed: {e}")),
        };

        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) => return ToolExecutionResult::internal_error(format!("invalid search response: {e}")),
        };

        let results: Vec<Value> = body
            .get("results")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .take(max_results as usize)
                    .map(|item| {
                        json!({
                            "title": item.get("title").and_then(Value::as_str).unwrap_or(""),
                            "url": item.get("url").and_then(Value::as_str).unwrap_or(""),
                            "content": item.get("content").and_then(Value::as_str).unwrap_or(""),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        ctx.with_context(|context| {
            context.searches_used += 1;
            for result in &results {
                if let Some(url) = result.get("url").and_then(Value::as_str) {
                    if !url.is_empty() {
                        let title = result
                            .get("title")
                            .and_then(Value::as_str)
                            .filter(|t| !t.is_empty())
                            .map(str::to_string);
                        context.add_source(url, title);
                    }
                }
            }
        });

        ToolExecutionResult::success(json!({"results": results}))
    }
}

// ============================================================================
// ExtractPageContentTool
// ============================================================================

#[derive(Debug, Deserialize)]
struct ExtractPageArgs {
    url: String,
}

const MAX_EXTRACT_CHARS: usize = 8000;

/// Fetch a page and return its text content, tags stripped
pub struct ExtractPageContentTool {
    http: reqwest::Client,
}

impl ExtractPageContentTool {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl AgentTool for ExtractPageContentTool {
    fn name(&self) -> &'static str {
        "ExtractPageContentTool"
    }

    fn description(&self) -> &'static str {
        "Extract the full text content of a web page by URL. \
         Use for URLs found in search results."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "Page URL to extract"}
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> ToolExecutionResult {
        let parsed: ExtractPageArgs = match serde_json::from_value(args) {
            Ok(parsed) => parsed,
            Err(e) => return invalid_args("ExtractPageContentTool", e),
        };

        let response = match self.http.get(&parsed.url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                return ToolExecutionResult::tool_error(format!("page returned {}", r.status()))
            }
            Err(e) => return ToolExecutionResult::tool_error(format!("failed to fetch page: {e}")),
        };

        let html = match response.text().await {
            Ok(text) => text,
            Err(e) => return ToolExecutionResult::internal_error(format!("failed to read page body: {e}")),
        };

        let mut content = strip_tags(&html);
        content.truncate(MAX_EXTRACT_CHARS);

        ctx.with_context(|context| context.add_source(parsed.url.clone(), None));

        ToolExecutionResult::success(json!({"url": parsed.url, "content": content}))
    }
}

/// Crude tag stripper; enough for feeding page text to an LLM
fn strip_tags(html: &str) -> String {
    let mut output = String::with_capacity(html.len() / 2);
    let mut in_tag = false;
    let mut last_was_space = true;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => {
                if ch.is_whitespace() {
                    if !last_was_space {
                        output.push(' ');
                        last_was_space = true;
                    }
                } else {
                    output.push(ch);
                    last_was_space = false;
                }
            }
            _ => {}
        }
    }
    output.trim().to_string()
}

// ============================================================================
// ChatHistorySearchTool
// ============================================================================

#[derive(Debug, Deserialize)]
struct ChatHistorySearchArgs {
    query: String,
    #[serde(default)]
    limit: Option<i64>,
}

/// Full-text search over past chat turns
pub struct ChatHistorySearchTool {
    store: Arc<dyn ToolStore>,
}

impl ChatHistorySearchTool {
    pub fn new(store: Arc<dyn ToolStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AgentTool for ChatHistorySearchTool {
    fn name(&self) -> &'static str {
        "ChatHistorySearchTool"
    }

    fn description(&self) -> &'static str {
        "Search previous conversation turns for relevant questions and answers."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Search query"},
                "limit": {
                    "type": "integer", "minimum": 1, "maximum": 20,
                    "description": "Max turns to return"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> ToolExecutionResult {
        let parsed: ChatHistorySearchArgs = match serde_json::from_value(args) {
            Ok(parsed) => parsed,
            Err(e) => return invalid_args("ChatHistorySearchTool", e),
        };
        let scope = if ctx.with_context(|c| c.search_all_chats) {
            None
        } else {
            Some(ctx.session_id)
        };
        let limit = parsed.limit.unwrap_or(5).clamp(1, 20);

        match self.store.search_chat_turns(&parsed.query, scope, limit).await {
            Ok(turns) => {
                let matches: Vec<Value> = turns
                    .iter()
                    .map(|turn| {
                        json!({
                            "question": turn.question,
                            "answer": turn.answer,
                            "model": turn.model_name,
                            "created_at": turn.created_at.to_rfc3339(),
                        })
                    })
                    .collect();
                ToolExecutionResult::success(json!({"matches": matches}))
            }
            Err(e) => ToolExecutionResult::internal_error(format!("chat turn search failed: {e}")),
        }
    }
}

// ============================================================================
// EchoTool
// ============================================================================

#[derive(Debug, Deserialize)]
struct EchoArgs {
    message: String,
}

/// Diagnostic tool that echoes its input
pub struct EchoTool;

#[async_trait]
impl AgentTool for EchoTool {
    fn name(&self) -> &'static str {
        "EchoTool"
    }

    fn description(&self) -> &'static str {
        "Echo a message back. Diagnostic tool."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": {"type": "string", "description": "Message to echo"}
            },
            "required": ["message"]
        })
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> ToolExecutionResult {
        let parsed: EchoArgs = match serde_json::from_value(args) {
            Ok(parsed) => parsed,
            Err(e) => return invalid_args("EchoTool", e),
        };
        ToolExecutionResult::success(json!({"echoed": parsed.message}))
    }
}

// ============================================================================
// Default registry
// ============================================================================

/// Dependencies shared by builtin tools
#[derive(Clone)]
pub struct BuiltinDeps {
    pub http: reqwest::Client,
    pub store: Option<Arc<dyn ToolStore>>,
}

impl Default for BuiltinDeps {
    fn default() -> Self {
        Self {
            http: reqwest::Client::new(),
            store: None,
        }
    }
}

/// Registry with every builtin tool under its canonical binding
pub fn builtin_registry(deps: BuiltinDeps) -> ToolRegistry {
    let mut builder = ToolRegistry::builder()
        .tool_with_binding(ReasoningTool, "perpetua.tools.reasoning:ReasoningTool")
        .tool_with_binding(FinalAnswerTool, "perpetua.tools.final_answer:FinalAnswerTool")
        .tool_with_binding(ClarificationTool, "perpetua.tools.clarification:ClarificationTool")
        .tool_with_binding(
            WebSearchTool::new(deps.http.clone()),
            "perpetua.tools.research:WebSearchTool",
        )
        .tool_with_binding(
            ExtractPageContentTool::new(deps.http.clone()),
            "perpetua.tools.research:ExtractPageContentTool",
        )
        .tool_with_binding(EchoTool, "perpetua.tools.diagnostics:EchoTool");
    if let Some(store) = deps.store {
        builder = builder.tool_with_binding(
            ChatHistorySearchTool::new(store),
            "perpetua.tools.memory:ChatHistorySearchTool",
        );
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SessionContext;
    use uuid::Uuid;

    fn ctx() -> ToolContext {
        ToolContext::new(Uuid::new_v4(), SessionContext::default())
    }

    #[tokio::test]
    async fn reasoning_tool_updates_last_reasoning() {
        let ctx = ctx();
        let result = ReasoningTool
            .execute(
                &ctx,
                json!({
                    "reasoning_steps": ["search first"],
                    "remaining_steps": ["compare results"],
                    "task_completed": false
                }),
            )
            .await;
        assert!(matches!(result, ToolExecutionResult::Success(_)));
        let reasoning = ctx.snapshot().last_reasoning.unwrap();
        assert_eq!(reasoning.remaining_steps, vec!["compare results".to_string()]);
        assert!(!reasoning.task_completed);
    }

    #[tokio::test]
    async fn final_answer_completes_the_session() {
        let ctx = ctx();
        FinalAnswerTool
            .execute(
                &ctx,
                json!({"answer": "42", "status": "completed"}),
            )
            .await;
        assert_eq!(ctx.requested_state(), Some(SessionState::Completed));
        assert_eq!(ctx.snapshot().execution_result.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn final_answer_failed_status_fails_the_session() {
        let ctx = ctx();
        FinalAnswerTool
            .execute(&ctx, json!({"answer": "could not verify", "status": "failed"}))
            .await;
        assert_eq!(ctx.requested_state(), Some(SessionState::Failed));
    }

    #[tokio::test]
    async fn clarification_suspends_once() {
        let ctx = ctx();
        let args = json!({"questions": ["Which PDF?", "What language?"]});
        let first = ClarificationTool.execute(&ctx, args.clone()).await;
        assert!(matches!(first, ToolExecutionResult::Success(_)));
        assert_eq!(
            ctx.requested_state(),
            Some(SessionState::WaitingForClarification)
        );
        assert_eq!(ctx.snapshot().pending_clarification.len(), 2);

        let second = ClarificationTool.execute(&ctx, args).await;
        assert!(matches!(second, ToolExecutionResult::ToolError(_)));
    }

    #[tokio::test]
    async fn web_search_without_endpoint_is_a_tool_error() {
        let ctx = ctx();
        let tool = WebSearchTool::new(reqwest::Client::new());
        let result = tool.execute(&ctx, json!({"query": "rust"})).await;
        assert!(matches!(result, ToolExecutionResult::ToolError(_)));
        // No outbound call happened, so no search was counted
        assert_eq!(ctx.snapshot().searches_used, 0);
    }

    #[tokio::test]
    async fn echo_round_trips_message() {
        let result = EchoTool.execute(&ctx(), json!({"message": "hi"})).await;
        match result {
            ToolExecutionResult::Success(value) => assert_eq!(value["echoed"], "hi"),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn strip_tags_collapses_whitespace() {
        let text = strip_tags("<html><body><h1>Title</h1>\n<p>Some   text</p></body></html>");
        assert_eq!(text, "Title Some text");
    }

    #[test]
    fn builtin_registry_resolves_canonical_bindings() {
        let registry = builtin_registry(BuiltinDeps::default());
        assert!(registry
            .resolve_binding("perpetua.tools.reasoning:ReasoningTool")
            .is_some());
        assert!(registry.get("finalanswertool").is_some());
        assert!(registry.get("CLARIFICATIONTOOL").is_some());
    }
}
