// Agent loop driver
//
// Runs the Reason → Select → Act loop for one claimed session. The driver is
// re-entrant: every piece of session-scoped state is decoded from the
// persisted transcript and context snapshot at entry, and written back in a
// single transaction per step. Waiting for the user is never an in-process
// block; a clarification persists WAITING_FOR_CLARIFICATION and returns.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::{json, Value};
use uuid::Uuid;

use perpetua_contracts::{
    ChatMessage, MessageRole, MessageType, NewSessionMessage, SessionState, StepEvent,
    ToolCallPayload,
};

use crate::config::{ReasoningStrategy, TemplateRuntimeConfig};
use crate::context::SessionContext;
use crate::error::{Result, RuntimeError};
use crate::events::EventSender;
use crate::llm::{LlmCallConfig, LlmDriver, LlmStreamEvent, LlmTurn, ToolCallRequest, ToolChoice, ToolSchema};
use crate::prompts::PromptsConfig;
use crate::selector::{Selection, ToolSelector};
use crate::tools::builtin::{is_tool, CLARIFICATION_TOOL, FINAL_ANSWER_TOOL, REASONING_TOOL};
use crate::tools::{execute_tool, ToolCatalog, ToolContext, ToolRunOutcome};
use crate::traits::{with_store_retry, SessionStore, ToolExecutionRecord};

/// Per-step concurrency cap for parallel tool execution
const MAX_PARALLEL_TOOLS: usize = 4;
/// Minimum per-call LLM deadline, regardless of remaining budget
const MIN_LLM_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(120);
/// Chunk size (in chars) for streaming the final answer
const ANSWER_CHUNK_CHARS: usize = 32;
const LLM_RETRIES: usize = 2;

/// Result of driving one session run to completion or suspension
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub final_state: SessionState,
    pub finish_reason: String,
    /// True when the run parked in WAITING_FOR_CLARIFICATION
    pub suspended: bool,
    pub messages_appended: u64,
    pub tool_calls_made: u64,
    pub had_tool_errors: bool,
}

pub struct AgentLoopDriver<S: SessionStore> {
    store: Arc<S>,
    llm: Arc<dyn LlmDriver>,
    catalog: Arc<ToolCatalog>,
    selector: ToolSelector,
    config: TemplateRuntimeConfig,
    prompts: PromptsConfig,
    events: EventSender,
    shutdown: Option<tokio::sync::watch::Receiver<bool>>,
}

/// Accumulated writes for one step, committed in a single transaction
#[derive(Default)]
struct StepBatch {
    messages: Vec<NewSessionMessage>,
    executions: Vec<ToolExecutionRecord>,
}

impl StepBatch {
    fn step_row(&mut self, message_type: MessageType, step: i32, data: Value) {
        self.messages.push(NewSessionMessage::step(
            MessageRole::Assistant,
            message_type,
            step,
            data,
        ));
    }

    fn conversation(&mut self, message: &ChatMessage) {
        self.messages.push(NewSessionMessage::conversation(message));
    }
}

impl<S: SessionStore> AgentLoopDriver<S> {
    pub fn new(
        store: Arc<S>,
        llm: Arc<dyn LlmDriver>,
        catalog: Arc<ToolCatalog>,
        config: TemplateRuntimeConfig,
        prompts: PromptsConfig,
        events: EventSender,
    ) -> Self {
        Self {
            store,
            llm,
            catalog,
            selector: ToolSelector::default(),
            config,
            prompts,
            events,
            shutdown: None,
        }
    }

    pub fn with_selector(mut self, selector: ToolSelector) -> Self {
        self.selector = selector;
        self
    }

    /// Observe a process shutdown signal between steps: the current step
    /// drains and persists, then the run parks back in RESEARCHING for the
    /// next claimant
    pub fn with_shutdown(mut self, shutdown: tokio::sync::watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Drive the claimed session until completion, failure, or suspension
    pub async fn run(&self, session_id: Uuid) -> Result<LoopOutcome> {
        let session = {
            let store = self.store.clone();
            with_store_retry(move || {
                let store = store.clone();
                async move { store.get_session(session_id).await }
            })
            .await?
            .ok_or(RuntimeError::SessionNotFound(session_id))?
        };
        if session.state != SessionState::Researching {
            return Err(RuntimeError::StaleSession(session_id));
        }

        let mut context = SessionContext::from_value(&session.context)?;
        let stored = {
            let store = self.store.clone();
            with_store_retry(move || {
                let store = store.clone();
                async move { store.list_messages(session_id).await }
            })
            .await?
        };

        // Replay only conversation rows; step records are a UI view
        let mut conversation: Vec<ChatMessage> = stored
            .iter()
            .filter(|m| m.message_type == MessageType::Message)
            .filter_map(|m| serde_json::from_value::<ChatMessage>(m.content.clone()).ok())
            .filter(|m| m.role != "system")
            .collect();

        let task = conversation
            .iter()
            .find(|m| m.role == "user")
            .map(|m| m.content_text().to_string())
            .unwrap_or_default();

        let run_started = Instant::now();
        let max_iterations = self.config.execution_policy.max_iterations;
        let mut messages_appended = 0u64;
        let mut tool_calls_made = 0u64;
        let mut had_tool_errors = false;
        let mut suspended = false;

        let (final_state, finish_reason) = 'run: loop {
            if let Some(shutdown) = &self.shutdown {
                if *shutdown.borrow() {
                    // Step boundary: everything so far is persisted, so the
                    // session can be re-claimed after restart
                    return Ok(LoopOutcome {
                        final_state: SessionState::Researching,
                        finish_reason: "shutdown".to_string(),
                        suspended: true,
                        messages_appended,
                        tool_calls_made,
                        had_tool_errors,
                    });
                }
            }
            if let Some(budget) = self.config.execution_policy.time_budget_seconds {
                if run_started.elapsed() >= Duration::from_secs(budget) {
                    context.execution_result.get_or_insert_with(|| {
                        "Task failed: time budget exceeded".to_string()
                    });
                    break 'run (SessionState::Failed, "budget".to_string());
                }
            }
            if context.iteration >= max_iterations {
                context
                    .execution_result
                    .get_or_insert_with(|| "Task failed: iteration limit reached".to_string());
                break 'run (SessionState::Failed, "length".to_string());
            }

            context.iteration += 1;
            let step = context.iteration;
            let step_started = Instant::now();
            let mut batch = StepBatch::default();

            self.events
                .send(StepEvent::step_start(step, max_iterations, "Analyzing..."))
                .await;
            batch.step_row(
                MessageType::StepStart,
                step,
                json!({"description": "Analyzing...", "max_steps": max_iterations}),
            );

            // Tool selection for this step
            let query = context.retrieval_query(&task);
            let selection = match self.selector.select(
                &self.catalog,
                &self.config,
                &context,
                SessionState::Researching,
                &query,
            ) {
                Ok(selection) => selection,
                Err(e) => {
                    self.events
                        .send(StepEvent::error(step, format!("tool selection failed: {e}")))
                        .await;
                    context
                        .execution_result
                        .get_or_insert_with(|| format!("Task failed: {e}"));
                    break 'run (SessionState::Failed, "stop".to_string());
                }
            };
            if let Some(stage) = &selection.stage {
                context.stage = Some(stage.clone());
            }
            let schemas: Vec<ToolSchema> =
                selection.tools.iter().map(|t| t.tool.schema()).collect();

            let system_prompt = self.prompts.render_system(
                &schemas
                    .iter()
                    .map(|s| format!("{}: {}", s.name, s.description))
                    .collect::<Vec<_>>(),
            );
            let mut messages = vec![ChatMessage::text("system", system_prompt)];
            messages.extend(conversation.iter().cloned());

            // Reasoning phase
            if let Err(e) = self
                .reasoning_phase(
                    session_id,
                    step,
                    &selection,
                    &schemas,
                    &mut messages,
                    &mut conversation,
                    &mut batch,
                    &mut context,
                    run_started,
                )
                .await
            {
                self.fail_step(step, step_started, &e, &mut batch).await;
                self.commit(session_id, batch, &context, &mut messages_appended)
                    .await?;
                continue;
            }

            // Selection phase: the LLM chooses the next tool call(s)
            let call_config = LlmCallConfig {
                model: self.config.llm_policy.model.clone(),
                temperature: self.config.llm_policy.temperature,
                max_tokens: self.config.llm_policy.max_tokens,
                tools: schemas.clone(),
                tool_choice: Some(ToolChoice::Required),
                parallel_tool_calls: true,
                response_format: None,
                timeout: self.llm_timeout(run_started),
            };
            let turn = match self.call_llm(session_id, messages.clone(), call_config).await {
                Ok(turn) => turn,
                Err(e) => {
                    self.fail_step(step, step_started, &e, &mut batch).await;
                    self.commit(session_id, batch, &context, &mut messages_appended)
                        .await?;
                    continue;
                }
            };

            // Malformed turn: synthesize a failed final answer from the text
            let mut tool_calls = turn.tool_calls;
            if tool_calls.is_empty() {
                tracing::warn!(
                    session_id = %session_id,
                    "model returned no tool_calls despite tool_choice=required"
                );
                tool_calls = vec![ToolCallRequest {
                    id: String::new(),
                    name: FINAL_ANSWER_TOOL.to_string(),
                    arguments: json!({
                        "answer": if turn.content.is_empty() {
                            "Unable to complete the task.".to_string()
                        } else {
                            turn.content.clone()
                        },
                        "status": "failed",
                    }),
                }];
            }
            for (index, call) in tool_calls.iter_mut().enumerate() {
                call.id = format!("{step}-act-{index}");
            }

            // A clarification must be the sole tool call of its step
            let clarification_count = tool_calls
                .iter()
                .filter(|c| is_tool(&c.name, CLARIFICATION_TOOL))
                .count();
            if clarification_count > 0 && tool_calls.len() > 1 {
                let error = RuntimeError::llm_invariant(
                    "ClarificationTool must be the sole tool call of a step",
                );
                self.fail_step(step, step_started, &error, &mut batch).await;
                self.commit(session_id, batch, &context, &mut messages_appended)
                    .await?;
                continue;
            }

            // Action phase
            let assistant = ChatMessage::assistant_tool_calls(
                tool_calls
                    .iter()
                    .map(|c| ToolCallPayload::function(&c.id, &c.name, &c.arguments))
                    .collect(),
            );
            conversation.push(assistant.clone());
            batch.conversation(&assistant);

            let tool_ctx = ToolContext::new(session_id, context.clone());
            for call in &tool_calls {
                self.events
                    .send(StepEvent::tool_call(step, &call.name, call.arguments.clone()))
                    .await;
                batch.step_row(
                    MessageType::ToolCall,
                    step,
                    json!({"tool_name": call.name, "tool_args": call.arguments}),
                );
            }

            // Execute concurrently (cap 4); results keep the LLM's emission order
            let outcomes: Vec<(usize, ToolRunOutcome)> = futures::stream::iter(
                tool_calls.iter().cloned().enumerate().map(|(index, call)| {
                    let tool_ctx = tool_ctx.clone();
                    async move {
                        (index, self.run_tool(&tool_ctx, &call.name, call.arguments.clone()).await)
                    }
                }),
            )
            .buffered(MAX_PARALLEL_TOOLS)
            .collect()
            .await;
            tool_calls_made += tool_calls.len() as u64;

            for (index, outcome) in &outcomes {
                let call = &tool_calls[*index];
                if !outcome.success {
                    had_tool_errors = true;
                }
                self.events
                    .send(StepEvent::tool_result(
                        step,
                        &call.name,
                        outcome.result.clone(),
                        outcome.success,
                        Some(outcome.duration_ms()),
                    ))
                    .await;
                batch.step_row(
                    MessageType::ToolResult,
                    step,
                    json!({
                        "tool_name": call.name,
                        "result": outcome.result,
                        "success": outcome.success,
                    }),
                );
                let tool_message =
                    ChatMessage::tool_result(&call.id, render_result(&outcome.result));
                conversation.push(tool_message.clone());
                batch.conversation(&tool_message);
                batch.executions.push(ToolExecutionRecord {
                    tool_id: self
                        .catalog
                        .resolve(&call.name)
                        .ok()
                        .map(|t| t.record.id),
                    tool_name: call.name.clone(),
                    arguments: call.arguments.clone(),
                    result: Some(outcome.result.clone()),
                    status: outcome.status,
                    started_at: outcome.started_at,
                    finished_at: outcome.finished_at,
                });
            }

            context = tool_ctx.snapshot();
            let requested_state = tool_ctx.requested_state();

            if requested_state == Some(SessionState::WaitingForClarification) {
                batch.step_row(
                    MessageType::StepEnd,
                    step,
                    json!({"status": "completed"}),
                );
                self.commit(session_id, batch, &context, &mut messages_appended)
                    .await?;
                self.transition(session_id, SessionState::WaitingForClarification, &context)
                    .await?;
                self.events
                    .send(StepEvent::step_end(
                        step,
                        "completed",
                        Some(step_started.elapsed().as_millis() as i64),
                    ))
                    .await;
                suspended = true;
                let questions = context.pending_clarification.join("\n");
                self.finish_stream(session_id, &questions, "stop").await;
                return Ok(LoopOutcome {
                    final_state: SessionState::WaitingForClarification,
                    finish_reason: "stop".to_string(),
                    suspended,
                    messages_appended,
                    tool_calls_made,
                    had_tool_errors,
                });
            }

            batch.step_row(MessageType::StepEnd, step, json!({"status": "completed"}));
            self.commit(session_id, batch, &context, &mut messages_appended)
                .await?;
            self.events
                .send(StepEvent::step_end(
                    step,
                    "completed",
                    Some(step_started.elapsed().as_millis() as i64),
                ))
                .await;

            match requested_state {
                Some(state @ (SessionState::Completed | SessionState::Failed)) => {
                    break 'run (state, "stop".to_string());
                }
                _ => {}
            }
        };

        // Persist the terminal state and stream the final answer
        self.transition(session_id, final_state, &context).await?;
        let final_text = context
            .execution_result
            .clone()
            .unwrap_or_else(|| "Task completed.".to_string());
        let answer = ChatMessage::text("assistant", final_text.clone());
        {
            let store = self.store.clone();
            let message = NewSessionMessage::conversation(&answer);
            with_store_retry(move || {
                let store = store.clone();
                let message = message.clone();
                async move { store.append_message(session_id, message).await }
            })
            .await?;
        }
        messages_appended += 1;
        self.finish_stream(session_id, &final_text, &finish_reason).await;

        Ok(LoopOutcome {
            final_state,
            finish_reason,
            suspended,
            messages_appended,
            tool_calls_made,
            had_tool_errors,
        })
    }

    /// Reasoning phase per the template's strategy; mutates the prompt
    /// messages, conversation, batch, and context in place
    #[allow(clippy::too_many_arguments)]
    async fn reasoning_phase(
        &self,
        session_id: Uuid,
        step: i32,
        selection: &Selection,
        schemas: &[ToolSchema],
        messages: &mut Vec<ChatMessage>,
        conversation: &mut Vec<ChatMessage>,
        batch: &mut StepBatch,
        context: &mut SessionContext,
        run_started: Instant,
    ) -> Result<()> {
        match self.config.reasoning_strategy() {
            ReasoningStrategy::Direct => Ok(()),
            ReasoningStrategy::ForcedTool => {
                let Some(reasoning) = selection
                    .tools
                    .iter()
                    .find(|t| is_tool(t.tool.name(), REASONING_TOOL))
                else {
                    // No reasoning tool in this step's selection; degrade to direct
                    return Ok(());
                };

                let call_config = LlmCallConfig {
                    model: self.config.llm_policy.model.clone(),
                    temperature: self.config.llm_policy.temperature,
                    max_tokens: self.config.llm_policy.max_tokens,
                    tools: schemas.to_vec(),
                    tool_choice: Some(ToolChoice::Function(REASONING_TOOL.to_string())),
                    parallel_tool_calls: false,
                    response_format: None,
                    timeout: self.llm_timeout(run_started),
                };
                let turn = self.call_llm(session_id, messages.clone(), call_config).await?;
                let Some(call) = turn
                    .tool_calls
                    .into_iter()
                    .find(|c| is_tool(&c.name, REASONING_TOOL))
                else {
                    return Err(RuntimeError::llm_invariant(
                        "model did not call the forced reasoning tool",
                    ));
                };

                let call_id = format!("{step}-reason-0");
                let tool_ctx = ToolContext::new(session_id, context.clone());
                let outcome = execute_tool(
                    &reasoning.tool,
                    &tool_ctx,
                    call.arguments.clone(),
                    &self.config.quota_for(REASONING_TOOL),
                )
                .await;
                *context = tool_ctx.snapshot();

                let thought = render_result(&outcome.result);
                self.events
                    .send(StepEvent::thinking(step, truncate_chars(&thought, 1000)))
                    .await;
                batch.step_row(
                    MessageType::Thinking,
                    step,
                    json!({"thought": truncate_chars(&thought, 2000)}),
                );

                let assistant = ChatMessage::assistant_tool_calls(vec![
                    ToolCallPayload::function(&call_id, REASONING_TOOL, &call.arguments),
                ]);
                let tool_message = ChatMessage::tool_result(&call_id, thought);
                for message in [&assistant, &tool_message] {
                    conversation.push((*message).clone());
                    messages.push((*message).clone());
                    batch.conversation(message);
                }
                batch.executions.push(ToolExecutionRecord {
                    tool_id: Some(reasoning.tool.record.id),
                    tool_name: REASONING_TOOL.to_string(),
                    arguments: call.arguments,
                    result: Some(outcome.result),
                    status: outcome.status,
                    started_at: outcome.started_at,
                    finished_at: outcome.finished_at,
                });
                Ok(())
            }
            ReasoningStrategy::StructuredUnion => {
                // Union schema over the step's candidate tools, built at
                // selection time rather than for the whole catalog
                let call_config = LlmCallConfig {
                    model: self.config.llm_policy.model.clone(),
                    temperature: self.config.llm_policy.temperature,
                    max_tokens: self.config.llm_policy.max_tokens,
                    tools: Vec::new(),
                    tool_choice: None,
                    parallel_tool_calls: false,
                    response_format: Some(json!({
                        "type": "json_schema",
                        "json_schema": {
                            "name": "next_step",
                            "schema": build_union_schema(schemas),
                        }
                    })),
                    timeout: self.llm_timeout(run_started),
                };
                let turn = self.call_llm(session_id, messages.clone(), call_config).await?;
                if turn.content.is_empty() {
                    return Ok(());
                }

                if let Ok(parsed) = serde_json::from_str::<Value>(&turn.content) {
                    if let Some(remaining) = parsed
                        .get("args")
                        .and_then(|a| a.get("remaining_steps"))
                        .and_then(Value::as_array)
                    {
                        let summary = context.last_reasoning.get_or_insert_with(Default::default);
                        summary.remaining_steps = remaining
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect();
                    }
                }

                self.events
                    .send(StepEvent::thinking(step, truncate_chars(&turn.content, 1000)))
                    .await;
                batch.step_row(
                    MessageType::Thinking,
                    step,
                    json!({"thought": truncate_chars(&turn.content, 2000)}),
                );
                let assistant = ChatMessage::text("assistant", turn.content);
                conversation.push(assistant.clone());
                messages.push(assistant.clone());
                batch.conversation(&assistant);
                Ok(())
            }
        }
    }

    /// Resolve and execute one tool under its quota
    async fn run_tool(&self, ctx: &ToolContext, name: &str, args: Value) -> ToolRunOutcome {
        match self.catalog.resolve(name) {
            Ok(resolved) => {
                execute_tool(&resolved, ctx, args, &self.config.quota_for(name)).await
            }
            Err(e) => {
                tracing::warn!(tool = %name, error = %e, "tool resolution failed");
                ToolRunOutcome {
                    result: json!({"success": false, "error": format!("tool not found: {name}")}),
                    success: false,
                    status: crate::traits::ToolExecutionStatus::Error,
                    started_at: chrono::Utc::now(),
                    finished_at: chrono::Utc::now(),
                }
            }
        }
    }

    /// One LLM call with streaming pass-through; transient failures retried
    async fn call_llm(
        &self,
        session_id: Uuid,
        messages: Vec<ChatMessage>,
        config: LlmCallConfig,
    ) -> Result<LlmTurn> {
        let mut attempt = 0;
        loop {
            match self.stream_once(session_id, messages.clone(), &config).await {
                Ok(turn) => return Ok(turn),
                Err(e @ RuntimeError::Llm(_)) if attempt < LLM_RETRIES => {
                    attempt += 1;
                    tracing::warn!(attempt, error = %e, "LLM call failed, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn stream_once(
        &self,
        session_id: Uuid,
        messages: Vec<ChatMessage>,
        config: &LlmCallConfig,
    ) -> Result<LlmTurn> {
        let mut stream = self.llm.chat_stream(messages, config).await?;
        let mut turn = LlmTurn::default();
        while let Some(event) = stream.next().await {
            match event? {
                LlmStreamEvent::TextDelta(delta) if !delta.is_empty() => {
                    turn.content.push_str(&delta);
                    // Pass-through: deltas reach the client as they arrive
                    self.events.send_delta(StepEvent::message(
                        session_id.to_string(),
                        &self.config.template_name,
                        delta,
                    ));
                }
                LlmStreamEvent::TextDelta(_) => {}
                LlmStreamEvent::ToolCalls(calls) => turn.tool_calls = calls,
                LlmStreamEvent::Done { finish_reason } => {
                    if turn.finish_reason.is_none() {
                        turn.finish_reason = finish_reason;
                    }
                }
                LlmStreamEvent::Error(message) => return Err(RuntimeError::llm(message)),
            }
        }
        Ok(turn)
    }

    /// Remaining time budget, floored at the per-call minimum
    fn llm_timeout(&self, run_started: Instant) -> Duration {
        match self.config.execution_policy.time_budget_seconds {
            Some(budget) => {
                let remaining =
                    Duration::from_secs(budget).saturating_sub(run_started.elapsed());
                remaining.max(MIN_LLM_TIMEOUT)
            }
            None => DEFAULT_LLM_TIMEOUT,
        }
    }

    async fn fail_step(
        &self,
        step: i32,
        step_started: Instant,
        error: &RuntimeError,
        batch: &mut StepBatch,
    ) {
        tracing::error!(step, error = %error, "step failed");
        self.events
            .send(StepEvent::error(step, error.to_string()))
            .await;
        self.events
            .send(StepEvent::step_end(
                step,
                "error",
                Some(step_started.elapsed().as_millis() as i64),
            ))
            .await;
        batch.step_row(MessageType::Error, step, json!({"message": error.to_string()}));
        batch.step_row(
            MessageType::StepEnd,
            step,
            json!({"status": "error", "error": error.to_string()}),
        );
    }

    async fn commit(
        &self,
        session_id: Uuid,
        batch: StepBatch,
        context: &SessionContext,
        messages_appended: &mut u64,
    ) -> Result<()> {
        *messages_appended += batch.messages.len() as u64;
        let store = self.store.clone();
        let context = context.clone();
        let messages = batch.messages;
        let executions = batch.executions;
        with_store_retry(move || {
            let store = store.clone();
            let messages = messages.clone();
            let executions = executions.clone();
            let context = context.clone();
            async move {
                store
                    .commit_step(session_id, messages, executions, &context)
                    .await
            }
        })
        .await
    }

    /// CAS transition out of RESEARCHING; a conflict means another writer won
    async fn transition(
        &self,
        session_id: Uuid,
        new_state: SessionState,
        context: &SessionContext,
    ) -> Result<()> {
        let store = self.store.clone();
        let context = context.clone();
        let applied = with_store_retry(move || {
            let store = store.clone();
            let context = context.clone();
            async move {
                store
                    .update_session_state(session_id, SessionState::Researching, new_state, &context)
                    .await
            }
        })
        .await?;
        if !applied {
            return Err(RuntimeError::StaleSession(session_id));
        }
        Ok(())
    }

    /// Stream the final text as OpenAI chunks, then emit `done`
    async fn finish_stream(&self, session_id: Uuid, text: &str, finish_reason: &str) {
        for chunk in chunk_text(text, ANSWER_CHUNK_CHARS) {
            self.events
                .send(StepEvent::message(
                    session_id.to_string(),
                    &self.config.template_name,
                    chunk,
                ))
                .await;
        }
        self.events.flush().await;
        self.events.send(StepEvent::done(finish_reason)).await;
    }
}

/// Discriminated union of candidate tool argument schemas (SGR reasoning)
pub fn build_union_schema(schemas: &[ToolSchema]) -> Value {
    let variants: Vec<Value> = schemas
        .iter()
        .map(|schema| {
            json!({
                "type": "object",
                "properties": {
                    "tool": {"const": schema.name},
                    "args": schema.parameters,
                },
                "required": ["tool", "args"],
            })
        })
        .collect();
    json!({"oneOf": variants})
}

fn render_result(result: &Value) -> String {
    match result {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Split text into fixed-size chunks on char boundaries
fn chunk_text(text: &str, chunk_chars: usize) -> Vec<String> {
    if text.is_empty() {
        return vec![String::new()];
    }
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(chunk_chars)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_respects_char_boundaries() {
        let text = "каждый охотник желает знать где сидит фазан";
        let chunks = chunk_text(text, 8);
        assert_eq!(chunks.concat(), text);
        assert!(chunks.iter().all(|c| c.chars().count() <= 8));
    }

    #[test]
    fn empty_text_yields_single_empty_chunk() {
        assert_eq!(chunk_text("", 32), vec![String::new()]);
    }

    #[test]
    fn union_schema_discriminates_by_tool_name() {
        let schemas = vec![
            ToolSchema {
                name: "WebSearchTool".into(),
                description: "search".into(),
                parameters: json!({"type": "object", "properties": {"query": {"type": "string"}}}),
            },
            ToolSchema {
                name: "FinalAnswerTool".into(),
                description: "finish".into(),
                parameters: json!({"type": "object", "properties": {"answer": {"type": "string"}}}),
            },
        ];
        let union = build_union_schema(&schemas);
        let variants = union["oneOf"].as_array().unwrap();
        assert_eq!(variants.len(), 2);
        assert_eq!(variants[0]["properties"]["tool"]["const"], "WebSearchTool");
        assert_eq!(variants[1]["properties"]["tool"]["const"], "FinalAnswerTool");
    }
}
