// Integration tests for the agent loop driver
//
// These drive the full Reason → Select → Act loop against the in-memory
// store and a scripted LLM driver, and assert on persisted state, message
// ordering, and the emitted event stream.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use perpetua_contracts::{
    ChatMessage, MessageRole, MessageType, NewSessionMessage, SessionState, StepEvent, Template,
    TemplateVersion, Tool, ToolCategory,
};
use perpetua_core::driver::AgentLoopDriver;
use perpetua_core::events::{channel, EventReceiver, EventSender};
use perpetua_core::memory::{
    conversation_of, count_role, InMemorySessionStore, MockLlmDriver, MockLlmResponse,
};
use perpetua_core::tools::builtin::{builtin_registry, BuiltinDeps};
use perpetua_core::{
    PromptsConfig, SessionContext, SessionStore, TemplateRuntimeConfig, ToolCallRequest,
    ToolCatalog,
};

fn tool_record(name: &str) -> Tool {
    Tool {
        id: Uuid::new_v4(),
        name: name.into(),
        description: Some(format!("{name} description")),
        entrypoint: None,
        config: json!({}),
        embedding: None,
        category: ToolCategory::Utility,
        is_active: true,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn catalog() -> Arc<ToolCatalog> {
    let catalog = ToolCatalog::new(builtin_registry(BuiltinDeps::default()));
    catalog.refresh(vec![
        tool_record("ReasoningTool"),
        tool_record("FinalAnswerTool"),
        tool_record("ClarificationTool"),
        tool_record("EchoTool"),
    ]);
    Arc::new(catalog)
}

fn runtime_config(settings: serde_json::Value, tools: Vec<&str>) -> TemplateRuntimeConfig {
    let template = Template {
        id: Uuid::new_v4(),
        name: "research-agent".into(),
        description: None,
        active_version_id: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    let version = TemplateVersion {
        id: Uuid::new_v4(),
        template_id: template.id,
        version: 1,
        settings,
        tools: tools.iter().map(|s| s.to_string()).collect(),
        embedding: None,
        is_active: true,
        created_at: Utc::now(),
    };
    TemplateRuntimeConfig::from_parts(&template, &version).unwrap()
}

async fn researching_session(store: &InMemorySessionStore, config: &TemplateRuntimeConfig, task: &str) -> Uuid {
    let context = SessionContext::default();
    let session = store
        .create_session(config.version_id, Some("test".into()), &context)
        .await
        .unwrap();
    store
        .append_message(
            session.id,
            NewSessionMessage::conversation(&ChatMessage::text("user", task)),
        )
        .await
        .unwrap();
    assert!(store
        .update_session_state(session.id, SessionState::Inited, SessionState::Researching, &context)
        .await
        .unwrap());
    session.id
}

fn driver(
    store: Arc<InMemorySessionStore>,
    llm: Arc<MockLlmDriver>,
    config: TemplateRuntimeConfig,
    events: EventSender,
) -> AgentLoopDriver<InMemorySessionStore> {
    AgentLoopDriver::new(
        store,
        llm,
        catalog(),
        config,
        PromptsConfig::default(),
        events,
    )
}

async fn drain_until_done(rx: &mut EventReceiver) -> Vec<StepEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        let done = event.kind() == "done";
        events.push(event);
        if done {
            break;
        }
    }
    events
}

fn final_answer_call(id: &str, answer: &str, status: &str) -> ToolCallRequest {
    ToolCallRequest {
        id: id.into(),
        name: "FinalAnswerTool".into(),
        arguments: json!({"answer": answer, "status": status}),
    }
}

fn echo_call(id: &str, message: &str) -> ToolCallRequest {
    ToolCallRequest {
        id: id.into(),
        name: "EchoTool".into(),
        arguments: json!({"message": message}),
    }
}

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test]
async fn happy_path_completes_with_final_answer() {
    let store = Arc::new(InMemorySessionStore::new());
    let config = runtime_config(json!({}), vec!["EchoTool", "FinalAnswerTool"]);
    let session_id = researching_session(&store, &config, "What is 2+2?").await;

    let llm = Arc::new(MockLlmDriver::scripted(vec![MockLlmResponse::tool_calls(
        vec![final_answer_call("call_1", "2+2 equals 4.", "completed")],
    )]));
    let (tx, mut rx) = channel(256);
    let outcome = driver(store.clone(), llm, config, tx)
        .run(session_id)
        .await
        .unwrap();

    assert_eq!(outcome.final_state, SessionState::Completed);
    assert!(!outcome.suspended);

    let session = store.get_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::Completed);
    let context = SessionContext::from_value(&session.context).unwrap();
    assert_eq!(context.execution_result.as_deref(), Some("2+2 equals 4."));
    assert_eq!(context.iteration, 1);

    let events = drain_until_done(&mut rx).await;
    let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
    assert!(kinds.contains(&"step_start"));
    assert!(kinds.contains(&"tool_call"));
    assert!(kinds.contains(&"tool_result"));
    assert!(kinds.contains(&"step_end"));
    assert_eq!(*kinds.last().unwrap(), "done");

    // The final answer is streamed as message deltas
    let streamed: String = events
        .iter()
        .filter_map(|e| e.delta_content())
        .collect();
    assert!(streamed.contains('4'));
}

// ============================================================================
// Message invariants
// ============================================================================

#[tokio::test]
async fn tool_messages_reference_a_prior_assistant_tool_call() {
    let store = Arc::new(InMemorySessionStore::new());
    let config = runtime_config(json!({}), vec!["EchoTool", "FinalAnswerTool"]);
    let session_id = researching_session(&store, &config, "echo twice then finish").await;

    let llm = Arc::new(MockLlmDriver::scripted(vec![
        MockLlmResponse::tool_calls(vec![echo_call("a", "one")]),
        MockLlmResponse::tool_calls(vec![final_answer_call("b", "done", "completed")]),
    ]));
    let (tx, _rx) = channel(256);
    driver(store.clone(), llm, config, tx)
        .run(session_id)
        .await
        .unwrap();

    let messages = store.list_messages(session_id).await.unwrap();

    // Gap-free sequence
    for (index, message) in messages.iter().enumerate() {
        assert_eq!(message.seq, index as i64 + 1);
    }

    // Every tool message's id appears in an earlier assistant message
    let conversation = conversation_of(&messages);
    let mut seen_call_ids: Vec<String> = Vec::new();
    for message in &conversation {
        if let Some(calls) = &message.tool_calls {
            seen_call_ids.extend(calls.iter().map(|c| c.id.clone()));
        }
        if message.role == "tool" {
            let id = message.tool_call_id.as_deref().unwrap();
            assert!(seen_call_ids.iter().any(|c| c == id), "orphan tool message {id}");
        }
    }
}

// ============================================================================
// Clarification round-trip
// ============================================================================

#[tokio::test]
async fn clarification_suspends_and_resumes() {
    let store = Arc::new(InMemorySessionStore::new());
    let config = runtime_config(
        json!({}),
        vec!["EchoTool", "ClarificationTool", "FinalAnswerTool"],
    );
    let session_id = researching_session(&store, &config, "summarize it").await;

    let llm = Arc::new(MockLlmDriver::scripted(vec![MockLlmResponse::tool_calls(
        vec![ToolCallRequest {
            id: "c1".into(),
            name: "ClarificationTool".into(),
            arguments: json!({"questions": ["Summarize what exactly?"]}),
        }],
    )]));
    let (tx, mut rx) = channel(256);
    let outcome = driver(store.clone(), llm.clone(), config.clone(), tx)
        .run(session_id)
        .await
        .unwrap();

    assert!(outcome.suspended);
    assert_eq!(outcome.final_state, SessionState::WaitingForClarification);
    let events = drain_until_done(&mut rx).await;
    assert_eq!(events.last().unwrap().kind(), "done");

    let session = store.get_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::WaitingForClarification);
    let mut context = SessionContext::from_value(&session.context).unwrap();
    assert!(context.clarification_requested);
    assert_eq!(context.pending_clarification.len(), 1);

    // Resume: what the session service does on the follow-up request
    context.clarifications_used += 1;
    context.clarification_requested = false;
    context.pending_clarification.clear();
    store
        .append_message(
            session_id,
            NewSessionMessage::conversation(&ChatMessage::text("user", "the attached PDF")),
        )
        .await
        .unwrap();
    assert!(store
        .update_session_state(
            session_id,
            SessionState::WaitingForClarification,
            SessionState::Researching,
            &context,
        )
        .await
        .unwrap());

    llm.push(MockLlmResponse::tool_calls(vec![final_answer_call(
        "f1",
        "Summary of the PDF.",
        "completed",
    )]));
    let (tx, _rx) = channel(256);
    let outcome = driver(store.clone(), llm.clone(), config, tx)
        .run(session_id)
        .await
        .unwrap();

    assert_eq!(outcome.final_state, SessionState::Completed);
    let session = store.get_session(session_id).await.unwrap().unwrap();
    let context = SessionContext::from_value(&session.context).unwrap();
    assert_eq!(context.clarifications_used, 1);

    // The resumed run replayed the full transcript, including the
    // clarification pair, without duplicating it
    let requests = llm.requests();
    let resumed_messages = &requests.last().unwrap().0;
    let clarification_pairs = resumed_messages
        .iter()
        .filter(|m| m.role == "tool")
        .count();
    assert_eq!(clarification_pairs, 1);
}

#[tokio::test]
async fn clarification_mixed_with_other_calls_fails_the_step() {
    let store = Arc::new(InMemorySessionStore::new());
    let config = runtime_config(
        json!({}),
        vec!["EchoTool", "ClarificationTool", "FinalAnswerTool"],
    );
    let session_id = researching_session(&store, &config, "ambiguous").await;

    let llm = Arc::new(MockLlmDriver::scripted(vec![
        MockLlmResponse::tool_calls(vec![
            ToolCallRequest {
                id: "c1".into(),
                name: "ClarificationTool".into(),
                arguments: json!({"questions": ["what?"]}),
            },
            echo_call("e1", "sneaky parallel call"),
        ]),
        MockLlmResponse::tool_calls(vec![final_answer_call("f1", "recovered", "completed")]),
    ]));
    let (tx, mut rx) = channel(256);
    let outcome = driver(store.clone(), llm, config, tx)
        .run(session_id)
        .await
        .unwrap();

    // The bad step errored; the loop recovered on the next iteration
    assert_eq!(outcome.final_state, SessionState::Completed);
    let events = drain_until_done(&mut rx).await;
    assert!(events.iter().any(|e| e.kind() == "error"));

    let session = store.get_session(session_id).await.unwrap().unwrap();
    let context = SessionContext::from_value(&session.context).unwrap();
    // The mixed batch never executed
    assert!(!context.clarification_requested);
}

// ============================================================================
// Quotas
// ============================================================================

#[tokio::test]
async fn tool_quota_blocks_second_call_without_executing() {
    let store = Arc::new(InMemorySessionStore::new());
    let config = runtime_config(
        json!({
            "tool_policy": {
                "quotas": {"EchoTool": {"max_calls": 1}}
            }
        }),
        vec!["EchoTool", "FinalAnswerTool"],
    );
    let session_id = researching_session(&store, &config, "echo twice").await;

    let llm = Arc::new(MockLlmDriver::scripted(vec![
        MockLlmResponse::tool_calls(vec![echo_call("e1", "first")]),
        MockLlmResponse::tool_calls(vec![echo_call("e2", "second")]),
        MockLlmResponse::tool_calls(vec![final_answer_call("f1", "done", "completed")]),
    ]));
    let (tx, _rx) = channel(256);
    let outcome = driver(store.clone(), llm, config, tx)
        .run(session_id)
        .await
        .unwrap();

    assert_eq!(outcome.final_state, SessionState::Completed);
    assert!(outcome.had_tool_errors);

    let executions = store.executions(session_id);
    let echo_runs: Vec<_> = executions
        .iter()
        .filter(|e| e.tool_name == "EchoTool")
        .collect();
    assert_eq!(echo_runs.len(), 2);
    let ok_count = echo_runs
        .iter()
        .filter(|e| e.status == perpetua_core::traits::ToolExecutionStatus::Ok)
        .count();
    assert_eq!(ok_count, 1);
    let refused = echo_runs
        .iter()
        .find(|e| e.status != perpetua_core::traits::ToolExecutionStatus::Ok)
        .unwrap();
    assert_eq!(
        refused.result.as_ref().unwrap()["error"],
        "quota_exceeded"
    );
}

// ============================================================================
// Parallel tool calls
// ============================================================================

#[tokio::test]
async fn parallel_calls_preserve_emission_order() {
    let store = Arc::new(InMemorySessionStore::new());
    let config = runtime_config(json!({}), vec!["EchoTool", "FinalAnswerTool"]);
    let session_id = researching_session(&store, &config, "echo in parallel").await;

    let llm = Arc::new(MockLlmDriver::scripted(vec![
        MockLlmResponse::tool_calls(vec![
            echo_call("p1", "first"),
            echo_call("p2", "second"),
        ]),
        MockLlmResponse::tool_calls(vec![final_answer_call("f1", "done", "completed")]),
    ]));
    let (tx, mut rx) = channel(256);
    driver(store.clone(), llm, config, tx)
        .run(session_id)
        .await
        .unwrap();

    // Two tool_result events share step 1
    let events = drain_until_done(&mut rx).await;
    let result_steps: Vec<i32> = events
        .iter()
        .filter_map(|e| match e {
            StepEvent::ToolResult(r) if r.tool == "EchoTool" => Some(r.step),
            _ => None,
        })
        .collect();
    assert_eq!(result_steps, vec![1, 1]);

    // Persisted tool messages keep the LLM's emission order
    let messages = store.list_messages(session_id).await.unwrap();
    let tool_contents: Vec<String> = conversation_of(&messages)
        .iter()
        .filter(|m| m.role == "tool")
        .map(|m| m.content_text().to_string())
        .collect();
    assert!(tool_contents[0].contains("first"));
    assert!(tool_contents[1].contains("second"));
}

// ============================================================================
// Policy violations
// ============================================================================

#[tokio::test]
async fn iteration_limit_fails_the_session() {
    let store = Arc::new(InMemorySessionStore::new());
    let config = runtime_config(
        json!({"execution_policy": {"max_iterations": 1}}),
        vec!["EchoTool", "FinalAnswerTool"],
    );
    let session_id = researching_session(&store, &config, "never finishes").await;

    let llm = Arc::new(MockLlmDriver::scripted(vec![MockLlmResponse::tool_calls(
        vec![echo_call("e1", "still going")],
    )]));
    let (tx, mut rx) = channel(256);
    let outcome = driver(store.clone(), llm, config, tx)
        .run(session_id)
        .await
        .unwrap();

    assert_eq!(outcome.final_state, SessionState::Failed);
    assert_eq!(outcome.finish_reason, "length");

    let events = drain_until_done(&mut rx).await;
    match events.last().unwrap() {
        StepEvent::Done(done) => assert_eq!(done.finish_reason, "length"),
        other => panic!("expected done, got {other:?}"),
    }

    let session = store.get_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::Failed);
}

#[tokio::test]
async fn zero_time_budget_fails_without_llm_calls() {
    let store = Arc::new(InMemorySessionStore::new());
    let config = runtime_config(
        json!({"execution_policy": {"time_budget_seconds": 0}}),
        vec!["EchoTool", "FinalAnswerTool"],
    );
    let session_id = researching_session(&store, &config, "too slow").await;

    let llm = Arc::new(MockLlmDriver::scripted(vec![]));
    let (tx, _rx) = channel(256);
    let outcome = driver(store.clone(), llm.clone(), config, tx)
        .run(session_id)
        .await
        .unwrap();

    assert_eq!(outcome.final_state, SessionState::Failed);
    assert_eq!(outcome.finish_reason, "budget");
    assert!(llm.requests().is_empty());
}

#[tokio::test]
async fn missing_tool_calls_synthesize_failed_final_answer() {
    let store = Arc::new(InMemorySessionStore::new());
    let config = runtime_config(json!({}), vec!["EchoTool", "FinalAnswerTool"]);
    let session_id = researching_session(&store, &config, "free-form reply").await;

    let llm = Arc::new(MockLlmDriver::scripted(vec![MockLlmResponse::text(
        "I would rather just answer in prose.",
    )]));
    let (tx, _rx) = channel(256);
    let outcome = driver(store.clone(), llm, config, tx)
        .run(session_id)
        .await
        .unwrap();

    assert_eq!(outcome.final_state, SessionState::Failed);
    let session = store.get_session(session_id).await.unwrap().unwrap();
    let context = SessionContext::from_value(&session.context).unwrap();
    assert_eq!(
        context.execution_result.as_deref(),
        Some("I would rather just answer in prose.")
    );
}

// ============================================================================
// Terminal states are sticky
// ============================================================================

#[tokio::test]
async fn completed_sessions_reject_further_transitions() {
    let store = Arc::new(InMemorySessionStore::new());
    let config = runtime_config(json!({}), vec!["EchoTool", "FinalAnswerTool"]);
    let session_id = researching_session(&store, &config, "finish fast").await;

    let llm = Arc::new(MockLlmDriver::scripted(vec![MockLlmResponse::tool_calls(
        vec![final_answer_call("f1", "done", "completed")],
    )]));
    let (tx, _rx) = channel(256);
    driver(store.clone(), llm, config, tx)
        .run(session_id)
        .await
        .unwrap();

    let applied = store
        .update_session_state(
            session_id,
            SessionState::Completed,
            SessionState::Researching,
            &SessionContext::default(),
        )
        .await
        .unwrap();
    assert!(!applied);
}

// ============================================================================
// Forced reasoning strategy
// ============================================================================

#[tokio::test]
async fn forced_reasoning_runs_before_selection() {
    let store = Arc::new(InMemorySessionStore::new());
    let config = runtime_config(
        json!({"base_class": "perpetua.agents:FlexibleToolCallingAgent"}),
        vec!["ReasoningTool", "EchoTool", "FinalAnswerTool"],
    );
    let session_id = researching_session(&store, &config, "think then act").await;

    let llm = Arc::new(MockLlmDriver::scripted(vec![
        // Reasoning phase: forced ReasoningTool call
        MockLlmResponse::tool_calls(vec![ToolCallRequest {
            id: "r1".into(),
            name: "ReasoningTool".into(),
            arguments: json!({
                "reasoning_steps": ["identify the task"],
                "remaining_steps": ["give the final answer"],
                "task_completed": false
            }),
        }]),
        // Selection phase
        MockLlmResponse::tool_calls(vec![final_answer_call("f1", "thought about it", "completed")]),
    ]));
    let (tx, mut rx) = channel(256);
    let outcome = driver(store.clone(), llm.clone(), config, tx)
        .run(session_id)
        .await
        .unwrap();

    assert_eq!(outcome.final_state, SessionState::Completed);
    let events = drain_until_done(&mut rx).await;
    assert!(events.iter().any(|e| e.kind() == "thinking"));

    // The reasoning phase forced the synthetic tool
    let requests = llm.requests();
    let reasoning_request = &requests[0].1;
    assert_eq!(
        reasoning_request.tool_choice,
        Some(perpetua_core::ToolChoice::Function("ReasoningTool".into()))
    );

    // Reasoning summary persisted into the snapshot
    let session = store.get_session(session_id).await.unwrap().unwrap();
    let context = SessionContext::from_value(&session.context).unwrap();
    assert_eq!(
        context.last_reasoning.unwrap().remaining_steps,
        vec!["give the final answer".to_string()]
    );
}

// ============================================================================
// Restart survivability
// ============================================================================

#[tokio::test]
async fn fresh_driver_resumes_from_persisted_state_alone() {
    let store = Arc::new(InMemorySessionStore::new());
    let config = runtime_config(
        json!({}),
        vec!["EchoTool", "ClarificationTool", "FinalAnswerTool"],
    );
    let session_id = researching_session(&store, &config, "stateful task").await;

    // First process: one echo step, then suspension on clarification
    let llm1 = Arc::new(MockLlmDriver::scripted(vec![
        MockLlmResponse::tool_calls(vec![echo_call("e1", "step one result")]),
        MockLlmResponse::tool_calls(vec![ToolCallRequest {
            id: "c1".into(),
            name: "ClarificationTool".into(),
            arguments: json!({"questions": ["continue?"]}),
        }]),
    ]));
    let (tx, _rx) = channel(256);
    driver(store.clone(), llm1, config.clone(), tx)
        .run(session_id)
        .await
        .unwrap();

    // "Restart": resume through a brand-new driver and LLM handle
    let session = store.get_session(session_id).await.unwrap().unwrap();
    let mut context = SessionContext::from_value(&session.context).unwrap();
    assert_eq!(context.iteration, 2);
    context.clarifications_used += 1;
    context.clarification_requested = false;
    store
        .append_message(
            session_id,
            NewSessionMessage::conversation(&ChatMessage::text("user", "yes, continue")),
        )
        .await
        .unwrap();
    store
        .update_session_state(
            session_id,
            SessionState::WaitingForClarification,
            SessionState::Researching,
            &context,
        )
        .await
        .unwrap();

    let llm2 = Arc::new(MockLlmDriver::scripted(vec![MockLlmResponse::tool_calls(
        vec![final_answer_call("f1", "all done", "completed")],
    )]));
    let (tx, _rx) = channel(256);
    let outcome = driver(store.clone(), llm2.clone(), config, tx)
        .run(session_id)
        .await
        .unwrap();
    assert_eq!(outcome.final_state, SessionState::Completed);

    // Iteration numbering continued from the snapshot
    let session = store.get_session(session_id).await.unwrap().unwrap();
    let context = SessionContext::from_value(&session.context).unwrap();
    assert_eq!(context.iteration, 3);

    // The resumed request contained the full prior transcript exactly once
    let requests = llm2.requests();
    let replay = &requests[0].0;
    let echo_results = replay
        .iter()
        .filter(|m| m.role == "tool" && m.content_text().contains("step one result"))
        .count();
    assert_eq!(echo_results, 1);
    let user_messages = replay.iter().filter(|m| m.role == "user").count();
    assert_eq!(user_messages, 2);
}

// ============================================================================
// Assistant/user bookkeeping
// ============================================================================

#[tokio::test]
async fn final_answer_is_persisted_as_assistant_message() {
    let store = Arc::new(InMemorySessionStore::new());
    let config = runtime_config(json!({}), vec!["EchoTool", "FinalAnswerTool"]);
    let session_id = researching_session(&store, &config, "persist the answer").await;

    let llm = Arc::new(MockLlmDriver::scripted(vec![MockLlmResponse::tool_calls(
        vec![final_answer_call("f1", "persisted answer", "completed")],
    )]));
    let (tx, _rx) = channel(256);
    driver(store.clone(), llm, config, tx)
        .run(session_id)
        .await
        .unwrap();

    let messages = store.list_messages(session_id).await.unwrap();
    assert!(count_role(&messages, MessageRole::Assistant) >= 1);
    let last_conversation = conversation_of(&messages)
        .into_iter()
        .filter(|m| m.role == "assistant" && m.content.is_some())
        .next_back()
        .unwrap();
    assert_eq!(last_conversation.content_text(), "persisted answer");

    let step_types: Vec<MessageType> = messages.iter().map(|m| m.message_type).collect();
    assert!(step_types.contains(&MessageType::StepStart));
    assert!(step_types.contains(&MessageType::StepEnd));
}

