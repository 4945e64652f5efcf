// In-memory store and LLM doubles
//
// Used by unit and integration tests. The in-memory session store keeps the
// same CAS and sequencing semantics as the Postgres implementation.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use uuid::Uuid;

use perpetua_contracts::{
    ChatMessage, MessageRole, MessageType, NewSessionMessage, Session, SessionMessage,
    SessionState, SystemPrompt, Template, TemplateVersion, Tool,
};

use crate::context::SessionContext;
use crate::error::{Result, RuntimeError};
use crate::llm::{LlmCallConfig, LlmDriver, LlmResponseStream, LlmStreamEvent, ToolCallRequest};
use crate::traits::{
    ChatTurn, SessionStore, TemplateStore, ToolExecutionRecord, ToolStore,
};

#[derive(Default)]
struct SessionEntry {
    session: Option<Session>,
    messages: Vec<SessionMessage>,
    executions: Vec<ToolExecutionRecord>,
}

/// In-memory SessionStore with CAS semantics
#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    inner: Arc<Mutex<HashMap<Uuid, SessionEntry>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn executions(&self, session_id: Uuid) -> Vec<ToolExecutionRecord> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .get(&session_id)
            .map(|e| e.executions.clone())
            .unwrap_or_default()
    }

    fn append_locked(
        entry: &mut SessionEntry,
        session_id: Uuid,
        message: NewSessionMessage,
    ) -> i64 {
        let seq = entry.messages.last().map(|m| m.seq).unwrap_or(0) + 1;
        entry.messages.push(SessionMessage {
            id: Uuid::new_v4(),
            session_id,
            seq,
            role: message.role,
            content: message.content,
            message_type: message.message_type,
            step_number: message.step_number,
            step_data: message.step_data,
            created_at: Utc::now(),
        });
        seq
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_session(
        &self,
        template_version_id: Uuid,
        title: Option<String>,
        context: &SessionContext,
    ) -> Result<Session> {
        let session = Session {
            id: Uuid::new_v4(),
            template_version_id,
            instance_id: None,
            title,
            state: SessionState::Inited,
            context: context.to_value(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.insert(
            session.id,
            SessionEntry {
                session: Some(session.clone()),
                ..Default::default()
            },
        );
        Ok(session)
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.get(&id).and_then(|e| e.session.clone()))
    }

    async fn list_messages(&self, session_id: Uuid) -> Result<Vec<SessionMessage>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner
            .get(&session_id)
            .map(|e| e.messages.clone())
            .unwrap_or_default())
    }

    async fn append_message(&self, session_id: Uuid, message: NewSessionMessage) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = inner
            .get_mut(&session_id)
            .ok_or(RuntimeError::SessionNotFound(session_id))?;
        Ok(Self::append_locked(entry, session_id, message))
    }

    async fn update_session_state(
        &self,
        id: Uuid,
        expected: SessionState,
        new: SessionState,
        context: &SessionContext,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = inner.get_mut(&id).ok_or(RuntimeError::SessionNotFound(id))?;
        let Some(session) = entry.session.as_mut() else {
            return Err(RuntimeError::SessionNotFound(id));
        };
        // Terminal states are sticky; a mismatched expectation is a conflict
        if session.state != expected || session.state.is_terminal() {
            return Ok(false);
        }
        session.state = new;
        session.context = context.to_value();
        session.updated_at = Utc::now();
        Ok(true)
    }

    async fn update_session_context(&self, id: Uuid, context: &SessionContext) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = inner.get_mut(&id).ok_or(RuntimeError::SessionNotFound(id))?;
        if let Some(session) = entry.session.as_mut() {
            session.context = context.to_value();
            session.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn commit_step(
        &self,
        session_id: Uuid,
        messages: Vec<NewSessionMessage>,
        executions: Vec<ToolExecutionRecord>,
        context: &SessionContext,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = inner
            .get_mut(&session_id)
            .ok_or(RuntimeError::SessionNotFound(session_id))?;
        for message in messages {
            Self::append_locked(entry, session_id, message);
        }
        entry.executions.extend(executions);
        if let Some(session) = entry.session.as_mut() {
            session.context = context.to_value();
            session.updated_at = Utc::now();
        }
        Ok(())
    }
}

/// In-memory ToolStore over fixed tool rows and chat turns
#[derive(Clone, Default)]
pub struct InMemoryToolStore {
    tools: Arc<Mutex<Vec<Tool>>>,
    turns: Arc<Mutex<Vec<ChatTurn>>>,
}

impl InMemoryToolStore {
    pub fn with_tools(tools: Vec<Tool>) -> Self {
        Self {
            tools: Arc::new(Mutex::new(tools)),
            turns: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push_turn(&self, turn: ChatTurn) {
        self.turns.lock().unwrap_or_else(|e| e.into_inner()).push(turn);
    }
}

#[async_trait]
impl ToolStore for InMemoryToolStore {
    async fn list_active_tools(&self) -> Result<Vec<Tool>> {
        let tools = self.tools.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tools.iter().filter(|t| t.is_active).cloned().collect())
    }

    async fn search_chat_turns(
        &self,
        query: &str,
        session_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<ChatTurn>> {
        let needle = query.to_lowercase();
        let turns = self.turns.lock().unwrap_or_else(|e| e.into_inner());
        Ok(turns
            .iter()
            .filter(|t| session_id.map_or(true, |id| t.session_id == id))
            .filter(|t| {
                t.question.to_lowercase().contains(&needle)
                    || t.answer.to_lowercase().contains(&needle)
            })
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

/// In-memory TemplateStore over fixed rows
#[derive(Clone, Default)]
pub struct InMemoryTemplateStore {
    templates: Arc<Mutex<Vec<Template>>>,
    versions: Arc<Mutex<Vec<TemplateVersion>>>,
    prompts: Arc<Mutex<Vec<SystemPrompt>>>,
}

impl InMemoryTemplateStore {
    pub fn with_data(templates: Vec<Template>, versions: Vec<TemplateVersion>) -> Self {
        Self {
            templates: Arc::new(Mutex::new(templates)),
            versions: Arc::new(Mutex::new(versions)),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl TemplateStore for InMemoryTemplateStore {
    async fn get_template(&self, id: Uuid) -> Result<Option<Template>> {
        let templates = self.templates.lock().unwrap_or_else(|e| e.into_inner());
        Ok(templates.iter().find(|t| t.id == id).cloned())
    }

    async fn get_template_by_name(&self, name: &str) -> Result<Option<Template>> {
        let templates = self.templates.lock().unwrap_or_else(|e| e.into_inner());
        Ok(templates.iter().find(|t| t.name == name).cloned())
    }

    async fn get_version(&self, id: Uuid) -> Result<Option<TemplateVersion>> {
        let versions = self.versions.lock().unwrap_or_else(|e| e.into_inner());
        Ok(versions.iter().find(|v| v.id == id).cloned())
    }

    async fn list_active_versions(&self) -> Result<Vec<(Template, TemplateVersion)>> {
        let templates = self.templates.lock().unwrap_or_else(|e| e.into_inner());
        let versions = self.versions.lock().unwrap_or_else(|e| e.into_inner());
        Ok(versions
            .iter()
            .filter(|v| v.is_active)
            .filter_map(|v| {
                templates
                    .iter()
                    .find(|t| t.id == v.template_id)
                    .map(|t| (t.clone(), v.clone()))
            })
            .collect())
    }

    async fn list_system_prompts(&self) -> Result<Vec<SystemPrompt>> {
        let prompts = self.prompts.lock().unwrap_or_else(|e| e.into_inner());
        Ok(prompts.clone())
    }
}

/// One scripted LLM response
#[derive(Debug, Clone, Default)]
pub struct MockLlmResponse {
    pub text_deltas: Vec<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub finish_reason: Option<String>,
}

impl MockLlmResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            text_deltas: vec![content.into()],
            finish_reason: Some("stop".to_string()),
            ..Default::default()
        }
    }

    pub fn tool_calls(calls: Vec<ToolCallRequest>) -> Self {
        Self {
            tool_calls: calls,
            finish_reason: Some("tool_calls".to_string()),
            ..Default::default()
        }
    }
}

/// Scripted LLM driver: pops one response per call, records each request
#[derive(Clone, Default)]
pub struct MockLlmDriver {
    responses: Arc<Mutex<VecDeque<MockLlmResponse>>>,
    requests: Arc<Mutex<Vec<(Vec<ChatMessage>, LlmCallConfig)>>>,
}

impl MockLlmDriver {
    pub fn scripted(responses: Vec<MockLlmResponse>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push(&self, response: MockLlmResponse) {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(response);
    }

    /// All requests seen so far (messages + call config)
    pub fn requests(&self) -> Vec<(Vec<ChatMessage>, LlmCallConfig)> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl LlmDriver for MockLlmDriver {
    async fn chat_stream(
        &self,
        messages: Vec<ChatMessage>,
        config: &LlmCallConfig,
    ) -> Result<LlmResponseStream> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((messages, config.clone()));

        let response = self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .ok_or_else(|| RuntimeError::llm("mock driver ran out of scripted responses"))?;

        let mut events: Vec<Result<LlmStreamEvent>> = response
            .text_deltas
            .into_iter()
            .map(|delta| Ok(LlmStreamEvent::TextDelta(delta)))
            .collect();
        if !response.tool_calls.is_empty() {
            events.push(Ok(LlmStreamEvent::ToolCalls(response.tool_calls)));
        }
        events.push(Ok(LlmStreamEvent::Done {
            finish_reason: response.finish_reason,
        }));

        Ok(futures::stream::iter(events).boxed())
    }
}

/// Conversation rows of a session as chat messages (test helper)
pub fn conversation_of(messages: &[SessionMessage]) -> Vec<ChatMessage> {
    messages
        .iter()
        .filter(|m| m.message_type == MessageType::Message)
        .filter_map(|m| serde_json::from_value(m.content.clone()).ok())
        .collect()
}

/// Count messages of a given role among conversation rows (test helper)
pub fn count_role(messages: &[SessionMessage], role: MessageRole) -> usize {
    messages
        .iter()
        .filter(|m| m.message_type == MessageType::Message && m.role == role)
        .count()
}
