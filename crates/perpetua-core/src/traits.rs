// Store traits consumed by the runtime kernel
//
// The storage crate implements these against Postgres; the in-memory
// doubles in `memory` implement them for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use perpetua_contracts::{
    NewSessionMessage, Session, SessionMessage, SessionState, SystemPrompt, Template,
    TemplateVersion, Tool,
};

use crate::context::SessionContext;
use crate::error::Result;

/// Outcome class of one tool invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolExecutionStatus {
    Ok,
    Error,
    Timeout,
}

impl ToolExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolExecutionStatus::Ok => "ok",
            ToolExecutionStatus::Error => "error",
            ToolExecutionStatus::Timeout => "timeout",
        }
    }
}

impl From<&str> for ToolExecutionStatus {
    fn from(s: &str) -> Self {
        match s {
            "ok" => ToolExecutionStatus::Ok,
            "timeout" => ToolExecutionStatus::Timeout,
            _ => ToolExecutionStatus::Error,
        }
    }
}

/// Record of one tool invocation, written with the step transaction
#[derive(Debug, Clone)]
pub struct ToolExecutionRecord {
    pub tool_id: Option<Uuid>,
    pub tool_name: String,
    pub arguments: Value,
    pub result: Option<Value>,
    pub status: ToolExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Derived Q/A pair searched by the chat-history tool
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub id: Uuid,
    pub session_id: Uuid,
    pub question: String,
    pub answer: String,
    pub model_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Session persistence operations used by the loop driver and session service
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(
        &self,
        template_version_id: Uuid,
        title: Option<String>,
        context: &SessionContext,
    ) -> Result<Session>;

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>>;

    async fn list_messages(&self, session_id: Uuid) -> Result<Vec<SessionMessage>>;

    /// Append one message; the store assigns the next gap-free sequence
    async fn append_message(&self, session_id: Uuid, message: NewSessionMessage) -> Result<i64>;

    /// Compare-and-set state transition; returns false on conflict
    async fn update_session_state(
        &self,
        id: Uuid,
        expected: SessionState,
        new: SessionState,
        context: &SessionContext,
    ) -> Result<bool>;

    async fn update_session_context(&self, id: Uuid, context: &SessionContext) -> Result<()>;

    /// Atomically append messages, write tool execution rows, and persist
    /// the context snapshot in one transaction
    async fn commit_step(
        &self,
        session_id: Uuid,
        messages: Vec<NewSessionMessage>,
        executions: Vec<ToolExecutionRecord>,
        context: &SessionContext,
    ) -> Result<()>;
}

/// Tool catalog reads plus the chat-turn search surface
#[async_trait]
pub trait ToolStore: Send + Sync {
    async fn list_active_tools(&self) -> Result<Vec<Tool>>;

    async fn search_chat_turns(
        &self,
        query: &str,
        session_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<ChatTurn>>;
}

/// Template and prompt reads used at session start and worker prewarm
#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn get_template(&self, id: Uuid) -> Result<Option<Template>>;

    async fn get_template_by_name(&self, name: &str) -> Result<Option<Template>>;

    async fn get_version(&self, id: Uuid) -> Result<Option<TemplateVersion>>;

    /// Active (template, version) pairs exposed as models
    async fn list_active_versions(&self) -> Result<Vec<(Template, TemplateVersion)>>;

    async fn list_system_prompts(&self) -> Result<Vec<SystemPrompt>>;
}

/// Retry a store operation on transient errors: 50ms, 200ms, 1s backoff
pub async fn with_store_retry<T, F, Fut>(mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    const BACKOFF_MS: [u64; 3] = [50, 200, 1000];
    let mut attempt = 0;
    loop {
        match operation().await {
            Err(e) if e.is_transient_store() && attempt < BACKOFF_MS.len() => {
                tracing::warn!(attempt, error = %e, "transient store error, retrying");
                tokio::time::sleep(std::time::Duration::from_millis(BACKOFF_MS[attempt])).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn retry_recovers_from_transient_errors() {
        let attempts = AtomicUsize::new(0);
        let result = with_store_retry(|| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(RuntimeError::transient_store("busy"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn retry_gives_up_after_three_attempts() {
        let attempts = AtomicUsize::new(0);
        let result: Result<()> = with_store_retry(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(RuntimeError::transient_store("still busy")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_errors_do_not_retry() {
        let attempts = AtomicUsize::new(0);
        let result: Result<()> = with_store_retry(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(RuntimeError::store("constraint violation")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
