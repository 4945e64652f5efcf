// Core trait implementations backed by the Database facade

use async_trait::async_trait;
use uuid::Uuid;

use perpetua_contracts::{
    NewSessionMessage, Session, SessionMessage, SessionState, SystemPrompt, Template,
    TemplateVersion, Tool,
};
use perpetua_core::error::Result;
use perpetua_core::traits::{
    ChatTurn, SessionStore, TemplateStore, ToolExecutionRecord, ToolStore,
};
use perpetua_core::SessionContext;

use crate::repositories::Database;

#[async_trait]
impl SessionStore for Database {
    async fn create_session(
        &self,
        template_version_id: Uuid,
        title: Option<String>,
        context: &SessionContext,
    ) -> Result<Session> {
        Database::create_session(self, template_version_id, title.as_deref(), context).await
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        Database::get_session(self, id).await
    }

    async fn list_messages(&self, session_id: Uuid) -> Result<Vec<SessionMessage>> {
        self.list_session_messages(session_id).await
    }

    async fn append_message(&self, session_id: Uuid, message: NewSessionMessage) -> Result<i64> {
        self.append_session_message(session_id, &message).await
    }

    async fn update_session_state(
        &self,
        id: Uuid,
        expected: SessionState,
        new: SessionState,
        context: &SessionContext,
    ) -> Result<bool> {
        Database::update_session_state(self, id, expected, new, context).await
    }

    async fn update_session_context(&self, id: Uuid, context: &SessionContext) -> Result<()> {
        Database::update_session_context(self, id, context).await
    }

    async fn commit_step(
        &self,
        session_id: Uuid,
        messages: Vec<NewSessionMessage>,
        executions: Vec<ToolExecutionRecord>,
        context: &SessionContext,
    ) -> Result<()> {
        Database::commit_step(self, session_id, &messages, &executions, context).await
    }
}

#[async_trait]
impl ToolStore for Database {
    async fn list_active_tools(&self) -> Result<Vec<Tool>> {
        self.list_tools(true).await
    }

    async fn search_chat_turns(
        &self,
        query: &str,
        session_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<ChatTurn>> {
        Database::search_chat_turns(self, query, session_id, limit).await
    }
}

#[async_trait]
impl TemplateStore for Database {
    async fn get_template(&self, id: Uuid) -> Result<Option<Template>> {
        Database::get_template(self, id).await
    }

    async fn get_template_by_name(&self, name: &str) -> Result<Option<Template>> {
        Database::get_template_by_name(self, name).await
    }

    async fn get_version(&self, id: Uuid) -> Result<Option<TemplateVersion>> {
        self.get_template_version(id).await
    }

    async fn list_active_versions(&self) -> Result<Vec<(Template, TemplateVersion)>> {
        self.list_active_template_versions().await
    }

    async fn list_system_prompts(&self) -> Result<Vec<SystemPrompt>> {
        Database::list_system_prompts(self).await
    }
}
