// Session service: create and resume sessions on behalf of the gateway
//
// Start renders the system prompt against the first step's tool selection
// and the initial-user template, then moves INITED → RESEARCHING. Resume
// requires WAITING_FOR_CLARIFICATION and moves back to RESEARCHING with the
// clarification counter bumped; concurrent resumes lose the CAS and surface
// as stale_session.

use std::sync::Arc;

use perpetua_contracts::{ChatMessage, NewSessionMessage, Session, SessionState};
use perpetua_core::{
    PromptsConfig, Result, RuntimeError, SessionContext, TemplateRuntimeConfig, ToolCatalog,
    ToolSelector,
};
use perpetua_storage::Database;

pub struct SessionService {
    db: Arc<Database>,
    selector: ToolSelector,
}

impl SessionService {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            selector: ToolSelector::default(),
        }
    }

    /// Create a session for a task and hand it to the pool
    pub async fn start_session(
        &self,
        config: &TemplateRuntimeConfig,
        prompts: &PromptsConfig,
        catalog: &ToolCatalog,
        task: &str,
        title: Option<String>,
    ) -> Result<Session> {
        let context = SessionContext::default();
        let title = title.or_else(|| Some(derive_title(task)));
        let session = self
            .db
            .create_session(config.version_id, title.as_deref(), &context)
            .await?;

        // The system prompt advertises the first step's tool selection
        let tool_descriptions = match self.selector.select(
            catalog,
            config,
            &context,
            SessionState::Inited,
            task,
        ) {
            Ok(selection) => selection
                .tools
                .iter()
                .map(|t| {
                    let schema = t.tool.schema();
                    format!("{}: {}", schema.name, schema.description)
                })
                .collect(),
            Err(RuntimeError::EmptySelection) => Vec::new(),
            Err(e) => return Err(e),
        };

        let system = ChatMessage::text("system", prompts.render_system(&tool_descriptions));
        self.db
            .append_session_message(session.id, &NewSessionMessage::conversation(&system))
            .await?;

        let user = ChatMessage::text("user", prompts.render_initial_user(task));
        self.db
            .append_session_message(session.id, &NewSessionMessage::conversation(&user))
            .await?;

        let moved = self
            .db
            .update_session_state(
                session.id,
                SessionState::Inited,
                SessionState::Researching,
                &context,
            )
            .await?;
        if !moved {
            return Err(RuntimeError::StaleSession(session.id));
        }

        tracing::info!(
            session_id = %session.id,
            template = %config.template_name,
            "session started"
        );
        self.db.get_session(session.id).await?.ok_or(RuntimeError::SessionNotFound(session.id))
    }

    /// Resume a suspended session with the user's clarification answer
    pub async fn resume_with_clarification(
        &self,
        session: &Session,
        prompts: &PromptsConfig,
        clarification: &str,
    ) -> Result<()> {
        if session.state != SessionState::WaitingForClarification {
            return Err(RuntimeError::StaleSession(session.id));
        }

        let mut context = SessionContext::from_value(&session.context)?;
        context.clarifications_used += 1;
        context.clarification_requested = false;
        context.pending_clarification.clear();

        // Message append and CAS commit in one transaction: exactly one
        // concurrent resume wins, and the loser's message is rolled back
        let user = ChatMessage::text("user", prompts.render_clarification(clarification));
        let moved = self
            .db
            .resume_with_clarification(
                session.id,
                &NewSessionMessage::conversation(&user),
                &context,
            )
            .await?;
        if !moved {
            return Err(RuntimeError::StaleSession(session.id));
        }

        tracing::info!(session_id = %session.id, "session resumed with clarification");
        Ok(())
    }
}

/// Short session title from the first line of the task
fn derive_title(task: &str) -> String {
    let line = task.lines().next().unwrap_or("").trim();
    let title: String = line.chars().take(80).collect();
    if title.is_empty() {
        "New Chat".to_string()
    } else {
        title
    }
}

#[cfg(test)]
mod tests {
    use super::derive_title;

    #[test]
    fn title_is_first_line_truncated() {
        assert_eq!(derive_title("What is 2+2?\nmore detail"), "What is 2+2?");
        assert_eq!(derive_title(""), "New Chat");
        let long = "x".repeat(200);
        assert_eq!(derive_title(&long).chars().count(), 80);
    }
}
