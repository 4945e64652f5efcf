// Repository layer for database operations
//
// One facade over the pool; all state transitions for sessions and
// instances go through compare-and-set UPDATEs, and every in-loop session
// mutation commits messages, tool executions, and the context snapshot in
// a single transaction.

use sqlx::postgres::PgPool;
use sqlx::types::JsonValue;
use uuid::Uuid;

use perpetua_contracts::{
    AgentInstance, InstanceStatus, NewSessionMessage, Session, SessionMessage, SessionState,
    SystemPrompt, Template, TemplateVersion, Tool,
};
use perpetua_core::error::{Result, RuntimeError};
use perpetua_core::traits::{ChatTurn, ToolExecutionRecord};
use perpetua_core::SessionContext;

use crate::models::*;

/// Map sqlx failures onto the runtime error taxonomy
///
/// Pool exhaustion, I/O faults, and serialization/uniqueness conflicts are
/// transient (the caller's retry may succeed); everything else is permanent.
pub(crate) fn map_sqlx(e: sqlx::Error) -> RuntimeError {
    match &e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            RuntimeError::transient_store(e.to_string())
        }
        sqlx::Error::Database(db) => {
            // 40001 serialization_failure, 40P01 deadlock, 23505 unique (seq races)
            let code = db.code().unwrap_or_default();
            if code == "40001" || code == "40P01" || code == "23505" {
                RuntimeError::transient_store(e.to_string())
            } else {
                RuntimeError::store(e.to_string())
            }
        }
        _ => RuntimeError::store(e.to_string()),
    }
}

/// Counters and outcome reported when an instance releases a session
#[derive(Debug, Clone, Default)]
pub struct ReleaseOutcome {
    pub error: Option<String>,
    pub messages: i64,
    pub tool_calls: i64,
    pub tool_errors: bool,
}

#[derive(Debug, Clone)]
pub struct NewTool {
    pub name: String,
    pub description: Option<String>,
    pub entrypoint: Option<String>,
    pub config: JsonValue,
    pub embedding: Option<Vec<f32>>,
    pub category: String,
}

#[derive(Debug, Clone)]
pub struct NewInstance {
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub template_id: Uuid,
    pub template_version_id: Uuid,
    pub is_enabled: bool,
    pub auto_start: bool,
    pub priority: i32,
}

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn from_url(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await.map_err(map_sqlx)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| RuntimeError::store(e.to_string()))
    }

    // ========================================================================
    // Templates
    // ========================================================================

    pub async fn create_template(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<Template> {
        let row = sqlx::query_as::<_, TemplateRow>(
            r#"
            INSERT INTO agent_templates (name, description)
            VALUES ($1, $2)
            RETURNING id, name, description, active_version_id, created_at, updated_at
            "#,
        )
        .bind(name)
        .bind(description)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.into())
    }

    pub async fn get_template(&self, id: Uuid) -> Result<Option<Template>> {
        let row = sqlx::query_as::<_, TemplateRow>(
            r#"
            SELECT id, name, description, active_version_id, created_at, updated_at
            FROM agent_templates WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.map(Into::into))
    }

    pub async fn get_template_by_name(&self, name: &str) -> Result<Option<Template>> {
        let row = sqlx::query_as::<_, TemplateRow>(
            r#"
            SELECT id, name, description, active_version_id, created_at, updated_at
            FROM agent_templates WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.map(Into::into))
    }

    pub async fn list_templates(&self) -> Result<Vec<Template>> {
        let rows = sqlx::query_as::<_, TemplateRow>(
            r#"
            SELECT id, name, description, active_version_id, created_at, updated_at
            FROM agent_templates ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Create the next version for a template (version numbers are monotone)
    pub async fn create_template_version(
        &self,
        template_id: Uuid,
        settings: &JsonValue,
        tools: &[String],
        embedding: Option<&Vec<f32>>,
    ) -> Result<TemplateVersion> {
        let row = sqlx::query_as::<_, TemplateVersionRow>(
            r#"
            INSERT INTO template_versions (template_id, version, settings, tools, embedding)
            SELECT $1, COALESCE(MAX(version), 0) + 1, $2, $3, $4
            FROM template_versions WHERE template_id = $1
            RETURNING id, template_id, version, settings, tools, embedding, is_active, created_at
            "#,
        )
        .bind(template_id)
        .bind(settings)
        .bind(serde_json::to_value(tools).unwrap_or(JsonValue::Null))
        .bind(embedding.map(|e| serde_json::to_value(e).unwrap_or(JsonValue::Null)))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.into())
    }

    pub async fn get_template_version(&self, id: Uuid) -> Result<Option<TemplateVersion>> {
        let row = sqlx::query_as::<_, TemplateVersionRow>(
            r#"
            SELECT id, template_id, version, settings, tools, embedding, is_active, created_at
            FROM template_versions WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.map(Into::into))
    }

    pub async fn list_template_versions(&self, template_id: Uuid) -> Result<Vec<TemplateVersion>> {
        let rows = sqlx::query_as::<_, TemplateVersionRow>(
            r#"
            SELECT id, template_id, version, settings, tools, embedding, is_active, created_at
            FROM template_versions WHERE template_id = $1 ORDER BY version
            "#,
        )
        .bind(template_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Activate one version; its siblings are deactivated in the same
    /// transaction so exactly one version per template stays active
    pub async fn activate_template_version(
        &self,
        template_id: Uuid,
        version_id: Uuid,
    ) -> Result<Option<TemplateVersion>> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        sqlx::query(
            "UPDATE template_versions SET is_active = FALSE WHERE template_id = $1",
        )
        .bind(template_id)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        let row = sqlx::query_as::<_, TemplateVersionRow>(
            r#"
            UPDATE template_versions SET is_active = TRUE
            WHERE id = $1 AND template_id = $2
            RETURNING id, template_id, version, settings, tools, embedding, is_active, created_at
            "#,
        )
        .bind(version_id)
        .bind(template_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        let Some(row) = row else {
            tx.rollback().await.map_err(map_sqlx)?;
            return Ok(None);
        };

        sqlx::query(
            "UPDATE agent_templates SET active_version_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(template_id)
        .bind(version_id)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        tx.commit().await.map_err(map_sqlx)?;
        Ok(Some(row.into()))
    }

    /// Active (template, version) pairs exposed as models by the gateway
    pub async fn list_active_template_versions(
        &self,
    ) -> Result<Vec<(Template, TemplateVersion)>> {
        let templates = self.list_templates().await?;
        let mut active = Vec::new();
        for template in templates {
            let Some(version_id) = template.active_version_id else {
                continue;
            };
            if let Some(version) = self.get_template_version(version_id).await? {
                active.push((template, version));
            }
        }
        Ok(active)
    }

    // ========================================================================
    // Tools
    // ========================================================================

    pub async fn create_tool(&self, input: NewTool) -> Result<Tool> {
        let row = sqlx::query_as::<_, ToolRow>(
            r#"
            INSERT INTO tools (name, description, entrypoint, config, embedding, category)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, name, description, entrypoint, config, embedding, category,
                      is_active, created_at, updated_at
            "#,
        )
        .bind(input.name)
        .bind(input.description)
        .bind(input.entrypoint)
        .bind(input.config)
        .bind(
            input
                .embedding
                .map(|e| serde_json::to_value(e).unwrap_or(JsonValue::Null)),
        )
        .bind(input.category)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.into())
    }

    pub async fn get_tool(&self, id: Uuid) -> Result<Option<Tool>> {
        let row = sqlx::query_as::<_, ToolRow>(
            r#"
            SELECT id, name, description, entrypoint, config, embedding, category,
                   is_active, created_at, updated_at
            FROM tools WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.map(Into::into))
    }

    pub async fn get_tool_by_name(&self, name: &str) -> Result<Option<Tool>> {
        let row = sqlx::query_as::<_, ToolRow>(
            r#"
            SELECT id, name, description, entrypoint, config, embedding, category,
                   is_active, created_at, updated_at
            FROM tools WHERE LOWER(name) = LOWER($1)
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.map(Into::into))
    }

    pub async fn list_tools(&self, only_active: bool) -> Result<Vec<Tool>> {
        let rows = sqlx::query_as::<_, ToolRow>(
            r#"
            SELECT id, name, description, entrypoint, config, embedding, category,
                   is_active, created_at, updated_at
            FROM tools
            WHERE ($1 = FALSE OR is_active)
            ORDER BY name
            "#,
        )
        .bind(only_active)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn set_tool_active(&self, id: Uuid, is_active: bool) -> Result<Option<Tool>> {
        let row = sqlx::query_as::<_, ToolRow>(
            r#"
            UPDATE tools SET is_active = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING id, name, description, entrypoint, config, embedding, category,
                      is_active, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(is_active)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.map(Into::into))
    }

    // ========================================================================
    // Sessions & messages
    // ========================================================================

    pub async fn create_session(
        &self,
        template_version_id: Uuid,
        title: Option<&str>,
        context: &SessionContext,
    ) -> Result<Session> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            INSERT INTO sessions (template_version_id, title, context)
            VALUES ($1, $2, $3)
            RETURNING id, template_version_id, instance_id, title, state, context,
                      created_at, updated_at
            "#,
        )
        .bind(template_version_id)
        .bind(title)
        .bind(context.to_value())
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.into())
    }

    pub async fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT id, template_version_id, instance_id, title, state, context,
                   created_at, updated_at
            FROM sessions WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.map(Into::into))
    }

    pub async fn list_sessions(&self, limit: i64) -> Result<Vec<Session>> {
        let rows = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT id, template_version_id, instance_id, title, state, context,
                   created_at, updated_at
            FROM sessions ORDER BY updated_at DESC LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn update_session_title(&self, id: Uuid, title: &str) -> Result<Option<Session>> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            UPDATE sessions SET title = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING id, template_version_id, instance_id, title, state, context,
                      created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(title)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.map(Into::into))
    }

    pub async fn delete_session(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_session_messages(&self, session_id: Uuid) -> Result<Vec<SessionMessage>> {
        let rows = sqlx::query_as::<_, SessionMessageRow>(
            r#"
            SELECT id, session_id, seq, role, content, message_type, step_number,
                   step_data, created_at
            FROM session_messages WHERE session_id = $1 ORDER BY seq
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Append one message; seq assignment is atomic with the insert, and the
    /// unique (session_id, seq) constraint turns races into retryable errors
    pub async fn append_session_message(
        &self,
        session_id: Uuid,
        message: &NewSessionMessage,
    ) -> Result<i64> {
        let seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO session_messages (session_id, seq, role, content, message_type,
                                          step_number, step_data)
            SELECT $1, COALESCE(MAX(seq), 0) + 1, $2, $3, $4, $5, $6
            FROM session_messages WHERE session_id = $1
            RETURNING seq
            "#,
        )
        .bind(session_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.message_type.as_str())
        .bind(message.step_number)
        .bind(&message.step_data)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(seq)
    }

    /// Compare-and-set state transition; terminal states are sticky
    pub async fn update_session_state(
        &self,
        id: Uuid,
        expected: SessionState,
        new: SessionState,
        context: &SessionContext,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sessions SET state = $3, context = $4, updated_at = NOW()
            WHERE id = $1 AND state = $2 AND state NOT IN ('COMPLETED', 'FAILED')
            "#,
        )
        .bind(id)
        .bind(expected.as_str())
        .bind(new.as_str())
        .bind(context.to_value())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_session_context(&self, id: Uuid, context: &SessionContext) -> Result<()> {
        sqlx::query("UPDATE sessions SET context = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(context.to_value())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    /// Resume a suspended session: the clarification message append and the
    /// CAS back to RESEARCHING commit together, so of two concurrent resumes
    /// exactly one transition is accepted and the loser leaves no orphan
    /// message behind
    pub async fn resume_with_clarification(
        &self,
        session_id: Uuid,
        message: &NewSessionMessage,
        context: &SessionContext,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let moved = sqlx::query(
            r#"
            UPDATE sessions SET state = 'RESEARCHING', context = $2, updated_at = NOW()
            WHERE id = $1 AND state = 'WAITING_FOR_CLARIFICATION'
            "#,
        )
        .bind(session_id)
        .bind(context.to_value())
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?
        .rows_affected()
            > 0;

        if !moved {
            tx.rollback().await.map_err(map_sqlx)?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO session_messages (session_id, seq, role, content, message_type,
                                          step_number, step_data)
            SELECT $1, COALESCE(MAX(seq), 0) + 1, $2, $3, $4, $5, $6
            FROM session_messages WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.message_type.as_str())
        .bind(message.step_number)
        .bind(&message.step_data)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        tx.commit().await.map_err(map_sqlx)?;
        Ok(true)
    }

    /// One step's writes in a single transaction: messages, tool execution
    /// rows, and the context snapshot
    pub async fn commit_step(
        &self,
        session_id: Uuid,
        messages: &[NewSessionMessage],
        executions: &[ToolExecutionRecord],
        context: &SessionContext,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        for message in messages {
            sqlx::query(
                r#"
                INSERT INTO session_messages (session_id, seq, role, content, message_type,
                                              step_number, step_data)
                SELECT $1, COALESCE(MAX(seq), 0) + 1, $2, $3, $4, $5, $6
                FROM session_messages WHERE session_id = $1
                "#,
            )
            .bind(session_id)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(message.message_type.as_str())
            .bind(message.step_number)
            .bind(&message.step_data)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }

        for execution in executions {
            sqlx::query(
                r#"
                INSERT INTO tool_executions (session_id, tool_id, tool_name, arguments,
                                             result, status, started_at, finished_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(session_id)
            .bind(execution.tool_id)
            .bind(&execution.tool_name)
            .bind(&execution.arguments)
            .bind(&execution.result)
            .bind(execution.status.as_str())
            .bind(execution.started_at)
            .bind(execution.finished_at)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }

        sqlx::query("UPDATE sessions SET context = $2, updated_at = NOW() WHERE id = $1")
            .bind(session_id)
            .bind(context.to_value())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    /// Sessions ready to be picked up by a worker of the pinned version,
    /// FIFO by last update
    pub async fn find_claimable_sessions(
        &self,
        template_version_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Session>> {
        let rows = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT id, template_version_id, instance_id, title, state, context,
                   created_at, updated_at
            FROM sessions
            WHERE state = 'RESEARCHING' AND instance_id IS NULL AND template_version_id = $1
            ORDER BY updated_at
            LIMIT $2
            "#,
        )
        .bind(template_version_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    // ========================================================================
    // Agent instances
    // ========================================================================

    pub async fn create_instance(&self, input: NewInstance) -> Result<AgentInstance> {
        let row = sqlx::query_as::<_, AgentInstanceRow>(
            r#"
            INSERT INTO agent_instances
                (name, display_name, description, template_id, template_version_id,
                 is_enabled, auto_start, priority)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(input.name)
        .bind(input.display_name)
        .bind(input.description)
        .bind(input.template_id)
        .bind(input.template_version_id)
        .bind(input.is_enabled)
        .bind(input.auto_start)
        .bind(input.priority)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.into())
    }

    pub async fn get_instance(&self, id: Uuid) -> Result<Option<AgentInstance>> {
        let row = sqlx::query_as::<_, AgentInstanceRow>(
            "SELECT * FROM agent_instances WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.map(Into::into))
    }

    pub async fn list_instances(&self) -> Result<Vec<AgentInstance>> {
        let rows = sqlx::query_as::<_, AgentInstanceRow>(
            "SELECT * FROM agent_instances ORDER BY priority DESC, name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn list_enabled_instances(&self) -> Result<Vec<AgentInstance>> {
        let rows = sqlx::query_as::<_, AgentInstanceRow>(
            "SELECT * FROM agent_instances WHERE is_enabled ORDER BY priority DESC, name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Enabled IDLE instance with the highest priority for a template
    pub async fn find_idle_instance(&self, template_id: Uuid) -> Result<Option<AgentInstance>> {
        let row = sqlx::query_as::<_, AgentInstanceRow>(
            r#"
            SELECT * FROM agent_instances
            WHERE template_id = $1 AND is_enabled AND status = 'IDLE'
            ORDER BY priority DESC
            LIMIT 1
            "#,
        )
        .bind(template_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.map(Into::into))
    }

    pub async fn set_instance_enabled(
        &self,
        id: Uuid,
        is_enabled: bool,
    ) -> Result<Option<AgentInstance>> {
        let row = sqlx::query_as::<_, AgentInstanceRow>(
            r#"
            UPDATE agent_instances SET is_enabled = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(is_enabled)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.map(Into::into))
    }

    /// CAS status transition for an instance; returns false when the
    /// expected status no longer holds
    pub async fn set_instance_status(
        &self,
        id: Uuid,
        expected: InstanceStatus,
        new: InstanceStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE agent_instances
            SET status = $3,
                started_at = CASE WHEN $3 = 'STARTING' THEN NOW() ELSE started_at END,
                stopped_at = CASE WHEN $3 = 'OFFLINE' THEN NOW() ELSE stopped_at END,
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(expected.as_str())
        .bind(new.as_str())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    /// Claim a session for an instance: first writer wins
    ///
    /// Sets instance BUSY + current_session_id and the session's instance
    /// binding in one transaction; either CAS failing rolls everything back.
    pub async fn claim_instance(&self, instance_id: Uuid, session_id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let instance_claimed = sqlx::query(
            r#"
            UPDATE agent_instances
            SET status = 'BUSY', current_session_id = $2, updated_at = NOW()
            WHERE id = $1 AND status IN ('IDLE', 'STARTING') AND current_session_id IS NULL
            "#,
        )
        .bind(instance_id)
        .bind(session_id)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?
        .rows_affected()
            > 0;

        if !instance_claimed {
            tx.rollback().await.map_err(map_sqlx)?;
            return Ok(false);
        }

        let session_bound = sqlx::query(
            r#"
            UPDATE sessions SET instance_id = $2, updated_at = NOW()
            WHERE id = $1 AND instance_id IS NULL AND state = 'RESEARCHING'
            "#,
        )
        .bind(session_id)
        .bind(instance_id)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?
        .rows_affected()
            > 0;

        if !session_bound {
            tx.rollback().await.map_err(map_sqlx)?;
            return Ok(false);
        }

        tx.commit().await.map_err(map_sqlx)?;
        Ok(true)
    }

    /// Release a claimed session: clear both sides of the binding, update
    /// counters, and land on IDLE (or ERROR when the run faulted)
    pub async fn release_instance(
        &self,
        instance_id: Uuid,
        outcome: &ReleaseOutcome,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        sqlx::query("UPDATE sessions SET instance_id = NULL, updated_at = NOW() WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        let next_status = if outcome.error.is_some() { "ERROR" } else { "IDLE" };
        sqlx::query(
            r#"
            UPDATE agent_instances
            SET status = $2,
                current_session_id = NULL,
                total_sessions = total_sessions + 1,
                total_messages = total_messages + $3,
                total_tool_calls = total_tool_calls + $4,
                error_count = error_count + $5,
                last_error = COALESCE($6, last_error),
                last_error_at = CASE WHEN $6 IS NOT NULL THEN NOW() ELSE last_error_at END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(instance_id)
        .bind(next_status)
        .bind(outcome.messages)
        .bind(outcome.tool_calls)
        .bind(if outcome.error.is_some() || outcome.tool_errors { 1i64 } else { 0i64 })
        .bind(&outcome.error)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    pub async fn heartbeat(&self, instance_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE agent_instances SET last_heartbeat = NOW() WHERE id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    pub async fn record_instance_error(&self, instance_id: Uuid, message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE agent_instances
            SET status = 'ERROR', current_session_id = NULL,
                error_count = error_count + 1,
                last_error = $2, last_error_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(instance_id)
        .bind(message)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    // ========================================================================
    // Chat turns
    // ========================================================================

    pub async fn insert_chat_turn(
        &self,
        session_id: Uuid,
        question: &str,
        answer: &str,
        model_name: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chat_turns (session_id, question, answer, model_name)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(session_id)
        .bind(question)
        .bind(answer)
        .bind(model_name)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    pub async fn search_chat_turns(
        &self,
        query: &str,
        session_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<ChatTurn>> {
        let rows = sqlx::query_as::<_, ChatTurnRow>(
            r#"
            SELECT id, session_id, question, answer, model_name, created_at
            FROM chat_turns
            WHERE search_document @@ websearch_to_tsquery('english', $1)
              AND ($2::uuid IS NULL OR session_id = $2)
            ORDER BY ts_rank(search_document, websearch_to_tsquery('english', $1)) DESC,
                     created_at DESC
            LIMIT $3
            "#,
        )
        .bind(query)
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(rows
            .into_iter()
            .map(|row| ChatTurn {
                id: row.id,
                session_id: row.session_id,
                question: row.question,
                answer: row.answer,
                model_name: row.model_name,
                created_at: row.created_at,
            })
            .collect())
    }

    // ========================================================================
    // System prompts
    // ========================================================================

    pub async fn list_system_prompts(&self) -> Result<Vec<SystemPrompt>> {
        let rows = sqlx::query_as::<_, SystemPromptRow>(
            r#"
            SELECT id, name, description, content, placeholders, is_active,
                   created_at, updated_at
            FROM system_prompts ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn upsert_system_prompt(
        &self,
        id: &str,
        name: &str,
        content: &str,
        placeholders: &[String],
    ) -> Result<SystemPrompt> {
        let row = sqlx::query_as::<_, SystemPromptRow>(
            r#"
            INSERT INTO system_prompts (id, name, content, placeholders)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
                SET name = EXCLUDED.name,
                    content = EXCLUDED.content,
                    placeholders = EXCLUDED.placeholders,
                    updated_at = NOW()
            RETURNING id, name, description, content, placeholders, is_active,
                      created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(content)
        .bind(serde_json::to_value(placeholders).unwrap_or(JsonValue::Null))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.into())
    }
}
