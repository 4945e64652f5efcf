// Database row models (internal, mapped into public DTOs)

use chrono::{DateTime, Utc};
use sqlx::types::JsonValue;
use sqlx::FromRow;
use uuid::Uuid;

use perpetua_contracts::{
    AgentInstance, InstanceStatus, MessageRole, MessageType, Session, SessionMessage,
    SessionState, SystemPrompt, Template, TemplateVersion, Tool, ToolCategory,
};

fn json_to_vec_f32(value: Option<&JsonValue>) -> Option<Vec<f32>> {
    value.and_then(|v| serde_json::from_value(v.clone()).ok())
}

fn json_to_vec_string(value: &JsonValue) -> Vec<String> {
    serde_json::from_value(value.clone()).unwrap_or_default()
}

#[derive(Debug, Clone, FromRow)]
pub struct TemplateRow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub active_version_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<TemplateRow> for Template {
    fn from(row: TemplateRow) -> Self {
        Template {
            id: row.id,
            name: row.name,
            description: row.description,
            active_version_id: row.active_version_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct TemplateVersionRow {
    pub id: Uuid,
    pub template_id: Uuid,
    pub version: i32,
    pub settings: JsonValue,
    pub tools: JsonValue,
    pub embedding: Option<JsonValue>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<TemplateVersionRow> for TemplateVersion {
    fn from(row: TemplateVersionRow) -> Self {
        TemplateVersion {
            id: row.id,
            template_id: row.template_id,
            version: row.version,
            tools: json_to_vec_string(&row.tools),
            embedding: json_to_vec_f32(row.embedding.as_ref()),
            settings: row.settings,
            is_active: row.is_active,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ToolRow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub entrypoint: Option<String>,
    pub config: JsonValue,
    pub embedding: Option<JsonValue>,
    pub category: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ToolRow> for Tool {
    fn from(row: ToolRow) -> Self {
        Tool {
            id: row.id,
            name: row.name,
            description: row.description,
            entrypoint: row.entrypoint,
            embedding: json_to_vec_f32(row.embedding.as_ref()),
            config: row.config,
            category: ToolCategory::from(row.category.as_str()),
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct SessionRow {
    pub id: Uuid,
    pub template_version_id: Uuid,
    pub instance_id: Option<Uuid>,
    pub title: Option<String>,
    pub state: String,
    pub context: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        Session {
            id: row.id,
            template_version_id: row.template_version_id,
            instance_id: row.instance_id,
            title: row.title,
            state: SessionState::from(row.state.as_str()),
            context: row.context,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct SessionMessageRow {
    pub id: Uuid,
    pub session_id: Uuid,
    pub seq: i64,
    pub role: String,
    pub content: JsonValue,
    pub message_type: String,
    pub step_number: Option<i32>,
    pub step_data: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
}

impl From<SessionMessageRow> for SessionMessage {
    fn from(row: SessionMessageRow) -> Self {
        SessionMessage {
            id: row.id,
            session_id: row.session_id,
            seq: row.seq,
            role: MessageRole::from(row.role.as_str()),
            content: row.content,
            message_type: MessageType::from(row.message_type.as_str()),
            step_number: row.step_number,
            step_data: row.step_data,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct AgentInstanceRow {
    pub id: Uuid,
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub template_id: Uuid,
    pub template_version_id: Uuid,
    pub status: String,
    pub current_session_id: Option<Uuid>,
    pub is_enabled: bool,
    pub auto_start: bool,
    pub priority: i32,
    pub total_sessions: i64,
    pub total_messages: i64,
    pub total_tool_calls: i64,
    pub error_count: i64,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<AgentInstanceRow> for AgentInstance {
    fn from(row: AgentInstanceRow) -> Self {
        AgentInstance {
            id: row.id,
            name: row.name,
            display_name: row.display_name,
            description: row.description,
            template_id: row.template_id,
            template_version_id: row.template_version_id,
            status: InstanceStatus::from(row.status.as_str()),
            current_session_id: row.current_session_id,
            is_enabled: row.is_enabled,
            auto_start: row.auto_start,
            priority: row.priority,
            total_sessions: row.total_sessions,
            total_messages: row.total_messages,
            total_tool_calls: row.total_tool_calls,
            error_count: row.error_count,
            last_error: row.last_error,
            last_error_at: row.last_error_at,
            last_heartbeat: row.last_heartbeat,
            started_at: row.started_at,
            stopped_at: row.stopped_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ChatTurnRow {
    pub id: Uuid,
    pub session_id: Uuid,
    pub question: String,
    pub answer: String,
    pub model_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct SystemPromptRow {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub content: String,
    pub placeholders: JsonValue,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<SystemPromptRow> for SystemPrompt {
    fn from(row: SystemPromptRow) -> Self {
        SystemPrompt {
            id: row.id,
            name: row.name,
            description: row.description,
            content: row.content,
            placeholders: json_to_vec_string(&row.placeholders),
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
