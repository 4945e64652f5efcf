// Session DTOs (one multi-step conversation bound to a template version)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Session lifecycle state
///
/// Terminal states (`Completed`, `Failed`) are sticky: once reached, no
/// further transitions are accepted by the store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Inited,
    Researching,
    WaitingForClarification,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Inited => "INITED",
            SessionState::Researching => "RESEARCHING",
            SessionState::WaitingForClarification => "WAITING_FOR_CLARIFICATION",
            SessionState::Completed => "COMPLETED",
            SessionState::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for SessionState {
    fn from(s: &str) -> Self {
        match s {
            "RESEARCHING" => SessionState::Researching,
            "WAITING_FOR_CLARIFICATION" => SessionState::WaitingForClarification,
            "COMPLETED" => SessionState::Completed,
            "FAILED" => SessionState::Failed,
            _ => SessionState::Inited,
        }
    }
}

/// Session - one conversation processed by at most one instance at a time
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Session {
    pub id: Uuid,
    pub template_version_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub state: SessionState,
    /// Serialized context snapshot (iteration counters, stage, sources)
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
