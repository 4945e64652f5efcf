// Agent instance DTOs (named worker slots pinned to a template version)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Instance lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Offline,
    Starting,
    Idle,
    Busy,
    Error,
    Stopping,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Offline => "OFFLINE",
            InstanceStatus::Starting => "STARTING",
            InstanceStatus::Idle => "IDLE",
            InstanceStatus::Busy => "BUSY",
            InstanceStatus::Error => "ERROR",
            InstanceStatus::Stopping => "STOPPING",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for InstanceStatus {
    fn from(s: &str) -> Self {
        match s {
            "STARTING" => InstanceStatus::Starting,
            "IDLE" => InstanceStatus::Idle,
            "BUSY" => InstanceStatus::Busy,
            "ERROR" => InstanceStatus::Error,
            "STOPPING" => InstanceStatus::Stopping,
            _ => InstanceStatus::Offline,
        }
    }
}

/// Named worker slot bound to a template version
///
/// `current_session_id` is non-null exactly when `status` is `Busy`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AgentInstance {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub template_id: Uuid,
    pub template_version_id: Uuid,
    pub status: InstanceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_session_id: Option<Uuid>,
    pub is_enabled: bool,
    pub auto_start: bool,
    pub priority: i32,
    pub total_sessions: i64,
    pub total_messages: i64,
    pub total_tool_calls: i64,
    pub error_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
