// Tool catalog DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Tool category for catalog organization
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ToolCategory {
    Research,
    Memory,
    Utility,
}

impl ToolCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCategory::Research => "research",
            ToolCategory::Memory => "memory",
            ToolCategory::Utility => "utility",
        }
    }
}

impl From<&str> for ToolCategory {
    fn from(s: &str) -> Self {
        match s {
            "research" => ToolCategory::Research,
            "memory" => ToolCategory::Memory,
            _ => ToolCategory::Utility,
        }
    }
}

/// Catalog entry for an executable tool
///
/// Names are case-insensitive with CamelCase canonical form. The entrypoint
/// binding string (`module.path:ClassName`) resolves to a registered executor.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Tool {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
    pub config: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub category: ToolCategory,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
