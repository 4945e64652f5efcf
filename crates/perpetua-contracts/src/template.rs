// Template and template version DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Named logical agent blueprint
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Template {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Currently active version; exactly one version per template is active
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_version_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable versioned agent configuration
///
/// `settings` holds the structured runtime configuration (base class selector,
/// LLM/execution/tool policies, prompts, rules, MCP config) and is parsed by
/// the core into a typed `TemplateRuntimeConfig`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TemplateVersion {
    pub id: Uuid,
    pub template_id: Uuid,
    pub version: i32,
    pub settings: serde_json::Value,
    /// Ordered tool names assigned to this version
    pub tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Process-wide default prompt, overridable per template version
///
/// Known ids: `system`, `initial_user`, `clarification`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SystemPrompt {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub content: String,
    pub placeholders: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
