// Template runtime configuration
//
// Parses the immutable `settings` JSON of a template version into typed
// policy sections. Versions are pinned per instance, so a parsed config is
// valid for the lifetime of a worker.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use perpetua_contracts::{Template, TemplateVersion};

use crate::error::{Result, RuntimeError};
use crate::rules::Rule;

pub const DEFAULT_BASE_CLASS: &str = "perpetua.agents:ToolCallingAgent";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// How the reasoning phase of each step is performed
///
/// The loop skeleton is shared; only the first LLM call of a step differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningStrategy {
    /// No dedicated reasoning call
    Direct,
    /// Reasoning forced through a synthetic `ReasoningTool` call
    ForcedTool,
    /// Structured output against a per-step union schema of candidate tools
    StructuredUnion,
}

impl ReasoningStrategy {
    /// Derive the strategy from a `module.path:ClassName` base-class selector
    pub fn from_base_class(base_class: &str) -> Self {
        let class_name = base_class
            .rsplit(':')
            .next()
            .unwrap_or(base_class)
            .to_lowercase();
        if class_name.contains("sgr") {
            ReasoningStrategy::StructuredUnion
        } else if class_name.contains("flexible") {
            ReasoningStrategy::ForcedTool
        } else {
            ReasoningStrategy::Direct
        }
    }
}

/// LLM connection and sampling policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmPolicy {
    pub base_url: Option<String>,
    /// Environment variable name holding the API key
    pub api_key_ref: Option<String>,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub streaming: bool,
}

impl Default for LlmPolicy {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key_ref: None,
            model: DEFAULT_MODEL.to_string(),
            temperature: None,
            max_tokens: None,
            streaming: false,
        }
    }
}

/// Global execution limits for a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionPolicy {
    pub max_iterations: i32,
    pub time_budget_seconds: Option<u64>,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            max_iterations: 15,
            time_budget_seconds: None,
        }
    }
}

impl ExecutionPolicy {
    /// Resolve a named field for rule threshold references
    pub fn threshold_field(&self, name: &str) -> Option<i64> {
        match name {
            "max_iterations" => Some(self.max_iterations as i64),
            "time_budget_seconds" => self.time_budget_seconds.map(|v| v as i64),
            _ => None,
        }
    }
}

/// Per-tool execution limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolQuota {
    /// Max calls per session lifetime (None = unlimited)
    pub max_calls: Option<i32>,
    pub timeout_seconds: u64,
    pub cooldown_seconds: Option<f64>,
}

impl Default for ToolQuota {
    fn default() -> Self {
        Self {
            max_calls: None,
            timeout_seconds: 30,
            cooldown_seconds: None,
        }
    }
}

/// Tool selection strategy for a template version
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SelectionStrategy {
    #[default]
    Static,
    Retrieval,
}

/// Tool access policy and per-tool quotas
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPolicy {
    pub required_tools: Vec<String>,
    pub allowlist: Vec<String>,
    pub denylist: Vec<String>,
    pub max_tools_in_prompt: Option<usize>,
    pub selection_strategy: SelectionStrategy,
    pub quotas: HashMap<String, ToolQuota>,
}

impl ToolPolicy {
    /// Quota for a tool, falling back to the `_default` entry, then defaults
    pub fn quota_for(&self, tool_name: &str) -> ToolQuota {
        let lower = tool_name.to_lowercase();
        self.quotas
            .iter()
            .find(|(name, _)| name.to_lowercase() == lower)
            .map(|(_, quota)| quota.clone())
            .or_else(|| self.quotas.get("_default").cloned())
            .unwrap_or_default()
    }

    pub fn is_denied(&self, tool_name: &str) -> bool {
        let lower = tool_name.to_lowercase();
        self.denylist.iter().any(|n| n.to_lowercase() == lower)
    }
}

/// Per-template prompt overrides; None falls back to system-wide defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptOverrides {
    pub system: Option<String>,
    pub initial_user: Option<String>,
    pub clarification: Option<String>,
}

/// One configured MCP server (HTTP via `url`, stdio via `command`/`args`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McpServerConfig {
    pub url: Option<String>,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub timeout: u64,
    pub enabled: bool,
}

impl Default for McpServerConfig {
    fn default() -> Self {
        Self {
            url: None,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            timeout: 30,
            enabled: true,
        }
    }
}

/// MCP integration settings carried in template settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    #[serde(rename = "mcpServers")]
    pub mcp_servers: HashMap<String, McpServerConfig>,
    pub context_limit: u64,
    pub enabled: bool,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            mcp_servers: HashMap::new(),
            context_limit: 20_000,
            enabled: true,
        }
    }
}

impl McpConfig {
    pub fn enabled_servers(&self) -> impl Iterator<Item = (&String, &McpServerConfig)> {
        self.mcp_servers.iter().filter(|(_, s)| s.enabled)
    }
}

/// Raw shape of the settings JSON column
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VersionSettings {
    base_class: Option<String>,
    llm_policy: LlmPolicy,
    prompts: PromptOverrides,
    execution_policy: ExecutionPolicy,
    tool_policy: ToolPolicy,
    mcp: McpConfig,
    rules: Vec<Value>,
}

/// Complete runtime configuration for one template version
#[derive(Debug, Clone)]
pub struct TemplateRuntimeConfig {
    pub template_id: Uuid,
    pub template_name: String,
    pub version_id: Uuid,
    pub version: i32,
    pub base_class: String,
    pub llm_policy: LlmPolicy,
    pub prompts: PromptOverrides,
    pub execution_policy: ExecutionPolicy,
    pub tool_policy: ToolPolicy,
    pub mcp: McpConfig,
    /// Ordered tool names assigned to the version
    pub tools: Vec<String>,
    pub rules: Vec<Rule>,
}

impl TemplateRuntimeConfig {
    pub fn from_parts(template: &Template, version: &TemplateVersion) -> Result<Self> {
        let settings: VersionSettings = serde_json::from_value(version.settings.clone())
            .map_err(|e| {
                RuntimeError::config(format!(
                    "template {} v{} has invalid settings: {e}",
                    template.name, version.version
                ))
            })?;

        // Malformed rule entries are skipped, not fatal
        let rules = settings
            .rules
            .iter()
            .filter_map(|raw| serde_json::from_value::<Rule>(raw.clone()).ok())
            .collect();

        Ok(Self {
            template_id: template.id,
            template_name: template.name.clone(),
            version_id: version.id,
            version: version.version,
            base_class: settings
                .base_class
                .unwrap_or_else(|| DEFAULT_BASE_CLASS.to_string()),
            llm_policy: settings.llm_policy,
            prompts: settings.prompts,
            execution_policy: settings.execution_policy,
            tool_policy: settings.tool_policy,
            mcp: settings.mcp,
            tools: version.tools.clone(),
            rules,
        })
    }

    pub fn reasoning_strategy(&self) -> ReasoningStrategy {
        ReasoningStrategy::from_base_class(&self.base_class)
    }

    pub fn quota_for(&self, tool_name: &str) -> ToolQuota {
        self.tool_policy.quota_for(tool_name)
    }

    /// Resolve the API key for this template's LLM policy
    pub fn resolve_api_key(&self) -> Option<String> {
        let var = self.llm_policy.api_key_ref.as_deref().unwrap_or("OPENAI_API_KEY");
        std::env::var(var).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn template() -> Template {
        Template {
            id: Uuid::new_v4(),
            name: "sgr-research-agent".into(),
            description: None,
            active_version_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn version(settings: Value) -> TemplateVersion {
        TemplateVersion {
            id: Uuid::new_v4(),
            template_id: Uuid::new_v4(),
            version: 1,
            settings,
            tools: vec!["WebSearchTool".into(), "FinalAnswerTool".into()],
            embedding: None,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn parses_full_settings() {
        let settings = json!({
            "base_class": "perpetua.agents:SGRToolCallingAgent",
            "llm_policy": {"model": "gpt-4o", "temperature": 0.2, "streaming": true},
            "execution_policy": {"max_iterations": 20, "time_budget_seconds": 600},
            "tool_policy": {
                "required_tools": ["ReasoningTool", "FinalAnswerTool"],
                "max_tools_in_prompt": 6,
                "selection_strategy": "retrieval",
                "quotas": {"WebSearchTool": {"max_calls": 3, "timeout_seconds": 20}}
            },
            "rules": [
                {"when": {"iteration_gte": "max_iterations"},
                 "actions": {"keep_only": ["FinalAnswerTool"]}},
                "not-a-rule"
            ]
        });
        let config = TemplateRuntimeConfig::from_parts(&template(), &version(settings)).unwrap();
        assert_eq!(config.reasoning_strategy(), ReasoningStrategy::StructuredUnion);
        assert_eq!(config.llm_policy.model, "gpt-4o");
        assert_eq!(config.execution_policy.max_iterations, 20);
        assert_eq!(config.quota_for("websearchtool").max_calls, Some(3));
        assert_eq!(config.rules.len(), 1);
    }

    #[test]
    fn empty_settings_fall_back_to_defaults() {
        let config = TemplateRuntimeConfig::from_parts(&template(), &version(json!({}))).unwrap();
        assert_eq!(config.llm_policy.model, DEFAULT_MODEL);
        assert_eq!(config.execution_policy.max_iterations, 15);
        assert_eq!(config.reasoning_strategy(), ReasoningStrategy::Direct);
        assert_eq!(config.quota_for("anything").timeout_seconds, 30);
    }

    #[test]
    fn strategy_from_base_class() {
        assert_eq!(
            ReasoningStrategy::from_base_class("perpetua.agents:SimpleAgent"),
            ReasoningStrategy::Direct
        );
        assert_eq!(
            ReasoningStrategy::from_base_class("perpetua.agents:FlexibleToolCallingAgent"),
            ReasoningStrategy::ForcedTool
        );
        assert_eq!(
            ReasoningStrategy::from_base_class("perpetua.agents:SGRToolCallingAgent"),
            ReasoningStrategy::StructuredUnion
        );
    }

    #[test]
    fn default_quota_entry_applies() {
        let mut policy = ToolPolicy::default();
        policy.quotas.insert(
            "_default".into(),
            ToolQuota {
                max_calls: Some(5),
                ..Default::default()
            },
        );
        assert_eq!(policy.quota_for("UnknownTool").max_calls, Some(5));
    }
}
