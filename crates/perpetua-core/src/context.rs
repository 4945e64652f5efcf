// Session context snapshot
//
// Everything session-scoped the loop needs to resume lives here, not on the
// worker: the snapshot column is the only state that survives a restart.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, RuntimeError};

/// Per-tool call accounting used for quota and cooldown enforcement
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolCallStats {
    pub count: i32,
    #[serde(default)]
    pub last_call_at: Option<DateTime<Utc>>,
}

/// Condensed output of the last reasoning phase
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReasoningSummary {
    #[serde(default)]
    pub current_situation: String,
    #[serde(default)]
    pub remaining_steps: Vec<String>,
    #[serde(default)]
    pub enough_data: bool,
    #[serde(default)]
    pub task_completed: bool,
}

/// Source accumulated during research (search hits, extracted pages)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceRef {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Durable per-session execution context
///
/// Serialized into the session row's `context` column after every step.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionContext {
    #[serde(default)]
    pub iteration: i32,
    #[serde(default)]
    pub searches_used: i32,
    #[serde(default)]
    pub clarifications_used: i32,
    #[serde(default)]
    pub tool_calls: HashMap<String, ToolCallStats>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub last_reasoning: Option<ReasoningSummary>,
    #[serde(default)]
    pub sources: Vec<SourceRef>,
    #[serde(default)]
    pub execution_result: Option<String>,
    #[serde(default)]
    pub clarification_requested: bool,
    #[serde(default)]
    pub pending_clarification: Vec<String>,
    #[serde(default)]
    pub search_all_chats: bool,
}

impl SessionContext {
    pub fn from_value(value: &Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone())
            .map_err(|e| RuntimeError::config(format!("invalid context snapshot: {e}")))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Stats for a tool, keyed case-insensitively
    pub fn stats_for(&self, tool_name: &str) -> ToolCallStats {
        self.tool_calls
            .get(&tool_name.to_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    /// Count one invocation of a tool at `at`
    pub fn record_tool_call(&mut self, tool_name: &str, at: DateTime<Utc>) {
        let stats = self.tool_calls.entry(tool_name.to_lowercase()).or_default();
        stats.count += 1;
        stats.last_call_at = Some(at);
    }

    /// Retrieval query for tool selection: task text + last remaining step + stage
    pub fn retrieval_query(&self, task: &str) -> String {
        let mut query = task.to_string();
        if let Some(reasoning) = &self.last_reasoning {
            if let Some(next) = reasoning.remaining_steps.first() {
                query.push(' ');
                query.push_str(next);
            }
        }
        if let Some(stage) = &self.stage {
            query.push(' ');
            query.push_str(stage);
        }
        query
    }

    pub fn add_source(&mut self, uri: impl Into<String>, title: Option<String>) {
        let uri = uri.into();
        if !self.sources.iter().any(|s| s.uri == uri) {
            self.sources.push(SourceRef { uri, title });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_value_decodes_to_default() {
        let ctx = SessionContext::from_value(&Value::Null).unwrap();
        assert_eq!(ctx.iteration, 0);
        assert!(ctx.tool_calls.is_empty());
    }

    #[test]
    fn round_trips_through_value() {
        let mut ctx = SessionContext::default();
        ctx.iteration = 3;
        ctx.record_tool_call("WebSearchTool", Utc::now());
        ctx.add_source("https://example.com", Some("Example".into()));
        let decoded = SessionContext::from_value(&ctx.to_value()).unwrap();
        assert_eq!(decoded, ctx);
    }

    #[test]
    fn stats_are_case_insensitive() {
        let mut ctx = SessionContext::default();
        ctx.record_tool_call("WebSearchTool", Utc::now());
        assert_eq!(ctx.stats_for("websearchtool").count, 1);
        assert_eq!(ctx.stats_for("WEBSEARCHTOOL").count, 1);
    }

    #[test]
    fn retrieval_query_includes_remaining_step_and_stage() {
        let mut ctx = SessionContext::default();
        ctx.last_reasoning = Some(ReasoningSummary {
            remaining_steps: vec!["compare sources".into()],
            ..Default::default()
        });
        ctx.stage = Some("finalization".into());
        let query = ctx.retrieval_query("quantum computing");
        assert!(query.contains("quantum computing"));
        assert!(query.contains("compare sources"));
        assert!(query.contains("finalization"));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let value = json!({"iteration": 2, "unknown_field": true});
        let ctx = SessionContext::from_value(&value).unwrap();
        assert_eq!(ctx.iteration, 2);
    }
}
