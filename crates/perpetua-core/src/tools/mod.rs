// Tool subsystem: executor trait, registry, catalog, quota enforcement
//
// Design decisions:
// - Tools are trait objects registered once per process; per-tool state
//   belongs in the session context, not the tool.
// - The catalog joins registered executors with catalog rows; entrypoint
//   binding strings resolve to registrations, with a name-based fallback.
// - Internal errors are logged but not exposed to the LLM.

pub mod builtin;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use perpetua_contracts::{SessionState, Tool};

use crate::config::ToolQuota;
use crate::context::SessionContext;
use crate::error::{Result, RuntimeError};
use crate::llm::ToolSchema;
use crate::traits::ToolExecutionStatus;

/// Result of a tool execution
///
/// `ToolError` messages are safe to show to the LLM; `InternalError` details
/// are logged and replaced with a generic message.
#[derive(Debug)]
pub enum ToolExecutionResult {
    Success(Value),
    ToolError(String),
    InternalError(String),
}

impl ToolExecutionResult {
    pub fn success(value: impl Into<Value>) -> Self {
        ToolExecutionResult::Success(value.into())
    }

    pub fn tool_error(message: impl Into<String>) -> Self {
        ToolExecutionResult::ToolError(message.into())
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        ToolExecutionResult::InternalError(message.into())
    }
}

/// Shared execution context handed to tools
///
/// Cheap to clone; parallel tool calls within a step share the same session
/// context behind a lock, while `config` is per-call.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: Uuid,
    /// Resolved per-call tool configuration (`*_ref` keys env-substituted)
    pub config: Value,
    shared: Arc<Mutex<SessionContext>>,
    state_change: Arc<Mutex<Option<SessionState>>>,
}

impl ToolContext {
    pub fn new(session_id: Uuid, context: SessionContext) -> Self {
        Self {
            session_id,
            config: Value::Null,
            shared: Arc::new(Mutex::new(context)),
            state_change: Arc::new(Mutex::new(None)),
        }
    }

    fn with_config(&self, config: Value) -> Self {
        let mut clone = self.clone();
        clone.config = config;
        clone
    }

    /// Mutate the shared session context under the lock
    pub fn with_context<R>(&self, f: impl FnOnce(&mut SessionContext) -> R) -> R {
        let mut guard = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Current snapshot of the shared context
    pub fn snapshot(&self) -> SessionContext {
        self.shared.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Request a session state transition (FinalAnswer, Clarification)
    pub fn request_state(&self, state: SessionState) {
        let mut guard = self.state_change.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(state);
    }

    pub fn requested_state(&self) -> Option<SessionState> {
        *self.state_change.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// String config key, if present
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }
}

/// Executable tool exposed to the agent loop
#[async_trait]
pub trait AgentTool: Send + Sync {
    /// Canonical CamelCase name
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// JSON-Schema for the function-tool parameters
    fn parameters(&self) -> Value;

    async fn execute(&self, ctx: &ToolContext, args: Value) -> ToolExecutionResult;
}

/// Process-wide registry of executable tool bindings
pub struct ToolRegistry {
    by_name: HashMap<String, Arc<dyn AgentTool>>,
    by_binding: HashMap<String, String>,
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder {
            by_name: HashMap::new(),
            by_binding: HashMap::new(),
        }
    }

    /// Look up by case-insensitive name
    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentTool>> {
        self.by_name.get(&name.to_lowercase()).cloned()
    }

    /// Resolve a `module.path:ClassName` binding, falling back to the
    /// class name when the full binding is unknown
    pub fn resolve_binding(&self, entrypoint: &str) -> Option<Arc<dyn AgentTool>> {
        if let Some(name) = self.by_binding.get(entrypoint) {
            return self.by_name.get(name).cloned();
        }
        let class_name = entrypoint.rsplit(':').next()?;
        self.get(class_name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.by_name.values().map(|t| t.name()).collect()
    }
}

pub struct ToolRegistryBuilder {
    by_name: HashMap<String, Arc<dyn AgentTool>>,
    by_binding: HashMap<String, String>,
}

impl ToolRegistryBuilder {
    pub fn tool(self, tool: impl AgentTool + 'static) -> Self {
        let binding = format!("perpetua.tools:{}", tool.name());
        self.tool_with_binding(tool, binding)
    }

    pub fn tool_with_binding(mut self, tool: impl AgentTool + 'static, binding: impl Into<String>) -> Self {
        let name = tool.name().to_lowercase();
        self.by_binding.insert(binding.into(), name.clone());
        self.by_name.insert(name, Arc::new(tool));
        self
    }

    pub fn build(self) -> ToolRegistry {
        ToolRegistry {
            by_name: self.by_name,
            by_binding: self.by_binding,
        }
    }
}

/// Catalog row joined with its executable binding
#[derive(Clone)]
pub struct ResolvedTool {
    pub record: Tool,
    pub executor: Arc<dyn AgentTool>,
}

impl ResolvedTool {
    pub fn name(&self) -> &str {
        &self.record.name
    }

    /// Function-tool schema: catalog row overrides win over compiled-in ones
    pub fn schema(&self) -> ToolSchema {
        let description = self
            .record
            .description
            .clone()
            .unwrap_or_else(|| self.executor.description().to_string());
        let parameters = self
            .record
            .config
            .get("input_schema")
            .filter(|s| s.is_object())
            .cloned()
            .unwrap_or_else(|| self.executor.parameters());
        ToolSchema {
            name: self.record.name.clone(),
            description,
            parameters,
        }
    }
}

/// Versioned view of the tool catalog
///
/// `invalidate` bumps the generation; consumers observing a stale generation
/// re-load records from the store (bounded staleness, one polling interval).
pub struct ToolCatalog {
    registry: ToolRegistry,
    records: RwLock<Vec<Tool>>,
    generation: AtomicU64,
    loaded_generation: AtomicU64,
}

impl ToolCatalog {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry,
            records: RwLock::new(Vec::new()),
            generation: AtomicU64::new(1),
            loaded_generation: AtomicU64::new(0),
        }
    }

    /// Replace catalog rows (prewarm or post-invalidation reload)
    pub fn refresh(&self, records: Vec<Tool>) {
        let generation = self.generation.load(Ordering::Acquire);
        *self.records.write().unwrap_or_else(|e| e.into_inner()) = records;
        self.loaded_generation.store(generation, Ordering::Release);
    }

    /// Signal that catalog rows changed (admin update broadcast)
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn is_stale(&self) -> bool {
        self.loaded_generation.load(Ordering::Acquire) < self.generation.load(Ordering::Acquire)
    }

    pub fn active_records(&self) -> Vec<Tool> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|t| t.is_active)
            .cloned()
            .collect()
    }

    pub fn has(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|t| t.is_active && t.name.to_lowercase() == lower)
    }

    /// Resolve an active catalog row by name to its executor
    pub fn resolve(&self, name: &str) -> Result<ResolvedTool> {
        let lower = name.to_lowercase();
        let record = self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|t| t.is_active && t.name.to_lowercase() == lower)
            .cloned()
            .ok_or_else(|| RuntimeError::ToolNotFound(name.to_string()))?;
        self.resolve_record(&record)
    }

    pub fn resolve_record(&self, record: &Tool) -> Result<ResolvedTool> {
        let executor = match &record.entrypoint {
            Some(entrypoint) => self.registry.resolve_binding(entrypoint),
            None => self.registry.get(&record.name),
        }
        .ok_or_else(|| RuntimeError::ToolNotFound(record.name.clone()))?;
        Ok(ResolvedTool {
            record: record.clone(),
            executor,
        })
    }
}

/// Replace `*_ref` config keys with values from the environment
///
/// `{"api_key_ref": "TAVILY_API_KEY"}` becomes `{"api_key": "<env value>"}`.
pub fn resolve_config_refs(config: &Value) -> Value {
    let Some(object) = config.as_object() else {
        return config.clone();
    };
    let mut resolved = serde_json::Map::new();
    for (key, value) in object {
        match (key.strip_suffix("_ref"), value.as_str()) {
            (Some(base), Some(var)) => {
                resolved.insert(
                    base.to_string(),
                    Value::String(std::env::var(var).unwrap_or_default()),
                );
            }
            _ => {
                resolved.insert(key.clone(), value.clone());
            }
        }
    }
    Value::Object(resolved)
}

/// Outcome of one policy-enforced tool invocation
#[derive(Debug, Clone)]
pub struct ToolRunOutcome {
    pub result: Value,
    pub success: bool,
    pub status: ToolExecutionStatus,
    pub started_at: chrono::DateTime<Utc>,
    pub finished_at: chrono::DateTime<Utc>,
}

impl ToolRunOutcome {
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

/// Execute a tool under its quota: max_calls, cooldown, and timeout
///
/// Quota violations return a synthetic failed outcome without invoking the
/// tool; the deadline cancels the execution future.
pub async fn execute_tool(
    resolved: &ResolvedTool,
    ctx: &ToolContext,
    args: Value,
    quota: &ToolQuota,
) -> ToolRunOutcome {
    let started_at = Utc::now();
    let name = resolved.name().to_string();

    let refusal = ctx.with_context(|context| {
        let stats = context.stats_for(&name);
        if let Some(max_calls) = quota.max_calls {
            if stats.count >= max_calls {
                return Some("quota_exceeded");
            }
        }
        if let (Some(cooldown), Some(last)) = (quota.cooldown_seconds, stats.last_call_at) {
            let elapsed = (started_at - last).num_milliseconds() as f64 / 1000.0;
            if elapsed < cooldown {
                return Some("cooldown");
            }
        }
        context.record_tool_call(&name, started_at);
        None
    });

    if let Some(reason) = refusal {
        tracing::debug!(tool = %name, reason, "tool call refused by quota");
        return ToolRunOutcome {
            result: json!({"success": false, "error": reason}),
            success: false,
            status: ToolExecutionStatus::Error,
            started_at,
            finished_at: Utc::now(),
        };
    }

    let call_ctx = ctx.with_config(resolve_config_refs(&resolved.record.config));
    let deadline = Duration::from_secs(quota.timeout_seconds);
    let execution = resolved.executor.execute(&call_ctx, args);

    let (result, success, status) = match tokio::time::timeout(deadline, execution).await {
        Ok(ToolExecutionResult::Success(value)) => (value, true, ToolExecutionStatus::Ok),
        Ok(ToolExecutionResult::ToolError(message)) => (
            json!({"success": false, "error": message}),
            false,
            ToolExecutionStatus::Error,
        ),
        Ok(ToolExecutionResult::InternalError(detail)) => {
            tracing::error!(tool = %name, error = %detail, "internal tool error");
            (
                json!({"success": false, "error": "internal tool error"}),
                false,
                ToolExecutionStatus::Error,
            )
        }
        Err(_) => (
            json!({"success": false, "error": "timeout"}),
            false,
            ToolExecutionStatus::Timeout,
        ),
    };

    ToolRunOutcome {
        result,
        success,
        status,
        started_at,
        finished_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    struct SleepyTool;

    #[async_trait]
    impl AgentTool for SleepyTool {
        fn name(&self) -> &'static str {
            "SleepyTool"
        }
        fn description(&self) -> &'static str {
            "sleeps"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        async fn execute(&self, _ctx: &ToolContext, _args: Value) -> ToolExecutionResult {
            tokio::time::sleep(Duration::from_secs(5)).await;
            ToolExecutionResult::success(json!({"slept": true}))
        }
    }

    fn tool_record(name: &str) -> Tool {
        Tool {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            entrypoint: None,
            config: json!({}),
            embedding: None,
            category: perpetua_contracts::ToolCategory::Utility,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn catalog_with(tool: impl AgentTool + 'static, record: Tool) -> ToolCatalog {
        let registry = ToolRegistry::builder().tool(tool).build();
        let catalog = ToolCatalog::new(registry);
        catalog.refresh(vec![record]);
        catalog
    }

    #[tokio::test]
    async fn quota_refusal_skips_invocation() {
        let catalog = catalog_with(builtin::EchoTool, tool_record("EchoTool"));
        let resolved = catalog.resolve("echotool").unwrap();
        let ctx = ToolContext::new(Uuid::new_v4(), SessionContext::default());
        let quota = ToolQuota {
            max_calls: Some(1),
            ..Default::default()
        };

        let first = execute_tool(&resolved, &ctx, json!({"message": "hi"}), &quota).await;
        assert!(first.success);

        let second = execute_tool(&resolved, &ctx, json!({"message": "again"}), &quota).await;
        assert!(!second.success);
        assert_eq!(second.result["error"], "quota_exceeded");
        // The refused call is not counted
        assert_eq!(ctx.snapshot().stats_for("EchoTool").count, 1);
    }

    #[tokio::test]
    async fn cooldown_refuses_rapid_calls() {
        let catalog = catalog_with(builtin::EchoTool, tool_record("EchoTool"));
        let resolved = catalog.resolve("EchoTool").unwrap();
        let ctx = ToolContext::new(Uuid::new_v4(), SessionContext::default());
        let quota = ToolQuota {
            cooldown_seconds: Some(60.0),
            ..Default::default()
        };

        let first = execute_tool(&resolved, &ctx, json!({"message": "hi"}), &quota).await;
        assert!(first.success);
        let second = execute_tool(&resolved, &ctx, json!({"message": "hi"}), &quota).await;
        assert_eq!(second.result["error"], "cooldown");
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_produces_timeout_status() {
        let catalog = catalog_with(SleepyTool, tool_record("SleepyTool"));
        let resolved = catalog.resolve("SleepyTool").unwrap();
        let ctx = ToolContext::new(Uuid::new_v4(), SessionContext::default());
        let quota = ToolQuota {
            timeout_seconds: 1,
            ..Default::default()
        };

        let outcome = execute_tool(&resolved, &ctx, json!({}), &quota).await;
        assert_eq!(outcome.status, ToolExecutionStatus::Timeout);
        assert_eq!(outcome.result["error"], "timeout");
    }

    #[test]
    fn binding_resolution_falls_back_to_class_name() {
        let registry = ToolRegistry::builder()
            .tool_with_binding(builtin::EchoTool, "perpetua.tools.diagnostics:EchoTool")
            .build();
        assert!(registry.resolve_binding("perpetua.tools.diagnostics:EchoTool").is_some());
        assert!(registry.resolve_binding("some.moved.module:EchoTool").is_some());
        assert!(registry.resolve_binding("some.module:UnknownTool").is_none());
    }

    #[test]
    fn config_refs_resolve_from_env() {
        std::env::set_var("PERPETUA_TEST_KEY", "secret");
        let resolved = resolve_config_refs(&json!({
            "api_key_ref": "PERPETUA_TEST_KEY",
            "endpoint": "https://example.com"
        }));
        assert_eq!(resolved["api_key"], "secret");
        assert_eq!(resolved["endpoint"], "https://example.com");
        assert!(resolved.get("api_key_ref").is_none());
    }

    #[test]
    fn catalog_invalidation_marks_stale() {
        let catalog = catalog_with(builtin::EchoTool, tool_record("EchoTool"));
        assert!(!catalog.is_stale());
        catalog.invalidate();
        assert!(catalog.is_stale());
        catalog.refresh(vec![tool_record("EchoTool")]);
        assert!(!catalog.is_stale());
    }

    #[test]
    fn record_schema_overrides_win() {
        let mut record = tool_record("EchoTool");
        record.description = Some("catalog description".into());
        record.config = json!({"input_schema": {"type": "object", "properties": {"q": {"type": "string"}}}});
        let catalog = catalog_with(builtin::EchoTool, record);
        let schema = catalog.resolve("EchoTool").unwrap().schema();
        assert_eq!(schema.description, "catalog description");
        assert!(schema.parameters["properties"].get("q").is_some());
    }
}
