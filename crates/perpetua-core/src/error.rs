// Error types for the runtime kernel

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors produced by the agent loop and its collaborators
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// LLM provider error (network, 5xx)
    #[error("LLM error: {0}")]
    Llm(String),

    /// LLM protocol violation (malformed tool_calls, schema refused)
    #[error("LLM protocol violation: {0}")]
    LlmInvariant(String),

    /// Persistent store error
    #[error("store error: {0}")]
    Store(String),

    /// Transient store error, eligible for retry
    #[error("transient store error: {0}")]
    TransientStore(String),

    /// Tool execution error
    #[error("tool execution error: {0}")]
    ToolExecution(String),

    /// Tool is not present in the catalog
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// Configuration error (template settings, env)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Session does not exist
    #[error("session not found: {0}")]
    SessionNotFound(Uuid),

    /// Compare-and-set conflict; caller must re-read
    #[error("stale session: {0}")]
    StaleSession(Uuid),

    /// Tool selection produced no usable tools
    #[error("no tools selectable for step")]
    EmptySelection,

    /// Internal error
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RuntimeError {
    pub fn llm(msg: impl Into<String>) -> Self {
        RuntimeError::Llm(msg.into())
    }

    pub fn llm_invariant(msg: impl Into<String>) -> Self {
        RuntimeError::LlmInvariant(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        RuntimeError::Store(msg.into())
    }

    pub fn transient_store(msg: impl Into<String>) -> Self {
        RuntimeError::TransientStore(msg.into())
    }

    pub fn tool(msg: impl Into<String>) -> Self {
        RuntimeError::ToolExecution(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        RuntimeError::Configuration(msg.into())
    }

    /// Whether a retry against the store may succeed
    pub fn is_transient_store(&self) -> bool {
        matches!(self, RuntimeError::TransientStore(_))
    }
}
