// Perpetua runtime kernel
//
// The agent loop driver and its collaborators: template configuration, the
// rules engine, retrieval-based tool selection, the tool catalog with quota
// enforcement, the OpenAI-protocol LLM driver, and the per-session event
// stream. Persistence is behind the traits in `traits`; the storage crate
// provides the Postgres implementation.

pub mod config;
pub mod context;
pub mod driver;
pub mod embeddings;
pub mod error;
pub mod events;
pub mod llm;
pub mod memory;
pub mod openai;
pub mod prompts;
pub mod rules;
pub mod selector;
pub mod tools;
pub mod traits;

pub use config::{
    ExecutionPolicy, LlmPolicy, ReasoningStrategy, SelectionStrategy, TemplateRuntimeConfig,
    ToolPolicy, ToolQuota,
};
pub use context::SessionContext;
pub use driver::{AgentLoopDriver, LoopOutcome};
pub use error::{Result, RuntimeError};
pub use events::{EventReceiver, EventSender, StreamHub};
pub use llm::{LlmCallConfig, LlmDriver, ToolCallRequest, ToolChoice, ToolSchema};
pub use openai::OpenAiDriver;
pub use prompts::PromptsConfig;
pub use selector::ToolSelector;
pub use tools::builtin::{builtin_registry, BuiltinDeps};
pub use tools::{ToolCatalog, ToolRegistry};
pub use traits::{with_store_retry, SessionStore, TemplateStore, ToolStore};
