// Shared DTOs for the Perpetua runtime
//
// These types cross crate boundaries: the storage layer maps rows into them,
// the core loop consumes them, and the API serializes them to clients.

pub mod common;
pub mod events;
pub mod instance;
pub mod message;
pub mod session;
pub mod template;
pub mod tool;

pub use common::ListResponse;
pub use events::*;
pub use instance::{AgentInstance, InstanceStatus};
pub use message::{
    ChatMessage, MessageRole, MessageType, NewSessionMessage, SessionMessage, ToolCallPayload,
    ToolFunctionPayload,
};
pub use session::{Session, SessionState};
pub use template::{SystemPrompt, Template, TemplateVersion};
pub use tool::{Tool, ToolCategory};
