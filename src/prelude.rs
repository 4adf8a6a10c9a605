//! Convenience re-exports for common use.

pub use crate::agent_loop::{
    ConversationLoopController, LoopOptions, LoopState, PermissionGate, PermissionTimeoutPolicy,
    RunResult, RunStatus,
};
pub use crate::config::AgentConfig;
pub use crate::error::{AgentError, Result};
pub use crate::protocol::{WireProtocol, WireProtocolAdapter};
pub use crate::runner::{BackendFactory, LoopBackend, ProtocolBackendFactory, RunnerDispatcher};
pub use crate::tools::{AgentTool, Danger, Tool, ToolArguments, ToolParameters, ToolRegistry, ToolSet};
pub use crate::transport::{HttpTransport, ModelTransport};
pub use crate::types::{
    ApprovalMode, ConversationSession, Message, Role, StreamEvent, ToolCallRequest, ToolResult,
    Usage,
};
