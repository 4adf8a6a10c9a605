//! Tool system for function calling.

pub mod arguments;
pub mod registry;
pub mod tool;
pub mod types;

pub use arguments::{decode_arguments, ToolArguments};
pub use registry::{ToolRegistry, ToolSet};
pub use tool::{AgentTool, Tool};
pub use types::{Danger, ParameterBuilder, ToolOutput, ToolParameters};
