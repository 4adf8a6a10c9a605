//! Tool registry consumed by the agent loop.

use std::sync::Arc;

use async_trait::async_trait;

use super::arguments::{check_required, ToolArguments};
use super::tool::Tool;
use super::types::{Danger, ToolOutput};
use crate::error::{AgentError, Result};
use crate::protocol::ToolDefinition;

/// What the loop needs from the host's tools.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    /// Definitions advertised to the model on every call.
    fn definitions(&self) -> Vec<ToolDefinition>;

    fn classify(&self, name: &str, args: &ToolArguments) -> Danger;

    /// Run a tool. Errors become error results for the model, not run failures.
    async fn execute(&self, name: &str, args: ToolArguments) -> Result<ToolOutput>;
}

/// A registry backed by [`Tool`] implementations.
#[derive(Default, Clone)]
pub struct ToolSet {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add a tool. A tool with the same name replaces the earlier one.
    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(Arc::new(tool));
        self
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.tools.iter().map(|t| t.name()))
            .finish()
    }
}

#[async_trait]
impl ToolRegistry for ToolSet {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters().schema.clone(),
            })
            .collect()
    }

    fn classify(&self, name: &str, args: &ToolArguments) -> Danger {
        self.get(name).map_or(Danger::Safe, |t| t.classify(args))
    }

    async fn execute(&self, name: &str, args: ToolArguments) -> Result<ToolOutput> {
        let tool = self
            .get(name)
            .ok_or_else(|| AgentError::tool(name, "unknown tool"))?;
        check_required(name, &args, tool.parameters())?;
        tool.execute(&args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{AgentTool, ToolParameters};

    fn echo() -> AgentTool {
        AgentTool::new(
            "echo",
            "Echo text",
            ToolParameters::object().string("text", "text", true).build(),
            |args| async move { Ok(serde_json::Value::Object(args)) },
        )
    }

    #[tokio::test]
    async fn executes_registered_tool() {
        let set = ToolSet::new().with(echo());
        let mut args = ToolArguments::new();
        args.insert("text".into(), "hi".into());
        let out = set.execute("echo", args).await.unwrap();
        assert_eq!(out.content_string(), r#"{"text":"hi"}"#);
    }

    #[tokio::test]
    async fn unknown_tool_and_missing_args_are_tool_errors() {
        let set = ToolSet::new().with(echo());
        assert!(matches!(
            set.execute("nope", ToolArguments::new()).await,
            Err(AgentError::ToolExecution { .. })
        ));
        assert!(matches!(
            set.execute("echo", ToolArguments::new()).await,
            Err(AgentError::ToolExecution { .. })
        ));
    }

    #[test]
    fn classification_comes_from_tool() {
        let set = ToolSet::new()
            .with(echo())
            .with(echo_named("rm").dangerous("deletes files"));
        assert_eq!(set.classify("echo", &ToolArguments::new()), Danger::Safe);
        assert_eq!(
            set.classify("rm", &ToolArguments::new()),
            Danger::dangerous("deletes files")
        );
        assert_eq!(set.definitions().len(), 2);
    }

    fn echo_named(name: &str) -> AgentTool {
        AgentTool::new(name, "noop", ToolParameters::empty(), |_args| async move {
            Ok(serde_json::Value::Null)
        })
    }
}
