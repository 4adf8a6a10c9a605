//! Tool trait and closure-based tool wrapper.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use super::arguments::ToolArguments;
use super::types::{Danger, ToolOutput, ToolParameters};
use crate::error::Result;

/// Core tool trait. Implement to create custom tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (must match what the model calls).
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters(&self) -> &ToolParameters;

    /// Classify one concrete call. Tools are safe unless they say otherwise.
    fn classify(&self, _args: &ToolArguments) -> Danger {
        Danger::Safe
    }

    async fn execute(&self, args: &ToolArguments) -> Result<ToolOutput>;
}

type ToolHandler =
    dyn Fn(ToolArguments) -> Pin<Box<dyn Future<Output = Result<ToolOutput>> + Send>> + Send + Sync;

type Classifier = dyn Fn(&ToolArguments) -> Danger + Send + Sync;

/// Closure-based tool for quick tool creation.
pub struct AgentTool {
    name: String,
    description: String,
    parameters: ToolParameters,
    handler: Arc<ToolHandler>,
    classifier: Option<Arc<Classifier>>,
}

impl AgentTool {
    /// Create a tool from a closure.
    pub fn new<F, Fut, O>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: ToolParameters,
        handler: F,
    ) -> Self
    where
        F: Fn(ToolArguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
        O: Into<ToolOutput> + Send + 'static,
    {
        let handler: Arc<ToolHandler> = Arc::new(
            move |args: ToolArguments| -> Pin<Box<dyn Future<Output = Result<ToolOutput>> + Send>> {
                let fut = handler(args);
                Box::pin(async move { fut.await.map(Into::into) })
            },
        );
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            handler,
            classifier: None,
        }
    }

    /// Mark every call of this tool dangerous.
    pub fn dangerous(self, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        self.with_classifier(move |_| Danger::dangerous(reason.clone()))
    }

    /// Classify each call by its arguments.
    pub fn with_classifier<C>(mut self, classifier: C) -> Self
    where
        C: Fn(&ToolArguments) -> Danger + Send + Sync + 'static,
    {
        self.classifier = Some(Arc::new(classifier));
        self
    }
}

#[async_trait]
impl Tool for AgentTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> &ToolParameters {
        &self.parameters
    }

    fn classify(&self, args: &ToolArguments) -> Danger {
        self.classifier
            .as_ref()
            .map_or(Danger::Safe, |classify| classify(args))
    }

    async fn execute(&self, args: &ToolArguments) -> Result<ToolOutput> {
        (self.handler)(args.clone()).await
    }
}

impl std::fmt::Debug for AgentTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("classified", &self.classifier.is_some())
            .finish()
    }
}
