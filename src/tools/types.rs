//! Tool-related types: parameter schemas, danger classification, outputs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Attachment;

/// JSON Schema-based parameter definition for a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParameters {
    pub schema: Value,
}

impl ToolParameters {
    pub fn from_schema(schema: Value) -> Self {
        Self { schema }
    }

    /// A schema that accepts no arguments.
    pub fn empty() -> Self {
        Self::object().build()
    }

    pub fn object() -> ParameterBuilder {
        ParameterBuilder::default()
    }

    /// Names listed under `required`.
    pub fn required(&self) -> impl Iterator<Item = &str> {
        self.schema
            .get("required")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
    }
}

/// Builder for object parameter schemas.
#[derive(Debug, Default)]
pub struct ParameterBuilder {
    properties: serde_json::Map<String, Value>,
    required: Vec<String>,
}

impl ParameterBuilder {
    /// Add a property of any JSON type.
    pub fn property(
        mut self,
        name: impl Into<String>,
        json_type: &str,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        let name = name.into();
        self.properties.insert(
            name.clone(),
            serde_json::json!({ "type": json_type, "description": description.into() }),
        );
        if required {
            self.required.push(name);
        }
        self
    }

    pub fn string(self, name: impl Into<String>, description: impl Into<String>, required: bool) -> Self {
        self.property(name, "string", description, required)
    }

    pub fn integer(self, name: impl Into<String>, description: impl Into<String>, required: bool) -> Self {
        self.property(name, "integer", description, required)
    }

    pub fn boolean(self, name: impl Into<String>, description: impl Into<String>, required: bool) -> Self {
        self.property(name, "boolean", description, required)
    }

    pub fn build(self) -> ToolParameters {
        ToolParameters {
            schema: serde_json::json!({
                "type": "object",
                "properties": self.properties,
                "required": self.required,
            }),
        }
    }
}

/// Whether a specific call needs extra scrutiny.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Danger {
    #[default]
    Safe,
    Dangerous { reason: String },
}

impl Danger {
    pub fn dangerous(reason: impl Into<String>) -> Self {
        Self::Dangerous {
            reason: reason.into(),
        }
    }

    pub fn is_dangerous(&self) -> bool {
        matches!(self, Self::Dangerous { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Safe => None,
            Self::Dangerous { reason } => Some(reason),
        }
    }
}

/// Result of a successful tool execution.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ToolOutput {
    pub content: Value,
    pub attachments: Vec<Attachment>,
}

impl ToolOutput {
    pub fn new(content: impl Into<Value>) -> Self {
        Self {
            content: content.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Content as the string payload sent back to the model.
    pub fn content_string(&self) -> String {
        match &self.content {
            Value::Null => "null".to_string(),
            Value::Bool(v) => v.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            Value::Array(_) | Value::Object(_) => self.content.to_string(),
        }
    }
}

impl From<Value> for ToolOutput {
    fn from(content: Value) -> Self {
        Self::new(content)
    }
}
