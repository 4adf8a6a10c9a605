//! Streaming types.

use serde::{Deserialize, Serialize};

/// A uniform event produced by a run, independent of the wire protocol.
///
/// Every run ends with exactly one of [`StreamEvent::Complete`],
/// [`StreamEvent::Error`] or [`StreamEvent::Aborted`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    TextDelta {
        content: String,
    },
    ToolCallComplete {
        id: String,
        name: String,
        arguments_json: String,
    },
    PermissionRequested {
        request_id: String,
        tool_name: String,
        tool_input: serde_json::Value,
        dangerous: bool,
        reason: String,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
        is_error: bool,
    },
    /// A non-fatal repair or anomaly worth surfacing to operators.
    Diagnostic {
        kind: DiagnosticKind,
        message: String,
    },
    Error {
        message: String,
    },
    Complete {
        #[serde(default)]
        attachments: Vec<Attachment>,
    },
    Aborted,
}

impl StreamEvent {
    /// Whether this event ends a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete { .. } | Self::Error { .. } | Self::Aborted
        )
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::TextDelta {
            content: content.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Kind of a [`StreamEvent::Diagnostic`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// A tool result had no preceding tool-use block; a placeholder was synthesized.
    SyntheticToolUse,
    /// A tool-call buffer ended without a tool name and was dropped.
    DroppedToolCall,
}

/// A file or artifact produced during a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub uri: String,
}
