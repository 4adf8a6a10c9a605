//! Core run types for the agent loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::types::{Attachment, Usage};

/// Loop state machine positions.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LoopState {
    /// No run has started yet.
    #[default]
    Idle,
    AwaitingModel,
    ToolCallPending,
    PermissionPending,
    ToolExecuting,
    Complete,
    Error,
    Aborted,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Aborted)
    }
}

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Aborted,
}

/// Drained outcome of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunResult {
    pub status: RunStatus,
    /// Concatenated assistant text across all model turns.
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub usage: Usage,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    pub fn completed(text: impl Into<String>, attachments: Vec<Attachment>) -> Self {
        Self {
            status: RunStatus::Completed,
            text: text.into(),
            error: None,
            attachments,
            usage: Usage::default(),
            finished_at: Utc::now(),
        }
    }

    pub fn aborted(text: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Aborted,
            text: text.into(),
            error: None,
            attachments: Vec::new(),
            usage: Usage::default(),
            finished_at: Utc::now(),
        }
    }

    pub fn failed(text: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            text: text.into(),
            error: Some(error.into()),
            attachments: Vec::new(),
            usage: Usage::default(),
            finished_at: Utc::now(),
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }
}
