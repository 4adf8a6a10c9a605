//! Error types for convoy.

pub mod unified;

pub use unified::{ErrorCategory, RecoverySuggestion};

use thiserror::Error;

/// Primary error type for all convoy operations.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    /// A request could not be encoded for the wire; raised before any network call.
    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Tool execution error: {tool_name}: {message}")]
    ToolExecution { tool_name: String, message: String },

    #[error("Permission denied for tool '{tool_name}'")]
    PermissionDenied { tool_name: String },

    #[error("Iteration limit exceeded ({limit} model calls)")]
    IterationLimitExceeded { limit: usize },

    #[error("Aborted by caller")]
    Aborted,

    /// The wrapped error is the last attempt's error, untouched.
    #[error("{source} (after {attempts} attempts)")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<AgentError>,
    },

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl AgentError {
    /// Create an API error.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Create a tool execution error.
    pub fn tool(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    /// The underlying error with any retry annotation removed.
    pub fn root(&self) -> &AgentError {
        match self {
            Self::RetriesExhausted { source, .. } => source.root(),
            other => other,
        }
    }

    /// Number of attempts recorded on this error (1 when it was not retried).
    pub fn attempts(&self) -> u32 {
        match self {
            Self::RetriesExhausted { attempts, .. } => *attempts,
            _ => 1,
        }
    }

    /// Classify this error into a category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Network(err) => {
                if err.is_builder() {
                    ErrorCategory::FatalProtocol
                } else {
                    ErrorCategory::TransientNetwork
                }
            }
            Self::Timeout(_) => ErrorCategory::TransientNetwork,
            Self::Api { status, .. } => match status {
                500..=599 => ErrorCategory::TransientNetwork,
                _ => ErrorCategory::FatalProtocol,
            },
            Self::Io(err) => match err.kind() {
                std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::BrokenPipe => ErrorCategory::TransientNetwork,
                _ => ErrorCategory::FatalProtocol,
            },
            Self::Serialization(_) | Self::Encode(_) | Self::Stream(_) => {
                ErrorCategory::FatalProtocol
            }
            Self::ToolExecution { .. } => ErrorCategory::ToolExecution,
            Self::PermissionDenied { .. } => ErrorCategory::PermissionDenied,
            Self::IterationLimitExceeded { .. } => ErrorCategory::IterationLimit,
            Self::Aborted => ErrorCategory::Aborted,
            Self::RetriesExhausted { source, .. } => source.category(),
            Self::Configuration(_) | Self::InvalidState(_) => ErrorCategory::Configuration,
        }
    }

    /// Whether another attempt of the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::TransientNetwork)
    }

    /// Suggest recovery actions.
    pub fn recovery_suggestion(&self) -> RecoverySuggestion {
        match self.root() {
            Self::Api {
                status: 401 | 403, ..
            } => RecoverySuggestion::CheckCredentials,
            Self::Timeout(_) => RecoverySuggestion::IncreaseTimeout,
            _ => match self.category() {
                ErrorCategory::TransientNetwork => RecoverySuggestion::RetryWithBackoff,
                ErrorCategory::Configuration => RecoverySuggestion::CheckConfiguration,
                ErrorCategory::ToolExecution => RecoverySuggestion::CheckToolImplementation,
                ErrorCategory::IterationLimit => RecoverySuggestion::RaiseIterationLimit,
                _ => RecoverySuggestion::None,
            },
        }
    }
}

impl From<toml::de::Error> for AgentError {
    fn from(err: toml::de::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, AgentError>;
