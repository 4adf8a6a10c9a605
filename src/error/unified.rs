//! Error classification and recovery.

use serde::{Deserialize, Serialize};
use strum::Display;

/// Broad error category for routing retry and loop-termination logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCategory {
    /// Connection reset, timeout, DNS failure, HTTP 5xx. Retried.
    TransientNetwork,
    /// Malformed request, auth failure, any other 4xx. Never retried.
    FatalProtocol,
    /// A tool failed; fed back to the model as an error result.
    ToolExecution,
    PermissionDenied,
    IterationLimit,
    Aborted,
    Configuration,
}

/// Suggested recovery action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySuggestion {
    RetryWithBackoff,
    CheckCredentials,
    CheckConfiguration,
    IncreaseTimeout,
    CheckToolImplementation,
    RaiseIterationLimit,
    None,
}
