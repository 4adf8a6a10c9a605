//! Loop limits and timeouts.

use std::time::Duration;

use crate::config::AgentConfig;
use crate::types::ApprovalMode;
use crate::util::ResilientCallExecutor;

use super::permission::PermissionTimeoutPolicy;

const DEFAULT_MAX_ITERATIONS: usize = 50;
const DEFAULT_PERMISSION_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-loop settings, fixed when the loop is built.
#[derive(Debug, Clone)]
pub struct LoopOptions {
    /// Cap on model calls per run.
    pub max_iterations: usize,
    pub approval_mode: ApprovalMode,
    pub permission_timeout: Duration,
    pub permission_timeout_policy: PermissionTimeoutPolicy,
    /// Longest gap allowed between two raw chunks of one model stream.
    pub stream_idle_timeout: Duration,
    pub executor: ResilientCallExecutor,
}

impl Default for LoopOptions {
    fn default() -> Self {
        let executor = ResilientCallExecutor::default();
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            approval_mode: ApprovalMode::default(),
            permission_timeout: DEFAULT_PERMISSION_TIMEOUT,
            permission_timeout_policy: PermissionTimeoutPolicy::default(),
            stream_idle_timeout: executor.timeout,
            executor,
        }
    }
}

impl LoopOptions {
    pub fn from_config(config: &AgentConfig) -> Self {
        let settings = &config.agent_loop;
        Self {
            max_iterations: settings.max_iterations.max(1),
            approval_mode: ApprovalMode::default(),
            permission_timeout: Duration::from_millis(settings.permission_timeout_ms),
            permission_timeout_policy: settings.permission_timeout_policy,
            stream_idle_timeout: Duration::from_millis(settings.stream_idle_timeout_ms),
            executor: ResilientCallExecutor::from_settings(&config.retry),
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_approval_mode(mut self, mode: ApprovalMode) -> Self {
        self.approval_mode = mode;
        self
    }

    pub fn with_permission_timeout(
        mut self,
        timeout: Duration,
        policy: PermissionTimeoutPolicy,
    ) -> Self {
        self.permission_timeout = timeout;
        self.permission_timeout_policy = policy;
        self
    }

    pub fn with_stream_idle_timeout(mut self, timeout: Duration) -> Self {
        self.stream_idle_timeout = timeout;
        self
    }

    pub fn with_executor(mut self, executor: ResilientCallExecutor) -> Self {
        self.executor = executor;
        self
    }
}
