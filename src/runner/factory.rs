//! Backend construction.

use std::sync::Arc;

use crate::agent_loop::{ConversationLoopController, LoopObserver, LoopOptions, PermissionGate};
use crate::config::AgentConfig;
use crate::error::Result;
use crate::protocol::{create_adapter, WireProtocol};
use crate::tools::ToolRegistry;
use crate::transport::{HttpTransport, ModelTransport};
use crate::types::{ApprovalMode, ConversationSession};

use super::LoopBackend;

/// Settings a backend is built for. A change to any of them needs a new backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendSpec {
    pub protocol: WireProtocol,
    pub approval_mode: ApprovalMode,
}

/// Builds loop backends for a session.
pub trait BackendFactory: Send + Sync {
    fn create(
        &self,
        spec: &BackendSpec,
        session: Arc<tokio::sync::Mutex<ConversationSession>>,
        gate: Arc<PermissionGate>,
    ) -> Result<Arc<dyn LoopBackend>>;
}

/// Default factory: the protocol's adapter over a shared transport.
pub struct ProtocolBackendFactory {
    config: AgentConfig,
    tools: Arc<dyn ToolRegistry>,
    transport: Arc<dyn ModelTransport>,
    observer: Option<Arc<dyn LoopObserver>>,
}

impl ProtocolBackendFactory {
    /// Factory over an [`HttpTransport`].
    pub fn new(config: AgentConfig, tools: Arc<dyn ToolRegistry>) -> Result<Self> {
        Ok(Self::with_transport(
            config,
            tools,
            Arc::new(HttpTransport::new()?),
        ))
    }

    pub fn with_transport(
        config: AgentConfig,
        tools: Arc<dyn ToolRegistry>,
        transport: Arc<dyn ModelTransport>,
    ) -> Self {
        Self {
            config,
            tools,
            transport,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn LoopObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }
}

impl BackendFactory for ProtocolBackendFactory {
    fn create(
        &self,
        spec: &BackendSpec,
        session: Arc<tokio::sync::Mutex<ConversationSession>>,
        gate: Arc<PermissionGate>,
    ) -> Result<Arc<dyn LoopBackend>> {
        let adapter = create_adapter(spec.protocol, &self.config)?;
        let options = LoopOptions::from_config(&self.config).with_approval_mode(spec.approval_mode);
        let mut controller =
            ConversationLoopController::new(session, adapter, self.transport.clone(), self.tools.clone())
                .with_options(options)
                .with_gate(gate);
        if let Some(observer) = &self.observer {
            controller = controller.with_observer(observer.clone());
        }
        Ok(Arc::new(controller))
    }
}
