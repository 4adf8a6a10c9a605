//! Out-of-band tool permission requests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::types::StreamEvent;

/// What an unanswered permission request resolves to.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PermissionTimeoutPolicy {
    #[default]
    Deny,
    Approve,
}

/// A permission request emitted by the loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PermissionRequest {
    pub request_id: String,
    pub tool_name: String,
    pub tool_input: serde_json::Value,
    pub dangerous: bool,
    pub reason: String,
}

impl PermissionRequest {
    pub fn to_event(&self) -> StreamEvent {
        StreamEvent::PermissionRequested {
            request_id: self.request_id.clone(),
            tool_name: self.tool_name.clone(),
            tool_input: self.tool_input.clone(),
            dangerous: self.dangerous,
            reason: self.reason.clone(),
        }
    }
}

/// A host's answer to a [`PermissionRequest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PermissionDecision {
    pub request_id: String,
    pub approved: bool,
    /// Replacement arguments for the call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<serde_json::Map<String, serde_json::Value>>,
}

/// How a wait on a request ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionOutcome {
    Approved {
        updated_input: Option<serde_json::Map<String, serde_json::Value>>,
        timed_out: bool,
    },
    Denied {
        timed_out: bool,
    },
    Aborted,
}

/// Notified whenever a request is registered.
pub type PermissionObserver = Arc<dyn Fn(&PermissionRequest) + Send + Sync>;

type PendingTable = Mutex<HashMap<String, oneshot::Sender<PermissionDecision>>>;

/// Receiving half of a registered request.
///
/// Dropping it unregisters the request, so a run that goes away mid-wait
/// leaves nothing behind in the gate.
#[derive(Debug)]
pub struct PendingPermission {
    request_id: String,
    rx: oneshot::Receiver<PermissionDecision>,
    table: Weak<PendingTable>,
}

impl PendingPermission {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Drop for PendingPermission {
    fn drop(&mut self) {
        self.rx.close();
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let mut table = lock(&table);
        // A newer request may have reused the id; only our closed sender goes.
        if table
            .get(&self.request_id)
            .is_some_and(oneshot::Sender::is_closed)
        {
            table.remove(&self.request_id);
            debug!(request_id = %self.request_id, "permission request abandoned");
        }
    }
}

/// Pending-request table shared between the loop and responders on other tasks.
#[derive(Default)]
pub struct PermissionGate {
    pending: Arc<PendingTable>,
    observer: Option<PermissionObserver>,
}

impl PermissionGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer(observer: PermissionObserver) -> Self {
        Self {
            pending: Arc::default(),
            observer: Some(observer),
        }
    }

    /// Register a request and notify the observer.
    pub fn emit_request(&self, request: &PermissionRequest) -> PendingPermission {
        let (tx, rx) = oneshot::channel();
        if self
            .table()
            .insert(request.request_id.clone(), tx)
            .is_some()
        {
            warn!(request_id = %request.request_id, "replaced pending permission request");
        }
        debug!(
            request_id = %request.request_id,
            tool = %request.tool_name,
            dangerous = request.dangerous,
            "permission requested"
        );
        if let Some(observer) = &self.observer {
            observer(request);
        }
        PendingPermission {
            request_id: request.request_id.clone(),
            rx,
            table: Arc::downgrade(&self.pending),
        }
    }

    /// Resolve a pending request. Unknown or already-resolved ids return `false`.
    pub fn respond(
        &self,
        request_id: &str,
        approved: bool,
        updated_input: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> bool {
        let Some(tx) = self.table().remove(request_id) else {
            debug!(request_id, "permission response for unknown request; ignoring");
            return false;
        };
        tx.send(PermissionDecision {
            request_id: request_id.to_string(),
            approved,
            updated_input,
        })
        .is_ok()
    }

    /// Wait for a decision, the timeout, or abort, whichever comes first.
    pub async fn wait(
        &self,
        mut pending: PendingPermission,
        timeout: Duration,
        policy: PermissionTimeoutPolicy,
        abort: &CancellationToken,
    ) -> PermissionOutcome {
        // Leaving this function drops `pending`, which unregisters the request.
        tokio::select! {
            biased;
            _ = abort.cancelled() => PermissionOutcome::Aborted,
            decision = &mut pending.rx => match decision {
                Ok(d) if d.approved => PermissionOutcome::Approved {
                    updated_input: d.updated_input,
                    timed_out: false,
                },
                Ok(_) => PermissionOutcome::Denied { timed_out: false },
                // Sender dropped by `cancel_all`.
                Err(_) => PermissionOutcome::Denied { timed_out: false },
            },
            _ = tokio::time::sleep(timeout) => {
                warn!(request_id = %pending.request_id, %policy, "permission request timed out");
                match policy {
                    PermissionTimeoutPolicy::Approve => PermissionOutcome::Approved {
                        updated_input: None,
                        timed_out: true,
                    },
                    PermissionTimeoutPolicy::Deny => PermissionOutcome::Denied { timed_out: true },
                }
            }
        }
    }

    /// Drop every pending request; their waiters resolve as denied.
    pub fn cancel_all(&self) {
        let dropped = std::mem::take(&mut *self.table());
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "cancelled pending permission requests");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.table().len()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<PermissionDecision>>> {
        lock(&self.pending)
    }
}

fn lock(table: &PendingTable) -> MutexGuard<'_, HashMap<String, oneshot::Sender<PermissionDecision>>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

impl std::fmt::Debug for PermissionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionGate")
            .field("pending", &self.pending_count())
            .field("observer", &self.observer.as_ref().map(|_| ".."))
            .finish()
    }
}
