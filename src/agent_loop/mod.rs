//! The conversation loop: state machine, permission gate, observers.

pub mod controller;
pub mod events;
pub mod options;
pub mod permission;
pub mod types;

pub use controller::ConversationLoopController;
pub use events::{observer_fn, FnLoopObserver, LoopObserver};
pub use options::LoopOptions;
pub use permission::{
    PendingPermission, PermissionDecision, PermissionGate, PermissionObserver, PermissionOutcome,
    PermissionRequest, PermissionTimeoutPolicy,
};
pub use types::{LoopState, RunResult, RunStatus};
