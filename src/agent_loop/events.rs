//! Loop observation hooks.

use std::sync::Arc;

use super::types::LoopState;

/// Receives state transitions of a loop.
///
/// Called inline on the task polling the run stream; implementations should
/// return quickly.
pub trait LoopObserver: Send + Sync {
    fn on_transition(&self, session_id: &str, from: LoopState, to: LoopState);
}

/// Closure-backed observer.
pub struct FnLoopObserver<F>(pub F);

impl<F> LoopObserver for FnLoopObserver<F>
where
    F: Fn(&str, LoopState, LoopState) + Send + Sync,
{
    fn on_transition(&self, session_id: &str, from: LoopState, to: LoopState) {
        (self.0)(session_id, from, to)
    }
}

/// Wrap a closure as a shared observer.
pub fn observer_fn<F>(f: F) -> Arc<dyn LoopObserver>
where
    F: Fn(&str, LoopState, LoopState) + Send + Sync + 'static,
{
    Arc::new(FnLoopObserver(f))
}
