//! Runner interfaces: backends, their factory, and the session-facing dispatcher.

pub mod dispatcher;
pub mod factory;

pub use dispatcher::RunnerDispatcher;
pub use factory::{BackendFactory, BackendSpec, ProtocolBackendFactory};

use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::agent_loop::LoopState;
use crate::protocol::WireProtocol;
use crate::types::{Message, StreamEvent, Usage};

/// A loop implementation bound to one wire protocol and one session.
pub trait LoopBackend: Send + Sync {
    fn protocol(&self) -> WireProtocol;

    /// Start a run. Nothing happens until the returned stream is polled.
    ///
    /// A non-empty `history` replaces the session transcript before `message`
    /// is appended. The stream ends after exactly one terminal event.
    fn stream_run(
        &self,
        message: String,
        history: Vec<Message>,
        abort: CancellationToken,
    ) -> BoxStream<'static, StreamEvent>;

    /// Current loop position.
    fn state(&self) -> LoopState;

    /// Token usage accumulated by the most recent run.
    fn last_usage(&self) -> Usage;
}
