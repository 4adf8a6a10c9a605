//! Session-facing entry point that owns backend selection.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent_loop::{LoopState, PermissionGate, RunResult};
use crate::error::{AgentError, Result};
use crate::protocol::WireProtocol;
use crate::types::{ApprovalMode, Attachment, ConversationSession, Message, StreamEvent};

use super::factory::{BackendFactory, BackendSpec};
use super::LoopBackend;

type Memo = Option<(BackendSpec, Arc<dyn LoopBackend>)>;
type LiveRuns = Arc<Mutex<Vec<(u64, CancellationToken)>>>;

/// Drops a run's token from the live set when its stream goes away.
struct LiveRun {
    id: u64,
    runs: LiveRuns,
}

impl Drop for LiveRun {
    fn drop(&mut self) {
        lock(&self.runs).retain(|(id, _)| *id != self.id);
    }
}

/// Routes runs for one session to a memoized backend.
///
/// The backend is rebuilt whenever the protocol or approval mode changes.
/// The session itself lives here, so a rebuilt backend still sees the
/// transcript and continuation token of the previous one.
pub struct RunnerDispatcher {
    session_id: String,
    session: Arc<tokio::sync::Mutex<ConversationSession>>,
    factory: Arc<dyn BackendFactory>,
    gate: Arc<PermissionGate>,
    spec: Mutex<BackendSpec>,
    backend: Mutex<Memo>,
    /// Tokens of every run whose stream is still alive, including runs
    /// queued behind the session lock.
    live: LiveRuns,
    next_run: AtomicU64,
    disposed: AtomicBool,
}

impl RunnerDispatcher {
    pub fn new(session: ConversationSession, factory: Arc<dyn BackendFactory>) -> Self {
        let spec = BackendSpec {
            protocol: session.protocol,
            approval_mode: session.approval_mode,
        };
        Self {
            session_id: session.id.clone(),
            session: Arc::new(tokio::sync::Mutex::new(session)),
            factory,
            gate: Arc::new(PermissionGate::new()),
            spec: Mutex::new(spec),
            backend: Mutex::new(None),
            live: Arc::new(Mutex::new(Vec::new())),
            next_run: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        }
    }

    /// Share a gate with the host, e.g. one built with a permission observer.
    pub fn with_gate(mut self, gate: Arc<PermissionGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn gate(&self) -> &Arc<PermissionGate> {
        &self.gate
    }

    pub fn protocol(&self) -> WireProtocol {
        lock(&self.spec).protocol
    }

    pub fn approval_mode(&self) -> ApprovalMode {
        lock(&self.spec).approval_mode
    }

    /// Position of the memoized backend's loop, or `Idle` when none is built.
    pub fn state(&self) -> LoopState {
        lock(&self.backend)
            .as_ref()
            .map(|(_, backend)| backend.state())
            .unwrap_or_default()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Start a run and stream its events.
    ///
    /// `signal` is the caller's abort handle; the run also stops on
    /// [`abort`](Self::abort). Failures to build a backend surface as a single
    /// `Error` event.
    pub fn stream_run(
        &self,
        message: impl Into<String>,
        history: Vec<Message>,
        signal: Option<&CancellationToken>,
    ) -> BoxStream<'static, StreamEvent> {
        match self.start(message.into(), history, signal) {
            Ok((_, events)) => events,
            Err(err) => stream::iter([StreamEvent::error(err.to_string())]).boxed(),
        }
    }

    /// Drain a run into a [`RunResult`].
    pub async fn run(
        &self,
        message: impl Into<String>,
        history: Vec<Message>,
        signal: Option<&CancellationToken>,
    ) -> RunResult {
        let (backend, mut events) = match self.start(message.into(), history, signal) {
            Ok(started) => started,
            Err(err) => return RunResult::failed("", err.to_string()),
        };

        let mut text = String::new();
        let mut outcome: Option<std::result::Result<Vec<Attachment>, Option<String>>> = None;
        while let Some(event) = events.next().await {
            match event {
                StreamEvent::TextDelta { content } => text.push_str(&content),
                StreamEvent::Complete { attachments } => outcome = Some(Ok(attachments)),
                StreamEvent::Error { message } => outcome = Some(Err(Some(message))),
                StreamEvent::Aborted => outcome = Some(Err(None)),
                _ => {}
            }
        }

        let result = match outcome {
            Some(Ok(attachments)) => RunResult::completed(text, attachments),
            Some(Err(Some(message))) => RunResult::failed(text, message),
            Some(Err(None)) => RunResult::aborted(text),
            None => RunResult::failed(text, "run ended without a terminal event"),
        };
        result.with_usage(backend.last_usage())
    }

    /// Cancel the run holding the session and any run queued behind it.
    /// Returns `false` when there was nothing left to cancel.
    pub fn abort(&self) -> bool {
        let live = lock(&self.live);
        let mut cancelled = 0;
        for (_, token) in live.iter().filter(|(_, token)| !token.is_cancelled()) {
            token.cancel();
            cancelled += 1;
        }
        if cancelled > 0 {
            debug!(session_id = %self.session_id, runs = cancelled, "run abort requested");
        }
        cancelled > 0
    }

    /// Number of runs whose event streams are still alive.
    pub fn live_runs(&self) -> usize {
        lock(&self.live).len()
    }

    /// Answer a pending permission request. Unknown ids are ignored.
    pub fn respond_to_permission(
        &self,
        request_id: &str,
        approved: bool,
        updated_input: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> bool {
        self.gate.respond(request_id, approved, updated_input)
    }

    /// Change the approval mode for later runs.
    ///
    /// Waits for an in-flight run to release the session.
    pub async fn set_approval_mode(&self, mode: ApprovalMode) {
        self.session.lock().await.approval_mode = mode;
        self.update_spec(|spec| spec.approval_mode = mode);
    }

    /// Switch wire protocol for later runs. The transcript is kept.
    pub async fn set_protocol(&self, protocol: WireProtocol) {
        self.session.lock().await.protocol = protocol;
        self.update_spec(|spec| spec.protocol = protocol);
    }

    /// Snapshot of the session for persistence.
    pub async fn session(&self) -> ConversationSession {
        self.session.lock().await.clone()
    }

    /// Abort any run, drop pending permission requests and the backend.
    /// Later runs fail immediately.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.abort();
        self.gate.cancel_all();
        lock(&self.backend).take();
        info!(session_id = %self.session_id, "dispatcher disposed");
    }

    fn start(
        &self,
        message: String,
        history: Vec<Message>,
        signal: Option<&CancellationToken>,
    ) -> Result<(Arc<dyn LoopBackend>, BoxStream<'static, StreamEvent>)> {
        if self.is_disposed() {
            return Err(AgentError::InvalidState(format!(
                "dispatcher for session {} has been disposed",
                self.session_id
            )));
        }
        let backend = self.backend()?;
        let token = signal.map(CancellationToken::child_token).unwrap_or_default();
        let run = LiveRun {
            id: self.next_run.fetch_add(1, Ordering::SeqCst),
            runs: self.live.clone(),
        };
        lock(&self.live).push((run.id, token.clone()));
        if self.is_disposed() {
            token.cancel();
        }

        let mut inner = backend.stream_run(message, history, token);
        let events: BoxStream<'static, StreamEvent> = Box::pin(async_stream::stream! {
            let _run = run;
            while let Some(event) = inner.next().await {
                yield event;
            }
        });
        Ok((backend, events))
    }

    fn backend(&self) -> Result<Arc<dyn LoopBackend>> {
        let spec = *lock(&self.spec);
        let mut memo = lock(&self.backend);
        if let Some((built_for, backend)) = memo.as_ref() {
            if *built_for == spec {
                return Ok(backend.clone());
            }
        }

        debug!(
            session_id = %self.session_id,
            protocol = %spec.protocol,
            approval_mode = %spec.approval_mode,
            "building loop backend"
        );
        let backend = self
            .factory
            .create(&spec, self.session.clone(), self.gate.clone())
            .map_err(|err| {
                warn!(session_id = %self.session_id, error = %err, "backend creation failed");
                err
            })?;
        *memo = Some((spec, backend.clone()));
        Ok(backend)
    }

    fn update_spec(&self, apply: impl FnOnce(&mut BackendSpec)) {
        let mut spec = lock(&self.spec);
        let before = *spec;
        apply(&mut spec);
        if *spec != before {
            lock(&self.backend).take();
            debug!(session_id = %self.session_id, "backend invalidated by settings change");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
