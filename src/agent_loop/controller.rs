//! The conversation loop state machine.
//!
//! A run is pull-based: work happens only while the caller polls the returned
//! stream. Each poll advances the machine by one phase step (open a model
//! call, read one chunk, gate or execute one tool call) and yields the events
//! that step produced.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::protocol::{ToolDefinition, WireProtocol, WireProtocolAdapter};
use crate::runner::LoopBackend;
use crate::stream::StreamDecoder;
use crate::tools::{decode_arguments, ToolArguments, ToolRegistry};
use crate::transport::{ModelTransport, RawEventStream};
use crate::types::{
    Attachment, ConversationSession, Message, StreamEvent, ToolCallRequest, ToolResult, Usage,
};
use crate::util::timeout::millis;

use super::events::LoopObserver;
use super::options::LoopOptions;
use super::permission::{PermissionGate, PermissionOutcome, PermissionRequest, PendingPermission};
use super::types::LoopState;

const ASK_MODE_REASON: &str = "approval mode 'ask' requires confirmation for every tool call";
const ABORTED_CALL: &str = "Tool call aborted before it produced a result";
const FAILED_CALL: &str = "Tool call abandoned: the run ended before it produced a result";

#[derive(Debug, Default)]
struct LoopStatus {
    state: LoopState,
    usage: Usage,
}

/// Drives one session through model turns and tool calls.
pub struct ConversationLoopController {
    session: Arc<tokio::sync::Mutex<ConversationSession>>,
    adapter: Arc<dyn WireProtocolAdapter>,
    transport: Arc<dyn ModelTransport>,
    tools: Arc<dyn ToolRegistry>,
    gate: Arc<PermissionGate>,
    options: LoopOptions,
    observer: Option<Arc<dyn LoopObserver>>,
    status: Arc<Mutex<LoopStatus>>,
}

impl ConversationLoopController {
    pub fn new(
        session: Arc<tokio::sync::Mutex<ConversationSession>>,
        adapter: Arc<dyn WireProtocolAdapter>,
        transport: Arc<dyn ModelTransport>,
        tools: Arc<dyn ToolRegistry>,
    ) -> Self {
        Self {
            session,
            adapter,
            transport,
            tools,
            gate: Arc::new(PermissionGate::new()),
            options: LoopOptions::default(),
            observer: None,
            status: Arc::new(Mutex::new(LoopStatus::default())),
        }
    }

    pub fn with_options(mut self, options: LoopOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_gate(mut self, gate: Arc<PermissionGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn LoopObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn gate(&self) -> &Arc<PermissionGate> {
        &self.gate
    }

    pub fn options(&self) -> &LoopOptions {
        &self.options
    }

    fn shared(&self) -> Arc<Shared> {
        Arc::new(Shared {
            adapter: self.adapter.clone(),
            transport: self.transport.clone(),
            tools: self.tools.clone(),
            gate: self.gate.clone(),
            options: self.options.clone(),
            observer: self.observer.clone(),
            status: self.status.clone(),
        })
    }
}

impl LoopBackend for ConversationLoopController {
    fn protocol(&self) -> WireProtocol {
        self.adapter.protocol()
    }

    fn stream_run(
        &self,
        message: String,
        history: Vec<Message>,
        abort: CancellationToken,
    ) -> BoxStream<'static, StreamEvent> {
        let shared = self.shared();
        let session = self.session.clone();

        Box::pin(async_stream::stream! {
            let guard = tokio::select! {
                biased;
                _ = abort.cancelled() => None,
                guard = session.lock_owned() => Some(guard),
            };
            let Some(mut guard) = guard else {
                yield StreamEvent::Aborted;
                return;
            };

            if !history.is_empty() {
                guard.messages = history;
            }
            let repaired = guard.close_open_tool_calls(FAILED_CALL);
            if !repaired.is_empty() {
                warn!(session_id = %guard.id, calls = ?repaired, "closed unanswered tool calls");
            }
            if !message.trim().is_empty() {
                guard.push(Message::user(message));
            }

            let mut run = LoopRun::new(shared, guard, abort);
            loop {
                let events = run.advance().await;
                for event in events {
                    if !event.is_terminal() && run.abort.is_cancelled() {
                        run.abort_run();
                        yield StreamEvent::Aborted;
                        return;
                    }
                    let terminal = event.is_terminal();
                    yield event;
                    if terminal {
                        return;
                    }
                }
                if run.is_finished() {
                    return;
                }
            }
        })
    }

    fn state(&self) -> LoopState {
        lock(&self.status).state
    }

    fn last_usage(&self) -> Usage {
        lock(&self.status).usage
    }
}

struct Shared {
    adapter: Arc<dyn WireProtocolAdapter>,
    transport: Arc<dyn ModelTransport>,
    tools: Arc<dyn ToolRegistry>,
    gate: Arc<PermissionGate>,
    options: LoopOptions,
    observer: Option<Arc<dyn LoopObserver>>,
    status: Arc<Mutex<LoopStatus>>,
}

/// A tool call whose arguments have been through the typed decode step.
struct PendingCall {
    id: String,
    name: String,
    arguments: std::result::Result<ToolArguments, String>,
}

struct ReadyCall {
    id: String,
    name: String,
    arguments: ToolArguments,
}

struct ModelTurn {
    raw: RawEventStream,
    decoder: StreamDecoder,
    text: String,
    calls: Vec<(String, String, String)>,
}

enum Phase {
    AwaitingModel,
    Streaming(Box<ModelTurn>),
    ToolCalls(VecDeque<PendingCall>),
    Permission {
        call: ReadyCall,
        pending: PendingPermission,
        rest: VecDeque<PendingCall>,
    },
    Executing {
        call: ReadyCall,
        rest: VecDeque<PendingCall>,
    },
    Finished,
}

struct LoopRun {
    shared: Arc<Shared>,
    session: OwnedMutexGuard<ConversationSession>,
    abort: CancellationToken,
    tool_defs: Vec<ToolDefinition>,
    iteration: usize,
    phase: Phase,
    attachments: Vec<Attachment>,
    usage: Usage,
}

impl LoopRun {
    fn new(
        shared: Arc<Shared>,
        session: OwnedMutexGuard<ConversationSession>,
        abort: CancellationToken,
    ) -> Self {
        let tool_defs = shared.tools.definitions();
        lock(&shared.status).usage = Usage::default();
        info!(
            session_id = %session.id,
            protocol = %shared.adapter.protocol(),
            tools = tool_defs.len(),
            "run started"
        );
        Self {
            shared,
            session,
            abort,
            tool_defs,
            iteration: 0,
            phase: Phase::AwaitingModel,
            attachments: Vec::new(),
            usage: Usage::default(),
        }
    }

    fn is_finished(&self) -> bool {
        matches!(self.phase, Phase::Finished)
    }

    async fn advance(&mut self) -> Vec<StreamEvent> {
        if self.abort.is_cancelled() {
            return self.abort_run();
        }
        match std::mem::replace(&mut self.phase, Phase::Finished) {
            Phase::AwaitingModel => self.call_model().await,
            Phase::Streaming(turn) => self.pump(turn).await,
            Phase::ToolCalls(queue) => self.next_call(queue),
            Phase::Permission {
                call,
                pending,
                rest,
            } => self.await_permission(call, pending, rest).await,
            Phase::Executing { call, rest } => self.execute(call, rest).await,
            Phase::Finished => Vec::new(),
        }
    }

    async fn call_model(&mut self) -> Vec<StreamEvent> {
        self.iteration += 1;
        let limit = self.shared.options.max_iterations;
        if self.iteration > limit {
            return self.fail(AgentError::IterationLimitExceeded { limit });
        }
        self.enter(LoopState::AwaitingModel);

        let encoded = match self
            .shared
            .adapter
            .encode_request(&self.session, &self.tool_defs)
        {
            Ok(encoded) => encoded,
            Err(err) => return self.fail(err),
        };
        debug!(
            session_id = %self.session.id,
            iteration = self.iteration,
            messages = self.session.messages.len(),
            "calling model"
        );
        let mut events: Vec<StreamEvent> = encoded
            .diagnostics
            .iter()
            .cloned()
            .map(|d| d.into_event())
            .collect();

        let transport = &self.shared.transport;
        let abort = &self.abort;
        let opened = self
            .shared
            .options
            .executor
            .execute(abort, |_attempt| transport.open_stream(&encoded, abort))
            .await;

        match opened {
            Ok(raw) => {
                self.phase = Phase::Streaming(Box::new(ModelTurn {
                    raw,
                    decoder: StreamDecoder::new(self.shared.adapter.clone()),
                    text: String::new(),
                    calls: Vec::new(),
                }));
            }
            Err(AgentError::Aborted) => events.extend(self.abort_run()),
            Err(err) => events.extend(self.fail(err)),
        }
        events
    }

    async fn pump(&mut self, mut turn: Box<ModelTurn>) -> Vec<StreamEvent> {
        let idle = self.shared.options.stream_idle_timeout;
        let pulled = tokio::select! {
            biased;
            _ = self.abort.cancelled() => None,
            next = tokio::time::timeout(idle, turn.raw.next()) => Some(next),
        };
        let Some(pulled) = pulled else {
            return self.abort_run();
        };

        match pulled {
            Err(_) => {
                let events = turn.decoder.fail(AgentError::Timeout(millis(idle)).to_string());
                self.end_failed(events)
            }
            Ok(Some(Err(err))) => {
                let events = turn.decoder.fail(err.to_string());
                self.end_failed(events)
            }
            Ok(Some(Ok(chunk))) => match turn.decoder.decode(&chunk) {
                Ok(events) => {
                    let failed = absorb(&mut turn, &events);
                    if failed {
                        self.end_failed(events)
                    } else {
                        self.phase = Phase::Streaming(turn);
                        events
                    }
                }
                Err(err) => {
                    let events = turn.decoder.fail(err.to_string());
                    self.end_failed(events)
                }
            },
            Ok(None) => {
                let events = turn.decoder.finish();
                absorb(&mut turn, &events);
                self.end_turn(*turn, events)
            }
        }
    }

    fn end_turn(&mut self, turn: ModelTurn, mut events: Vec<StreamEvent>) -> Vec<StreamEvent> {
        if let Some(token) = turn.decoder.continuation_token() {
            self.session.continuation_token = Some(token.to_string());
        }
        self.record_usage(turn.decoder.usage());

        if turn.calls.is_empty() {
            if !turn.text.is_empty() {
                self.session.push(Message::assistant(turn.text));
            }
            self.enter(LoopState::Complete);
            info!(
                session_id = %self.session.id,
                iteration = self.iteration,
                "run complete"
            );
            events.push(StreamEvent::Complete {
                attachments: std::mem::take(&mut self.attachments),
            });
            return events;
        }

        let pending: VecDeque<PendingCall> = turn
            .calls
            .into_iter()
            .map(|(id, name, raw)| {
                let arguments = decode_arguments(&name, &raw).map_err(|e| e.to_string());
                PendingCall {
                    id,
                    name,
                    arguments,
                }
            })
            .collect();
        let requests = pending
            .iter()
            .map(|c| {
                ToolCallRequest::new(
                    c.id.clone(),
                    c.name.clone(),
                    c.arguments.clone().unwrap_or_default(),
                )
            })
            .collect();
        self.session
            .push(Message::assistant_with_tool_calls(turn.text, requests));
        self.enter(LoopState::ToolCallPending);
        self.phase = Phase::ToolCalls(pending);
        events
    }

    fn end_failed(&mut self, events: Vec<StreamEvent>) -> Vec<StreamEvent> {
        if let Some(StreamEvent::Error { message }) = events.last() {
            warn!(session_id = %self.session.id, error = %message, "model stream failed");
        }
        self.enter(LoopState::Error);
        self.phase = Phase::Finished;
        events
    }

    fn next_call(&mut self, mut queue: VecDeque<PendingCall>) -> Vec<StreamEvent> {
        let Some(call) = queue.pop_front() else {
            self.phase = Phase::AwaitingModel;
            return Vec::new();
        };
        self.enter(LoopState::ToolCallPending);

        let arguments = match call.arguments {
            Ok(arguments) => arguments,
            Err(message) => {
                warn!(tool = %call.name, error = %message, "malformed tool arguments");
                return self.record_result(ToolResult::error(call.id, message), call.name, queue);
            }
        };
        let ready = ReadyCall {
            id: call.id,
            name: call.name,
            arguments,
        };

        let danger = self.shared.tools.classify(&ready.name, &ready.arguments);
        let dangerous = danger.is_dangerous();
        if !self
            .shared
            .options
            .approval_mode
            .requires_permission(dangerous)
        {
            self.enter(LoopState::ToolExecuting);
            self.phase = Phase::Executing {
                call: ready,
                rest: queue,
            };
            return Vec::new();
        }

        let request = PermissionRequest {
            request_id: format!("perm_{}", uuid::Uuid::new_v4().simple()),
            tool_name: ready.name.clone(),
            tool_input: serde_json::Value::Object(ready.arguments.clone()),
            dangerous,
            reason: danger.reason().unwrap_or(ASK_MODE_REASON).to_string(),
        };
        let pending = self.shared.gate.emit_request(&request);
        self.enter(LoopState::PermissionPending);
        self.phase = Phase::Permission {
            call: ready,
            pending,
            rest: queue,
        };
        vec![request.to_event()]
    }

    async fn await_permission(
        &mut self,
        mut call: ReadyCall,
        pending: PendingPermission,
        rest: VecDeque<PendingCall>,
    ) -> Vec<StreamEvent> {
        let options = &self.shared.options;
        let outcome = self
            .shared
            .gate
            .wait(
                pending,
                options.permission_timeout,
                options.permission_timeout_policy,
                &self.abort,
            )
            .await;

        match outcome {
            PermissionOutcome::Aborted => self.abort_run(),
            PermissionOutcome::Approved { updated_input, .. } => {
                if let Some(updated) = updated_input {
                    self.rewrite_arguments(&call.id, &updated);
                    call.arguments = updated;
                }
                self.enter(LoopState::ToolExecuting);
                self.phase = Phase::Executing { call, rest };
                Vec::new()
            }
            PermissionOutcome::Denied { timed_out } => {
                let message = if timed_out {
                    format!("Permission request for '{}' timed out; call denied", call.name)
                } else {
                    AgentError::PermissionDenied {
                        tool_name: call.name.clone(),
                    }
                    .to_string()
                };
                self.record_result(ToolResult::error(call.id, message), call.name, rest)
            }
        }
    }

    async fn execute(&mut self, call: ReadyCall, rest: VecDeque<PendingCall>) -> Vec<StreamEvent> {
        debug!(tool = %call.name, call_id = %call.id, "executing tool");
        let outcome = tokio::select! {
            biased;
            _ = self.abort.cancelled() => None,
            result = self.shared.tools.execute(&call.name, call.arguments.clone()) => Some(result),
        };

        match outcome {
            None => self.abort_run(),
            Some(Ok(output)) => {
                let content = output.content_string();
                self.attachments.extend(output.attachments);
                self.record_result(ToolResult::success(call.id, content), call.name, rest)
            }
            Some(Err(err)) => {
                warn!(tool = %call.name, error = %err, "tool execution failed");
                self.record_result(ToolResult::error(call.id, err.to_string()), call.name, rest)
            }
        }
    }

    fn record_result(
        &mut self,
        result: ToolResult,
        tool_name: String,
        rest: VecDeque<PendingCall>,
    ) -> Vec<StreamEvent> {
        self.session
            .push(Message::tool_result(&result, Some(tool_name)));
        self.phase = Phase::ToolCalls(rest);
        vec![StreamEvent::ToolResult {
            tool_call_id: result.tool_call_id,
            content: result.content,
            is_error: result.is_error,
        }]
    }

    /// Record approved replacement arguments on the assistant's tool call.
    fn rewrite_arguments(&mut self, call_id: &str, arguments: &ToolArguments) {
        let call = self
            .session
            .messages
            .iter_mut()
            .rev()
            .flat_map(|m| m.tool_calls.iter_mut())
            .find(|c| c.id == call_id);
        if let Some(call) = call {
            call.arguments = arguments.clone();
        }
    }

    fn abort_run(&mut self) -> Vec<StreamEvent> {
        let closed = self.session.close_open_tool_calls(ABORTED_CALL);
        info!(session_id = %self.session.id, closed = closed.len(), "run aborted");
        self.enter(LoopState::Aborted);
        self.phase = Phase::Finished;
        vec![StreamEvent::Aborted]
    }

    fn fail(&mut self, err: AgentError) -> Vec<StreamEvent> {
        warn!(session_id = %self.session.id, error = %err, category = %err.category(), "run failed");
        self.session.close_open_tool_calls(FAILED_CALL);
        self.enter(LoopState::Error);
        self.phase = Phase::Finished;
        vec![StreamEvent::error(err.to_string())]
    }

    fn record_usage(&mut self, usage: Usage) {
        self.usage.merge(&usage);
        lock(&self.shared.status).usage = self.usage;
    }

    fn enter(&self, to: LoopState) {
        let from = std::mem::replace(&mut lock(&self.shared.status).state, to);
        if from == to {
            return;
        }
        debug!(session_id = %self.session.id, %from, %to, "loop transition");
        if let Some(observer) = &self.shared.observer {
            observer.on_transition(&self.session.id, from, to);
        }
    }
}

/// Fold turn events into the turn buffers. Returns whether the stream failed.
fn absorb(turn: &mut ModelTurn, events: &[StreamEvent]) -> bool {
    let mut failed = false;
    for event in events {
        match event {
            StreamEvent::TextDelta { content } => turn.text.push_str(content),
            StreamEvent::ToolCallComplete {
                id,
                name,
                arguments_json,
            } => turn
                .calls
                .push((id.clone(), name.clone(), arguments_json.clone())),
            StreamEvent::Error { .. } => failed = true,
            _ => {}
        }
    }
    failed
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
