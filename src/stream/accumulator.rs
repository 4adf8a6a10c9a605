//! Tool-call fragment accumulation.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, warn};

use crate::protocol::ProviderDelta;
use crate::types::{DiagnosticKind, StreamEvent, Usage};

#[derive(Debug)]
struct OpenCall {
    seq: u64,
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Turns provider deltas into uniform stream events.
///
/// Tool-call fragments are buffered per stream index until the call is known
/// to be complete: on a block stop, when a new id or name appears at the same
/// index, when the provider reports an error, or at end of stream. Completed
/// calls are released in the order their buffers were opened, so a call that
/// finishes early waits for any earlier call still in flight.
#[derive(Debug, Default)]
pub struct StreamEventAccumulator {
    open: HashMap<u32, OpenCall>,
    completed: BTreeMap<u64, StreamEvent>,
    emitted_ids: HashSet<String>,
    next_seq: u64,
    continuation: Option<String>,
    usage: Usage,
    finish_reason: Option<String>,
    finished: bool,
}

impl StreamEventAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one delta and return the events it completes.
    pub fn push(&mut self, delta: ProviderDelta) -> Vec<StreamEvent> {
        if self.finished {
            debug!(?delta, "delta after stream finished; ignoring");
            return Vec::new();
        }
        match delta {
            ProviderDelta::Text(content) => {
                if content.is_empty() {
                    Vec::new()
                } else {
                    vec![StreamEvent::TextDelta { content }]
                }
            }
            ProviderDelta::ToolCallFragment {
                index,
                id,
                name,
                arguments,
            } => {
                let starts_new = self.open.get(&index).is_some_and(|open| {
                    let new_id = matches!((&id, &open.id), (Some(a), Some(b)) if a != b);
                    let new_name = id.is_none()
                        && matches!((&name, &open.name), (Some(a), Some(b)) if a != b);
                    new_id || new_name
                });
                if starts_new {
                    self.flush(index);
                }
                match self.open.get_mut(&index) {
                    Some(open) => {
                        if open.id.is_none() {
                            open.id = id;
                        }
                        if open.name.is_none() {
                            open.name = name;
                        }
                        open.arguments.push_str(&arguments);
                    }
                    None => self.open_call(index, id, name, arguments),
                }
                self.release()
            }
            ProviderDelta::ToolUseStart { index, id, name } => {
                if self.open.contains_key(&index) {
                    self.flush(index);
                }
                self.open_call(index, Some(id), Some(name), String::new());
                self.release()
            }
            ProviderDelta::ToolInputDelta {
                index,
                partial_json,
            } => {
                match self.open.get_mut(&index) {
                    Some(open) => open.arguments.push_str(&partial_json),
                    None => warn!(index, "input delta for unknown block; ignoring"),
                }
                Vec::new()
            }
            ProviderDelta::BlockStop { index } => {
                if self.open.contains_key(&index) {
                    self.flush(index);
                }
                self.release()
            }
            ProviderDelta::Continuation(token) => {
                self.continuation = Some(token);
                Vec::new()
            }
            ProviderDelta::Usage(usage) => {
                self.usage.merge(&usage);
                Vec::new()
            }
            ProviderDelta::Finished { reason } => {
                if reason.is_some() {
                    self.finish_reason = reason;
                }
                Vec::new()
            }
            ProviderDelta::Error(message) => {
                let mut events = self.flush_all();
                events.push(StreamEvent::Error { message });
                self.finished = true;
                events
            }
        }
    }

    /// Flush every open buffer at end of stream. Calling it again yields nothing.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        self.flush_all()
    }

    /// Flush every open buffer and append an error, for transport failures.
    pub fn fail(&mut self, message: impl Into<String>) -> Vec<StreamEvent> {
        self.push(ProviderDelta::Error(message.into()))
    }

    pub fn continuation_token(&self) -> Option<&str> {
        self.continuation.as_deref()
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    pub fn has_open_calls(&self) -> bool {
        !self.open.is_empty()
    }

    fn open_call(
        &mut self,
        index: u32,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.open.insert(
            index,
            OpenCall {
                seq,
                id,
                name,
                arguments,
            },
        );
    }

    fn flush(&mut self, index: u32) {
        let Some(call) = self.open.remove(&index) else {
            return;
        };
        let event = match call.name.filter(|n| !n.is_empty()) {
            Some(name) => {
                let id = call
                    .id
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
                if self.emitted_ids.contains(&id) {
                    warn!(id = %id, "duplicate tool call id; dropping");
                    return;
                }
                self.emitted_ids.insert(id.clone());
                StreamEvent::ToolCallComplete {
                    id,
                    name,
                    arguments_json: call.arguments,
                }
            }
            None => {
                warn!(index, "tool call ended without a name; dropping");
                StreamEvent::Diagnostic {
                    kind: DiagnosticKind::DroppedToolCall,
                    message: format!(
                        "dropped tool call at index {index} ({} argument bytes) with no tool name",
                        call.arguments.len()
                    ),
                }
            }
        };
        self.completed.insert(call.seq, event);
    }

    fn flush_all(&mut self) -> Vec<StreamEvent> {
        let mut indices: Vec<(u64, u32)> = self.open.iter().map(|(i, c)| (c.seq, *i)).collect();
        indices.sort_unstable();
        for (_, index) in indices {
            self.flush(index);
        }
        self.release()
    }

    /// Emit completed calls that no earlier open buffer is still holding back.
    fn release(&mut self) -> Vec<StreamEvent> {
        let oldest_open = self.open.values().map(|c| c.seq).min();
        let mut events = Vec::new();
        while let Some(entry) = self.completed.first_entry() {
            if oldest_open.is_some_and(|oldest| *entry.key() > oldest) {
                break;
            }
            events.push(entry.remove());
        }
        events
    }
}
