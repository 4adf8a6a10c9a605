//! Shared test helpers: scripted transport, SSE payload builders, tools.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use convoy::agent_loop::{ConversationLoopController, LoopOptions};
use convoy::error::{AgentError, Result};
use convoy::protocol::{AdapterOptions, ChatCompletionsAdapter, EncodedRequest, WireProtocol};
use convoy::tools::{AgentTool, ToolArguments, ToolParameters, ToolRegistry, ToolSet};
use convoy::transport::{ModelTransport, RawEventStream};
use convoy::types::{ConversationSession, StreamEvent};
use convoy::util::ResilientCallExecutor;

/// One scripted response to `open_stream`.
pub enum Script {
    /// Stream these payloads, then end.
    Events(Vec<String>),
    /// Stream these payloads, then never yield again.
    EventsThenStall(Vec<String>),
    /// Fail to open with this HTTP status.
    Status(u16),
    /// Never answer.
    Hang,
}

/// A transport that replays queued scripts and records every request.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<EncodedRequest>>,
}

impl ScriptedTransport {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn requests(&self) -> Vec<EncodedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn bodies(&self) -> Vec<Value> {
        self.requests().into_iter().map(|r| r.body).collect()
    }
}

#[async_trait]
impl ModelTransport for ScriptedTransport {
    async fn open_stream(
        &self,
        request: &EncodedRequest,
        abort: &CancellationToken,
    ) -> Result<RawEventStream> {
        self.requests.lock().unwrap().push(request.clone());
        let script = self.scripts.lock().unwrap().pop_front();
        match script {
            Some(Script::Events(events)) => Ok(stream::iter(events.into_iter().map(Ok)).boxed()),
            Some(Script::EventsThenStall(events)) => Ok(stream::iter(events.into_iter().map(Ok))
                .chain(stream::pending())
                .boxed()),
            Some(Script::Status(status)) => Err(AgentError::api(status, "scripted failure")),
            Some(Script::Hang) => {
                abort.cancelled().await;
                Err(AgentError::Aborted)
            }
            None => Err(AgentError::InvalidState("no scripted response left".into())),
        }
    }
}

// ---------------------------------------------------------------------------
// Chat-completions payloads
// ---------------------------------------------------------------------------

pub fn chat_text(id: &str, text: &str) -> String {
    json!({
        "id": id,
        "choices": [{ "index": 0, "delta": { "content": text } }]
    })
    .to_string()
}

pub fn chat_tool_fragment(
    id: &str,
    index: u32,
    call_id: Option<&str>,
    name: Option<&str>,
    arguments: &str,
) -> String {
    let mut call = json!({ "index": index, "function": { "arguments": arguments } });
    if let Some(call_id) = call_id {
        call["id"] = call_id.into();
        call["type"] = "function".into();
    }
    if let Some(name) = name {
        call["function"]["name"] = name.into();
    }
    json!({
        "id": id,
        "choices": [{ "index": 0, "delta": { "tool_calls": [call] } }]
    })
    .to_string()
}

pub fn chat_finish(id: &str, reason: &str) -> String {
    json!({
        "id": id,
        "choices": [{ "index": 0, "delta": {}, "finish_reason": reason }]
    })
    .to_string()
}

pub fn chat_usage(id: &str, prompt: u32, completion: u32) -> String {
    json!({
        "id": id,
        "choices": [],
        "usage": { "prompt_tokens": prompt, "completion_tokens": completion, "total_tokens": prompt + completion }
    })
    .to_string()
}

/// A full turn in which the model calls one tool.
pub fn tool_call_turn(response_id: &str, call_id: &str, name: &str, arguments: &str) -> Script {
    let mid = arguments.len() / 2;
    Script::Events(vec![
        chat_tool_fragment(response_id, 0, Some(call_id), Some(name), &arguments[..mid]),
        chat_tool_fragment(response_id, 0, None, None, &arguments[mid..]),
        chat_finish(response_id, "tool_calls"),
    ])
}

/// A full turn in which the model answers with text.
pub fn text_turn(response_id: &str, text: &str) -> Script {
    Script::Events(vec![
        chat_text(response_id, text),
        chat_finish(response_id, "stop"),
        chat_usage(response_id, 12, 4),
    ])
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

/// Arguments each tool was invoked with, by tool name.
pub type CallLog = Arc<Mutex<Vec<(String, ToolArguments)>>>;

pub fn tool_set(log: &CallLog) -> ToolSet {
    let list_log = log.clone();
    let rm_log = log.clone();
    let slow_log = log.clone();
    ToolSet::new()
        .with(AgentTool::new(
            "list_files",
            "List files in a directory",
            ToolParameters::object()
                .string("path", "Directory to list", true)
                .build(),
            move |args: ToolArguments| {
                let log = list_log.clone();
                async move {
                    log.lock().unwrap().push(("list_files".into(), args));
                    Ok(json!(["a.txt", "b.txt"]))
                }
            },
        ))
        .with(
            AgentTool::new(
                "rm",
                "Delete a file",
                ToolParameters::object()
                    .string("path", "File to delete", true)
                    .build(),
                move |args: ToolArguments| {
                    let log = rm_log.clone();
                    async move {
                        log.lock().unwrap().push(("rm".into(), args));
                        Ok(json!("deleted"))
                    }
                },
            )
            .dangerous("deletes files"),
        )
        .with(AgentTool::new(
            "slow",
            "Takes a minute",
            ToolParameters::empty(),
            move |args: ToolArguments| {
                let log = slow_log.clone();
                async move {
                    log.lock().unwrap().push(("slow".into(), args));
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(json!("done"))
                }
            },
        ))
}

pub fn tools(log: &CallLog) -> Arc<dyn ToolRegistry> {
    Arc::new(tool_set(log))
}

// ---------------------------------------------------------------------------
// Loop wiring
// ---------------------------------------------------------------------------

pub fn session() -> ConversationSession {
    ConversationSession::new("session-1", "test-model", WireProtocol::ChatCompletions)
}

/// Fast retries so scripted failures do not slow the suite.
pub fn fast_options() -> LoopOptions {
    LoopOptions::default().with_executor(
        ResilientCallExecutor::default()
            .with_backoff(Duration::from_millis(1), Duration::from_millis(1)),
    )
}

pub fn controller(
    transport: Arc<ScriptedTransport>,
    tools: Arc<dyn ToolRegistry>,
    options: LoopOptions,
) -> (
    ConversationLoopController,
    Arc<tokio::sync::Mutex<ConversationSession>>,
) {
    let session = Arc::new(tokio::sync::Mutex::new(session()));
    let adapter = Arc::new(ChatCompletionsAdapter::new(AdapterOptions::new("test-key")));
    let controller = ConversationLoopController::new(session.clone(), adapter, transport, tools)
        .with_options(options);
    (controller, session)
}

pub async fn collect(events: BoxStream<'static, StreamEvent>) -> Vec<StreamEvent> {
    events.collect().await
}

pub fn terminal_count(events: &[StreamEvent]) -> usize {
    events.iter().filter(|e| e.is_terminal()).count()
}
