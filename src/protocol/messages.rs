//! Block-structured messages wire protocol.
//!
//! System text moves to a top-level `system` field, tool results travel as
//! `tool_result` blocks inside user turns, and every `tool_result` must pair
//! with a `tool_use` block in the immediately preceding assistant turn. When
//! the transcript lacks that block, a placeholder is synthesized and reported
//! as a diagnostic.

use std::collections::HashSet;

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::Result;
use crate::transport::http::anthropic_headers;
use crate::types::{ConversationSession, DiagnosticKind, Message, Role, Usage};

use super::{
    error_message, validate_session, AdapterOptions, EncodeDiagnostic, EncodedRequest,
    ProviderDelta, ToolDefinition, WireProtocol, WireProtocolAdapter,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
/// The endpoint rejects requests without `max_tokens`.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;
const PLACEHOLDER_TOOL_NAME: &str = "unknown_tool";

/// Adapter for block-structured messages endpoints.
pub struct MessagesAdapter {
    options: AdapterOptions,
}

impl MessagesAdapter {
    pub fn new(options: AdapterOptions) -> Self {
        Self { options }
    }

    fn url(&self) -> String {
        let base = self.options.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        format!("{}/messages", base.trim_end_matches('/'))
    }
}

impl WireProtocolAdapter for MessagesAdapter {
    fn protocol(&self) -> WireProtocol {
        WireProtocol::Messages
    }

    fn encode_request(
        &self,
        session: &ConversationSession,
        tools: &[ToolDefinition],
    ) -> Result<EncodedRequest> {
        validate_session(session)?;

        let mut system_parts: Vec<&str> = Vec::new();
        if let Some(prompt) = session.system_prompt.as_deref().filter(|p| !p.is_empty()) {
            system_parts.push(prompt);
        }
        let mut transcript = BlockTranscript::default();
        for msg in &session.messages {
            match msg.role {
                Role::System => system_parts.push(&msg.content),
                Role::User => transcript.push_user(msg),
                Role::Assistant => transcript.push_assistant(msg),
                Role::Tool => transcript.push_tool_result(msg),
            }
        }
        let (messages, diagnostics) = transcript.finish();

        let settings = &self.options.settings;
        let mut body = serde_json::json!({
            "model": session.model,
            "messages": messages,
            "max_tokens": settings.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": true,
        });
        if !system_parts.is_empty() {
            body["system"] = system_parts.join("\n\n").into();
        }
        if let Some(temp) = settings.temperature {
            body["temperature"] = temp.into();
        }
        if let Some(top_p) = settings.top_p {
            body["top_p"] = top_p.into();
        }
        if let Some(ref stops) = settings.stop_sequences {
            body["stop_sequences"] = serde_json::json!(stops);
        }
        if !tools.is_empty() {
            let defs: Vec<Value> = tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            body["tools"] = defs.into();
        }
        if let (Some(field), Some(token)) = (
            self.options.continuation_field.as_deref(),
            session.continuation_token.as_deref(),
        ) {
            body[field] = token.into();
        }

        Ok(EncodedRequest {
            url: self.url(),
            headers: anthropic_headers(&self.options.api_key, API_VERSION),
            body,
            diagnostics,
        })
    }

    fn decode_stream_event(&self, raw: &str) -> Result<Vec<ProviderDelta>> {
        let raw = raw.trim();
        if raw.is_empty() || raw == "[DONE]" {
            return Ok(Vec::new());
        }
        let value: Value = serde_json::from_str(raw)?;
        if value.get("type").and_then(Value::as_str) == Some("error") {
            let message = error_message(&value).unwrap_or_else(|| "stream error".into());
            return Ok(vec![ProviderDelta::Error(message)]);
        }

        let event: WireEvent = serde_json::from_value(value)?;
        let deltas = match event {
            WireEvent::MessageStart { message } => {
                let mut out = Vec::new();
                if let Some(id) = message.id.filter(|id| !id.is_empty()) {
                    out.push(ProviderDelta::Continuation(id));
                }
                if let Some(usage) = message.usage {
                    out.push(ProviderDelta::Usage(Usage::new(usage.input_tokens, 0)));
                }
                out
            }
            WireEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                WireBlock::ToolUse { id, name } => {
                    vec![ProviderDelta::ToolUseStart { index, id, name }]
                }
                WireBlock::Text { text } if !text.is_empty() => vec![ProviderDelta::Text(text)],
                _ => Vec::new(),
            },
            WireEvent::ContentBlockDelta { index, delta } => match delta {
                WireDelta::TextDelta { text } => vec![ProviderDelta::Text(text)],
                WireDelta::InputJsonDelta { partial_json } => {
                    vec![ProviderDelta::ToolInputDelta {
                        index,
                        partial_json,
                    }]
                }
                WireDelta::Other => Vec::new(),
            },
            WireEvent::ContentBlockStop { index } => vec![ProviderDelta::BlockStop { index }],
            WireEvent::MessageDelta { delta, usage } => {
                let mut out = Vec::new();
                if let Some(usage) = usage {
                    out.push(ProviderDelta::Usage(Usage::new(0, usage.output_tokens)));
                }
                if delta.stop_reason.is_some() {
                    out.push(ProviderDelta::Finished {
                        reason: delta.stop_reason,
                    });
                }
                out
            }
            WireEvent::MessageStop | WireEvent::Ping | WireEvent::Other => Vec::new(),
        };
        Ok(deltas)
    }
}

/// Builds the block-structured message list, merging consecutive tool
/// results into one user turn and repairing unpaired results.
#[derive(Default)]
struct BlockTranscript {
    messages: Vec<Value>,
    pending_results: Vec<Value>,
    /// `tool_use` ids of the latest assistant turn not yet answered.
    open_tool_uses: HashSet<String>,
    diagnostics: Vec<EncodeDiagnostic>,
}

impl BlockTranscript {
    fn push_user(&mut self, msg: &Message) {
        self.flush_results();
        self.open_tool_uses.clear();
        self.messages.push(serde_json::json!({
            "role": "user",
            "content": msg.content,
        }));
    }

    fn push_assistant(&mut self, msg: &Message) {
        self.flush_results();
        let mut content = Vec::new();
        if !msg.content.is_empty() {
            content.push(serde_json::json!({ "type": "text", "text": msg.content }));
        }
        for call in &msg.tool_calls {
            content.push(serde_json::json!({
                "type": "tool_use",
                "id": call.id,
                "name": call.name,
                "input": call.arguments,
            }));
        }
        self.open_tool_uses = msg.tool_calls.iter().map(|c| c.id.clone()).collect();
        self.messages.push(serde_json::json!({
            "role": "assistant",
            "content": content,
        }));
    }

    fn push_tool_result(&mut self, msg: &Message) {
        let id = msg.tool_call_id.clone().unwrap_or_default();
        if !self.open_tool_uses.remove(&id) {
            self.synthesize_tool_use(&id, msg.name.as_deref());
        }
        let mut block = serde_json::json!({
            "type": "tool_result",
            "tool_use_id": id,
            "content": msg.content,
        });
        if msg.is_error {
            block["is_error"] = true.into();
        }
        self.pending_results.push(block);
    }

    fn synthesize_tool_use(&mut self, id: &str, name: Option<&str>) {
        let placeholder = serde_json::json!({
            "type": "tool_use",
            "id": id,
            "name": name.unwrap_or(PLACEHOLDER_TOOL_NAME),
            "input": {},
        });
        let last_is_assistant = self
            .messages
            .last()
            .is_some_and(|m| m["role"] == "assistant");
        match self.messages.last_mut() {
            Some(last) if last_is_assistant => {
                if let Some(blocks) = last["content"].as_array_mut() {
                    blocks.push(placeholder);
                }
            }
            _ => {
                self.flush_results();
                self.messages.push(serde_json::json!({
                    "role": "assistant",
                    "content": [placeholder],
                }));
            }
        }
        warn!(tool_use_id = id, "tool result without preceding tool_use; synthesized placeholder");
        self.diagnostics.push(EncodeDiagnostic {
            kind: DiagnosticKind::SyntheticToolUse,
            message: format!("synthesized tool_use block for orphan tool result {id}"),
        });
    }

    fn flush_results(&mut self) {
        if self.pending_results.is_empty() {
            return;
        }
        let blocks = std::mem::take(&mut self.pending_results);
        self.messages.push(serde_json::json!({
            "role": "user",
            "content": blocks,
        }));
    }

    fn finish(mut self) -> (Vec<Value>, Vec<EncodeDiagnostic>) {
        self.flush_results();
        (self.messages, self.diagnostics)
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    MessageStart {
        message: WireMessageStart,
    },
    ContentBlockStart {
        index: u32,
        content_block: WireBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: WireDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        #[serde(default)]
        delta: WireMessageDelta,
        #[serde(default)]
        usage: Option<WireOutputUsage>,
    },
    MessageStop,
    Ping,
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct WireMessageStart {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    usage: Option<WireInputUsage>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Default)]
struct WireMessageDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireInputUsage {
    #[serde(default)]
    input_tokens: u32,
}

#[derive(Deserialize)]
struct WireOutputUsage {
    #[serde(default)]
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ToolCallRequest, ToolResult};
    use pretty_assertions::assert_eq;

    fn adapter() -> MessagesAdapter {
        MessagesAdapter::new(AdapterOptions::new("test-key"))
    }

    fn session(messages: Vec<Message>) -> ConversationSession {
        ConversationSession::new("s1", "claude-sonnet-4", WireProtocol::Messages)
            .with_messages(messages)
    }

    fn call(id: &str) -> ToolCallRequest {
        ToolCallRequest::new(id, "ls", serde_json::Map::new())
    }

    #[test]
    fn system_text_is_extracted() {
        let s = session(vec![Message::system("rules"), Message::user("hi")])
            .with_system_prompt("persona");
        let req = adapter().encode_request(&s, &[]).unwrap();
        assert_eq!(req.body["system"], "persona\n\nrules");
        assert_eq!(req.body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(req.body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(req.headers["x-api-key"], "test-key");
    }

    #[test]
    fn consecutive_tool_results_share_one_user_turn() {
        let s = session(vec![
            Message::user("go"),
            Message::assistant_with_tool_calls("", vec![call("a"), call("b")]),
            Message::tool_result(&ToolResult::success("a", "1"), None),
            Message::tool_result(&ToolResult::error("b", "boom"), None),
        ]);
        let req = adapter().encode_request(&s, &[]).unwrap();
        let msgs = req.body["messages"].as_array().unwrap();
        assert_eq!(msgs.len(), 3);
        let blocks = msgs[2]["content"].as_array().unwrap();
        assert_eq!(blocks[0]["tool_use_id"], "a");
        assert_eq!(blocks[1]["is_error"], true);
        assert!(req.diagnostics.is_empty());
    }

    #[test]
    fn orphan_result_gets_synthetic_tool_use() {
        let s = session(vec![
            Message::user("go"),
            Message::tool_result(&ToolResult::success("x1", "out"), Some("read".into())),
        ]);
        let req = adapter().encode_request(&s, &[]).unwrap();
        let msgs = req.body["messages"].as_array().unwrap();
        assert_eq!(msgs[1]["role"], "assistant");
        assert_eq!(msgs[1]["content"][0]["id"], "x1");
        assert_eq!(msgs[1]["content"][0]["name"], "read");
        assert_eq!(msgs[2]["content"][0]["tool_use_id"], "x1");
        assert_eq!(req.diagnostics.len(), 1);
        assert_eq!(req.diagnostics[0].kind, DiagnosticKind::SyntheticToolUse);
    }

    #[test]
    fn unmatched_result_extends_preceding_assistant_turn() {
        let s = session(vec![
            Message::user("go"),
            Message::assistant_with_tool_calls("", vec![call("a")]),
            Message::tool_result(&ToolResult::success("a", "1"), None),
            Message::tool_result(&ToolResult::success("z", "2"), None),
        ]);
        let req = adapter().encode_request(&s, &[]).unwrap();
        let msgs = req.body["messages"].as_array().unwrap();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[1]["content"][1]["id"], "z");
        assert_eq!(msgs[2]["content"].as_array().unwrap().len(), 2);
        assert_eq!(req.diagnostics.len(), 1);
    }

    #[test]
    fn decodes_tool_use_events() {
        let a = adapter();
        let start = a
            .decode_stream_event(
                r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"t1","name":"ls","input":{}}}"#,
            )
            .unwrap();
        assert_eq!(
            start,
            vec![ProviderDelta::ToolUseStart {
                index: 1,
                id: "t1".into(),
                name: "ls".into()
            }]
        );
        let delta = a
            .decode_stream_event(
                r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"p"}}"#,
            )
            .unwrap();
        assert_eq!(
            delta,
            vec![ProviderDelta::ToolInputDelta {
                index: 1,
                partial_json: "{\"p".into()
            }]
        );
        let stop = a
            .decode_stream_event(r#"{"type":"content_block_stop","index":1}"#)
            .unwrap();
        assert_eq!(stop, vec![ProviderDelta::BlockStop { index: 1 }]);
    }

    #[test]
    fn message_start_carries_continuation() {
        let deltas = adapter()
            .decode_stream_event(
                r#"{"type":"message_start","message":{"id":"msg_1","usage":{"input_tokens":12}}}"#,
            )
            .unwrap();
        assert_eq!(deltas[0], ProviderDelta::Continuation("msg_1".into()));
        assert_eq!(deltas[1], ProviderDelta::Usage(Usage::new(12, 0)));
    }

    #[test]
    fn unknown_events_are_ignored() {
        let deltas = adapter()
            .decode_stream_event(r#"{"type":"future_thing","foo":1}"#)
            .unwrap();
        assert!(deltas.is_empty());
        let err = adapter()
            .decode_stream_event(r#"{"type":"error","error":{"type":"overloaded_error","message":"busy"}}"#)
            .unwrap();
        assert_eq!(err, vec![ProviderDelta::Error("busy".into())]);
    }
}
