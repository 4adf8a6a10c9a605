//! Chat-completions wire protocol.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::transport::http::bearer_headers;
use crate::types::{ConversationSession, Message, Role, Usage};

use super::{
    error_message, validate_session, AdapterOptions, EncodedRequest, ProviderDelta, ToolDefinition,
    WireProtocol, WireProtocolAdapter,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Adapter for flat `role`/`content` chat-completions endpoints.
pub struct ChatCompletionsAdapter {
    options: AdapterOptions,
}

impl ChatCompletionsAdapter {
    pub fn new(options: AdapterOptions) -> Self {
        Self { options }
    }

    fn url(&self) -> String {
        let base = self.options.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        format!("{}/chat/completions", base.trim_end_matches('/'))
    }
}

impl WireProtocolAdapter for ChatCompletionsAdapter {
    fn protocol(&self) -> WireProtocol {
        WireProtocol::ChatCompletions
    }

    fn encode_request(
        &self,
        session: &ConversationSession,
        tools: &[ToolDefinition],
    ) -> Result<EncodedRequest> {
        validate_session(session)?;

        let mut messages = Vec::with_capacity(session.messages.len() + 1);
        if let Some(prompt) = session.system_prompt.as_deref().filter(|p| !p.is_empty()) {
            messages.push(serde_json::json!({ "role": "system", "content": prompt }));
        }
        messages.extend(session.messages.iter().map(message_to_wire));

        let mut body = serde_json::json!({
            "model": session.model,
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        let obj = body
            .as_object_mut()
            .ok_or_else(|| AgentError::Encode("request body is not an object".into()))?;

        let settings = &self.options.settings;
        if let Some(max) = settings.max_tokens {
            obj.insert("max_tokens".into(), max.into());
        }
        if let Some(temp) = settings.temperature {
            obj.insert("temperature".into(), temp.into());
        }
        if let Some(top_p) = settings.top_p {
            obj.insert("top_p".into(), top_p.into());
        }
        if let Some(ref stops) = settings.stop_sequences {
            obj.insert("stop".into(), serde_json::json!(stops));
        }

        if !tools.is_empty() {
            let tool_defs: Vec<Value> = tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            obj.insert("tools".into(), tool_defs.into());
        }

        // The stock endpoint rejects unknown fields, so the token only goes
        // back when a compatible server names the field it expects.
        if let (Some(field), Some(token)) = (
            self.options.continuation_field.as_deref(),
            session.continuation_token.as_deref(),
        ) {
            obj.insert(field.into(), token.into());
        }

        Ok(EncodedRequest {
            url: self.url(),
            headers: bearer_headers(&self.options.api_key),
            body,
            diagnostics: Vec::new(),
        })
    }

    fn decode_stream_event(&self, raw: &str) -> Result<Vec<ProviderDelta>> {
        let raw = raw.trim();
        if raw.is_empty() || raw == "[DONE]" {
            return Ok(Vec::new());
        }
        let value: Value = serde_json::from_str(raw)?;
        if let Some(message) = error_message(&value) {
            return Ok(vec![ProviderDelta::Error(message)]);
        }
        let chunk: StreamChunk = serde_json::from_value(value)?;

        let mut deltas = Vec::new();
        if let Some(id) = chunk.id.filter(|id| !id.is_empty()) {
            deltas.push(ProviderDelta::Continuation(id));
        }
        for choice in chunk.choices {
            if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                deltas.push(ProviderDelta::Text(text));
            }
            for call in choice.delta.tool_calls {
                let (name, arguments) = match call.function {
                    Some(f) => (f.name, f.arguments.unwrap_or_default()),
                    None => (None, String::new()),
                };
                deltas.push(ProviderDelta::ToolCallFragment {
                    index: call.index,
                    id: call.id,
                    name,
                    arguments,
                });
            }
            if let Some(reason) = choice.finish_reason {
                deltas.push(ProviderDelta::Finished {
                    reason: Some(reason),
                });
            }
        }
        if let Some(usage) = chunk.usage {
            deltas.push(ProviderDelta::Usage(Usage::new(
                usage.prompt_tokens,
                usage.completion_tokens,
            )));
        }
        Ok(deltas)
    }
}

fn message_to_wire(msg: &Message) -> Value {
    match msg.role {
        Role::Tool => {
            let mut value = serde_json::json!({
                "role": "tool",
                "tool_call_id": msg.tool_call_id,
                "content": msg.content,
            });
            if let Some(ref name) = msg.name {
                value["name"] = name.clone().into();
            }
            value
        }
        Role::Assistant if msg.has_tool_calls() => {
            let calls: Vec<Value> = msg
                .tool_calls
                .iter()
                .map(|tc| {
                    serde_json::json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {
                            "name": tc.name,
                            "arguments": tc.arguments_json(),
                        }
                    })
                })
                .collect();
            serde_json::json!({
                "role": "assistant",
                "content": if msg.content.is_empty() { Value::Null } else { Value::String(msg.content.clone()) },
                "tool_calls": calls,
            })
        }
        role => serde_json::json!({ "role": role.to_string(), "content": msg.content }),
    }
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<StreamToolCall>,
}

#[derive(Deserialize)]
struct StreamToolCall {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunction>,
}

#[derive(Deserialize)]
struct StreamFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct StreamUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ToolCallRequest, ToolResult};

    fn adapter() -> ChatCompletionsAdapter {
        ChatCompletionsAdapter::new(AdapterOptions::new("test-key"))
    }

    fn session() -> ConversationSession {
        ConversationSession::new("s1", "gpt-4o", WireProtocol::ChatCompletions)
    }

    #[test]
    fn system_prompt_is_first_message() {
        let session = session()
            .with_system_prompt("be brief")
            .with_messages(vec![Message::user("hi")]);
        let req = adapter().encode_request(&session, &[]).unwrap();
        assert_eq!(req.body["messages"][0]["role"], "system");
        assert_eq!(req.body["messages"][0]["content"], "be brief");
        assert_eq!(req.body["messages"][1]["content"], "hi");
        assert_eq!(req.body["stream"], true);
        assert_eq!(req.url, "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn tool_results_use_tool_role() {
        let mut args = serde_json::Map::new();
        args.insert("path".into(), "/tmp".into());
        let session = session().with_messages(vec![
            Message::user("list"),
            Message::assistant_with_tool_calls("", vec![ToolCallRequest::new("c1", "ls", args)]),
            Message::tool_result(&ToolResult::success("c1", "a.txt"), Some("ls".into())),
        ]);
        let req = adapter().encode_request(&session, &[]).unwrap();
        let msgs = req.body["messages"].as_array().unwrap();
        assert_eq!(msgs[1]["content"], Value::Null);
        assert_eq!(msgs[1]["tool_calls"][0]["function"]["arguments"], r#"{"path":"/tmp"}"#);
        assert_eq!(msgs[2]["role"], "tool");
        assert_eq!(msgs[2]["tool_call_id"], "c1");
    }

    #[test]
    fn continuation_token_is_sent_only_to_a_named_field() {
        let mut session = session().with_messages(vec![Message::user("hi")]);
        session.continuation_token = Some("resp_abc".into());
        let req = adapter().encode_request(&session, &[]).unwrap();
        assert!(req.body.get("previous_response_id").is_none());
        assert_eq!(req.body.as_object().unwrap().len(), 4, "{}", req.body);

        let custom = ChatCompletionsAdapter::new(
            AdapterOptions::new("k").with_continuation_field("conversation"),
        );
        let req = custom.encode_request(&session, &[]).unwrap();
        assert_eq!(req.body["conversation"], "resp_abc");
        assert!(req.body.get("previous_response_id").is_none());
    }

    #[test]
    fn empty_user_content_is_rejected() {
        let session = session().with_messages(vec![Message::user("   ")]);
        let err = adapter().encode_request(&session, &[]).unwrap_err();
        assert!(matches!(err, AgentError::Encode(_)));
    }

    #[test]
    fn decodes_tool_fragments_and_id() {
        let raw = r#"{"id":"chatcmpl-1","choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"ls","arguments":"{\"pa"}}]}}]}"#;
        let deltas = adapter().decode_stream_event(raw).unwrap();
        assert_eq!(
            deltas,
            vec![
                ProviderDelta::Continuation("chatcmpl-1".into()),
                ProviderDelta::ToolCallFragment {
                    index: 0,
                    id: Some("c1".into()),
                    name: Some("ls".into()),
                    arguments: "{\"pa".into(),
                },
            ]
        );
    }

    #[test]
    fn decodes_done_marker_and_error_payload() {
        assert!(adapter().decode_stream_event("[DONE]").unwrap().is_empty());
        let deltas = adapter()
            .decode_stream_event(r#"{"error":{"message":"overloaded"}}"#)
            .unwrap();
        assert_eq!(deltas, vec![ProviderDelta::Error("overloaded".into())]);
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(adapter().decode_stream_event("{not json").is_err());
    }
}
