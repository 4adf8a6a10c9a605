//! Wire protocol adapters.
//!
//! An adapter turns a [`ConversationSession`] into one provider request and
//! decodes raw SSE payloads into [`ProviderDelta`] values. The
//! [`crate::stream::StreamEventAccumulator`] turns those deltas into uniform
//! [`crate::types::StreamEvent`]s.

pub mod chat_completions;
pub mod messages;

pub use chat_completions::ChatCompletionsAdapter;
pub use messages::MessagesAdapter;

use std::sync::Arc;

use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::types::{
    ConversationSession, DiagnosticKind, GenerationSettings, Message, Role, StreamEvent, Usage,
};

/// The two supported wire protocols.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WireProtocol {
    /// Flat chat-completions messages with `role=tool` results.
    #[default]
    ChatCompletions,
    /// Block-structured messages with a top-level system field and `tool_result` blocks.
    Messages,
}

impl WireProtocol {
    /// Config key of the provider that speaks this protocol by default.
    pub fn provider_key(self) -> &'static str {
        match self {
            Self::ChatCompletions => "openai",
            Self::Messages => "anthropic",
        }
    }
}

/// Tool definition sent to the provider API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A repair applied while encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeDiagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
}

impl EncodeDiagnostic {
    pub fn into_event(self) -> StreamEvent {
        StreamEvent::Diagnostic {
            kind: self.kind,
            message: self.message,
        }
    }
}

/// A fully encoded provider request.
#[derive(Debug, Clone)]
pub struct EncodedRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: serde_json::Value,
    pub diagnostics: Vec<EncodeDiagnostic>,
}

/// One provider-specific increment decoded from a raw stream payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderDelta {
    Text(String),
    /// Chat-completions tool fragment. `id`/`name` are present on the first
    /// fragment of a call; later fragments carry only argument text.
    ToolCallFragment {
        index: u32,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
    /// Block-structured `tool_use` block start.
    ToolUseStart { index: u32, id: String, name: String },
    /// Block-structured `input_json_delta`.
    ToolInputDelta { index: u32, partial_json: String },
    BlockStop { index: u32 },
    /// Provider handle that can resume this conversation.
    Continuation(String),
    Usage(Usage),
    Finished { reason: Option<String> },
    Error(String),
}

/// Translates the internal conversation to and from one provider wire format.
pub trait WireProtocolAdapter: Send + Sync {
    fn protocol(&self) -> WireProtocol;

    /// Build the streaming request for the session's current transcript.
    ///
    /// Fails with [`AgentError::Encode`] on malformed input; no network call
    /// is attempted in that case.
    fn encode_request(
        &self,
        session: &ConversationSession,
        tools: &[ToolDefinition],
    ) -> Result<EncodedRequest>;

    /// Decode one SSE `data:` payload into zero or more deltas.
    fn decode_stream_event(&self, raw: &str) -> Result<Vec<ProviderDelta>>;
}

/// Connection and generation options shared by both adapters.
#[derive(Debug, Clone, Default)]
pub struct AdapterOptions {
    pub base_url: Option<String>,
    pub api_key: String,
    pub settings: GenerationSettings,
    /// Request field that carries the continuation token back to the provider.
    pub continuation_field: Option<String>,
}

impl AdapterOptions {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_settings(mut self, settings: GenerationSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_continuation_field(mut self, field: impl Into<String>) -> Self {
        self.continuation_field = Some(field.into());
        self
    }
}

/// Create the adapter for a protocol from config.
pub fn create_adapter(
    protocol: WireProtocol,
    config: &AgentConfig,
) -> Result<Arc<dyn WireProtocolAdapter>> {
    let provider = protocol.provider_key();
    let api_key = config.get_api_key(provider).ok_or_else(|| {
        AgentError::Configuration(format!(
            "Missing {}_API_KEY",
            provider.to_ascii_uppercase()
        ))
    })?;
    let mut options = AdapterOptions::new(api_key).with_settings(GenerationSettings {
        max_tokens: config.agent_loop.max_tokens,
        ..Default::default()
    });
    options.base_url = config.get_base_url(provider);
    options.continuation_field = config
        .providers
        .get(provider)
        .and_then(|p| p.continuation_field.clone());

    Ok(match protocol {
        WireProtocol::ChatCompletions => Arc::new(ChatCompletionsAdapter::new(options)),
        WireProtocol::Messages => Arc::new(MessagesAdapter::new(options)),
    })
}

/// Reject transcripts that no provider would accept.
pub(crate) fn validate_session(session: &ConversationSession) -> Result<()> {
    if session.model.trim().is_empty() {
        return Err(AgentError::Encode("session has no model".into()));
    }
    for (idx, message) in session.messages.iter().enumerate() {
        validate_message(idx, message)?;
    }
    Ok(())
}

fn validate_message(idx: usize, message: &Message) -> Result<()> {
    let empty = message.content.trim().is_empty();
    match message.role {
        Role::System | Role::User if empty => Err(AgentError::Encode(format!(
            "message {idx}: {} content must not be empty",
            message.role
        ))),
        Role::Assistant if empty && message.tool_calls.is_empty() => Err(AgentError::Encode(
            format!("message {idx}: assistant message has neither content nor tool calls"),
        )),
        Role::Tool if message.tool_call_id.as_deref().map_or(true, str::is_empty) => Err(
            AgentError::Encode(format!("message {idx}: tool message without tool_call_id")),
        ),
        _ => {
            for call in &message.tool_calls {
                if call.id.trim().is_empty() || call.name.trim().is_empty() {
                    return Err(AgentError::Encode(format!(
                        "message {idx}: tool call missing id or name"
                    )));
                }
            }
            Ok(())
        }
    }
}

/// Pull a human-readable message out of a provider error payload.
pub(crate) fn error_message(value: &serde_json::Value) -> Option<String> {
    let error = value.get("error").filter(|e| !e.is_null())?;
    if let Some(message) = error.get("message").and_then(|m| m.as_str()) {
        return Some(message.to_string());
    }
    if let Some(message) = error.as_str() {
        return Some(message.to_string());
    }
    Some("provider reported an error".to_string())
}
