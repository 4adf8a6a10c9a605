//! Conversation session state.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::message::{Message, Role, ToolResult};
use crate::protocol::WireProtocol;

/// Policy governing which tool calls need an out-of-band approval.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ApprovalMode {
    /// Never ask.
    Auto,
    /// Ask for every tool call.
    Ask,
    /// Ask only for calls classified dangerous.
    #[default]
    Dangerous,
}

impl ApprovalMode {
    /// Whether a call with the given classification must pass the permission gate.
    pub fn requires_permission(self, dangerous: bool) -> bool {
        match self {
            Self::Auto => false,
            Self::Ask => true,
            Self::Dangerous => dangerous,
        }
    }
}

/// A conversation as seen by the loop.
///
/// Created by the host's session store before the first call. The loop appends
/// messages and updates `continuation_token` in place; it never deletes a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationSession {
    pub id: String,
    /// Opaque provider handle. Passed back unmodified, never inspected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_token: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub model: String,
    #[serde(default)]
    pub approval_mode: ApprovalMode,
    #[serde(default)]
    pub protocol: WireProtocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl ConversationSession {
    pub fn new(id: impl Into<String>, model: impl Into<String>, protocol: WireProtocol) -> Self {
        Self {
            id: id.into(),
            continuation_token: None,
            messages: Vec::new(),
            model: model.into(),
            approval_mode: ApprovalMode::default(),
            protocol,
            system_prompt: None,
        }
    }

    pub fn with_approval_mode(mut self, mode: ApprovalMode) -> Self {
        self.approval_mode = mode;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Answer every tool call of the latest assistant turn that has no result yet.
    ///
    /// Each unanswered call gets an error result carrying `reason`, so the
    /// transcript stays pairable for both protocols. Returns the ids closed.
    pub fn close_open_tool_calls(&mut self, reason: &str) -> Vec<String> {
        let Some(turn) = self
            .messages
            .iter()
            .rposition(|m| m.role == Role::Assistant && m.has_tool_calls())
        else {
            return Vec::new();
        };
        let answered: Vec<&str> = self.messages[turn + 1..]
            .iter()
            .filter(|m| m.role == Role::Tool)
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        let open: Vec<(String, String)> = self.messages[turn]
            .tool_calls
            .iter()
            .filter(|c| !answered.contains(&c.id.as_str()))
            .map(|c| (c.id.clone(), c.name.clone()))
            .collect();

        // Results must directly follow the assistant turn and its answered calls.
        let insert_at = self.messages[turn + 1..]
            .iter()
            .position(|m| m.role != Role::Tool)
            .map_or(self.messages.len(), |offset| turn + 1 + offset);
        let closed = open.iter().map(|(id, _)| id.clone()).collect();
        for (offset, (id, name)) in open.into_iter().enumerate() {
            let result = ToolResult::error(id, reason);
            self.messages
                .insert(insert_at + offset, Message::tool_result(&result, Some(name)));
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolCallRequest;

    fn call(id: &str) -> ToolCallRequest {
        ToolCallRequest::new(id, "grep", serde_json::Map::new())
    }

    #[test]
    fn unanswered_calls_get_error_results_in_call_order() {
        let mut session = ConversationSession::new("s", "m", WireProtocol::Messages).with_messages(vec![
            Message::user("search"),
            Message::assistant_with_tool_calls("", vec![call("a"), call("b"), call("c")]),
            Message::tool_result(&ToolResult::success("a", "hit"), Some("grep".into())),
            Message::user("never mind"),
        ]);

        let closed = session.close_open_tool_calls("run aborted");

        assert_eq!(closed, vec!["b".to_string(), "c".to_string()]);
        let ids: Vec<Option<&str>> = session.messages[2..5]
            .iter()
            .map(|m| m.tool_call_id.as_deref())
            .collect();
        assert_eq!(ids, vec![Some("a"), Some("b"), Some("c")]);
        assert!(session.messages[3].is_error);
        assert_eq!(session.messages[3].content, "run aborted");
        assert_eq!(session.messages[5].role, Role::User);
    }

    #[test]
    fn paired_transcript_is_left_alone() {
        let mut session = ConversationSession::new("s", "m", WireProtocol::ChatCompletions)
            .with_messages(vec![
                Message::user("search"),
                Message::assistant_with_tool_calls("", vec![call("a")]),
                Message::tool_result(&ToolResult::success("a", "hit"), None),
                Message::assistant("done"),
            ]);
        let before = session.messages.clone();

        assert!(session.close_open_tool_calls("run aborted").is_empty());
        assert_eq!(session.messages, before);
    }
}
