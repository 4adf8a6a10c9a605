//! Tool-call argument decoding.

use serde_json::{Map, Value};

use crate::error::{AgentError, Result};

use super::types::ToolParameters;

/// Decoded tool-call arguments.
pub type ToolArguments = Map<String, Value>;

/// Decode accumulated argument text into a JSON object.
///
/// Empty text decodes to `{}`. Anything that is not a JSON object is an error.
pub fn decode_arguments(tool_name: &str, raw: &str) -> Result<ToolArguments> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(AgentError::tool(
            tool_name,
            format!("arguments must be a JSON object, got {}", json_type_name(&other)),
        )),
        Err(err) => Err(AgentError::tool(
            tool_name,
            format!("invalid JSON arguments: {err}"),
        )),
    }
}

/// Check that every required parameter is present.
pub fn check_required(tool_name: &str, args: &ToolArguments, params: &ToolParameters) -> Result<()> {
    match params.required().find(|field| !args.contains_key(*field)) {
        Some(missing) => Err(AgentError::tool(
            tool_name,
            format!("missing required field '{missing}'"),
        )),
        None => Ok(()),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
