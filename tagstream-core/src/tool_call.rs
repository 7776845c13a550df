//! Turns the text accumulated inside a function-call region into a
//! [`ToolCall`].
//!
//! Accepted shapes, optionally wrapped in a markdown fence:
//! `{"name": "f", "arguments": {...}}`, `{"name": "f", "arguments": "{...}"}`
//! or `{"function": {"name": "f", "arguments": ...}}`.

use serde_json::Value;

use crate::error::ParseResult;
use crate::model::ToolCall;

pub fn parse_tool_call(text: &str) -> ParseResult<ToolCall> {
    let body = strip_fence(text.trim());
    if body.is_empty() {
        return ParseResult::Incomplete;
    }
    let value: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) if e.is_eof() => return ParseResult::Incomplete,
        Err(e) => return ParseResult::Malformed(format!("invalid tool call JSON: {e}")),
    };
    let obj = match value.get("function") {
        Some(f @ Value::Object(_)) => f,
        _ => &value,
    };
    let Some(name) = obj.get("name").and_then(Value::as_str) else {
        return ParseResult::Malformed("tool call has no \"name\"".into());
    };
    let arguments = match obj.get("arguments").or_else(|| obj.get("parameters")) {
        None | Some(Value::Null) => "{}".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };
    let mut call = ToolCall::function(name, arguments);
    call.id = value.get("id").and_then(Value::as_str).map(str::to_string);
    ParseResult::Ok(call)
}

fn strip_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}
