//! Validation of decoded JSON values into protocol messages.
//!
//! The `type` tag is inspected before any shape is committed to. Known tags
//! with missing required fields, and unknown tags, are rejected with a
//! reason; fields this crate does not model are kept in `extra`.

use serde_json::{Map, Value};

use super::error::DecodeError;
use super::types::*;

/// Parse a single complete NDJSON line.
pub fn parse_line(line: &str) -> Result<Message, DecodeError> {
    let raw: Value = serde_json::from_str(line).map_err(|e| DecodeError::Syntax {
        reason: e.to_string(),
        raw: line.to_string(),
    })?;
    parse_value(raw)
}

/// Parse a JSON value into a canonical message.
pub fn parse_value(raw: Value) -> Result<Message, DecodeError> {
    let payload = raw.to_string();
    message_from_value(raw).map_err(|reason| DecodeError::Invalid {
        reason,
        raw: payload,
    })
}

pub(crate) fn message_from_value(raw: Value) -> Result<Message, String> {
    let Value::Object(mut obj) = raw else {
        return Err("expected a JSON object".to_string());
    };

    let msg_type = match obj.remove("type") {
        Some(Value::String(t)) => t,
        Some(other) => return Err(format!("'type' must be a string, got {other}")),
        None => return Err("missing 'type' field".to_string()),
    };

    match msg_type.as_str() {
        "user" => parse_user(obj),
        "assistant" => parse_assistant(obj),
        "system" => parse_system(obj),
        "result" => parse_result(obj),
        "control_response" => parse_control_response(obj),
        other => Err(format!("unknown message type '{other}'")),
    }
}

/// Remove an optional string field. Non-string, non-null values are left
/// in place so they survive in `extra`.
fn take_string(obj: &mut Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key) {
        Some(Value::String(_)) => match obj.remove(key) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        },
        Some(Value::Null) => {
            obj.remove(key);
            None
        }
        _ => None,
    }
}

fn require_string(obj: &mut Map<String, Value>, key: &str, ctx: &str) -> Result<String, String> {
    take_string(obj, key).ok_or_else(|| format!("{ctx}: missing or non-string '{key}'"))
}

fn require_object(
    obj: &mut Map<String, Value>,
    key: &str,
    ctx: &str,
) -> Result<Map<String, Value>, String> {
    match obj.remove(key) {
        Some(Value::Object(inner)) => Ok(inner),
        Some(_) => Err(format!("{ctx}: '{key}' must be an object")),
        None => Err(format!("{ctx}: missing '{key}'")),
    }
}

/// Leftover fields of the nested `message` object are kept under
/// `extra["message"]`.
fn keep_nested(mut extra: Map<String, Value>, nested: Map<String, Value>) -> Map<String, Value> {
    if !nested.is_empty() {
        extra.insert("message".to_string(), Value::Object(nested));
    }
    extra
}

fn parse_user(mut obj: Map<String, Value>) -> Result<Message, String> {
    let session_id = take_string(&mut obj, "session_id");
    let parent_tool_use_id = take_string(&mut obj, "parent_tool_use_id");
    let mut message = require_object(&mut obj, "message", "user")?;

    let content = message
        .remove("content")
        .ok_or_else(|| "user: missing 'message.content'".to_string())?;
    let content: UserContent =
        serde_json::from_value(content).map_err(|e| format!("user: bad content: {e}"))?;

    Ok(Message::User(UserMessage {
        session_id,
        parent_tool_use_id,
        content,
        extra: keep_nested(obj, message),
    }))
}

fn parse_assistant(mut obj: Map<String, Value>) -> Result<Message, String> {
    let session_id = take_string(&mut obj, "session_id");
    let parent_tool_use_id = take_string(&mut obj, "parent_tool_use_id");
    let mut message = require_object(&mut obj, "message", "assistant")?;

    let content = message
        .remove("content")
        .ok_or_else(|| "assistant: missing 'message.content'".to_string())?;
    let content: Vec<ContentBlock> =
        serde_json::from_value(content).map_err(|e| format!("assistant: bad content: {e}"))?;
    let model = require_string(&mut message, "model", "assistant")?;
    let stop_reason = take_string(&mut message, "stop_reason");
    let usage = message.remove("usage");

    Ok(Message::Assistant(AssistantMessage {
        session_id,
        parent_tool_use_id,
        model,
        content,
        stop_reason,
        usage,
        extra: keep_nested(obj, message),
    }))
}

fn parse_system(mut obj: Map<String, Value>) -> Result<Message, String> {
    let subtype = require_string(&mut obj, "subtype", "system")?;
    let session_id = take_string(&mut obj, "session_id");

    Ok(Message::System(SystemMessage {
        subtype,
        session_id,
        data: obj,
    }))
}

fn parse_result(obj: Map<String, Value>) -> Result<Message, String> {
    serde_json::from_value::<ResultMessage>(Value::Object(obj))
        .map(Message::Result)
        .map_err(|e| format!("result: {e}"))
}

fn parse_control_response(mut obj: Map<String, Value>) -> Result<Message, String> {
    let response = require_object(&mut obj, "response", "control_response")?;
    let request_id = response
        .get("request_id")
        .and_then(Value::as_str)
        .map(String::from);
    let subtype = response
        .get("subtype")
        .and_then(Value::as_str)
        .map(String::from);

    Ok(Message::ControlResponse(ControlResponse {
        request_id,
        subtype,
        response: Value::Object(response),
    }))
}
