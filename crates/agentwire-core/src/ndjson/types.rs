//! Message types for the agent CLI's stream-json protocol.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Canonical inbound messages from the agent CLI.
///
/// The set is closed: a `type` tag outside it is a decode error, not a
/// catch-all variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
    System(SystemMessage),
    Result(ResultMessage),
    ControlResponse(ControlResponse),
}

impl Message {
    /// Wire tag of this message.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::Assistant(_) => "assistant",
            Self::System(_) => "system",
            Self::Result(_) => "result",
            Self::ControlResponse(_) => "control_response",
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::User(m) => m.session_id.as_deref(),
            Self::Assistant(m) => m.session_id.as_deref(),
            Self::System(m) => m.session_id.as_deref(),
            Self::Result(m) => Some(&m.session_id),
            Self::ControlResponse(_) => None,
        }
    }

    pub fn parent_tool_use_id(&self) -> Option<&str> {
        match self {
            Self::User(m) => m.parent_tool_use_id.as_deref(),
            Self::Assistant(m) => m.parent_tool_use_id.as_deref(),
            Self::System(_) | Self::Result(_) | Self::ControlResponse(_) => None,
        }
    }

    /// Whether this message marks the end of a turn.
    pub const fn is_result(&self) -> bool {
        matches!(self, Self::Result(_))
    }
}

/// Content block nested in user and assistant messages.
///
/// Fields a block carries beyond the modelled ones are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    Thinking {
        thinking: String,
        #[serde(default)]
        signature: String,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
}

impl ContentBlock {
    /// A text block with no extra fields.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            extra: Map::new(),
        }
    }
}

/// User content is either a bare string or a list of blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// User turn, including tool results echoed back by the CLI.
#[derive(Debug, Clone, PartialEq)]
pub struct UserMessage {
    pub session_id: Option<String>,
    pub parent_tool_use_id: Option<String>,
    pub content: UserContent,
    /// Fields this crate does not model, kept verbatim.
    pub extra: Map<String, Value>,
}

/// Complete assistant message.
#[derive(Debug, Clone, PartialEq)]
pub struct AssistantMessage {
    pub session_id: Option<String>,
    pub parent_tool_use_id: Option<String>,
    pub model: String,
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<String>,
    pub usage: Option<Value>,
    pub extra: Map<String, Value>,
}

impl AssistantMessage {
    /// Concatenated text of all `Text` blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// System message (`init` and friends). Everything besides the subtype
/// and session id stays in `data`.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemMessage {
    pub subtype: String,
    pub session_id: Option<String>,
    pub data: Map<String, Value>,
}

/// End-of-turn marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub subtype: String,
    pub is_error: bool,
    pub duration_ms: u64,
    #[serde(default)]
    pub duration_api_ms: u64,
    pub num_turns: u32,
    pub session_id: String,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub usage: Option<Value>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Acknowledgement of an in-band control request.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlResponse {
    pub request_id: Option<String>,
    pub subtype: Option<String>,
    pub response: Value,
}

/// Outbound line written to the CLI's stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
}

impl StreamMessage {
    /// A user turn carrying plain text.
    pub fn user(session_id: &str, text: &str) -> Self {
        Self {
            kind: "user".to_string(),
            message: Some(serde_json::json!({ "role": "user", "content": text })),
            parent_tool_use_id: None,
            session_id: Some(session_id.to_string()),
            request_id: None,
            request: None,
        }
    }

    /// An in-band control request such as `{"subtype":"interrupt"}`.
    pub fn control_request(request_id: String, request: Value) -> Self {
        Self {
            kind: "control_request".to_string(),
            message: None,
            parent_tool_use_id: None,
            session_id: None,
            request_id: Some(request_id),
            request: Some(request),
        }
    }

    /// Serialize as one protocol line (no trailing newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
