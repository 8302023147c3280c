//! Stream message decoding.
//!
//! The agent writes newline-delimited JSON to stdout. Each line carries a
//! `type` field that selects the message shape; unrecognized types are
//! preserved as [`StreamMessage::Unknown`] so new agent versions do not
//! break the stream loop.

use serde::Deserialize;

/// One decoded stream message.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    /// Run bookkeeping; the `init` subtype carries the session id.
    System(SystemMessage),
    /// Alias some agent builds emit for the initial system message.
    Init(SystemMessage),
    /// A model turn with content blocks.
    Assistant {
        #[serde(default)]
        message: AssistantMessage,
    },
    /// Terminal message with the final text or an error.
    Result(ResultMessage),
    /// Anything this client does not understand.
    #[serde(other)]
    Unknown,
}

/// `system`/`init` payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemMessage {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub session_id: String,
}

/// `assistant` payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

/// A content block inside an assistant message.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    #[serde(other)]
    Other,
}

/// `result` payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultMessage {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default)]
    pub usage: Usage,
}

/// Token usage counters.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl StreamMessage {
    /// Decode one NDJSON line.
    pub fn decode(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// Session id if this message carries one.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::System(s) | Self::Init(s) if !s.session_id.is_empty() => Some(&s.session_id),
            Self::Result(r) if !r.session_id.is_empty() => Some(&r.session_id),
            _ => None,
        }
    }

    /// Names of tools used in this message, if any.
    #[must_use]
    pub fn tool_names(&self) -> Vec<&str> {
        match self {
            Self::Assistant { message } => message
                .content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolUse { name, .. } => Some(name.as_str()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}
