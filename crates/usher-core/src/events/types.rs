//! Payload shapes for the event catalog.
//!
//! One struct per catalog name, camelCase on the wire. Optional fields
//! default and unknown fields are ignored, in the tolerant reader pattern.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload of `assistant:v1:message-start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStart {
    pub message_id: String,
    #[serde(default)]
    pub model: Option<String>,
}

/// Payload of `assistant:v1:message-chunk`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageChunk {
    pub text: String,
}

/// Payload of `assistant:v1:tool-start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStart {
    pub tool_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub input: Value,
}

/// Payload of `assistant:v1:tool-complete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolComplete {
    pub tool_id: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub is_error: bool,
}

/// Payload of `assistant:v1:session-complete`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionComplete {
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Payload of `assistant:v1:error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub fatal: bool,
}

/// Token usage statistics reported at session completion.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}
