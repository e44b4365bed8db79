//! ComfyUI execution status messages.
//!
//! ComfyUI records the lifecycle of each prompt in its history entry as
//! `status.messages`, a list of `[kind, data]` pairs using the same
//! kinds it broadcasts over WebSocket (`execution_start`,
//! `execution_error`, ...). This module turns those pairs into a
//! strongly-typed [`ComfyUIMessage`] enum.

use serde::Deserialize;
use serde_json::Value;

/// Execution lifecycle messages recorded in a prompt's history.
///
/// Deserialized via the adjacently-tagged `"type"` field with
/// associated `"data"` content.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ComfyUIMessage {
    /// A prompt has started executing.
    #[serde(rename = "execution_start")]
    ExecutionStart(ExecutionStartData),

    /// Some nodes were skipped because their outputs are cached.
    #[serde(rename = "execution_cached")]
    ExecutionCached(ExecutionCachedData),

    /// All nodes finished.
    #[serde(rename = "execution_success")]
    ExecutionSuccess(ExecutionStartData),

    /// Execution was stopped via `/interrupt`.
    #[serde(rename = "execution_interrupted")]
    ExecutionInterrupted(InterruptedData),

    /// Execution failed with an error.
    #[serde(rename = "execution_error")]
    ExecutionError(ErrorData),
}

/// Payload for `execution_start` and `execution_success` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionStartData {
    pub prompt_id: String,
}

/// Payload for `execution_cached` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    pub prompt_id: String,
    /// Node IDs whose outputs were served from cache.
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Payload for `execution_interrupted` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct InterruptedData {
    pub prompt_id: String,
    #[serde(default, deserialize_with = "node_id")]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
}

/// Payload for `execution_error` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    #[serde(default, deserialize_with = "node_id")]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: String,
}

/// ComfyUI reports node IDs as strings, but older builds send numbers.
fn node_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Parse one `[kind, data]` status entry into a typed message.
///
/// Returns `Err` for unknown kinds or malformed data. Callers should
/// log and skip those.
pub fn parse_status_message(kind: &str, data: &Value) -> Result<ComfyUIMessage, serde_json::Error> {
    serde_json::from_value(serde_json::json!({ "type": kind, "data": data }))
}
