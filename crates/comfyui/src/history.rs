//! Typed view of the ComfyUI `/history/{prompt_id}` response.
//!
//! While a prompt is queued or running the endpoint returns `{}`. Once
//! it finishes, the body maps the prompt ID to a [`HistoryEntry`] with
//! per-node outputs and an execution status.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::messages::{parse_status_message, ComfyUIMessage};

/// Image type ComfyUI uses for transient previews.
pub const TEMP_IMAGE_TYPE: &str = "temp";

/// Full `/history/{prompt_id}` response body.
pub type History = HashMap<String, HistoryEntry>;

/// The recorded result of one prompt.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryEntry {
    /// Outputs keyed by the node ID that produced them.
    #[serde(default)]
    pub outputs: BTreeMap<String, NodeOutput>,
    #[serde(default)]
    pub status: Option<HistoryStatus>,
}

/// Output produced by a single node.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub images: Vec<OutputImage>,
}

/// A reference to an image file written by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputImage {
    /// Empty when the engine omitted it; such entries are skipped.
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// `output`, `temp` or `input`.
    #[serde(rename = "type", default = "default_image_type")]
    pub kind: String,
}

fn default_image_type() -> String {
    "output".to_string()
}

/// Execution status block of a history entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryStatus {
    /// `success` or `error`.
    #[serde(default)]
    pub status_str: Option<String>,
    #[serde(default)]
    pub completed: bool,
    /// `[kind, data]` pairs describing the execution lifecycle.
    #[serde(default)]
    pub messages: Vec<(String, Value)>,
}

/// Why the engine reports a prompt as failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionFailure {
    pub node_id: Option<String>,
    pub node_type: Option<String>,
    pub exception_type: String,
    pub message: String,
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.exception_type, self.message)?;
        match (&self.node_id, &self.node_type) {
            (Some(id), Some(ty)) => write!(f, " (node {id}, {ty})"),
            (Some(id), None) => write!(f, " (node {id})"),
            _ => Ok(()),
        }
    }
}

impl HistoryEntry {
    /// Typed lifecycle messages, skipping kinds this crate does not model.
    pub fn messages(&self) -> Vec<ComfyUIMessage> {
        let Some(status) = &self.status else {
            return Vec::new();
        };
        status
            .messages
            .iter()
            .filter_map(|(kind, data)| match parse_status_message(kind, data) {
                Ok(msg) => Some(msg),
                Err(e) => {
                    tracing::trace!(kind = %kind, error = %e, "Skipping status message");
                    None
                }
            })
            .collect()
    }

    /// The failure recorded for this prompt, if any.
    ///
    /// A prompt is failed when its status says `error` or its messages
    /// contain an `execution_error` / `execution_interrupted` record.
    pub fn failure(&self) -> Option<ExecutionFailure> {
        for msg in self.messages() {
            match msg {
                ComfyUIMessage::ExecutionError(data) => {
                    return Some(ExecutionFailure {
                        node_id: data.node_id,
                        node_type: data.node_type,
                        exception_type: data.exception_type,
                        message: data.exception_message,
                    });
                }
                ComfyUIMessage::ExecutionInterrupted(data) => {
                    return Some(ExecutionFailure {
                        node_id: data.node_id,
                        node_type: data.node_type,
                        exception_type: "Interrupted".to_string(),
                        message: "Execution was interrupted".to_string(),
                    });
                }
                _ => {}
            }
        }

        let errored = self
            .status
            .as_ref()
            .and_then(|s| s.status_str.as_deref())
            .is_some_and(|s| s == "error");
        errored.then(|| ExecutionFailure {
            node_id: None,
            node_type: None,
            exception_type: "Error".to_string(),
            message: "ComfyUI reported status 'error' without details".to_string(),
        })
    }

    /// Whether the engine has finished with this prompt.
    ///
    /// Entries without a status block (older ComfyUI builds) only
    /// appear once the prompt is done.
    pub fn is_complete(&self) -> bool {
        match &self.status {
            None => true,
            Some(s) => s.completed || s.status_str.as_deref() == Some("success"),
        }
    }

    /// Output images in engine order, skipping temporary previews and
    /// entries without a filename.
    ///
    /// Nodes are visited in numeric ID order (falling back to string
    /// order for non-numeric IDs); images within a node keep the order
    /// the engine reported.
    pub fn output_images(&self) -> Vec<&OutputImage> {
        let mut nodes: Vec<(&String, &NodeOutput)> = self.outputs.iter().collect();
        nodes.sort_by(|(a, _), (b, _)| node_order(a, b));

        nodes
            .into_iter()
            .flat_map(|(_, output)| output.images.iter())
            .filter(|image| image.kind != TEMP_IMAGE_TYPE && !image.filename.is_empty())
            .collect()
    }
}

fn node_order(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => std::cmp::Ordering::Less,
        (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}
