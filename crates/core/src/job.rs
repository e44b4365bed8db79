//! Inbound job request schema.
//!
//! The harness delivers `{"workflow": "...", "payload": {...}}` under
//! the job's `input` key. [`JobRequest::from_input`] checks it the way
//! the harness's own schema validator would: unexpected keys, type
//! mismatches and constraint violations are all reported together.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;

/// Name of the workflow the default (shipped) template is stored under.
pub const TXT2IMG_TEMPLATE: &str = "txt2img";

/// Keys accepted in the job input object.
const INPUT_KEYS: &[&str] = &["workflow", "payload"];

/// Workflow selector accepted in the job input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowName {
    /// Alias for the canonical text-to-image workflow.
    Default,
    #[default]
    Txt2img,
    /// The payload is already a complete job graph; no template is used.
    Custom,
}

impl WorkflowName {
    pub const ALL: [WorkflowName; 3] = [Self::Default, Self::Txt2img, Self::Custom];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Txt2img => "txt2img",
            Self::Custom => "custom",
        }
    }

    /// Collapse aliases to the workflow that actually runs.
    pub fn resolve(self) -> Self {
        match self {
            Self::Default => Self::Txt2img,
            other => other,
        }
    }

    /// Template file stem for templated workflows, `None` for custom.
    pub fn template_name(self) -> Option<&'static str> {
        match self.resolve() {
            Self::Custom => None,
            _ => Some(TXT2IMG_TEMPLATE),
        }
    }
}

impl fmt::Display for WorkflowName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|w| w.as_str() == s)
            .ok_or_else(|| {
                CoreError::Validation(format!(
                    "workflow must be one of default, txt2img, custom (got '{s}')"
                ))
            })
    }
}

/// A validated job request, consumed once by the handler.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub workflow: WorkflowName,
    pub payload: Map<String, Value>,
}

impl JobRequest {
    /// Validate the raw `input` object of a job.
    pub fn from_input(input: &Value) -> Result<Self, CoreError> {
        let obj = input
            .as_object()
            .ok_or_else(|| CoreError::Validation("job input must be a JSON object".to_string()))?;

        let mut errors = Vec::new();

        for key in obj.keys() {
            if !INPUT_KEYS.contains(&key.as_str()) {
                errors.push(format!("unexpected input '{key}'"));
            }
        }

        let workflow = match obj.get("workflow") {
            None | Some(Value::Null) => Some(WorkflowName::default()),
            Some(Value::String(s)) => match s.parse::<WorkflowName>() {
                Ok(w) => Some(w),
                Err(CoreError::Validation(msg)) => {
                    errors.push(msg);
                    None
                }
                Err(other) => return Err(other),
            },
            Some(other) => {
                errors.push(format!("workflow must be a string, got {other}"));
                None
            }
        };

        let payload = match obj.get("payload") {
            Some(Value::Object(map)) => Some(map.clone()),
            None | Some(Value::Null) => {
                errors.push("payload is required".to_string());
                None
            }
            Some(other) => {
                errors.push(format!("payload must be an object, got {other}"));
                None
            }
        };

        match (workflow, payload) {
            (Some(workflow), Some(payload)) if errors.is_empty() => {
                Ok(Self { workflow, payload })
            }
            _ => Err(CoreError::Validation(errors.join("; "))),
        }
    }
}
