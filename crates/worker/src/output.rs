//! Wire shapes exchanged with the job harness.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorCode, JobError};

/// A job as delivered by the harness: `{id?, input}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobEnvelope {
    #[serde(default)]
    pub id: Option<String>,
    /// Raw job input, validated by the handler.
    #[serde(default)]
    pub input: Value,
}

/// Result of one job. Errors are reported in-band, never raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutput {
    Ok {
        /// Base64 (standard alphabet, padded) image payloads in engine order.
        images: Vec<String>,
    },
    Error {
        message: String,
        code: ErrorCode,
        refresh_worker: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Vec<String>>,
    },
}

impl JobOutput {
    pub fn from_images(blobs: &[Vec<u8>]) -> Self {
        JobOutput::Ok {
            images: encode_images(blobs),
        }
    }

    pub fn from_error(err: &JobError, include_details: bool) -> Self {
        let code = err.code();
        JobOutput::Error {
            message: err.to_string(),
            code,
            refresh_worker: code.refresh_worker(),
            details: include_details.then(|| err.chain()),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, JobOutput::Ok { .. })
    }
}

pub fn encode_images(blobs: &[Vec<u8>]) -> Vec<String> {
    blobs.iter().map(|blob| STANDARD.encode(blob)).collect()
}
