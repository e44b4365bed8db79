use std::error::Error as StdError;
use std::time::Duration;

use comfyrun_comfyui::api::ComfyUIApiError;
use comfyrun_comfyui::engine::EngineError;
use comfyrun_core::error::CoreError;
use serde::{Deserialize, Serialize};

/// Machine-readable classification of a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "VALIDATION_ERROR")]
    Validation,
    #[serde(rename = "NOT_FOUND")]
    NotFound,
    #[serde(rename = "SUBMISSION_ERROR")]
    Submission,
    #[serde(rename = "EXECUTION_ERROR")]
    Execution,
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[serde(rename = "CANCELLED")]
    Cancelled,
    #[serde(rename = "ENGINE_ERROR")]
    Engine,
    #[serde(rename = "INTERNAL_ERROR")]
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Submission => "SUBMISSION_ERROR",
            Self::Execution => "EXECUTION_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::Engine => "ENGINE_ERROR",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    /// Whether the harness should recycle this worker after the failure.
    ///
    /// Only rejected input keeps the worker; anything raised while
    /// handling an accepted job, missing templates included, asks for a
    /// fresh one.
    pub fn refresh_worker(self) -> bool {
        !matches!(self, Self::Validation)
    }
}

/// Any failure while handling one job.
///
/// Wraps the layer errors unchanged so their source chain survives into
/// the error result's `details`.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Input, template or graph problem from `comfyrun_core`.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Failure talking to or reported by ComfyUI.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The job's deadline passed while it was queued behind another job.
    #[error("Timed out after {0:?} waiting for the job slot")]
    SlotTimeout(Duration),
}

impl JobError {
    pub fn code(&self) -> ErrorCode {
        match self {
            JobError::Core(core) => match core {
                CoreError::Validation(_) => ErrorCode::Validation,
                CoreError::NotFound { .. } => ErrorCode::NotFound,
                CoreError::Internal(_) => ErrorCode::Internal,
            },
            JobError::Engine(engine) => match engine {
                EngineError::Submission { .. } => ErrorCode::Submission,
                EngineError::Execution { .. } => ErrorCode::Execution,
                EngineError::Timeout { .. } => ErrorCode::Timeout,
                EngineError::Cancelled { .. } => ErrorCode::Cancelled,
                EngineError::Api(ComfyUIApiError::Request(_))
                | EngineError::Api(ComfyUIApiError::ApiError { .. })
                | EngineError::InvalidOutput(_) => ErrorCode::Engine,
                EngineError::OutputRead { .. } => ErrorCode::Internal,
            },
            JobError::SlotTimeout(_) => ErrorCode::Timeout,
        }
    }

    pub fn refresh_worker(&self) -> bool {
        self.code().refresh_worker()
    }

    /// The error and every `source()` below it, outermost first.
    pub fn chain(&self) -> Vec<String> {
        let mut chain = vec![self.to_string()];
        let mut current: Option<&(dyn StdError + 'static)> = self.source();
        while let Some(err) = current {
            let message = err.to_string();
            if chain.last() != Some(&message) {
                chain.push(message);
            }
            current = err.source();
        }
        chain
    }
}
