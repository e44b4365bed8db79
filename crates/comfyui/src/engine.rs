//! High-level engine client: submit a job graph, wait for it to finish,
//! fetch the images it produced.
//!
//! [`EngineClient`] composes a [`ComfyUIApi`] and exposes the job
//! lifecycle as first-class methods. Each job moves through
//! [`JobState`]: `Submitted -> Polling -> {Completed, Failed}`.
//!
//! Completion is detected by polling `/history/{prompt_id}` at a fixed
//! interval. The loop is bounded by an explicit deadline and a
//! [`CancellationToken`]; on either, the prompt is dequeued and the
//! engine interrupted on a best-effort basis.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use comfyrun_core::graph::JobGraph;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::history::{ExecutionFailure, HistoryEntry, OutputImage};

/// Default delay between two `/history` polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Server-assigned identifier correlating a submission with its polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptHandle(String);

impl PromptHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PromptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of one submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Submitted,
    Polling,
    Completed,
    Failed,
}

/// Where generated image bytes are read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Download through the engine's `/view` endpoint.
    Http,
    /// Read `<root>/<subfolder>/<filename>` from a volume shared with
    /// the engine's output directory.
    SharedVolume(PathBuf),
}

/// Tunables for [`EngineClient`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    pub image_source: ImageSource,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            image_source: ImageSource::Http,
        }
    }
}

/// Errors surfaced by the engine client.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// ComfyUI refused the workflow (non-2xx or node validation errors).
    #[error("ComfyUI rejected the workflow ({status}): {body}")]
    Submission { status: u16, body: String },

    /// ComfyUI accepted the workflow but failed while executing it.
    #[error("Execution of prompt {prompt_id} failed: {failure}")]
    Execution {
        prompt_id: String,
        failure: ExecutionFailure,
    },

    /// The deadline passed before the prompt finished.
    #[error("Timed out after {polls} polls waiting for prompt {prompt_id}")]
    Timeout { prompt_id: String, polls: u32 },

    /// The caller cancelled while the prompt was still running.
    #[error("Cancelled while waiting for prompt {prompt_id}")]
    Cancelled { prompt_id: String },

    /// A request/response call failed for a reason other than the above.
    #[error(transparent)]
    Api(#[from] ComfyUIApiError),

    /// An output image could not be read from the shared volume.
    #[error("Failed to read output image {}: {source}", .path.display())]
    OutputRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The engine reported an output reference that cannot be used.
    #[error("Invalid output reference: {0}")]
    InvalidOutput(String),
}

/// Composed ComfyUI client used by the job handler.
#[derive(Debug, Clone)]
pub struct EngineClient {
    api: ComfyUIApi,
    config: EngineConfig,
    /// Sent with every submission so the engine can attribute prompts
    /// to this worker.
    client_id: String,
}

impl EngineClient {
    pub fn new(api: ComfyUIApi, config: EngineConfig) -> Self {
        Self {
            api,
            config,
            client_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn api(&self) -> &ComfyUIApi {
        &self.api
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Queue a job graph. Transient gateway errors are retried by the
    /// API layer; anything left over becomes [`EngineError::Submission`].
    pub async fn submit(&self, graph: &JobGraph) -> Result<PromptHandle, EngineError> {
        let response = match self
            .api
            .submit_workflow(&graph.to_value(), &self.client_id)
            .await
        {
            Ok(response) => response,
            Err(ComfyUIApiError::ApiError { status, body }) => {
                return Err(EngineError::Submission { status, body })
            }
            Err(e) => return Err(e.into()),
        };

        if has_node_errors(&response.node_errors) {
            return Err(EngineError::Submission {
                status: 200,
                body: response.node_errors.to_string(),
            });
        }

        tracing::info!(
            prompt_id = %response.prompt_id,
            queue_position = response.number,
            state = ?JobState::Submitted,
            "Workflow submitted to ComfyUI",
        );

        Ok(PromptHandle(response.prompt_id))
    }

    /// Poll `/history` until the prompt finishes, fails, the deadline
    /// passes or `cancel` fires.
    ///
    /// Polls immediately, then every `poll_interval`. An engine-reported
    /// execution error stops the loop at once. A failed poll request is
    /// logged and the loop keeps going.
    pub async fn await_completion(
        &self,
        handle: &PromptHandle,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<HistoryEntry, EngineError> {
        let prompt_id = handle.as_str();
        let mut polls = 0u32;

        tracing::debug!(prompt_id, state = ?JobState::Polling, "Waiting for completion");

        loop {
            polls += 1;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.abandon(handle, polls, true).await),
                _ = tokio::time::sleep_until(deadline) => return Err(self.abandon(handle, polls, false).await),
                result = self.api.get_history(prompt_id) => result,
            };

            match result {
                Ok(mut history) => {
                    if let Some(entry) = history.remove(prompt_id) {
                        if let Some(failure) = entry.failure() {
                            tracing::error!(
                                prompt_id,
                                polls,
                                state = ?JobState::Failed,
                                node_id = ?failure.node_id,
                                error_type = %failure.exception_type,
                                error_message = %failure.message,
                                "Execution error",
                            );
                            return Err(EngineError::Execution {
                                prompt_id: prompt_id.to_string(),
                                failure,
                            });
                        }
                        if entry.is_complete() {
                            tracing::info!(
                                prompt_id,
                                polls,
                                state = ?JobState::Completed,
                                "Execution completed",
                            );
                            return Ok(entry);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(prompt_id, polls, error = %e, "History poll failed");
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.abandon(handle, polls, true).await),
                _ = tokio::time::sleep_until(deadline) => return Err(self.abandon(handle, polls, false).await),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Read every output image of a finished prompt, in engine order.
    pub async fn fetch_images(&self, entry: &HistoryEntry) -> Result<Vec<Vec<u8>>, EngineError> {
        let images = entry.output_images();
        let mut blobs = Vec::with_capacity(images.len());

        for image in images {
            let bytes = match &self.config.image_source {
                ImageSource::Http => self.api.view_image(image).await?,
                ImageSource::SharedVolume(root) => read_from_volume(root, image).await?,
            };
            tracing::debug!(
                filename = %image.filename,
                subfolder = %image.subfolder,
                bytes = bytes.len(),
                "Fetched output image",
            );
            blobs.push(bytes);
        }

        Ok(blobs)
    }

    /// Submit, wait and fetch in one call.
    pub async fn run(
        &self,
        graph: &JobGraph,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<u8>>, EngineError> {
        let handle = self.submit(graph).await?;
        let entry = self.await_completion(&handle, deadline, cancel).await?;
        self.fetch_images(&entry).await
    }

    // ---- private helpers ----

    /// Best-effort cleanup after giving up on a prompt: remove it from
    /// the queue and interrupt it if it is already running.
    async fn abandon(&self, handle: &PromptHandle, polls: u32, cancelled: bool) -> EngineError {
        let prompt_id = handle.as_str();
        tracing::warn!(
            prompt_id,
            polls,
            cancelled,
            state = ?JobState::Failed,
            "Abandoning prompt",
        );

        if let Err(e) = self.api.cancel_execution(prompt_id).await {
            tracing::warn!(prompt_id, error = %e, "Failed to dequeue prompt");
        }
        if let Err(e) = self.api.interrupt().await {
            tracing::warn!(prompt_id, error = %e, "Failed to interrupt execution");
        }

        let prompt_id = prompt_id.to_string();
        if cancelled {
            EngineError::Cancelled { prompt_id }
        } else {
            EngineError::Timeout { prompt_id, polls }
        }
    }
}

fn has_node_errors(node_errors: &serde_json::Value) -> bool {
    match node_errors {
        serde_json::Value::Null => false,
        serde_json::Value::Object(map) => !map.is_empty(),
        serde_json::Value::Array(arr) => !arr.is_empty(),
        _ => true,
    }
}

/// Read an output image from the shared volume.
///
/// `subfolder` and `filename` come from the engine and must stay within
/// the volume root.
async fn read_from_volume(root: &Path, image: &OutputImage) -> Result<Vec<u8>, EngineError> {
    let relative = Path::new(&image.subfolder).join(&image.filename);
    let contained = !image.filename.is_empty()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !contained {
        return Err(EngineError::InvalidOutput(format!(
            "refusing to read '{}' outside the output volume",
            relative.display()
        )));
    }

    let path = root.join(relative);
    tokio::fs::read(&path)
        .await
        .map_err(|source| EngineError::OutputRead { path, source })
}
