//! Job handler: turn one harness job into images or a structured error.
//!
//! Pipeline per job:
//!
//! 1. Validate the raw input into a [`JobRequest`].
//! 2. Build the job graph: load and inject a template, or take a custom
//!    graph from the payload as-is.
//! 3. Submit, wait for completion within `job_timeout`, fetch images.
//! 4. Base64-encode the images.
//!
//! Every failure along the way becomes a [`JobOutput::Error`].

use std::time::Duration;

use comfyrun_comfyui::api::ComfyUIApi;
use comfyrun_comfyui::engine::EngineClient;
use comfyrun_core::graph::JobGraph;
use comfyrun_core::injection::inject;
use comfyrun_core::job::JobRequest;
use comfyrun_core::templates::WorkflowStore;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::JobError;
use crate::output::{JobEnvelope, JobOutput};

/// Handles jobs against one ComfyUI instance.
#[derive(Debug, Clone)]
pub struct JobHandler {
    store: WorkflowStore,
    engine: EngineClient,
    job_timeout: Duration,
    include_error_details: bool,
}

impl JobHandler {
    pub fn new(
        store: WorkflowStore,
        engine: EngineClient,
        job_timeout: Duration,
        include_error_details: bool,
    ) -> Self {
        Self {
            store,
            engine,
            job_timeout,
            include_error_details,
        }
    }

    /// Wire up a handler from configuration, sharing `client`'s
    /// connection pool.
    pub fn from_config(config: &WorkerConfig, client: reqwest::Client) -> Self {
        let api = ComfyUIApi::with_client(client, config.comfyui_url.clone(), config.retry_config());
        Self::new(
            WorkflowStore::new(config.workflow_dir.clone()),
            EngineClient::new(api, config.engine_config()),
            config.job_timeout,
            config.include_error_details,
        )
    }

    pub fn engine(&self) -> &EngineClient {
        &self.engine
    }

    pub fn job_timeout(&self) -> Duration {
        self.job_timeout
    }

    pub fn include_error_details(&self) -> bool {
        self.include_error_details
    }

    /// Run one job to completion within `job_timeout`. Never fails:
    /// errors are returned as [`JobOutput::Error`].
    pub async fn handle(&self, job: JobEnvelope, cancel: &CancellationToken) -> JobOutput {
        self.handle_until(job, Instant::now() + self.job_timeout, cancel)
            .await
    }

    /// Like [`JobHandler::handle`], against a deadline fixed by the caller
    /// (e.g. when the job arrived rather than when it started).
    pub async fn handle_until(
        &self,
        job: JobEnvelope,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> JobOutput {
        let job_id = job.id.unwrap_or_else(|| "local".to_string());
        let started = Instant::now();
        tracing::info!(job_id = %job_id, "Job received");

        match self.process(job.input, deadline, cancel).await {
            Ok(blobs) => {
                tracing::info!(
                    job_id = %job_id,
                    images = blobs.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Job completed",
                );
                JobOutput::from_images(&blobs)
            }
            Err(err) => self.fail(&job_id, &err),
        }
    }

    /// Log `err` for `job_id` and turn it into an error result.
    pub fn fail(&self, job_id: &str, err: &JobError) -> JobOutput {
        let code = err.code();
        if code.refresh_worker() {
            tracing::error!(job_id, code = code.as_str(), error = %err, "Job failed");
        } else {
            tracing::warn!(job_id, code = code.as_str(), error = %err, "Job rejected");
        }
        JobOutput::from_error(err, self.include_error_details)
    }

    /// Resolve a validated request into the graph to submit.
    ///
    /// Template workflows get the full structural check after injection;
    /// custom graphs only need their references to resolve.
    pub fn prepare(&self, request: JobRequest) -> Result<JobGraph, JobError> {
        let workflow = request.workflow.resolve();

        let Some(template_name) = workflow.template_name() else {
            let graph = JobGraph::from_value(&Value::Object(request.payload))?;
            graph.validate_references()?;
            tracing::debug!(nodes = graph.len(), "Using custom workflow");
            return Ok(graph);
        };

        let template = self.store.load(template_name)?;
        let params = template.injection.resolve(&request.payload)?;
        let graph = inject(&template.graph, &template.injection, &params)?;
        graph.validate()?;

        tracing::debug!(
            template = %template.name,
            parameters = params.len(),
            "Injected parameters into template",
        );
        Ok(graph)
    }

    async fn process(
        &self,
        input: Value,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<u8>>, JobError> {
        let request = JobRequest::from_input(&input)?;
        let graph = self.prepare(request)?;

        Ok(self.engine.run(&graph, deadline, cancel).await?)
    }
}
