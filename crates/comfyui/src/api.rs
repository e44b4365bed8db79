//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the ComfyUI HTTP API (workflow submission, cancellation,
//! interruption, history and image retrieval, liveness) using
//! [`reqwest`]. Request/response calls go through a [`RetryConfig`];
//! history polling and liveness checks are single-shot because their
//! callers loop on their own.

use reqwest::{Method, RequestBuilder};
use serde::Deserialize;

use crate::history::{History, OutputImage};
use crate::retry::RetryConfig;

/// HTTP client for a single ComfyUI instance.
#[derive(Debug, Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
    retry: RetryConfig,
}

/// Response returned by the ComfyUI `/prompt` endpoint after
/// successfully queuing a workflow.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i64,
    /// Per-node validation errors. Empty when the prompt was accepted.
    #[serde(default)]
    pub node_errors: serde_json::Value,
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance with the default
    /// retry policy.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://127.0.0.1:8188`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url, RetryConfig::default())
    }

    /// Create an API client reusing an existing [`reqwest::Client`]
    /// (shares its connection pool and timeouts).
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>, retry: RetryConfig) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            api_url,
            retry,
        }
    }

    /// HTTP API base URL, without a trailing slash.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Submit a workflow for execution.
    ///
    /// Sends a `POST /prompt` request with the given workflow JSON and
    /// client ID. Returns the server-assigned `prompt_id` and queue
    /// position.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let request = self.client.post(self.url("/prompt")).json(&body);
        let response = self.execute(Method::POST, request, &self.retry).await?;

        Self::parse_response(response).await
    }

    /// Cancel a queued execution.
    ///
    /// Sends a `POST /queue` request asking ComfyUI to delete the
    /// specified prompt from the queue.
    pub async fn cancel_execution(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        let body = serde_json::json!({
            "delete": [prompt_id],
        });

        let request = self.client.post(self.url("/queue")).json(&body);
        let response = self.execute(Method::POST, request, &self.retry).await?;

        Self::check_status(response).await
    }

    /// Interrupt the currently running execution immediately.
    ///
    /// Sends a `POST /interrupt` request. This does not target a
    /// specific prompt -- it interrupts whatever is executing right now.
    pub async fn interrupt(&self) -> Result<(), ComfyUIApiError> {
        let request = self.client.post(self.url("/interrupt"));
        let response = self.execute(Method::POST, request, &self.retry).await?;

        Self::check_status(response).await
    }

    /// Retrieve execution history for a specific prompt.
    ///
    /// Sends a single `GET /history/{prompt_id}` request. The body is
    /// `{}` until the prompt finishes.
    pub async fn get_history(&self, prompt_id: &str) -> Result<History, ComfyUIApiError> {
        let response = self
            .client
            .get(self.url(&format!("/history/{prompt_id}")))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Download an output image via `GET /view`.
    pub async fn view_image(&self, image: &OutputImage) -> Result<Vec<u8>, ComfyUIApiError> {
        let request = self.client.get(self.url("/view")).query(&[
            ("filename", image.filename.as_str()),
            ("subfolder", image.subfolder.as_str()),
            ("type", image.kind.as_str()),
        ]);
        let response = self.execute(Method::GET, request, &self.retry).await?;
        let response = Self::ensure_success(response).await?;

        Ok(response.bytes().await?.to_vec())
    }

    /// Liveness check: a single `GET /system_stats`.
    pub async fn system_stats(&self) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self.client.get(self.url("/system_stats")).send().await?;

        Self::parse_response(response).await
    }

    // ---- private helpers ----

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    /// Send a request, retrying transient failures per `retry`.
    ///
    /// Returns the last response even if its status is a retryable
    /// error, so callers report the real status and body.
    async fn execute(
        &self,
        method: Method,
        request: RequestBuilder,
        retry: &RetryConfig,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let max_attempts = retry.max_attempts();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let Some(this_attempt) = request.try_clone() else {
                // Streaming bodies cannot be replayed.
                return Ok(request.send().await?);
            };

            match this_attempt.send().await {
                Ok(resp)
                    if attempt < max_attempts && retry.should_retry_status(&method, resp.status()) =>
                {
                    tracing::warn!(
                        status = resp.status().as_u16(),
                        attempt,
                        max_attempts,
                        "Transient ComfyUI response, retrying",
                    );
                }
                Ok(resp) => return Ok(resp),
                Err(e) if attempt < max_attempts && retry.should_retry_error(&method, &e) => {
                    tracing::warn!(
                        error = %e,
                        attempt,
                        max_attempts,
                        "ComfyUI connection failed, retrying",
                    );
                }
                Err(e) => return Err(e.into()),
            }

            tokio::time::sleep(retry.backoff_delay(attempt)).await;
        }
    }

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    /// Assert the response has a success status code, discarding the body.
    async fn check_status(response: reqwest::Response) -> Result<(), ComfyUIApiError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}
