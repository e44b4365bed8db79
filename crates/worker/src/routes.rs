//! Local HTTP front door for the job handler.
//!
//! `POST /run` takes a job envelope and always answers 200 with the
//! handler's [`JobOutput`]; failures, malformed bodies included, are
//! reported in-band the same way the serverless harness receives them.
//! `GET /health` is a liveness check for the worker itself.
//!
//! A job runs on its own task. Its deadline starts when the request
//! arrives and also bounds the wait for the job slot, so a dropped
//! request never leaves a prompt running on the engine.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderName;
use axum::routing::{get, post};
use axum::{Json, Router};
use comfyrun_core::error::CoreError;
use serde::Serialize;
use tokio::time::Instant;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::error::JobError;
use crate::output::{JobEnvelope, JobOutput};
use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
}

/// GET /health
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// POST /run
async fn run_job(State(state): State<AppState>, body: Bytes) -> Json<JobOutput> {
    let deadline = Instant::now() + state.handler.job_timeout();

    let job = match serde_json::from_slice::<JobEnvelope>(&body) {
        Ok(job) => job,
        Err(e) => {
            let err = JobError::from(CoreError::Validation(format!("invalid job body: {e}")));
            return Json(state.handler.fail("unparsed", &err));
        }
    };

    // Detached from the request future: the job finishes (or abandons
    // its prompt) even if the caller goes away.
    let handler = state.handler.clone();
    let task = tokio::spawn(run_in_slot(state, job, deadline));
    match task.await {
        Ok(output) => Json(output),
        Err(e) => {
            let err = JobError::from(CoreError::Internal(format!("job task failed: {e}")));
            Json(handler.fail("unknown", &err))
        }
    }
}

/// Wait for the job slot until `deadline`, then run the job.
async fn run_in_slot(state: AppState, job: JobEnvelope, deadline: Instant) -> JobOutput {
    let job_id = job.id.clone().unwrap_or_else(|| "local".to_string());
    let queued_at = Instant::now();

    let acquired = tokio::select! {
        acquired = state.job_slot.clone().acquire_owned() => acquired,
        _ = tokio::time::sleep_until(deadline) => {
            let err = JobError::SlotTimeout(queued_at.elapsed());
            return state.handler.fail(&job_id, &err);
        }
    };
    let Ok(_permit) = acquired else {
        let err = CoreError::Internal("job slot closed, worker is shutting down".to_string());
        return state.handler.fail(&job_id, &err.into());
    };

    let cancel = state.shutdown.child_token();
    state.handler.handle_until(job, deadline, &cancel).await
}

/// Build the application [`Router`] with its middleware stack.
///
/// Layers, applied bottom-up: request ID, tracing, request ID
/// propagation, panic recovery. There is no request timeout layer:
/// `/run` is bounded by the job deadline instead.
pub fn build_router(state: AppState) -> Router {
    let request_id_header = HeaderName::from_static("x-request-id");

    Router::new()
        .route("/health", get(health_check))
        .route("/run", post(run_job))
        .layer(CatchPanicLayer::new())
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .with_state(state)
}
