use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::handler::JobHandler;

/// Shared state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable: everything is behind `Arc` or is already a handle.
#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<JobHandler>,
    /// Single permit: the engine runs one job at a time.
    pub job_slot: Arc<Semaphore>,
    /// Process-wide token; each job runs under a child of it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(handler: JobHandler, shutdown: CancellationToken) -> Self {
        Self {
            handler: Arc::new(handler),
            job_slot: Arc::new(Semaphore::new(1)),
            shutdown,
        }
    }
}
