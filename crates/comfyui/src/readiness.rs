//! Startup gate: wait until the ComfyUI HTTP API answers.
//!
//! The worker and the engine boot side by side, so the engine is
//! usually not listening yet when the worker starts. Before accepting
//! any job the worker calls [`wait_for_service`], which polls
//! `/system_stats` at a fixed interval until it succeeds or the
//! [`CancellationToken`] is triggered.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::api::ComfyUIApi;

/// Tunable parameters for the readiness check.
#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    /// Delay between two attempts.
    pub interval: Duration,
    /// Log a "not ready" line only every `log_every` failed attempts.
    pub log_every: u32,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            log_every: 15,
        }
    }
}

/// Whether failed attempt number `attempt` (1-indexed) should be logged.
pub fn should_log(attempt: u32, config: &ReadinessConfig) -> bool {
    config.log_every > 0 && attempt % config.log_every == 0
}

/// Poll the engine until it responds successfully.
///
/// Returns `true` once the engine is reachable, or `false` if `cancel`
/// is triggered first. Failed attempts are never surfaced as errors.
pub async fn wait_for_service(
    api: &ComfyUIApi,
    config: &ReadinessConfig,
    cancel: &CancellationToken,
) -> bool {
    let mut attempt = 0u32;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(attempt, "Readiness wait cancelled");
                return false;
            }
            result = api.system_stats() => {
                match result {
                    Ok(_) => {
                        tracing::info!(
                            api_url = %api.api_url(),
                            failed_attempts = attempt,
                            "ComfyUI API is ready",
                        );
                        return true;
                    }
                    Err(e) => {
                        attempt = attempt.saturating_add(1);
                        if should_log(attempt, config) {
                            tracing::info!(
                                api_url = %api.api_url(),
                                attempt,
                                error = %e,
                                "Service not ready yet. Retrying...",
                            );
                        }
                    }
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(config.interval) => {}
        }
    }
}
