use anyhow::Context;
use comfyrun_comfyui::readiness::wait_for_service;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use comfyrun_worker::config::{LogFormat, WorkerConfig};
use comfyrun_worker::handler::JobHandler;
use comfyrun_worker::routes::build_router;
use comfyrun_worker::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Configuration ---
    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;

    // --- Tracing ---
    init_tracing(config.log_format);
    tracing::info!(
        comfyui_url = %config.comfyui_url,
        workflow_dir = %config.workflow_dir.display(),
        output_volume = ?config.output_volume,
        job_timeout_secs = config.job_timeout.as_secs(),
        "Loaded worker configuration",
    );

    // --- Shared HTTP client ---
    let client = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()
        .context("Failed to build HTTP client")?;
    let handler = JobHandler::from_config(&config, client);

    // --- Shutdown wiring ---
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    // --- Readiness gate ---
    let ready = wait_for_service(
        handler.engine().api(),
        &config.readiness_config(),
        &shutdown,
    )
    .await;
    if !ready {
        tracing::info!("Shut down before ComfyUI became ready");
        return Ok(());
    }

    // --- Front door ---
    let state = AppState::new(handler, shutdown.clone());
    let job_slot = state.job_slot.clone();
    let app = build_router(state);

    let addr = config.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    tracing::info!(%addr, "Worker listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            // Queued requests are answered instead of starting new jobs.
            job_slot.close();
        })
        .await
        .context("Server error")?;

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "comfyrun_worker=info,comfyrun_comfyui=info,comfyrun_core=info,tower_http=info".into()
    });
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Wait for a termination signal.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix) so the worker
/// stops cleanly whether run interactively or by a container runtime.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
