//! rohrpost-server — HTTP ingestion API.
//!
//! Accepts JSON payloads on `POST /ingest` and publishes them durably to
//! the ingestion queue for asynchronous processing by worker processes.

mod api;
mod router;
mod startup;
mod state;

use std::sync::Arc;

use tracing::info;

use rohrpost_queue::{AmqpBackend, QueueBackend};

use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    rohrpost_core::config::load_dotenv();
    let config = rohrpost_core::Config::from_env();
    config.log_summary();

    let backend: Arc<dyn QueueBackend> = Arc::new(AmqpBackend::new(config.broker.clone()));
    startup::probe_broker(backend.as_ref()).await;

    let state = Arc::new(AppState::new(backend));
    let app = router::build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server exited cleanly");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for ctrl_c");
    }
}
