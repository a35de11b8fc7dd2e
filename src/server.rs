use chrono::Utc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::Result;
use crate::router::app_router;
use crate::state::AppState;

/// Start the HTTP server and run until Ctrl+C or SIGTERM.
pub async fn start_server(state: AppState) -> Result<()> {
    let address = state.config.bind_address();
    let purge_task = spawn_session_purger(state.clone());
    let app = app_router(state);

    info!("Binding to {}", address);
    let listener = TcpListener::bind(&address).await?;
    info!("Server running on http://{}", address);
    info!("Health check: http://{}/health", address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    purge_task.abort();
    info!("Server shut down");
    Ok(())
}

/// Periodically removes expired sessions.
pub fn spawn_session_purger(state: AppState) -> JoinHandle<()> {
    let period = Duration::from_secs(state.config.session.purge_interval_minutes * 60);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            match state.storage.purge_expired_sessions(Utc::now()).await {
                Ok(0) => {}
                Ok(purged) => info!(purged, "Purged expired sessions"),
                Err(e) => error!("Failed to purge expired sessions: {}", e),
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
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
