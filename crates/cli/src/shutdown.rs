//! Graceful shutdown signal handling.

use tokio::signal;

/// Complete when SIGINT (Ctrl+C) or SIGTERM is received.
pub async fn signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("received SIGINT, shutting down upstream sessions...");
        },
        _ = terminate => {
            log::info!("received SIGTERM, shutting down upstream sessions...");
        },
    }
}
