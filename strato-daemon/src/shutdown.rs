//! Graceful shutdown handling for stratod.
//!
//! The control plane never touches fleet VMs on shutdown; in-flight agent
//! operations run to completion on the agent side and are reconciled on the
//! next status query. Shutdown only stops the background loops.

use tokio::signal;
use tracing::info;

/// Wait until the process receives SIGINT or SIGTERM.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C)"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
