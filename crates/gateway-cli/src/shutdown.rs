//! Graceful shutdown sequence (§5): stop admitting new connections,
//! close every live session, flush the audit log queue (bounded to
//! 10s), then close every server context.

use std::time::Duration;

use gateway_types::CloseReason;
use tracing::info;

use crate::context::AppContext;

const LOG_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves once either a ctrl-c or (on unix) a SIGTERM is received;
/// `axum::serve(...).with_graceful_shutdown(...)` awaits this future to
/// stop admitting new connections.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}

/// Runs after the HTTP listener has stopped accepting new connections
/// (§5 steps 2-5): closes every live session, flushes the log queue,
/// then tears down every server context.
pub async fn run(context: AppContext) {
    let sessions = context.sessions.all_sessions();
    info!(count = sessions.len(), "closing live sessions");
    for session in sessions {
        session.close(CloseReason::ServerShutdown);
    }

    info!("flushing audit log queue");
    gateway_store::log_queue::shutdown_and_flush(context.log_queue, context.log_worker, LOG_FLUSH_TIMEOUT).await;

    info!("closing server contexts");
    context.servers.shutdown().await;

    info!("shutdown complete");
}
