use anyhow::Context;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::app::{router, AppState};
use crate::cli::context::build_registry;
use crate::config::AppConfig;
use crate::services::AuthService;

pub async fn handle(config: &AppConfig) -> anyhow::Result<()> {
    info!("Starting Tally API in {:?} mode", config.environment);

    let registry = build_registry(config).await?;
    let report = registry.run_migrations().await.context("master migrations failed")?;
    let failed = report.failed_families();
    if !failed.is_empty() {
        warn!(failed = failed.len(), "Some family databases are not on the latest schema");
    }

    let state = AppState::new(registry.clone(), config.security.bcrypt_cost);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let cleanup = tokio::spawn(session_cleanup(
        state.auth.clone(),
        config.security.session_cleanup_interval_secs,
        shutdown_rx,
    ));

    let app = router(state, config);

    let bind_addr = format!("0.0.0.0:{}", config.api.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;
    info!("Tally API listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = cleanup.await {
        warn!(error = %e, "Session cleanup task ended abnormally");
    }
    registry.close_all().await;
    info!("Server shut down");
    Ok(())
}

/// Periodically purge expired sessions until shutdown.
pub async fn session_cleanup(auth: AuthService, interval_secs: u64, mut shutdown: watch::Receiver<bool>) {
    if interval_secs == 0 {
        info!("Session cleanup disabled (interval_secs=0)");
        return;
    }

    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    // Skip the first immediate tick
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match auth.cleanup_expired_sessions().await {
                    Ok(removed) => info!(removed, "Expired sessions cleaned up"),
                    Err(e) => error!(error = %e, "Session cleanup failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("Session cleanup shutting down");
                    break;
                }
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
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
