use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use proxy_panel::config::{config_path_from_env, PanelConfig};
use proxy_panel::service::ServiceController;
use proxy_panel::{router, AppState, PanelConfigStore, SystemServiceController};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // --- Configuration ---
    let config_path = config_path_from_env();
    let loaded = PanelConfig::read(&config_path).await;
    let verbose = loaded.as_ref().map_or(true, |config| config.logging);

    // --- Tracing ---
    let default_filter = if verbose {
        "proxy_panel=info,tower_http=info"
    } else {
        "warn"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(error = %e, path = %config_path.display(), "Writing default panel config");
            let config = PanelConfig::default();
            config.write(&config_path).await?;
            config
        }
    };
    let port = config.listen_port();
    tracing::info!(path = %config_path.display(), port, "Loaded panel configuration");

    // --- Services ---
    let proxy: Arc<dyn ServiceController> =
        Arc::new(SystemServiceController::new(&config.services.proxy_service)?);
    let panel: Arc<dyn ServiceController> =
        Arc::new(SystemServiceController::new(&config.services.panel_service)?);

    let config = Arc::new(PanelConfigStore::new(config_path, config));
    let state = AppState::new(config, proxy, panel).await;

    // --- Snapshot job ---
    let snapshots = state.snapshots.clone();
    let cancel = CancellationToken::new();
    let snapshot_handle = tokio::spawn(snapshots.clone().run(cancel.clone()));

    // --- Server ---
    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Panel listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // --- Post-shutdown cleanup ---
    cancel.cancel();
    if tokio::time::timeout(SHUTDOWN_GRACE, snapshot_handle)
        .await
        .is_err()
    {
        tracing::warn!("Snapshot job did not stop in time");
    }
    if let Err(e) = snapshots.remove().await {
        tracing::warn!(error = %e, "Failed to remove session snapshot");
    }

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
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
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
