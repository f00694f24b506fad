use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use salond::engine::Engine;
use salond::notify::NotificationDispatcher;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("SALON_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    salond::observability::init(metrics_port)?;

    let port = std::env::var("SALON_PORT").unwrap_or_else(|_| "8080".into());
    let bind = std::env::var("SALON_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let data_dir = std::env::var("SALON_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let compact_threshold: u64 = std::env::var("SALON_COMPACT_THRESHOLD")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);
    let admin_email = std::env::var("SALON_ADMIN_EMAIL")
        .ok()
        .filter(|s| !s.trim().is_empty());

    // Ensure data directory exists
    std::fs::create_dir_all(&data_dir)?;

    let notifier = Arc::new(NotificationDispatcher::logging(admin_email.clone()));
    let engine = Arc::new(Engine::new(PathBuf::from(&data_dir).join("salon.wal"), notifier)?);

    let compactor = engine.clone();
    tokio::spawn(async move {
        salond::reaper::run_compactor(compactor, compact_threshold).await;
    });

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("salond listening on {addr}");
    info!("  data_dir: {data_dir}");
    info!("  compact_threshold: {compact_threshold}");
    info!("  admin_email: {}", admin_email.as_deref().unwrap_or("none"));
    info!("  metrics: {}", metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    axum::serve(listener, salond::http::router(engine))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("salond stopped");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("failed to register SIGTERM handler: {e}");
                ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
    info!("shutdown signal received, draining connections");
}
