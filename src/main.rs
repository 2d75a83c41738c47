use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use staff_dispatch::config::Config;
use staff_dispatch::engine::Engine;
use staff_dispatch::http::{self, AppState};
use staff_dispatch::notify::{LogTransport, NotificationQueue};
use staff_dispatch::outbox::Outbox;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    staff_dispatch::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let verifier = config.token_verifier()?;
    if verifier.is_empty() {
        tracing::warn!("no API tokens configured, every authenticated request will be rejected");
    }

    let engine = Arc::new(Engine::new(config.wal_path())?);
    let outbox = Outbox::open(&config.outbox_path())?;
    let notifications = Arc::new(NotificationQueue::start(
        config.notify.clone(),
        Arc::new(LogTransport),
        outbox,
    ));

    tokio::spawn(staff_dispatch::compactor::run_compactor(
        engine.clone(),
        config.compact_threshold,
        config.compact_interval,
    ));

    let app = http::router(AppState {
        engine,
        notifications: notifications.clone(),
        verifier: Arc::new(verifier),
    });

    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("staff-dispatch listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  notify workers: {}", config.notify.workers);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, let in-flight requests finish
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    info!("draining notification queue...");
    notifications.shutdown().await;
    info!("staff-dispatch stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
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
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    info!("shutdown signal received");
}
