use anyhow::Context;
use manager::{handlers, ManagerConfig, TaskManager};
use tokio::net::TcpListener;
use tracing::info;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "manager=debug,tower_http=info,axum=info".into()),
        )
        .init();

    let config = ManagerConfig::from_env();
    let manager = TaskManager::start(config).context("no se pudo preparar el spool de tareas")?;

    // router HTTP
    let app = handlers::build_router(manager.clone());

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("no se pudo escuchar en {addr}"))?;
    info!("manager escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("servidor HTTP")?;

    let report = manager.shutdown().await;
    info!(
        "manager detenido ({} canceladas, {} forzadas)",
        report.canceled, report.forced
    );
    Ok(())
}

/// Espera SIGINT o SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("SIGINT recibido"),
        _ = terminate => info!("SIGTERM recibido"),
    }
}
