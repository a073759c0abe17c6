//! HTTP server implementation.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::service::BridgeService;

use super::routes::routes;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

/// Bind the listener. `host` may be an IP literal (v4 or bare v6) or a hostname.
pub async fn bind(config: &ServerConfig) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?;
    Ok(listener)
}

/// Start the HTTP server with provided service.
pub async fn serve(config: ServerConfig, service: Arc<BridgeService>) -> anyhow::Result<()> {
    let listener = bind(&config).await?;
    serve_on(listener, service).await
}

/// Serve on an already bound listener until a shutdown signal arrives.
pub async fn serve_on(listener: TcpListener, service: Arc<BridgeService>) -> anyhow::Result<()> {
    let shutdown_rx = service.shutdown_rx();
    let app = routes(service.clone());

    let actual_addr = listener.local_addr()?;
    info!("Starting rpclet server on {}", actual_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_rx))
        .await?;

    info!("Server shutdown complete");

    service.shutdown().await;

    Ok(())
}

/// Wait for shutdown signal (SIGTERM, SIGINT, or `BridgeService::trigger_shutdown`).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. That is an unrecoverable
/// runtime configuration error and should fail fast at startup.
async fn shutdown_signal(mut shutdown_rx: watch::Receiver<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler - is tokio runtime configured correctly?");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler - is tokio runtime configured correctly?")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let explicit_shutdown = async {
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = explicit_shutdown => {
            info!("Shutdown requested, shutting down...");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockWorker;

    #[test]
    fn server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
    }

    #[tokio::test]
    async fn bind_resolves_hostnames() {
        let listener = bind(&ServerConfig {
            host: "localhost".to_string(),
            port: 0,
        })
        .await
        .unwrap();
        assert!(listener.local_addr().unwrap().ip().is_loopback());

        let listener = bind(&ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        })
        .await
        .unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn trigger_shutdown_stops_server_and_worker() {
        let (worker, _written) = MockWorker::running();
        let service = Arc::new(BridgeService::new(worker.clone()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let server = tokio::spawn(serve_on(listener, Arc::clone(&service)));
        service.trigger_shutdown();

        tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(worker.stop_count(), 1);
    }
}
