use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use rpclet::config::Cli;
use rpclet::transport::serve;
use rpclet::{BridgeService, CommandSpawner};

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise `RPCLET_LOG` picks the level.
/// `LOG_FORMAT=json` switches to structured JSON lines. Always writes to
/// stderr.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("RPCLET_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        EnvFilter::new(format!("rpclet={level}", level = base_level))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting rpclet");

    let service = BridgeService::launch(&cli.worker_config(), &CommandSpawner)?
        .with_request_timeout(cli.request_timeout());
    let service = Arc::new(service);

    if cli.exit_on_worker_exit {
        let weak = Arc::downgrade(&service);
        service.worker().on_exit(Box::new(move |exit| {
            if let Some(service) = weak.upgrade() {
                tracing::error!(%exit, "Worker exited, shutting down");
                service.trigger_shutdown();
            }
        }));
    }

    serve(cli.server_config(), service).await
}
