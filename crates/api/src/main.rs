//! mcpgate server entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use mcpgate_api::routes::build_router;
use mcpgate_api::{AppState, Config};

#[derive(Debug, Parser)]
#[command(name = "mcpgate", version, about = "Multi-tenant MCP gateway")]
struct Cli {
    /// Listen port (overrides PORT).
    #[arg(long)]
    port: Option<u16>,

    /// Write logs to daily-rotated files in this directory instead of stdout.
    #[arg(long)]
    log_dir: Option<String>,

    /// Enable or disable gzip response compression (overrides ENABLE_GZIP).
    #[arg(long)]
    gzip: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(gzip) = cli.gzip {
        config.enable_gzip = gzip;
    }
    config.log_dir = cli.log_dir;

    // File logging keeps its guard alive for the process lifetime.
    let _log_guard = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mcpgate.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                )
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                )
                .init();
            None
        }
    };

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "mcpgate starting");

    let state = AppState::build(config).await?;

    // Service registration can involve slow backends; bring them up in the
    // background while the HTTP surface starts serving.
    {
        let manager = state.manager.clone();
        tokio::spawn(async move {
            match manager.initialize().await {
                Ok(()) => tracing::info!("service manager initialized"),
                Err(err) => tracing::error!(error = %err, "service manager initialization failed"),
            }
        });
    }

    let port = state.config.port;
    let router = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.manager.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
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

    tracing::info!("shutdown signal received");
}
