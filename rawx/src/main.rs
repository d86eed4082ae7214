use std::sync::Arc;

use clap::Parser;
use rawx::api;
use rawx::config::RawxConfig;
use rawx::utils::cli::Args;
use rawx::utils::logging::{self, ERROR_TARGET};
use rawx::utils::state::AppState;
use std::net::SocketAddr;
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    logging::init(args.access_log.as_deref(), args.error_log.as_deref())?;
    let config = validate_config(&args);

    if let Err(e) = serve(config).await {
        tracing::error!(target: ERROR_TARGET, "{e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn serve(config: RawxConfig) -> anyhow::Result<()> {
    let addr = config.addr.clone();
    let state = Arc::new(AppState::open(config).await?);
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
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

    tracing::info!("shutting down...");
}

fn validate_config(args: &Args) -> RawxConfig {
    match RawxConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(target: ERROR_TARGET, "{e}");
            std::process::exit(1);
        }
    }
}
