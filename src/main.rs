use hls_packager::adapters::http;
use hls_packager::{Config, TokioProcessRunner, TranscodeEngine};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Config::from_env()?;

    let runner = Arc::new(TokioProcessRunner::new(config.engine.kill_grace));
    let engine = Arc::new(TranscodeEngine::start(config.engine, runner)?);

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", config.addr, config.port)).await?;
    info!(addr = %config.addr, port = %config.port, "listening");

    let served = axum::serve(listener, http::router(engine.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("shutting down, cancelling outstanding jobs");
    engine.shutdown().await;
    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
