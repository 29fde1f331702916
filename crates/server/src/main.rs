mod auth;
mod bootstrap;
mod chat;
mod health;
mod oauth;
mod records_api;

use anyhow::Result;
use tracing::info;

use salesnote_core::config::{AppConfig, LoadOptions, LogFormat, LoggingConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_tracing(&config.logging);

    let app = bootstrap::bootstrap_with_config(config).await?;

    let bind_address = format!("{}:{}", app.config.server.host, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!(%bind_address, "http server listening");

    let runner = app.gateway_runner.clone();
    tokio::spawn(async move {
        runner.run().await;
    });

    info!("salesnote server started");
    axum::serve(listener, app.router).with_graceful_shutdown(shutdown_signal()).await?;

    info!("shutting down, draining output worker");
    app.output_worker.stop().await;
    app.db_pool.close().await;
    info!("server exited");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(logging.level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    match logging.format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn shutdown_signal() {
    if let Err(signal_error) = tokio::signal::ctrl_c().await {
        tracing::error!(%signal_error, "failed to listen for shutdown signal");
    }
}
