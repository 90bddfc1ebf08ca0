use std::net::SocketAddr;

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pollcast::api::{self, AppState};
use pollcast::broker::Broker;
use pollcast::config::Config;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "pollcast=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::parse();
    tracing::info!(?config, "pollcast starting");

    let broker = Broker::new(config.broker_config());
    let state = AppState {
        broker: broker.clone(),
        long_poll_timeout: config.long_poll_timeout(),
        max_long_poll_timeout: config.max_long_poll_timeout(),
        keep_alive: config.keep_alive(),
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|source| AppError::Bind {
            addr: config.bind,
            source,
        })?;
    tracing::info!(addr = %config.bind, "listening");

    // Shutting the broker down first ends open SSE and websocket streams,
    // which lets the graceful shutdown below complete.
    let signal_broker = broker.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {}", e);
            return;
        }
        tracing::info!("ctrl-c received, shutting down");
        signal_broker.shutdown();
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(broker.shutdown_signal())
        .await
        .map_err(AppError::Serve)?;

    tracing::info!("pollcast stopped");
    Ok(())
}
