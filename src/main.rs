mod api;
mod config;
mod irc;
mod manager;

use crate::config::Config;
use crate::manager::Manager;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (log_tx, _) = tokio::sync::broadcast::channel(256);

    // Initialize logging; the extra layer fans events out to /ws clients
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "xdccd=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(api::WsLogLayer::new(log_tx.clone()))
        .init();

    tracing::info!("Starting xdccd...");

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("XDCCD_CONFIG_FILE").ok())
        .unwrap_or_else(|| "config.json".to_string());
    let config = Arc::new(Config::load(&config_path)?);

    tokio::fs::create_dir_all(&config.default_download_path).await?;

    let (manager, md5_rx) = Manager::new(config.clone());
    tokio::spawn(manager.clone().run_cleanup());
    tokio::spawn(manager.clone().run_md5_worker(md5_rx));

    let state = api::AppState { manager, log_tx };
    let app = axum::Router::new().merge(api::routes()).with_state(state);

    tracing::info!("Listening on {}", config.listen);
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
