use anyhow::Result;
use log::{error, info};
use std::sync::Arc;

use pollbot::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables and initialize logging
    dotenv::dotenv().ok();
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("Starting pollbot v{}", pollbot::VERSION);

    let config = BotConfig::load("pollbot.yaml").await?;

    if config.room_id.is_empty() {
        error!("No room configured: set room_id in pollbot.yaml or POLLBOT_ROOM_ID");
        return Err(anyhow::anyhow!("missing room id"));
    }
    if config.cookie.is_empty() {
        error!("No session cookie configured: set cookie in pollbot.yaml or POLLBOT_COOKIE");
        return Err(anyhow::anyhow!("missing session cookie"));
    }

    let room = Arc::new(HttpRoomClient::new(&config)?);
    let providers = Providers::from_config(&config)?;
    let bot = RoomBot::new(config, room, providers);

    // Ctrl-C flips the shutdown signal; the loop flushes state and drains
    // queued replies before returning.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown signal received");
        shutdown_tx.send(true).ok();
    });

    bot.run(shutdown_rx).await
}
