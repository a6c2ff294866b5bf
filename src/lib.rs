//! # Polling Chat Room Bot
//!
//! An automated participant for web chat rooms that only expose an HTTP JSON
//! API: the bot joins a room, polls the shared conversation feed, enforces
//! chat moderation (rate limits, repeat detection, keyword filtering with
//! escalating sanctions), and answers slash-commands for AI chat and music
//! on demand.
//!
//! ## Features
//!
//! - **Polling Reconciliation**: full-snapshot diffing with bounded-memory
//!   event deduplication; no push transport required
//! - **Moderation Pipeline**: sliding-window rate limiting, repeat-message
//!   detection, keyword filtering, durable per-user violation ledger
//! - **Command Dispatch**: a single parser producing a typed `Command`,
//!   matched exhaustively; admin, AI chat, music and info command groups
//! - **Background Work**: AI calls and delayed warnings run as spawned tasks
//!   that never block the polling loop
//! - **Liveness**: heartbeat file for external watchdog supervision
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pollbot::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BotConfig::load("pollbot.yaml").await?;
//!
//!     let room = Arc::new(HttpRoomClient::new(&config)?);
//!     let providers = Providers::from_config(&config)?;
//!
//!     let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!     tokio::spawn(async move {
//!         tokio::signal::ctrl_c().await.ok();
//!         shutdown_tx.send(true).ok();
//!     });
//!
//!     RoomBot::new(config, room, providers).run(shutdown_rx).await
//! }
//! ```

pub mod bot;
pub mod config;
pub mod providers;
pub mod room;
pub mod types;

// Re-export commonly used items
pub mod prelude {
    pub use crate::bot::{BotControls, Providers, RoomBot};
    pub use crate::config::BotConfig;
    pub use crate::providers::{AiError, AiProvider, MusicProvider, TtsProvider};
    pub use crate::room::{http::HttpRoomClient, RoomClient};
    pub use crate::types::{
        Decision, EventKind, RoomAction, RoomEvent, RoomSnapshot, User,
    };
    pub use anyhow::Result;
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
