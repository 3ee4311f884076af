//! Meshgram Node - Meshtastic ↔ Telegram bridge daemon
//!
//! This binary runs the bridge with:
//! - a TCP stream link to the Meshtastic radio
//! - Telegram Bot API long polling for the chat side
//! - the JSON configuration file, persisted and hot-reloaded

mod telegram;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use meshgram_bridge::{ConfigWatcher, MeshgramBridge, MeshgramConfig, TcpMeshConnector};
use telegram::TelegramClient;

/// Queue depth between the update poller and the bridge
const CHAT_EVENT_CAPACITY: usize = 64;

#[derive(Parser)]
#[command(name = "meshgram-node")]
#[command(about = "Bridge between a Meshtastic mesh and a Telegram chat")]
struct Args {
    /// Configuration file
    #[arg(long, short, default_value = "config.json")]
    config: PathBuf,

    /// Override the radio host
    #[arg(long)]
    host: Option<String>,

    /// Override the radio port
    #[arg(long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = MeshgramConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(host) = args.host {
        config.mesh.host = host;
    }
    if let Some(port) = args.port {
        config.mesh.port = port;
    }
    config.validate()?;

    let token = config
        .chat
        .token
        .clone()
        .filter(|token| !token.trim().is_empty())
        .context("chat.token is required")?;

    info!("Starting Meshgram Node {}", meshgram_bridge::VERSION);
    info!("Radio: {}", config.mesh.address());
    match config.chat.chat_id {
        Some(chat_id) => info!("Bound chat: {}", chat_id),
        None => warn!("No chat bound yet; the first chat to message the bot will be bound"),
    }

    let telegram = Arc::new(TelegramClient::new(&token, config.chat.api_timeout)?);
    let connector = Arc::new(TcpMeshConnector::new(config.mesh.connect_timeout));

    let (bridge, packets) = MeshgramBridge::new(&config, connector, telegram.clone());
    let bridge = Arc::new(bridge.with_config_file(ConfigWatcher::new(&args.config)));

    let (chat_tx, chat_rx) = mpsc::channel(CHAT_EVENT_CAPACITY);
    let poller = tokio::spawn(telegram.poll_updates(chat_tx, config.chat.poll_timeout));

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };
    bridge.run(packets, chat_rx, shutdown).await;

    poller.abort();
    info!("Meshgram Node stopped");
    Ok(())
}
