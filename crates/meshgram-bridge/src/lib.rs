//! Meshtastic ↔ chat bridge
//!
//! This crate relays text between a Meshtastic LoRa mesh, reached over the
//! radio's TCP stream API, and a single chat conversation on a bot-style
//! chat service.
//!
//! # Architecture
//!
//! The bridge is built from small components:
//!
//! 1. **Interface** - [`MeshConnector`]/[`MeshLink`] traits and the TCP stream
//!    implementation (0x94C3 framing, protobuf messages)
//! 2. **Connection** - [`ConnectionManager`] owns the link, reconnects with
//!    backoff and honours manual disconnects
//! 3. **Relay state** - [`CorrelationStore`] threads replies across the two
//!    sides, [`NodeDirectory`] maps short names to node numbers
//! 4. **Policy** - [`Segmenter`] splits long text, [`AutoReplyEngine`]
//!    answers keywords
//! 5. **Orchestration** - [`MeshgramBridge`] routes events, stages outbound
//!    chat text behind a confirmation and runs the control timers
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use meshgram_bridge::{MeshgramBridge, MeshgramConfig, TcpMeshConnector};
//! use std::sync::Arc;
//!
//! let config = MeshgramConfig::load("config.json")?;
//! let chat: Arc<dyn ChatClient> = Arc::new(my_chat_client);
//! let (bridge, packets) = MeshgramBridge::new(&config, Arc::new(TcpMeshConnector::default()), chat);
//!
//! Arc::new(bridge).run(packets, chat_events, shutdown_signal).await;
//! ```
//!
//! # Message Flow
//!
//! ## Mesh → chat
//!
//! 1. The link decodes a text packet and the connection forwarder queues it
//! 2. Broadcasts and allow-listed private messages are mirrored into the chat
//! 3. The mesh id ↔ mirror id pair is recorded
//! 4. Keyword messages get an auto-reply on the mesh
//!
//! ## Chat → mesh
//!
//! 1. Text (or `/pm`) is staged and a confirmation prompt is posted
//! 2. Accept transmits it, split into numbered parts when too long
//! 3. A chat reply to a mirrored message becomes a mesh reply to the original
//!
//! # Features
//!
//! - `tcp` - TCP stream interface (default)

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Core modules
pub mod config;
pub mod error;
pub mod interface;

// Relay state and policy
pub mod auto_reply;
pub mod correlation;
pub mod directory;
pub mod segment;

// Chat side
pub mod chat;
pub mod command;

// Orchestration
pub mod bridge;
pub mod connection;

// Testing utilities
pub mod test_utils;

// Re-exports for convenience
pub use config::{
    BackoffPolicy, ChatConfig, ConfigWatcher, HopRange, HotConfig, MeshAddress, MeshConfig,
    MeshgramConfig, MeshgramConfigBuilder, ReconnectConfig, ReplyConfig,
};
pub use error::{BridgeError, ErrorKind, Result};
pub use interface::{
    ConnectionState, KnownNode, MeshConnector, MeshLink, MeshPacket, ModemPreset, OutgoingText,
};

#[cfg(feature = "tcp")]
pub use interface::{TcpMeshConnector, TcpMeshLink};

pub use auto_reply::{AutoReplyDecision, AutoReplyEngine, ReplyPlan, SenderInfo, SkipCause};
pub use correlation::{CorrelationRecord, CorrelationStore};
pub use directory::NodeDirectory;
pub use segment::Segmenter;

pub use chat::{ChatClient, ChatEvent, ChatMessageId, ConversationId, RetryPolicy};
pub use command::{CallbackAction, Command};

pub use bridge::{BridgeStats, MeshgramBridge, PendingConfirmation, TransmitFailure};
pub use connection::{ConnectionManager, ConnectionStatus, ReconnectOutcome, SkipReason};

pub use test_utils::{MockChatClient, MockMeshConnector, MockMeshLink};

// Protocol constants re-exports
pub use config::{
    BROADCAST_NODE, DEFAULT_MESH_PORT, DEFAULT_TIMEOUT_MS, LORA_MAX_PAYLOAD,
    MAX_BYTES_PER_MESSAGE, MESHTASTIC_MAGIC, MESSAGE_SPLIT_DELAY,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_constants() {
        assert_eq!(MESHTASTIC_MAGIC, 0x94C3);
        assert_eq!(LORA_MAX_PAYLOAD, 237);
        assert_eq!(DEFAULT_MESH_PORT, 4403);
        assert!(MAX_BYTES_PER_MESSAGE < LORA_MAX_PAYLOAD);
    }
}
