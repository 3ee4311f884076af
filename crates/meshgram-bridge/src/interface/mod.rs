//! Mesh radio interface
//!
//! The bridge talks to the radio through two traits:
//!
//! - [`MeshConnector`] opens a link to a radio at a [`MeshAddress`]
//! - [`MeshLink`] is one open link: send text, probe, read the node table,
//!   subscribe to received text packets, write the modem preset, close
//!
//! [`TcpMeshConnector`] implements them over the Meshtastic stream API
//! (requires the `tcp` feature, on by default). Tests use the mocks in
//! [`crate::test_utils`].

pub mod framing;
pub mod proto;

#[cfg(feature = "tcp")]
mod tcp;
#[cfg(feature = "tcp")]
pub use tcp::{TcpMeshConnector, TcpMeshLink};

use crate::config::{MeshAddress, BROADCAST_NODE};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Opens links to a mesh radio
#[async_trait]
pub trait MeshConnector: Send + Sync {
    /// Connect to the radio at `address`
    ///
    /// Returns once the link is ready for sending and subscribing, or fails
    /// within the connector's own timeout.
    async fn connect(&self, address: &MeshAddress) -> Result<Arc<dyn MeshLink>>;
}

/// An open link to a mesh radio
#[async_trait]
pub trait MeshLink: Send + Sync {
    /// Transmit a text message; returns the packet id assigned to it
    async fn send_text(&self, message: &OutgoingText) -> Result<u32>;

    /// Lightweight liveness check
    async fn probe(&self) -> Result<()>;

    /// Snapshot of the radio's node table
    fn known_nodes(&self) -> Vec<KnownNode>;

    /// Look up one node of the node table
    fn lookup_node(&self, num: u32) -> Option<KnownNode> {
        self.known_nodes().into_iter().find(|node| node.num == num)
    }

    /// Receive decoded text packets
    fn subscribe(&self) -> broadcast::Receiver<MeshPacket>;

    /// Write a modem preset and frequency slot to the radio's LoRa config
    async fn set_modem_preset(&self, preset: ModemPreset, slot: u8) -> Result<()>;

    /// Close the link
    async fn close(&self) -> Result<()>;

    /// Link name for logging
    fn name(&self) -> &str;
}

/// Connection state of the mesh link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link
    Disconnected,
    /// Link open and healthy
    Connected,
    /// Automatic reconnect in progress
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// A decoded text packet received from the mesh
#[derive(Debug, Clone, PartialEq)]
pub struct MeshPacket {
    /// Sender node number
    pub from: u32,
    /// Destination node number ([`BROADCAST_NODE`] for everyone)
    pub to: u32,
    /// Packet id
    pub id: u32,
    /// Id of the packet this one replies to
    pub reply_id: Option<u32>,
    /// Channel index
    pub channel: u32,
    /// Received signal strength
    pub rx_rssi: Option<i32>,
    /// Signal-to-noise ratio
    pub rx_snr: Option<f32>,
    /// Hop limit the sender started with
    pub hop_start: Option<u32>,
    /// Hops remaining on arrival
    pub hop_limit: Option<u32>,
    /// Low byte of the last relaying node
    pub relay_node: Option<u8>,
    /// Text payload
    pub payload: Bytes,
}

impl MeshPacket {
    /// Check if the packet was sent to every node
    pub fn is_broadcast(&self) -> bool {
        self.to == BROADCAST_NODE
    }

    /// Check if the packet was addressed to a single node
    pub fn is_private(&self) -> bool {
        !self.is_broadcast()
    }

    /// Hops travelled, when the sender reported its hop start
    pub fn hop_count(&self) -> Option<u32> {
        match (self.hop_start, self.hop_limit) {
            (Some(start), Some(limit)) => Some(start.saturating_sub(limit)),
            _ => None,
        }
    }

    /// Decode the payload as UTF-8 text
    pub fn text(&self) -> Result<&str> {
        std::str::from_utf8(&self.payload).map_err(|e| {
            BridgeError::InvalidPacket(format!("packet {:08x} is not UTF-8: {}", self.id, e))
        })
    }
}

/// An entry of the radio's node table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownNode {
    /// Node number
    pub num: u32,
    /// User id (`!xxxxxxxx`)
    pub id: String,
    /// Short display name
    pub short_name: String,
    /// Long display name
    pub long_name: String,
}

impl KnownNode {
    /// Create an entry with the conventional `!xxxxxxxx` id
    pub fn new(num: u32, short_name: impl Into<String>, long_name: impl Into<String>) -> Self {
        Self {
            num,
            id: node_id_string(num),
            short_name: short_name.into(),
            long_name: long_name.into(),
        }
    }

    /// Best available human-readable name
    pub fn display_name(&self) -> &str {
        if !self.short_name.is_empty() {
            &self.short_name
        } else if !self.long_name.is_empty() {
            &self.long_name
        } else {
            &self.id
        }
    }
}

/// Format a node number as a Meshtastic user id
pub fn node_id_string(num: u32) -> String {
    format!("!{:08x}", num)
}

/// A text message to transmit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingText {
    /// Text of this part
    pub text: String,
    /// Destination node, `None` to broadcast
    pub destination: Option<u32>,
    /// Packet id this message replies to
    pub reply_id: Option<u32>,
    /// Channel index
    pub channel: u32,
}

impl OutgoingText {
    /// A broadcast on the primary channel
    pub fn broadcast(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            destination: None,
            reply_id: None,
            channel: 0,
        }
    }

    /// Address a single node
    pub fn to_node(mut self, destination: Option<u32>) -> Self {
        self.destination = destination;
        self
    }

    /// Thread onto an earlier packet
    pub fn replying_to(mut self, reply_id: Option<u32>) -> Self {
        self.reply_id = reply_id;
        self
    }

    /// Send on a specific channel
    pub fn on_channel(mut self, channel: u32) -> Self {
        self.channel = channel;
        self
    }

    /// Wire destination
    pub fn destination_num(&self) -> u32 {
        self.destination.unwrap_or(BROADCAST_NODE)
    }
}

/// LoRa modem presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModemPreset {
    /// Long range, fast
    LongFast,
    /// Long range, slow
    LongSlow,
    /// Very long range, slow
    VeryLongSlow,
    /// Medium range, slow
    MediumSlow,
    /// Medium range, fast
    MediumFast,
    /// Short range, slow
    ShortSlow,
    /// Short range, fast
    ShortFast,
    /// Long range, moderate
    LongModerate,
    /// Short range, fastest
    ShortTurbo,
}

impl ModemPreset {
    /// Every preset, in wire order
    pub const ALL: [ModemPreset; 9] = [
        ModemPreset::LongFast,
        ModemPreset::LongSlow,
        ModemPreset::VeryLongSlow,
        ModemPreset::MediumSlow,
        ModemPreset::MediumFast,
        ModemPreset::ShortSlow,
        ModemPreset::ShortFast,
        ModemPreset::LongModerate,
        ModemPreset::ShortTurbo,
    ];

    /// Protobuf enum value
    pub fn wire_value(self) -> i32 {
        match self {
            ModemPreset::LongFast => 0,
            ModemPreset::LongSlow => 1,
            ModemPreset::VeryLongSlow => 2,
            ModemPreset::MediumSlow => 3,
            ModemPreset::MediumFast => 4,
            ModemPreset::ShortSlow => 5,
            ModemPreset::ShortFast => 6,
            ModemPreset::LongModerate => 7,
            ModemPreset::ShortTurbo => 8,
        }
    }

    /// Canonical upper-case name
    pub fn as_str(self) -> &'static str {
        match self {
            ModemPreset::LongFast => "LONG_FAST",
            ModemPreset::LongSlow => "LONG_SLOW",
            ModemPreset::VeryLongSlow => "VERY_LONG_SLOW",
            ModemPreset::MediumSlow => "MEDIUM_SLOW",
            ModemPreset::MediumFast => "MEDIUM_FAST",
            ModemPreset::ShortSlow => "SHORT_SLOW",
            ModemPreset::ShortFast => "SHORT_FAST",
            ModemPreset::LongModerate => "LONG_MODERATE",
            ModemPreset::ShortTurbo => "SHORT_TURBO",
        }
    }
}

impl fmt::Display for ModemPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModemPreset {
    type Err = BridgeError;

    /// Accepts `LONG_FAST`, `long_fast`, `LongFast` and similar spellings
    fn from_str(s: &str) -> Result<Self> {
        let folded: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect();
        ModemPreset::ALL
            .into_iter()
            .find(|preset| preset.as_str().replace('_', "").to_lowercase() == folded)
            .ok_or_else(|| BridgeError::InvalidConfig(format!("unknown modem preset '{}'", s)))
    }
}
