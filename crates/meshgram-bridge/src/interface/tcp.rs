//! TCP interface for Meshtastic devices with a network connection
//!
//! Radios with WiFi or Ethernet expose the client API on TCP port 4403. The
//! stream carries the same framed `ToRadio`/`FromRadio` protobufs as the
//! serial console.
//!
//! On connect the client sends `want_config_id` and waits for the radio to
//! echo it in `config_complete_id`; in between the radio dumps its own node
//! number, LoRa config and node table. After that a background task keeps
//! reading, updates the node table and fans received text packets out to
//! subscribers.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use prost::Message;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::framing::{encode_frame, FrameDecoder};
use super::proto::{self, from_radio, mesh_packet, to_radio};
use super::{node_id_string, KnownNode, MeshConnector, MeshLink, MeshPacket, ModemPreset, OutgoingText};
use crate::config::{MeshAddress, DEFAULT_TIMEOUT_MS};
use crate::error::{BridgeError, Result};

/// Buffer size for reading from the socket
const READ_BUFFER_SIZE: usize = 1024;

/// Subscriber queue depth
const PACKET_CHANNEL_CAPACITY: usize = 64;

/// Hop limit used when the radio has not reported its LoRa config
const FALLBACK_HOP_LIMIT: u32 = 3;

/// Opens [`TcpMeshLink`]s
#[derive(Debug, Clone)]
pub struct TcpMeshConnector {
    timeout: Duration,
}

impl Default for TcpMeshConnector {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_TIMEOUT_MS))
    }
}

impl TcpMeshConnector {
    /// Create a connector; `timeout` bounds the TCP connect, the config
    /// handshake and every write
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl MeshConnector for TcpMeshConnector {
    async fn connect(&self, address: &MeshAddress) -> Result<Arc<dyn MeshLink>> {
        let link = TcpMeshLink::connect(address, self.timeout).await?;
        Ok(Arc::new(link))
    }
}

/// State shared between the link and its reader task
#[derive(Debug)]
struct LinkShared {
    name: String,
    alive: AtomicBool,
    my_node_num: RwLock<Option<u32>>,
    lora: RwLock<Option<proto::LoRaConfig>>,
    nodes: RwLock<HashMap<u32, KnownNode>>,
    packets: broadcast::Sender<MeshPacket>,
}

/// One TCP connection to a radio
pub struct TcpMeshLink {
    shared: Arc<LinkShared>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    timeout: Duration,
}

impl TcpMeshLink {
    /// Connect and complete the config handshake
    pub async fn connect(address: &MeshAddress, timeout: Duration) -> Result<Self> {
        let name = format!("tcp:{}", address);
        info!(address = %address, "Connecting to Meshtastic device");

        let stream = tokio::time::timeout(
            timeout,
            TcpStream::connect((address.host.as_str(), address.port)),
        )
        .await
        .map_err(|_| BridgeError::ConnectionTimeout {
            duration_ms: timeout.as_millis() as u64,
        })?
        .map_err(|e| BridgeError::ConnectFailed {
            address: address.to_string(),
            reason: e.to_string(),
        })?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let (packets, _) = broadcast::channel(PACKET_CHANNEL_CAPACITY);
        let shared = Arc::new(LinkShared {
            name,
            alive: AtomicBool::new(true),
            my_node_num: RwLock::new(None),
            lora: RwLock::new(None),
            nodes: RwLock::new(HashMap::new()),
            packets,
        });

        let config_id = rand::random::<u32>().max(1);
        let (ready_tx, mut ready_rx) = watch::channel(false);
        let reader = tokio::spawn(read_loop(read_half, shared.clone(), config_id, ready_tx));

        let link = Self {
            shared,
            writer: tokio::sync::Mutex::new(Some(write_half)),
            reader: Mutex::new(Some(reader)),
            timeout,
        };

        link.write_to_radio(proto::ToRadio {
            payload_variant: Some(to_radio::PayloadVariant::WantConfigId(config_id)),
        })
        .await?;

        // The watch guard is not Send; reduce it to a flag before awaiting again
        let handshake = tokio::time::timeout(timeout, ready_rx.wait_for(|done| *done))
            .await
            .map(|ready| ready.is_ok());
        match handshake {
            Ok(true) => {}
            Ok(false) => {
                link.shutdown().await;
                return Err(BridgeError::Disconnected);
            }
            Err(_) => {
                link.shutdown().await;
                return Err(BridgeError::ConnectionTimeout {
                    duration_ms: timeout.as_millis() as u64,
                });
            }
        }

        info!(
            link = %link.shared.name,
            nodes = link.shared.nodes.read().len(),
            "Connected to Meshtastic device"
        );
        Ok(link)
    }

    /// Node number of the attached radio, once reported
    pub fn my_node_num(&self) -> Option<u32> {
        *self.shared.my_node_num.read()
    }

    async fn write_to_radio(&self, message: proto::ToRadio) -> Result<()> {
        let frame = encode_frame(&message.encode_to_vec())?;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(BridgeError::NotConnected)?;

        let written = tokio::time::timeout(self.timeout, async {
            writer.write_all(&frame).await?;
            writer.flush().await
        })
        .await;

        match written {
            Ok(Ok(())) => {
                trace!(size = frame.len(), "Frame written");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(link = %self.shared.name, error = %e, "Mesh write error");
                self.shared.alive.store(false, Ordering::SeqCst);
                Err(BridgeError::WriteError(e.to_string()))
            }
            Err(_) => {
                self.shared.alive.store(false, Ordering::SeqCst);
                Err(BridgeError::ConnectionTimeout {
                    duration_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn shutdown(&self) {
        self.shared.alive.store(false, Ordering::SeqCst);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

#[async_trait]
impl MeshLink for TcpMeshLink {
    async fn send_text(&self, message: &OutgoingText) -> Result<u32> {
        if !self.shared.alive.load(Ordering::SeqCst) {
            return Err(BridgeError::Disconnected);
        }

        let id = rand::random::<u32>().max(1);
        let hop_limit = self
            .shared
            .lora
            .read()
            .as_ref()
            .map(|lora| lora.hop_limit)
            .filter(|limit| *limit > 0)
            .unwrap_or(FALLBACK_HOP_LIMIT);

        let packet = proto::MeshPacket {
            to: message.destination_num(),
            channel: message.channel,
            id,
            hop_limit,
            want_ack: message.destination.is_some(),
            payload_variant: Some(mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: proto::PORTNUM_TEXT_MESSAGE,
                payload: message.text.as_bytes().to_vec(),
                reply_id: message.reply_id.unwrap_or(0),
                ..Default::default()
            })),
            ..Default::default()
        };

        self.write_to_radio(proto::ToRadio {
            payload_variant: Some(to_radio::PayloadVariant::Packet(packet)),
        })
        .await?;

        debug!(
            id,
            to = %node_id_string(message.destination_num()),
            channel = message.channel,
            bytes = message.text.len(),
            "Text sent to mesh"
        );
        Ok(id)
    }

    async fn probe(&self) -> Result<()> {
        if !self.shared.alive.load(Ordering::SeqCst) {
            return Err(BridgeError::Disconnected);
        }
        self.write_to_radio(proto::ToRadio {
            payload_variant: Some(to_radio::PayloadVariant::Heartbeat(proto::Heartbeat {})),
        })
        .await
    }

    fn known_nodes(&self) -> Vec<KnownNode> {
        self.shared.nodes.read().values().cloned().collect()
    }

    fn lookup_node(&self, num: u32) -> Option<KnownNode> {
        self.shared.nodes.read().get(&num).cloned()
    }

    fn subscribe(&self) -> broadcast::Receiver<MeshPacket> {
        self.shared.packets.subscribe()
    }

    async fn set_modem_preset(&self, preset: ModemPreset, slot: u8) -> Result<()> {
        let my_node = self
            .my_node_num()
            .ok_or_else(|| BridgeError::RadioNotReady("node number not reported".to_string()))?;
        let mut lora = self
            .shared
            .lora
            .read()
            .clone()
            .ok_or_else(|| BridgeError::RadioNotReady("LoRa config not reported".to_string()))?;

        lora.use_preset = true;
        lora.modem_preset = preset.wire_value();
        lora.channel_num = u32::from(slot);

        let admin = proto::AdminMessage {
            payload_variant: Some(proto::admin_message::PayloadVariant::SetConfig(
                proto::Config {
                    payload_variant: Some(proto::config::PayloadVariant::Lora(lora.clone())),
                },
            )),
        };
        let packet = proto::MeshPacket {
            to: my_node,
            from: my_node,
            id: rand::random::<u32>().max(1),
            want_ack: true,
            payload_variant: Some(mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: proto::PORTNUM_ADMIN,
                payload: admin.encode_to_vec(),
                want_response: true,
                ..Default::default()
            })),
            ..Default::default()
        };

        self.write_to_radio(proto::ToRadio {
            payload_variant: Some(to_radio::PayloadVariant::Packet(packet)),
        })
        .await?;

        *self.shared.lora.write() = Some(lora);
        info!(preset = %preset, slot, "Modem preset written to radio");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.shared.alive.load(Ordering::SeqCst) {
            // Let the radio drop the client session; the socket closes regardless
            let _ = self
                .write_to_radio(proto::ToRadio {
                    payload_variant: Some(to_radio::PayloadVariant::Disconnect(true)),
                })
                .await;
        }
        self.shutdown().await;
        info!(link = %self.shared.name, "Mesh link closed");
        Ok(())
    }

    fn name(&self) -> &str {
        &self.shared.name
    }
}

impl Drop for TcpMeshLink {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

impl std::fmt::Debug for TcpMeshLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpMeshLink")
            .field("name", &self.shared.name)
            .field("alive", &self.shared.alive.load(Ordering::SeqCst))
            .field("nodes", &self.shared.nodes.read().len())
            .finish()
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    shared: Arc<LinkShared>,
    config_id: u32,
    ready: watch::Sender<bool>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; READ_BUFFER_SIZE];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                warn!(link = %shared.name, "Radio closed the connection");
                break;
            }
            Ok(n) => {
                trace!(bytes = n, "Read from radio");
                decoder.extend(&buf[..n]);
            }
            Err(e) => {
                error!(link = %shared.name, error = %e, "Mesh read error");
                break;
            }
        }

        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => handle_frame(&shared, frame, config_id, &ready),
                Ok(None) => break,
                Err(e) => warn!(error = %e, "Dropping corrupt frame"),
            }
        }
    }

    shared.alive.store(false, Ordering::SeqCst);
}

fn handle_frame(shared: &LinkShared, frame: Bytes, config_id: u32, ready: &watch::Sender<bool>) {
    let message = match proto::FromRadio::decode(frame) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "Dropping undecodable FromRadio");
            return;
        }
    };

    match message.payload_variant {
        Some(from_radio::PayloadVariant::Packet(packet)) => {
            if let Some(packet) = text_packet(packet) {
                trace!(id = packet.id, from = %node_id_string(packet.from), "Text packet received");
                // No subscribers is not an error
                let _ = shared.packets.send(packet);
            }
        }
        Some(from_radio::PayloadVariant::MyInfo(info)) => {
            debug!(node = %node_id_string(info.my_node_num), "Radio reported its node number");
            *shared.my_node_num.write() = Some(info.my_node_num);
        }
        Some(from_radio::PayloadVariant::NodeInfo(info)) => {
            if let Some(node) = known_node(info) {
                trace!(node = %node.id, name = %node.short_name, "Node table entry");
                shared.nodes.write().insert(node.num, node);
            }
        }
        Some(from_radio::PayloadVariant::Config(config)) => {
            if let Some(proto::config::PayloadVariant::Lora(lora)) = config.payload_variant {
                debug!(preset = lora.modem_preset, hop_limit = lora.hop_limit, "LoRa config received");
                *shared.lora.write() = Some(lora);
            }
        }
        Some(from_radio::PayloadVariant::ConfigCompleteId(id)) => {
            if id == config_id {
                debug!("Config handshake complete");
                ready.send_replace(true);
            } else {
                debug!(id, expected = config_id, "Ignoring stale config completion");
            }
        }
        None => {}
    }
}

/// Convert a received protobuf packet, keeping decoded text messages only
fn text_packet(packet: proto::MeshPacket) -> Option<MeshPacket> {
    let data = match packet.payload_variant {
        Some(mesh_packet::PayloadVariant::Decoded(data)) if data.portnum == proto::PORTNUM_TEXT_MESSAGE => data,
        _ => return None,
    };
    let has_signal = packet.rx_rssi != 0 || packet.rx_snr != 0.0;

    Some(MeshPacket {
        from: packet.from,
        to: packet.to,
        id: packet.id,
        reply_id: (data.reply_id != 0).then_some(data.reply_id),
        channel: packet.channel,
        rx_rssi: has_signal.then_some(packet.rx_rssi),
        rx_snr: has_signal.then_some(packet.rx_snr),
        // Firmware older than 2.3 leaves hop_start unset
        hop_start: (packet.hop_start != 0).then_some(packet.hop_start),
        hop_limit: Some(packet.hop_limit),
        relay_node: (packet.relay_node != 0).then_some((packet.relay_node & 0xFF) as u8),
        payload: Bytes::from(data.payload),
    })
}

fn known_node(info: proto::NodeInfo) -> Option<KnownNode> {
    let user = info.user?;
    let id = if user.id.is_empty() {
        node_id_string(info.num)
    } else {
        user.id
    };
    Some(KnownNode {
        num: info.num,
        id,
        short_name: user.short_name,
        long_name: user.long_name,
    })
}
