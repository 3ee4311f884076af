//! In-memory radio and chat doubles
//!
//! [`MockMeshConnector`] hands out [`MockMeshLink`]s that record what was
//! sent and let a test inject received packets. [`MockChatClient`] records
//! every outbound chat call and assigns increasing message ids.
//!
//! # Example
//!
//! ```rust,ignore
//! let connector = Arc::new(MockMeshConnector::new());
//! let chat = Arc::new(MockChatClient::new());
//! let (bridge, packets) = MeshgramBridge::new(&config, connector.clone(), chat.clone());
//!
//! bridge.start().await;
//! connector.last_link().unwrap().inject(text_packet(0x10, BROADCAST_NODE, 1, "hi"));
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::chat::{ChatClient, ChatMessageId, ConversationId};
use crate::config::MeshAddress;
use crate::error::{BridgeError, Result};
use crate::interface::{KnownNode, MeshConnector, MeshLink, MeshPacket, ModemPreset, OutgoingText};

/// Text packet with no signal or hop data on channel 0
pub fn text_packet(from: u32, to: u32, id: u32, text: &str) -> MeshPacket {
    MeshPacket {
        from,
        to,
        id,
        reply_id: None,
        channel: 0,
        rx_rssi: None,
        rx_snr: None,
        hop_start: None,
        hop_limit: None,
        relay_node: None,
        payload: Bytes::copy_from_slice(text.as_bytes()),
    }
}

/// Connector producing [`MockMeshLink`]s
#[derive(Default)]
pub struct MockMeshConnector {
    failing: AtomicBool,
    delay: Mutex<Duration>,
    nodes: Mutex<Vec<KnownNode>>,
    connects: AtomicUsize,
    last: Mutex<Option<Arc<MockMeshLink>>>,
}

impl MockMeshConnector {
    /// Create a connector that succeeds immediately
    pub fn new() -> Self {
        Self::default()
    }

    /// Make connection attempts fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every connection attempt
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Node table given to new links
    pub fn set_nodes(&self, nodes: Vec<KnownNode>) {
        *self.nodes.lock() = nodes;
    }

    /// Connection attempts so far, failed ones included
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Most recently opened link
    pub fn last_link(&self) -> Option<Arc<MockMeshLink>> {
        self.last.lock().clone()
    }
}

#[async_trait]
impl MeshConnector for MockMeshConnector {
    async fn connect(&self, address: &MeshAddress) -> Result<Arc<dyn MeshLink>> {
        let attempt = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(BridgeError::ConnectFailed {
                address: address.to_string(),
                reason: "connection refused".into(),
            });
        }

        let link = Arc::new(MockMeshLink::new(
            format!("mock-{}", attempt),
            self.nodes.lock().clone(),
        ));
        *self.last.lock() = Some(link.clone());
        Ok(link)
    }
}

/// Link that records transmissions
pub struct MockMeshLink {
    name: String,
    nodes: Vec<KnownNode>,
    packets: broadcast::Sender<MeshPacket>,
    sent: Mutex<Vec<OutgoingText>>,
    presets: Mutex<Vec<(ModemPreset, u8)>>,
    next_id: AtomicU32,
    closed: AtomicBool,
    failing_probes: AtomicBool,
    failing_sends: AtomicBool,
    send_delay: Mutex<Duration>,
}

impl MockMeshLink {
    fn new(name: String, nodes: Vec<KnownNode>) -> Self {
        let (packets, _) = broadcast::channel(64);
        Self {
            name,
            nodes,
            packets,
            sent: Mutex::new(Vec::new()),
            presets: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(1000),
            closed: AtomicBool::new(false),
            failing_probes: AtomicBool::new(false),
            failing_sends: AtomicBool::new(false),
            send_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Deliver a received packet; returns the number of subscribers reached
    pub fn inject(&self, packet: MeshPacket) -> usize {
        if self.is_closed() {
            return 0;
        }
        self.packets.send(packet).unwrap_or(0)
    }

    /// Check if the link was closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Make probes fail
    pub fn fail_probes(&self, fail: bool) {
        self.failing_probes.store(fail, Ordering::SeqCst);
    }

    /// Make sends fail with a write error
    pub fn fail_sends(&self, fail: bool) {
        self.failing_sends.store(fail, Ordering::SeqCst);
    }

    /// Hold every send for `delay` before it completes
    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock() = delay;
    }

    /// Messages transmitted so far
    pub fn sent(&self) -> Vec<OutgoingText> {
        self.sent.lock().clone()
    }

    /// Modem presets written so far
    pub fn presets(&self) -> Vec<(ModemPreset, u8)> {
        self.presets.lock().clone()
    }
}

#[async_trait]
impl MeshLink for MockMeshLink {
    async fn send_text(&self, message: &OutgoingText) -> Result<u32> {
        let delay = *self.send_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.is_closed() {
            return Err(BridgeError::Disconnected);
        }
        if self.failing_sends.load(Ordering::SeqCst) {
            return Err(BridgeError::WriteError("broken pipe".into()));
        }
        self.sent.lock().push(message.clone());
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn probe(&self) -> Result<()> {
        if self.is_closed() || self.failing_probes.load(Ordering::SeqCst) {
            return Err(BridgeError::ReadError("no heartbeat response".into()));
        }
        Ok(())
    }

    fn known_nodes(&self) -> Vec<KnownNode> {
        self.nodes.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<MeshPacket> {
        self.packets.subscribe()
    }

    async fn set_modem_preset(&self, preset: ModemPreset, slot: u8) -> Result<()> {
        if self.is_closed() {
            return Err(BridgeError::Disconnected);
        }
        self.presets.lock().push((preset, slot));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A message posted through [`MockChatClient`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentChatMessage {
    /// Assigned message id
    pub id: ChatMessageId,
    /// Target conversation
    pub conversation: ConversationId,
    /// Message text
    pub text: String,
    /// Message replied to
    pub reply_to: Option<ChatMessageId>,
    /// Button data `(confirm, cancel)` for confirmation prompts
    pub buttons: Option<(String, String)>,
}

/// Chat client that records every call
pub struct MockChatClient {
    next_id: AtomicI64,
    messages: Mutex<Vec<SentChatMessage>>,
    answers: Mutex<Vec<(String, Option<String>)>>,
    timeouts: Mutex<VecDeque<()>>,
    api_timeout: Mutex<Option<Duration>>,
}

impl Default for MockChatClient {
    fn default() -> Self {
        Self {
            next_id: AtomicI64::new(500),
            messages: Mutex::new(Vec::new()),
            answers: Mutex::new(Vec::new()),
            timeouts: Mutex::new(VecDeque::new()),
            api_timeout: Mutex::new(None),
        }
    }
}

impl MockChatClient {
    /// Create a client that accepts every call
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` posts time out
    pub fn fail_next(&self, count: usize) {
        self.timeouts.lock().extend(std::iter::repeat(()).take(count));
    }

    /// Messages posted so far, prompts included
    pub fn sent_messages(&self) -> Vec<SentChatMessage> {
        self.messages.lock().clone()
    }

    /// Last message posted
    pub fn last_message(&self) -> Option<SentChatMessage> {
        self.messages.lock().last().cloned()
    }

    /// Confirmation prompts posted so far
    pub fn confirmations(&self) -> Vec<SentChatMessage> {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.buttons.is_some())
            .cloned()
            .collect()
    }

    /// Callback answers `(callback_id, text)` so far
    pub fn answers(&self) -> Vec<(String, Option<String>)> {
        self.answers.lock().clone()
    }

    /// Timeout applied through [`ChatClient::set_api_timeout`]
    pub fn api_timeout(&self) -> Option<Duration> {
        *self.api_timeout.lock()
    }

    fn post(
        &self,
        conversation: ConversationId,
        text: &str,
        reply_to: Option<ChatMessageId>,
        buttons: Option<(String, String)>,
    ) -> Result<ChatMessageId> {
        if self.timeouts.lock().pop_front().is_some() {
            return Err(BridgeError::ChatTimeout("sendMessage".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.messages.lock().push(SentChatMessage {
            id,
            conversation,
            text: text.to_string(),
            reply_to,
            buttons,
        });
        Ok(id)
    }
}

#[async_trait]
impl ChatClient for MockChatClient {
    async fn send_message(
        &self,
        conversation: ConversationId,
        text: &str,
        reply_to: Option<ChatMessageId>,
    ) -> Result<ChatMessageId> {
        self.post(conversation, text, reply_to, None)
    }

    async fn send_confirmation(
        &self,
        conversation: ConversationId,
        text: &str,
        reply_to: Option<ChatMessageId>,
        confirm_data: &str,
        cancel_data: &str,
    ) -> Result<ChatMessageId> {
        self.post(
            conversation,
            text,
            reply_to,
            Some((confirm_data.to_string(), cancel_data.to_string())),
        )
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        self.answers
            .lock()
            .push((callback_id.to_string(), text.map(str::to_string)));
        Ok(())
    }

    fn set_api_timeout(&self, timeout: Duration) {
        *self.api_timeout.lock() = Some(timeout);
    }
}
