//! MeshgramBridge - mesh ↔ chat orchestration
//!
//! This module wires the pieces together:
//!
//! - Mesh → chat: received text is mirrored into the bound conversation,
//!   the mesh/chat id pair is recorded for threading, and keyword auto-replies
//!   are transmitted back onto the mesh
//! - Chat → mesh: text and `/pm` are staged behind an accept/cancel prompt
//!   and only transmitted on accept
//! - Control: health checks with reconnect, node table scans and config
//!   reload run on timers
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  MeshPacket  ┌────────────────────────────┐  ChatClient  ┌──────────┐
//! │ MeshLink     │─────────────►│ MeshgramBridge             │─────────────►│ Chat     │
//! │ (forwarder)  │              │  CorrelationStore          │              │ service  │
//! │              │◄─────────────│  AutoReplyEngine           │◄─────────────│          │
//! └──────────────┘  send_text   │  NodeDirectory             │  ChatEvent   └──────────┘
//!        ▲                      │  pending confirmations     │
//!        │                      └────────────────────────────┘
//!   ConnectionManager ◄── control loop (health / scan / reload)
//! ```
//!
//! Every collaborator error is handled here: it becomes a reconnect, a
//! retry or a reply in the chat. None of the loops stop on an error.

use chrono::SecondsFormat;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::auto_reply::{self, AutoReplyDecision, AutoReplyEngine, SenderInfo};
use crate::chat::{ChatClient, ChatEvent, ChatMessageId, ConversationId, RetryPolicy};
use crate::command::{CallbackAction, Command, USAGE};
use crate::config::{
    ConfigWatcher, HotConfig, MeshAddress, MeshgramConfig, ReconnectConfig, MESSAGE_SPLIT_DELAY,
};
use crate::connection::ConnectionManager;
use crate::correlation::CorrelationStore;
use crate::directory::NodeDirectory;
use crate::error::{BridgeError, Result};
use crate::interface::{
    node_id_string, ConnectionState, MeshConnector, MeshPacket, OutgoingText,
};
use crate::segment::Segmenter;

/// Queue depth between the mesh forwarder and the bridge
const MESH_EVENT_CAPACITY: usize = 256;

/// Name used when the sender is not in the node table
const UNKNOWN_SENDER: &str = "Unknown";

/// Channel index of the radio's primary channel
const PRIMARY_CHANNEL: u32 = 0;

/// Bridge statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Text packets received from the mesh
    pub packets_received: u64,
    /// Packets mirrored into the chat
    pub mirrored_to_chat: u64,
    /// Auto-replies transmitted
    pub auto_replies_sent: u64,
    /// Auto-replies kept off the mesh by the hop filter
    pub auto_replies_suppressed: u64,
    /// Confirmed chat messages transmitted
    pub chat_to_mesh: u64,
    /// Packets dropped as undecodable
    pub decode_errors: u64,
    /// Chat or mesh deliveries that failed
    pub delivery_failures: u64,
}

/// A chat message waiting for accept/cancel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingConfirmation {
    /// Text to transmit
    pub text: String,
    /// Unicast target, `None` for the general channel
    pub destination: Option<u32>,
    /// Mesh packet the transmission replies to
    pub reply_to_mesh: Option<u32>,
    /// Chat message that was staged
    pub chat_message_id: ChatMessageId,
    /// Human-readable target
    pub target_name: String,
    /// Channel index, `None` for the configured default
    pub channel: Option<u32>,
}

/// Partial or failed multi-part transmission
#[derive(Debug)]
pub struct TransmitFailure {
    /// Parts transmitted before the failure
    pub sent: usize,
    /// Parts in the message
    pub total: usize,
    /// The error that stopped the transmission
    pub error: BridgeError,
}

/// The mesh/chat bridge service
pub struct MeshgramBridge {
    connection: Arc<ConnectionManager>,
    chat: Arc<dyn ChatClient>,
    correlation: Arc<CorrelationStore>,
    directory: Arc<NodeDirectory>,
    auto_reply: AutoReplyEngine,
    segmenter: Segmenter,
    retry: RetryPolicy,
    part_delay: Duration,
    timers: ReconnectConfig,
    bound_chat: RwLock<Option<ConversationId>>,
    pending: Mutex<HashMap<ConversationId, PendingConfirmation>>,
    config_file: Option<Mutex<ConfigWatcher>>,
    stats: Mutex<BridgeStats>,
}

impl MeshgramBridge {
    /// Create a bridge
    ///
    /// Returns the bridge and the receiver of mesh packets to hand to
    /// [`MeshgramBridge::run`].
    pub fn new(
        config: &MeshgramConfig,
        connector: Arc<dyn MeshConnector>,
        chat: Arc<dyn ChatClient>,
    ) -> (Self, mpsc::Receiver<MeshPacket>) {
        let (packet_tx, packet_rx) = mpsc::channel(MESH_EVENT_CAPACITY);
        let directory = Arc::new(NodeDirectory::new());
        let connection = Arc::new(ConnectionManager::new(
            connector,
            directory.clone(),
            config.mesh.address(),
            config.reconnect.backoff,
            packet_tx,
        ));
        chat.set_api_timeout(config.chat.api_timeout);

        let bridge = Self {
            connection,
            chat,
            correlation: Arc::new(CorrelationStore::new()),
            directory,
            auto_reply: AutoReplyEngine::new(config.reply.clone()),
            segmenter: Segmenter::default(),
            retry: RetryPolicy::default(),
            part_delay: MESSAGE_SPLIT_DELAY,
            timers: config.reconnect.clone(),
            bound_chat: RwLock::new(config.chat.chat_id),
            pending: Mutex::new(HashMap::new()),
            config_file: None,
            stats: Mutex::new(BridgeStats::default()),
        };
        (bridge, packet_rx)
    }

    /// Persist address and chat binding changes to, and reload from, this file
    pub fn with_config_file(mut self, watcher: ConfigWatcher) -> Self {
        self.config_file = Some(Mutex::new(watcher));
        self
    }

    /// Override the pause between parts of a multi-part transmission
    pub fn with_part_delay(mut self, delay: Duration) -> Self {
        self.part_delay = delay;
        self
    }

    /// Override the chat retry schedule
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Connection manager
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Correlation store
    pub fn correlation(&self) -> &Arc<CorrelationStore> {
        &self.correlation
    }

    /// Node directory
    pub fn directory(&self) -> &Arc<NodeDirectory> {
        &self.directory
    }

    /// Auto-reply engine
    pub fn auto_reply(&self) -> &AutoReplyEngine {
        &self.auto_reply
    }

    /// Conversation the bridge serves
    pub fn bound_chat(&self) -> Option<ConversationId> {
        *self.bound_chat.read()
    }

    /// Pending confirmation of a conversation
    pub fn pending(&self, conversation: ConversationId) -> Option<PendingConfirmation> {
        self.pending.lock().get(&conversation).cloned()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> BridgeStats {
        self.stats.lock().clone()
    }

    /// Initial connect at startup; failure is left to the reconnect timer
    pub async fn start(&self) {
        match self.connection.reconnect_now().await {
            Ok(()) => {
                self.connection.refresh_nodes();
            }
            Err(e) => warn!(error = %e, "Initial mesh connect failed, will retry automatically"),
        }
    }

    /// Run the bridge until `shutdown` resolves
    ///
    /// Spawns the mesh and chat delivery loops and runs the control loop on
    /// the current task. The mesh link is closed on exit.
    pub async fn run(
        self: Arc<Self>,
        packets: mpsc::Receiver<MeshPacket>,
        chat_events: mpsc::Receiver<ChatEvent>,
        shutdown: impl Future<Output = ()>,
    ) {
        info!("Starting mesh bridge");
        self.start().await;

        let mesh_task = tokio::spawn(self.clone().run_mesh_events(packets));
        let chat_task = tokio::spawn(self.clone().run_chat_events(chat_events));

        self.run_control_loop(shutdown).await;

        mesh_task.abort();
        chat_task.abort();
        self.connection.disconnect(true).await;
        info!(stats = ?self.stats(), "Mesh bridge stopped");
    }

    /// Deliver mesh packets one at a time
    pub async fn run_mesh_events(self: Arc<Self>, mut packets: mpsc::Receiver<MeshPacket>) {
        while let Some(packet) = packets.recv().await {
            self.handle_mesh_packet(packet).await;
        }
        debug!("Mesh event stream ended");
    }

    /// Deliver chat events one at a time
    pub async fn run_chat_events(self: Arc<Self>, mut events: mpsc::Receiver<ChatEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_chat_event(event).await;
        }
        debug!("Chat event stream ended");
    }

    /// Health checks, node scans and config reloads until `shutdown`
    pub async fn run_control_loop(&self, shutdown: impl Future<Output = ()>) {
        let mut health = tokio::time::interval(self.timers.health_check_interval);
        let mut scan = tokio::time::interval(self.timers.node_scan_interval);
        let mut reload = tokio::time::interval(self.timers.config_reload_interval);
        for timer in [&mut health, &mut scan, &mut reload] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                _ = health.tick() => {
                    self.connection.check_health().await;
                }
                _ = scan.tick() => {
                    self.connection.refresh_nodes();
                }
                _ = reload.tick() => {
                    self.reload_config();
                }
            }
        }
    }

    /// Check the config file and apply hot-reloadable changes
    pub fn reload_config(&self) {
        let Some(watcher) = &self.config_file else {
            return;
        };
        let polled = watcher.lock().poll();
        match polled {
            Ok(Some(hot)) => self.apply_hot_config(hot),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Config reload failed, keeping current settings"),
        }
    }

    /// Apply reloaded settings
    pub fn apply_hot_config(&self, hot: HotConfig) {
        info!(
            keywords = hot.reply.keywords.len(),
            private_nodes = hot.reply.private_node_names.len(),
            hop_filter = ?hot.reply.hop_filter,
            "Applying reloaded configuration"
        );
        self.auto_reply.update_policy(hot.reply);
        self.chat.set_api_timeout(hot.api_timeout);
    }

    // ===== Mesh → chat =====

    /// Handle one received text packet
    pub async fn handle_mesh_packet(&self, packet: MeshPacket) {
        self.stats.lock().packets_received += 1;

        let text = match packet.text() {
            Ok(text) => text.to_string(),
            Err(e) => {
                self.stats.lock().decode_errors += 1;
                warn!(error = %e, from = %node_id_string(packet.from), "Dropping undecodable packet");
                return;
            }
        };

        let sender = self.connection.lookup_node(packet.from);
        if let Some(node) = &sender {
            self.directory.upsert(node);
        }
        let name = sender
            .as_ref()
            .map(|node| node.short_name.clone())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| UNKNOWN_SENDER.to_string());
        let relay = self.relay_name(&packet);
        let is_private = packet.is_private();

        info!(
            id = packet.id,
            from = %node_id_string(packet.from),
            sender = %name,
            private = is_private,
            hops = ?packet.hop_count(),
            "Text received from mesh"
        );

        let policy = self.auto_reply.policy();
        if !is_private || policy.is_private_node(&name) {
            self.mirror_to_chat(&packet, &name, &text).await;
        } else {
            debug!(sender = %name, "Private message from node not on private list, not mirrored");
        }

        let decision = self.auto_reply.evaluate(
            &packet,
            &text,
            SenderInfo {
                name: &name,
                relay: relay.as_deref(),
            },
        );
        self.execute_auto_reply(&packet, &name, &text, decision).await;
    }

    fn relay_name(&self, packet: &MeshPacket) -> Option<String> {
        let relay = packet.relay_node?;
        // Relayed by the sender itself: heard directly
        if relay == (packet.from & 0xFF) as u8 {
            return None;
        }
        self.directory
            .find_by_last_byte(relay)
            .map(|node| node.display_name().to_string())
    }

    async fn mirror_to_chat(&self, packet: &MeshPacket, name: &str, text: &str) {
        let Some(conversation) = self.bound_chat() else {
            debug!("No chat bound yet, not mirroring");
            return;
        };
        let is_private = packet.is_private();
        let mirror = format_inbound_mirror(name, text, is_private, packet);
        let reply_to = packet
            .reply_id
            .and_then(|id| self.correlation.lookup_by_mesh_id(id))
            .map(|record| record.mirror_message_id);

        match self.send_chat(conversation, &mirror, reply_to).await {
            Ok(mirror_id) => {
                self.correlation
                    .record(packet.id, mirror_id, is_private.then_some(packet.from), is_private);
                self.stats.lock().mirrored_to_chat += 1;
                debug!(mesh_id = packet.id, mirror_id, ?reply_to, "Mirrored to chat");
            }
            Err(e) => {
                self.stats.lock().delivery_failures += 1;
                error!(error = %e, code = e.error_code(), mesh_id = packet.id, "Failed to mirror mesh message");
            }
        }
    }

    async fn execute_auto_reply(
        &self,
        packet: &MeshPacket,
        name: &str,
        original: &str,
        decision: AutoReplyDecision,
    ) {
        let plan = match &decision {
            AutoReplyDecision::Skip(cause) => {
                debug!(?cause, "No auto-reply");
                return;
            }
            AutoReplyDecision::Transmit(plan) => {
                if !self.connection.is_connected() {
                    warn!("Mesh not connected, skipping auto-reply");
                    return;
                }
                Some(plan)
            }
            AutoReplyDecision::Suppressed { .. } => {
                self.stats.lock().auto_replies_suppressed += 1;
                None
            }
        };

        let mut send_failed = false;
        if let Some(plan) = plan {
            match self
                .transmit(&plan.text, plan.destination, Some(plan.reply_id), plan.channel)
                .await
            {
                Ok(parts) => {
                    self.stats.lock().auto_replies_sent += 1;
                    info!(reply = %plan.text, parts, private = plan.is_private, "Auto-reply sent");
                }
                Err(failure) => {
                    self.stats.lock().delivery_failures += 1;
                    warn!(error = %failure.error, "Auto-reply not sent");
                    send_failed = true;
                }
            }
        }

        let (Some(conversation), Some(mut mirror)) = (
            self.bound_chat(),
            auto_reply::mirror_text(name, original, &decision),
        ) else {
            return;
        };
        if send_failed {
            mirror.push_str(" (send failed)");
        }
        let reply_to = self
            .correlation
            .lookup_by_mesh_id(packet.id)
            .map(|record| record.mirror_message_id);
        if let Err(e) = self.send_chat(conversation, &mirror, reply_to).await {
            self.stats.lock().delivery_failures += 1;
            error!(error = %e, "Failed to mirror auto-reply");
        }
    }

    /// Segment and transmit text; the reply reference goes on the first part
    pub async fn transmit(
        &self,
        text: &str,
        destination: Option<u32>,
        reply_id: Option<u32>,
        channel: u32,
    ) -> std::result::Result<usize, TransmitFailure> {
        let parts = self.segmenter.split(text);
        let total = parts.len();
        if total > 1 {
            info!(parts = total, bytes = self.segmenter.accounted_len(text), "Text split for transmission");
        }

        for (index, part) in parts.into_iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.part_delay).await;
            }
            let message = OutgoingText::broadcast(part)
                .to_node(destination)
                .replying_to(if index == 0 { reply_id } else { None })
                .on_channel(channel);

            if let Err(error) = self.connection.send_text(&message).await {
                error!(part = index + 1, parts = total, error = %error, "Mesh send failed, aborting");
                return Err(TransmitFailure {
                    sent: index,
                    total,
                    error,
                });
            }
        }
        Ok(total)
    }

    // ===== Chat → mesh =====

    /// Handle one chat update
    pub async fn handle_chat_event(&self, event: ChatEvent) {
        let conversation = event.conversation();

        match self.bound_chat() {
            None => {
                if let ChatEvent::Callback { callback_id, .. } = &event {
                    self.answer(callback_id, None).await;
                    return;
                }
                self.bind_chat(conversation, event.message_id()).await;
                // A first command still runs once the chat is bound
                if !matches!(event, ChatEvent::Command { .. }) {
                    return;
                }
            }
            Some(bound) if bound != conversation => {
                info!(conversation, "Ignoring update from unbound chat");
                match &event {
                    ChatEvent::Callback { callback_id, .. } => {
                        self.answer(callback_id, Some("Access denied")).await;
                    }
                    _ => {
                        self.reply(conversation, "Access denied: this bridge serves another chat.", Some(event.message_id()))
                            .await;
                    }
                }
                return;
            }
            Some(_) => {}
        }

        match event {
            ChatEvent::Message {
                message_id,
                text,
                reply_to,
                sender,
                ..
            } => {
                info!(message_id, sender = ?sender, "Text received from chat");
                self.stage_message(conversation, message_id, text, reply_to).await;
            }
            ChatEvent::Command {
                message_id,
                name,
                args,
                ..
            } => match Command::parse(&name, &args) {
                Ok(command) => self.handle_command(conversation, message_id, command).await,
                Err(usage) => {
                    self.reply(conversation, &usage.to_string(), Some(message_id)).await;
                }
            },
            ChatEvent::Callback {
                callback_id, data, ..
            } => self.handle_callback(conversation, &callback_id, &data).await,
        }
    }

    async fn bind_chat(&self, conversation: ConversationId, message_id: ChatMessageId) {
        *self.bound_chat.write() = Some(conversation);
        info!(conversation, "Chat bound on first contact");
        self.persist(|config| config.chat.chat_id = Some(conversation));
        self.reply(
            conversation,
            &format!(
                "Hello! Your chat id is {}. The bridge is now active for this chat.",
                conversation
            ),
            Some(message_id),
        )
        .await;
    }

    async fn handle_command(&self, conversation: ConversationId, message_id: ChatMessageId, command: Command) {
        debug!(?command, "Chat command");
        let reply = match command {
            Command::Connect(address) => self.command_connect(address).await,
            Command::Disconnect => {
                self.connection.disconnect(true).await;
                "✓ Disconnected from the mesh.\nAuto-reconnect paused.\nUse /connect to reconnect."
                    .to_string()
            }
            Command::Pm { node, text } => {
                match self.stage_private(conversation, message_id, &node, text).await {
                    Ok(()) => return,
                    Err(reply) => reply,
                }
            }
            Command::Status => self.status_text(conversation),
            Command::SetPreset { preset, slot } => {
                if !self.connection.is_connected() {
                    not_connected_text()
                } else {
                    match self.connection.set_modem_preset(preset, slot).await {
                        Ok(()) => format!("✓ Modem preset set to {} (slot {}).", preset, slot),
                        Err(e) => format!("✗ Failed to set modem preset: {}", e),
                    }
                }
            }
            Command::Help => USAGE.to_string(),
        };
        self.reply(conversation, &reply, Some(message_id)).await;
    }

    async fn command_connect(&self, address: Option<MeshAddress>) -> String {
        let result = match address {
            Some(address) => {
                let (host, port) = (address.host.clone(), address.port);
                self.persist(move |config| {
                    config.mesh.host = host;
                    config.mesh.port = port;
                });
                self.connection.connect(address).await
            }
            None => self.connection.reconnect_now().await,
        };
        let address = self.connection.address();
        match result {
            Ok(()) => {
                self.connection.refresh_nodes();
                format!("✓ Connected to {}.\nAuto-reconnect enabled.", address)
            }
            Err(e) => format!(
                "✗ Failed to connect to {}: {}\nAuto-reconnect enabled.",
                address, e
            ),
        }
    }

    fn status_text(&self, conversation: ConversationId) -> String {
        let status = self.connection.status();
        let policy = self.auto_reply.policy();
        let state = match status.state {
            ConnectionState::Connected => "🟢 Connected",
            ConnectionState::Reconnecting => "🟡 Reconnecting",
            ConnectionState::Disconnected => "🔴 Disconnected",
        };
        let auto_reconnect = if status.manual_disconnect {
            "❌ Paused (manual disconnect)"
        } else {
            "✅ Enabled"
        };
        let mut text = format!(
            "📊 Bridge status\n\nConnection: {}\nAuto-reconnect: {}\nAddress: {}\n",
            state, auto_reconnect, status.address
        );
        if let Some(since) = status.connected_since {
            text.push_str(&format!(
                "Connected since: {}\n",
                since.to_rfc3339_opts(SecondsFormat::Secs, true)
            ));
        }
        text.push_str(&format!(
            "Known nodes: {}\nPrivate nodes: {}\nKeywords: {}\nPending confirmation: {}",
            self.directory.len(),
            policy.private_node_names.len(),
            policy.keywords.len(),
            if self.pending.lock().contains_key(&conversation) {
                "yes"
            } else {
                "no"
            }
        ));
        text
    }

    async fn stage_message(
        &self,
        conversation: ConversationId,
        message_id: ChatMessageId,
        text: String,
        reply_to: Option<ChatMessageId>,
    ) {
        if !self.connection.is_connected() {
            self.reply(conversation, &not_connected_text(), Some(message_id)).await;
            return;
        }

        let record = reply_to.and_then(|id| self.correlation.lookup_by_mirror_id(id));
        if let Some(record) = &record {
            debug!(mesh_id = record.mesh_message_id, private = record.is_private, "Chat reply threads onto mesh message");
        }
        let destination = record.and_then(|record| record.destination_node);
        let target_name = match destination {
            Some(num) => self.node_name(num),
            None => "the general channel".to_string(),
        };

        self.stage(
            conversation,
            PendingConfirmation {
                text,
                destination,
                reply_to_mesh: record.map(|record| record.mesh_message_id),
                chat_message_id: message_id,
                target_name,
                channel: None,
            },
        )
        .await;
    }

    async fn stage_private(
        &self,
        conversation: ConversationId,
        message_id: ChatMessageId,
        node: &str,
        text: String,
    ) -> std::result::Result<(), String> {
        if !self.connection.is_connected() {
            return Err(not_connected_text());
        }
        let policy = self.auto_reply.policy();
        if !policy.is_private_node(node) {
            return Err(format!(
                "Node '{}' is not in private_node_names. Available: {}",
                node,
                policy.private_node_names.join(", ")
            ));
        }
        let Some(num) = self.directory.resolve(node) else {
            return Err(format!(
                "Node id for '{}' not known yet. Wait for the next node scan.",
                node
            ));
        };

        self.stage(
            conversation,
            PendingConfirmation {
                text,
                destination: Some(num),
                reply_to_mesh: None,
                chat_message_id: message_id,
                target_name: self.node_name(num),
                channel: Some(PRIMARY_CHANNEL),
            },
        )
        .await;
        Ok(())
    }

    async fn stage(&self, conversation: ConversationId, pending: PendingConfirmation) {
        let parts = self.segmenter.split(&pending.text).len();
        if parts == 0 {
            self.reply(conversation, "Nothing to send.", Some(pending.chat_message_id)).await;
            return;
        }

        let message_id = pending.chat_message_id;
        let prompt = format!(
            "Send to {}{}?\n\n{}",
            pending.target_name,
            if parts > 1 {
                format!(" in {} parts", parts)
            } else {
                String::new()
            },
            pending.text
        );

        if let Some(replaced) = self.pending.lock().insert(conversation, pending) {
            debug!(replaced = replaced.chat_message_id, "Unconfirmed message replaced");
        }

        let confirm = CallbackAction::Confirm(message_id).to_string();
        let cancel = CallbackAction::Cancel(message_id).to_string();
        let sent = self
            .retry
            .run("sendConfirmation", || {
                self.chat
                    .send_confirmation(conversation, &prompt, Some(message_id), &confirm, &cancel)
            })
            .await;
        if let Err(e) = sent {
            self.stats.lock().delivery_failures += 1;
            error!(error = %e, "Failed to post confirmation prompt");
        }
    }

    async fn handle_callback(&self, conversation: ConversationId, callback_id: &str, data: &str) {
        let Some(action) = CallbackAction::parse(data) else {
            self.answer(callback_id, Some("Unknown action")).await;
            return;
        };

        // Only the currently staged message may be resolved
        let staged = {
            let mut pending = self.pending.lock();
            match pending.get(&conversation) {
                Some(p) if p.chat_message_id == action.message_id() => pending.remove(&conversation),
                _ => None,
            }
        };
        let Some(staged) = staged else {
            debug!(%action, "Callback for a message that is no longer pending");
            self.answer(callback_id, Some("This message is no longer pending")).await;
            return;
        };

        match action {
            CallbackAction::Cancel(_) => {
                self.answer(callback_id, Some("Cancelled")).await;
                self.reply(conversation, "Message cancelled.", Some(staged.chat_message_id))
                    .await;
            }
            CallbackAction::Confirm(_) => {
                self.answer(callback_id, Some("Sending…")).await;
                let reply = self.deliver(&staged).await;
                self.reply(conversation, &reply, Some(staged.chat_message_id)).await;
            }
        }
    }

    async fn deliver(&self, staged: &PendingConfirmation) -> String {
        let channel = staged
            .channel
            .or(self.auto_reply.policy().default_channel)
            .unwrap_or(PRIMARY_CHANNEL);
        match self
            .transmit(&staged.text, staged.destination, staged.reply_to_mesh, channel)
            .await
        {
            Ok(parts) => {
                self.stats.lock().chat_to_mesh += 1;
                info!(target = %staged.target_name, parts, "Chat message sent to mesh");
                if parts > 1 {
                    format!("✓ Sent to {} in {} parts.", staged.target_name, parts)
                } else {
                    format!("✓ Sent to {}.", staged.target_name)
                }
            }
            Err(failure) => {
                self.stats.lock().delivery_failures += 1;
                match failure.error {
                    BridgeError::NotConnected => not_connected_text(),
                    error => format!(
                        "✗ Failed to send to {} ({} of {} parts sent): {}",
                        staged.target_name, failure.sent, failure.total, error
                    ),
                }
            }
        }
    }

    fn node_name(&self, num: u32) -> String {
        self.connection
            .lookup_node(num)
            .map(|node| node.display_name().to_string())
            .unwrap_or_else(|| node_id_string(num))
    }

    // ===== Chat delivery helpers =====

    async fn send_chat(
        &self,
        conversation: ConversationId,
        text: &str,
        reply_to: Option<ChatMessageId>,
    ) -> Result<ChatMessageId> {
        self.retry
            .run("sendMessage", || self.chat.send_message(conversation, text, reply_to))
            .await
    }

    async fn reply(&self, conversation: ConversationId, text: &str, reply_to: Option<ChatMessageId>) {
        if let Err(e) = self.send_chat(conversation, text, reply_to).await {
            self.stats.lock().delivery_failures += 1;
            error!(error = %e, conversation, "Failed to reply in chat");
        }
    }

    async fn answer(&self, callback_id: &str, text: Option<&str>) {
        if let Err(e) = self.chat.answer_callback(callback_id, text).await {
            debug!(error = %e, "Failed to answer callback");
        }
    }

    fn persist(&self, apply: impl FnOnce(&mut MeshgramConfig)) {
        let Some(watcher) = &self.config_file else {
            return;
        };
        if let Err(e) = watcher.lock().update(apply) {
            warn!(error = %e, "Failed to save configuration");
        }
    }
}

impl std::fmt::Debug for MeshgramBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshgramBridge")
            .field("connection", &self.connection)
            .field("bound_chat", &self.bound_chat())
            .field("stats", &self.stats())
            .finish()
    }
}

fn not_connected_text() -> String {
    "🔴 Not connected to the mesh. Use /connect".to_string()
}

/// Chat text mirroring a received mesh message
pub fn format_inbound_mirror(name: &str, text: &str, is_private: bool, packet: &MeshPacket) -> String {
    let mut mirror = if is_private {
        format!("[PRIVATE from {}] {}", name, text)
    } else {
        format!("[{}] {}", name, text)
    };
    match (packet.hop_count(), packet.rx_snr, packet.rx_rssi) {
        (Some(hops), _, _) if hops > 0 => mirror.push_str(&format!(" ({} hops)", hops)),
        (_, Some(snr), Some(rssi)) => mirror.push_str(&format!(" (SNR: {}, RSSI: {})", snr, rssi)),
        _ => {}
    }
    mirror
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MeshgramConfigBuilder, BROADCAST_NODE};
    use crate::interface::KnownNode;
    use crate::test_utils::{text_packet, MockChatClient, MockMeshConnector};

    const CHAT: ConversationId = -100_500;

    async fn bridge() -> (Arc<MeshgramBridge>, Arc<MockMeshConnector>, Arc<MockChatClient>) {
        let config = MeshgramConfigBuilder::new()
            .chat_id(CHAT)
            .keywords(["ping"])
            .private_nodes(["base"])
            .suffixes("73", "pm")
            .build();
        let connector = Arc::new(MockMeshConnector::new());
        connector.set_nodes(vec![
            KnownNode::new(0x0000_0010, "Base", "Base Station"),
            KnownNode::new(0x0000_0020, "Rvr", "Rover"),
        ]);
        let chat = Arc::new(MockChatClient::new());
        let (bridge, _packets) = MeshgramBridge::new(&config, connector.clone(), chat.clone());
        let bridge = Arc::new(bridge.with_part_delay(Duration::ZERO));
        bridge.start().await;
        (bridge, connector, chat)
    }

    #[test]
    fn test_inbound_mirror_format() {
        let mut packet = text_packet(1, BROADCAST_NODE, 1, "hi");
        assert_eq!(format_inbound_mirror("BS", "hi", false, &packet), "[BS] hi");

        packet.rx_snr = Some(5.5);
        packet.rx_rssi = Some(-90);
        assert_eq!(
            format_inbound_mirror("BS", "hi", true, &packet),
            "[PRIVATE from BS] hi (SNR: 5.5, RSSI: -90)"
        );

        packet.hop_start = Some(4);
        packet.hop_limit = Some(2);
        assert_eq!(format_inbound_mirror("BS", "hi", false, &packet), "[BS] hi (2 hops)");
    }

    #[tokio::test]
    async fn test_broadcast_mirrored_and_recorded() {
        let (bridge, _connector, chat) = bridge().await;
        bridge
            .handle_mesh_packet(text_packet(0x20, BROADCAST_NODE, 900, "hello all"))
            .await;

        let sent = chat.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].text, "[Rvr] hello all");

        let record = bridge.correlation().lookup_by_mesh_id(900).unwrap();
        assert_eq!(record.mirror_message_id, sent[0].id);
        assert_eq!(record.destination_node, None);
        assert_eq!(bridge.directory().resolve("rvr"), Some(0x20));
    }

    #[tokio::test]
    async fn test_private_only_from_allow_list() {
        let (bridge, _connector, chat) = bridge().await;

        bridge.handle_mesh_packet(text_packet(0x20, 0x99, 1, "psst")).await;
        assert!(chat.sent_messages().is_empty());

        bridge.handle_mesh_packet(text_packet(0x10, 0x99, 2, "psst")).await;
        let sent = chat.sent_messages();
        assert_eq!(sent[0].text, "[PRIVATE from Base] psst");
        assert_eq!(
            bridge.correlation().lookup_by_mesh_id(2).unwrap().destination_node,
            Some(0x10)
        );
    }

    #[tokio::test]
    async fn test_mesh_reply_threads_in_chat() {
        let (bridge, _connector, chat) = bridge().await;
        bridge.handle_mesh_packet(text_packet(0x20, BROADCAST_NODE, 10, "first")).await;
        let first_mirror = chat.sent_messages()[0].id;

        let mut reply = text_packet(0x10, BROADCAST_NODE, 11, "answer");
        reply.reply_id = Some(10);
        bridge.handle_mesh_packet(reply).await;

        assert_eq!(chat.sent_messages()[1].reply_to, Some(first_mirror));
    }

    #[tokio::test]
    async fn test_undecodable_packet_dropped() {
        let (bridge, _connector, chat) = bridge().await;
        let mut packet = text_packet(0x20, BROADCAST_NODE, 3, "");
        packet.payload = bytes::Bytes::from_static(&[0xC3, 0x28]);
        bridge.handle_mesh_packet(packet).await;

        assert!(chat.sent_messages().is_empty());
        assert_eq!(bridge.stats().decode_errors, 1);
    }

    #[tokio::test]
    async fn test_auto_reply_transmitted_and_mirrored() {
        let (bridge, connector, chat) = bridge().await;
        let mut packet = text_packet(0x20, BROADCAST_NODE, 42, "ping");
        packet.hop_start = Some(5);
        packet.hop_limit = Some(2);
        bridge.handle_mesh_packet(packet).await;

        let link = connector.last_link().unwrap();
        let sent = link.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].text, "Rvr 3 hops 73");
        assert_eq!(sent[0].reply_id, Some(42));
        assert_eq!(sent[0].destination, None);

        let chat_sent = chat.sent_messages();
        assert_eq!(chat_sent.len(), 2);
        assert_eq!(chat_sent[1].text, "[BOT Auto-reply] to Rvr: [ping...] → Rvr 3 hops 73");
        assert_eq!(chat_sent[1].reply_to, Some(chat_sent[0].id));
    }

    #[tokio::test]
    async fn test_first_contact_binds_chat() {
        let config = MeshgramConfigBuilder::new().build();
        let chat = Arc::new(MockChatClient::new());
        let (bridge, _rx) = MeshgramBridge::new(&config, Arc::new(MockMeshConnector::new()), chat.clone());

        bridge
            .handle_chat_event(ChatEvent::from_text(77, 1, "hello", None, None))
            .await;
        assert_eq!(bridge.bound_chat(), Some(77));
        assert!(chat.sent_messages()[0].text.contains("77"));

        bridge
            .handle_chat_event(ChatEvent::from_text(78, 2, "/status", None, None))
            .await;
        let denied = chat.sent_messages().pop().unwrap();
        assert_eq!(denied.conversation, 78);
        assert!(denied.text.starts_with("Access denied"));
    }

    #[tokio::test]
    async fn test_first_command_runs_after_binding() {
        let config = MeshgramConfigBuilder::new().build();
        let chat = Arc::new(MockChatClient::new());
        let (bridge, _rx) = MeshgramBridge::new(&config, Arc::new(MockMeshConnector::new()), chat.clone());

        bridge
            .handle_chat_event(ChatEvent::from_text(77, 1, "/status", None, None))
            .await;
        assert_eq!(bridge.bound_chat(), Some(77));

        let sent = chat.sent_messages();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].text.starts_with("Hello!"));
        assert!(sent[1].text.contains("Auto-reconnect"));
        assert!(sent.iter().all(|m| m.conversation == 77));
    }

    #[tokio::test]
    async fn test_unknown_command_gets_usage() {
        let (bridge, _connector, chat) = bridge().await;
        bridge
            .handle_chat_event(ChatEvent::from_text(CHAT, 5, "/frobnicate", None, None))
            .await;
        assert!(chat.sent_messages()[0].text.contains("Unknown command /frobnicate"));
    }
}
