//! Integration tests for the mesh ↔ chat bridge
//!
//! These tests drive a full [`MeshgramBridge`] over the in-memory radio and
//! chat doubles:
//! - Reply threading in both directions
//! - The accept/cancel workflow for outbound chat text
//! - Segmentation of long outbound text
//! - Keyword auto-replies and the hop filter
//! - Chat commands, binding and access control
//! - The run loop: forwarding, health checks and shutdown

use meshgram_bridge::test_utils::text_packet;
use meshgram_bridge::{
    ChatEvent, ConfigWatcher, ConnectionState, HotConfig, KnownNode, MeshgramBridge,
    MeshgramConfig, MeshgramConfigBuilder, MockChatClient, MockMeshConnector, MockMeshLink,
    ModemPreset, BROADCAST_NODE, MESSAGE_SPLIT_DELAY,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};

const CHAT: i64 = -100_777;
const BASE: u32 = 0x0000_0010;
const ROVER: u32 = 0x0000_0020;

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    bridge: Arc<MeshgramBridge>,
    connector: Arc<MockMeshConnector>,
    chat: Arc<MockChatClient>,
}

fn builder() -> MeshgramConfigBuilder {
    MeshgramConfigBuilder::new()
        .chat_id(CHAT)
        .keywords(["ping", "test"])
        .private_nodes(["base", "ghost"])
        .suffixes("73", "pm")
}

fn connector() -> Arc<MockMeshConnector> {
    let connector = Arc::new(MockMeshConnector::new());
    connector.set_nodes(vec![
        KnownNode::new(BASE, "Base", "Base Station"),
        KnownNode::new(ROVER, "Rvr", "Rover"),
    ]);
    connector
}

async fn harness_with(config: MeshgramConfig, watcher: Option<ConfigWatcher>) -> Harness {
    let connector = connector();
    let chat = Arc::new(MockChatClient::new());
    let (bridge, _packets) = MeshgramBridge::new(&config, connector.clone(), chat.clone());
    let mut bridge = bridge.with_part_delay(Duration::ZERO);
    if let Some(watcher) = watcher {
        bridge = bridge.with_config_file(watcher);
    }
    let bridge = Arc::new(bridge);
    bridge.start().await;
    Harness {
        bridge,
        connector,
        chat,
    }
}

async fn harness() -> Harness {
    harness_with(builder().build(), None).await
}

impl Harness {
    fn link(&self) -> Arc<MockMeshLink> {
        self.connector.last_link().expect("no link opened")
    }

    async fn say(&self, message_id: i64, text: &str, reply_to: Option<i64>) {
        self.bridge
            .handle_chat_event(ChatEvent::from_text(
                CHAT,
                message_id,
                text,
                reply_to,
                Some("operator".into()),
            ))
            .await;
    }

    async fn press(&self, data: &str) {
        let prompt = self.chat.confirmations().last().map(|m| m.id).unwrap_or(0);
        self.bridge
            .handle_chat_event(ChatEvent::Callback {
                conversation: CHAT,
                message_id: prompt,
                callback_id: format!("cb-{}", data),
                data: data.to_string(),
            })
            .await;
    }

    fn last_text(&self) -> String {
        self.chat.last_message().map(|m| m.text).unwrap_or_default()
    }
}

fn temp_config_path() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.json");
    (dir, path)
}

// ============================================================================
// Reply threading
// ============================================================================

#[tokio::test]
async fn test_reply_chain_across_both_sides() {
    let h = harness().await;

    // Mesh message A is mirrored
    h.bridge
        .handle_mesh_packet(text_packet(ROVER, BROADCAST_NODE, 100, "anyone around?"))
        .await;
    let mirror_a = h.chat.last_message().unwrap();
    assert_eq!(mirror_a.text, "[Rvr] anyone around?");

    // A chat reply to the mirror becomes a mesh reply to A
    h.say(10, "I hear you", Some(mirror_a.id)).await;
    let prompt = h.chat.confirmations().pop().unwrap();
    assert_eq!(
        prompt.buttons,
        Some(("confirm_send_10".to_string(), "cancel_send_10".to_string()))
    );
    assert!(prompt.text.contains("the general channel"));
    assert!(h.link().sent().is_empty());

    h.press("confirm_send_10").await;
    let sent = h.link().sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].text, "I hear you");
    assert_eq!(sent[0].reply_id, Some(100));
    assert_eq!(sent[0].destination, None);
    assert_eq!(h.last_text(), "✓ Sent to the general channel.");

    // Mesh message B replying to A threads onto A's mirror
    let mut b = text_packet(BASE, BROADCAST_NODE, 101, "me too");
    b.reply_id = Some(100);
    h.bridge.handle_mesh_packet(b).await;
    let mirror_b = h.chat.last_message().unwrap();
    assert_eq!(mirror_b.reply_to, Some(mirror_a.id));
}

#[tokio::test]
async fn test_reply_to_private_mirror_is_unicast() {
    let h = harness().await;

    h.bridge
        .handle_mesh_packet(text_packet(BASE, 0x0000_0099, 200, "status?"))
        .await;
    let mirror = h.chat.last_message().unwrap();
    assert_eq!(mirror.text, "[PRIVATE from Base] status?");

    h.say(11, "all good", Some(mirror.id)).await;
    assert!(h.chat.confirmations()[0].text.contains("Base"));
    h.press("confirm_send_11").await;

    let sent = h.link().sent();
    assert_eq!(sent[0].destination, Some(BASE));
    assert_eq!(sent[0].reply_id, Some(200));
}

#[tokio::test]
async fn test_reply_to_unknown_message_broadcasts() {
    let h = harness().await;
    h.say(12, "hello mesh", Some(9_999)).await;
    h.press("confirm_send_12").await;

    let sent = h.link().sent();
    assert_eq!(sent[0].reply_id, None);
    assert_eq!(sent[0].destination, None);
}

// ============================================================================
// Confirmation workflow
// ============================================================================

#[tokio::test]
async fn test_cancel_sends_nothing() {
    let h = harness().await;
    h.say(20, "drop me", None).await;
    assert!(h.bridge.pending(CHAT).is_some());

    h.press("cancel_send_20").await;
    assert!(h.link().sent().is_empty());
    assert!(h.bridge.pending(CHAT).is_none());
    assert_eq!(h.last_text(), "Message cancelled.");
}

#[tokio::test]
async fn test_new_message_replaces_pending() {
    let h = harness().await;
    h.say(21, "first", None).await;
    h.say(22, "second", None).await;
    assert_eq!(h.bridge.pending(CHAT).unwrap().chat_message_id, 22);

    // The replaced message can no longer be confirmed
    h.press("confirm_send_21").await;
    assert!(h.link().sent().is_empty());
    let (_, notice) = h.chat.answers().pop().unwrap();
    assert_eq!(notice.as_deref(), Some("This message is no longer pending"));
    assert!(h.bridge.pending(CHAT).is_some());

    h.press("confirm_send_22").await;
    let sent = h.link().sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].text, "second");

    // A second press is a no-op
    h.press("confirm_send_22").await;
    assert_eq!(h.link().sent().len(), 1);
}

#[tokio::test]
async fn test_garbage_callback_data() {
    let h = harness().await;
    h.say(23, "keep me", None).await;
    h.press("launch_rockets").await;

    assert!(h.link().sent().is_empty());
    assert!(h.bridge.pending(CHAT).is_some());
    assert_eq!(
        h.chat.answers().pop().unwrap().1.as_deref(),
        Some("Unknown action")
    );
}

#[tokio::test]
async fn test_confirm_after_link_loss_reports_not_connected() {
    let h = harness().await;
    h.say(24, "hello", None).await;
    h.bridge.connection().disconnect(false).await;

    h.press("confirm_send_24").await;
    assert!(h.last_text().contains("Not connected"));
    assert_eq!(h.bridge.stats().chat_to_mesh, 0);
}

#[tokio::test]
async fn test_staging_requires_connection() {
    let h = harness().await;
    h.say(25, "/disconnect", None).await;
    h.say(26, "anyone?", None).await;

    assert!(h.bridge.pending(CHAT).is_none());
    assert!(h.last_text().contains("Not connected to the mesh. Use /connect"));
}

// ============================================================================
// Segmentation
// ============================================================================

#[tokio::test]
async fn test_long_text_split_with_reply_on_first_part() {
    let config = builder().default_channel(2).build();
    let h = harness_with(config, None).await;

    h.bridge
        .handle_mesh_packet(text_packet(ROVER, BROADCAST_NODE, 300, "report please"))
        .await;
    let mirror = h.chat.last_message().unwrap();

    let long = "status ".repeat(80);
    h.say(30, &long, Some(mirror.id)).await;
    let prompt = h.chat.confirmations().pop().unwrap();
    assert!(prompt.text.contains("parts"));

    h.press("confirm_send_30").await;
    let sent = h.link().sent();
    let total = sent.len();
    assert!(total > 1);
    for (i, part) in sent.iter().enumerate() {
        assert!(part.text.ends_with(&format!("[{}/{}]", i + 1, total)));
        assert!(part.text.len() <= 200);
        assert_eq!(part.channel, 2);
    }
    assert_eq!(sent[0].reply_id, Some(300));
    assert!(sent[1..].iter().all(|part| part.reply_id.is_none()));
    assert_eq!(
        h.last_text(),
        format!("✓ Sent to the general channel in {} parts.", total)
    );
}

#[tokio::test(start_paused = true)]
async fn test_parts_are_paced() {
    let config = builder().build();
    let connector = connector();
    let chat = Arc::new(MockChatClient::new());
    let (bridge, _packets) = MeshgramBridge::new(&config, connector.clone(), chat);
    bridge.start().await;

    let started = tokio::time::Instant::now();
    let parts = bridge
        .transmit(&"word ".repeat(120), None, None, 0)
        .await
        .unwrap();

    assert!(parts > 1);
    assert_eq!(started.elapsed(), MESSAGE_SPLIT_DELAY * (parts as u32 - 1));
}

#[tokio::test]
async fn test_failed_part_aborts_transmission() {
    let h = harness().await;
    h.link().fail_sends(true);

    let failure = h
        .bridge
        .transmit(&"word ".repeat(120), None, None, 0)
        .await
        .unwrap_err();
    assert_eq!(failure.sent, 0);
    assert!(failure.total > 1);
    assert!(failure.error.is_transport_failure());
    assert_eq!(h.bridge.connection().state(), ConnectionState::Disconnected);
}

// ============================================================================
// Auto-replies
// ============================================================================

#[tokio::test]
async fn test_broadcast_keyword_auto_reply() {
    let h = harness().await;
    let mut packet = text_packet(ROVER, BROADCAST_NODE, 400, "Ping from the hill");
    packet.rx_snr = Some(6.25);
    packet.rx_rssi = Some(-101);
    h.bridge.handle_mesh_packet(packet).await;

    let sent = h.link().sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].text, "Rvr SNR: 6.25, RSSI: -101 73");
    assert_eq!(sent[0].reply_id, Some(400));
    assert_eq!(sent[0].destination, None);
    assert!(h.last_text().starts_with("[BOT Auto-reply] to Rvr"));
    assert_eq!(h.bridge.stats().auto_replies_sent, 1);
}

#[tokio::test]
async fn test_hop_filter_suppresses_broadcast_reply() {
    let config = builder().hop_filter(2, 4).build();
    let h = harness_with(config, None).await;

    let mut packet = text_packet(ROVER, BROADCAST_NODE, 401, "ping");
    packet.hop_start = Some(5);
    packet.hop_limit = Some(2);
    h.bridge.handle_mesh_packet(packet).await;

    assert!(h.link().sent().is_empty());
    assert!(h
        .last_text()
        .ends_with("(not sent: 3 hops within filter [2, 4])"));
    assert_eq!(h.bridge.stats().auto_replies_suppressed, 1);

    // Private replies ignore the filter
    let mut private = text_packet(BASE, 0x0000_0099, 402, "test");
    private.hop_start = Some(5);
    private.hop_limit = Some(2);
    h.bridge.handle_mesh_packet(private).await;

    let sent = h.link().sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].destination, Some(BASE));
    assert_eq!(sent[0].text, "Base 3 hops pm");
}

#[tokio::test]
async fn test_failed_auto_reply_noted_in_mirror() {
    let h = harness().await;
    h.link().fail_sends(true);

    h.bridge
        .handle_mesh_packet(text_packet(ROVER, BROADCAST_NODE, 403, "ping"))
        .await;

    let mirror = h.last_text();
    assert!(mirror.starts_with("[BOT Auto-reply] to Rvr"));
    assert!(mirror.ends_with("(send failed)"));
    assert_eq!(h.bridge.stats().auto_replies_sent, 0);
    assert_eq!(h.bridge.stats().delivery_failures, 1);
}

#[tokio::test]
async fn test_private_keyword_from_unlisted_node_ignored() {
    let h = harness().await;
    h.bridge
        .handle_mesh_packet(text_packet(ROVER, 0x0000_0099, 403, "ping"))
        .await;

    assert!(h.link().sent().is_empty());
    assert!(h.chat.sent_messages().is_empty());
}

#[tokio::test]
async fn test_relay_named_in_reply() {
    let h = harness().await;
    let mut packet = text_packet(ROVER, BROADCAST_NODE, 404, "ping");
    packet.hop_start = Some(3);
    packet.hop_limit = Some(2);
    packet.relay_node = Some((BASE & 0xFF) as u8);
    h.bridge.handle_mesh_packet(packet).await;

    assert_eq!(h.link().sent()[0].text, "Rvr 1 hops via Base 73");
}

#[tokio::test]
async fn test_hot_config_changes_policy() {
    let h = harness().await;
    let mut hot: HotConfig = builder().keywords(["hello"]).build().hot();
    hot.api_timeout = Duration::from_secs(45);
    h.bridge.apply_hot_config(hot);

    h.bridge
        .handle_mesh_packet(text_packet(ROVER, BROADCAST_NODE, 405, "ping"))
        .await;
    assert!(h.link().sent().is_empty());

    h.bridge
        .handle_mesh_packet(text_packet(ROVER, BROADCAST_NODE, 406, "hello"))
        .await;
    assert_eq!(h.link().sent().len(), 1);
    assert_eq!(h.chat.api_timeout(), Some(Duration::from_secs(45)));
}

#[tokio::test]
async fn test_reload_from_file() {
    let (_dir, path) = temp_config_path();
    let h = harness_with(builder().build(), Some(ConfigWatcher::new(&path))).await;

    builder().keywords(["qrv"]).build().save(&path).unwrap();
    h.bridge.reload_config();
    assert_eq!(h.bridge.auto_reply().policy().keywords, vec!["qrv"]);

    // Unchanged file is not reloaded
    h.bridge.auto_reply().update_policy(builder().build().reply);
    h.bridge.reload_config();
    assert_eq!(h.bridge.auto_reply().policy().keywords, vec!["ping", "test"]);
}

// ============================================================================
// Commands and access control
// ============================================================================

#[tokio::test]
async fn test_pm_flow() {
    let h = harness().await;

    h.say(40, "/pm rvr hi", None).await;
    assert!(h.last_text().contains("not in private_node_names"));
    assert!(h.last_text().contains("base, ghost"));

    h.say(41, "/pm ghost hi", None).await;
    assert!(h.last_text().contains("not known yet"));
    assert!(h.bridge.pending(CHAT).is_none());

    h.say(42, "/pm Base meet at the tower", None).await;
    let pending = h.bridge.pending(CHAT).unwrap();
    assert_eq!(pending.destination, Some(BASE));
    assert_eq!(pending.text, "meet at the tower");

    h.press("confirm_send_42").await;
    let sent = h.link().sent();
    assert_eq!(sent[0].destination, Some(BASE));
    assert_eq!(sent[0].text, "meet at the tower");
    assert_eq!(h.last_text(), "✓ Sent to Base.");
}

#[tokio::test]
async fn test_pm_uses_primary_channel() {
    let h = harness_with(builder().default_channel(2).build(), None).await;

    h.say(44, "/pm base on channel zero", None).await;
    h.press("confirm_send_44").await;
    h.say(45, "everyone on two", None).await;
    h.press("confirm_send_45").await;

    let sent = h.link().sent();
    assert_eq!(sent.len(), 2);
    assert_eq!((sent[0].destination, sent[0].channel), (Some(BASE), 0));
    assert_eq!((sent[1].destination, sent[1].channel), (None, 2));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_and_connect_commands() {
    let h = harness().await;
    assert_eq!(h.connector.connect_count(), 1);

    h.say(50, "/disconnect", None).await;
    assert!(h.last_text().contains("Auto-reconnect paused"));
    assert!(h.link().is_closed());

    tokio::time::advance(Duration::from_secs(600)).await;
    assert!(!h.bridge.connection().check_health().await);
    assert_eq!(h.connector.connect_count(), 1);

    h.say(51, "/connect", None).await;
    assert!(h.last_text().starts_with("✓ Connected to"));
    assert!(h.last_text().contains("Auto-reconnect enabled"));
    assert_eq!(h.connector.connect_count(), 2);
    assert!(h.bridge.connection().is_connected());
}

#[tokio::test]
async fn test_connect_failure_reported() {
    let h = harness().await;
    h.connector.set_failing(true);
    h.say(52, "/connect 10.9.9.9:4403", None).await;

    assert!(h.last_text().starts_with("✗ Failed to connect to 10.9.9.9:4403"));
    assert!(!h.bridge.connection().is_manually_disconnected());
}

#[tokio::test]
async fn test_connect_address_is_persisted() {
    let (_dir, path) = temp_config_path();
    builder().build().save(&path).unwrap();
    let h = harness_with(builder().build(), Some(ConfigWatcher::new(&path))).await;

    h.say(53, "/connect 10.1.1.1:4500", None).await;
    assert_eq!(h.bridge.connection().address().to_string(), "10.1.1.1:4500");

    let saved = MeshgramConfig::load(&path).unwrap();
    assert_eq!(saved.mesh.host, "10.1.1.1");
    assert_eq!(saved.mesh.port, 4500);
}

#[tokio::test]
async fn test_status_report() {
    let h = harness().await;
    h.say(60, "queued", None).await;
    h.say(61, "/status", None).await;

    let status = h.last_text();
    assert!(status.contains("Connected"));
    assert!(status.contains("Auto-reconnect: ✅ Enabled"));
    assert!(status.contains("Known nodes: 2"));
    assert!(status.contains("Private nodes: 2"));
    assert!(status.contains("Keywords: 2"));
    assert!(status.contains("Pending confirmation: yes"));
}

#[tokio::test]
async fn test_set_preset() {
    let h = harness().await;
    h.say(70, "/set_preset medium_fast 2", None).await;
    assert_eq!(h.link().presets(), vec![(ModemPreset::MediumFast, 2)]);
    assert!(h.last_text().contains("MEDIUM_FAST"));

    h.say(71, "/set_preset medium_fast 9", None).await;
    assert!(h.last_text().starts_with("Slot must be between"));
    assert_eq!(h.link().presets().len(), 1);
}

#[tokio::test]
async fn test_binding_and_access_control() {
    let (_dir, path) = temp_config_path();
    let config = MeshgramConfigBuilder::new().private_nodes(["base"]).build();
    config.save(&path).unwrap();
    let h = harness_with(config, Some(ConfigWatcher::new(&path))).await;

    // Mesh traffic is not mirrored while unbound
    h.bridge
        .handle_mesh_packet(text_packet(ROVER, BROADCAST_NODE, 80, "early"))
        .await;
    assert!(h.chat.sent_messages().is_empty());

    h.bridge
        .handle_chat_event(ChatEvent::from_text(42, 1, "hi", None, None))
        .await;
    assert_eq!(h.bridge.bound_chat(), Some(42));
    assert!(h.last_text().contains("42"));
    assert!(h.bridge.pending(42).is_none());
    assert_eq!(MeshgramConfig::load(&path).unwrap().chat.chat_id, Some(42));

    h.bridge
        .handle_chat_event(ChatEvent::from_text(43, 2, "let me in", None, None))
        .await;
    let denied = h.chat.last_message().unwrap();
    assert_eq!(denied.conversation, 43);
    assert!(denied.text.starts_with("Access denied"));
    assert!(h.bridge.pending(43).is_none());

    h.bridge
        .handle_mesh_packet(text_packet(ROVER, BROADCAST_NODE, 81, "later"))
        .await;
    assert_eq!(h.chat.last_message().unwrap().conversation, 42);
}

#[tokio::test(start_paused = true)]
async fn test_chat_timeouts_are_retried() {
    let h = harness().await;
    h.chat.fail_next(2);
    h.bridge
        .handle_mesh_packet(text_packet(ROVER, BROADCAST_NODE, 90, "hello"))
        .await;

    assert_eq!(h.chat.sent_messages().len(), 1);
    assert!(h.bridge.correlation().lookup_by_mesh_id(90).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_chat_delivery_gives_up_after_retries() {
    let h = harness().await;
    h.chat.fail_next(4);
    h.bridge
        .handle_mesh_packet(text_packet(ROVER, BROADCAST_NODE, 91, "hello"))
        .await;

    assert!(h.chat.sent_messages().is_empty());
    assert!(h.bridge.correlation().lookup_by_mesh_id(91).is_none());
    assert_eq!(h.bridge.stats().delivery_failures, 1);
}

// ============================================================================
// Run loop
// ============================================================================

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_run_loop_forwards_and_shuts_down() {
    let config = builder().build();
    let connector = connector();
    let chat = Arc::new(MockChatClient::new());
    let (bridge, packets) = MeshgramBridge::new(&config, connector.clone(), chat.clone());
    let bridge = Arc::new(bridge.with_part_delay(Duration::ZERO));

    let (chat_tx, chat_rx) = mpsc::channel(8);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(bridge.clone().run(packets, chat_rx, async {
        stop_rx.await.ok();
    }));

    wait_until(|| bridge.connection().is_connected()).await;
    let link = connector.last_link().unwrap();
    link.inject(text_packet(ROVER, BROADCAST_NODE, 500, "over the air"));
    wait_until(|| !chat.sent_messages().is_empty()).await;
    assert_eq!(chat.sent_messages()[0].text, "[Rvr] over the air");

    chat_tx
        .send(ChatEvent::from_text(CHAT, 1, "/status", None, None))
        .await
        .unwrap();
    wait_until(|| chat.sent_messages().len() == 2).await;

    stop_tx.send(()).unwrap();
    task.await.unwrap();
    assert!(link.is_closed());
    assert!(bridge.connection().is_manually_disconnected());
}

#[tokio::test(start_paused = true)]
async fn test_run_loop_recovers_lost_link() {
    let config = builder().build();
    let connector = connector();
    let chat = Arc::new(MockChatClient::new());
    let (bridge, packets) = MeshgramBridge::new(&config, connector.clone(), chat);
    let bridge = Arc::new(bridge);

    let (_chat_tx, chat_rx) = mpsc::channel(8);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(bridge.clone().run(packets, chat_rx, async {
        stop_rx.await.ok();
    }));

    while !bridge.connection().is_connected() {
        tokio::task::yield_now().await;
    }
    let first = connector.last_link().unwrap();
    first.fail_probes(true);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(first.is_closed());
    assert_eq!(connector.connect_count(), 2);
    assert!(bridge.connection().is_connected());

    stop_tx.send(()).unwrap();
    task.await.unwrap();
}
