//! Keyword-triggered signal reports
//!
//! When a mesh message contains one of the configured keywords as a whole
//! word, the bridge answers on the mesh with how it heard the sender: the
//! hop count when the packet was relayed, otherwise SNR and RSSI.
//!
//! [`AutoReplyEngine::evaluate`] only decides. It returns an
//! [`AutoReplyDecision`] and the bridge performs the transmission and the
//! chat mirror.

use parking_lot::RwLock;
use std::fmt;
use tracing::debug;

use crate::config::{HopRange, ReplyConfig};
use crate::interface::MeshPacket;

/// Characters of the triggering text quoted in the chat mirror
const MIRROR_QUOTE_CHARS: usize = 50;

/// Why no reply is produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipCause {
    /// No keyword in the text
    NoKeyword,
    /// Private message from a node not on the allow-list
    SenderNotAllowed,
}

/// A composed reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyPlan {
    /// Reply text
    pub text: String,
    /// Unicast target for private replies, `None` to broadcast
    pub destination: Option<u32>,
    /// Packet id being answered
    pub reply_id: u32,
    /// Channel the trigger arrived on
    pub channel: u32,
    /// Whether the trigger was a private message
    pub is_private: bool,
}

/// What to do about a received packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoReplyDecision {
    /// Do not reply
    Skip(SkipCause),
    /// Transmit the reply and mirror it to chat
    Transmit(ReplyPlan),
    /// Mirror the reply to chat but keep it off the mesh
    Suppressed {
        /// The reply that would have been sent
        plan: ReplyPlan,
        /// Hop count of the trigger
        hops: u32,
        /// Filter the hop count fell in
        filter: HopRange,
    },
}

/// What the bridge knows about the sender of a packet
#[derive(Debug, Clone, Copy)]
pub struct SenderInfo<'a> {
    /// Short name of the sender
    pub name: &'a str,
    /// Name of the relaying node, when it could be resolved
    pub relay: Option<&'a str>,
}

/// Keyword gate, template selection and hop filter
#[derive(Debug, Default)]
pub struct AutoReplyEngine {
    policy: RwLock<ReplyConfig>,
}

impl AutoReplyEngine {
    /// Create an engine with the given policy
    pub fn new(policy: ReplyConfig) -> Self {
        Self {
            policy: RwLock::new(policy.normalized()),
        }
    }

    /// Replace the policy
    pub fn update_policy(&self, policy: ReplyConfig) {
        *self.policy.write() = policy.normalized();
    }

    /// Current policy
    pub fn policy(&self) -> ReplyConfig {
        self.policy.read().clone()
    }

    /// Decide whether and how to answer `packet`
    pub fn evaluate(&self, packet: &MeshPacket, text: &str, sender: SenderInfo<'_>) -> AutoReplyDecision {
        let policy = self.policy.read();

        if !contains_keyword(text, &policy.keywords) {
            return AutoReplyDecision::Skip(SkipCause::NoKeyword);
        }

        let is_private = packet.is_private();
        if is_private && !policy.is_private_node(sender.name) {
            debug!(sender = sender.name, "Keyword from node not on private list, no reply");
            return AutoReplyDecision::Skip(SkipCause::SenderNotAllowed);
        }

        let suffix = if is_private {
            &policy.private_suffix
        } else {
            &policy.general_suffix
        };
        let hops = packet.hop_count();
        let text = compose_reply(sender, packet, hops, suffix);

        let plan = ReplyPlan {
            text,
            destination: is_private.then_some(packet.from),
            reply_id: packet.id,
            channel: packet.channel,
            is_private,
        };

        if !is_private {
            if let (Some(filter), Some(hops)) = (policy.hop_filter, hops) {
                if filter.contains(hops) {
                    debug!(hops, %filter, "Auto-reply suppressed by hop filter");
                    return AutoReplyDecision::Suppressed { plan, hops, filter };
                }
            }
        }

        AutoReplyDecision::Transmit(plan)
    }
}

/// Whole-word, case-insensitive keyword match
pub fn contains_keyword(text: &str, keywords: &[String]) -> bool {
    if keywords.is_empty() {
        return false;
    }
    text.split_whitespace()
        .map(str::to_lowercase)
        .any(|token| keywords.iter().any(|kw| *kw == token))
}

struct Signal(Option<f32>, Option<i32>);

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(snr) => write!(f, "SNR: {}, ", snr)?,
            None => write!(f, "SNR: unknown, ")?,
        }
        match self.1 {
            Some(rssi) => write!(f, "RSSI: {}", rssi),
            None => write!(f, "RSSI: unknown"),
        }
    }
}

fn compose_reply(sender: SenderInfo<'_>, packet: &MeshPacket, hops: Option<u32>, suffix: &str) -> String {
    let mut pieces = vec![sender.name.to_string()];
    match hops {
        Some(hops) if hops > 0 => pieces.push(format!("{} hops", hops)),
        _ => pieces.push(Signal(packet.rx_snr, packet.rx_rssi).to_string()),
    }
    if let Some(relay) = sender.relay.filter(|relay| !relay.is_empty()) {
        pieces.push(format!("via {}", relay));
    }
    if !suffix.trim().is_empty() {
        pieces.push(suffix.trim().to_string());
    }
    pieces.join(" ")
}

/// Chat text announcing an auto-reply
pub fn mirror_text(sender: &str, original: &str, decision: &AutoReplyDecision) -> Option<String> {
    let (plan, note) = match decision {
        AutoReplyDecision::Skip(_) => return None,
        AutoReplyDecision::Transmit(plan) => (plan, String::new()),
        AutoReplyDecision::Suppressed { plan, hops, filter } => (
            plan,
            format!(" (not sent: {} hops within filter {})", hops, filter),
        ),
    };
    let prefix = if plan.is_private {
        "[BOT Auto-reply (private)]"
    } else {
        "[BOT Auto-reply]"
    };
    let quote: String = original.chars().take(MIRROR_QUOTE_CHARS).collect();
    Some(format!(
        "{} to {}: [{}...] → {}{}",
        prefix, sender, quote, plan.text, note
    ))
}
