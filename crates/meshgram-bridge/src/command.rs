//! Chat command surface
//!
//! ```text
//! /connect [host:port]         connect (and remember the address)
//! /disconnect                  disconnect and stop reconnecting
//! /pm <node> <text>            private message to an allow-listed node
//! /status                      connection and policy summary
//! /set_preset <preset> <slot>  write the LoRa modem preset
//! ```
//!
//! Inline confirmation buttons carry `confirm_send_<id>` or
//! `cancel_send_<id>`, where `<id>` is the chat message being confirmed.

use std::fmt;

use crate::chat::ChatMessageId;
use crate::config::MeshAddress;
use crate::interface::ModemPreset;

const CONFIRM_PREFIX: &str = "confirm_send_";
const CANCEL_PREFIX: &str = "cancel_send_";

/// Highest frequency slot accepted by `/set_preset`
pub const MAX_PRESET_SLOT: u8 = 7;

/// Usage text listing every command
pub const USAGE: &str = "Commands:\n\
/connect [host:port] - connect to the mesh node\n\
/disconnect - disconnect and pause auto-reconnect\n\
/pm <node_name> <text> - private message to a node\n\
/status - bridge status\n\
/set_preset <preset> <slot 0-7> - set the LoRa modem preset\n\
Any other text is broadcast to the mesh after confirmation.";

/// A parsed chat command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Connect to the given address, or the current one
    Connect(Option<MeshAddress>),
    /// Manual disconnect
    Disconnect,
    /// Private message
    Pm {
        /// Short name of the target node
        node: String,
        /// Message text
        text: String,
    },
    /// Status report
    Status,
    /// Modem preset change
    SetPreset {
        /// Preset to apply
        preset: ModemPreset,
        /// Frequency slot
        slot: u8,
    },
    /// Usage help (`/start`, `/help`)
    Help,
}

/// Reason a command could not be parsed, phrased for the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandUsage(pub String);

impl fmt::Display for CommandUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn usage(text: impl Into<String>) -> CommandUsage {
    CommandUsage(text.into())
}

impl Command {
    /// Parse a command from its name and argument text
    pub fn parse(name: &str, args: &str) -> std::result::Result<Self, CommandUsage> {
        let args = args.trim();
        match name {
            "connect" => parse_connect(args),
            "disconnect" => Ok(Command::Disconnect),
            "pm" => {
                let mut parts = args.splitn(2, char::is_whitespace);
                let node = parts.next().unwrap_or_default().trim();
                let text = parts.next().unwrap_or_default().trim();
                if node.is_empty() || text.is_empty() {
                    return Err(usage("Usage: /pm <node_name> <text>"));
                }
                Ok(Command::Pm {
                    node: node.to_lowercase(),
                    text: text.to_string(),
                })
            }
            "status" => Ok(Command::Status),
            "set_preset" => parse_set_preset(args),
            "start" | "help" => Ok(Command::Help),
            other => Err(usage(format!("Unknown command /{}\n\n{}", other, USAGE))),
        }
    }
}

fn parse_connect(args: &str) -> std::result::Result<Command, CommandUsage> {
    let tokens: Vec<&str> = args.split_whitespace().collect();
    match tokens.as_slice() {
        [] => Ok(Command::Connect(None)),
        [addr] => {
            let (host, port) = addr
                .rsplit_once(':')
                .filter(|(host, _)| !host.is_empty())
                .ok_or_else(|| usage("Invalid address: use host:port"))?;
            let port = port
                .parse::<u16>()
                .map_err(|_| usage("Port must be a number between 1 and 65535"))?;
            if port == 0 {
                return Err(usage("Port must be a number between 1 and 65535"));
            }
            Ok(Command::Connect(Some(MeshAddress::new(host, port))))
        }
        _ => Err(usage("Usage: /connect [host:port]")),
    }
}

fn parse_set_preset(args: &str) -> std::result::Result<Command, CommandUsage> {
    let tokens: Vec<&str> = args.split_whitespace().collect();
    let [preset, slot] = tokens.as_slice() else {
        return Err(usage(format!(
            "Usage: /set_preset <preset> <slot 0-{}>",
            MAX_PRESET_SLOT
        )));
    };
    let preset = preset.parse::<ModemPreset>().map_err(|_| {
        let names: Vec<&str> = ModemPreset::ALL.iter().map(|p| p.as_str()).collect();
        usage(format!(
            "Unknown preset '{}'. Available: {}",
            preset,
            names.join(", ")
        ))
    })?;
    let slot = slot
        .parse::<u8>()
        .ok()
        .filter(|slot| *slot <= MAX_PRESET_SLOT)
        .ok_or_else(|| usage(format!("Slot must be between 0 and {}", MAX_PRESET_SLOT)))?;
    Ok(Command::SetPreset { preset, slot })
}

/// Inline button action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    /// Send the staged message
    Confirm(ChatMessageId),
    /// Drop the staged message
    Cancel(ChatMessageId),
}

impl CallbackAction {
    /// Parse button data
    pub fn parse(data: &str) -> Option<Self> {
        if let Some(id) = data.strip_prefix(CONFIRM_PREFIX) {
            return id.parse().ok().map(CallbackAction::Confirm);
        }
        if let Some(id) = data.strip_prefix(CANCEL_PREFIX) {
            return id.parse().ok().map(CallbackAction::Cancel);
        }
        None
    }

    /// Staged chat message the action refers to
    pub fn message_id(&self) -> ChatMessageId {
        match self {
            CallbackAction::Confirm(id) | CallbackAction::Cancel(id) => *id,
        }
    }
}

impl fmt::Display for CallbackAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackAction::Confirm(id) => write!(f, "{}{}", CONFIRM_PREFIX, id),
            CallbackAction::Cancel(id) => write!(f, "{}{}", CANCEL_PREFIX, id),
        }
    }
}
