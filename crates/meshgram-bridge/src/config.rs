//! Configuration types for the mesh/chat bridge
//!
//! This module provides the configuration structures for the bridge: the
//! mesh endpoint, chat credentials, auto-reply policy and the control loop
//! timing. Configuration is stored as JSON on disk. The `reply` section and
//! the chat API timeout can be changed while the bridge is running; the
//! [`ConfigWatcher`] notices the file changing and hands back the new values.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

use crate::error::{BridgeError, Result};

/// Maximum payload size for Meshtastic LoRa packets
pub const LORA_MAX_PAYLOAD: usize = 237;

/// Byte budget for one outbound text part (leaves headroom under the LoRa payload)
pub const MAX_BYTES_PER_MESSAGE: usize = 200;

/// Bytes held back in every part for the `[i/N]` marker
pub const MARKER_RESERVE: usize = 10;

/// Pause between the parts of a multi-part transmission
pub const MESSAGE_SPLIT_DELAY: Duration = Duration::from_millis(1500);

/// Meshtastic stream protocol magic number (first 2 bytes of a frame)
pub const MESHTASTIC_MAGIC: u16 = 0x94C3;

/// Default TCP port of the Meshtastic stream API
pub const DEFAULT_MESH_PORT: u16 = 4403;

/// Default connection timeout
pub const DEFAULT_TIMEOUT_MS: u64 = 10000;

/// Reserved node number addressing every node
pub const BROADCAST_NODE: u32 = 0xFFFF_FFFF;

/// Number of mesh↔chat message pairs remembered for reply threading
pub const CORRELATION_CAPACITY: usize = 1000;

/// Upper bound of the reconnect backoff
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Main configuration for the bridge
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshgramConfig {
    /// Mesh endpoint
    #[serde(default)]
    pub mesh: MeshConfig,

    /// Chat service settings
    #[serde(default)]
    pub chat: ChatConfig,

    /// Auto-reply and relay policy (hot-reloadable)
    #[serde(default)]
    pub reply: ReplyConfig,

    /// Health checking and reconnection
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// Address of a Meshtastic node exposing the TCP stream API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshAddress {
    /// Host name or IP address
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl MeshAddress {
    /// Create a new address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for MeshAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for MeshAddress {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| BridgeError::InvalidAddress(s.to_string()))?;
        if host.is_empty() {
            return Err(BridgeError::InvalidAddress(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| BridgeError::InvalidAddress(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

/// Mesh endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Host of the Meshtastic node
    #[serde(default = "default_mesh_host")]
    pub host: String,

    /// TCP port of the stream API
    #[serde(default = "default_mesh_port")]
    pub port: u16,

    /// Timeout for opening the connection
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
}

fn default_mesh_host() -> String {
    "127.0.0.1".to_string()
}

fn default_mesh_port() -> u16 {
    DEFAULT_MESH_PORT
}

fn default_connect_timeout() -> Duration {
    Duration::from_millis(DEFAULT_TIMEOUT_MS)
}

impl MeshConfig {
    /// The configured address
    pub fn address(&self) -> MeshAddress {
        MeshAddress::new(self.host.clone(), self.port)
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            host: default_mesh_host(),
            port: DEFAULT_MESH_PORT,
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// Chat service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Bot API token
    #[serde(default)]
    pub token: Option<String>,

    /// Bound conversation; learnt from the first message when absent
    #[serde(default, deserialize_with = "deserialize_chat_id")]
    pub chat_id: Option<i64>,

    /// Timeout for a single chat API call
    #[serde(with = "humantime_serde", default = "default_api_timeout")]
    pub api_timeout: Duration,

    /// Long-poll duration requested from the chat service
    #[serde(with = "humantime_serde", default = "default_poll_timeout")]
    pub poll_timeout: Duration,
}

fn default_api_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_poll_timeout() -> Duration {
    Duration::from_secs(20)
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            token: None,
            chat_id: None,
            api_timeout: default_api_timeout(),
            poll_timeout: default_poll_timeout(),
        }
    }
}

/// Accepts the chat id either as a JSON number or as a string
fn deserialize_chat_id<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawChatId {
        Number(i64),
        Text(String),
    }

    match Option::<RawChatId>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawChatId::Number(id)) => Ok(Some(id)),
        Some(RawChatId::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(RawChatId::Text(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Inclusive hop-count range, written as `[min, max]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u32; 2]", into = "[u32; 2]")]
pub struct HopRange {
    /// Smallest hop count in the range
    pub min: u32,
    /// Largest hop count in the range
    pub max: u32,
}

impl HopRange {
    /// Create a new range
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    /// Check if a hop count falls inside the range
    pub fn contains(&self, hops: u32) -> bool {
        (self.min..=self.max).contains(&hops)
    }
}

impl From<[u32; 2]> for HopRange {
    fn from([min, max]: [u32; 2]) -> Self {
        Self { min, max }
    }
}

impl From<HopRange> for [u32; 2] {
    fn from(range: HopRange) -> Self {
        [range.min, range.max]
    }
}

impl fmt::Display for HopRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// Auto-reply and relay policy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplyConfig {
    /// Words that trigger an auto-reply
    #[serde(default)]
    pub keywords: Vec<String>,

    /// Short names of nodes allowed to talk to the bridge privately
    #[serde(default)]
    pub private_node_names: Vec<String>,

    /// Suffix appended to auto-replies on the general channel
    #[serde(default)]
    pub general_suffix: String,

    /// Suffix appended to private auto-replies
    #[serde(default)]
    pub private_suffix: String,

    /// Channel index used for chat-originated broadcasts
    #[serde(default)]
    pub default_channel: Option<u32>,

    /// Broadcast auto-replies are not transmitted for hop counts inside this range
    #[serde(default)]
    pub hop_filter: Option<HopRange>,
}

impl ReplyConfig {
    /// Lowercase keywords and node names so matching is case-insensitive
    pub fn normalized(mut self) -> Self {
        self.keywords = self
            .keywords
            .iter()
            .map(|kw| kw.trim().to_lowercase())
            .filter(|kw| !kw.is_empty())
            .collect();
        self.private_node_names = self
            .private_node_names
            .iter()
            .map(|name| name.trim().to_lowercase())
            .filter(|name| !name.is_empty())
            .collect();
        self
    }

    /// Check if a node short name is on the private allow-list
    pub fn is_private_node(&self, short_name: &str) -> bool {
        let lower = short_name.to_lowercase();
        self.private_node_names.iter().any(|name| *name == lower)
    }
}

/// Backoff strategy for automatic reconnects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Interval grows with the time elapsed since the previous attempt
    #[default]
    ElapsedIdle,
    /// Interval grows with the number of consecutive failed attempts
    ConsecutiveFailures,
}

/// Health checking and reconnection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// How often the mesh link is probed
    #[serde(with = "humantime_serde", default = "default_health_interval")]
    pub health_check_interval: Duration,

    /// How often the node table is copied into the directory
    #[serde(with = "humantime_serde", default = "default_node_scan_interval")]
    pub node_scan_interval: Duration,

    /// How often the config file is checked for changes
    #[serde(with = "humantime_serde", default = "default_reload_interval")]
    pub config_reload_interval: Duration,

    /// Backoff strategy
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

fn default_health_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_node_scan_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_reload_interval() -> Duration {
    Duration::from_secs(10)
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            health_check_interval: default_health_interval(),
            node_scan_interval: default_node_scan_interval(),
            config_reload_interval: default_reload_interval(),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// The part of the configuration that may change while running
#[derive(Debug, Clone, PartialEq)]
pub struct HotConfig {
    /// Auto-reply and relay policy
    pub reply: ReplyConfig,
    /// Chat API timeout
    pub api_timeout: Duration,
}

impl MeshgramConfig {
    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::MissingConfig(format!("{}: {}", path.display(), e))
        })?;
        let config: MeshgramConfig = serde_json::from_str(&raw)?;
        let config = config.normalized();
        config.validate()?;
        debug!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Write the configuration back to disk
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Normalize case-insensitive lists
    pub fn normalized(mut self) -> Self {
        self.reply = self.reply.normalized();
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.mesh.host.trim().is_empty() {
            return Err(BridgeError::MissingConfig("mesh.host".to_string()));
        }
        if self.mesh.port == 0 {
            return Err(BridgeError::InvalidConfig("mesh.port must be non-zero".to_string()));
        }
        if let Some(range) = self.reply.hop_filter {
            if range.min > range.max {
                return Err(BridgeError::InvalidConfig(format!(
                    "reply.hop_filter {} has min greater than max",
                    range
                )));
            }
        }
        if self.chat.api_timeout.is_zero() {
            return Err(BridgeError::InvalidConfig(
                "chat.api_timeout must be positive".to_string(),
            ));
        }
        if self.reconnect.health_check_interval.is_zero()
            || self.reconnect.node_scan_interval.is_zero()
            || self.reconnect.config_reload_interval.is_zero()
        {
            return Err(BridgeError::InvalidConfig(
                "reconnect intervals must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// The hot-reloadable subset
    pub fn hot(&self) -> HotConfig {
        HotConfig {
            reply: self.reply.clone(),
            api_timeout: self.chat.api_timeout,
        }
    }
}

/// Watches the configuration file for modifications
#[derive(Debug)]
pub struct ConfigWatcher {
    path: PathBuf,
    last_modified: Option<SystemTime>,
}

impl ConfigWatcher {
    /// Start watching a file, treating its current contents as already loaded
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let last_modified = modified_time(&path);
        Self {
            path,
            last_modified,
        }
    }

    /// Path of the watched file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record the current modification time without reloading
    ///
    /// Call after the bridge itself rewrote the file.
    pub fn mark_current(&mut self) {
        self.last_modified = modified_time(&self.path);
    }

    /// Return the hot-reloadable settings if the file changed since the last poll
    pub fn poll(&mut self) -> Result<Option<HotConfig>> {
        let modified = match modified_time(&self.path) {
            Some(time) => time,
            None => return Ok(None),
        };
        if self.last_modified == Some(modified) {
            return Ok(None);
        }
        self.last_modified = Some(modified);
        let config = MeshgramConfig::load(&self.path)?;
        info!(path = %self.path.display(), "Configuration changed, reloading");
        Ok(Some(config.hot()))
    }

    /// Load, modify and save the watched file
    pub fn update(&mut self, apply: impl FnOnce(&mut MeshgramConfig)) -> Result<()> {
        let mut config = MeshgramConfig::load(&self.path)?;
        apply(&mut config);
        config.save(&self.path)?;
        self.mark_current();
        Ok(())
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Builder for MeshgramConfig
#[derive(Debug, Default)]
pub struct MeshgramConfigBuilder {
    config: MeshgramConfig,
}

impl MeshgramConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the mesh address
    pub fn mesh_address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.mesh.host = host.into();
        self.config.mesh.port = port;
        self
    }

    /// Set the chat token
    pub fn chat_token(mut self, token: impl Into<String>) -> Self {
        self.config.chat.token = Some(token.into());
        self
    }

    /// Bind a conversation
    pub fn chat_id(mut self, chat_id: i64) -> Self {
        self.config.chat.chat_id = Some(chat_id);
        self
    }

    /// Set the auto-reply keywords
    pub fn keywords<S: Into<String>>(mut self, keywords: impl IntoIterator<Item = S>) -> Self {
        self.config.reply.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    /// Set the private node allow-list
    pub fn private_nodes<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.config.reply.private_node_names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Set the general and private reply suffixes
    pub fn suffixes(mut self, general: impl Into<String>, private: impl Into<String>) -> Self {
        self.config.reply.general_suffix = general.into();
        self.config.reply.private_suffix = private.into();
        self
    }

    /// Set the default outbound channel
    pub fn default_channel(mut self, channel: u32) -> Self {
        self.config.reply.default_channel = Some(channel);
        self
    }

    /// Set the broadcast hop filter
    pub fn hop_filter(mut self, min: u32, max: u32) -> Self {
        self.config.reply.hop_filter = Some(HopRange::new(min, max));
        self
    }

    /// Set the backoff policy
    pub fn backoff(mut self, policy: BackoffPolicy) -> Self {
        self.config.reconnect.backoff = policy;
        self
    }

    /// Build the configuration
    pub fn build(self) -> MeshgramConfig {
        self.config.normalized()
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = MeshgramConfig::default();
        assert_eq!(config.mesh.port, DEFAULT_MESH_PORT);
        assert_eq!(config.reconnect.backoff, BackoffPolicy::ElapsedIdle);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{
            "mesh": { "host": "192.168.1.20", "port": 4403, "connect_timeout": "5s" },
            "chat": { "token": "123:abc", "chat_id": "-100200300", "api_timeout": "15s" },
            "reply": {
                "keywords": ["Test", "PING"],
                "private_node_names": ["Base"],
                "general_suffix": "73",
                "private_suffix": "pm",
                "default_channel": 0,
                "hop_filter": [1, 3]
            },
            "reconnect": { "backoff": "consecutive_failures" }
        }"#;

        let config: MeshgramConfig = serde_json::from_str(json).unwrap();
        let config = config.normalized();

        assert_eq!(config.mesh.address().to_string(), "192.168.1.20:4403");
        assert_eq!(config.mesh.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.chat.chat_id, Some(-100200300));
        assert_eq!(config.reply.keywords, vec!["test", "ping"]);
        assert!(config.reply.is_private_node("BASE"));
        assert_eq!(config.reply.hop_filter, Some(HopRange::new(1, 3)));
        assert_eq!(config.reconnect.backoff, BackoffPolicy::ConsecutiveFailures);
        assert_eq!(config.reconnect.health_check_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_numeric_chat_id() {
        let config: MeshgramConfig =
            serde_json::from_str(r#"{ "chat": { "chat_id": 42 } }"#).unwrap();
        assert_eq!(config.chat.chat_id, Some(42));

        let config: MeshgramConfig =
            serde_json::from_str(r#"{ "chat": { "chat_id": "" } }"#).unwrap();
        assert_eq!(config.chat.chat_id, None);
    }

    #[test]
    fn test_mesh_address_parsing() {
        let addr: MeshAddress = "10.0.0.5:4403".parse().unwrap();
        assert_eq!(addr, MeshAddress::new("10.0.0.5", 4403));

        assert!("10.0.0.5".parse::<MeshAddress>().is_err());
        assert!(":4403".parse::<MeshAddress>().is_err());
        assert!("host:port".parse::<MeshAddress>().is_err());
    }

    #[test]
    fn test_hop_range() {
        let range = HopRange::new(1, 3);
        assert!(!range.contains(0));
        assert!(range.contains(1));
        assert!(range.contains(3));
        assert!(!range.contains(4));
    }

    #[test]
    fn test_invalid_hop_filter_rejected() {
        let config = MeshgramConfigBuilder::new().hop_filter(4, 2).build();
        assert!(matches!(config.validate(), Err(BridgeError::InvalidConfig(_))));
    }

    #[test]
    fn test_config_builder() {
        let config = MeshgramConfigBuilder::new()
            .mesh_address("meshnode.local", 4403)
            .keywords(["Ping"])
            .private_nodes(["Alfa"])
            .suffixes("73", "pm")
            .build();

        assert_eq!(config.reply.keywords, vec!["ping"]);
        assert_eq!(config.reply.private_node_names, vec!["alfa"]);
        assert_eq!(config.mesh.host, "meshnode.local");
    }

    #[test]
    fn test_save_load_and_watch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        MeshgramConfigBuilder::new()
            .keywords(["ping"])
            .build()
            .save(&path)
            .unwrap();

        let mut watcher = ConfigWatcher::new(&path);
        assert!(watcher.poll().unwrap().is_none());

        watcher
            .update(|config| config.chat.chat_id = Some(7))
            .unwrap();
        // Own writes are not reported as changes
        assert!(watcher.poll().unwrap().is_none());

        let loaded = MeshgramConfig::load(&path).unwrap();
        assert_eq!(loaded.chat.chat_id, Some(7));
        assert_eq!(loaded.reply.keywords, vec!["ping"]);
    }

    #[test]
    fn test_watch_detects_older_mtime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        MeshgramConfigBuilder::new().build().save(&path).unwrap();

        let mut watcher = ConfigWatcher::new(&path);
        assert!(watcher.poll().unwrap().is_none());

        // A restored backup carries an mtime older than the last one seen
        MeshgramConfigBuilder::new()
            .keywords(["qrv"])
            .build()
            .save(&path)
            .unwrap();
        let earlier = SystemTime::now() - Duration::from_secs(3600);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(earlier)
            .unwrap();

        let hot = watcher.poll().unwrap().unwrap();
        assert_eq!(hot.reply.keywords, vec!["qrv"]);
        assert!(watcher.poll().unwrap().is_none());
    }
}
