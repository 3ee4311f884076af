//! Error types for bridge operations
//!
//! Every failure crossing a collaborator boundary (mesh link, chat API,
//! configuration file) is expressed as a [`BridgeError`]. The orchestrator
//! catches these at its edge and turns them into a reconnect, a retry or a
//! user-visible reply; nothing here is allowed to stop a delivery loop.

use thiserror::Error;

/// Broad class of a [`BridgeError`], used to pick a recovery strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or missing configuration, fatal at startup
    Configuration,
    /// Mesh connect/health/send failure, recovered by reconnecting
    Connection,
    /// Chat API failure, retried then reported to the user
    Delivery,
    /// Malformed mesh payload, the packet is dropped
    Decode,
    /// Anything else
    Internal,
}

/// Main error type for bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingConfig(String),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Mesh address not in `host:port` form
    #[error("Invalid mesh address '{0}': expected host:port")]
    InvalidAddress(String),

    // ===== Connection Errors =====
    /// No mesh link is currently open
    #[error("Not connected to the mesh")]
    NotConnected,

    /// Mesh link dropped
    #[error("Mesh link disconnected")]
    Disconnected,

    /// Connection attempt failed
    #[error("Failed to connect to {address}: {reason}")]
    ConnectFailed {
        /// Address that was dialed
        address: String,
        /// Failure reason
        reason: String,
    },

    /// Connection timeout
    #[error("Connection timeout after {duration_ms}ms")]
    ConnectionTimeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Writing to the mesh link failed
    #[error("Mesh write error: {0}")]
    WriteError(String),

    /// Reading from the mesh link failed
    #[error("Mesh read error: {0}")]
    ReadError(String),

    /// The radio has not reported the state needed for this operation yet
    #[error("Radio not ready: {0}")]
    RadioNotReady(String),

    // ===== Delivery Errors =====
    /// Chat API call timed out
    #[error("Chat API timeout: {0}")]
    ChatTimeout(String),

    /// Chat API returned an error
    #[error("Chat API error: {0}")]
    ChatApi(String),

    // ===== Decode Errors =====
    /// Protobuf decode error
    #[error("Protobuf decode error: {0}")]
    ProtobufDecode(String),

    /// Protobuf encode error
    #[error("Protobuf encode error: {0}")]
    ProtobufEncode(String),

    /// Invalid frame or packet format
    #[error("Invalid packet format: {0}")]
    InvalidPacket(String),

    // ===== General Errors =====
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Channel send error
    #[error("Channel send error: {0}")]
    ChannelError(String),

    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::InvalidConfig(_)
            | BridgeError::MissingConfig(_)
            | BridgeError::ConfigParse(_)
            | BridgeError::InvalidAddress(_) => ErrorKind::Configuration,
            BridgeError::NotConnected
            | BridgeError::Disconnected
            | BridgeError::ConnectFailed { .. }
            | BridgeError::ConnectionTimeout { .. }
            | BridgeError::WriteError(_)
            | BridgeError::ReadError(_)
            | BridgeError::RadioNotReady(_)
            | BridgeError::Io(_) => ErrorKind::Connection,
            BridgeError::ChatTimeout(_) | BridgeError::ChatApi(_) => ErrorKind::Delivery,
            BridgeError::ProtobufDecode(_)
            | BridgeError::ProtobufEncode(_)
            | BridgeError::InvalidPacket(_) => ErrorKind::Decode,
            BridgeError::Internal(_) | BridgeError::ChannelError(_) | BridgeError::ChannelClosed => {
                ErrorKind::Internal
            }
        }
    }

    /// Check if this error is recoverable/retriable
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BridgeError::ConnectionTimeout { .. }
                | BridgeError::Disconnected
                | BridgeError::ReadError(_)
                | BridgeError::WriteError(_)
                | BridgeError::ChatTimeout(_)
        )
    }

    /// Check if this is a chat API timeout (the only delivery error that is retried)
    pub fn is_timeout(&self) -> bool {
        matches!(self, BridgeError::ChatTimeout(_))
    }

    /// Check if this error means the mesh transport is broken
    pub fn is_transport_failure(&self) -> bool {
        self.kind() == ErrorKind::Connection
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            BridgeError::InvalidConfig(_) => "INVALID_CONFIG",
            BridgeError::MissingConfig(_) => "MISSING_CONFIG",
            BridgeError::ConfigParse(_) => "CONFIG_PARSE",
            BridgeError::InvalidAddress(_) => "INVALID_ADDRESS",
            BridgeError::NotConnected => "NOT_CONNECTED",
            BridgeError::Disconnected => "DISCONNECTED",
            BridgeError::ConnectFailed { .. } => "CONNECT_FAILED",
            BridgeError::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            BridgeError::WriteError(_) => "WRITE_ERROR",
            BridgeError::ReadError(_) => "READ_ERROR",
            BridgeError::RadioNotReady(_) => "RADIO_NOT_READY",
            BridgeError::ChatTimeout(_) => "CHAT_TIMEOUT",
            BridgeError::ChatApi(_) => "CHAT_API",
            BridgeError::ProtobufDecode(_) => "PROTOBUF_DECODE",
            BridgeError::ProtobufEncode(_) => "PROTOBUF_ENCODE",
            BridgeError::InvalidPacket(_) => "INVALID_PACKET",
            BridgeError::Internal(_) => "INTERNAL_ERROR",
            BridgeError::ChannelError(_) => "CHANNEL_ERROR",
            BridgeError::ChannelClosed => "CHANNEL_CLOSED",
            BridgeError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<prost::DecodeError> for BridgeError {
    fn from(err: prost::DecodeError) -> Self {
        BridgeError::ProtobufDecode(err.to_string())
    }
}

impl From<prost::EncodeError> for BridgeError {
    fn from(err: prost::EncodeError) -> Self {
        BridgeError::ProtobufEncode(err.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::ConfigParse(err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for BridgeError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        BridgeError::ChannelError(err.to_string())
    }
}
