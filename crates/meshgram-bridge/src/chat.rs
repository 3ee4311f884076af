//! Chat service boundary
//!
//! The bridge sees the chat service through [`ChatClient`] for outbound
//! calls and a stream of [`ChatEvent`]s for inbound updates. Conversations
//! and messages are identified by the service's integer ids.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Result;

/// Chat conversation id
pub type ConversationId = i64;

/// Chat message id
pub type ChatMessageId = i64;

/// Inbound update from the chat service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// Plain text message
    Message {
        /// Conversation the message was posted in
        conversation: ConversationId,
        /// Id of the message
        message_id: ChatMessageId,
        /// Message text
        text: String,
        /// Message this one replies to
        reply_to: Option<ChatMessageId>,
        /// Sender handle, for logging
        sender: Option<String>,
    },
    /// Slash command, `/name args`
    Command {
        /// Conversation the command was posted in
        conversation: ConversationId,
        /// Id of the message carrying the command
        message_id: ChatMessageId,
        /// Command name without the slash or bot suffix
        name: String,
        /// Text following the command name
        args: String,
    },
    /// Inline button press
    Callback {
        /// Conversation of the message holding the button
        conversation: ConversationId,
        /// Id of the message holding the button
        message_id: ChatMessageId,
        /// Callback query id, needed to answer it
        callback_id: String,
        /// Data attached to the button
        data: String,
    },
}

impl ChatEvent {
    /// Build a message or command event from raw text
    ///
    /// Text starting with `/` becomes a [`ChatEvent::Command`]; a trailing
    /// `@botname` on the command is dropped.
    pub fn from_text(
        conversation: ConversationId,
        message_id: ChatMessageId,
        text: impl Into<String>,
        reply_to: Option<ChatMessageId>,
        sender: Option<String>,
    ) -> Self {
        let text = text.into();
        if let Some(rest) = text.strip_prefix('/') {
            let (head, args) = match rest.split_once(char::is_whitespace) {
                Some((head, args)) => (head, args.trim()),
                None => (rest, ""),
            };
            let name = head.split('@').next().unwrap_or(head).to_lowercase();
            if !name.is_empty() {
                return ChatEvent::Command {
                    conversation,
                    message_id,
                    name,
                    args: args.to_string(),
                };
            }
        }
        ChatEvent::Message {
            conversation,
            message_id,
            text,
            reply_to,
            sender,
        }
    }

    /// Conversation the event belongs to
    pub fn conversation(&self) -> ConversationId {
        match self {
            ChatEvent::Message { conversation, .. }
            | ChatEvent::Command { conversation, .. }
            | ChatEvent::Callback { conversation, .. } => *conversation,
        }
    }

    /// Message the event belongs to
    pub fn message_id(&self) -> ChatMessageId {
        match self {
            ChatEvent::Message { message_id, .. }
            | ChatEvent::Command { message_id, .. }
            | ChatEvent::Callback { message_id, .. } => *message_id,
        }
    }
}

/// Outbound operations on the chat service
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Post a message; returns its id
    async fn send_message(
        &self,
        conversation: ConversationId,
        text: &str,
        reply_to: Option<ChatMessageId>,
    ) -> Result<ChatMessageId>;

    /// Post a message with accept and cancel buttons; returns its id
    async fn send_confirmation(
        &self,
        conversation: ConversationId,
        text: &str,
        reply_to: Option<ChatMessageId>,
        confirm_data: &str,
        cancel_data: &str,
    ) -> Result<ChatMessageId>;

    /// Acknowledge a button press, optionally with a short notice
    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<()>;

    /// Apply a new per-call timeout
    fn set_api_timeout(&self, _timeout: Duration) {}
}

/// Retry schedule for chat calls
///
/// Only timeouts are retried. The n-th retry waits `n * step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt
    pub retries: u32,
    /// Delay increment between retries
    pub step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            step: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry (1-based)
    pub fn delay(&self, retry: u32) -> Duration {
        self.step * retry
    }

    /// Run `call`, retrying timeouts
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_timeout() && retry < self.retries => {
                    retry += 1;
                    let delay = self.delay(retry);
                    warn!(operation, retry, ?delay, error = %e, "Chat call timed out, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    debug!(operation, error = %e, "Chat call failed");
                    return Err(e);
                }
            }
        }
    }
}
