//! Telegram Bot API client
//!
//! Implements [`ChatClient`] over the Bot API and turns `getUpdates` long
//! polling into a stream of [`ChatEvent`]s.

use async_trait::async_trait;
use meshgram_bridge::{BridgeError, ChatClient, ChatEvent, ChatMessageId, ConversationId};
use parking_lot::RwLock;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const API_BASE: &str = "https://api.telegram.org";

/// Pause after a failed poll
const POLL_ERROR_DELAY: Duration = Duration::from_secs(5);

/// Bot API client
pub struct TelegramClient {
    base: String,
    client: Client,
    api_timeout: RwLock<Duration>,
}

impl TelegramClient {
    /// Create a client for the bot identified by `token`
    pub fn new(token: &str, api_timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().build()?;
        Ok(Self {
            base: format!("{}/bot{}", API_BASE, token),
            client,
            api_timeout: RwLock::new(api_timeout),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &Value,
        timeout: Duration,
    ) -> meshgram_bridge::Result<T> {
        let url = format!("{}/{}", self.base, method);
        let resp = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| request_error(method, e))?;
        let status = resp.status();
        let parsed = resp
            .json::<ApiResponse<T>>()
            .await
            .map_err(|e| request_error(method, e))?;
        parsed.into_result(method, status.as_u16())
    }

    fn timeout(&self) -> Duration {
        *self.api_timeout.read()
    }

    /// Long-poll for updates and forward them until `events` is closed
    pub async fn poll_updates(self: Arc<Self>, events: mpsc::Sender<ChatEvent>, poll_timeout: Duration) {
        let mut offset: i64 = 0;
        info!(?poll_timeout, "Polling chat updates");

        loop {
            let body = json!({
                "offset": offset,
                "timeout": poll_timeout.as_secs(),
                "allowed_updates": ["message", "callback_query"],
            });
            let updates: Vec<Update> = match self
                .call("getUpdates", &body, poll_timeout + self.timeout())
                .await
            {
                Ok(updates) => updates,
                Err(e) if e.is_timeout() => {
                    debug!("getUpdates timed out, polling again");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "getUpdates failed");
                    tokio::time::sleep(POLL_ERROR_DELAY).await;
                    continue;
                }
            };

            for update in updates {
                offset = offset.max(update.update_id + 1);
                let Some(event) = update.into_event() else {
                    continue;
                };
                if events.send(event).await.is_err() {
                    info!("Chat event receiver closed, stopping poll");
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl ChatClient for TelegramClient {
    async fn send_message(
        &self,
        conversation: ConversationId,
        text: &str,
        reply_to: Option<ChatMessageId>,
    ) -> meshgram_bridge::Result<ChatMessageId> {
        let mut body = json!({ "chat_id": conversation, "text": text });
        with_reply(&mut body, reply_to);
        let message: Message = self.call("sendMessage", &body, self.timeout()).await?;
        Ok(message.message_id)
    }

    async fn send_confirmation(
        &self,
        conversation: ConversationId,
        text: &str,
        reply_to: Option<ChatMessageId>,
        confirm_data: &str,
        cancel_data: &str,
    ) -> meshgram_bridge::Result<ChatMessageId> {
        let mut body = json!({
            "chat_id": conversation,
            "text": text,
            "reply_markup": {
                "inline_keyboard": [[
                    { "text": "✅ Send", "callback_data": confirm_data },
                    { "text": "❌ Cancel", "callback_data": cancel_data },
                ]]
            },
        });
        with_reply(&mut body, reply_to);
        let message: Message = self.call("sendMessage", &body, self.timeout()).await?;
        Ok(message.message_id)
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> meshgram_bridge::Result<()> {
        let mut body = json!({ "callback_query_id": callback_id });
        if let Some(text) = text {
            body["text"] = json!(text);
        }
        let _: bool = self.call("answerCallbackQuery", &body, self.timeout()).await?;
        Ok(())
    }

    fn set_api_timeout(&self, timeout: Duration) {
        *self.api_timeout.write() = timeout;
    }
}

fn with_reply(body: &mut Value, reply_to: Option<ChatMessageId>) {
    if let Some(id) = reply_to {
        body["reply_to_message_id"] = json!(id);
        body["allow_sending_without_reply"] = json!(true);
    }
}

fn request_error(method: &str, e: reqwest::Error) -> BridgeError {
    if e.is_timeout() {
        BridgeError::ChatTimeout(method.to_string())
    } else {
        // The URL carries the bot token
        BridgeError::ChatApi(format!("{}: {}", method, e.without_url()))
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

impl<T> ApiResponse<T> {
    fn into_result(self, method: &str, status: u16) -> meshgram_bridge::Result<T> {
        match (self.ok, self.result) {
            (true, Some(result)) => Ok(result),
            (true, None) => Err(BridgeError::ChatApi(format!("{}: empty result", method))),
            (false, _) => Err(BridgeError::ChatApi(format!(
                "{} failed {}: {}",
                method,
                status,
                self.description.unwrap_or_default()
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<Message>,
    callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct Message {
    message_id: i64,
    chat: Chat,
    text: Option<String>,
    from: Option<User>,
    reply_to_message: Option<Box<Message>>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct User {
    username: Option<String>,
    first_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    id: String,
    data: Option<String>,
    message: Option<Message>,
}

impl Update {
    fn into_event(self) -> Option<ChatEvent> {
        if let Some(query) = self.callback_query {
            let message = query.message?;
            return Some(ChatEvent::Callback {
                conversation: message.chat.id,
                message_id: message.message_id,
                callback_id: query.id,
                data: query.data.unwrap_or_default(),
            });
        }

        let message = self.message?;
        let text = message.text?;
        let sender = message
            .from
            .and_then(|user| user.username.or(user.first_name));
        Some(ChatEvent::from_text(
            message.chat.id,
            message.message_id,
            text,
            message.reply_to_message.map(|m| m.message_id),
            sender,
        ))
    }
}
