//! Chat transport abstraction.
//!
//! The router only talks to chats through [`Transport`]. The Bot API
//! implementation lives in `telegram`; tests use an in-memory fake.

pub mod telegram;

pub use telegram::TelegramTransport;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::ChannelError;
use crate::pipeline::instance::ScopeSelector;
use crate::pipeline::types::{ChatInfo, InboundEvent, MessageRef};

/// Stream of inbound messages and reactions.
pub type EventStream = Pin<Box<dyn Stream<Item = InboundEvent> + Send>>;

/// Chat transport used by the router.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name for logs.
    fn name(&self) -> &str;

    /// Resolve a scope or target selector to chat IDs. A folder may expand
    /// to several chats; every other selector resolves to exactly one.
    async fn resolve(&self, selector: &ScopeSelector) -> Result<Vec<i64>, ChannelError>;

    /// Send a text message. Returns the identity of the sent message.
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<MessageRef, ChannelError>;

    /// Forward an existing message natively. Returns the copy's identity.
    async fn forward_message(
        &self,
        to_chat_id: i64,
        message: MessageRef,
    ) -> Result<MessageRef, ChannelError>;

    /// Delete a message the bot sent.
    async fn delete_message(&self, message: MessageRef) -> Result<(), ChannelError>;

    /// Start receiving messages and reactions.
    async fn subscribe(&self) -> Result<EventStream, ChannelError>;

    /// Public link to a message.
    fn build_message_link(&self, chat: &ChatInfo, message_id: i64) -> String {
        message_link(chat, message_id)
    }
}

/// `t.me` link to a message: `t.me/<username>/<id>` for public chats,
/// `t.me/c/<internal id>/<id>` otherwise.
pub fn message_link(chat: &ChatInfo, message_id: i64) -> String {
    if let Some(username) = chat.username.as_deref().filter(|u| !u.is_empty()) {
        return format!("https://t.me/{username}/{message_id}");
    }
    format!("https://t.me/c/{}/{message_id}", internal_chat_id(chat.id))
}

/// Strip the Bot API `-100` prefix from supergroup/channel IDs.
pub fn internal_chat_id(chat_id: i64) -> i64 {
    let digits = chat_id.unsigned_abs().to_string();
    match digits.strip_prefix("100") {
        Some(rest) if chat_id < 0 && !rest.is_empty() => rest.parse().unwrap_or(chat_id),
        _ => chat_id.abs(),
    }
}
