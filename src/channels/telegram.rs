//! Telegram transport: long-polls the Bot API for messages and reactions.
//!
//! Folders do not exist in the Bot API, so folder selectors are expanded
//! from the `folder_chats` config map. The update offset is checkpointed
//! to `session.json` so restarts do not replay processed updates.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channels::{EventStream, Transport};
use crate::config::RawSelector;
use crate::error::ChannelError;
use crate::pipeline::instance::ScopeSelector;
use crate::pipeline::types::{
    ChatInfo, InboundEvent, MessageEvent, MessageRef, ReactionEvent, Sender,
};
use crate::store::atomic::{atomic_write_json, read_json_optional};

/// Maximum message length for Telegram's sendMessage API, in UTF-16 code
/// units.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Delay before retrying a failed poll.
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Update kinds the router needs.
const ALLOWED_UPDATES: [&str; 3] = ["message", "channel_post", "message_reaction"];

/// Persisted long-poll position.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Session {
    #[serde(default)]
    offset: i64,
}

/// Bot API transport.
pub struct TelegramTransport {
    bot_token: SecretString,
    poll_timeout_secs: u64,
    folder_chats: BTreeMap<String, Vec<RawSelector>>,
    session_path: Option<PathBuf>,
    client: reqwest::Client,
}

impl TelegramTransport {
    pub fn new(
        bot_token: SecretString,
        poll_timeout_secs: u64,
        folder_chats: BTreeMap<String, Vec<RawSelector>>,
        session_path: Option<PathBuf>,
    ) -> Self {
        Self {
            bot_token,
            poll_timeout_secs,
            folder_chats,
            session_path,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        api_url(&self.bot_token, method)
    }

    /// Call a Bot API method and return its `result`.
    async fn call(&self, method: &str, body: &Value) -> Result<Value, ChannelError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| ChannelError::Http(format!("{method}: {e}")))?;

        let data: Value = resp
            .json()
            .await
            .map_err(|e| ChannelError::Http(format!("{method}: {e}")))?;
        api_result(method, data)
    }

    /// Verify the token with `getMe`.
    pub async fn check_connection(&self) -> Result<String, ChannelError> {
        let me = self
            .call("getMe", &serde_json::json!({}))
            .await
            .map_err(|e| ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;
        let username = me
            .get("username")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        tracing::info!(bot = %username, "Connected to Telegram");
        Ok(username)
    }

    async fn resolve_chat(&self, selector: &ScopeSelector) -> Result<i64, ChannelError> {
        match selector {
            ScopeSelector::ChatId(id) => Ok(*id),
            ScopeSelector::Username(username) => {
                let chat = self
                    .call("getChat", &serde_json::json!({ "chat_id": format!("@{username}") }))
                    .await
                    .map_err(|e| ChannelError::ResolveFailed {
                        selector: selector.to_string(),
                        reason: e.to_string(),
                    })?;
                chat.get("id")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| ChannelError::ResolveFailed {
                        selector: selector.to_string(),
                        reason: "getChat returned no id".into(),
                    })
            }
            ScopeSelector::Folder(name) => Err(ChannelError::ResolveFailed {
                selector: selector.to_string(),
                reason: format!("folder '{name}' cannot be nested in a folder"),
            }),
        }
    }

    /// Send one chunk as plain text.
    async fn send_chunk(&self, chat_id: i64, text: &str) -> Result<MessageRef, ChannelError> {
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });
        let sent = self
            .call("sendMessage", &body)
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;
        sent_message_ref(chat_id, &sent)
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn resolve(&self, selector: &ScopeSelector) -> Result<Vec<i64>, ChannelError> {
        let ScopeSelector::Folder(folder) = selector else {
            return Ok(vec![self.resolve_chat(selector).await?]);
        };

        let members = self
            .folder_chats
            .get(folder)
            .ok_or_else(|| ChannelError::UnknownFolder(folder.clone()))?;

        let mut chats = Vec::with_capacity(members.len());
        for raw in members {
            let Some(member) = ScopeSelector::from_raw(raw) else {
                tracing::warn!(folder = %folder, "Skipping invalid folder member");
                continue;
            };
            let id = self.resolve_chat(&member).await?;
            if !chats.contains(&id) {
                chats.push(id);
            }
        }
        tracing::debug!(folder = %folder, chats = chats.len(), "Resolved folder");
        Ok(chats)
    }

    /// Splits long messages that exceed Telegram's 4096 UTF-16 unit limit
    /// and returns the identity of the first chunk.
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<MessageRef, ChannelError> {
        let mut first = None;
        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            let sent = self.send_chunk(chat_id, &chunk).await?;
            first.get_or_insert(sent);
        }
        first.ok_or_else(|| ChannelError::SendFailed {
            name: "telegram".into(),
            reason: "empty message".into(),
        })
    }

    async fn forward_message(
        &self,
        to_chat_id: i64,
        message: MessageRef,
    ) -> Result<MessageRef, ChannelError> {
        let body = serde_json::json!({
            "chat_id": to_chat_id,
            "from_chat_id": message.chat_id,
            "message_id": message.message_id,
        });
        let sent = self
            .call("forwardMessage", &body)
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;
        sent_message_ref(to_chat_id, &sent)
    }

    async fn delete_message(&self, message: MessageRef) -> Result<(), ChannelError> {
        let body = serde_json::json!({
            "chat_id": message.chat_id,
            "message_id": message.message_id,
        });
        self.call("deleteMessage", &body)
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<EventStream, ChannelError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let bot_token = self.bot_token.clone();
        let client = self.client.clone();
        let poll_timeout = self.poll_timeout_secs;
        let session_path = self.session_path.clone();

        let mut offset = match session_path.as_deref() {
            Some(path) => read_json_optional::<Session>(path)
                .map_err(|e| ChannelError::StartupFailed {
                    name: "telegram".into(),
                    reason: e.to_string(),
                })?
                .unwrap_or_default()
                .offset,
            None => 0,
        };

        tokio::spawn(async move {
            tracing::info!(offset, "Telegram transport listening for updates...");

            loop {
                let body = serde_json::json!({
                    "offset": offset,
                    "timeout": poll_timeout,
                    "allowed_updates": ALLOWED_UPDATES,
                });

                let resp = match client
                    .post(api_url(&bot_token, "getUpdates"))
                    .json(&body)
                    .send()
                    .await
                {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("Telegram poll error: {e}");
                        tokio::time::sleep(POLL_RETRY_DELAY).await;
                        continue;
                    }
                };

                let data: Value = match resp.json().await {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::warn!("Telegram parse error: {e}");
                        tokio::time::sleep(POLL_RETRY_DELAY).await;
                        continue;
                    }
                };

                let updates = match api_result("getUpdates", data) {
                    Ok(Value::Array(updates)) => updates,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::warn!("Telegram poll rejected: {e}");
                        tokio::time::sleep(POLL_RETRY_DELAY).await;
                        continue;
                    }
                };

                let start_offset = offset;
                for update in &updates {
                    if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                        offset = offset.max(uid + 1);
                    }

                    let Some(event) = parse_update(update) else {
                        continue;
                    };
                    if tx.send(event).is_err() {
                        tracing::info!("Telegram listener channel closed");
                        return;
                    }
                }

                if offset != start_offset
                    && let Some(path) = session_path.as_deref()
                    && let Err(e) = atomic_write_json(path, &Session { offset })
                {
                    tracing::warn!(error = %e, "Failed to save Telegram session");
                }
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });

        Ok(Box::pin(stream))
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn api_url(bot_token: &SecretString, method: &str) -> String {
    format!(
        "https://api.telegram.org/bot{}/{method}",
        bot_token.expose_secret()
    )
}

/// Unwrap a Bot API envelope `{ok, result, description}`.
fn api_result(method: &str, mut data: Value) -> Result<Value, ChannelError> {
    if data.get("ok").and_then(Value::as_bool) == Some(true) {
        return Ok(data.get_mut("result").map(Value::take).unwrap_or(Value::Null));
    }
    let description = data
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    Err(ChannelError::Http(format!("{method}: {description}")))
}

fn sent_message_ref(chat_id: i64, sent: &Value) -> Result<MessageRef, ChannelError> {
    let message_id = sent
        .get("message_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| ChannelError::SendFailed {
            name: "telegram".into(),
            reason: "response has no message_id".into(),
        })?;
    let chat_id = sent
        .get("chat")
        .and_then(|c| c.get("id"))
        .and_then(Value::as_i64)
        .unwrap_or(chat_id);
    Ok(MessageRef::new(chat_id, message_id))
}

/// Turn one Bot API update into an inbound event.
fn parse_update(update: &Value) -> Option<InboundEvent> {
    if let Some(reaction) = update.get("message_reaction") {
        return parse_reaction(reaction).map(InboundEvent::Reaction);
    }
    let message = update
        .get("message")
        .or_else(|| update.get("channel_post"))?;
    parse_message(message).map(InboundEvent::Message)
}

fn parse_message(message: &Value) -> Option<MessageEvent> {
    let chat = parse_chat(message.get("chat")?)?;
    let message_id = message.get("message_id").and_then(Value::as_i64)?;

    // Media messages carry their text in the caption.
    let text = message
        .get("text")
        .or_else(|| message.get("caption"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let sender = match message.get("from") {
        Some(from) => Sender {
            user_id: from.get("id").and_then(Value::as_i64),
            username: from
                .get("username")
                .and_then(Value::as_str)
                .map(String::from),
        },
        None => Sender {
            user_id: None,
            username: message
                .get("sender_chat")
                .and_then(|c| c.get("username"))
                .and_then(Value::as_str)
                .map(String::from),
        },
    };

    let timestamp = message
        .get("date")
        .and_then(Value::as_i64)
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now);

    Some(MessageEvent {
        id: MessageRef::new(chat.id, message_id),
        chat,
        sender,
        text,
        timestamp,
    })
}

fn parse_chat(chat: &Value) -> Option<ChatInfo> {
    Some(ChatInfo {
        id: chat.get("id").and_then(Value::as_i64)?,
        title: chat.get("title").and_then(Value::as_str).map(String::from),
        username: chat.get("username").and_then(Value::as_str).map(String::from),
    })
}

fn parse_reaction(reaction: &Value) -> Option<ReactionEvent> {
    let chat_id = reaction
        .get("chat")
        .and_then(|c| c.get("id"))
        .and_then(Value::as_i64)?;
    let message_id = reaction.get("message_id").and_then(Value::as_i64)?;

    let emojis = reaction
        .get("new_reaction")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter(|r| r.get("type").and_then(Value::as_str) == Some("emoji"))
                .filter_map(|r| r.get("emoji").and_then(Value::as_str))
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    Some(ReactionEvent {
        message: MessageRef::new(chat_id, message_id),
        user_id: reaction
            .get("user")
            .and_then(|u| u.get("id"))
            .and_then(Value::as_i64),
        emojis,
    })
}

/// Split a message into chunks of at most `max_units` UTF-16 code units,
/// the unit Telegram measures length in.
/// Tries to split on newlines, then spaces, then hard-cuts.
fn split_message(text: &str, max_units: usize) -> Vec<String> {
    if text.encode_utf16().count() <= max_units {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        let Some(limit) = utf16_cut(remaining, max_units) else {
            chunks.push(remaining.to_string());
            break;
        };

        // Find a good split point
        let chunk = &remaining[..limit];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .filter(|&at| at > 0)
            .unwrap_or(limit);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

/// Byte index of the first char that no longer fits in `max_units`, or
/// `None` when the whole text fits. Always admits at least one char.
fn utf16_cut(text: &str, max_units: usize) -> Option<usize> {
    let mut units = 0;
    for (idx, c) in text.char_indices() {
        units += c.len_utf16();
        if units > max_units {
            return Some(if idx == 0 { c.len_utf8() } else { idx });
        }
    }
    None
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transport() -> TelegramTransport {
        let mut folders = BTreeMap::new();
        folders.insert(
            "work".to_string(),
            vec![RawSelector::Id(-1001), RawSelector::Id(-1002), RawSelector::Id(-1001)],
        );
        TelegramTransport::new(SecretString::from("fake-token"), 30, folders, None)
    }

    // ── Basic transport tests ───────────────────────────────────────

    #[test]
    fn telegram_transport_name() {
        assert_eq!(transport().name(), "telegram");
    }

    #[test]
    fn telegram_api_url() {
        assert_eq!(
            transport().api_url("getUpdates"),
            "https://api.telegram.org/botfake-token/getUpdates"
        );
    }

    #[tokio::test]
    async fn resolve_numeric_id_without_network() {
        let t = transport();
        assert_eq!(t.resolve(&ScopeSelector::ChatId(-42)).await.unwrap(), vec![-42]);
    }

    #[tokio::test]
    async fn resolve_folder_expands_and_dedups() {
        let t = transport();
        let chats = t.resolve(&ScopeSelector::Folder("work".into())).await.unwrap();
        assert_eq!(chats, vec![-1001, -1002]);
    }

    #[tokio::test]
    async fn resolve_unknown_folder_fails() {
        let err = transport()
            .resolve(&ScopeSelector::Folder("nope".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::UnknownFolder(name) if name == "nope"));
    }

    #[tokio::test]
    async fn corrupt_session_fails_subscribe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "{not json").unwrap();
        let t = TelegramTransport::new(SecretString::from("fake-token"), 30, BTreeMap::new(), Some(path));

        let err = t.subscribe().await.err().unwrap();
        assert!(matches!(err, ChannelError::StartupFailed { .. }));
    }

    // ── Envelope ────────────────────────────────────────────────────

    #[test]
    fn api_result_unwraps_ok() {
        let result = api_result("getMe", json!({"ok": true, "result": {"id": 1}})).unwrap();
        assert_eq!(result["id"], 1);
    }

    #[test]
    fn api_result_reports_description() {
        let err = api_result(
            "sendMessage",
            json!({"ok": false, "description": "Forbidden: bot was blocked"}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("bot was blocked"));
    }

    #[test]
    fn sent_ref_prefers_response_chat() {
        let sent = json!({"message_id": 9, "chat": {"id": -555}});
        assert_eq!(sent_message_ref(-1, &sent).unwrap(), MessageRef::new(-555, 9));
        assert!(sent_message_ref(-1, &json!({})).is_err());
    }

    // ── Update parsing ──────────────────────────────────────────────

    #[test]
    fn parses_group_message() {
        let update = json!({
            "update_id": 10,
            "message": {
                "message_id": 5,
                "date": 1_700_000_000,
                "chat": {"id": -1001, "title": "Jobs", "type": "supergroup"},
                "from": {"id": 7, "username": "alice"},
                "text": "This is urgent!"
            }
        });
        let Some(InboundEvent::Message(msg)) = parse_update(&update) else {
            panic!("expected message");
        };
        assert_eq!(msg.id, MessageRef::new(-1001, 5));
        assert_eq!(msg.chat.title.as_deref(), Some("Jobs"));
        assert_eq!(msg.sender.user_id, Some(7));
        assert_eq!(msg.sender.username.as_deref(), Some("alice"));
        assert_eq!(msg.text, "This is urgent!");
        assert_eq!(msg.timestamp.timestamp(), 1_700_000_000);
    }

    #[test]
    fn parses_channel_post_caption() {
        let update = json!({
            "update_id": 11,
            "channel_post": {
                "message_id": 8,
                "date": 1_700_000_000,
                "chat": {"id": -1002, "username": "news"},
                "sender_chat": {"id": -1002, "username": "news"},
                "caption": "photo caption"
            }
        });
        let Some(InboundEvent::Message(msg)) = parse_update(&update) else {
            panic!("expected message");
        };
        assert_eq!(msg.text, "photo caption");
        assert_eq!(msg.sender.user_id, None);
        assert_eq!(msg.sender.username.as_deref(), Some("news"));
    }

    #[test]
    fn parses_reaction() {
        let update = json!({
            "update_id": 12,
            "message_reaction": {
                "chat": {"id": -2002},
                "message_id": 500,
                "user": {"id": 9},
                "date": 1_700_000_000,
                "old_reaction": [],
                "new_reaction": [
                    {"type": "emoji", "emoji": "👍"},
                    {"type": "custom_emoji", "custom_emoji_id": "123"}
                ]
            }
        });
        let Some(InboundEvent::Reaction(reaction)) = parse_update(&update) else {
            panic!("expected reaction");
        };
        assert_eq!(reaction.message, MessageRef::new(-2002, 500));
        assert_eq!(reaction.user_id, Some(9));
        assert_eq!(reaction.emojis, vec!["👍"]);
    }

    #[test]
    fn ignores_other_updates() {
        assert!(parse_update(&json!({"update_id": 1, "edited_message": {}})).is_none());
        assert!(parse_update(&json!({"update_id": 1, "message": {"message_id": 1}})).is_none());
    }

    // ── split_message ───────────────────────────────────────────────

    #[test]
    fn split_message_short() {
        assert_eq!(split_message("hello", 10), vec!["hello"]);
    }

    #[test]
    fn split_message_exact_limit() {
        let text = "a".repeat(10);
        assert_eq!(split_message(&text, 10), vec![text]);
    }

    #[test]
    fn split_message_over_limit_on_newline() {
        let chunks = split_message("first line\nsecond line", 15);
        assert_eq!(chunks, vec!["first line", "second line"]);
    }

    #[test]
    fn split_message_over_limit_on_space() {
        let chunks = split_message("alpha beta gamma", 12);
        assert_eq!(chunks, vec!["alpha beta", "gamma"]);
    }

    #[test]
    fn split_message_no_good_split_point() {
        let chunks = split_message(&"x".repeat(25), 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 10);
        assert_eq!(chunks[2].len(), 5);
    }

    #[test]
    fn split_message_respects_char_boundaries() {
        let text = "ж".repeat(15);
        let chunks = split_message(&text, 10);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), 10);
        assert_eq!(chunks[1].chars().count(), 5);
    }

    #[test]
    fn split_message_counts_utf16_units() {
        // Each emoji is two UTF-16 units.
        let text = "😀".repeat(6);
        let chunks = split_message(&text, 10);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].encode_utf16().count(), 10);
        assert_eq!(chunks[1], "😀");
    }

    #[test]
    fn split_message_never_stalls_on_wide_char() {
        let chunks = split_message("😀😀", 1);
        assert_eq!(chunks, vec!["😀", "😀"]);
        let chunks = split_message("a😀", 2);
        assert_eq!(chunks, vec!["a", "😀"]);
    }
}
