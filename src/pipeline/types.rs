//! Shared types for the routing pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Message identity ────────────────────────────────────────────────

/// Globally unique message identity: chat ID + message ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageRef {
    pub chat_id: i64,
    pub message_id: i64,
}

impl MessageRef {
    pub fn new(chat_id: i64, message_id: i64) -> Self {
        Self {
            chat_id,
            message_id,
        }
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.chat_id, self.message_id)
    }
}

// ── Inbound events ──────────────────────────────────────────────────

/// Who sent a message. Channel posts have no user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub user_id: Option<i64>,
    pub username: Option<String>,
}

/// Source chat metadata, used for links and annotations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatInfo {
    pub id: i64,
    pub title: Option<String>,
    pub username: Option<String>,
}

impl ChatInfo {
    /// Display name: title, then @username, then the numeric ID.
    pub fn display_name(&self) -> String {
        if let Some(title) = self.title.as_deref().filter(|t| !t.is_empty()) {
            return title.to_string();
        }
        if let Some(username) = self.username.as_deref() {
            return format!("@{username}");
        }
        self.id.to_string()
    }
}

/// An inbound chat message. Immutable once observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEvent {
    pub id: MessageRef,
    pub chat: ChatInfo,
    pub sender: Sender,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// A reaction change on some message.
///
/// `emojis` holds the reactions present after the change. An empty list
/// means the reaction was removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionEvent {
    pub message: MessageRef,
    pub user_id: Option<i64>,
    pub emojis: Vec<String>,
}

/// Everything the transport can deliver.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Message(MessageEvent),
    Reaction(ReactionEvent),
}

// ── Verdicts ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Forward,
    Suppress,
}

/// Why a verdict was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    Ignored,
    Negative,
    LlmReject,
    KeywordMatch,
    LlmAccept,
    /// Not a candidate at all.
    NoMatch,
    /// Forward rewritten to suppress because every destination was inside
    /// the instance's own scope.
    FolderMute,
}

impl Reason {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ignored => "ignored",
            Self::Negative => "negative",
            Self::LlmReject => "llm_reject",
            Self::KeywordMatch => "keyword_match",
            Self::LlmAccept => "llm_accept",
            Self::NoMatch => "no_match",
            Self::FolderMute => "folder_mute",
        }
    }
}

/// Outcome of one LLM prompt evaluation that accepted a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmJudgement {
    pub prompt_name: String,
    pub reason: String,
    pub quote: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Uuid>,
}

/// Classification result for one (message, instance) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchVerdict {
    pub decision: Decision,
    pub reason: Reason,
    pub matched_instance: String,
    pub quote: Option<String>,
    /// The keyword that fired, for `keyword_match`.
    pub keyword: Option<String>,
    /// LLM details, for `llm_accept`.
    pub llm: Option<LlmJudgement>,
    /// Chats the forward goes to, after folder muting.
    pub destinations: Vec<i64>,
}

impl MatchVerdict {
    pub fn suppress(instance: &str, reason: Reason) -> Self {
        Self {
            decision: Decision::Suppress,
            reason,
            matched_instance: instance.to_string(),
            quote: None,
            keyword: None,
            llm: None,
            destinations: Vec::new(),
        }
    }

    pub fn keyword(instance: &str, keyword: &str, destinations: Vec<i64>) -> Self {
        Self {
            decision: Decision::Forward,
            reason: Reason::KeywordMatch,
            matched_instance: instance.to_string(),
            quote: None,
            keyword: Some(keyword.to_string()),
            llm: None,
            destinations,
        }
    }

    pub fn llm_accept(instance: &str, judgement: LlmJudgement, destinations: Vec<i64>) -> Self {
        let quote = (!judgement.quote.is_empty()).then(|| judgement.quote.clone());
        Self {
            decision: Decision::Forward,
            reason: Reason::LlmAccept,
            matched_instance: instance.to_string(),
            quote,
            keyword: None,
            llm: Some(judgement),
            destinations,
        }
    }

    pub fn is_forward(&self) -> bool {
        self.decision == Decision::Forward
    }
}

// ── Feedback ────────────────────────────────────────────────────────

pub const THUMBS_UP: &str = "\u{1F44D}";
pub const THUMBS_DOWN: &str = "\u{1F44E}";

/// Whether a forward was confirmed or rejected by a reviewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    TruePositive,
    FalsePositive,
}

impl Polarity {
    /// Map a reaction emoji to a polarity. Anything but 👍/👎 is `None`.
    pub fn from_emoji(emoji: &str) -> Option<Self> {
        // Strip the emoji presentation selector some clients append.
        match emoji.trim_end_matches('\u{FE0F}') {
            THUMBS_UP => Some(Self::TruePositive),
            THUMBS_DOWN => Some(Self::FalsePositive),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::TruePositive => "true_positive",
            Self::FalsePositive => "false_positive",
        }
    }
}

/// Emitted by the feedback tracker the first time a forward is judged.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackOutcome {
    pub instance_name: String,
    pub polarity: Polarity,
    pub quote: Option<String>,
    pub reason: Reason,
    /// The original message, for routing a copy.
    pub original: MessageRef,
    /// The copy that was reacted to.
    pub forwarded: MessageRef,
}

// ── Actions ─────────────────────────────────────────────────────────

/// A forward that was attempted for one verdict destination.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardAction {
    pub instance_name: String,
    pub original: MessageRef,
    pub destination: i64,
    pub reason: Reason,
    /// The copy's identity on success, the error text on failure.
    pub result: Result<MessageRef, String>,
}

impl ForwardAction {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// Feedback routing performed for a first-time reaction.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackAction {
    pub outcome: FeedbackOutcome,
    /// Chat the copy went to, if the instance has one for this polarity.
    pub destination: Option<i64>,
    pub delivered: bool,
}
