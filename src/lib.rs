//! Mention router: watches Telegram chats for keyword/LLM matches,
//! forwards them, and learns from 👍/👎 feedback.

pub mod channels;
pub mod config;
pub mod error;
pub mod evals;
pub mod llm;
pub mod pipeline;
pub mod store;
