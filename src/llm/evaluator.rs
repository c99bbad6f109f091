//! LLM match evaluation: one prompt, one message, one structured verdict.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{ClassificationError, LlmError};
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::instance::PromptSpec;

/// Max tokens for the evaluation reply.
const EVALUATION_MAX_TOKENS: u32 = 400;

/// Temperature when the prompt does not set one.
const EVALUATION_TEMPERATURE: f32 = 0.1;

/// Max chars of message text sent to the LLM.
const MAX_INPUT_CHARS: usize = 4000;

/// Max chars per context message.
const MAX_CONTEXT_CHARS: usize = 500;

/// Parsed LLM reply for one prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub is_match: bool,
    pub reason: String,
    pub quote: String,
    /// 0-5 similarity, when the model gave one.
    pub score: Option<u8>,
    pub tokens: u64,
    pub model: String,
}

/// Evaluates a message against a prompt.
#[async_trait]
pub trait MatchEvaluator: Send + Sync {
    /// `context` holds preceding chat messages, oldest first.
    async fn evaluate(
        &self,
        prompt: &PromptSpec,
        text: &str,
        context: &[String],
    ) -> Result<Evaluation, ClassificationError>;
}

/// [`MatchEvaluator`] backed by an [`LlmProvider`].
pub struct LlmMatchEvaluator {
    llm: Arc<dyn LlmProvider>,
}

impl LlmMatchEvaluator {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl MatchEvaluator for LlmMatchEvaluator {
    async fn evaluate(
        &self,
        prompt: &PromptSpec,
        text: &str,
        context: &[String],
    ) -> Result<Evaluation, ClassificationError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(compile_prompt(prompt)),
            ChatMessage::user(build_user_prompt(text, context)),
        ])
        .with_model(prompt.model.clone())
        .with_temperature(prompt.temperature.unwrap_or(EVALUATION_TEMPERATURE))
        .with_max_tokens(EVALUATION_MAX_TOKENS)
        .with_json_mode();

        let response = self.llm.complete(request).await?;
        let tokens = response.total_tokens();
        let model = if response.model.is_empty() {
            prompt
                .model
                .clone()
                .unwrap_or_else(|| self.llm.model_name().to_string())
        } else {
            response.model.clone()
        };

        let parsed = parse_evaluation(&response.content, prompt.threshold).map_err(|reason| {
            LlmError::InvalidResponse {
                provider: self.llm.model_name().to_string(),
                reason,
            }
        })?;

        debug!(
            prompt = %prompt.name,
            is_match = parsed.is_match,
            score = ?parsed.score,
            tokens,
            "Prompt evaluated"
        );

        Ok(Evaluation {
            tokens,
            model,
            ..parsed
        })
    }
}

/// System prompt: the instance prompt plus the fixed reply contract.
pub fn compile_prompt(prompt: &PromptSpec) -> String {
    format!(
        "{}\n\n\
         Decide whether the message matches the description above.\n\
         Reply with a single JSON object and nothing else:\n\
         {{\"is_match\": true or false, \"reason\": \"one short sentence\", \
         \"quote\": \"the most relevant fragment of the message, copied without change\", \
         \"score\": 0-5}}\n\
         score: 0 = does not match at all, 5 = strongly matches. \
         A message matches only with score {} or higher.",
        prompt.text, prompt.threshold
    )
}

fn build_user_prompt(text: &str, context: &[String]) -> String {
    let text = truncate_chars(text, MAX_INPUT_CHARS);
    if context.is_empty() {
        return text.to_string();
    }

    let mut prompt = String::from("Previous messages in the chat (context only):\n");
    for msg in context {
        prompt.push_str("- ");
        prompt.push_str(truncate_chars(msg, MAX_CONTEXT_CHARS));
        prompt.push('\n');
    }
    prompt.push_str("\nMessage to evaluate:\n");
    prompt.push_str(text);
    prompt
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Raw reply shape. `main_fragment` is accepted as an alias of `quote`.
#[derive(Debug, serde::Deserialize)]
struct EvaluationResponse {
    #[serde(default)]
    is_match: Option<bool>,
    #[serde(default)]
    reason: String,
    #[serde(default, alias = "main_fragment")]
    quote: String,
    #[serde(default)]
    score: Option<f64>,
}

/// Parse a reply and apply the prompt threshold.
///
/// `is_match` is required. When a score is present, a match also requires
/// `score >= threshold`.
fn parse_evaluation(raw: &str, threshold: u8) -> Result<Evaluation, String> {
    let json_str = extract_json_object(raw);
    let response: EvaluationResponse =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;

    let score = response
        .score
        .filter(|s| s.is_finite())
        .map(|s| s.round().clamp(0.0, 5.0) as u8);

    let Some(flag) = response.is_match else {
        return Err("reply is missing is_match".into());
    };
    let is_match = flag && score.is_none_or(|score| score >= threshold);

    Ok(Evaluation {
        is_match,
        reason: response.reason.trim().to_string(),
        quote: response.quote.trim().to_string(),
        score,
        tokens: 0,
        model: String::new(),
    })
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
