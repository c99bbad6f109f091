//! LLM integration.
//!
//! - `provider`: the `LlmProvider` trait and request/response types
//! - `openai`: OpenAI-compatible HTTP client
//! - `evaluator`: prompt compilation and structured match replies
//! - `tracer`: optional Langfuse tracing of evaluations

pub mod evaluator;
pub mod openai;
pub mod provider;
pub mod tracer;

pub use evaluator::{Evaluation, LlmMatchEvaluator, MatchEvaluator};
pub use openai::OpenAiProvider;
pub use provider::*;
pub use tracer::{LangfuseTracer, LlmCallRecord, NoopTracer, Tracer};

use std::sync::Arc;

use crate::config::OpenAiConfig;
use crate::error::LlmError;

/// Create the LLM provider from configuration.
///
/// Returns `Ok(None)` when no API key is configured; instances with
/// prompts then fail closed (every evaluation suppresses).
pub fn create_provider(config: &OpenAiConfig) -> Result<Option<Arc<dyn LlmProvider>>, LlmError> {
    let Some(api_key) = config.api_key.clone() else {
        return Ok(None);
    };
    let provider = OpenAiProvider::new(
        api_key,
        config.model.clone(),
        config.base_url.clone(),
        config.proxy_url.as_deref(),
        config.timeout(),
    )?;
    tracing::info!("Using OpenAI-compatible API (model: {})", config.model);
    Ok(Some(Arc::new(provider)))
}

/// Create the tracer: Langfuse when configured, otherwise a no-op.
pub fn create_tracer(config: &crate::config::LangfuseConfig) -> Arc<dyn Tracer> {
    match LangfuseTracer::from_config(config) {
        Some(tracer) => {
            tracing::info!("Langfuse tracing enabled ({})", config.base_url);
            Arc::new(tracer)
        }
        None => Arc::new(NoopTracer),
    }
}
