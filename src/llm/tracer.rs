//! Optional LLM call tracing (Langfuse ingestion API).
//!
//! Recording is fire-and-forget: the HTTP call runs on a spawned task and
//! failures are only logged.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::LangfuseConfig;

/// One LLM evaluation to record.
#[derive(Debug, Clone)]
pub struct LlmCallRecord {
    pub trace_id: Uuid,
    pub prompt_name: String,
    pub model: String,
    pub input: String,
    pub output: serde_json::Value,
    pub tokens: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Tracing collaborator. Must never block or fail the caller.
pub trait Tracer: Send + Sync {
    /// Whether calls are recorded (and trace IDs worth generating).
    fn is_enabled(&self) -> bool;

    fn tag_and_record(&self, instance_name: &str, chat_name: &str, call: LlmCallRecord);
}

/// Tracer that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn is_enabled(&self) -> bool {
        false
    }

    fn tag_and_record(&self, _instance_name: &str, _chat_name: &str, _call: LlmCallRecord) {}
}

/// Sends traces to the Langfuse ingestion endpoint.
pub struct LangfuseTracer {
    client: reqwest::Client,
    endpoint: String,
    public_key: String,
    secret_key: SecretString,
}

impl LangfuseTracer {
    /// Build from config; `None` when either key is missing.
    pub fn from_config(config: &LangfuseConfig) -> Option<Self> {
        let public_key = config.public_key.clone()?;
        let secret_key = config.secret_key.clone()?;
        Some(Self {
            client: reqwest::Client::new(),
            endpoint: format!(
                "{}/api/public/ingestion",
                config.base_url.trim_end_matches('/')
            ),
            public_key,
            secret_key,
        })
    }
}

impl Tracer for LangfuseTracer {
    fn is_enabled(&self) -> bool {
        true
    }

    fn tag_and_record(&self, instance_name: &str, chat_name: &str, call: LlmCallRecord) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No async runtime, dropping trace");
            return;
        };

        let body = ingestion_batch(instance_name, chat_name, &call);
        let request = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.public_key, Some(self.secret_key.expose_secret()))
            .json(&body);
        let trace_id = call.trace_id;

        handle.spawn(async move {
            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(%trace_id, "Trace recorded");
                }
                Ok(resp) => {
                    warn!(%trace_id, status = %resp.status(), "Langfuse rejected trace");
                }
                Err(e) => {
                    warn!(%trace_id, error = %e, "Failed to send trace");
                }
            }
        });
    }
}

/// Ingestion payload: one trace plus one generation.
fn ingestion_batch(instance_name: &str, chat_name: &str, call: &LlmCallRecord) -> serde_json::Value {
    let tags: Vec<&str> = [instance_name, chat_name]
        .into_iter()
        .filter(|t| !t.is_empty())
        .collect();
    let trace_id = call.trace_id.to_string();

    json!({
        "batch": [
            {
                "id": Uuid::new_v4().to_string(),
                "type": "trace-create",
                "timestamp": call.started_at.to_rfc3339(),
                "body": {
                    "id": trace_id,
                    "name": call.prompt_name,
                    "input": call.input,
                    "output": call.output,
                    "tags": tags,
                },
            },
            {
                "id": Uuid::new_v4().to_string(),
                "type": "generation-create",
                "timestamp": call.finished_at.to_rfc3339(),
                "body": {
                    "id": Uuid::new_v4().to_string(),
                    "traceId": trace_id,
                    "name": call.prompt_name,
                    "model": call.model,
                    "input": call.input,
                    "output": call.output,
                    "startTime": call.started_at.to_rfc3339(),
                    "endTime": call.finished_at.to_rfc3339(),
                    "usage": { "total": call.tokens },
                },
            },
        ]
    })
}
