//! Evaluation dataset generation.
//!
//! Resolved Forward Records are the labelled data: 👍 copies are expected
//! matches, 👎 copies expected non-matches. For every instance with both
//! feedback chats configured, each prompt gets a directory
//! `<evals_dir>/<instance>_<prompt>_<suffix>/` holding `messages.jsonl`,
//! `task.yml` and `README.md`.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::DEFAULT_THRESHOLD;
use crate::error::{Error, Result};
use crate::llm::evaluator::compile_prompt;
use crate::pipeline::feedback::{FeedbackTracker, ForwardRecord};
use crate::pipeline::instance::{Instance, PromptSpec};
use crate::pipeline::types::Polarity;
use crate::store::atomic::atomic_write;
use crate::store::stats::Stats;

/// Model written to `task.yml` when the prompt does not set one.
const DEFAULT_EVAL_MODEL: &str = "gpt-4.1";

/// Temperature written to `task.yml` when the prompt does not set one.
const DEFAULT_EVAL_TEMPERATURE: f32 = 0.2;

/// Prompt name used for keyword-only instances.
const KEYWORDS_PROMPT: &str = "keywords";

/// What was written for one (instance, prompt) dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalSummary {
    pub instance: String,
    pub prompt: String,
    pub dir: PathBuf,
    pub positives: usize,
    pub negatives: usize,
    /// Instance precision from the stats, when any feedback was counted.
    pub precision: Option<f64>,
}

/// One `messages.jsonl` line.
#[derive(Debug, Serialize)]
struct EvalLine<'a> {
    input: &'a str,
    expected: Expected,
    trace_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    quote: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct Expected {
    is_match: bool,
}

#[derive(Debug, Serialize)]
struct TaskFile {
    eval_name: String,
    dataset: &'static str,
    model: String,
    #[serde(rename = "modelParameters")]
    model_parameters: ModelParameters,
    messages: Vec<TaskMessage>,
    task: &'static str,
    rubric: String,
    metrics: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
struct ModelParameters {
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct TaskMessage {
    role: &'static str,
    content: String,
}

/// Filesystem-safe name: anything but word chars, `-` and `.` becomes `_`.
pub fn safe_name(name: &str) -> String {
    let safe: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if safe.is_empty() {
        "chat_history".to_string()
    } else {
        safe
    }
}

/// Dataset directory for one (instance, prompt).
pub fn eval_dir(evals_dir: &Path, instance: &str, prompt: &str, suffix: &str) -> PathBuf {
    evals_dir.join(format!("{}_{}_{suffix}", safe_name(instance), safe_name(prompt)))
}

/// Write datasets for every eligible instance.
pub fn generate_evals(
    instances: &[Instance],
    tracker: &FeedbackTracker,
    stats: &Stats,
    evals_dir: &Path,
    suffix: &str,
) -> Result<Vec<EvalSummary>> {
    let suffix = suffix.trim();
    if suffix.is_empty() {
        return Err(Error::Evals("suffix must not be empty".into()));
    }

    let records = tracker.records();
    let mut summaries = Vec::new();

    for instance in instances {
        if instance.true_positive.is_none() || instance.false_positive.is_none() {
            debug!(instance = %instance.name, "No feedback chats, skipping evals");
            continue;
        }

        let judged: Vec<&ForwardRecord> = records
            .iter()
            .copied()
            .filter(|r| r.instance_name == instance.name && r.polarity().is_some())
            .collect();
        let precision = stats
            .instance(&instance.name)
            .and_then(|s| s.stats.precision());

        let prompts = if instance.prompts.is_empty() {
            vec![keywords_prompt(instance)]
        } else {
            instance.prompts.clone()
        };

        for prompt in &prompts {
            let dir = eval_dir(evals_dir, &instance.name, &prompt.name, suffix);
            let (positives, negatives) = write_dataset(&dir, &judged)?;
            write_task(&dir, &instance.name, prompt)?;
            write_readme(&dir, &instance.name, &prompt.name, suffix)?;

            info!(
                instance = %instance.name,
                prompt = %prompt.name,
                positives,
                negatives,
                dir = %dir.display(),
                "Eval dataset written"
            );
            summaries.push(EvalSummary {
                instance: instance.name.clone(),
                prompt: prompt.name.clone(),
                dir,
                positives,
                negatives,
                precision,
            });
        }
    }

    Ok(summaries)
}

/// Stand-in prompt for instances that only use keywords.
fn keywords_prompt(instance: &Instance) -> PromptSpec {
    PromptSpec {
        name: KEYWORDS_PROMPT.to_string(),
        text: format!(
            "Does the message mention any of these keywords: {}?",
            instance.words.join(", ")
        ),
        threshold: DEFAULT_THRESHOLD,
        model: None,
        temperature: None,
    }
}

fn write_dataset(dir: &Path, records: &[&ForwardRecord]) -> Result<(usize, usize)> {
    let mut out = String::new();
    let (mut positives, mut negatives) = (0, 0);

    for record in records {
        let Some(polarity) = record.polarity() else {
            continue;
        };
        let is_match = polarity == Polarity::TruePositive;
        if is_match {
            positives += 1;
        } else {
            negatives += 1;
        }

        let line = EvalLine {
            input: &record.text,
            expected: Expected { is_match },
            trace_id: record.trace_id,
            reason: record.llm_reason.as_deref().filter(|r| !r.is_empty()),
            quote: record.quote.as_deref(),
        };
        out.push_str(&serde_json::to_string(&line).map_err(|e| Error::Evals(e.to_string()))?);
        out.push('\n');
    }

    atomic_write(&dir.join("messages.jsonl"), out.as_bytes())?;
    Ok((positives, negatives))
}

fn write_task(dir: &Path, instance: &str, prompt: &PromptSpec) -> Result<()> {
    let task = TaskFile {
        eval_name: format!("{}_{}", safe_name(instance), safe_name(&prompt.name)),
        dataset: "./messages.jsonl",
        model: prompt
            .model
            .clone()
            .unwrap_or_else(|| DEFAULT_EVAL_MODEL.to_string()),
        model_parameters: ModelParameters {
            temperature: prompt.temperature.unwrap_or(DEFAULT_EVAL_TEMPERATURE),
            response_format: ResponseFormat {
                kind: "json_object",
            },
        },
        messages: vec![
            TaskMessage {
                role: "system",
                content: compile_prompt(prompt),
            },
            TaskMessage {
                role: "user",
                content: "{input}".to_string(),
            },
        ],
        task: "llm-rubric",
        rubric: rubric(prompt.threshold),
        metrics: vec!["accuracy"],
    };

    let yaml = serde_yaml::to_string(&task).map_err(|e| Error::Evals(e.to_string()))?;
    atomic_write(&dir.join("task.yml"), yaml.as_bytes())?;
    Ok(())
}

fn rubric(threshold: u8) -> String {
    format!(
        "import json\n\
         def grade(resp, expected):\n    \
         reply = json.loads(resp)\n    \
         score = reply.get(\"score\")\n    \
         pred = reply.get(\"is_match\") is True and (score is None or score >= {threshold})\n    \
         return {{\"accuracy\": int(pred == expected[\"is_match\"])}}\n"
    )
}

fn write_readme(dir: &Path, instance: &str, prompt: &str, suffix: &str) -> Result<()> {
    let readme = format!(
        "# Evaluation for {instance} - {prompt}\n\n\
         `messages.jsonl` holds forwards judged by reaction: 👍 as expected \
         matches, 👎 as expected non-matches. `task.yml` describes the model \
         call and the grading rubric.\n\n\
         To regenerate this dataset:\n\n\
         ```bash\n\
         mention-router generate-evals --suffix {suffix}\n\
         ```\n"
    );
    atomic_write(&dir.join("README.md"), readme.as_bytes())?;
    Ok(())
}
