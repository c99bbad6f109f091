//! Validated monitoring instances.
//!
//! `normalize` turns raw config definitions into [`Instance`]s. It checks
//! shape and cardinality only; resolving selectors to live chats is the
//! transport's job.

use std::collections::HashSet;
use std::fmt;

use crate::config::{DEFAULT_THRESHOLD, PromptDef, RawInstance, RawPrompt, RawSelector};
use crate::error::ConfigError;

/// Fallback name for instances without one.
const UNNAMED_INSTANCE: &str = "instance";

/// Something that resolves to one or more chats.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScopeSelector {
    ChatId(i64),
    /// A public username or t.me link, stored without `@` or URL prefix.
    Username(String),
    /// A folder declared in `folder_chats`.
    Folder(String),
}

impl ScopeSelector {
    /// Parse a config entry. Numeric strings become chat IDs; `@name`,
    /// `t.me/name` and bare names become usernames.
    pub fn from_raw(raw: &RawSelector) -> Option<Self> {
        match raw {
            RawSelector::Id(id) => Some(Self::ChatId(*id)),
            RawSelector::Name(name) => Self::parse_entity(name),
        }
    }

    pub fn parse_entity(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Ok(id) = trimmed.parse::<i64>() {
            return Some(Self::ChatId(id));
        }
        let name = trimmed
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_start_matches("t.me/")
            .trim_start_matches('@');
        let name = name.split(['?', '/']).next().unwrap_or_default();
        if name.is_empty() {
            return None;
        }
        Some(Self::Username(name.to_string()))
    }
}

impl fmt::Display for ScopeSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChatId(id) => write!(f, "{id}"),
            Self::Username(name) => write!(f, "@{name}"),
            Self::Folder(name) => write!(f, "folder '{name}'"),
        }
    }
}

/// One LLM prompt of an instance's gate.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptSpec {
    pub name: String,
    pub text: String,
    /// Minimum 0-5 score that counts as a match when the reply has a score.
    pub threshold: u8,
    pub model: Option<String>,
    pub temperature: Option<f32>,
}

/// A validated monitoring instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub name: String,
    pub scope: Vec<ScopeSelector>,
    pub words: Vec<String>,
    pub negative_words: Vec<String>,
    pub ignore_words: Vec<String>,
    /// Forward destinations (`target_chat`, then `target_entity`).
    pub targets: Vec<ScopeSelector>,
    pub true_positive: Option<ScopeSelector>,
    pub false_positive: Option<ScopeSelector>,
    pub folder_mute: bool,
    pub no_forward_message: bool,
    pub llm_context: usize,
    pub prompts: Vec<PromptSpec>,
}

impl Instance {
    pub fn has_llm_gate(&self) -> bool {
        !self.prompts.is_empty()
    }

    /// Folder names in this instance's scope.
    pub fn folders(&self) -> impl Iterator<Item = &str> {
        self.scope.iter().filter_map(|s| match s {
            ScopeSelector::Folder(name) => Some(name.as_str()),
            _ => None,
        })
    }
}

/// Validate raw definitions into an ordered list of instances.
///
/// Fails on an empty scope, an empty trigger source, a missing forward
/// target, or a duplicate name.
pub fn normalize(raw: &[RawInstance]) -> Result<Vec<Instance>, ConfigError> {
    let mut seen = HashSet::new();
    let mut instances = Vec::with_capacity(raw.len());

    for def in raw {
        let instance = normalize_one(def)?;
        if !seen.insert(instance.name.clone()) {
            return Err(ConfigError::DuplicateInstance(instance.name));
        }
        instances.push(instance);
    }

    Ok(instances)
}

fn normalize_one(def: &RawInstance) -> Result<Instance, ConfigError> {
    let name = def
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(UNNAMED_INSTANCE)
        .to_string();

    let mut scope = Vec::new();
    scope.extend(
        clean_list(&def.folders)
            .into_iter()
            .map(ScopeSelector::Folder),
    );
    scope.extend(def.chat_ids.iter().copied().map(ScopeSelector::ChatId));
    for entity in &def.entities {
        let selector =
            ScopeSelector::parse_entity(entity).ok_or_else(|| ConfigError::InvalidValue {
                key: format!("instances.{name}.entities"),
                message: format!("cannot parse entity '{entity}'"),
            })?;
        scope.push(selector);
    }
    dedup_preserving_order(&mut scope);
    if scope.is_empty() {
        return Err(ConfigError::EmptyScope { name });
    }

    let words = clean_list(&def.words);
    let prompts = def
        .prompts
        .iter()
        .enumerate()
        .filter_map(|(idx, raw)| prompt_spec(idx, raw))
        .collect::<Vec<_>>();
    if words.is_empty() && prompts.is_empty() {
        return Err(ConfigError::EmptyTrigger { name });
    }

    let mut targets = Vec::new();
    for (key, raw) in [
        ("target_chat", &def.target_chat),
        ("target_entity", &def.target_entity),
    ] {
        if let Some(raw) = raw {
            targets.push(selector(&name, key, raw)?);
        }
    }
    dedup_preserving_order(&mut targets);
    if targets.is_empty() {
        return Err(ConfigError::NoTarget { name });
    }

    let true_positive = def
        .true_positive_entity
        .as_ref()
        .map(|raw| selector(&name, "true_positive_entity", raw))
        .transpose()?;
    let false_positive = def
        .false_positive_entity
        .as_ref()
        .map(|raw| selector(&name, "false_positive_entity", raw))
        .transpose()?;

    Ok(Instance {
        name,
        scope,
        words,
        negative_words: clean_list(&def.negative_words),
        ignore_words: clean_list(&def.ignore_words),
        targets,
        true_positive,
        false_positive,
        folder_mute: def.folder_mute,
        no_forward_message: def.no_forward_message,
        llm_context: def.llm_context,
        prompts,
    })
}

fn selector(instance: &str, key: &str, raw: &RawSelector) -> Result<ScopeSelector, ConfigError> {
    ScopeSelector::from_raw(raw).ok_or_else(|| ConfigError::InvalidValue {
        key: format!("instances.{instance}.{key}"),
        message: format!("cannot parse chat reference {raw:?}"),
    })
}

/// Build a prompt; prompts with no text are dropped.
fn prompt_spec(idx: usize, raw: &RawPrompt) -> Option<PromptSpec> {
    let fallback_name = || format!("prompt{}", idx + 1);
    match raw {
        RawPrompt::Text(text) => {
            let text = text.trim();
            (!text.is_empty()).then(|| PromptSpec {
                name: fallback_name(),
                text: text.to_string(),
                threshold: DEFAULT_THRESHOLD,
                model: None,
                temperature: None,
            })
        }
        RawPrompt::Full(PromptDef {
            name,
            prompt,
            threshold,
            config,
        }) => {
            let text = prompt.as_deref().map(str::trim).filter(|t| !t.is_empty())?;
            let config = config.clone().unwrap_or_default();
            Some(PromptSpec {
                name: name
                    .as_deref()
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .map(String::from)
                    .unwrap_or_else(fallback_name),
                text: text.to_string(),
                threshold: (*threshold).min(5),
                model: config.model,
                temperature: config.temperature,
            })
        }
    }
}

/// Trim entries and drop whitespace-only ones.
fn clean_list(items: &[String]) -> Vec<String> {
    items
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn dedup_preserving_order<T: Eq + std::hash::Hash + Clone>(items: &mut Vec<T>) {
    let mut seen = HashSet::new();
    items.retain(|item| seen.insert(item.clone()));
}
