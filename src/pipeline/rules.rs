//! Deterministic word rules evaluated before any LLM call.
//!
//! Each instance compiles its three word lists into [`WordList`]s:
//! - `ignore_words` → suppress unconditionally
//! - `negative_words` → suppress even when a keyword matched
//! - `words` → forward
//!
//! Matching is case-insensitive and anchored on word boundaries, so
//! `sale` matches "Big sale!" but not "wholesale".

use regex::{Regex, RegexBuilder};
use tracing::debug;

use crate::pipeline::instance::Instance;

/// A compiled, case-insensitive word list.
#[derive(Debug, Clone)]
pub struct WordList {
    entries: Vec<WordRule>,
}

#[derive(Debug, Clone)]
struct WordRule {
    word: String,
    regex: Regex,
}

impl WordList {
    /// Compile a list. Whitespace-only entries are dropped.
    pub fn new<S: AsRef<str>>(words: &[S]) -> Self {
        let entries = words
            .iter()
            .map(|w| w.as_ref().trim())
            .filter(|w| !w.is_empty())
            .filter_map(|word| {
                let regex = word_regex(word)?;
                Some(WordRule {
                    word: word.to_string(),
                    regex,
                })
            })
            .collect();
        Self { entries }
    }

    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// First configured word found in `text`, if any.
    ///
    /// Empty or whitespace-only text never matches.
    pub fn find(&self, text: &str) -> Option<&str> {
        if text.trim().is_empty() {
            return None;
        }
        self.entries
            .iter()
            .find(|rule| rule.regex.is_match(text))
            .map(|rule| rule.word.as_str())
    }

    pub fn matches(&self, text: &str) -> bool {
        self.find(text).is_some()
    }
}

/// Build a boundary-anchored regex for `word`.
///
/// `\b` only applies next to word characters, so a phrase starting or
/// ending in punctuation (e.g. `c++`) is anchored with a non-word
/// lookaround substitute: start of text or a non-word character.
fn word_regex(word: &str) -> Option<Regex> {
    let escaped = regex::escape(word);
    let starts_word = word.chars().next().is_some_and(is_word_char);
    let ends_word = word.chars().last().is_some_and(is_word_char);

    let prefix = if starts_word { r"\b" } else { r"(?:^|\W)" };
    let suffix = if ends_word { r"\b" } else { r"(?:\W|$)" };

    RegexBuilder::new(&format!("{prefix}{escaped}{suffix}"))
        .case_insensitive(true)
        .unicode(true)
        .build()
        .ok()
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Outcome of the deterministic rules for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOutcome {
    Ignored { word: String },
    Negative { word: String },
    Keyword { word: String },
    /// No rule fired.
    NoHit,
}

/// Compiled word rules of one instance.
#[derive(Debug, Clone)]
pub struct InstanceRules {
    ignore: WordList,
    negative: WordList,
    keywords: WordList,
}

impl InstanceRules {
    pub fn compile(instance: &Instance) -> Self {
        Self {
            ignore: WordList::new(instance.ignore_words.as_slice()),
            negative: WordList::new(instance.negative_words.as_slice()),
            keywords: WordList::new(instance.words.as_slice()),
        }
    }

    pub fn has_keywords(&self) -> bool {
        !self.keywords.is_empty()
    }

    /// Evaluate in strict priority order: ignore, negative, keyword.
    pub fn evaluate(&self, instance: &str, text: &str) -> RuleOutcome {
        if let Some(word) = self.ignore.find(text) {
            debug!(instance, word, "Ignore word matched");
            return RuleOutcome::Ignored {
                word: word.to_string(),
            };
        }

        if let Some(word) = self.negative.find(text) {
            debug!(instance, word, "Negative word matched");
            return RuleOutcome::Negative {
                word: word.to_string(),
            };
        }

        match self.keywords.find(text) {
            Some(word) => RuleOutcome::Keyword {
                word: word.to_string(),
            },
            None => RuleOutcome::NoHit,
        }
    }
}

/// Global sender ignore sets.
#[derive(Debug, Clone, Default)]
pub struct SenderFilter {
    usernames: Vec<String>,
    user_ids: Vec<i64>,
}

impl SenderFilter {
    /// Usernames are compared case-insensitively with any leading `@` removed.
    pub fn new(usernames: &[String], user_ids: &[i64]) -> Self {
        let usernames = usernames
            .iter()
            .map(|u| normalize_username(u))
            .filter(|u| !u.is_empty())
            .collect();
        Self {
            usernames,
            user_ids: user_ids.to_vec(),
        }
    }

    pub fn is_ignored(&self, username: Option<&str>, user_id: Option<i64>) -> bool {
        if let Some(id) = user_id
            && self.user_ids.contains(&id)
        {
            return true;
        }
        username
            .map(normalize_username)
            .is_some_and(|u| !u.is_empty() && self.usernames.contains(&u))
    }
}

fn normalize_username(raw: &str) -> String {
    raw.trim().trim_start_matches('@').to_lowercase()
}
