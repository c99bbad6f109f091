//! Durable match/feedback statistics with a versioned on-disk schema.
//!
//! Layout (v3):
//!
//! ```json
//! {
//!   "version": 3,
//!   "stats": { "total": 0, "tokens": 0, "forwarded_total": 0, ... },
//!   "instances": [
//!     { "name": "jobs", "stats": { ... }, "days": { "2024-01-01": { "stats": { ... } } } }
//!   ]
//! }
//! ```
//!
//! Older files are upgraded on load by chaining one migration per version
//! step. Each migration is a plain `serde_json::Value` rewrite, so adding a
//! v4 means appending one entry to [`MIGRATIONS`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::StatsError;
use crate::pipeline::types::Polarity;
use crate::store::atomic::{atomic_write_json, read_optional};

/// Newest schema version this build reads and writes.
pub const CURRENT_VERSION: u64 = 3;

/// Date format of the per-day buckets.
const DAY_FORMAT: &str = "%Y-%m-%d";

/// Counter set carried by every bucket (global, instance, day).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    /// Messages evaluated.
    #[serde(default)]
    pub total: u64,
    /// LLM tokens spent.
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub forwarded_total: u64,
    #[serde(default)]
    pub forwarded_words: u64,
    #[serde(default)]
    pub forwarded_prompt: u64,
    #[serde(default)]
    pub suppressed_ignored: u64,
    #[serde(default)]
    pub suppressed_negative: u64,
    #[serde(default)]
    pub suppressed_llm: u64,
    #[serde(default)]
    pub suppressed_muted: u64,
    #[serde(default)]
    pub forward_failed: u64,
    #[serde(default)]
    pub true_positive: u64,
    #[serde(default)]
    pub false_positive: u64,
}

impl Counters {
    fn apply_outcome(&mut self, outcome: Outcome) {
        self.total += 1;
        match outcome {
            Outcome::Forwarded(kind) => {
                self.forwarded_total += 1;
                match kind {
                    ForwardKind::Keyword => self.forwarded_words += 1,
                    ForwardKind::Prompt => self.forwarded_prompt += 1,
                }
            }
            Outcome::Suppressed(SuppressKind::Ignored) => self.suppressed_ignored += 1,
            Outcome::Suppressed(SuppressKind::Negative) => self.suppressed_negative += 1,
            Outcome::Suppressed(SuppressKind::LlmReject) => self.suppressed_llm += 1,
            Outcome::Suppressed(SuppressKind::Muted) => self.suppressed_muted += 1,
            Outcome::Suppressed(SuppressKind::NoMatch) => {}
            Outcome::ForwardFailed => self.forward_failed += 1,
        }
    }

    fn apply_feedback(&mut self, polarity: Polarity) {
        match polarity {
            Polarity::TruePositive => self.true_positive += 1,
            Polarity::FalsePositive => self.false_positive += 1,
        }
    }

    /// Share of resolved feedback that was positive, if any feedback exists.
    pub fn precision(&self) -> Option<f64> {
        let resolved = self.true_positive + self.false_positive;
        (resolved > 0).then(|| self.true_positive as f64 / resolved as f64)
    }
}

/// Per-day bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayStats {
    #[serde(default)]
    pub stats: Counters,
}

/// Per-instance bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStats {
    pub name: String,
    #[serde(default)]
    pub stats: Counters,
    #[serde(default)]
    pub days: BTreeMap<String, DayStats>,
}

/// How a (message, instance) evaluation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Forwarded(ForwardKind),
    Suppressed(SuppressKind),
    /// Forward verdict whose every dispatch failed. Not counted as forwarded.
    ForwardFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardKind {
    Keyword,
    Prompt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressKind {
    Ignored,
    Negative,
    LlmReject,
    Muted,
    NoMatch,
}

/// The whole statistics document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub version: u64,
    #[serde(default)]
    pub stats: Counters,
    #[serde(default)]
    pub instances: Vec<InstanceStats>,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            stats: Counters::default(),
            instances: Vec::new(),
        }
    }
}

impl Stats {
    /// Look up an instance bucket.
    pub fn instance(&self, name: &str) -> Option<&InstanceStats> {
        self.instances.iter().find(|i| i.name == name)
    }

    fn instance_mut(&mut self, name: &str) -> &mut InstanceStats {
        let idx = match self.instances.iter().position(|i| i.name == name) {
            Some(idx) => idx,
            None => {
                self.instances.push(InstanceStats {
                    name: name.to_string(),
                    ..Default::default()
                });
                self.instances.len() - 1
            }
        };
        &mut self.instances[idx]
    }

    fn buckets_mut(&mut self, name: &str, day: NaiveDate) -> [&mut Counters; 3] {
        let Stats {
            stats, instances, ..
        } = self;
        let idx = match instances.iter().position(|i| i.name == name) {
            Some(idx) => idx,
            None => {
                instances.push(InstanceStats {
                    name: name.to_string(),
                    ..Default::default()
                });
                instances.len() - 1
            }
        };
        let inst = &mut instances[idx];
        let day_bucket = inst
            .days
            .entry(day.format(DAY_FORMAT).to_string())
            .or_default();
        [stats, &mut inst.stats, &mut day_bucket.stats]
    }

    /// Record one evaluation outcome in today's bucket.
    pub fn record_outcome(&mut self, instance: &str, outcome: Outcome) {
        self.record_outcome_on(instance, outcome, Utc::now().date_naive());
    }

    pub fn record_outcome_on(&mut self, instance: &str, outcome: Outcome, day: NaiveDate) {
        for bucket in self.buckets_mut(instance, day) {
            bucket.apply_outcome(outcome);
        }
    }

    /// Record one resolved reaction in today's bucket.
    pub fn record_feedback(&mut self, instance: &str, polarity: Polarity) {
        self.record_feedback_on(instance, polarity, Utc::now().date_naive());
    }

    pub fn record_feedback_on(&mut self, instance: &str, polarity: Polarity, day: NaiveDate) {
        for bucket in self.buckets_mut(instance, day) {
            bucket.apply_feedback(polarity);
        }
    }

    /// Add LLM token usage. Zero is ignored.
    pub fn add_tokens(&mut self, instance: &str, tokens: u64) {
        if tokens == 0 {
            return;
        }
        self.stats.tokens += tokens;
        self.instance_mut(instance).stats.tokens += tokens;
    }
}

// ── Schema migrations ───────────────────────────────────────────────

/// A single schema upgrade step: `from` → `from + 1`.
struct Migration {
    from: u64,
    name: &'static str,
    apply: fn(Value) -> Result<Value, String>,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        from: 1,
        name: "flat_counters_to_stats_envelope",
        apply: flat_to_envelope,
    },
    Migration {
        from: 2,
        name: "explicit_version_tag",
        apply: tag_version,
    },
];

/// Detect the schema version of a raw document.
///
/// Files written by this build carry `version`. Untagged files with a
/// top-level `stats` object are the v2 envelope; anything else is the v1
/// flat layout.
pub fn detect_version(doc: &Value) -> u64 {
    if let Some(version) = doc.get("version").and_then(Value::as_u64) {
        return version;
    }
    if doc.get("stats").is_some_and(Value::is_object) {
        2
    } else {
        1
    }
}

/// Bring a raw document up to [`CURRENT_VERSION`].
///
/// Idempotent: a current document is returned untouched.
pub fn migrate(mut doc: Value) -> Result<Value, StatsError> {
    let mut version = detect_version(&doc);
    if version > CURRENT_VERSION {
        return Err(StatsError::UnsupportedVersion {
            found: version,
            supported: CURRENT_VERSION,
        });
    }

    while version < CURRENT_VERSION {
        let step = MIGRATIONS
            .iter()
            .find(|m| m.from == version)
            .ok_or_else(|| StatsError::Migration {
                from: version,
                reason: "no migration registered".into(),
            })?;
        info!(from = version, step = step.name, "Migrating stats schema");
        doc = (step.apply)(doc).map_err(|reason| StatsError::Migration {
            from: version,
            reason,
        })?;
        version += 1;
    }

    Ok(doc)
}

/// v1 → v2: move every numeric counter into a `stats` object at each level,
/// and turn bare per-day counts into `{"stats": {"total": n}}`.
fn flat_to_envelope(doc: Value) -> Result<Value, String> {
    let Value::Object(mut root) = doc else {
        return Err("root is not an object".into());
    };

    let instances = match root.remove("instances") {
        Some(Value::Array(items)) => items
            .into_iter()
            .map(instance_to_envelope)
            .collect::<Result<Vec<_>, _>>()?,
        Some(Value::Null) | None => Vec::new(),
        Some(_) => return Err("'instances' is not a list".into()),
    };

    let mut out = Map::new();
    out.insert("stats".into(), Value::Object(split_counters(&mut root)));
    out.insert("instances".into(), Value::Array(instances));
    Ok(Value::Object(out))
}

fn instance_to_envelope(inst: Value) -> Result<Value, String> {
    let Value::Object(mut inst) = inst else {
        return Err("instance entry is not an object".into());
    };

    let mut days = Map::new();
    match inst.remove("days") {
        Some(Value::Object(raw_days)) => {
            for (day, count) in raw_days {
                let bucket = match count {
                    Value::Number(n) => {
                        let mut stats = Map::new();
                        stats.insert("total".into(), Value::Number(n));
                        let mut bucket = Map::new();
                        bucket.insert("stats".into(), Value::Object(stats));
                        Value::Object(bucket)
                    }
                    Value::Object(mut obj) => {
                        if !obj.contains_key("stats") {
                            let stats = split_counters(&mut obj);
                            obj.insert("stats".into(), Value::Object(stats));
                        }
                        Value::Object(obj)
                    }
                    other => return Err(format!("day '{day}' has non-numeric count {other}")),
                };
                days.insert(day, bucket);
            }
        }
        Some(Value::Null) | None => {}
        Some(_) => return Err("'days' is not an object".into()),
    }

    let name = inst.remove("name").unwrap_or(Value::String(String::new()));
    let stats = split_counters(&mut inst);

    let mut out = Map::new();
    out.insert("name".into(), name);
    out.insert("stats".into(), Value::Object(stats));
    out.insert("days".into(), Value::Object(days));
    Ok(Value::Object(out))
}

/// Remove and return every numeric field of `obj`.
fn split_counters(obj: &mut Map<String, Value>) -> Map<String, Value> {
    let keys: Vec<String> = obj
        .iter()
        .filter(|(_, v)| v.is_number())
        .map(|(k, _)| k.clone())
        .collect();
    let mut counters = Map::new();
    for key in keys {
        if let Some(v) = obj.remove(&key) {
            counters.insert(key, v);
        }
    }
    counters
}

/// v2 → v3: stamp the version. New counters default to zero on deserialize.
fn tag_version(doc: Value) -> Result<Value, String> {
    let Value::Object(mut root) = doc else {
        return Err("root is not an object".into());
    };
    root.insert("version".into(), Value::from(3u64));
    Ok(Value::Object(root))
}

// ── Load / save ─────────────────────────────────────────────────────

/// Load stats from `path`, migrating older layouts. A missing file yields
/// empty stats.
pub fn load(path: &Path) -> Result<Stats, StatsError> {
    let Some(raw) = read_optional(path)? else {
        debug!(path = %path.display(), "No stats file yet, starting empty");
        return Ok(Stats::default());
    };
    let doc: Value = serde_json::from_str(&raw)?;
    let doc = migrate(doc)?;
    Ok(serde_json::from_value(doc)?)
}

/// Save stats with a single atomic write.
pub fn save(path: &Path, stats: &Stats) -> Result<(), StatsError> {
    atomic_write_json(path, stats)?;
    Ok(())
}

/// Stats owned by the orchestrator, flushed to disk periodically.
pub struct StatsStore {
    path: PathBuf,
    stats: Stats,
    dirty: bool,
    flush_interval: Duration,
    last_flush: Instant,
}

impl StatsStore {
    /// Load (and migrate) the stats file at `path`.
    pub fn open(path: impl Into<PathBuf>, flush_interval: Duration) -> Result<Self, StatsError> {
        let path = path.into();
        let stats = load(&path)?;
        Ok(Self {
            path,
            stats,
            dirty: false,
            flush_interval,
            last_flush: Instant::now(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn record_outcome(&mut self, instance: &str, outcome: Outcome) {
        self.stats.record_outcome(instance, outcome);
        self.dirty = true;
    }

    pub fn record_feedback(&mut self, instance: &str, polarity: Polarity) {
        self.stats.record_feedback(instance, polarity);
        self.dirty = true;
    }

    pub fn add_tokens(&mut self, instance: &str, tokens: u64) {
        if tokens > 0 {
            self.stats.add_tokens(instance, tokens);
            self.dirty = true;
        }
    }

    /// Flush when dirty and the interval has elapsed. Returns whether a
    /// write happened.
    pub fn flush_if_due(&mut self) -> Result<bool, StatsError> {
        if !self.dirty || self.last_flush.elapsed() < self.flush_interval {
            return Ok(false);
        }
        self.flush()?;
        Ok(true)
    }

    /// Write the current counters. On failure the in-memory counters stay
    /// authoritative and remain dirty.
    pub fn flush(&mut self) -> Result<(), StatsError> {
        if !self.dirty {
            return Ok(());
        }
        debug!(path = %self.path.display(), "Flushing stats");
        save(&self.path, &self.stats)?;
        self.dirty = false;
        self.last_flush = Instant::now();
        Ok(())
    }

    /// Unconditionally rewrite the file (used by the migrate command).
    pub fn rewrite(&mut self) -> Result<(), StatsError> {
        self.dirty = true;
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, DAY_FORMAT).unwrap()
    }

    #[test]
    fn outcomes_land_in_all_three_buckets() {
        let mut stats = Stats::default();
        let d = day("2024-05-01");
        stats.record_outcome_on("a", Outcome::Forwarded(ForwardKind::Keyword), d);
        stats.record_outcome_on("a", Outcome::Forwarded(ForwardKind::Prompt), d);
        stats.record_outcome_on("b", Outcome::Suppressed(SuppressKind::NoMatch), d);
        stats.add_tokens("a", 10);
        stats.add_tokens("b", 5);

        assert_eq!(stats.stats.total, 3);
        assert_eq!(stats.stats.tokens, 15);
        assert_eq!(stats.stats.forwarded_total, 2);
        assert_eq!(stats.stats.forwarded_words, 1);
        assert_eq!(stats.stats.forwarded_prompt, 1);

        let a = stats.instance("a").unwrap();
        assert_eq!(a.stats.total, 2);
        assert_eq!(a.stats.tokens, 10);
        assert_eq!(a.days["2024-05-01"].stats.forwarded_total, 2);

        let b = stats.instance("b").unwrap();
        assert_eq!(b.stats.total, 1);
        assert_eq!(b.stats.forwarded_total, 0);
    }

    #[test]
    fn suppress_kinds_are_counted_separately() {
        let mut stats = Stats::default();
        let d = day("2024-05-01");
        for kind in [
            SuppressKind::Ignored,
            SuppressKind::Negative,
            SuppressKind::LlmReject,
            SuppressKind::Muted,
        ] {
            stats.record_outcome_on("a", Outcome::Suppressed(kind), d);
        }
        stats.record_outcome_on("a", Outcome::ForwardFailed, d);

        let c = &stats.instance("a").unwrap().stats;
        assert_eq!(c.total, 5);
        assert_eq!(c.suppressed_ignored, 1);
        assert_eq!(c.suppressed_negative, 1);
        assert_eq!(c.suppressed_llm, 1);
        assert_eq!(c.suppressed_muted, 1);
        assert_eq!(c.forward_failed, 1);
        assert_eq!(c.forwarded_total, 0);
    }

    #[test]
    fn feedback_counts_and_precision() {
        let mut stats = Stats::default();
        let d = day("2024-05-02");
        stats.record_feedback_on("a", Polarity::TruePositive, d);
        stats.record_feedback_on("a", Polarity::TruePositive, d);
        stats.record_feedback_on("a", Polarity::FalsePositive, d);

        let c = &stats.instance("a").unwrap().stats;
        assert_eq!(c.true_positive, 2);
        assert_eq!(c.false_positive, 1);
        assert!((c.precision().unwrap() - 2.0 / 3.0).abs() < 1e-9);
        assert!(Counters::default().precision().is_none());
    }

    #[test]
    fn detects_versions() {
        assert_eq!(detect_version(&json!({"total": 1, "instances": []})), 1);
        assert_eq!(detect_version(&json!({"stats": {"total": 1}})), 2);
        assert_eq!(detect_version(&json!({"version": 3, "stats": {}})), 3);
    }

    #[test]
    fn legacy_flat_layout_is_migrated() {
        let old = json!({
            "total": 1,
            "tokens": 2,
            "instances": [
                {"name": "a", "total": 1, "tokens": 2, "days": {"2024-01-01": 1}}
            ]
        });

        let stats: Stats = serde_json::from_value(migrate(old).unwrap()).unwrap();

        assert_eq!(stats.version, CURRENT_VERSION);
        assert_eq!(stats.stats.total, 1);
        assert_eq!(stats.stats.tokens, 2);
        let inst = &stats.instances[0];
        assert_eq!(inst.name, "a");
        assert_eq!(inst.stats.total, 1);
        assert_eq!(inst.stats.tokens, 2);
        assert_eq!(inst.days["2024-01-01"].stats.total, 1);
    }

    #[test]
    fn legacy_extra_counters_are_preserved() {
        let old = json!({
            "total": 4,
            "forwarded_total": 3,
            "instances": [{"name": "a", "total": 4, "forwarded_words": 2, "days": {}}]
        });

        let stats: Stats = serde_json::from_value(migrate(old).unwrap()).unwrap();

        assert_eq!(stats.stats.forwarded_total, 3);
        assert_eq!(stats.instances[0].stats.forwarded_words, 2);
    }

    #[test]
    fn untagged_envelope_gets_version() {
        let v2 = json!({
            "stats": {"total": 3, "tokens": 15, "forwarded_total": 2},
            "instances": [{
                "name": "a",
                "stats": {"total": 2},
                "days": {"2024-01-01": {"stats": {"total": 2}}}
            }]
        });

        let doc = migrate(v2).unwrap();
        assert_eq!(doc["version"], 3);
        let stats: Stats = serde_json::from_value(doc).unwrap();
        assert_eq!(stats.stats.forwarded_total, 2);
        assert_eq!(stats.instances[0].days["2024-01-01"].stats.total, 2);
    }

    #[test]
    fn migrate_is_noop_on_current_document() {
        let current = serde_json::to_value(Stats::default()).unwrap();
        assert_eq!(migrate(current.clone()).unwrap(), current);
    }

    #[test]
    fn newer_version_is_rejected() {
        let err = migrate(json!({"version": 99, "stats": {}})).unwrap_err();
        assert!(matches!(err, StatsError::UnsupportedVersion { found: 99, .. }));
    }

    #[test]
    fn malformed_legacy_document_fails_migration() {
        let err = migrate(json!({"total": 1, "instances": "nope"})).unwrap_err();
        assert!(matches!(err, StatsError::Migration { from: 1, .. }));
    }

    #[test]
    fn save_of_loaded_file_is_byte_stable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stats.json");
        std::fs::write(
            &path,
            r#"{"total": 2, "tokens": 0, "instances": [{"name": "x", "total": 2, "tokens": 0, "days": {"2024-03-01": 2}}]}"#,
        )
        .unwrap();

        // First load migrates; first save writes the new layout.
        let stats = load(&path).unwrap();
        save(&path, &stats).unwrap();
        let first = std::fs::read(&path).unwrap();

        save(&path, &load(&path).unwrap()).unwrap();
        let second = std::fs::read(&path).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let stats = load(&dir.path().join("stats.json")).unwrap();
        assert_eq!(stats, Stats::default());
    }

    #[test]
    fn store_flushes_only_when_dirty_and_due() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stats.json");
        let mut store = StatsStore::open(&path, Duration::ZERO).unwrap();

        assert!(!store.flush_if_due().unwrap());
        assert!(!path.exists());

        store.record_outcome("a", Outcome::Forwarded(ForwardKind::Keyword));
        assert!(store.is_dirty());
        assert!(store.flush_if_due().unwrap());
        assert!(!store.is_dirty());

        let reloaded = load(&path).unwrap();
        assert_eq!(reloaded.stats.forwarded_total, 1);
    }

    #[test]
    fn store_waits_for_interval() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stats.json");
        let mut store = StatsStore::open(&path, Duration::from_secs(3600)).unwrap();

        store.record_feedback("a", Polarity::FalsePositive);
        assert!(!store.flush_if_due().unwrap());
        store.flush().unwrap();
        assert_eq!(load(&path).unwrap().stats.false_positive, 1);
    }

    #[test]
    fn rewrite_upgrades_legacy_file_on_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stats.json");
        let old = json!({"total": 4, "tokens": 9, "instances": []});
        std::fs::write(&path, old.to_string()).unwrap();

        let mut store = StatsStore::open(&path, Duration::from_secs(3600)).unwrap();
        store.rewrite().unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["version"], json!(CURRENT_VERSION));
        assert_eq!(raw["stats"]["total"], json!(4));
    }
}
