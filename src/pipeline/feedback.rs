//! Reaction feedback tracker.
//!
//! Owns the table forwarded-message → [`ForwardRecord`]. A record starts
//! `Pending` and moves to `Resolved` on the first 👍/👎; after that every
//! reaction on it is a no-op. When one original message was forwarded to
//! several destinations for the same instance, the first judged copy
//! resolves the pair (original, instance) and reactions on the other
//! copies are ignored too.
//!
//! The table is checkpointed to `forwards.json` so pending records
//! survive restarts.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::FeedbackError;
use crate::pipeline::types::{FeedbackOutcome, MessageRef, Polarity, Reason};
use crate::store::atomic::{atomic_write_json, read_json_optional};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RecordState {
    Pending,
    Resolved {
        polarity: Polarity,
        resolved_at: DateTime<Utc>,
    },
}

/// Linkage between an original message and one forwarded copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardRecord {
    pub original: MessageRef,
    pub forwarded: MessageRef,
    pub instance_name: String,
    pub reason: Reason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<String>,
    /// Original message text, kept for evaluation datasets.
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub state: RecordState,
}

impl ForwardRecord {
    pub fn polarity(&self) -> Option<Polarity> {
        match self.state {
            RecordState::Pending => None,
            RecordState::Resolved { polarity, .. } => Some(polarity),
        }
    }

    fn outcome(&self, polarity: Polarity) -> FeedbackOutcome {
        FeedbackOutcome {
            instance_name: self.instance_name.clone(),
            polarity,
            quote: self.quote.clone(),
            reason: self.reason,
            original: self.original,
            forwarded: self.forwarded,
        }
    }
}

/// Extra data stored with a forward, beyond the identity and verdict.
#[derive(Debug, Clone, Default)]
pub struct ForwardDetails {
    pub text: String,
    pub prompt_name: Option<String>,
    pub llm_reason: Option<String>,
    pub trace_id: Option<Uuid>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Checkpoint {
    #[serde(default)]
    records: Vec<ForwardRecord>,
}

/// Forward Record table with at-most-once feedback resolution.
#[derive(Debug, Default)]
pub struct FeedbackTracker {
    records: HashMap<MessageRef, ForwardRecord>,
    /// (instance, original) pairs that already received feedback.
    judged: HashSet<(String, MessageRef)>,
    path: Option<PathBuf>,
    dirty: bool,
}

impl FeedbackTracker {
    /// In-memory tracker without a checkpoint file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the checkpoint at `path`; a missing file starts empty.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, FeedbackError> {
        let path = path.into();
        let checkpoint: Checkpoint = read_json_optional(&path)?.unwrap_or_default();

        let mut tracker = Self {
            path: Some(path),
            ..Self::default()
        };
        for record in checkpoint.records {
            if record.polarity().is_some() {
                tracker
                    .judged
                    .insert((record.instance_name.clone(), record.original));
            }
            tracker.records.insert(record.forwarded, record);
        }
        debug!(records = tracker.records.len(), "Loaded forward records");
        Ok(tracker)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn get(&self, forwarded: &MessageRef) -> Option<&ForwardRecord> {
        self.records.get(forwarded)
    }

    /// All records, oldest first.
    pub fn records(&self) -> Vec<&ForwardRecord> {
        let mut records: Vec<_> = self.records.values().collect();
        records.sort_by_key(|r| (r.created_at, r.forwarded));
        records
    }

    /// Record a new forward in `Pending` state.
    ///
    /// Re-registering the same forwarded identity replaces the old record.
    pub fn register_forward(
        &mut self,
        original: MessageRef,
        forwarded: MessageRef,
        instance_name: &str,
        reason: Reason,
        quote: Option<String>,
        details: ForwardDetails,
    ) {
        let record = ForwardRecord {
            original,
            forwarded,
            instance_name: instance_name.to_string(),
            reason,
            quote,
            text: details.text,
            prompt_name: details.prompt_name,
            llm_reason: details.llm_reason,
            trace_id: details.trace_id,
            created_at: Utc::now(),
            state: RecordState::Pending,
        };
        debug!(
            instance = instance_name,
            %original,
            %forwarded,
            "Registered forward"
        );
        self.records.insert(forwarded, record);
        self.dirty = true;
    }

    /// Resolve a reaction on a forwarded copy.
    ///
    /// Returns an outcome only the first time a 👍/👎 lands on any copy of
    /// an (original, instance) pair. Unknown messages, other emojis and
    /// repeated or changed reactions return `None`.
    pub fn resolve_reaction(
        &mut self,
        forwarded: MessageRef,
        emoji: &str,
    ) -> Option<FeedbackOutcome> {
        let polarity = Polarity::from_emoji(emoji)?;

        let Some(record) = self.records.get_mut(&forwarded) else {
            debug!(%forwarded, "Reaction on unknown message");
            return None;
        };

        if let RecordState::Resolved { .. } = record.state {
            debug!(%forwarded, "Forward already resolved");
            return None;
        }

        let key = (record.instance_name.clone(), record.original);
        if self.judged.contains(&key) {
            debug!(
                %forwarded,
                instance = %record.instance_name,
                "Another copy of this message was already judged"
            );
            return None;
        }

        record.state = RecordState::Resolved {
            polarity,
            resolved_at: Utc::now(),
        };
        let outcome = record.outcome(polarity);
        self.judged.insert(key);
        self.dirty = true;

        info!(
            instance = %outcome.instance_name,
            %forwarded,
            polarity = polarity.label(),
            "Feedback resolved"
        );
        Some(outcome)
    }

    /// Forget records created before `cutoff`.
    ///
    /// Call only after the stats reflecting every resolved record have been
    /// saved; resolved outcomes live on in the stats, only the lookup is
    /// dropped.
    pub fn evict_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| r.created_at >= cutoff);
        let evicted = before - self.records.len();
        if evicted == 0 {
            return 0;
        }

        let live: HashSet<(String, MessageRef)> = self
            .records
            .values()
            .map(|r| (r.instance_name.clone(), r.original))
            .collect();
        self.judged.retain(|key| live.contains(key));
        self.dirty = true;

        info!(evicted, remaining = self.records.len(), "Evicted old forward records");
        evicted
    }

    /// Write the checkpoint if anything changed.
    pub fn checkpoint(&mut self) -> Result<(), FeedbackError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }
        write_checkpoint(path, &self.records())?;
        self.dirty = false;
        Ok(())
    }
}

fn write_checkpoint(path: &Path, records: &[&ForwardRecord]) -> Result<(), FeedbackError> {
    #[derive(Serialize)]
    struct CheckpointRef<'a> {
        records: &'a [&'a ForwardRecord],
    }
    atomic_write_json(path, &CheckpointRef { records })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{THUMBS_DOWN, THUMBS_UP};
    use tempfile::tempdir;

    const ORIGINAL: MessageRef = MessageRef {
        chat_id: -1001,
        message_id: 10,
    };
    const COPY_A: MessageRef = MessageRef {
        chat_id: -2002,
        message_id: 500,
    };
    const COPY_B: MessageRef = MessageRef {
        chat_id: -3003,
        message_id: 77,
    };

    fn tracker_with(copies: &[MessageRef]) -> FeedbackTracker {
        let mut tracker = FeedbackTracker::new();
        for copy in copies {
            tracker.register_forward(
                ORIGINAL,
                *copy,
                "alerts",
                Reason::KeywordMatch,
                Some("urgent".into()),
                ForwardDetails {
                    text: "This is urgent!".into(),
                    ..Default::default()
                },
            );
        }
        tracker
    }

    #[test]
    fn first_reaction_resolves() {
        let mut tracker = tracker_with(&[COPY_A]);
        let outcome = tracker.resolve_reaction(COPY_A, THUMBS_UP).unwrap();
        assert_eq!(outcome.instance_name, "alerts");
        assert_eq!(outcome.polarity, Polarity::TruePositive);
        assert_eq!(outcome.quote.as_deref(), Some("urgent"));
        assert_eq!(outcome.reason, Reason::KeywordMatch);
        assert_eq!(outcome.original, ORIGINAL);
        assert_eq!(
            tracker.get(&COPY_A).unwrap().polarity(),
            Some(Polarity::TruePositive)
        );
    }

    #[test]
    fn second_reaction_is_noop() {
        let mut tracker = tracker_with(&[COPY_A]);
        assert!(tracker.resolve_reaction(COPY_A, THUMBS_UP).is_some());
        assert!(tracker.resolve_reaction(COPY_A, THUMBS_UP).is_none());
        assert!(tracker.resolve_reaction(COPY_A, THUMBS_DOWN).is_none());
        assert_eq!(
            tracker.get(&COPY_A).unwrap().polarity(),
            Some(Polarity::TruePositive)
        );
    }

    #[test]
    fn other_copy_of_same_original_is_noop() {
        let mut tracker = tracker_with(&[COPY_A, COPY_B]);
        assert!(tracker.resolve_reaction(COPY_B, THUMBS_DOWN).is_some());
        assert!(tracker.resolve_reaction(COPY_A, THUMBS_UP).is_none());
    }

    #[test]
    fn same_original_different_instance_is_independent() {
        let mut tracker = tracker_with(&[COPY_A]);
        tracker.register_forward(
            ORIGINAL,
            COPY_B,
            "other",
            Reason::LlmAccept,
            None,
            ForwardDetails::default(),
        );
        assert!(tracker.resolve_reaction(COPY_A, THUMBS_UP).is_some());
        assert!(tracker.resolve_reaction(COPY_B, THUMBS_UP).is_some());
    }

    #[test]
    fn unknown_message_and_other_emoji_are_ignored() {
        let mut tracker = tracker_with(&[COPY_A]);
        assert!(tracker.resolve_reaction(COPY_B, THUMBS_UP).is_none());
        assert!(tracker.resolve_reaction(COPY_A, "🔥").is_none());
        // The pending record is still resolvable afterwards.
        assert!(tracker.resolve_reaction(COPY_A, THUMBS_DOWN).is_some());
    }

    #[test]
    fn checkpoint_round_trip_keeps_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("forwards.json");

        let mut tracker = FeedbackTracker::load(&path).unwrap();
        assert!(tracker.is_empty());
        tracker.register_forward(
            ORIGINAL,
            COPY_A,
            "alerts",
            Reason::LlmAccept,
            Some("q".into()),
            ForwardDetails {
                text: "t".into(),
                prompt_name: Some("p".into()),
                llm_reason: Some("r".into()),
                trace_id: Some(Uuid::new_v4()),
            },
        );
        tracker.register_forward(
            ORIGINAL,
            COPY_B,
            "alerts",
            Reason::LlmAccept,
            None,
            ForwardDetails::default(),
        );
        tracker.resolve_reaction(COPY_A, THUMBS_UP).unwrap();
        tracker.checkpoint().unwrap();
        assert!(!tracker.is_dirty());

        let mut reloaded = FeedbackTracker::load(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get(&COPY_A), tracker.get(&COPY_A));
        // Exactly-once survives the restart.
        assert!(reloaded.resolve_reaction(COPY_A, THUMBS_DOWN).is_none());
        assert!(reloaded.resolve_reaction(COPY_B, THUMBS_DOWN).is_none());
    }

    #[test]
    fn checkpoint_without_changes_writes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("forwards.json");
        let mut tracker = FeedbackTracker::load(&path).unwrap();
        tracker.checkpoint().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn eviction_drops_old_records() {
        let mut tracker = tracker_with(&[COPY_A]);
        tracker.resolve_reaction(COPY_A, THUMBS_UP).unwrap();

        assert_eq!(
            tracker.evict_older_than(Utc::now() - chrono::Duration::days(1)),
            0
        );
        assert_eq!(
            tracker.evict_older_than(Utc::now() + chrono::Duration::seconds(1)),
            1
        );
        assert!(tracker.is_empty());
        assert!(tracker.judged.is_empty());
        assert!(tracker.resolve_reaction(COPY_A, THUMBS_UP).is_none());
    }
}
