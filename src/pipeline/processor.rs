//! Routing orchestrator.
//!
//! Events are handled one at a time: a message is classified against every
//! instance listening on its chat, forwards are dispatched, and the
//! feedback tracker and stats are updated before the next event is taken.
//! Suspension only happens on transport sends and LLM calls.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tracing::{debug, error, info, warn};

use crate::channels::{EventStream, Transport};
use crate::error::{ChannelError, Result};
use crate::pipeline::classifier::{Classification, Classifier, ResolvedInstance};
use crate::pipeline::feedback::{FeedbackTracker, ForwardDetails};
use crate::pipeline::instance::Instance;
use crate::pipeline::types::{
    FeedbackAction, ForwardAction, InboundEvent, MatchVerdict, MessageEvent, MessageRef, Reason,
    ReactionEvent,
};
use crate::store::stats::{ForwardKind, Outcome, StatsStore, SuppressKind};

/// Resolve every instance's selectors through the transport.
///
/// Fails on the first selector that cannot be resolved; the router must
/// not start with a partially resolved scope.
pub async fn resolve_routes(
    instances: Vec<Instance>,
    transport: &dyn Transport,
) -> std::result::Result<Vec<ResolvedInstance>, ChannelError> {
    let mut routes = Vec::with_capacity(instances.len());

    for instance in instances {
        let mut sources = HashSet::new();
        for selector in &instance.scope {
            sources.extend(transport.resolve(selector).await?);
        }

        let mut targets = Vec::new();
        for selector in &instance.targets {
            for chat in transport.resolve(selector).await? {
                if !targets.contains(&chat) {
                    targets.push(chat);
                }
            }
        }

        let true_positive = match &instance.true_positive {
            Some(selector) => transport.resolve(selector).await?.first().copied(),
            None => None,
        };
        let false_positive = match &instance.false_positive {
            Some(selector) => transport.resolve(selector).await?.first().copied(),
            None => None,
        };

        info!(
            instance = %instance.name,
            sources = sources.len(),
            targets = targets.len(),
            prompts = instance.prompts.len(),
            "Instance ready"
        );
        routes.push(ResolvedInstance::new(
            instance,
            sources,
            targets,
            true_positive,
            false_positive,
        ));
    }

    Ok(routes)
}

/// Owns the per-process routing state and mediates every write to it.
pub struct Router {
    routes: Vec<ResolvedInstance>,
    classifier: Classifier,
    tracker: FeedbackTracker,
    stats: StatsStore,
    transport: Arc<dyn Transport>,
    /// Recent message texts per chat, oldest first, for LLM context.
    history: HashMap<i64, VecDeque<String>>,
    history_depth: usize,
    retention: chrono::Duration,
}

impl Router {
    pub fn new(
        routes: Vec<ResolvedInstance>,
        classifier: Classifier,
        tracker: FeedbackTracker,
        stats: StatsStore,
        transport: Arc<dyn Transport>,
        retention: chrono::Duration,
    ) -> Self {
        let history_depth = routes
            .iter()
            .map(|r| r.instance.llm_context)
            .max()
            .unwrap_or(0);
        Self {
            routes,
            classifier,
            tracker,
            stats,
            transport,
            history: HashMap::new(),
            history_depth,
            retention,
        }
    }

    pub fn routes(&self) -> &[ResolvedInstance] {
        &self.routes
    }

    pub fn stats(&self) -> &StatsStore {
        &self.stats
    }

    pub fn tracker(&self) -> &FeedbackTracker {
        &self.tracker
    }

    /// Consume events until the stream ends or `shutdown` resolves, then
    /// persist everything.
    pub async fn run(&mut self, mut events: EventStream, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                event = events.next() => {
                    let Some(event) = event else {
                        info!("Event stream ended");
                        break;
                    };
                    self.handle(event).await;
                }
                () = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        self.shutdown()
    }

    /// Process one inbound event and persist if due.
    pub async fn handle(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Message(message) => {
                self.on_message(message).await;
            }
            InboundEvent::Reaction(reaction) => {
                self.on_reaction(reaction).await;
            }
        }
        self.persist();
    }

    /// Classify a message against every listening instance and dispatch
    /// the forwards. Instances are independent: one instance's verdict or
    /// dispatch failure never affects another's.
    pub async fn on_message(&mut self, message: MessageEvent) -> Vec<ForwardAction> {
        let chat_id = message.id.chat_id;
        let context: Vec<String> = self
            .history
            .get(&chat_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default();

        let mut actions = Vec::new();

        for route in &self.routes {
            if !route.listens_on(chat_id) {
                continue;
            }
            let name = route.name();

            let depth = route.instance.llm_context.min(context.len());
            let Classification { verdict, tokens } = self
                .classifier
                .classify(&message, route, &context[context.len() - depth..])
                .await;
            self.stats.add_tokens(name, tokens);

            if !verdict.is_forward() {
                debug!(
                    instance = %name,
                    chat_id,
                    message_id = message.id.message_id,
                    reason = verdict.reason.label(),
                    "Suppressed"
                );
                self.stats
                    .record_outcome(name, Outcome::Suppressed(suppress_kind(verdict.reason)));
                continue;
            }

            let dispatched = dispatch(
                self.transport.as_ref(),
                &mut self.tracker,
                &message,
                route,
                &verdict,
            )
            .await;

            let outcome = if dispatched.iter().any(ForwardAction::succeeded) {
                Outcome::Forwarded(match verdict.reason {
                    Reason::LlmAccept => ForwardKind::Prompt,
                    _ => ForwardKind::Keyword,
                })
            } else {
                Outcome::ForwardFailed
            };
            self.stats.record_outcome(name, outcome);
            actions.extend(dispatched);
        }

        self.remember(chat_id, &message.text);
        actions
    }

    /// Resolve a reaction. Only the first 👍/👎 on any copy of an
    /// (original, instance) pair routes a feedback copy and counts.
    pub async fn on_reaction(&mut self, reaction: ReactionEvent) -> Option<FeedbackAction> {
        let outcome = reaction
            .emojis
            .iter()
            .find_map(|emoji| self.tracker.resolve_reaction(reaction.message, emoji))?;

        self.stats
            .record_feedback(&outcome.instance_name, outcome.polarity);

        let destination = self
            .routes
            .iter()
            .find(|r| r.name() == outcome.instance_name)
            .and_then(|r| r.feedback_target(outcome.polarity));

        let Some(destination) = destination else {
            debug!(
                instance = %outcome.instance_name,
                polarity = outcome.polarity.label(),
                "No feedback chat configured"
            );
            return Some(FeedbackAction {
                outcome,
                destination: None,
                delivered: false,
            });
        };

        let delivered = match self
            .transport
            .forward_message(destination, outcome.original)
            .await
        {
            Ok(copy) => {
                info!(
                    instance = %outcome.instance_name,
                    polarity = outcome.polarity.label(),
                    %copy,
                    "Feedback copy sent"
                );
                true
            }
            Err(e) => {
                error!(
                    instance = %outcome.instance_name,
                    destination,
                    error = %e,
                    "Failed to send feedback copy"
                );
                false
            }
        };

        Some(FeedbackAction {
            outcome,
            destination: Some(destination),
            delivered,
        })
    }

    /// Save stats, then forward records. A pending tracker change forces a
    /// stats save, so forwards.json never holds a record whose counters
    /// were not saved first. Old records are evicted only after a
    /// successful stats save.
    pub fn persist(&mut self) {
        let saved = if self.tracker.is_dirty() {
            self.stats.flush().map(|()| true)
        } else {
            self.stats.flush_if_due()
        };

        match saved {
            Ok(true) => {
                if let Err(e) = self.tracker.checkpoint() {
                    warn!(error = %e, "Failed to checkpoint forward records");
                }
                self.evict_expired();
            }
            Ok(false) => {}
            Err(e) => warn!(
                error = %e,
                "Failed to save stats, keeping counters and forward records in memory"
            ),
        }
    }

    /// Persist everything unconditionally.
    pub fn shutdown(&mut self) -> Result<()> {
        self.stats.flush()?;
        self.tracker.checkpoint()?;
        self.evict_expired();
        info!("State saved");
        Ok(())
    }

    fn evict_expired(&mut self) {
        let Some(cutoff) = Utc::now().checked_sub_signed(self.retention) else {
            return;
        };
        if self.tracker.evict_older_than(cutoff) > 0
            && let Err(e) = self.tracker.checkpoint()
        {
            warn!(error = %e, "Failed to checkpoint forward records");
        }
    }

    fn remember(&mut self, chat_id: i64, text: &str) {
        if self.history_depth == 0 || text.trim().is_empty() {
            return;
        }
        let history = self.history.entry(chat_id).or_default();
        history.push_back(text.to_string());
        while history.len() > self.history_depth {
            history.pop_front();
        }
    }
}

/// Send the forward for one verdict to each destination and register the
/// resulting copies.
async fn dispatch(
    transport: &dyn Transport,
    tracker: &mut FeedbackTracker,
    message: &MessageEvent,
    route: &ResolvedInstance,
    verdict: &MatchVerdict,
) -> Vec<ForwardAction> {
    let name = route.name();
    let link = transport.build_message_link(&message.chat, message.id.message_id);
    let annotation = (!route.instance.no_forward_message)
        .then(|| annotation(verdict, &message.chat.display_name(), &link));

    let details = || ForwardDetails {
        text: message.text.clone(),
        prompt_name: verdict.llm.as_ref().map(|l| l.prompt_name.clone()),
        llm_reason: verdict.llm.as_ref().map(|l| l.reason.clone()),
        trace_id: verdict.llm.as_ref().and_then(|l| l.trace_id),
    };

    let mut actions = Vec::with_capacity(verdict.destinations.len());

    for &destination in &verdict.destinations {
        let result = async {
            let note = match &annotation {
                Some(text) => Some(transport.send_message(destination, text).await?),
                None => None,
            };
            match transport.forward_message(destination, message.id).await {
                Ok(copy) => Ok::<_, ChannelError>((note, copy)),
                Err(e) => {
                    if let Some(note) = note {
                        retract_note(transport, name, note).await;
                    }
                    Err(e)
                }
            }
        }
        .await;

        let result = match result {
            Ok((note, copy)) => {
                for forwarded in note.into_iter().chain([copy]) {
                    tracker.register_forward(
                        message.id,
                        forwarded,
                        name,
                        verdict.reason,
                        verdict.quote.clone(),
                        details(),
                    );
                }
                info!(
                    instance = %name,
                    original = %message.id,
                    %copy,
                    reason = verdict.reason.label(),
                    "Forwarded"
                );
                Ok(copy)
            }
            Err(e) => {
                error!(
                    instance = %name,
                    original = %message.id,
                    destination,
                    error = %e,
                    "Failed to forward"
                );
                Err(e.to_string())
            }
        };

        actions.push(ForwardAction {
            instance_name: name.to_string(),
            original: message.id,
            destination,
            reason: verdict.reason,
            result,
        });
    }

    actions
}

/// Remove an annotation whose native forward failed, so the target chat
/// never shows a note without the message it describes.
async fn retract_note(transport: &dyn Transport, instance: &str, note: MessageRef) {
    match transport.delete_message(note).await {
        Ok(()) => debug!(instance = %instance, %note, "Retracted annotation"),
        Err(e) => warn!(
            instance = %instance,
            %note,
            error = %e,
            "Failed to retract annotation, it is orphaned in the target chat"
        ),
    }
}

/// Text sent ahead of the native forward.
///
/// ```text
/// word: urgent
/// Forwarded from: Jobs - https://t.me/jobs/42
/// ```
fn annotation(verdict: &MatchVerdict, chat_name: &str, link: &str) -> String {
    let mut text = String::new();

    if let Some(word) = &verdict.keyword {
        text.push_str(&format!("word: {word}\n"));
    } else if let Some(llm) = &verdict.llm {
        text.push_str(&llm.prompt_name);
        if let Some(score) = llm.score {
            text.push_str(&format!(": {score}/5"));
        }
        if !llm.quote.is_empty() {
            text.push_str(&format!(" - \"{}\"", llm.quote));
        }
        text.push('\n');
        if !llm.reason.is_empty() {
            text.push_str(&llm.reason);
            text.push('\n');
        }
    }

    text.push_str(&format!("Forwarded from: {chat_name}"));
    if !link.is_empty() {
        text.push_str(&format!(" - {link}"));
    }
    text
}

fn suppress_kind(reason: Reason) -> SuppressKind {
    match reason {
        Reason::Ignored => SuppressKind::Ignored,
        Reason::Negative => SuppressKind::Negative,
        Reason::LlmReject => SuppressKind::LlmReject,
        Reason::FolderMute => SuppressKind::Muted,
        Reason::NoMatch | Reason::KeywordMatch | Reason::LlmAccept => SuppressKind::NoMatch,
    }
}
