//! Message classifier: one (message, instance) pair in, one verdict out.
//!
//! Order, first applicable rule wins:
//! 1. global sender filter → suppress/ignored
//! 2. `ignore_words` → suppress/ignored
//! 3. `negative_words` → suppress/negative
//! 4. `words` → forward/keyword_match, but only for instances without
//!    prompts
//! 5. prompts (keyword hit or not) → forward/llm_accept or
//!    suppress/llm_reject; any LLM failure counts as a reject
//! 6. `folder_mute` drops destinations inside the instance's own scope

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::llm::evaluator::{Evaluation, MatchEvaluator};
use crate::llm::tracer::{LlmCallRecord, Tracer};
use crate::pipeline::instance::{Instance, PromptSpec};
use crate::pipeline::rules::{InstanceRules, RuleOutcome, SenderFilter};
use crate::pipeline::types::{LlmJudgement, MatchVerdict, MessageEvent, Polarity, Reason};

/// An instance with its selectors resolved to chat IDs and rules compiled.
#[derive(Debug, Clone)]
pub struct ResolvedInstance {
    pub instance: Instance,
    pub rules: InstanceRules,
    /// Chats the instance listens on.
    pub sources: HashSet<i64>,
    /// Forward destinations, in config order.
    pub targets: Vec<i64>,
    pub true_positive: Option<i64>,
    pub false_positive: Option<i64>,
}

impl ResolvedInstance {
    pub fn new(
        instance: Instance,
        sources: HashSet<i64>,
        targets: Vec<i64>,
        true_positive: Option<i64>,
        false_positive: Option<i64>,
    ) -> Self {
        let rules = InstanceRules::compile(&instance);
        Self {
            instance,
            rules,
            sources,
            targets,
            true_positive,
            false_positive,
        }
    }

    pub fn name(&self) -> &str {
        &self.instance.name
    }

    pub fn listens_on(&self, chat_id: i64) -> bool {
        self.sources.contains(&chat_id)
    }

    /// Feedback destination for a polarity.
    pub fn feedback_target(&self, polarity: Polarity) -> Option<i64> {
        match polarity {
            Polarity::TruePositive => self.true_positive,
            Polarity::FalsePositive => self.false_positive,
        }
    }
}

/// Result of the deterministic stage.
#[derive(Debug, Clone, PartialEq)]
pub enum RulesVerdict {
    Final(MatchVerdict),
    /// The instance has an LLM gate and the word rules did not suppress.
    NeedsLlm,
}

/// Verdict plus LLM tokens spent reaching it.
#[derive(Debug, Clone)]
pub struct Classification {
    pub verdict: MatchVerdict,
    pub tokens: u64,
}

pub struct Classifier {
    sender_filter: SenderFilter,
    evaluator: Option<Arc<dyn MatchEvaluator>>,
    tracer: Arc<dyn Tracer>,
    llm_timeout: Duration,
}

impl Classifier {
    pub fn new(
        sender_filter: SenderFilter,
        evaluator: Option<Arc<dyn MatchEvaluator>>,
        tracer: Arc<dyn Tracer>,
        llm_timeout: Duration,
    ) -> Self {
        Self {
            sender_filter,
            evaluator,
            tracer,
            llm_timeout,
        }
    }

    /// Deterministic stage: sender filter and word rules. No I/O.
    pub fn classify_rules(&self, message: &MessageEvent, route: &ResolvedInstance) -> RulesVerdict {
        let name = route.name();

        if self
            .sender_filter
            .is_ignored(message.sender.username.as_deref(), message.sender.user_id)
        {
            debug!(instance = %name, message = %message.id, "Sender is ignored");
            return RulesVerdict::Final(MatchVerdict::suppress(name, Reason::Ignored));
        }

        match route.rules.evaluate(name, &message.text) {
            RuleOutcome::Ignored { .. } => {
                RulesVerdict::Final(MatchVerdict::suppress(name, Reason::Ignored))
            }
            RuleOutcome::Negative { .. } => {
                RulesVerdict::Final(MatchVerdict::suppress(name, Reason::Negative))
            }
            RuleOutcome::Keyword { word } if route.instance.has_llm_gate() => {
                debug!(instance = %name, word = %word, "Keyword hit, deferring to LLM gate");
                RulesVerdict::NeedsLlm
            }
            RuleOutcome::Keyword { word } => RulesVerdict::Final(apply_folder_mute(
                MatchVerdict::keyword(name, &word, route.targets.clone()),
                route,
            )),
            RuleOutcome::NoHit
                if route.instance.has_llm_gate() && !message.text.trim().is_empty() =>
            {
                RulesVerdict::NeedsLlm
            }
            RuleOutcome::NoHit => {
                RulesVerdict::Final(MatchVerdict::suppress(name, Reason::NoMatch))
            }
        }
    }

    /// Full classification. `context` holds preceding messages of the same
    /// chat, oldest first.
    pub async fn classify(
        &self,
        message: &MessageEvent,
        route: &ResolvedInstance,
        context: &[String],
    ) -> Classification {
        match self.classify_rules(message, route) {
            RulesVerdict::Final(verdict) => Classification { verdict, tokens: 0 },
            RulesVerdict::NeedsLlm => self.classify_llm(message, route, context).await,
        }
    }

    async fn classify_llm(
        &self,
        message: &MessageEvent,
        route: &ResolvedInstance,
        context: &[String],
    ) -> Classification {
        let name = route.name();
        let mut tokens = 0;

        let Some(evaluator) = &self.evaluator else {
            warn!(instance = %name, "Instance has prompts but no LLM is configured, suppressing");
            return Classification {
                verdict: MatchVerdict::suppress(name, Reason::LlmReject),
                tokens,
            };
        };

        for prompt in &route.instance.prompts {
            let started_at = Utc::now();
            let result =
                tokio::time::timeout(self.llm_timeout, evaluator.evaluate(prompt, &message.text, context))
                    .await;

            let evaluation = match result {
                Ok(Ok(evaluation)) => evaluation,
                Ok(Err(e)) => {
                    warn!(
                        instance = %name,
                        prompt = %prompt.name,
                        message = %message.id,
                        error = %e,
                        "LLM evaluation failed, treating as reject"
                    );
                    continue;
                }
                Err(_) => {
                    warn!(
                        instance = %name,
                        prompt = %prompt.name,
                        message = %message.id,
                        timeout = ?self.llm_timeout,
                        "LLM evaluation timed out, treating as reject"
                    );
                    continue;
                }
            };
            tokens += evaluation.tokens;

            let trace_id = self.trace(route, message, prompt, &evaluation, started_at);

            if evaluation.is_match {
                let judgement = LlmJudgement {
                    prompt_name: prompt.name.clone(),
                    reason: evaluation.reason,
                    quote: evaluation.quote,
                    score: evaluation.score,
                    trace_id,
                };
                let verdict = apply_folder_mute(
                    MatchVerdict::llm_accept(name, judgement, route.targets.clone()),
                    route,
                );
                return Classification { verdict, tokens };
            }

            debug!(
                instance = %name,
                prompt = %prompt.name,
                score = ?evaluation.score,
                "Prompt rejected message"
            );
        }

        Classification {
            verdict: MatchVerdict::suppress(name, Reason::LlmReject),
            tokens,
        }
    }

    fn trace(
        &self,
        route: &ResolvedInstance,
        message: &MessageEvent,
        prompt: &PromptSpec,
        evaluation: &Evaluation,
        started_at: chrono::DateTime<Utc>,
    ) -> Option<Uuid> {
        if !self.tracer.is_enabled() {
            return None;
        }
        let trace_id = Uuid::new_v4();
        self.tracer.tag_and_record(
            route.name(),
            &message.chat.display_name(),
            LlmCallRecord {
                trace_id,
                prompt_name: prompt.name.clone(),
                model: evaluation.model.clone(),
                input: message.text.clone(),
                output: serde_json::json!({
                    "is_match": evaluation.is_match,
                    "reason": evaluation.reason,
                    "quote": evaluation.quote,
                    "score": evaluation.score,
                }),
                tokens: evaluation.tokens,
                started_at,
                finished_at: Utc::now(),
            },
        );
        Some(trace_id)
    }
}

/// Drop destinations inside the instance's own scope when `folder_mute` is
/// set. A forward left with no destination becomes suppress/folder_mute.
pub fn apply_folder_mute(mut verdict: MatchVerdict, route: &ResolvedInstance) -> MatchVerdict {
    if !verdict.is_forward() || !route.instance.folder_mute {
        return verdict;
    }

    verdict.destinations.retain(|dest| !route.sources.contains(dest));
    if verdict.destinations.is_empty() {
        debug!(instance = %route.name(), "All destinations muted");
        return MatchVerdict::suppress(route.name(), Reason::FolderMute);
    }
    verdict
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ClassificationError, LlmError};
    use crate::llm::tracer::NoopTracer;
    use crate::pipeline::instance::ScopeSelector;
    use crate::pipeline::types::{ChatInfo, Decision, MessageRef, Sender};
    use async_trait::async_trait;
    use std::sync::Mutex;

    const SOURCE: i64 = -1001;
    const TARGET: i64 = -2002;

    fn instance(words: &[&str]) -> Instance {
        Instance {
            name: "alerts".into(),
            scope: vec![ScopeSelector::ChatId(SOURCE)],
            words: words.iter().map(|w| w.to_string()).collect(),
            negative_words: vec![],
            ignore_words: vec![],
            targets: vec![ScopeSelector::ChatId(TARGET)],
            true_positive: None,
            false_positive: None,
            folder_mute: false,
            no_forward_message: false,
            llm_context: 0,
            prompts: vec![],
        }
    }

    fn prompt(name: &str) -> PromptSpec {
        PromptSpec {
            name: name.into(),
            text: "match?".into(),
            threshold: 4,
            model: None,
            temperature: None,
        }
    }

    fn route(instance: Instance) -> ResolvedInstance {
        ResolvedInstance::new(instance, HashSet::from([SOURCE]), vec![TARGET], None, None)
    }

    fn message(text: &str) -> MessageEvent {
        MessageEvent {
            id: MessageRef::new(SOURCE, 1),
            chat: ChatInfo {
                id: SOURCE,
                title: Some("Source".into()),
                username: None,
            },
            sender: Sender {
                user_id: Some(7),
                username: Some("alice".into()),
            },
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    fn classifier(evaluator: Option<Arc<dyn MatchEvaluator>>) -> Classifier {
        Classifier::new(
            SenderFilter::new(&["spammer".into()], &[666]),
            evaluator,
            Arc::new(NoopTracer),
            Duration::from_millis(200),
        )
    }

    /// Evaluator replaying scripted replies in order.
    struct ScriptedEvaluator {
        replies: Mutex<Vec<Result<Evaluation, ClassificationError>>>,
        calls: Mutex<Vec<String>>,
        delay: Option<Duration>,
    }

    impl ScriptedEvaluator {
        fn new(replies: Vec<Result<Evaluation, ClassificationError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
                calls: Mutex::new(Vec::new()),
                delay: None,
            })
        }
    }

    #[async_trait]
    impl MatchEvaluator for ScriptedEvaluator {
        async fn evaluate(
            &self,
            prompt: &PromptSpec,
            _text: &str,
            _context: &[String],
        ) -> Result<Evaluation, ClassificationError> {
            self.calls.lock().unwrap().push(prompt.name.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.replies.lock().unwrap().remove(0)
        }
    }

    fn eval(is_match: bool, quote: &str) -> Result<Evaluation, ClassificationError> {
        Ok(Evaluation {
            is_match,
            reason: "because".into(),
            quote: quote.into(),
            score: Some(if is_match { 5 } else { 1 }),
            tokens: 10,
            model: "m".into(),
        })
    }

    // ── Deterministic rules ─────────────────────────────────────────

    #[tokio::test]
    async fn keyword_match_forwards() {
        let c = classifier(None);
        let out = c.classify(&message("This is urgent!"), &route(instance(&["urgent"])), &[]).await;
        assert_eq!(out.verdict.decision, Decision::Forward);
        assert_eq!(out.verdict.reason, Reason::KeywordMatch);
        assert_eq!(out.verdict.keyword.as_deref(), Some("urgent"));
        assert_eq!(out.verdict.destinations, vec![TARGET]);
        assert_eq!(out.tokens, 0);
    }

    #[tokio::test]
    async fn ignored_sender_id_suppresses() {
        let c = classifier(None);
        let mut msg = message("urgent topic");
        msg.sender.user_id = Some(666);
        let out = c.classify(&msg, &route(instance(&["urgent"])), &[]).await;
        assert_eq!(out.verdict.decision, Decision::Suppress);
        assert_eq!(out.verdict.reason, Reason::Ignored);
    }

    #[tokio::test]
    async fn ignored_username_suppresses() {
        let c = classifier(None);
        let mut msg = message("urgent topic");
        msg.sender.username = Some("Spammer".into());
        let out = c.classify(&msg, &route(instance(&["urgent"])), &[]).await;
        assert_eq!(out.verdict.reason, Reason::Ignored);
    }

    #[tokio::test]
    async fn negative_word_suppresses() {
        let c = classifier(None);
        let mut inst = instance(&["sale"]);
        inst.negative_words = vec!["unsubscribe".into()];
        let out = c.classify(&message("unsubscribe from sale emails"), &route(inst), &[]).await;
        assert_eq!(out.verdict.decision, Decision::Suppress);
        assert_eq!(out.verdict.reason, Reason::Negative);
    }

    #[tokio::test]
    async fn ignore_words_win_over_everything() {
        let c = classifier(None);
        let mut inst = instance(&["sale"]);
        inst.negative_words = vec!["sale".into()];
        inst.ignore_words = vec!["sale".into()];
        let out = c.classify(&message("sale"), &route(inst), &[]).await;
        assert_eq!(out.verdict.reason, Reason::Ignored);
    }

    #[tokio::test]
    async fn no_keyword_without_gate_is_no_match() {
        let c = classifier(None);
        let out = c.classify(&message("hello"), &route(instance(&["urgent"])), &[]).await;
        assert_eq!(out.verdict.decision, Decision::Suppress);
        assert_eq!(out.verdict.reason, Reason::NoMatch);
    }

    #[tokio::test]
    async fn empty_text_never_reaches_llm() {
        let scripted = ScriptedEvaluator::new(vec![eval(true, "x")]);
        let c = classifier(Some(scripted.clone() as Arc<dyn MatchEvaluator>));
        let mut inst = instance(&[]);
        inst.prompts = vec![prompt("p")];
        let out = c.classify(&message("   "), &route(inst), &[]).await;
        assert_eq!(out.verdict.reason, Reason::NoMatch);
        assert!(scripted.calls.lock().unwrap().is_empty());
    }

    // ── LLM gate ────────────────────────────────────────────────────

    #[tokio::test]
    async fn keyword_hit_on_gated_instance_is_decided_by_llm() {
        let scripted = ScriptedEvaluator::new(vec![eval(false, "")]);
        let c = classifier(Some(scripted.clone() as Arc<dyn MatchEvaluator>));
        let mut inst = instance(&["rust"]);
        inst.prompts = vec![prompt("p")];
        let out = c.classify(&message("rust job"), &route(inst), &[]).await;
        assert_eq!(out.verdict.decision, Decision::Suppress);
        assert_eq!(out.verdict.reason, Reason::LlmReject);
        assert_eq!(*scripted.calls.lock().unwrap(), vec!["p"]);
    }

    #[tokio::test]
    async fn keyword_hit_on_gated_instance_forwards_on_accept() {
        let scripted = ScriptedEvaluator::new(vec![eval(true, "rust job")]);
        let c = classifier(Some(scripted as Arc<dyn MatchEvaluator>));
        let mut inst = instance(&["rust"]);
        inst.prompts = vec![prompt("p")];
        let out = c.classify(&message("rust job"), &route(inst), &[]).await;
        assert_eq!(out.verdict.reason, Reason::LlmAccept);
        assert_eq!(out.verdict.destinations, vec![TARGET]);
    }

    #[tokio::test]
    async fn keyword_hit_on_gated_instance_without_llm_suppresses() {
        let c = classifier(None);
        let mut inst = instance(&["rust"]);
        inst.prompts = vec![prompt("p")];
        let out = c.classify(&message("rust job"), &route(inst), &[]).await;
        assert_eq!(out.verdict.reason, Reason::LlmReject);
    }

    #[tokio::test]
    async fn first_accepting_prompt_wins() {
        let scripted = ScriptedEvaluator::new(vec![eval(false, ""), eval(true, "need a dev")]);
        let c = classifier(Some(scripted.clone() as Arc<dyn MatchEvaluator>));
        let mut inst = instance(&[]);
        inst.prompts = vec![prompt("first"), prompt("second"), prompt("third")];

        let out = c.classify(&message("we need a dev"), &route(inst), &[]).await;

        assert_eq!(out.verdict.reason, Reason::LlmAccept);
        assert_eq!(out.verdict.quote.as_deref(), Some("need a dev"));
        let llm = out.verdict.llm.unwrap();
        assert_eq!(llm.prompt_name, "second");
        assert_eq!(llm.score, Some(5));
        assert!(llm.trace_id.is_none());
        assert_eq!(out.tokens, 20);
        assert_eq!(*scripted.calls.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn all_prompts_rejecting_is_llm_reject() {
        let scripted = ScriptedEvaluator::new(vec![eval(false, ""), eval(false, "")]);
        let c = classifier(Some(scripted as Arc<dyn MatchEvaluator>));
        let mut inst = instance(&[]);
        inst.prompts = vec![prompt("a"), prompt("b")];
        let out = c.classify(&message("hello"), &route(inst), &[]).await;
        assert_eq!(out.verdict.reason, Reason::LlmReject);
        assert_eq!(out.tokens, 20);
    }

    #[tokio::test]
    async fn llm_error_suppresses() {
        let scripted = ScriptedEvaluator::new(vec![Err(LlmError::InvalidResponse {
            provider: "test".into(),
            reason: "garbage".into(),
        })]);
        let c = classifier(Some(scripted as Arc<dyn MatchEvaluator>));
        let mut inst = instance(&[]);
        inst.prompts = vec![prompt("a")];
        let out = c.classify(&message("hello"), &route(inst), &[]).await;
        assert_eq!(out.verdict.decision, Decision::Suppress);
        assert_eq!(out.verdict.reason, Reason::LlmReject);
        assert_eq!(out.tokens, 0);
    }

    #[tokio::test]
    async fn llm_timeout_suppresses() {
        let scripted = Arc::new(ScriptedEvaluator {
            replies: Mutex::new(vec![eval(true, "x")]),
            calls: Mutex::new(Vec::new()),
            delay: Some(Duration::from_secs(5)),
        });
        let c = classifier(Some(scripted as Arc<dyn MatchEvaluator>));
        let mut inst = instance(&[]);
        inst.prompts = vec![prompt("slow")];
        let out = c.classify(&message("hello"), &route(inst), &[]).await;
        assert_eq!(out.verdict.reason, Reason::LlmReject);
    }

    #[tokio::test]
    async fn missing_llm_suppresses() {
        let c = classifier(None);
        let mut inst = instance(&[]);
        inst.prompts = vec![prompt("a")];
        let out = c.classify(&message("hello"), &route(inst), &[]).await;
        assert_eq!(out.verdict.reason, Reason::LlmReject);
    }

    // ── folder_mute ─────────────────────────────────────────────────

    #[test]
    fn folder_mute_drops_destinations_in_scope() {
        let mut inst = instance(&["urgent"]);
        inst.folder_mute = true;
        let route = ResolvedInstance::new(
            inst,
            HashSet::from([SOURCE, TARGET]),
            vec![TARGET, -3003],
            None,
            None,
        );
        let c = classifier(None);
        let RulesVerdict::Final(verdict) = c.classify_rules(&message("urgent"), &route) else {
            panic!("expected final verdict");
        };
        assert!(verdict.is_forward());
        assert_eq!(verdict.destinations, vec![-3003]);
    }

    #[test]
    fn folder_mute_with_no_destination_left_suppresses() {
        let mut inst = instance(&["urgent"]);
        inst.folder_mute = true;
        let route = ResolvedInstance::new(
            inst,
            HashSet::from([SOURCE, TARGET]),
            vec![TARGET],
            None,
            None,
        );
        let c = classifier(None);
        assert_eq!(
            c.classify_rules(&message("urgent"), &route),
            RulesVerdict::Final(MatchVerdict::suppress("alerts", Reason::FolderMute))
        );
    }

    #[test]
    fn without_folder_mute_destinations_are_kept() {
        let route = ResolvedInstance::new(
            instance(&["urgent"]),
            HashSet::from([SOURCE, TARGET]),
            vec![TARGET],
            None,
            None,
        );
        let c = classifier(None);
        let RulesVerdict::Final(verdict) = c.classify_rules(&message("urgent"), &route) else {
            panic!("expected final verdict");
        };
        assert_eq!(verdict.destinations, vec![TARGET]);
    }
}
