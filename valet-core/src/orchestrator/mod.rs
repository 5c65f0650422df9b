//! Four-Valet Orchestrator (C7): the staged `start -> V1 -> V2? -> V3 ->
//! V4? -> terminal` state machine driving confidence-gated LLM analysis of
//! a single [`PerceivedEvent`] (spec.md §4.7).
//!
//! Structurally modeled on the teacher's `Orchestrator` trait + config +
//! builder idiom (`examples/rand-loop/rlm-core/src/orchestrator.rs`):
//! a config struct, a runtime that wraps a router, and a `run`-style entry
//! point — generalized here to a fixed four-stage pipeline instead of an
//! open-ended recursive loop, since this system's stages are a closed,
//! numbered contract rather than user-driven recursion.

mod extraction;
mod hypothesis;
mod stages;
mod working_memory;

pub use extraction::{
    merge_extractions, Extraction, ExtractionType, Importance, MemoryFormat, MemoryHint,
    SideEffects, ValidationState, WriteMode,
};
pub use hypothesis::{ConfidenceComponents, EarlyStop, Hypothesis, RecommendedAction};
pub use stages::{stage_terminates, ContextNoteRef, HasConfidence, Stage, StageInputs, StageOutputs};
pub use working_memory::{StageTrace, WorkingMemory};

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

use crate::bus::{EventBus, EventEnvelope, EventKind};
use crate::calibration::Calibrator;
use crate::config::{Config, ModelsConfig, StageLimitsConfig, StoppingConfig};
use crate::error::{Error, Result};
use crate::event::{ParticipantRole, PerceivedEvent};
use crate::knowledge::KnowledgeStore;
use crate::llm::{
    ChatMessage, CircuitBreaker, CompletionRequest, LLMClient, ModelTier, RoutingContext,
    SmartRouter, TokenBucketLimiter,
};
use crate::retrieval::{ContextItem, ContextRetriever};
use crate::search::{CrossSourceSearch, SearchHit, SearchRequest};
use crate::signature::Signature;
use crate::striped_lock::StripedLock;

use stages::{V1Signature, V2Signature, V3Signature, V4Signature};

/// Number of hash stripes used to serialize same-thread analysis runs.
/// 64 matches the Knowledge Store's default, not a correctness requirement.
const THREAD_LOCK_STRIPES: usize = 64;

/// Outcome of driving one stage's model call through to a parsed
/// `StageOutputs`, mirroring the teacher's tagged-result idiom
/// (`examples/rand-loop/rlm-core/src/signature/submit.rs::SubmitResult`):
/// a stage either produces a usable hypothesis or the chain must stop.
#[derive(Debug, Clone)]
pub enum StageOutcome {
    /// The stage's own stop condition says analysis is done.
    Terminal(Hypothesis),
    /// The stage produced a hypothesis but another stage must still run.
    Continue(Hypothesis),
    /// The stage failed after retry and the run cannot proceed.
    Failed(Error),
}

/// Wires the router, breaker, and rate limiter together so stage calls
/// don't each have to juggle three collaborators (spec.md §4.6).
pub struct ModelGateway {
    client: Arc<dyn LLMClient>,
    router: SmartRouter,
    breaker: CircuitBreaker,
    limiter: TokenBucketLimiter,
}

impl ModelGateway {
    pub fn new(client: Arc<dyn LLMClient>, router: SmartRouter) -> Self {
        Self {
            client,
            router,
            breaker: CircuitBreaker::default(),
            limiter: TokenBucketLimiter::default(),
        }
    }

    /// Call at `tier`, escalating once to the next-higher tier when the
    /// result is unusable or under-confident (spec.md §4.6 "re-run at the
    /// next-higher tier once... return the higher-confidence of the two").
    ///
    /// - A `BreakerOpen`/provider error at `tier` tries the next tier once;
    ///   if that also fails, the original error is returned (spec.md §7,
    ///   §8 scenario 5).
    /// - A successful-but-under-`threshold` result tries the next tier once
    ///   and keeps whichever response has the higher `confidence.overall()`.
    /// - At the top tier (`Strong`), there is nowhere to escalate to and the
    ///   first outcome is returned as-is.
    async fn call<S: Signature>(
        &self,
        tier: ModelTier,
        inputs: &S::Inputs,
        threshold: f64,
    ) -> Result<(S::Outputs, String, u64)>
    where
        S::Outputs: HasConfidence,
    {
        let first = self.call_at_tier::<S>(tier, inputs).await;

        let Some(next_tier) = Self::escalate(tier) else {
            return first;
        };

        match first {
            Ok((outputs, model, tokens)) => {
                if outputs.confidence_overall() >= threshold {
                    return Ok((outputs, model, tokens));
                }
                match self.call_at_tier::<S>(next_tier, inputs).await {
                    Ok((escalated, escalated_model, escalated_tokens))
                        if escalated.confidence_overall() >= outputs.confidence_overall() =>
                    {
                        Ok((escalated, escalated_model, escalated_tokens))
                    }
                    _ => Ok((outputs, model, tokens)),
                }
            }
            Err(_) => self.call_at_tier::<S>(next_tier, inputs).await,
        }
    }

    /// Render `inputs` via `S::to_prompt`, route to `tier`, call through the
    /// breaker and rate limiter, and parse the response via `S::from_response`.
    /// On a parse failure the caller gets one retry with a stricter prompt
    /// (spec.md §7 `ParseError` recovery); a second failure is fatal.
    async fn call_at_tier<S: Signature>(
        &self,
        tier: ModelTier,
        inputs: &S::Inputs,
    ) -> Result<(S::Outputs, String, u64)> {
        if !self.breaker.allow(tier).await {
            return Err(Error::BreakerOpen {
                tier: format!("{tier:?}").to_lowercase(),
            });
        }
        self.limiter.acquire(tier).await;

        let context = RoutingContext::new();
        let decision = self.router.route_for_tier(tier, &context);
        let prompt = S::to_prompt(inputs);

        let response = match self.complete(&decision.model.id, &prompt).await {
            Ok(response) => response,
            Err(error) => {
                self.breaker.record_failure(tier).await;
                return Err(error);
            }
        };
        self.breaker.record_success(tier).await;

        match S::from_response(&response.content) {
            Ok(outputs) => Ok((outputs, response.model, response.usage.total())),
            Err(first_error) => {
                let strict_prompt = format!(
                    "{prompt}\n\nYour previous response could not be parsed ({first_error}). \
                     Respond with ONLY the JSON object described above, no prose."
                );
                let retry = self.complete(&decision.model.id, &strict_prompt).await?;
                let outputs = S::from_response(&retry.content).map_err(|reason| Error::ParseError {
                    stage: std::any::type_name::<S>().to_string(),
                    reason: reason.to_string(),
                })?;
                Ok((outputs, retry.model, retry.usage.total()))
            }
        }
    }

    async fn complete(
        &self,
        model: &str,
        prompt: &str,
    ) -> Result<crate::llm::CompletionResponse> {
        let request = CompletionRequest::new()
            .with_model(model)
            .with_message(ChatMessage::user(prompt));
        self.client.complete(request).await
    }

    /// Re-route `tier` one level up for adaptive escalation (spec.md §4.6).
    pub fn escalate(tier: ModelTier) -> Option<ModelTier> {
        SmartRouter::escalate(tier)
    }
}

/// Runs the staged analysis pipeline for one event at a time, serializing
/// concurrent runs that share a `thread_id` (spec.md §5).
pub struct Orchestrator<'a> {
    gateway: ModelGateway,
    retriever: ContextRetriever<'a>,
    cross_source: Option<CrossSourceSearch>,
    calibrator: Option<Calibrator>,
    bus: EventBus,
    thread_locks: StripedLock,
    stopping: StoppingConfig,
    stage_limits: StageLimitsConfig,
    models: ModelsConfig,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        client: Arc<dyn LLMClient>,
        router: SmartRouter,
        store: &'a KnowledgeStore,
        config: &Config,
        bus: EventBus,
    ) -> Self {
        Self {
            gateway: ModelGateway::new(client, router),
            retriever: ContextRetriever::new(store, config.context.clone()),
            cross_source: None,
            calibrator: None,
            bus,
            thread_locks: StripedLock::new(THREAD_LOCK_STRIPES),
            stopping: config.stopping.clone(),
            stage_limits: config.stages.clone(),
            models: config.models.clone(),
        }
    }

    /// Enable cross-source search (C5): V2+ context assembly fans a query
    /// out across `search`'s adapters alongside the Knowledge Store lookup
    /// (spec.md §4.7 stage table, "context via C4/C5").
    pub fn with_cross_source(mut self, search: CrossSourceSearch) -> Self {
        self.cross_source = Some(search);
        self
    }

    /// Enable feedback-driven calibration (C11): V3's stop threshold is
    /// adjusted per source/action from recorded agreement rates, and V1's
    /// prompt receives promoted sender->action priors (spec.md §4.11).
    pub fn with_calibrator(mut self, calibrator: Calibrator) -> Self {
        self.calibrator = Some(calibrator);
        self
    }

    /// Analyze `event`, running stages until one of them terminates,
    /// serialized against any other run sharing the same thread.
    pub async fn analyze(&self, event: PerceivedEvent) -> Result<WorkingMemory> {
        let lock_key = event
            .thread_id
            .clone()
            .unwrap_or_else(|| event.event_id.clone());
        let _guard = self.thread_locks.lock(&lock_key).await;

        self.bus.publish(EventEnvelope::new(
            event.event_id.clone(),
            EventKind::AnalysisStarted {
                event_id: event.event_id.clone(),
            },
            Utc::now(),
        ));

        let entities: Vec<String> = event.entities.iter().map(|e| e.value.clone()).collect();
        let context_items = self
            .retriever
            .retrieve(&entities, None, event.thread_id.as_deref());
        let search_hits = self.search_hits_for(&event).await;
        let sender_priors = self.sender_priors_for(&event);

        let mut memory = WorkingMemory::new(event, context_items);
        memory.set_search_hits(search_hits);
        let mut stage = Stage::V1;
        let mut stopping = self.stopping.clone();

        loop {
            if stage == Stage::V3 {
                stopping.v3_terminate_overall = self.v3_threshold_for(&memory);
            }
            let outcome = self.run_stage(stage, &memory, &stopping, &sender_priors).await;
            match outcome {
                StageOutcome::Terminal(hypothesis) => {
                    memory.record(hypothesis);
                    break;
                }
                StageOutcome::Continue(hypothesis) => {
                    memory.record(hypothesis);
                    stage = match stage.next() {
                        Some(next) => next,
                        None => break,
                    };
                }
                StageOutcome::Failed(error) => {
                    self.bus.publish(EventEnvelope::new(
                        memory.event.event_id.clone(),
                        EventKind::AnalysisFailed {
                            event_id: memory.event.event_id.clone(),
                            reason: error.to_string(),
                        },
                        Utc::now(),
                    ));
                    return Err(error);
                }
            }
        }

        self.bus.publish(EventEnvelope::new(
            memory.event.event_id.clone(),
            EventKind::AnalysisCompleted {
                event_id: memory.event.event_id.clone(),
                final_stage: memory
                    .trace
                    .last()
                    .map(|t| t.stage.to_string())
                    .unwrap_or_default(),
                overall_confidence: memory.overall_confidence,
            },
            Utc::now(),
        ));
        Ok(memory)
    }

    /// One cross-source fan-out per analysis run, keyed off the event's
    /// subject (falling back to a truncated body). Returns an empty list
    /// when cross-source search isn't configured.
    async fn search_hits_for(&self, event: &PerceivedEvent) -> Vec<SearchHit> {
        let Some(cross_source) = &self.cross_source else {
            return Vec::new();
        };
        let query = event
            .subject
            .clone()
            .unwrap_or_else(|| truncate(&event.body_plain, 120));
        let request = SearchRequest {
            query,
            ..Default::default()
        };
        cross_source.search(request).await.hits
    }

    /// Promoted sender->action priors for V1's prompt context, keyed off
    /// the event's `From` participant. Empty when calibration isn't
    /// configured or the sender has no promoted pattern.
    fn sender_priors_for(&self, event: &PerceivedEvent) -> Vec<String> {
        let Some(calibrator) = &self.calibrator else {
            return Vec::new();
        };
        let Some(sender) = event
            .participants
            .iter()
            .find(|p| p.role == ParticipantRole::From)
            .map(|p| p.identity.as_str())
        else {
            return Vec::new();
        };
        calibrator.sender_priors(sender).unwrap_or_default()
    }

    /// The V3-stop threshold for this run, adjusted by `Calibrator` from
    /// the source's recorded agreement rate at the preceding stage's
    /// recommended action (spec.md §4.11). Falls back to the configured
    /// baseline until a hypothesis with an action exists, or when
    /// calibration isn't configured.
    fn v3_threshold_for(&self, memory: &WorkingMemory) -> f64 {
        let baseline = self.stopping.v3_terminate_overall;
        let Some(calibrator) = &self.calibrator else {
            return baseline;
        };
        let Some(action) = memory.latest().map(|h| h.action) else {
            return baseline;
        };
        let source = memory.event.source.to_string();
        calibrator
            .stopping_threshold_for(&source, &action_class(action), baseline)
            .unwrap_or(baseline)
    }

    fn build_inputs(
        &self,
        stage: Stage,
        memory: &WorkingMemory,
        sender_priors: &[String],
    ) -> StageInputs {
        let event = &memory.event;
        let body = truncate(&event.body_plain, self.stage_limits_for(stage));
        let context_notes = if stage.has_context() {
            memory
                .context_items
                .iter()
                .map(context_note_ref)
                .chain(memory.search_hits.iter().map(search_hit_ref))
                .take(self.stage_limits.v2_max_context_notes)
                .collect()
        } else {
            Vec::new()
        };
        let prior_critique = memory
            .latest()
            .and_then(|h| h.critique.clone())
            .filter(|_| stage == Stage::V3);
        let questions_to_answer = if stage == Stage::V4 {
            memory.open_questions.clone()
        } else {
            Vec::new()
        };
        let sender_priors = if stage == Stage::V1 {
            sender_priors.to_vec()
        } else {
            Vec::new()
        };

        StageInputs {
            event_subject: event.subject.clone(),
            event_body: body,
            event_source: event.source.to_string(),
            age_bucket: format!("{:?}", event.age_bucket).to_lowercase(),
            participants: event.participants.iter().map(|p| p.identity.clone()).collect(),
            entities: event.entities.iter().map(|e| e.value.clone()).collect(),
            context_notes,
            prior_critique,
            questions_to_answer,
            sender_priors,
        }
    }

    fn stage_limits_for(&self, stage: Stage) -> usize {
        match stage {
            Stage::V1 => self.stage_limits.v1_max_input_chars,
            Stage::V3 => self.stage_limits.v3_max_input_chars,
            _ => self.stage_limits.v1_max_input_chars,
        }
    }

    async fn run_stage(
        &self,
        stage: Stage,
        memory: &WorkingMemory,
        stopping: &StoppingConfig,
        sender_priors: &[String],
    ) -> StageOutcome {
        let inputs = self.build_inputs(stage, memory, sender_priors);
        let started = Instant::now();
        let threshold = self.models.adaptive_escalation_threshold;

        let result = match stage {
            Stage::V1 => self.gateway.call::<V1Signature>(stage.tier(), &inputs, threshold).await,
            Stage::V2 => self.gateway.call::<V2Signature>(stage.tier(), &inputs, threshold).await,
            Stage::V3 => self.gateway.call::<V3Signature>(stage.tier(), &inputs, threshold).await,
            Stage::V4 => self.gateway.call::<V4Signature>(stage.tier(), &inputs, threshold).await,
        };

        let (outputs, model_used, tokens_used) = match result {
            Ok(value) => value,
            Err(error) => return StageOutcome::Failed(error),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        self.bus.publish(EventEnvelope::new(
            memory.event.event_id.clone(),
            EventKind::StageCompleted {
                event_id: memory.event.event_id.clone(),
                stage: stage.to_string(),
                confidence: outputs.confidence.overall(),
                tokens_used,
                duration_ms,
            },
            Utc::now(),
        ));

        let terminal = stage_terminates(stage, &outputs, stopping);
        let hypothesis = Hypothesis {
            stage_id: stage,
            action: outputs.action,
            extractions: outputs.extractions,
            confidence: outputs.confidence,
            notes_used: outputs.notes_used,
            notes_ignored: outputs.notes_ignored,
            critique: outputs.critique,
            early_stop: outputs
                .early_stop
                .then(|| EarlyStop {
                    reason: outputs.early_stop_reason.unwrap_or_default(),
                }),
            needs_next_stage: outputs.needs_next_stage,
            questions_for_next: outputs.questions_for_next,
            model_used,
            tokens_used,
            duration_ms,
        };

        if terminal || stage == Stage::V4 {
            StageOutcome::Terminal(hypothesis)
        } else {
            StageOutcome::Continue(hypothesis)
        }
    }
}

/// Render a `RecommendedAction` the way calibration tables key on it:
/// the same snake_case spelling the signature's `action` field already
/// produces over the wire.
fn action_class(action: RecommendedAction) -> String {
    serde_json::to_value(action)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{action:?}").to_lowercase())
}

fn context_note_ref(item: &ContextItem) -> ContextNoteRef {
    ContextNoteRef {
        note_id: item.note_id.clone(),
        title: item.title.clone(),
        snippet: item.snippet.clone(),
    }
}

fn search_hit_ref(hit: &SearchHit) -> ContextNoteRef {
    ContextNoteRef {
        note_id: format!("search:{}:{}", hit.source, hit.identifier),
        title: hit.title.clone(),
        snippet: hit.snippet.clone(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AgeBucket, EventSource};
    use crate::knowledge::NullEmbedder;
    use crate::llm::{EmbeddingRequest, EmbeddingResponse, Provider};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// A scripted client: returns a fixed JSON body for every call, or a
    /// garbled body once (to exercise the parse-retry path) before
    /// returning well-formed JSON on the following call.
    struct ScriptedClient {
        bodies: Vec<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LLMClient for ScriptedClient {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<crate::llm::CompletionResponse> {
            let index = self.calls.fetch_add(1, Ordering::SeqCst);
            let body = self
                .bodies
                .get(index)
                .or_else(|| self.bodies.last())
                .cloned()
                .unwrap_or_default();
            Ok(crate::llm::CompletionResponse {
                id: "resp".to_string(),
                model: "scripted".to_string(),
                content: body,
                stop_reason: None,
                usage: crate::llm::TokenUsage {
                    input_tokens: 10,
                    output_tokens: 10,
                    cache_read_tokens: None,
                    cache_creation_tokens: None,
                },
                timestamp: Utc::now(),
                cost: None,
            })
        }

        async fn embed(&self, _request: EmbeddingRequest) -> Result<EmbeddingResponse> {
            unimplemented!("not used by orchestrator tests")
        }

        fn provider(&self) -> Provider {
            Provider::Anthropic
        }

        fn available_models(&self) -> Vec<crate::llm::ModelSpec> {
            vec![]
        }
    }

    fn terminal_v1_body() -> String {
        r#"{
            "action": "delete",
            "extractions": [],
            "confidence": {"entity": 0.98, "action": 0.98, "extraction": 0.98, "completeness": 0.98},
            "needs_next_stage": false,
            "early_stop": true,
            "early_stop_reason": "one-time code, ephemeral"
        }"#
        .to_string()
    }

    fn sample_event() -> PerceivedEvent {
        PerceivedEvent {
            event_id: "e1".to_string(),
            source: EventSource::Email,
            kind: "email".to_string(),
            occurred_at: Utc::now(),
            ingested_at: Utc::now(),
            thread_id: Some("t1".to_string()),
            participants: vec![],
            subject: Some("Your one-time code".to_string()),
            body_plain: "Your code is 482913. It expires in 10 minutes.".to_string(),
            body_rich: None,
            attachments: vec![],
            entities: vec![],
            importance_prior: 0.1,
            age_bucket: AgeBucket::Fresh,
        }
    }

    #[tokio::test]
    async fn v1_early_stop_short_circuits_the_chain() {
        let dir = TempDir::new().unwrap();
        let store = KnowledgeStore::open(dir.path(), Box::new(NullEmbedder)).unwrap();
        let client: Arc<dyn LLMClient> = Arc::new(ScriptedClient {
            bodies: vec![terminal_v1_body()],
            calls: AtomicUsize::new(0),
        });
        let orchestrator = Orchestrator::new(
            client,
            SmartRouter::new(),
            &store,
            &Config::default(),
            EventBus::default(),
        );

        let memory = orchestrator.analyze(sample_event()).await.unwrap();
        assert_eq!(memory.trace.len(), 1);
        assert_eq!(memory.trace[0].stage, Stage::V1);
        assert!(memory.overall_confidence > 0.9);
    }

    #[tokio::test]
    async fn malformed_response_is_retried_once_then_parsed() {
        let dir = TempDir::new().unwrap();
        let store = KnowledgeStore::open(dir.path(), Box::new(NullEmbedder)).unwrap();
        let client: Arc<dyn LLMClient> = Arc::new(ScriptedClient {
            bodies: vec!["not json at all".to_string(), terminal_v1_body()],
            calls: AtomicUsize::new(0),
        });
        let orchestrator = Orchestrator::new(
            client,
            SmartRouter::new(),
            &store,
            &Config::default(),
            EventBus::default(),
        );

        let memory = orchestrator.analyze(sample_event()).await.unwrap();
        assert_eq!(memory.trace.len(), 1);
    }

    #[tokio::test]
    async fn pipeline_advances_through_all_four_stages_when_never_confident() {
        let dir = TempDir::new().unwrap();
        let store = KnowledgeStore::open(dir.path(), Box::new(NullEmbedder)).unwrap();
        let low_confidence_body = r#"{
            "action": "queue_for_review",
            "extractions": [],
            "confidence": {"entity": 0.3, "action": 0.3, "extraction": 0.3, "completeness": 0.3},
            "needs_next_stage": true
        }"#;
        let client: Arc<dyn LLMClient> = Arc::new(ScriptedClient {
            bodies: vec![
                low_confidence_body.to_string(),
                low_confidence_body.to_string(),
                low_confidence_body.to_string(),
                low_confidence_body.to_string(),
            ],
            calls: AtomicUsize::new(0),
        });
        let orchestrator = Orchestrator::new(
            client,
            SmartRouter::new(),
            &store,
            &Config::default(),
            EventBus::default(),
        );

        let mut event = sample_event();
        event.body_plain = "An ordinary ambiguous email with no clear action.".to_string();
        let memory = orchestrator.analyze(event).await.unwrap();
        assert_eq!(memory.trace.len(), 4);
        assert_eq!(memory.trace.last().unwrap().stage, Stage::V4);
    }
}
