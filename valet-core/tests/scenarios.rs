//! End-to-end scenarios driving orchestrator -> planner -> executor -> queue
//! together, matching the worked examples in spec.md §8.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use valet_core::bus::{EventBus, EventKind};
use valet_core::calibration::{Calibrator, Verdict};
use valet_core::config::Config;
use valet_core::event::{AgeBucket, EventSource, PerceivedEvent};
use valet_core::executor::{ActionBackend, CompensationHandle, Executor};
use valet_core::knowledge::{KnowledgeStore, NullEmbedder};
use valet_core::llm::{
    ChatMessage, CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse,
    LLMClient, ModelSpec, Provider, SmartRouter, TokenUsage,
};
use valet_core::orchestrator::{ExtractionType, Importance, SideEffects, ValidationState, WriteMode};
use valet_core::planner::{ActionKind, ExecutionMode, Planner};
use valet_core::queue::ApprovalQueue;
use valet_core::{Error, Orchestrator, Result};

struct ScriptedClient {
    bodies: Vec<String>,
    calls: AtomicUsize,
    prompts: StdMutex<Vec<String>>,
}

impl ScriptedClient {
    fn single(body: impl Into<String>) -> Self {
        Self { bodies: vec![body.into()], calls: AtomicUsize::new(0), prompts: StdMutex::new(Vec::new()) }
    }

    fn repeating(body: impl Into<String>, times: usize) -> Self {
        Self { bodies: vec![body.into(); times], calls: AtomicUsize::new(0), prompts: StdMutex::new(Vec::new()) }
    }

    fn scripted(bodies: Vec<String>) -> Self {
        Self { bodies, calls: AtomicUsize::new(0), prompts: StdMutex::new(Vec::new()) }
    }
}

#[async_trait]
impl LLMClient for ScriptedClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(
            request.messages.last().map(|m| m.content.clone()).unwrap_or_default(),
        );
        let body = self.bodies.get(index).or_else(|| self.bodies.last()).cloned().unwrap_or_default();
        Ok(CompletionResponse {
            id: "resp".to_string(),
            model: "scripted".to_string(),
            content: body,
            stop_reason: None,
            usage: TokenUsage {
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
        unimplemented!("not exercised by these scenarios")
    }

    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    fn available_models(&self) -> Vec<ModelSpec> {
        vec![]
    }
}

struct AlwaysErrorsClient;

#[async_trait]
impl LLMClient for AlwaysErrorsClient {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse> {
        Err(Error::llm_api("anthropic", "upstream outage"))
    }

    async fn embed(&self, _request: EmbeddingRequest) -> Result<EmbeddingResponse> {
        unimplemented!()
    }

    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    fn available_models(&self) -> Vec<ModelSpec> {
        vec![]
    }
}

/// Records every action it's asked to run; rolls back cleanly unless told
/// to fail a specific kind.
struct RecordingBackend {
    fail_kind: Option<ActionKind>,
    executed: StdMutex<Vec<String>>,
    rolled_back: StdMutex<Vec<String>>,
}

impl RecordingBackend {
    fn new() -> Self {
        Self { fail_kind: None, executed: StdMutex::new(Vec::new()), rolled_back: StdMutex::new(Vec::new()) }
    }

    fn failing(kind: ActionKind) -> Self {
        Self { fail_kind: Some(kind), executed: StdMutex::new(Vec::new()), rolled_back: StdMutex::new(Vec::new()) }
    }
}

#[async_trait]
impl ActionBackend for RecordingBackend {
    async fn execute(&self, action: &valet_core::planner::PlannedAction) -> Result<CompensationHandle> {
        if Some(action.kind) == self.fail_kind {
            return Err(Error::ActionFailed { action_id: action.id.clone(), reason: "scripted failure".to_string() });
        }
        self.executed.lock().unwrap().push(action.id.clone());
        Ok(CompensationHandle {
            action_id: action.id.clone(),
            kind: action.kind,
            reversible: true,
            undo_payload: serde_json::Value::Null,
        })
    }

    async fn rollback(&self, handle: &CompensationHandle) -> Result<()> {
        self.rolled_back.lock().unwrap().push(handle.action_id.clone());
        Ok(())
    }
}

fn base_event(body: &str, subject: &str) -> PerceivedEvent {
    PerceivedEvent {
        event_id: format!("evt-{}", Utc::now().timestamp_nanos_opt().unwrap_or(0)),
        source: EventSource::Email,
        kind: "email".to_string(),
        occurred_at: Utc::now(),
        ingested_at: Utc::now(),
        thread_id: None,
        participants: vec![],
        subject: Some(subject.to_string()),
        body_plain: body.to_string(),
        body_rich: None,
        attachments: vec![],
        entities: vec![],
        importance_prior: 0.2,
        age_bucket: AgeBucket::Fresh,
    }
}

async fn orchestrator_for<'a>(client: Arc<dyn LLMClient>, store: &'a KnowledgeStore) -> Orchestrator<'a> {
    Orchestrator::new(client, SmartRouter::new(), store, &Config::default(), EventBus::default())
}

/// Scenario 1 (spec.md §8): a one-time-code email early-stops at V1 with
/// `delete`, auto-executed immediately — `delete` against this system's
/// recoverable trash is risk 0.1, and 0.98 confidence clears the
/// `overall>=0.90 && max_risk<=0.1` auto bar (spec.md §4.8 rule 5). The
/// queue still records the run for its undo window, just without a human
/// approval step in between.
#[tokio::test]
async fn otp_email_early_stops_and_auto_deletes() {
    let dir = TempDir::new().unwrap();
    let store = KnowledgeStore::open(dir.path(), Box::new(NullEmbedder)).unwrap();
    let client: Arc<dyn LLMClient> = Arc::new(ScriptedClient::single(
        r#"{
            "action": "delete",
            "extractions": [],
            "confidence": {"entity": 0.98, "action": 0.98, "extraction": 0.98, "completeness": 0.98},
            "needs_next_stage": false,
            "early_stop": true,
            "early_stop_reason": "one-time code"
        }"#,
    ));
    let orchestrator = orchestrator_for(client, &store).await;
    let event = base_event("Your code is 482913. It expires in 10 minutes.", "Your one-time code");
    let event_id = event.event_id.clone();

    let memory = orchestrator.analyze(event).await.unwrap();
    assert_eq!(memory.trace.len(), 1);
    assert!(memory.overall_confidence >= 0.95);

    let hypothesis = memory.latest().unwrap().clone();
    let (plan, mode) = Planner::build(&hypothesis);
    assert_eq!(plan.action_count(), 1);
    assert!(plan.graph[plan.roots()[0]].reversible);
    assert_eq!(mode, ExecutionMode::Auto);

    let queue = ApprovalQueue::in_memory(300).unwrap();
    let item = queue
        .enqueue("email", &event_id, serde_json::to_value(&memory).unwrap())
        .unwrap();

    queue.begin_approval(&item.id).unwrap();
    let backend = Arc::new(RecordingBackend::new());
    let executor = Executor::new(backend.clone(), &Default::default(), EventBus::default());
    let report = executor.execute_plan(&plan, &item.id).await.unwrap();
    assert!(report.succeeded());
    queue.record_approval(&item.id, "delete", report.executed).unwrap();

    let history = queue.list_by_tab(valet_core::queue::QueueTab::History, 10, 0).unwrap();
    assert_eq!(history.len(), 1);
}

/// Scenario 2 (spec.md §8), calibration primitive: a sender with a strong
/// calibration history lowers that source's V3-stop threshold below
/// baseline and is promoted into a sender prior.
#[tokio::test]
async fn newsletter_sender_pattern_lowers_the_stopping_threshold() {
    let calibrator = Calibrator::in_memory(EventBus::default()).unwrap();
    for _ in 0..50 {
        calibrator
            .record_verdict(
                "newsletter@techcrunch.com",
                "delete",
                0.92,
                Verdict::ApproveAsSuggested,
                Some("newsletter@techcrunch.com"),
            )
            .unwrap();
    }
    let threshold = calibrator
        .stopping_threshold_for("newsletter@techcrunch.com", "delete", 0.90)
        .unwrap();
    assert_eq!(threshold, 0.88);
    let priors = calibrator.sender_priors("newsletter@techcrunch.com").unwrap();
    assert_eq!(priors, vec!["sender pattern: delete".to_string()]);
}

/// Scenario 2 (spec.md §8), end to end: the same calibration history, now
/// wired into a live `Orchestrator` via `with_calibrator`, lowers V3's stop
/// threshold for `(source="email", action_class="delete")` enough that V3
/// terminates at 0.88 confidence instead of falling through to V4, and the
/// sender's promoted pattern shows up in V1's own prompt.
#[tokio::test]
async fn calibrator_wired_into_orchestrator_stops_early_and_feeds_v1_priors() {
    let dir = TempDir::new().unwrap();
    let store = KnowledgeStore::open(dir.path(), Box::new(NullEmbedder)).unwrap();
    let bus = EventBus::default();
    let calibrator = Calibrator::in_memory(bus.clone()).unwrap();
    for _ in 0..50 {
        calibrator
            .record_verdict(
                "email",
                "delete",
                0.92,
                Verdict::ApproveAsSuggested,
                Some("newsletter@techcrunch.com"),
            )
            .unwrap();
    }

    let v1_body = r#"{
        "action": "delete",
        "extractions": [],
        "confidence": {"entity": 0.85, "action": 0.85, "extraction": 0.85, "completeness": 0.85},
        "needs_next_stage": true,
        "early_stop": false
    }"#;
    let v2_body = r#"{
        "action": "delete",
        "extractions": [],
        "confidence": {"entity": 0.86, "action": 0.86, "extraction": 0.86, "completeness": 0.86},
        "needs_next_stage": true
    }"#;
    let v3_body = r#"{
        "action": "delete",
        "extractions": [],
        "confidence": {"entity": 0.88, "action": 0.88, "extraction": 0.88, "completeness": 0.88},
        "needs_next_stage": false
    }"#;
    let client = Arc::new(ScriptedClient::scripted(vec![
        v1_body.to_string(),
        v2_body.to_string(),
        v3_body.to_string(),
    ]));
    let llm_client: Arc<dyn LLMClient> = client.clone();
    let orchestrator = Orchestrator::new(
        llm_client,
        SmartRouter::new(),
        &store,
        &Config::default(),
        bus,
    )
    .with_calibrator(calibrator);

    let mut event = base_event("Weekly digest: top stories you may have missed.", "Your weekly digest");
    event.participants.push(valet_core::event::Participant {
        identity: "newsletter@techcrunch.com".to_string(),
        role: valet_core::event::ParticipantRole::From,
    });

    let memory = orchestrator.analyze(event).await.unwrap();

    // Baseline v3_terminate_overall is 0.90; the calibrated override (0.88)
    // is what lets V3's 0.88-confidence hypothesis terminate the chain here.
    assert_eq!(memory.trace.len(), 3);
    assert!((memory.overall_confidence - 0.88).abs() < 1e-9);

    let prompts = client.prompts.lock().unwrap();
    assert!(prompts[0].contains("sender pattern: delete"));
}

/// Scenario 3 (spec.md §8): a business meeting invite produces a terminal
/// V3 hypothesis with a calendar side effect; the plan has an enrich-note
/// and calendar-creation node feeding a single archive node, requiring
/// human review (max_risk 0.2) before executing.
#[tokio::test]
async fn meeting_invite_builds_a_three_node_plan_and_executes_under_review() {
    let dir = TempDir::new().unwrap();
    let store = KnowledgeStore::open(dir.path(), Box::new(NullEmbedder)).unwrap();
    let client: Arc<dyn LLMClient> = Arc::new(ScriptedClient::single(
        r#"{
            "action": "archive",
            "extractions": [{
                "type": "event",
                "payload_summary": "Budget Q1 meeting",
                "importance": "high",
                "target_note": "Budget Q1",
                "target_section": "## Events",
                "write_mode": "enrich",
                "side_effects": {"task": false, "calendar": true, "date": "2026-07-30", "time": "10:00"},
                "memory_hint": null,
                "validation_state": "ok"
            }],
            "confidence": {"entity": 0.93, "action": 0.93, "extraction": 0.93, "completeness": 0.93},
            "needs_next_stage": false,
            "early_stop": false
        }"#,
    ));
    let orchestrator = orchestrator_for(client, &store).await;
    let event = base_event("Let's meet Thursday at 10 to discuss the Q1 budget.", "Budget Q1 meeting");
    let memory = orchestrator.analyze(event).await.unwrap();

    let hypothesis = memory.latest().unwrap().clone();
    assert_eq!(hypothesis.extractions[0].extraction_type, ExtractionType::Event);
    assert_eq!(hypothesis.extractions[0].importance, Importance::High);
    assert_eq!(hypothesis.extractions[0].write_mode, WriteMode::Enrich);
    assert!(hypothesis.extractions[0].side_effects.calendar);
    assert_eq!(hypothesis.extractions[0].validation_state, ValidationState::Ok);

    let (plan, mode) = Planner::build(&hypothesis);
    assert_eq!(plan.action_count(), 3);
    assert_eq!(mode, ExecutionMode::Review);

    let backend = Arc::new(RecordingBackend::new());
    let executor = Executor::new(backend.clone(), &Default::default(), EventBus::default());
    let report = executor.execute_plan(&plan, "meeting-1").await.unwrap();
    assert!(report.succeeded());
    assert_eq!(backend.executed.lock().unwrap().len(), 3);
}

/// Scenario 4 (spec.md §8): an ambiguous event never reaches V3's stop
/// condition, runs all four stages, and V4 produces `queue_for_review`,
/// collapsing the plan to a single review node.
#[tokio::test]
async fn ambiguous_event_runs_every_stage_and_queues_for_review() {
    let dir = TempDir::new().unwrap();
    let store = KnowledgeStore::open(dir.path(), Box::new(NullEmbedder)).unwrap();
    let body = r#"{
        "action": "queue_for_review",
        "extractions": [],
        "confidence": {"entity": 0.4, "action": 0.4, "extraction": 0.4, "completeness": 0.4},
        "needs_next_stage": true
    }"#;
    let client: Arc<dyn LLMClient> = Arc::new(ScriptedClient::repeating(body, 4));
    let orchestrator = orchestrator_for(client, &store).await;
    let event = base_event("We should probably circle back on terms at some point.", "Re: contract");
    let event_id = event.event_id.clone();
    let memory = orchestrator.analyze(event).await.unwrap();
    assert_eq!(memory.trace.len(), 4);

    let hypothesis = memory.latest().unwrap().clone();
    let (plan, mode) = Planner::build(&hypothesis);
    assert_eq!(plan.action_count(), 1);
    assert_eq!(plan.graph[plan.roots()[0]].kind, ActionKind::QueueForReview);
    assert_eq!(mode, ExecutionMode::Manual);

    let queue = ApprovalQueue::in_memory(300).unwrap();
    let item = queue.enqueue("email", &event_id, serde_json::to_value(&memory).unwrap()).unwrap();
    let to_process = queue.list_by_tab(valet_core::queue::QueueTab::ToProcess, 10, 0).unwrap();
    assert_eq!(to_process.len(), 1);
    assert_eq!(to_process[0].id, item.id);
}

/// Scenario 5 (spec.md §8): a provider outage fails the single model call
/// for the stage; the run fails fatally and the bus observes
/// `AnalysisFailed`, the same path that would fire once the circuit
/// breaker itself trips open after repeated failures.
#[tokio::test]
async fn provider_outage_fails_the_analysis_and_emits_analysis_failed() {
    let dir = TempDir::new().unwrap();
    let store = KnowledgeStore::open(dir.path(), Box::new(NullEmbedder)).unwrap();
    let bus = EventBus::default();
    let mut rx = bus.subscribe();
    let client: Arc<dyn LLMClient> = Arc::new(AlwaysErrorsClient);
    let orchestrator = Orchestrator::new(client, SmartRouter::new(), &store, &Config::default(), bus);

    let event = base_event("Some ordinary message.", "Hi");
    let result = orchestrator.analyze(event).await;
    assert!(result.is_err());

    let mut saw_failure = false;
    while let Ok(envelope) = rx.try_recv() {
        if matches!(envelope.kind, EventKind::AnalysisFailed { .. }) {
            saw_failure = true;
        }
    }
    assert!(saw_failure);
}

/// Scenario 6 (spec.md §8): a plan with a calendar side effect fails on
/// its source-side action; everything already executed is rolled back and
/// the queue item surfaces under Errors.
#[tokio::test]
async fn partial_failure_rolls_back_and_surfaces_under_errors() {
    let hypothesis = valet_core::orchestrator::Hypothesis {
        stage_id: valet_core::orchestrator::Stage::V3,
        action: valet_core::orchestrator::RecommendedAction::Archive,
        extractions: vec![valet_core::orchestrator::Extraction {
            extraction_type: ExtractionType::Event,
            payload_summary: "Budget Q1 meeting".to_string(),
            importance: Importance::High,
            target_note: "Budget Q1".to_string(),
            target_section: "## Events".to_string(),
            write_mode: WriteMode::Enrich,
            side_effects: SideEffects {
                task: false,
                calendar: true,
                date: Some("2026-07-30".to_string()),
                time: Some("10:00".to_string()),
            },
            memory_hint: None,
            validation_state: ValidationState::Ok,
        }],
        confidence: valet_core::orchestrator::ConfidenceComponents {
            entity: 0.92,
            action: 0.92,
            extraction: 0.92,
            completeness: 0.92,
        },
        notes_used: vec![],
        notes_ignored: vec![],
        critique: None,
        early_stop: None,
        needs_next_stage: false,
        questions_for_next: vec![],
        model_used: "fast-model".to_string(),
        tokens_used: 10,
        duration_ms: 5,
    };
    let (plan, _mode) = Planner::build(&hypothesis);

    let queue = ApprovalQueue::in_memory(300).unwrap();
    let item = queue.enqueue("email", "evt-6", serde_json::json!({})).unwrap();
    queue.begin_approval(&item.id).unwrap();

    let backend = Arc::new(RecordingBackend::failing(ActionKind::Archive));
    let executor = Executor::new(backend.clone(), &Default::default(), EventBus::default());
    let report = executor.execute_plan(&plan, &item.id).await.unwrap();
    assert!(!report.succeeded());
    assert!(!report.partially_rolled_back);
    assert_eq!(backend.rolled_back.lock().unwrap().len(), report.executed.len());

    queue.fail_approval(&item.id, report.failed_action.as_deref().unwrap_or("unknown")).unwrap();
    let errors = queue.list_by_tab(valet_core::queue::QueueTab::Errors, 10, 0).unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].id, item.id);
}
