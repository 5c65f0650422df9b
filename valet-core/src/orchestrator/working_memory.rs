//! `WorkingMemory`: the per-event mutable scratchpad an orchestration run
//! accumulates across stages (spec.md §3).

use serde::{Deserialize, Serialize};

use crate::event::PerceivedEvent;
use crate::retrieval::ContextItem;
use crate::search::SearchHit;

use super::extraction::{merge_extractions, Extraction};
use super::hypothesis::Hypothesis;
use super::stages::Stage;

/// One entry in the persisted reasoning trace (spec.md §6 "analysis
/// snapshot including stage traces").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTrace {
    pub stage: Stage,
    pub model_used: String,
    pub tokens_used: u64,
    pub duration_ms: u64,
    pub overall_confidence: f64,
}

/// Created when orchestration starts, discarded after planning consumes its
/// terminal hypothesis; the trace itself is persisted with the queue item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingMemory {
    pub event: PerceivedEvent,
    pub context_items: Vec<ContextItem>,
    /// Cross-source search hits (C5), merged into V2+ context alongside
    /// `context_items`. Empty when cross-source search isn't configured.
    pub search_hits: Vec<SearchHit>,
    pub hypotheses: Vec<Hypothesis>,
    pub overall_confidence: f64,
    pub open_questions: Vec<String>,
    pub trace: Vec<StageTrace>,
}

impl WorkingMemory {
    pub fn new(event: PerceivedEvent, context_items: Vec<ContextItem>) -> Self {
        Self {
            event,
            context_items,
            search_hits: Vec::new(),
            hypotheses: Vec::new(),
            overall_confidence: 0.0,
            open_questions: Vec::new(),
            trace: Vec::new(),
        }
    }

    pub fn set_search_hits(&mut self, hits: Vec<SearchHit>) {
        self.search_hits = hits;
    }

    /// Record a stage's hypothesis: the new `overall_confidence` is that
    /// stage's own confidence, never a running maximum (spec.md §4.7
    /// aggregation rule — "honesty over marketing").
    pub fn record(&mut self, hypothesis: Hypothesis) {
        self.trace.push(StageTrace {
            stage: hypothesis.stage_id,
            model_used: hypothesis.model_used.clone(),
            tokens_used: hypothesis.tokens_used,
            duration_ms: hypothesis.duration_ms,
            overall_confidence: hypothesis.overall_confidence(),
        });
        self.overall_confidence = hypothesis.overall_confidence();
        self.open_questions = hypothesis.questions_for_next.clone();
        self.hypotheses.push(hypothesis);
    }

    pub fn latest(&self) -> Option<&Hypothesis> {
        self.hypotheses.last()
    }

    /// Extractions across every recorded stage, with later stages
    /// superseding earlier ones on a matching `(target_note, section,
    /// summary-digest)` key.
    pub fn aggregated_extractions(&self) -> Vec<Extraction> {
        self.hypotheses
            .iter()
            .fold(Vec::new(), |acc, h| merge_extractions(acc, h.extractions.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AgeBucket, EventSource};
    use crate::orchestrator::extraction::{
        ExtractionType, Importance, SideEffects, ValidationState, WriteMode,
    };
    use crate::orchestrator::hypothesis::{ConfidenceComponents, RecommendedAction};
    use chrono::Utc;

    fn sample_event() -> PerceivedEvent {
        PerceivedEvent {
            event_id: "e1".to_string(),
            source: EventSource::Email,
            kind: "email".to_string(),
            occurred_at: Utc::now(),
            ingested_at: Utc::now(),
            thread_id: None,
            participants: vec![],
            subject: None,
            body_plain: "hello".to_string(),
            body_rich: None,
            attachments: vec![],
            entities: vec![],
            importance_prior: 0.5,
            age_bucket: AgeBucket::Fresh,
        }
    }

    fn hypothesis(stage: Stage, confidence: f64, summary: &str) -> Hypothesis {
        Hypothesis {
            stage_id: stage,
            action: RecommendedAction::Archive,
            extractions: vec![Extraction {
                extraction_type: ExtractionType::Fact,
                payload_summary: summary.to_string(),
                importance: Importance::Medium,
                target_note: "n1".to_string(),
                target_section: "## History".to_string(),
                write_mode: WriteMode::Enrich,
                side_effects: SideEffects::default(),
                memory_hint: None,
                validation_state: ValidationState::Ok,
            }],
            confidence: ConfidenceComponents {
                entity: confidence,
                action: confidence,
                extraction: confidence,
                completeness: confidence,
            },
            notes_used: vec![],
            notes_ignored: vec![],
            critique: None,
            early_stop: None,
            needs_next_stage: true,
            questions_for_next: vec![],
            model_used: "fast-model".to_string(),
            tokens_used: 100,
            duration_ms: 50,
        }
    }

    #[test]
    fn overall_confidence_is_terminal_stage_not_running_max() {
        let mut memory = WorkingMemory::new(sample_event(), vec![]);
        memory.record(hypothesis(Stage::V1, 0.9, "a"));
        memory.record(hypothesis(Stage::V3, 0.6, "b"));
        assert_eq!(memory.overall_confidence, 0.6);
    }

    #[test]
    fn aggregated_extractions_dedup_on_supersede_key() {
        let mut memory = WorkingMemory::new(sample_event(), vec![]);
        memory.record(hypothesis(Stage::V1, 0.8, "same fact"));
        memory.record(hypothesis(Stage::V2, 0.8, "same fact"));
        assert_eq!(memory.aggregated_extractions().len(), 1);
    }

    #[test]
    fn trace_accumulates_every_stage() {
        let mut memory = WorkingMemory::new(sample_event(), vec![]);
        memory.record(hypothesis(Stage::V1, 0.8, "a"));
        memory.record(hypothesis(Stage::V2, 0.8, "b"));
        assert_eq!(memory.trace.len(), 2);
    }
}
