//! V1–V4 stage contracts (spec.md §4.7), expressed as [`Signature`] impls so
//! prompt rendering and response parsing reuse the teacher's typed-contract
//! machinery rather than a templating crate.

use serde::{Deserialize, Serialize};

use crate::config::StoppingConfig;
use crate::llm::ModelTier;
use crate::signature::{FieldSpec, FieldType, Signature};

use super::extraction::Extraction;
use super::hypothesis::{ConfidenceComponents, RecommendedAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    V1,
    V2,
    V3,
    V4,
}

impl Stage {
    pub fn tier(&self) -> ModelTier {
        match self {
            Stage::V1 | Stage::V2 | Stage::V3 => ModelTier::Fast,
            Stage::V4 => ModelTier::Strong,
        }
    }

    pub fn has_context(&self) -> bool {
        !matches!(self, Stage::V1)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Stage::V1 => "silent observer",
            Stage::V2 => "archivist",
            Stage::V3 => "critic",
            Stage::V4 => "arbiter",
        }
    }

    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::V1 => Some(Stage::V2),
            Stage::V2 => Some(Stage::V3),
            Stage::V3 => Some(Stage::V4),
            Stage::V4 => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A condensed view of one context candidate, as handed to a stage prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextNoteRef {
    pub note_id: String,
    pub title: String,
    pub snippet: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageInputs {
    pub event_subject: Option<String>,
    pub event_body: String,
    pub event_source: String,
    pub age_bucket: String,
    pub participants: Vec<String>,
    pub entities: Vec<String>,
    #[serde(default)]
    pub context_notes: Vec<ContextNoteRef>,
    #[serde(default)]
    pub prior_critique: Option<String>,
    #[serde(default)]
    pub questions_to_answer: Vec<String>,
    #[serde(default)]
    pub sender_priors: Vec<String>,
}

/// Lets [`super::ModelGateway::call`] read a stage's overall confidence
/// without committing to a single concrete `Signature::Outputs` type.
pub trait HasConfidence {
    fn confidence_overall(&self) -> f64;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutputs {
    pub action: RecommendedAction,
    #[serde(default)]
    pub extractions: Vec<Extraction>,
    pub confidence: ConfidenceComponents,
    #[serde(default)]
    pub notes_used: Vec<String>,
    #[serde(default)]
    pub notes_ignored: Vec<String>,
    #[serde(default)]
    pub critique: Option<String>,
    #[serde(default)]
    pub early_stop: bool,
    #[serde(default)]
    pub early_stop_reason: Option<String>,
    #[serde(default)]
    pub needs_next_stage: bool,
    #[serde(default)]
    pub questions_for_next: Vec<String>,
}

impl HasConfidence for StageOutputs {
    fn confidence_overall(&self) -> f64 {
        self.confidence.overall()
    }
}

fn shared_output_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec::new(
            "action",
            FieldType::enum_of([
                "archive",
                "delete",
                "move",
                "draft_reply",
                "create_task",
                "enrich_note",
                "create_note",
                "queue_for_review",
                "flag",
                "snooze",
                "no_action",
            ]),
        )
        .with_description("The recommended handling for this event"),
        FieldSpec::new("extractions", FieldType::list(FieldType::custom("Extraction")))
            .with_description("Atomic facts or intents found in the event")
            .optional(),
        FieldSpec::new("confidence", FieldType::custom("ConfidenceComponents"))
            .with_description("entity/action/extraction/completeness confidence in [0,1]"),
        FieldSpec::new("needs_next_stage", FieldType::Boolean)
            .with_description("Whether a later stage must still review this")
            .optional(),
    ]
}

fn shared_input_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec::new("event_subject", FieldType::String).optional(),
        FieldSpec::new("event_body", FieldType::String).with_description("Plaintext event body"),
        FieldSpec::new("event_source", FieldType::String),
        FieldSpec::new("age_bucket", FieldType::enum_of(["fresh", "recent", "old"])),
    ]
}

/// V1 "silent observer": no context, may early-stop on ephemeral content.
pub struct V1Signature;

impl Signature for V1Signature {
    type Inputs = StageInputs;
    type Outputs = StageOutputs;

    fn instructions() -> &'static str {
        "Extract raw facts from this event and classify the recommended action. \
         Detect ephemeral content (one-time codes, spam, pure notifications) and \
         set early_stop with a reason when found. Calibrate confidence honestly: \
         95-99% only for clearly ephemeral content, 60-80% for ordinary events."
    }

    fn input_fields() -> Vec<FieldSpec> {
        let mut fields = shared_input_fields();
        fields.push(
            FieldSpec::new("sender_priors", FieldType::list(FieldType::String))
                .with_description("Promoted sender->action patterns from prior feedback")
                .optional(),
        );
        fields
    }

    fn output_fields() -> Vec<FieldSpec> {
        shared_output_fields()
    }
}

/// V2 "archivist": has context, never terminates.
pub struct V2Signature;

impl Signature for V2Signature {
    type Inputs = StageInputs;
    type Outputs = StageOutputs;

    fn instructions() -> &'static str {
        "Given V1's hypothesis and candidate context notes, split candidates into \
         notes_used and notes_ignored, resolve name ambiguities, detect duplicates \
         of existing extractions, and populate each extraction's memory_hint \
         (target note, section, and format). This stage never terminates the chain."
    }

    fn input_fields() -> Vec<FieldSpec> {
        let mut fields = shared_input_fields();
        fields.push(
            FieldSpec::new("context_notes", FieldType::list(FieldType::custom("ContextNoteRef")))
                .with_description("Candidate notes retrieved for this event"),
        );
        fields
    }

    fn output_fields() -> Vec<FieldSpec> {
        let mut fields = shared_output_fields();
        fields.push(
            FieldSpec::new("notes_used", FieldType::list(FieldType::String)).optional(),
        );
        fields.push(
            FieldSpec::new("notes_ignored", FieldType::list(FieldType::String)).optional(),
        );
        fields
    }
}

/// V3 "critic": may revise extractions, may escalate to a higher tier.
pub struct V3Signature;

impl Signature for V3Signature {
    type Inputs = StageInputs;
    type Outputs = StageOutputs;

    fn instructions() -> &'static str {
        "Critique V2's hypothesis: check for missing elements, action \
         over-aggressiveness, age concerns (is a stale event still actionable?), \
         and contradictions. Revise extractions if needed. Set needs_next_stage \
         to false only if every open question is resolved and overall confidence \
         is high; otherwise record pointed questions_for_next for the next stage."
    }

    fn input_fields() -> Vec<FieldSpec> {
        let mut fields = shared_input_fields();
        fields.push(FieldSpec::new("prior_critique", FieldType::String).optional());
        fields
    }

    fn output_fields() -> Vec<FieldSpec> {
        let mut fields = shared_output_fields();
        fields.push(
            FieldSpec::new("questions_for_next", FieldType::list(FieldType::String)).optional(),
        );
        fields
    }
}

/// V4 "arbiter": always terminal, full context, resolves open questions.
pub struct V4Signature;

impl Signature for V4Signature {
    type Inputs = StageInputs;
    type Outputs = StageOutputs;

    fn instructions() -> &'static str {
        "Answer V3's open questions explicitly, resolve any inter-stage \
         conflicts, and decide on age relevance. Produce the terminal \
         hypothesis for this event. If overall confidence is below the \
         queue threshold, the recommended action must be queue_for_review."
    }

    fn input_fields() -> Vec<FieldSpec> {
        let mut fields = shared_input_fields();
        fields.push(
            FieldSpec::new("questions_to_answer", FieldType::list(FieldType::String)).optional(),
        );
        fields
    }

    fn output_fields() -> Vec<FieldSpec> {
        shared_output_fields()
    }
}

/// Whether `stage`'s output satisfies its own stop condition (spec.md §4.7
/// staged contract table). V2 never terminates; V4 always does.
pub fn stage_terminates(stage: Stage, outputs: &StageOutputs, stopping: &StoppingConfig) -> bool {
    let overall = outputs.confidence.overall();
    match stage {
        Stage::V1 => {
            outputs.early_stop
                && outputs.action == RecommendedAction::Delete
                && overall >= stopping.v1_early_stop_overall
        }
        Stage::V2 => false,
        Stage::V3 => !outputs.needs_next_stage && overall >= stopping.v3_terminate_overall,
        Stage::V4 => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outputs(overall_parts: f64, early_stop: bool, action: RecommendedAction, needs_next: bool) -> StageOutputs {
        StageOutputs {
            action,
            extractions: vec![],
            confidence: ConfidenceComponents {
                entity: overall_parts,
                action: overall_parts,
                extraction: overall_parts,
                completeness: overall_parts,
            },
            notes_used: vec![],
            notes_ignored: vec![],
            critique: None,
            early_stop,
            early_stop_reason: None,
            needs_next_stage: needs_next,
            questions_for_next: vec![],
        }
    }

    #[test]
    fn v1_terminates_only_on_ephemeral_delete_with_high_confidence() {
        let stopping = StoppingConfig::default();
        let out = outputs(0.97, true, RecommendedAction::Delete, false);
        assert!(stage_terminates(Stage::V1, &out, &stopping));

        let low_confidence = outputs(0.5, true, RecommendedAction::Delete, false);
        assert!(!stage_terminates(Stage::V1, &low_confidence, &stopping));

        let wrong_action = outputs(0.97, true, RecommendedAction::Archive, false);
        assert!(!stage_terminates(Stage::V1, &wrong_action, &stopping));
    }

    #[test]
    fn v2_never_terminates() {
        let stopping = StoppingConfig::default();
        let out = outputs(1.0, true, RecommendedAction::Delete, false);
        assert!(!stage_terminates(Stage::V2, &out, &stopping));
    }

    #[test]
    fn v3_terminates_when_resolved_and_confident() {
        let stopping = StoppingConfig::default();
        let resolved = outputs(0.95, false, RecommendedAction::Archive, false);
        assert!(stage_terminates(Stage::V3, &resolved, &stopping));

        let unresolved = outputs(0.95, false, RecommendedAction::Archive, true);
        assert!(!stage_terminates(Stage::V3, &unresolved, &stopping));
    }

    #[test]
    fn v4_always_terminates() {
        let stopping = StoppingConfig::default();
        let out = outputs(0.1, false, RecommendedAction::QueueForReview, true);
        assert!(stage_terminates(Stage::V4, &out, &stopping));
    }

    #[test]
    fn stage_tiers_match_spec_table() {
        assert_eq!(Stage::V1.tier(), ModelTier::Fast);
        assert_eq!(Stage::V3.tier(), ModelTier::Fast);
        assert_eq!(Stage::V4.tier(), ModelTier::Strong);
        assert!(!Stage::V1.has_context());
        assert!(Stage::V2.has_context());
    }
}
