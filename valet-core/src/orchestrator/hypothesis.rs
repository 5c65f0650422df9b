//! `Hypothesis`: a single stage's structured output (spec.md §3).

use serde::{Deserialize, Serialize};

use super::extraction::Extraction;
use super::stages::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Archive,
    Delete,
    Move,
    DraftReply,
    CreateTask,
    EnrichNote,
    CreateNote,
    QueueForReview,
    Flag,
    Snooze,
    NoAction,
}

/// The four confidence components a stage reports; `overall` is their
/// weighted mean (spec.md §3 invariant (b): components and `overall` both
/// lie in `[0, 1]`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceComponents {
    pub entity: f64,
    pub action: f64,
    pub extraction: f64,
    pub completeness: f64,
}

/// Equal weighting across the four components — the spec names the four
/// components and a "weighted mean" without pinning weights; an even split
/// is the least speculative choice absent further direction (see DESIGN.md).
const COMPONENT_WEIGHT: f64 = 0.25;

impl ConfidenceComponents {
    pub fn overall(&self) -> f64 {
        (self.entity * COMPONENT_WEIGHT
            + self.action * COMPONENT_WEIGHT
            + self.extraction * COMPONENT_WEIGHT
            + self.completeness * COMPONENT_WEIGHT)
            .clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarlyStop {
    pub reason: String,
}

/// A single stage's complete output, folded into [`super::WorkingMemory`]
/// after the model call returns (spec.md §3 `Hypothesis`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hypothesis {
    pub stage_id: Stage,
    pub action: RecommendedAction,
    pub extractions: Vec<Extraction>,
    pub confidence: ConfidenceComponents,
    pub notes_used: Vec<String>,
    pub notes_ignored: Vec<String>,
    pub critique: Option<String>,
    pub early_stop: Option<EarlyStop>,
    pub needs_next_stage: bool,
    pub questions_for_next: Vec<String>,
    pub model_used: String,
    pub tokens_used: u64,
    pub duration_ms: u64,
}

impl Hypothesis {
    pub fn overall_confidence(&self) -> f64 {
        self.confidence.overall()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overall_confidence_is_even_weighted_mean() {
        let components = ConfidenceComponents {
            entity: 0.8,
            action: 0.6,
            extraction: 1.0,
            completeness: 0.4,
        };
        assert!((components.overall() - 0.7).abs() < 1e-9);
    }

    #[test]
    fn overall_confidence_stays_in_unit_range() {
        let components = ConfidenceComponents {
            entity: 1.0,
            action: 1.0,
            extraction: 1.0,
            completeness: 1.0,
        };
        assert_eq!(components.overall(), 1.0);
    }
}
