//! `Extraction`: a single atomic fact or intent surfaced by a stage.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionType {
    Fact,
    Decision,
    Commitment,
    Deadline,
    Event,
    Relation,
    Contact,
    Amount,
    Reference,
    Request,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    Enrich,
    Create,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SideEffects {
    #[serde(default)]
    pub task: bool,
    #[serde(default)]
    pub calendar: bool,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryFormat {
    Bullet,
    BulletDate,
    Paragraph,
    Table,
}

/// Where and how the Knowledge Store should integrate an extraction,
/// populated by V2 (spec.md §4.7 "V2 responsibilities").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryHint {
    pub target_note: String,
    pub target_section: String,
    pub format: MemoryFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationState {
    Ok,
    Corrected,
    DedupIgnored,
}

/// A single atomic fact or intent (spec.md §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    #[serde(rename = "type")]
    pub extraction_type: ExtractionType,
    pub payload_summary: String,
    pub importance: Importance,
    pub target_note: String,
    pub target_section: String,
    pub write_mode: WriteMode,
    #[serde(default)]
    pub side_effects: SideEffects,
    #[serde(default)]
    pub memory_hint: Option<MemoryHint>,
    #[serde(default = "default_validation_state")]
    pub validation_state: ValidationState,
}

fn default_validation_state() -> ValidationState {
    ValidationState::Ok
}

impl Extraction {
    /// `(target_note, section, summary-digest)` — the key later stages use to
    /// supersede an earlier extraction rather than duplicate it (spec.md
    /// §4.7 aggregation rule).
    pub fn supersede_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.target_note.as_bytes());
        hasher.update(b"|");
        hasher.update(self.target_section.as_bytes());
        hasher.update(b"|");
        hasher.update(self.payload_summary.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Merge extraction lists across stages: later stages supersede earlier ones
/// on a matching `supersede_key`, otherwise both are kept.
pub fn merge_extractions(earlier: Vec<Extraction>, later: Vec<Extraction>) -> Vec<Extraction> {
    let later_keys: std::collections::HashSet<String> =
        later.iter().map(Extraction::supersede_key).collect();
    let mut merged: Vec<Extraction> = earlier
        .into_iter()
        .filter(|e| !later_keys.contains(&e.supersede_key()))
        .collect();
    merged.extend(later);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extraction(note: &str, section: &str, summary: &str) -> Extraction {
        Extraction {
            extraction_type: ExtractionType::Fact,
            payload_summary: summary.to_string(),
            importance: Importance::Medium,
            target_note: note.to_string(),
            target_section: section.to_string(),
            write_mode: WriteMode::Enrich,
            side_effects: SideEffects::default(),
            memory_hint: None,
            validation_state: ValidationState::Ok,
        }
    }

    #[test]
    fn later_extraction_supersedes_matching_earlier_one() {
        let earlier = vec![extraction("n1", "## History", "met on Tuesday")];
        let later = vec![extraction("n1", "## History", "met on Tuesday")];
        let merged = merge_extractions(earlier, later.clone());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0], later[0]);
    }

    #[test]
    fn non_matching_extractions_are_both_kept() {
        let earlier = vec![extraction("n1", "## History", "met on Tuesday")];
        let later = vec![extraction("n1", "## Actions", "follow up Friday")];
        let merged = merge_extractions(earlier, later);
        assert_eq!(merged.len(), 2);
    }
}
