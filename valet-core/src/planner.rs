//! Planner (C8): turns a terminal [`Hypothesis`] into a DAG of
//! [`PlannedAction`]s plus an [`ExecutionMode`] (spec.md §4.8).
//!
//! `ActionPlan` makes the action graph explicit rather than leaving
//! dependencies implicit in enumeration order (spec.md §9 redesign note);
//! `petgraph` is adopted from the `dashflow` pack repo's workspace
//! dependencies since the teacher has no graph crate of its own.

use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::orchestrator::{Hypothesis, RecommendedAction, WriteMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    CreateNote,
    EnrichNote,
    CreateTask,
    CreateCalendarEvent,
    Archive,
    Delete,
    Move,
    Flag,
    Snooze,
    NoAction,
    /// Produced only by the stage contract, before human approval.
    DraftReply,
    /// Produced only by an approval-triggered replan (`approve(id, "send")`);
    /// the Planner itself never emits this from a stage's recommendation.
    SendReply,
    QueueForReview,
}

impl From<RecommendedAction> for ActionKind {
    fn from(action: RecommendedAction) -> Self {
        match action {
            RecommendedAction::Archive => ActionKind::Archive,
            RecommendedAction::Delete => ActionKind::Delete,
            RecommendedAction::Move => ActionKind::Move,
            RecommendedAction::DraftReply => ActionKind::DraftReply,
            RecommendedAction::CreateTask => ActionKind::CreateTask,
            RecommendedAction::EnrichNote => ActionKind::EnrichNote,
            RecommendedAction::CreateNote => ActionKind::CreateNote,
            RecommendedAction::QueueForReview => ActionKind::QueueForReview,
            RecommendedAction::Flag => ActionKind::Flag,
            RecommendedAction::Snooze => ActionKind::Snooze,
            RecommendedAction::NoAction => ActionKind::NoAction,
        }
    }
}

/// Fixed risk table (spec.md §4.8): `delete` is adjusted for "trash
/// recoverable" down from its nominal 0.7 to 0.1 once `reversible` is set
/// (every delete in this system lands in a recoverable trash, never a hard
/// delete); `archive` reversible; `draft_reply` safe pre-send; `send_reply`
/// high risk once a message actually leaves. Everything else is a
/// reasonable interior value absent a literal spec figure (recorded in
/// DESIGN.md).
pub fn risk_for(kind: ActionKind, reversible: bool) -> f64 {
    match kind {
        ActionKind::Delete => {
            if reversible {
                0.1
            } else {
                0.7
            }
        }
        ActionKind::SendReply => 0.9,
        ActionKind::DraftReply => 0.1,
        ActionKind::Archive => 0.1,
        ActionKind::Flag => 0.1,
        ActionKind::Snooze => 0.1,
        ActionKind::NoAction => 0.0,
        ActionKind::QueueForReview => 0.0,
        ActionKind::CreateNote
        | ActionKind::EnrichNote
        | ActionKind::CreateTask
        | ActionKind::CreateCalendarEvent
        | ActionKind::Move => 0.2,
    }
}

/// Whether undoing this action kind is possible at all (spec.md §3
/// `PlannedAction.reversible`, "with rollback descriptor"). Only a sent
/// reply can never be taken back; every other action kind either has an
/// inverse operation or a recoverable trash/draft state behind it.
fn reversible_for(kind: ActionKind) -> bool {
    !matches!(kind, ActionKind::SendReply)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedAction {
    pub id: String,
    pub kind: ActionKind,
    pub risk: f64,
    /// Whether this action's effect can be undone (spec.md §3 Data Model).
    pub reversible: bool,
    /// Whether the executor may retry this action on transient failure.
    pub idempotent: bool,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Auto,
    Review,
    Manual,
}

/// A DAG of planned actions; an edge `a -> b` means `a` must complete
/// before `b` starts.
#[derive(Debug, Clone, Default)]
pub struct ActionPlan {
    pub graph: DiGraph<PlannedAction, ()>,
}

impl ActionPlan {
    pub fn action_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn max_risk(&self) -> f64 {
        self.graph
            .node_weights()
            .map(|action| action.risk)
            .fold(0.0_f64, f64::max)
    }

    /// Nodes with no incoming edges within the plan.
    pub fn roots(&self) -> Vec<NodeIndex> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, petgraph::Direction::Incoming)
                    .next()
                    .is_none()
            })
            .collect()
    }
}

pub struct Planner;

impl Planner {
    /// Build a plan and its execution mode from a terminal hypothesis.
    pub fn build(hypothesis: &Hypothesis) -> (ActionPlan, ExecutionMode) {
        let mut graph: DiGraph<PlannedAction, ()> = DiGraph::new();
        let mut counter = 0usize;

        if hypothesis.action == RecommendedAction::QueueForReview {
            graph.add_node(PlannedAction {
                id: alloc_id(&mut counter),
                kind: ActionKind::QueueForReview,
                risk: risk_for(ActionKind::QueueForReview, reversible_for(ActionKind::QueueForReview)),
                reversible: reversible_for(ActionKind::QueueForReview),
                idempotent: true,
                payload: json!({ "intended_effects": intended_effects(hypothesis) }),
            });
            let plan = ActionPlan { graph };
            let mode = execution_mode(hypothesis.overall_confidence(), plan.max_risk());
            return (plan, mode);
        }

        let mut creation_nodes: Vec<NodeIndex> = Vec::new();

        for extraction in &hypothesis.extractions {
            let note_kind = match extraction.write_mode {
                WriteMode::Create => ActionKind::CreateNote,
                WriteMode::Enrich => ActionKind::EnrichNote,
            };
            let note_node = graph.add_node(PlannedAction {
                id: alloc_id(&mut counter),
                kind: note_kind,
                risk: risk_for(note_kind, reversible_for(note_kind)),
                reversible: reversible_for(note_kind),
                idempotent: true,
                payload: json!({
                    "target_note": extraction.target_note,
                    "target_section": extraction.target_section,
                    "payload_summary": extraction.payload_summary,
                }),
            });
            creation_nodes.push(note_node);

            if extraction.side_effects.task {
                let task_node = graph.add_node(PlannedAction {
                    id: alloc_id(&mut counter),
                    kind: ActionKind::CreateTask,
                    risk: risk_for(ActionKind::CreateTask, reversible_for(ActionKind::CreateTask)),
                    reversible: reversible_for(ActionKind::CreateTask),
                    idempotent: true,
                    payload: json!({
                        "description": extraction.payload_summary,
                        "date": extraction.side_effects.date,
                        "time": extraction.side_effects.time,
                    }),
                });
                creation_nodes.push(task_node);
            }

            if extraction.side_effects.calendar {
                let calendar_node = graph.add_node(PlannedAction {
                    id: alloc_id(&mut counter),
                    kind: ActionKind::CreateCalendarEvent,
                    risk: risk_for(ActionKind::CreateCalendarEvent, reversible_for(ActionKind::CreateCalendarEvent)),
                    reversible: reversible_for(ActionKind::CreateCalendarEvent),
                    idempotent: false,
                    payload: json!({
                        "title": extraction.payload_summary,
                        "date": extraction.side_effects.date,
                        "time": extraction.side_effects.time,
                    }),
                });
                creation_nodes.push(calendar_node);
            }
        }

        let source_kind = ActionKind::from(hypothesis.action);
        let source_reversible = reversible_for(source_kind);
        let source_node = graph.add_node(PlannedAction {
            id: alloc_id(&mut counter),
            kind: source_kind,
            risk: risk_for(source_kind, source_reversible),
            reversible: source_reversible,
            idempotent: matches!(
                source_kind,
                ActionKind::Archive | ActionKind::Flag | ActionKind::Snooze
            ),
            payload: json!({}),
        });
        for creation in &creation_nodes {
            graph.add_edge(*creation, source_node, ());
        }

        let plan = ActionPlan { graph };
        let mode = execution_mode(hypothesis.overall_confidence(), plan.max_risk());
        (plan, mode)
    }
}

fn alloc_id(counter: &mut usize) -> String {
    let id = format!("action-{counter}");
    *counter += 1;
    id
}

fn intended_effects(hypothesis: &Hypothesis) -> Value {
    json!({
        "recommended_action": hypothesis.action,
        "extractions": hypothesis.extractions,
    })
}

/// Execution-mode matrix (spec.md §4.8): `overall>=0.90 && max_risk<=0.1 ->
/// auto`; else `overall>=0.75 && max_risk<=0.3 -> review`; else `manual`.
fn execution_mode(overall: f64, max_risk: f64) -> ExecutionMode {
    if overall >= 0.90 && max_risk <= 0.1 {
        ExecutionMode::Auto
    } else if overall >= 0.75 && max_risk <= 0.3 {
        ExecutionMode::Review
    } else {
        ExecutionMode::Manual
    }
}
