//! Executor (C9): topological execution of an [`ActionPlan`] with
//! best-effort rollback on failure (spec.md §4.9).
//!
//! Dispatch is wave-by-wave Kahn's-algorithm order, each wave gated by a
//! `tokio::sync::Semaphore` — directly grounded on
//! `llm/batch.rs::BatchExecutor::execute`'s semaphore-plus-`join_all`
//! pattern, generalized from "all prompts independent" to "only this
//! wave's actions are independent".

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use petgraph::graph::NodeIndex;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::bus::{EventBus, EventEnvelope, EventKind};
use crate::config::ExecutorConfig;
use crate::error::{Error, Result};
use crate::planner::{ActionKind, ActionPlan, PlannedAction};

/// An opaque rollback capability returned by a successful [`ActionBackend::execute`],
/// analogous to the teacher's `SubmitResult`/`ExecutionResult` pairing but
/// scoped to side-effect undo rather than signature validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationHandle {
    pub action_id: String,
    pub kind: ActionKind,
    /// `false` when the backend reported a hard, irreversible delete;
    /// `rollback()` is then a no-op with a logged warning (DESIGN.md Open
    /// Question 1), not an error.
    pub reversible: bool,
    pub undo_payload: Value,
}

/// Narrow interface to the systems a `PlannedAction` actually touches
/// (mail/chat/calendar/knowledge store), reached the same way source
/// adapters are in `search/adapters/narrow.rs` — only the execute/rollback
/// contract is consumed here, never a concrete client type.
#[async_trait]
pub trait ActionBackend: Send + Sync {
    async fn execute(&self, action: &PlannedAction) -> Result<CompensationHandle>;
    async fn rollback(&self, handle: &CompensationHandle) -> Result<()>;
}

/// Per-action outcome recorded for the execution report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackOutcome {
    pub action_id: String,
    pub succeeded: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecutionReport {
    pub executed: Vec<CompensationHandle>,
    pub failed_action: Option<String>,
    pub rollbacks: Vec<RollbackOutcome>,
    pub partially_rolled_back: bool,
}

impl ExecutionReport {
    pub fn succeeded(&self) -> bool {
        self.failed_action.is_none()
    }
}

/// Run one action, retrying on failure only when `action.idempotent` is set
/// (spec.md §4.9 "Retries are applied only to actions declared idempotent"),
/// with the same doubling backoff shape as `llm::batch::RetryConfig`. A
/// per-attempt timeout still applies to every retry.
async fn execute_with_retry(
    backend: &Arc<dyn ActionBackend>,
    action: &PlannedAction,
    timeout: Duration,
    max_retries: u32,
    base_delay: Duration,
) -> Result<CompensationHandle> {
    let mut attempt = 0u32;
    loop {
        let attempt_result = tokio::time::timeout(timeout, backend.execute(action)).await;
        let result = match attempt_result {
            Ok(inner) => inner,
            Err(_) => Err(Error::ActionFailed {
                action_id: action.id.clone(),
                reason: format!("timed out after {}s", timeout.as_secs()),
            }),
        };

        match result {
            Ok(handle) => return Ok(handle),
            Err(_) if action.idempotent && attempt < max_retries => {
                attempt += 1;
                tokio::time::sleep(base_delay * 2u32.pow(attempt - 1)).await;
            }
            Err(error) => return Err(error),
        }
    }
}

pub struct Executor {
    backend: Arc<dyn ActionBackend>,
    max_parallel_per_plan: usize,
    action_timeout: Duration,
    max_action_retries: u32,
    action_retry_base_delay: Duration,
    bus: EventBus,
}

impl Executor {
    pub fn new(backend: Arc<dyn ActionBackend>, config: &ExecutorConfig, bus: EventBus) -> Self {
        Self {
            backend,
            max_parallel_per_plan: config.max_parallel_per_plan.max(1),
            action_timeout: Duration::from_secs(config.action_timeout_seconds.max(1)),
            max_action_retries: config.max_action_retries,
            action_retry_base_delay: Duration::from_millis(config.action_retry_base_delay_ms.max(1)),
            bus,
        }
    }

    /// Execute `plan` to completion, or stop and roll back everything
    /// already executed on the first failure (spec.md §4.9 (a)-(c)).
    pub async fn execute_plan(&self, plan: &ActionPlan, event_id: &str) -> Result<ExecutionReport> {
        let mut in_degree: HashMap<NodeIndex, usize> = HashMap::new();
        for idx in plan.graph.node_indices() {
            in_degree.insert(
                idx,
                plan.graph.neighbors_directed(idx, Direction::Incoming).count(),
            );
        }

        let mut ready: VecDeque<NodeIndex> = in_degree
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(&idx, _)| idx)
            .collect();

        let mut report = ExecutionReport::default();
        let mut executed_order: Vec<NodeIndex> = Vec::new();

        'waves: while !ready.is_empty() {
            let wave: Vec<NodeIndex> = ready.drain(..).collect();
            let semaphore = Arc::new(Semaphore::new(self.max_parallel_per_plan));

            let tasks = wave.iter().map(|&idx| {
                let action = plan.graph[idx].clone();
                let backend = Arc::clone(&self.backend);
                let semaphore = Arc::clone(&semaphore);
                let timeout = self.action_timeout;
                let max_retries = self.max_action_retries;
                let base_delay = self.action_retry_base_delay;
                let bus = self.bus.clone();
                let event_id = event_id.to_string();
                async move {
                    let _permit = semaphore.acquire().await.expect("semaphore closed unexpectedly");
                    bus.publish(EventEnvelope::new(
                        event_id.clone(),
                        EventKind::ActionStarted {
                            event_id: event_id.clone(),
                            action_id: action.id.clone(),
                        },
                        chrono::Utc::now(),
                    ));
                    let result =
                        execute_with_retry(&backend, &action, timeout, max_retries, base_delay).await;
                    (idx, action, result)
                }
            });

            let results = join_all(tasks).await;

            for (idx, action, result) in results {
                match result {
                    Ok(handle) => {
                        self.bus.publish(EventEnvelope::new(
                            event_id.to_string(),
                            EventKind::ActionCompleted {
                                event_id: event_id.to_string(),
                                action_id: action.id.clone(),
                            },
                            chrono::Utc::now(),
                        ));
                        executed_order.push(idx);
                        report.executed.push(handle);

                        for successor in plan.graph.neighbors_directed(idx, Direction::Outgoing) {
                            if let Some(count) = in_degree.get_mut(&successor) {
                                *count -= 1;
                                if *count == 0 {
                                    ready.push_back(successor);
                                }
                            }
                        }
                    }
                    Err(error) => {
                        self.bus.publish(EventEnvelope::new(
                            event_id.to_string(),
                            EventKind::ActionFailed {
                                event_id: event_id.to_string(),
                                action_id: action.id.clone(),
                                reason: error.to_string(),
                            },
                            chrono::Utc::now(),
                        ));
                        report.failed_action = Some(action.id.clone());
                        break 'waves;
                    }
                }
            }
        }

        if report.failed_action.is_some() {
            self.rollback(&mut report).await;
        }

        Ok(report)
    }

    /// Roll back every executed handle in reverse completion order,
    /// best-effort; a single rollback failure never aborts the others
    /// (spec.md §4.9 (b)-(c)).
    async fn rollback(&self, report: &mut ExecutionReport) {
        for handle in report.executed.iter().rev() {
            if !handle.reversible {
                report.rollbacks.push(RollbackOutcome {
                    action_id: handle.action_id.clone(),
                    succeeded: true,
                    reason: Some("irreversible action, rollback skipped".to_string()),
                });
                continue;
            }
            match self.backend.rollback(handle).await {
                Ok(()) => report.rollbacks.push(RollbackOutcome {
                    action_id: handle.action_id.clone(),
                    succeeded: true,
                    reason: None,
                }),
                Err(error) => {
                    report.partially_rolled_back = true;
                    report.rollbacks.push(RollbackOutcome {
                        action_id: handle.action_id.clone(),
                        succeeded: false,
                        reason: Some(error.to_string()),
                    });
                }
            }
        }
    }
}
