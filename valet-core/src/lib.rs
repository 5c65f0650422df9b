//! # valet-core
//!
//! The cognitive core behind a personal assistant: normalizes perceived events
//! (mail, chat, calendar), runs them through a staged four-valet analysis
//! pipeline with confidence-based escalation, plans and executes DAG-shaped
//! actions with rollback, and queues anything uncertain for human approval.
//!
//! ## Core Components
//!
//! - **Event**: Perceived-event normalization and entity extraction
//! - **Continuity**: Thread/conversation grouping
//! - **Knowledge**: Markdown-backed notes, versioning, spaced repetition
//! - **Retrieval**: Hybrid context scoring over the knowledge store
//! - **Search**: Cross-source fan-out search with TTL caching
//! - **Llm**: Model routing, rate limiting, circuit breaking
//! - **Orchestrator**: The four-valet staged analysis state machine
//! - **Planner/Executor**: DAG action planning and compensating execution
//! - **Queue**: Durable human approval queue
//! - **Calibration**: Feedback-driven confidence recalibration
//! - **Bus**: Typed pub/sub event bus

// Self-alias for derive macro support within the crate
extern crate self as valet_core;

pub mod bus;
pub mod calibration;
pub mod config;
pub mod continuity;
pub mod error;
pub mod event;
pub mod executor;
pub mod knowledge;
pub mod llm;
pub mod orchestrator;
pub mod planner;
pub mod pool;
pub mod queue;
pub mod retrieval;
pub mod search;
pub mod signature;
pub mod striped_lock;

// Re-exports for convenience
pub use bus::{EventBus, EventEnvelope, EventKind};
pub use calibration::{Calibrator, CalibrationTable, PatternStore, Verdict};
pub use config::Config;
pub use continuity::ContinuityDetector;
pub use error::{Error, Result};
pub use event::{
    Attachment, EntityMention, EntityType, EventSource, Participant, ParticipantRole,
    PerceivedEvent, RawRecord, SourceAdapter,
};
pub use executor::{CompensationHandle, Executor};
pub use knowledge::{KnowledgeStore, Note, NoteId, NoteVersion};
pub use llm::{
    AnthropicClient, ClientConfig, CompletionRequest, CompletionResponse, LLMClient, ModelSpec,
    ModelTier, Provider, RoutingContext, SmartRouter,
};
pub use orchestrator::{Orchestrator, Stage, WorkingMemory};
pub use planner::{ActionPlan, ExecutionMode, Planner, PlannedAction};
pub use queue::{ApprovalQueue, QueueItem, QueueTab};
pub use retrieval::{ContextItem, ContextRetriever};
pub use search::{CrossSourceSearch, SearchHit};
pub use signature::{
    apply_defaults, validate_fields, validate_value, FieldSpec, FieldType, ParseError, Signature,
    ValidationError, ValidationResult,
};
