//! Error types for valet-core.

use thiserror::Error;

/// Result type alias using valet-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur across the cognitive core.
///
/// User-facing rendering of these variants must never include filesystem
/// paths or stack traces; diagnostic detail belongs in the `tracing` span
/// (tagged with a correlation id), not in the `Display` output.
#[derive(Error, Debug)]
pub enum Error {
    /// A record from a source adapter could not be normalized.
    #[error("malformed record from {source}: {reason}")]
    MalformedRecord { source: String, reason: String },

    /// A source adapter could not be reached.
    #[error("source unavailable: {source}")]
    SourceUnavailable { source: String },

    /// A model tier's rate limit was exceeded.
    #[error("rate limited on tier {tier}, retry after {retry_after_ms}ms")]
    RateLimited { tier: String, retry_after_ms: u64 },

    /// A model tier's circuit breaker is open.
    #[error("circuit breaker open for tier {tier}")]
    BreakerOpen { tier: String },

    /// A stage's model response could not be parsed into its contract.
    #[error("parse error at stage {stage}: {reason}")]
    ParseError { stage: String, reason: String },

    /// A single orchestration stage exceeded its deadline.
    #[error("stage {stage} timed out after {duration_ms}ms")]
    StageTimeout { stage: String, duration_ms: u64 },

    /// The full orchestration run exceeded its wall-clock deadline.
    #[error("orchestration timed out after {duration_ms}ms")]
    OrchestrationTimeout { duration_ms: u64 },

    /// A note write conflicted with a concurrent or intervening version.
    #[error("note conflict on {note_id}: {reason}")]
    NoteConflict { note_id: String, reason: String },

    /// A planned action failed during execution.
    #[error("action {action_id} failed: {reason}")]
    ActionFailed { action_id: String, reason: String },

    /// A compensating rollback itself failed.
    #[error("rollback failed for action {action_id}: {reason}")]
    RollbackFailed { action_id: String, reason: String },

    /// Timeout during a generic bounded operation.
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// LLM provider error.
    #[error("LLM API error: {provider} - {message}")]
    LlmApi { provider: String, message: String },

    /// LLM error without provider attribution.
    #[error("LLM error: {0}")]
    LLM(String),

    /// Knowledge store or approval queue persistence error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error that should not normally surface.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a malformed-record error.
    pub fn malformed_record(source: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            source: source.into(),
            reason: reason.into(),
        }
    }

    /// Create an LLM API error.
    pub fn llm_api(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LlmApi {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Whether this error represents a condition worth retrying (as opposed
    /// to a permanent failure).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. }
                | Error::StageTimeout { .. }
                | Error::SourceUnavailable { .. }
                | Error::RateLimited { .. }
                | Error::LlmApi { .. }
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
