//! The `SourceSearchAdapter` capability consumed by fan-out search.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Options narrowing an adapter's search, typically seeded from a note's
/// `linked_sources`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchOptions {
    pub folder_path: Option<String>,
    pub chat_name: Option<String>,
    pub sender_filter: Option<String>,
    /// Only honored by the web adapter: explicit opt-in per request.
    pub include_web: bool,
}

/// A single result from any adapter, before cross-source scoring is applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub source: String,
    pub identifier: String,
    pub title: String,
    pub snippet: String,
    pub adapter_relevance: f32,
    pub days_old: f64,
}

/// A pluggable search capability over one source.
#[async_trait]
pub trait SourceSearchAdapter: Send + Sync {
    fn source_name(&self) -> &str;

    /// Whether this adapter is currently reachable (e.g. credentials
    /// present, endpoint healthy). Unavailable adapters are skipped before
    /// fan-out rather than counted as failures.
    async fn is_available(&self) -> bool;

    /// Search for `query`, returning at most `max` hits. Must honor
    /// `cancel` cooperatively — check it between expensive steps so the
    /// fan-out's shared deadline can actually cut work short.
    async fn search(
        &self,
        query: &str,
        max: usize,
        opts: &SearchOptions,
        cancel: CancellationToken,
    ) -> Result<Vec<SearchHit>>;
}
