//! Cross-source search fan-out (C5): parallel adapter calls under a shared
//! deadline, scored and merged, cached by query.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use super::adapter::{SearchHit, SearchOptions, SourceSearchAdapter};
use super::cache::{SearchCache, SearchCacheKey};
use crate::config::CrossSourceConfig;

/// Request to [`CrossSourceSearch::search`].
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    pub preferred_sources: Vec<String>,
    pub exclude_sources: Vec<String>,
    pub include_web: bool,
    pub opts: SearchOptions,
}

#[derive(Debug, Clone)]
pub struct SearchResults {
    pub hits: Vec<SearchHit>,
    pub sources_failed: Vec<String>,
}

pub struct CrossSourceSearch {
    adapters: Vec<Arc<dyn SourceSearchAdapter>>,
    cache: SearchCache,
    config: CrossSourceConfig,
}

fn normalize_query(query: &str) -> String {
    query.trim().to_ascii_lowercase()
}

fn freshness_decay(days_old: f64) -> f64 {
    (1.0 - 0.5 * days_old / 30.0).max(0.5)
}

impl CrossSourceSearch {
    pub fn new(adapters: Vec<Arc<dyn SourceSearchAdapter>>, config: CrossSourceConfig) -> Self {
        let cache = SearchCache::new(100, config.cache_ttl_seconds as i64);
        Self {
            adapters,
            cache,
            config,
        }
    }

    pub async fn search(&self, request: SearchRequest) -> SearchResults {
        let enabled: Vec<Arc<dyn SourceSearchAdapter>> = self
            .adapters
            .iter()
            .filter(|a| !request.exclude_sources.iter().any(|s| s == a.source_name()))
            .filter(|a| {
                request.preferred_sources.is_empty()
                    || request.preferred_sources.iter().any(|s| s == a.source_name())
            })
            .cloned()
            .collect();

        let enabled_names: Vec<String> = enabled.iter().map(|a| a.source_name().to_string()).collect();
        let cache_key = SearchCacheKey::new(&normalize_query(&request.query), &enabled_names);

        if let Some((hits, sources_failed)) = self.cache.get(&cache_key).await {
            return SearchResults { hits, sources_failed };
        }

        let timeout = Duration::from_secs(self.config.adapter_timeout_seconds);
        let cancel = CancellationToken::new();
        let query = request.query.clone();
        let opts = request.opts.clone();

        let tasks = enabled.into_iter().map(|adapter| {
            let query = query.clone();
            let opts = opts.clone();
            let cancel = cancel.clone();
            async move {
                if !adapter.is_available().await {
                    return (adapter.source_name().to_string(), None);
                }
                let result = tokio::time::timeout(
                    timeout,
                    adapter.search(&query, 50, &opts, cancel),
                )
                .await;
                match result {
                    Ok(Ok(hits)) => (adapter.source_name().to_string(), Some(hits)),
                    _ => (adapter.source_name().to_string(), None),
                }
            }
        });

        let outcomes = join_all(tasks).await;

        let mut sources_failed = Vec::new();
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut hits: Vec<SearchHit> = Vec::new();

        for (source, outcome) in outcomes {
            match outcome {
                None => sources_failed.push(source),
                Some(source_hits) => {
                    let weight = self
                        .config
                        .source_weights
                        .get(&source)
                        .copied()
                        .unwrap_or(1.0);
                    for mut hit in source_hits {
                        let key = (hit.source.clone(), hit.identifier.clone());
                        if !seen.insert(key) {
                            continue;
                        }
                        let decay = freshness_decay(hit.days_old);
                        hit.adapter_relevance =
                            (hit.adapter_relevance as f64 * weight * decay) as f32;
                        hits.push(hit);
                    }
                }
            }
        }

        hits.sort_by(|a, b| {
            b.adapter_relevance
                .partial_cmp(&a.adapter_relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(self.config.max_total_results);

        self.cache
            .insert(cache_key, hits.clone(), sources_failed.clone())
            .await;

        SearchResults { hits, sources_failed }
    }
}
