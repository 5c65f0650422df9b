//! TTL cache for cross-source search results.
//!
//! Adapted from [`crate::llm::cache::PromptCache`]'s key/entry/stats idiom,
//! generalized from prompt keys to `(normalized_query, enabled_sources)`
//! keys and capped at a fixed entry count with strict TTL eviction (no
//! manual invalidation).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use super::adapter::SearchHit;

/// Default max entries (spec.md §4.5).
pub const DEFAULT_MAX_ENTRIES: usize = 100;
/// Default TTL in seconds (spec.md §4.5: 15 minutes).
pub const DEFAULT_TTL_SECONDS: i64 = 900;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SearchCacheKey(String);

impl SearchCacheKey {
    pub fn new(normalized_query: &str, enabled_sources: &[String]) -> Self {
        let mut sources = enabled_sources.to_vec();
        sources.sort_unstable();
        let mut hasher = Sha256::new();
        hasher.update(normalized_query.as_bytes());
        hasher.update(b"|");
        hasher.update(sources.join(",").as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }
}

struct CacheEntry {
    hits: Vec<SearchHit>,
    sources_failed: Vec<String>,
    created_at: DateTime<Utc>,
}

/// Shared mutex around a bounded map: the teacher's choice for the
/// cross-source cache (spec.md §5: "a single mutex is acceptable given
/// bounded size; entries are immutable once inserted").
pub struct SearchCache {
    entries: Arc<RwLock<HashMap<SearchCacheKey, CacheEntry>>>,
    max_entries: usize,
    ttl: Duration,
}

impl SearchCache {
    pub fn new(max_entries: usize, ttl_seconds: i64) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            max_entries: max_entries.max(1),
            ttl: Duration::seconds(ttl_seconds.max(1)),
        }
    }

    pub async fn get(&self, key: &SearchCacheKey) -> Option<(Vec<SearchHit>, Vec<String>)> {
        let entries = self.entries.read().await;
        let entry = entries.get(key)?;
        if Utc::now() - entry.created_at > self.ttl {
            return None;
        }
        Some((entry.hits.clone(), entry.sources_failed.clone()))
    }

    pub async fn insert(&self, key: SearchCacheKey, hits: Vec<SearchHit>, sources_failed: Vec<String>) {
        let mut entries = self.entries.write().await;
        self.evict_expired(&mut entries);
        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            // Strict TTL eviction only — if still full, drop the oldest entry.
            if let Some(oldest_key) = entries
                .iter()
                .min_by_key(|(_, e)| e.created_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest_key);
            }
        }
        entries.insert(
            key,
            CacheEntry {
                hits,
                sources_failed,
                created_at: Utc::now(),
            },
        );
    }

    fn evict_expired(&self, entries: &mut HashMap<SearchCacheKey, CacheEntry>) {
        let ttl = self.ttl;
        entries.retain(|_, entry| Utc::now() - entry.created_at <= ttl);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(source: &str) -> SearchHit {
        SearchHit {
            source: source.to_string(),
            identifier: "id-1".to_string(),
            title: "title".to_string(),
            snippet: "snippet".to_string(),
            adapter_relevance: 0.8,
            days_old: 1.0,
        }
    }

    #[tokio::test]
    async fn cache_hit_within_ttl() {
        let cache = SearchCache::new(10, 900);
        let key = SearchCacheKey::new("budget", &["email".to_string()]);
        cache.insert(key.clone(), vec![hit("email")], vec![]).await;
        assert!(cache.get(&key).await.is_some());
    }

    #[tokio::test]
    async fn entry_expires_after_ttl() {
        let cache = SearchCache::new(10, 0);
        let key = SearchCacheKey::new("budget", &["email".to_string()]);
        cache.insert(key.clone(), vec![hit("email")], vec![]).await;
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn evicts_when_over_capacity() {
        let cache = SearchCache::new(2, 900);
        for i in 0..3 {
            let key = SearchCacheKey::new(&format!("query-{i}"), &["email".to_string()]);
            cache.insert(key, vec![hit("email")], vec![]).await;
        }
        assert!(cache.len().await <= 2);
    }

    #[test]
    fn key_is_order_independent_over_sources() {
        let a = SearchCacheKey::new("q", &["chat".to_string(), "email".to_string()]);
        let b = SearchCacheKey::new("q", &["email".to_string(), "chat".to_string()]);
        assert_eq!(a, b);
    }
}
