//! Context retrieval (C4): hybrid entity/semantic/thread ranking over the
//! Knowledge Store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::ContextConfig;
use crate::knowledge::{KnowledgeStore, NoteId};

/// One ranked candidate handed to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    pub note_id: NoteId,
    pub title: String,
    pub source: ContextSource,
    pub score: f64,
    pub snippet: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextSource {
    Entity,
    Semantic,
    Thread,
}

pub struct ContextRetriever<'a> {
    store: &'a KnowledgeStore,
    config: ContextConfig,
}

impl<'a> ContextRetriever<'a> {
    pub fn new(store: &'a KnowledgeStore, config: ContextConfig) -> Self {
        Self { store, config }
    }

    /// `score = 0.4*s_E + 0.4*s_S + 0.2*s_T`, deduped by note id keeping the
    /// max score, dropped below `min_relevance`, top-k by score with a
    /// recency-then-id tie-break.
    pub fn retrieve(
        &self,
        entities: &[String],
        semantic_query: Option<&[f32]>,
        thread_id: Option<&str>,
    ) -> Vec<ContextItem> {
        let k_e = self.config.top_k.max(1);
        let mut pooled: HashMap<NoteId, ContextItem> = HashMap::new();

        for entity in entities {
            for (note, raw_score) in self.store.by_entity(entity, k_e) {
                let score = self.config.weight_entity * raw_score as f64;
                self.merge_max(
                    &mut pooled,
                    note.id().clone(),
                    &note.frontmatter.title,
                    score,
                    ContextSource::Entity,
                    &note.body(),
                    note.frontmatter.updated_at,
                );
            }
        }

        if let Some(vector) = semantic_query {
            for (note, raw_score) in self.store.search_semantic(vector, self.config.top_k.max(1)) {
                let score = self.config.weight_semantic * raw_score as f64;
                self.merge_max(
                    &mut pooled,
                    note.id().clone(),
                    &note.frontmatter.title,
                    score,
                    ContextSource::Semantic,
                    &note.body(),
                    note.frontmatter.updated_at,
                );
            }
        }

        if let Some(thread_id) = thread_id {
            let query = format!("thread:{thread_id}");
            for (note, raw_score) in self.store.search_text(&query, self.config.top_k.max(1)) {
                let score = self.config.weight_thread * raw_score as f64;
                self.merge_max(
                    &mut pooled,
                    note.id().clone(),
                    &note.frontmatter.title,
                    score,
                    ContextSource::Thread,
                    &note.body(),
                    note.frontmatter.updated_at,
                );
            }
        }

        let mut items: Vec<ContextItem> = pooled
            .into_values()
            .filter(|item| item.score >= self.config.min_relevance)
            .collect();

        // Tie-break by recency (newer wins), then lexicographic id.
        items.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
                .then_with(|| a.note_id.cmp(&b.note_id))
        });
        items.truncate(self.config.top_k);
        items
    }

    #[allow(clippy::too_many_arguments)]
    fn merge_max(
        &self,
        pooled: &mut HashMap<NoteId, ContextItem>,
        note_id: NoteId,
        title: &str,
        score: f64,
        source: ContextSource,
        body: &str,
        updated_at: DateTime<Utc>,
    ) {
        let snippet = body.chars().take(200).collect::<String>();
        pooled
            .entry(note_id.clone())
            .and_modify(|existing| {
                if score > existing.score {
                    existing.score = score;
                    existing.source = source;
                    existing.updated_at = updated_at;
                }
            })
            .or_insert(ContextItem {
                note_id,
                title: title.to_string(),
                source,
                score,
                snippet,
                updated_at,
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::NullEmbedder;
    use tempfile::TempDir;

    #[tokio::test]
    async fn dedups_by_note_id_keeping_max_score() {
        let dir = TempDir::new().unwrap();
        let store = KnowledgeStore::open(dir.path(), Box::new(NullEmbedder)).unwrap();
        store
            .create("Marie Dupont", vec![], "person", "people", vec![])
            .await
            .unwrap();

        let retriever = ContextRetriever::new(&store, ContextConfig::default());
        let items = retriever.retrieve(&["Marie".to_string(), "Dupont".to_string()], None, None);
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn drops_items_below_min_relevance() {
        let dir = TempDir::new().unwrap();
        let store = KnowledgeStore::open(dir.path(), Box::new(NullEmbedder)).unwrap();
        store
            .create("Unrelated Note", vec![], "note", "notes", vec![])
            .await
            .unwrap();

        let mut config = ContextConfig::default();
        config.min_relevance = 2.0;
        let retriever = ContextRetriever::new(&store, config);
        let items = retriever.retrieve(&["Unrelated".to_string()], None, None);
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn top_k_bounds_result_count() {
        let dir = TempDir::new().unwrap();
        let store = KnowledgeStore::open(dir.path(), Box::new(NullEmbedder)).unwrap();
        for i in 0..10 {
            store
                .create(&format!("Contact {i}"), vec![], "person", "people", vec![])
                .await
                .unwrap();
        }

        let mut config = ContextConfig::default();
        config.top_k = 3;
        config.min_relevance = 0.0;
        let retriever = ContextRetriever::new(&store, config);
        let items = retriever.retrieve(&["Contact".to_string()], None, None);
        assert_eq!(items.len(), 3);
    }
}
