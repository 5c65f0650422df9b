//! `KnowledgeStore` (C3): file-backed notes with versioned history, a
//! tokenized full-text index, and a semantic vector index.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::Utc;

use super::note::{derive_note_id, Frontmatter, LinkedSource, Note, NoteId, NoteVersion, Section};
use super::sm2::{self, ReviewState};
use super::vector_index::VectorIndex;
use crate::error::{Error, Result};
use crate::striped_lock::StripedLock;

/// Stripe count for per-note-id write serialization (spec.md §5).
pub const LOCK_STRIPES: usize = 64;

/// Embedder capability, injected so the store itself stays provider-agnostic.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// A no-op embedder for tests and for callers that only need text search.
pub struct NullEmbedder;
impl Embedder for NullEmbedder {
    fn embed(&self, _text: &str) -> Vec<f32> {
        Vec::new()
    }
}

struct InMemoryIndex {
    /// token -> note ids containing it
    inverted: HashMap<String, Vec<NoteId>>,
    /// note id -> its current Note (soft-deleted notes remain present but
    /// are filtered out of search results)
    notes: HashMap<NoteId, Note>,
    /// note id -> folder-relative path, so rename-in-place stays possible
    folder: HashMap<NoteId, String>,
}

impl InMemoryIndex {
    fn new() -> Self {
        Self {
            inverted: HashMap::new(),
            notes: HashMap::new(),
            folder: HashMap::new(),
        }
    }

    fn tokenize(text: &str) -> Vec<String> {
        text.to_ascii_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect()
    }

    fn index_note(&mut self, note: &Note) {
        self.remove_from_inverted(note.id());
        let text = format!("{} {}", note.frontmatter.title, note.body());
        for token in Self::tokenize(&text) {
            let bucket = self.inverted.entry(token).or_default();
            if !bucket.contains(note.id()) {
                bucket.push(note.id().clone());
            }
        }
        self.folder.insert(note.id().clone(), note.folder.clone());
        self.notes.insert(note.id().clone(), note.clone());
    }

    fn remove_from_inverted(&mut self, id: &NoteId) {
        for bucket in self.inverted.values_mut() {
            bucket.retain(|existing| existing != id);
        }
    }

    fn search_text(&self, query: &str, k: usize) -> Vec<(NoteId, f32)> {
        let tokens = Self::tokenize(query);
        if tokens.is_empty() {
            return Vec::new();
        }
        let mut scores: HashMap<NoteId, f32> = HashMap::new();
        for token in &tokens {
            if let Some(bucket) = self.inverted.get(token) {
                for id in bucket {
                    if self.notes.get(id).map(|n| n.frontmatter.deleted) == Some(false) {
                        *scores.entry(id.clone()).or_insert(0.0) += 1.0;
                    }
                }
            }
        }
        let total_tokens = tokens.len() as f32;
        let mut ranked: Vec<(NoteId, f32)> = scores
            .into_iter()
            .map(|(id, hits)| (id, (hits / total_tokens).min(1.0)))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(k);
        ranked
    }

    fn by_entity(&self, entity: &str, k: usize) -> Vec<(NoteId, f32)> {
        self.search_text(entity, k)
    }
}

/// Markdown-file-backed notes, versioned history, semantic index, and SM-2
/// review scheduling. Writes are serialized per note id via [`StripedLock`];
/// the in-memory index and the semantic index are kept consistent with the
/// canonical on-disk store on every write.
pub struct KnowledgeStore {
    root: PathBuf,
    locks: StripedLock,
    index: RwLock<InMemoryIndex>,
    vector_index: RwLock<VectorIndex>,
    embedder: Box<dyn Embedder>,
}

impl KnowledgeStore {
    /// Open (or initialize) a store rooted at `root`. Loads every existing
    /// note under `root` (excluding `.history/`) into the in-memory index.
    pub fn open(root: impl AsRef<Path>, embedder: Box<dyn Embedder>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)
            .map_err(|e| Error::Storage(format!("creating knowledge root: {e}")))?;

        let vector_index = VectorIndex::open(root.join(".vector_index.bin"))?;
        let mut index = InMemoryIndex::new();

        for entry in walk_markdown_files(&root)? {
            let contents = std::fs::read_to_string(&entry)
                .map_err(|e| Error::Storage(format!("reading note {}: {e}", entry.display())))?;
            let folder = entry
                .parent()
                .and_then(|p| p.strip_prefix(&root).ok())
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default();
            let mut note = Note::from_file_contents(&folder, &contents)?;
            if let Some(vec) = vector_index.get(note.id()) {
                note.embedding = vec.to_vec();
            }
            index.index_note(&note);
        }

        Ok(Self {
            root,
            locks: StripedLock::new(LOCK_STRIPES),
            index: RwLock::new(index),
            vector_index: RwLock::new(vector_index),
            embedder,
        })
    }

    fn note_path(&self, note: &Note) -> PathBuf {
        self.root.join(&note.folder).join(format!("{}.md", note.id()))
    }

    fn history_dir(&self, id: &NoteId) -> PathBuf {
        self.root.join(".history").join(id)
    }

    fn write_note_to_disk(&self, note: &Note) -> Result<()> {
        let path = self.note_path(note);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("creating note directory: {e}")))?;
        }
        std::fs::write(&path, note.to_file_contents()?)
            .map_err(|e| Error::Storage(format!("writing note {}: {e}", path.display())))
    }

    fn append_version(&self, note: &Note, version: u32) -> Result<()> {
        let dir = self.history_dir(note.id());
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::Storage(format!("creating history directory: {e}")))?;
        let path = dir.join(format!("{version}.md"));
        std::fs::write(&path, note.to_file_contents()?)
            .map_err(|e| Error::Storage(format!("writing version {version}: {e}")))
    }

    pub fn get(&self, id: &str) -> Option<Note> {
        let index = self.index.read().expect("knowledge index lock poisoned");
        index
            .notes
            .get(id)
            .filter(|n| !n.frontmatter.deleted)
            .cloned()
    }

    pub fn search_text(&self, query: &str, k: usize) -> Vec<(Note, f32)> {
        let index = self.index.read().expect("knowledge index lock poisoned");
        index
            .search_text(query, k)
            .into_iter()
            .filter_map(|(id, score)| index.notes.get(&id).map(|n| (n.clone(), score)))
            .collect()
    }

    pub fn search_semantic(&self, vector: &[f32], k: usize) -> Vec<(Note, f32)> {
        if vector.is_empty() {
            return Vec::new();
        }
        let vector_index = self
            .vector_index
            .read()
            .expect("vector index lock poisoned");
        let index = self.index.read().expect("knowledge index lock poisoned");
        vector_index
            .search(vector, k)
            .into_iter()
            .filter_map(|(id, score)| {
                index
                    .notes
                    .get(&id)
                    .filter(|n| !n.frontmatter.deleted)
                    .map(|n| (n.clone(), score))
            })
            .collect()
    }

    pub fn by_entity(&self, entity: &str, k: usize) -> Vec<(Note, f32)> {
        let index = self.index.read().expect("knowledge index lock poisoned");
        index
            .by_entity(entity, k)
            .into_iter()
            .filter_map(|(id, score)| index.notes.get(&id).map(|n| (n.clone(), score)))
            .collect()
    }

    /// Create a new note. Always version 1.
    pub async fn create(
        &self,
        title: &str,
        sections: Vec<Section>,
        note_type: &str,
        folder: &str,
        linked_sources: Vec<LinkedSource>,
    ) -> Result<Note> {
        let now = Utc::now();
        let id = derive_note_id(title, now);
        let _guard = self.locks.lock(&id).await;

        let embedding = self.embedder.embed(&format!(
            "{title} {}",
            sections
                .iter()
                .map(|s| s.content.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        ));

        let note = Note {
            frontmatter: Frontmatter {
                id: id.clone(),
                title: title.to_string(),
                note_type: note_type.to_string(),
                tags: Vec::new(),
                linked_sources,
                created_at: now,
                updated_at: now,
                review: ReviewState::default(),
                deleted: false,
            },
            folder: folder.to_string(),
            sections,
            embedding,
        };

        self.write_note_to_disk(&note)?;
        self.append_version(&note, 1)?;
        self.reindex_one(&note)?;

        Ok(note)
    }

    /// Apply an edit, producing a new immutable version.
    pub async fn update(&self, id: &str, edit: impl FnOnce(&mut Note)) -> Result<Note> {
        let id = id.to_string();
        let _guard = self.locks.lock(&id).await;

        let mut note = self
            .get(&id)
            .ok_or_else(|| Error::NoteConflict {
                note_id: id.clone(),
                reason: "note not found".to_string(),
            })?;

        edit(&mut note);
        note.frontmatter.updated_at = Utc::now();
        note.embedding = self.embedder.embed(&format!(
            "{} {}",
            note.frontmatter.title,
            note.body()
        ));

        let next_version = self.list_versions(&id).len() as u32 + 1;
        self.write_note_to_disk(&note)?;
        self.append_version(&note, next_version)?;
        self.reindex_one(&note)?;

        Ok(note)
    }

    pub fn list_versions(&self, id: &str) -> Vec<u32> {
        let dir = self.history_dir(&id.to_string());
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut versions: Vec<u32> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                e.path()
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<u32>().ok())
            })
            .collect();
        versions.sort_unstable();
        versions
    }

    fn load_version(&self, id: &str, version: u32) -> Result<Note> {
        let path = self.history_dir(&id.to_string()).join(format!("{version}.md"));
        let contents = std::fs::read_to_string(&path)
            .map_err(|_| Error::NoteConflict {
                note_id: id.to_string(),
                reason: format!("version {version} not found"),
            })?;
        let folder = self.get(id).map(|n| n.folder).unwrap_or_default();
        Note::from_file_contents(&folder, &contents)
    }

    pub fn diff(&self, id: &str, v1: u32, v2: u32) -> Result<(NoteVersion, NoteVersion)> {
        let note1 = self.load_version(id, v1)?;
        let note2 = self.load_version(id, v2)?;
        Ok((
            NoteVersion {
                version: v1,
                note: note1,
                recorded_at: Utc::now(),
            },
            NoteVersion {
                version: v2,
                note: note2,
                recorded_at: Utc::now(),
            },
        ))
    }

    /// Restore version `v` as the current content, appending a new version
    /// rather than rewriting history (invariant (d): never loses a version).
    pub async fn restore(&self, id: &str, v: u32) -> Result<Note> {
        let restored = self.load_version(id, v)?;
        self.update(id, |note| {
            note.sections = restored.sections.clone();
            note.frontmatter.title = restored.frontmatter.title.clone();
        })
        .await
    }

    pub async fn record_review(&self, id: &str, quality: u8) -> Result<ReviewState> {
        let now = Utc::now();
        let note = self
            .update(id, move |note| {
                note.frontmatter.review = sm2::update(note.frontmatter.review, quality, now);
            })
            .await?;
        Ok(note.frontmatter.review)
    }

    pub fn list_due(&self) -> Vec<Note> {
        let now = Utc::now();
        let index = self.index.read().expect("knowledge index lock poisoned");
        index
            .notes
            .values()
            .filter(|n| !n.frontmatter.deleted && n.frontmatter.review.next_review <= now)
            .cloned()
            .collect()
    }

    /// Soft-delete: flips a flag, never removes the file or its history
    /// (invariant (d)). Excluded from all subsequent search results.
    pub async fn soft_delete(&self, id: &str) -> Result<()> {
        self.update(id, |note| note.frontmatter.deleted = true)
            .await?;
        Ok(())
    }

    fn reindex_one(&self, note: &Note) -> Result<()> {
        {
            let mut index = self.index.write().expect("knowledge index lock poisoned");
            index.index_note(note);
        }
        if !note.embedding.is_empty() {
            let entries = {
                let index = self.index.read().expect("knowledge index lock poisoned");
                index
                    .notes
                    .values()
                    .map(|n| (n.id().clone(), n.embedding.clone()))
                    .collect()
            };
            let mut vector_index = self
                .vector_index
                .write()
                .expect("vector index lock poisoned");
            vector_index.rebuild(entries)?;
        }
        Ok(())
    }
}

fn walk_markdown_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_dir() {
                if path.file_name().and_then(|n| n.to_str()) == Some(".history") {
                    continue;
                }
                stack.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some("md") {
                out.push(path);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn new_store(dir: &TempDir) -> KnowledgeStore {
        KnowledgeStore::open(dir.path(), Box::new(NullEmbedder)).unwrap()
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        let note = store
            .create(
                "Budget Q1",
                vec![Section {
                    header: "## Events".to_string(),
                    content: String::new(),
                }],
                "project",
                "projects",
                vec![],
            )
            .await
            .unwrap();

        let fetched = store.get(note.id()).unwrap();
        assert_eq!(fetched.frontmatter.title, "Budget Q1");
    }

    #[tokio::test]
    async fn update_creates_new_version_and_history_is_never_pruned() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        let note = store
            .create("Meeting Notes", vec![], "note", "notes", vec![])
            .await
            .unwrap();

        store
            .update(note.id(), |n| {
                n.sections.push(Section {
                    header: "## History".to_string(),
                    content: "- first entry".to_string(),
                })
            })
            .await
            .unwrap();

        let versions = store.list_versions(note.id());
        assert_eq!(versions, vec![1, 2]);
    }

    #[tokio::test]
    async fn restore_recovers_prior_version_content() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        let note = store
            .create("Project X", vec![], "project", "projects", vec![])
            .await
            .unwrap();

        store
            .update(note.id(), |n| n.frontmatter.title = "Renamed".to_string())
            .await
            .unwrap();

        let restored = store.restore(note.id(), 1).await.unwrap();
        assert_eq!(restored.frontmatter.title, "Project X");
    }

    #[tokio::test]
    async fn soft_deleted_notes_excluded_from_search() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        let note = store
            .create("Spam Note", vec![], "note", "notes", vec![])
            .await
            .unwrap();

        store.soft_delete(note.id()).await.unwrap();

        assert!(store.get(note.id()).is_none());
        assert!(store.search_text("Spam", 5).is_empty());
    }

    #[tokio::test]
    async fn record_review_advances_next_review_into_the_future() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        let note = store
            .create("Flashcard", vec![], "note", "notes", vec![])
            .await
            .unwrap();

        let review = store.record_review(note.id(), 5).await.unwrap();
        assert!(review.next_review > Utc::now());
    }

    #[tokio::test]
    async fn search_text_finds_note_by_title_token() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir);
        store
            .create("Marie Dupont", vec![], "person", "people", vec![])
            .await
            .unwrap();

        let results = store.search_text("Marie", 5);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.frontmatter.title, "Marie Dupont");
    }
}
