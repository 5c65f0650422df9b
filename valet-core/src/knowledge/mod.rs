//! Knowledge Store (C3): markdown-file-backed notes, versioned history, a
//! vector index for semantic lookup, and SM-2 spaced repetition.

mod note;
mod sm2;
mod store;
mod vector_index;

pub use note::{derive_note_id, Frontmatter, LinkedSource, Note, NoteId, NoteVersion, Section};
pub use sm2::ReviewState;
pub use store::{Embedder, KnowledgeStore, NullEmbedder, LOCK_STRIPES};
pub use vector_index::VectorIndex;
