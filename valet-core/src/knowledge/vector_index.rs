//! File-backed flat vector index with a sidecar id→offset map.
//!
//! Rebuilt by re-embedding the full note corpus and atomically swapped in
//! (write to a temp file, then rename) so readers never observe a
//! partially-written index.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::note::NoteId;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    id: NoteId,
    vector: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct OffsetMap {
    /// Index into the flat `entries` vector, by note id.
    offsets: HashMap<NoteId, usize>,
}

/// An in-memory flat index, backed by a `.bin` file plus a `.offsets` sidecar.
pub struct VectorIndex {
    entries: Vec<StoredEntry>,
    offsets: OffsetMap,
    data_path: PathBuf,
    offsets_path: PathBuf,
}

impl VectorIndex {
    /// Open an index at `path`, loading it if present, or starting empty.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let data_path = path.as_ref().to_path_buf();
        let offsets_path = sidecar_path(&data_path);

        if data_path.exists() {
            let bytes = std::fs::read(&data_path)
                .map_err(|e| Error::Storage(format!("reading vector index: {e}")))?;
            let entries: Vec<StoredEntry> = bincode::deserialize(&bytes)
                .map_err(|e| Error::Storage(format!("decoding vector index: {e}")))?;
            let offsets = if offsets_path.exists() {
                let offset_bytes = std::fs::read(&offsets_path)
                    .map_err(|e| Error::Storage(format!("reading offset map: {e}")))?;
                bincode::deserialize(&offset_bytes)
                    .map_err(|e| Error::Storage(format!("decoding offset map: {e}")))?
            } else {
                rebuild_offsets(&entries)
            };
            Ok(Self {
                entries,
                offsets,
                data_path,
                offsets_path,
            })
        } else {
            Ok(Self {
                entries: Vec::new(),
                offsets: OffsetMap::default(),
                data_path,
                offsets_path,
            })
        }
    }

    pub fn get(&self, id: &str) -> Option<&[f32]> {
        self.offsets
            .offsets
            .get(id)
            .and_then(|&idx| self.entries.get(idx))
            .map(|e| e.vector.as_slice())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace the entire index contents (a rebuild from the full note
    /// corpus) and atomically persist it.
    pub fn rebuild(&mut self, entries: Vec<(NoteId, Vec<f32>)>) -> Result<()> {
        let stored: Vec<StoredEntry> = entries
            .into_iter()
            .map(|(id, vector)| StoredEntry { id, vector })
            .collect();
        let offsets = rebuild_offsets(&stored);

        atomic_write(&self.data_path, &bincode::serialize(&stored).map_err(|e| {
            Error::Storage(format!("encoding vector index: {e}"))
        })?)?;
        atomic_write(
            &self.offsets_path,
            &bincode::serialize(&offsets)
                .map_err(|e| Error::Storage(format!("encoding offset map: {e}")))?,
        )?;

        self.entries = stored;
        self.offsets = offsets;
        Ok(())
    }

    /// Cosine-similarity nearest neighbors, most similar first.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(NoteId, f32)> {
        let mut scored: Vec<(NoteId, f32)> = self
            .entries
            .iter()
            .map(|e| (e.id.clone(), cosine_similarity(query, &e.vector)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }
}

fn sidecar_path(data_path: &Path) -> PathBuf {
    let mut offsets_path = data_path.to_path_buf();
    offsets_path.set_extension("offsets");
    offsets_path
}

fn rebuild_offsets(entries: &[StoredEntry]) -> OffsetMap {
    let offsets = entries
        .iter()
        .enumerate()
        .map(|(idx, e)| (e.id.clone(), idx))
        .collect();
    OffsetMap { offsets }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::Storage(format!("creating index directory: {e}")))?;
    }
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp_path)
            .map_err(|e| Error::Storage(format!("creating temp index file: {e}")))?;
        file.write_all(bytes)
            .map_err(|e| Error::Storage(format!("writing temp index file: {e}")))?;
    }
    std::fs::rename(&tmp_path, path)
        .map_err(|e| Error::Storage(format!("swapping index file: {e}")))?;
    Ok(())
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
