//! The file-backed `Note` type and its YAML frontmatter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::sm2::ReviewState;

/// A note's canonical id: a stable slug plus a short hash suffix, so two
/// notes titled identically never collide. Never changes after creation.
pub type NoteId = String;

pub fn derive_note_id(title: &str, created_at: DateTime<Utc>) -> NoteId {
    let slug: String = title
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    let slug = slug.trim_matches('-').to_string();

    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(created_at.to_rfc3339().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{slug}-{}", &digest[..8])
}

/// A typed pointer into an external store, declared by a note so that
/// cross-source search (C5) can seed adapter-specific filters from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedSource {
    pub source: String,
    /// Adapter-specific filter value (folder path, chat name, sender filter).
    pub filter: String,
}

/// Frontmatter persisted as YAML at the top of the note's markdown file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frontmatter {
    pub id: NoteId,
    pub title: String,
    pub note_type: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub linked_sources: Vec<LinkedSource>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub review: ReviewState,
    #[serde(default)]
    pub deleted: bool,
}

/// A header-delimited section of a note's body, e.g. `## History`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub header: String,
    pub content: String,
}

/// A fully materialized note: frontmatter, folder path, body sections, and
/// the embedding used for semantic search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub frontmatter: Frontmatter,
    pub folder: String,
    pub sections: Vec<Section>,
    pub embedding: Vec<f32>,
}

impl Note {
    pub fn id(&self) -> &NoteId {
        &self.frontmatter.id
    }

    pub fn body(&self) -> String {
        self.sections
            .iter()
            .map(|s| format!("{}\n{}", s.header, s.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn section_mut(&mut self, header: &str) -> Option<&mut Section> {
        self.sections.iter_mut().find(|s| s.header == header)
    }

    /// Render the note to its on-disk representation: YAML frontmatter
    /// fenced by `---`, followed by the markdown body.
    pub fn to_file_contents(&self) -> crate::error::Result<String> {
        let yaml = serde_yml::to_string(&self.frontmatter)
            .map_err(|e| crate::error::Error::Storage(format!("serializing frontmatter: {e}")))?;
        Ok(format!("---\n{yaml}---\n\n{}\n", self.body()))
    }

    pub fn from_file_contents(folder: &str, contents: &str) -> crate::error::Result<Self> {
        let rest = contents
            .strip_prefix("---\n")
            .ok_or_else(|| crate::error::Error::Storage("missing frontmatter fence".to_string()))?;
        let end = rest
            .find("\n---\n")
            .ok_or_else(|| crate::error::Error::Storage("unterminated frontmatter".to_string()))?;
        let yaml = &rest[..end + 1];
        let body = &rest[end + 5..];

        let frontmatter: Frontmatter = serde_yml::from_str(yaml)
            .map_err(|e| crate::error::Error::Storage(format!("parsing frontmatter: {e}")))?;

        let sections = parse_sections(body.trim());

        Ok(Note {
            frontmatter,
            folder: folder.to_string(),
            sections,
            embedding: Vec::new(),
        })
    }
}

fn parse_sections(body: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut current_header: Option<String> = None;
    let mut current_content = String::new();

    for line in body.lines() {
        if line.starts_with("## ") {
            if let Some(header) = current_header.take() {
                sections.push(Section {
                    header,
                    content: current_content.trim().to_string(),
                });
                current_content = String::new();
            }
            current_header = Some(line.to_string());
        } else {
            current_content.push_str(line);
            current_content.push('\n');
        }
    }
    if let Some(header) = current_header {
        sections.push(Section {
            header,
            content: current_content.trim().to_string(),
        });
    }
    sections
}

/// One immutable revision in a note's append-only history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteVersion {
    pub version: u32,
    pub note: Note,
    pub recorded_at: DateTime<Utc>,
}
