//! Shared data-model types for the metadata store, chunker, and search engine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Coarse content classification driving which chunker and scoring path applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Code,
    Markdown,
    Text,
    Config,
    Other,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Markdown => "markdown",
            Self::Text => "text",
            Self::Config => "config",
            Self::Other => "other",
        }
    }
}

impl std::str::FromStr for ContentType {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "code" => Self::Code,
            "markdown" => Self::Markdown,
            "text" => Self::Text,
            "config" => Self::Config,
            _ => Self::Other,
        })
    }
}

/// Kind of declaration a [`Symbol`] points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Function,
    Method,
    Class,
    Interface,
    Type,
    Struct,
    Enum,
    Trait,
    Module,
    Unknown,
}

impl SymbolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Method => "method",
            Self::Class => "class",
            Self::Interface => "interface",
            Self::Type => "type",
            Self::Struct => "struct",
            Self::Enum => "enum",
            Self::Trait => "trait",
            Self::Module => "module",
            Self::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for SymbolKind {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "function" | "func" | "fn" | "arrow" => Self::Function,
            "method" => Self::Method,
            "class" => Self::Class,
            "interface" => Self::Interface,
            "type" => Self::Type,
            "struct" => Self::Struct,
            "enum" => Self::Enum,
            "trait" => Self::Trait,
            "module" | "mod" => Self::Module,
            _ => Self::Unknown,
        })
    }
}

/// A symbol (declaration) extracted while chunking a source file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub start_line: u32,
    pub end_line: u32,
    pub signature: Option<String>,
    pub doc_comment: Option<String>,
}

/// One project: a single data directory rooted at an absolute path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub root_path: String,
    pub project_type: String,
    pub last_indexed_at: Option<i64>,
    pub file_count: u64,
    pub chunk_count: u64,
    pub schema_version: i32,
}

/// One file within a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRow {
    pub id: String,
    pub project_id: String,
    pub relative_path: String,
    pub size: u64,
    pub mtime: i64,
    pub content_hash: String,
    pub language: Option<String>,
    pub content_type: ContentType,
    pub last_indexed_at: i64,
}

/// One chunk: the unit of retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRow {
    pub id: String,
    pub file_id: String,
    pub file_path: String,
    pub enriched_content: String,
    pub raw_content: String,
    pub context: String,
    pub content_type: ContentType,
    pub language: Option<String>,
    pub start_line: u32,
    pub end_line: u32,
    pub metadata: HashMap<String, String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub embedding: Option<Vec<u8>>,
    pub embedding_model: Option<String>,
    pub embedding_dim: Option<u32>,
}

/// Stage of the indexing pipeline's state machine (see Coordinator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Scanning,
    Chunking,
    Embedding,
    Persisting,
    Complete,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scanning => "scanning",
            Self::Chunking => "chunking",
            Self::Embedding => "embedding",
            Self::Persisting => "persisting",
            Self::Complete => "complete",
        }
    }
}

impl std::str::FromStr for Stage {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "scanning" => Self::Scanning,
            "chunking" => Self::Chunking,
            "embedding" => Self::Embedding,
            "persisting" => Self::Persisting,
            "complete" => Self::Complete,
            _ => return Err(()),
        })
    }
}

/// Persisted indexing-progress record enabling resumption after a crash.
/// `files_completed` is the count of files whose chunks have been durably
/// persisted (metadata + BM25 + vector) as of `updated_at`; combined with
/// each `FileRow.content_hash`, it lets a resumed run skip every file whose
/// content is unchanged since that point instead of re-embedding it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub stage: Stage,
    pub total: u64,
    pub embedded: u64,
    pub files_completed: u64,
    pub updated_at: i64,
    pub embedder_model: String,
}

/// Computes a project id: first 16 hex chars of a blake3 hash of the
/// absolute root path. Stable across process restarts.
pub fn project_id(root_path: &str) -> String {
    let hash = blake3::hash(root_path.as_bytes());
    hash.to_hex()[..16].to_string()
}

/// Computes a file id: hash of `project_id` + relative path, salted so
/// that two files with identical relative paths in different projects
/// never collide (see SPEC_FULL §9 open question on id collisions).
pub fn file_id(project_id: &str, relative_path: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(project_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(relative_path.as_bytes());
    hasher.finalize().to_hex()[..16].to_string()
}

/// Computes a stable chunk id from the owning file id, the line range, and
/// a content digest. Stable across re-indexings as long as all three are
/// unchanged (invariant 4 in spec.md §3).
pub fn chunk_id(file_id: &str, start_line: u32, end_line: u32, content: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(file_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(start_line.to_string().as_bytes());
    hasher.update(b"\0");
    hasher.update(end_line.to_string().as_bytes());
    hasher.update(b"\0");
    hasher.update(blake3::hash(content.as_bytes()).as_bytes());
    hasher.finalize().to_hex()[..24].to_string()
}

/// Strong content hash used for change detection (invariant 3 in spec.md §3).
pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_id_is_stable_and_salted_by_path() {
        let a = project_id("/home/user/repo-a");
        let b = project_id("/home/user/repo-a");
        let c = project_id("/home/user/repo-b");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn chunk_id_changes_with_content_but_not_with_unrelated_fields() {
        let fid = file_id("proj1", "src/lib.rs");
        let c1 = chunk_id(&fid, 1, 10, "fn a() {}");
        let c2 = chunk_id(&fid, 1, 10, "fn a() {}");
        let c3 = chunk_id(&fid, 1, 10, "fn b() {}");
        assert_eq!(c1, c2);
        assert_ne!(c1, c3);
    }

    #[test]
    fn file_id_is_salted_by_project_so_identical_paths_do_not_collide() {
        let a = file_id("proj1", "src/lib.rs");
        let b = file_id("proj2", "src/lib.rs");
        assert_ne!(a, b);
    }
}
