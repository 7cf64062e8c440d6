//! C2 Chunker: turns one scanned file's content into retrieval-sized
//! [`ChunkDraft`]s, dispatching to a language-aware splitter.

pub mod code;
pub mod markdown;

use crate::model::{ContentType, Symbol};
use serde_json::{Map, Value};

/// One chunk before context generation / embedding / persistence.
#[derive(Debug, Clone)]
pub struct ChunkDraft {
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub raw_content: String,
    pub symbols: Vec<Symbol>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkOptions {
    pub max_lines: usize,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self { max_lines: 120 }
    }
}

/// Chunks one file's content according to its detected content type and
/// language. Never fails: anything that isn't markdown and has no
/// tree-sitter grammar falls back to fixed-size windows with overlap.
pub fn chunk_file(
    relative_path: &str,
    content: &str,
    language: Option<&str>,
    content_type: ContentType,
    options: ChunkOptions,
) -> Vec<ChunkDraft> {
    match content_type {
        ContentType::Markdown => markdown::chunk_markdown(relative_path, content, options),
        _ => code::chunk_code(relative_path, content, language, options),
    }
}
