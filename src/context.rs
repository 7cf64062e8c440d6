//! C3 ContextGenerator: produces a short natural-language preamble for a
//! chunk, stored separately from its raw content (which stays untouched for
//! BM25). No teacher equivalent — the teacher embeds raw chunk text
//! directly; this module adds the layered LLM/pattern strategy from spec.

use crate::chunk::ChunkDraft;
use std::sync::Arc;
use std::time::Duration;

pub trait ContextGenerator: Send + Sync {
    fn generate(&self, file_path: &str, doc_context: &str, chunk: &ChunkDraft) -> String;
}

/// Calls an external LLM endpoint to describe the chunk in 1-2 sentences.
/// Bounded by `timeout`; any failure is the caller's (`LayeredContextGenerator`'s)
/// problem to fall back from.
pub struct LlmContextGenerator {
    endpoint: String,
    client: reqwest::Client,
    timeout: Duration,
    max_len: usize,
}

impl LlmContextGenerator {
    pub fn new(endpoint: String, timeout: Duration, max_len: usize) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
            timeout,
            max_len,
        }
    }

    async fn generate_async(&self, file_path: &str, doc_context: &str, chunk: &ChunkDraft) -> Option<String> {
        #[derive(serde::Serialize)]
        struct Req<'a> {
            file_path: &'a str,
            doc_context: &'a str,
            content: &'a str,
        }
        #[derive(serde::Deserialize)]
        struct Resp {
            context: String,
        }

        let req = Req {
            file_path,
            doc_context,
            content: &chunk.raw_content,
        };

        let resp = tokio::time::timeout(
            self.timeout,
            self.client.post(&self.endpoint).json(&req).send(),
        )
        .await
        .ok()?
        .ok()?;

        let parsed: Resp = resp.json().await.ok()?;
        let text = parsed.context.trim();
        if text.is_empty() {
            return None;
        }
        Some(truncate(text, self.max_len))
    }
}

impl ContextGenerator for LlmContextGenerator {
    fn generate(&self, file_path: &str, doc_context: &str, chunk: &ChunkDraft) -> String {
        let handle = tokio::runtime::Handle::try_current();
        match handle {
            Ok(rt) => tokio::task::block_in_place(|| {
                rt.block_on(self.generate_async(file_path, doc_context, chunk))
            })
            .unwrap_or_default(),
            Err(_) => String::new(),
        }
    }
}

/// Infallible heuristic fallback: builds a short description from the path,
/// the language, and any symbol names the chunker found.
pub struct PatternContextGenerator;

impl ContextGenerator for PatternContextGenerator {
    fn generate(&self, file_path: &str, _doc_context: &str, chunk: &ChunkDraft) -> String {
        let symbol_desc = chunk
            .symbols
            .first()
            .map(|s| format!("defines {} `{}`", s.kind.as_str(), s.name));

        match symbol_desc {
            Some(desc) => format!("In `{file_path}`, this section {desc}."),
            None => format!(
                "Excerpt from `{file_path}`, lines {}-{}.",
                chunk.start_line, chunk.end_line
            ),
        }
    }
}

/// Used when `contextual.enabled = false`.
pub struct NoopContextGenerator;

impl ContextGenerator for NoopContextGenerator {
    fn generate(&self, _file_path: &str, _doc_context: &str, _chunk: &ChunkDraft) -> String {
        String::new()
    }
}

/// Tries `primary` first (normally the LLM strategy); on error, timeout, or
/// an empty string, falls back to `fallback` (infallible).
pub struct LayeredContextGenerator {
    pub primary: Option<Arc<dyn ContextGenerator>>,
    pub fallback: Arc<dyn ContextGenerator>,
}

impl ContextGenerator for LayeredContextGenerator {
    fn generate(&self, file_path: &str, doc_context: &str, chunk: &ChunkDraft) -> String {
        if let Some(primary) = &self.primary {
            let result = primary.generate(file_path, doc_context, chunk);
            if !result.trim().is_empty() {
                return result;
            }
        }
        self.fallback.generate(file_path, doc_context, chunk)
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        let mut end = max_len;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn draft() -> ChunkDraft {
        ChunkDraft {
            file_path: "src/lib.rs".to_string(),
            start_line: 1,
            end_line: 5,
            raw_content: "fn add() {}".to_string(),
            symbols: vec![],
            metadata: Map::new(),
        }
    }

    #[test]
    fn pattern_generator_describes_symbol_when_present() {
        let mut chunk = draft();
        chunk.symbols.push(crate::model::Symbol {
            name: "add".to_string(),
            kind: crate::model::SymbolKind::Function,
            start_line: 1,
            end_line: 5,
            signature: None,
            doc_comment: None,
        });
        let gen = PatternContextGenerator;
        let out = gen.generate("src/lib.rs", "", &chunk);
        assert!(out.contains("function"));
        assert!(out.contains("add"));
    }

    #[test]
    fn noop_generator_always_empty() {
        let gen = NoopContextGenerator;
        assert_eq!(gen.generate("x", "", &draft()), "");
    }

    #[test]
    fn layered_generator_falls_back_when_primary_empty() {
        struct AlwaysEmpty;
        impl ContextGenerator for AlwaysEmpty {
            fn generate(&self, _: &str, _: &str, _: &ChunkDraft) -> String {
                String::new()
            }
        }
        let layered = LayeredContextGenerator {
            primary: Some(Arc::new(AlwaysEmpty)),
            fallback: Arc::new(PatternContextGenerator),
        };
        let out = layered.generate("src/lib.rs", "", &draft());
        assert!(out.contains("src/lib.rs"));
    }
}
