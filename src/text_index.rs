//! C6 BM25Index: lexical retrieval over chunk text. Grown from the
//! teacher's tantivy wrapper (`TextIndex`): same `STRING|STORED` id field,
//! `TEXT` content field, `IndexWriter`, delete-before-add-by-term. Extended
//! with a trait so a second SQLite FTS5-backed backend can be selected via
//! config, and a shared code-aware tokenizer (camelCase/snake_case
//! splitting + stopword list).

use crate::config::Bm25Backend;
use crate::error::CoreError;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tantivy::collector::TopDocs;
use tantivy::directory::MmapDirectory;
use tantivy::query::QueryParser;
use tantivy::schema::{Field, Schema, Value, STORED, STRING, TEXT};
use tantivy::tokenizer::{Token, TokenStream, Tokenizer};
use tantivy::{Index, IndexWriter, TantivyDocument, Term};

pub trait Bm25Index: Send + Sync {
    fn add(&self, chunk_id: &str, text: &str, metadata: &serde_json::Value) -> Result<(), CoreError>;
    fn add_batch(&self, docs: &[(String, String, serde_json::Value)]) -> Result<(), CoreError> {
        for (id, text, meta) in docs {
            self.add(id, text, meta)?;
        }
        Ok(())
    }
    fn delete(&self, chunk_id: &str) -> Result<(), CoreError>;
    fn search(&self, query: &str, k: usize) -> Result<Vec<(String, f32)>, CoreError>;
    fn contains(&self, chunk_id: &str) -> Result<bool, CoreError>;
    fn doc_count(&self) -> usize;
}

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "is", "are", "was", "were", "be", "been", "being", "of",
    "to", "in", "on", "at", "by", "for", "with", "as", "it", "this", "that", "these", "those",
    "fn", "func", "def", "return", "if", "else", "for", "while", "let", "const", "var", "public",
    "private", "class", "struct", "impl",
];

/// Splits an identifier on underscores and camelCase boundaries, lowercases
/// each piece, and drops stopwords. The whole (lowercased) identifier is
/// also kept, so exact-identifier matches still score.
pub fn split_identifier(raw: &str) -> Vec<String> {
    let mut out = Vec::new();
    let lowered = raw.to_lowercase();
    if !STOPWORDS.contains(&lowered.as_str()) && !lowered.is_empty() {
        out.push(lowered);
    }

    let mut current = String::new();
    let mut pieces = Vec::new();
    let chars: Vec<char> = raw.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        if c == '_' || c == '-' {
            if !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
            }
            continue;
        }
        if c.is_uppercase() && !current.is_empty() {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).map(|n| n.is_lowercase()).unwrap_or(false);
            if prev.is_lowercase() || (prev.is_uppercase() && next_lower) {
                pieces.push(std::mem::take(&mut current));
            }
        }
        current.push(c);
    }
    if !current.is_empty() {
        pieces.push(current);
    }

    if pieces.len() > 1 {
        for piece in pieces {
            let lowered = piece.to_lowercase();
            if !STOPWORDS.contains(&lowered.as_str()) && lowered.len() > 1 && !out.contains(&lowered) {
                out.push(lowered);
            }
        }
    }
    out
}

/// Tokenizes free text by splitting on non-alphanumeric runs, then applying
/// [`split_identifier`] to each run. Shared by both backends so search
/// queries and indexed documents are tokenized identically.
pub fn tokenize_text(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if c.is_alphanumeric() || c == '_' || c == '-' {
            current.push(c);
        } else if !current.is_empty() {
            out.extend(split_identifier(&std::mem::take(&mut current)));
        }
    }
    if !current.is_empty() {
        out.extend(split_identifier(&current));
    }
    out
}

#[derive(Clone, Default)]
pub struct CodeTokenizer;

pub struct CodeTokenStream {
    tokens: Vec<Token>,
    index: usize,
}

impl Tokenizer for CodeTokenizer {
    type TokenStream<'a> = CodeTokenStream;

    fn token_stream(&mut self, text: &str) -> CodeTokenStream {
        let words = tokenize_text(text);
        let tokens = words
            .into_iter()
            .enumerate()
            .map(|(i, text)| Token {
                offset_from: 0,
                offset_to: 0,
                position: i,
                text,
                position_length: 1,
            })
            .collect();
        CodeTokenStream { tokens, index: 0 }
    }
}

impl TokenStream for CodeTokenStream {
    fn advance(&mut self) -> bool {
        if self.index < self.tokens.len() {
            self.index += 1;
            true
        } else {
            false
        }
    }

    fn token(&self) -> &Token {
        &self.tokens[self.index - 1]
    }

    fn token_mut(&mut self) -> &mut Token {
        &mut self.tokens[self.index - 1]
    }
}

/// Grown from the teacher's `TextIndex`. The id field now holds the chunk
/// id rather than a file path (a file contributes many chunks).
pub struct TantivyBm25Index {
    index: Index,
    writer: Arc<RwLock<IndexWriter>>,
    id_field: Field,
    content_field: Field,
}

impl TantivyBm25Index {
    pub fn open(path: &Path) -> Result<Self, CoreError> {
        if !path.exists() {
            std::fs::create_dir_all(path)?;
        }

        let mut schema_builder = Schema::builder();
        let id_field = schema_builder.add_text_field("chunk_id", STRING | STORED);
        let text_indexing = tantivy::schema::TextFieldIndexing::default()
            .set_tokenizer("code")
            .set_index_option(tantivy::schema::IndexRecordOption::WithFreqsAndPositions);
        let content_options = tantivy::schema::TextOptions::default().set_indexing_options(text_indexing);
        let content_field = schema_builder.add_text_field("content", content_options);
        let schema = schema_builder.build();

        let dir = MmapDirectory::open(path).map_err(|e| CoreError::StoreCorrupt(e.to_string()))?;
        let index = match Index::open_or_create(dir, schema.clone()) {
            Ok(idx) => idx,
            Err(e) => {
                tracing::warn!(error = %e, "tantivy index open failed, rebuilding empty");
                std::fs::remove_dir_all(path).ok();
                std::fs::create_dir_all(path)?;
                let dir = MmapDirectory::open(path).map_err(|e| CoreError::StoreCorrupt(e.to_string()))?;
                Index::create(dir, schema, tantivy::IndexSettings::default())
                    .map_err(|e| CoreError::StoreCorrupt(e.to_string()))?
            }
        };

        index.tokenizers().register("code", CodeTokenizer);

        let writer = index.writer(50_000_000)?;

        Ok(Self {
            index,
            writer: Arc::new(RwLock::new(writer)),
            id_field,
            content_field,
        })
    }
}

impl Bm25Index for TantivyBm25Index {
    fn add(&self, chunk_id: &str, text: &str, _metadata: &serde_json::Value) -> Result<(), CoreError> {
        let writer = self.writer.write().unwrap();
        let term = Term::from_field_text(self.id_field, chunk_id);
        writer.delete_term(term);
        writer.add_document(tantivy::doc!(
            self.id_field => chunk_id,
            self.content_field => text,
        ))?;
        Ok(())
    }

    fn add_batch(&self, docs: &[(String, String, serde_json::Value)]) -> Result<(), CoreError> {
        {
            let writer = self.writer.write().unwrap();
            for (id, text, _meta) in docs {
                let term = Term::from_field_text(self.id_field, id);
                writer.delete_term(term);
                writer.add_document(tantivy::doc!(
                    self.id_field => id.as_str(),
                    self.content_field => text.as_str(),
                ))?;
            }
        }
        self.commit()
    }

    fn delete(&self, chunk_id: &str) -> Result<(), CoreError> {
        let writer = self.writer.write().unwrap();
        let term = Term::from_field_text(self.id_field, chunk_id);
        writer.delete_term(term);
        Ok(())
    }

    fn search(&self, query_str: &str, k: usize) -> Result<Vec<(String, f32)>, CoreError> {
        let reader = self
            .index
            .reader_builder()
            .try_into()
            .map_err(|e: tantivy::TantivyError| CoreError::Tantivy(e))?;
        let searcher = reader.searcher();
        let query_parser = QueryParser::for_index(&self.index, vec![self.content_field]);

        let query = match query_parser.parse_query(query_str) {
            Ok(q) => q,
            Err(_) => return Ok(vec![]),
        };

        let top_docs = searcher.search(&query, &TopDocs::with_limit(k))?;
        let mut results = Vec::new();
        for (score, doc_address) in top_docs {
            let doc: TantivyDocument = searcher.doc(doc_address)?;
            if let Some(id) = doc.get_first(self.id_field).and_then(|v| v.as_str()) {
                results.push((id.to_string(), score));
            }
        }
        Ok(results)
    }

    fn contains(&self, chunk_id: &str) -> Result<bool, CoreError> {
        let reader = self
            .index
            .reader_builder()
            .try_into()
            .map_err(|e: tantivy::TantivyError| CoreError::Tantivy(e))?;
        let searcher = reader.searcher();
        let term = Term::from_field_text(self.id_field, chunk_id);
        let query = tantivy::query::TermQuery::new(term, tantivy::schema::IndexRecordOption::Basic);
        let top_docs = searcher.search(&query, &TopDocs::with_limit(1))?;
        Ok(!top_docs.is_empty())
    }

    fn doc_count(&self) -> usize {
        self.index
            .reader()
            .map(|r| r.searcher().num_docs() as usize)
            .unwrap_or(0)
    }
}

impl TantivyBm25Index {
    pub fn commit(&self) -> Result<(), CoreError> {
        let mut writer = self.writer.write().unwrap();
        writer.commit()?;
        Ok(())
    }
}

/// FTS5-backed alternative, sharing the metadata store's connection pool
/// when one is supplied, otherwise owning its own file at `path`.
pub struct SqliteFtsBm25Index {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteFtsBm25Index {
    pub fn open(path: &Path, pool: Option<Pool<SqliteConnectionManager>>) -> Result<Self, CoreError> {
        let pool = match pool {
            Some(p) => p,
            None => {
                let manager = SqliteConnectionManager::file(path).with_init(|conn| {
                    conn.pragma_update(None, "journal_mode", "WAL")?;
                    conn.pragma_update(None, "busy_timeout", 5_000)?;
                    Ok(())
                });
                Pool::builder().max_size(4).build(manager).map_err(CoreError::Pool)?
            }
        };

        let conn = pool.get().map_err(CoreError::Pool)?;
        let created = conn.execute_batch(
            "CREATE VIRTUAL TABLE IF NOT EXISTS bm25_docs USING fts5(chunk_id UNINDEXED, content);",
        );
        if let Err(e) = created {
            tracing::warn!(error = %e, "fts5 table creation failed, search will degrade");
        }

        let integrity: Result<String, rusqlite::Error> =
            conn.query_row("PRAGMA integrity_check", [], |r| r.get(0));
        if let Ok(status) = integrity {
            if status != "ok" {
                tracing::warn!(%status, "bm25 sqlite store failed integrity_check, rebuilding");
                conn.execute_batch("DROP TABLE IF EXISTS bm25_docs; CREATE VIRTUAL TABLE bm25_docs USING fts5(chunk_id UNINDEXED, content);").ok();
            }
        }

        Ok(Self { pool })
    }

    fn preprocess(text: &str) -> String {
        tokenize_text(text).join(" ")
    }
}

impl Bm25Index for SqliteFtsBm25Index {
    fn add(&self, chunk_id: &str, text: &str, _metadata: &serde_json::Value) -> Result<(), CoreError> {
        let conn = self.pool.get().map_err(CoreError::Pool)?;
        conn.execute("DELETE FROM bm25_docs WHERE chunk_id = ?1", params![chunk_id])
            .map_err(CoreError::Sqlite)?;
        conn.execute(
            "INSERT INTO bm25_docs (chunk_id, content) VALUES (?1, ?2)",
            params![chunk_id, Self::preprocess(text)],
        )
        .map_err(CoreError::Sqlite)?;
        Ok(())
    }

    fn delete(&self, chunk_id: &str) -> Result<(), CoreError> {
        let conn = self.pool.get().map_err(CoreError::Pool)?;
        conn.execute("DELETE FROM bm25_docs WHERE chunk_id = ?1", params![chunk_id])
            .map_err(CoreError::Sqlite)?;
        Ok(())
    }

    fn search(&self, query: &str, k: usize) -> Result<Vec<(String, f32)>, CoreError> {
        let conn = self.pool.get().map_err(CoreError::Pool)?;
        let tokens = tokenize_text(query);
        if tokens.is_empty() {
            return Ok(vec![]);
        }
        let match_query = tokens.join(" OR ");

        let mut stmt = conn
            .prepare(
                "SELECT chunk_id, bm25(bm25_docs) as rank FROM bm25_docs
                 WHERE bm25_docs MATCH ?1 ORDER BY rank LIMIT ?2",
            )
            .map_err(CoreError::Sqlite)?;
        let rows = stmt
            .query_map(params![match_query, k as i64], |r| {
                let id: String = r.get(0)?;
                let rank: f64 = r.get(1)?;
                Ok((id, -rank as f32))
            })
            .map_err(CoreError::Sqlite)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(CoreError::Sqlite)
    }

    fn contains(&self, chunk_id: &str) -> Result<bool, CoreError> {
        let conn = self.pool.get().map_err(CoreError::Pool)?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM bm25_docs WHERE chunk_id = ?1",
                params![chunk_id],
                |r| r.get(0),
            )
            .map_err(CoreError::Sqlite)?;
        Ok(count > 0)
    }

    fn doc_count(&self) -> usize {
        self.pool
            .get()
            .ok()
            .and_then(|conn| conn.query_row("SELECT COUNT(*) FROM bm25_docs", [], |r| r.get::<_, i64>(0)).ok())
            .unwrap_or(0) as usize
    }
}

pub fn open_bm25_index(
    backend: Bm25Backend,
    path: &Path,
    pool: Option<Pool<SqliteConnectionManager>>,
) -> Result<Arc<dyn Bm25Index>, CoreError> {
    match backend {
        Bm25Backend::Bleve => Ok(Arc::new(TantivyBm25Index::open(path)?)),
        Bm25Backend::Sqlite => Ok(Arc::new(SqliteFtsBm25Index::open(path, pool)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn split_identifier_handles_camel_and_snake_case() {
        assert_eq!(
            split_identifier("getUserName"),
            vec!["getusername", "get", "user", "name"]
        );
        assert_eq!(
            split_identifier("max_file_size"),
            vec!["max_file_size", "max", "file", "size"]
        );
    }

    #[test]
    fn split_identifier_drops_stopwords_but_keeps_whole_token() {
        let tokens = split_identifier("return");
        assert_eq!(tokens, vec!["return"]);
    }

    #[test]
    fn tantivy_backend_indexes_and_finds_by_subtoken() {
        let dir = tempdir().unwrap();
        let index = TantivyBm25Index::open(dir.path()).unwrap();
        index
            .add("c1", "fn getUserName() -> String { String::new() }", &serde_json::Value::Null)
            .unwrap();
        index.commit().unwrap();

        let results = index.search("user", 10).unwrap();
        assert!(results.iter().any(|(id, _)| id == "c1"));
    }

    #[test]
    fn sqlite_fts_backend_indexes_and_searches() {
        let dir = tempdir().unwrap();
        let index = SqliteFtsBm25Index::open(&dir.path().join("bm25.db"), None).unwrap();
        index
            .add("c1", "fn parse_config(path: &str) -> Config", &serde_json::Value::Null)
            .unwrap();
        let results = index.search("config", 10).unwrap();
        assert!(results.iter().any(|(id, _)| id == "c1"));
    }

    #[test]
    fn sqlite_fts_backend_delete_removes_doc() {
        let dir = tempdir().unwrap();
        let index = SqliteFtsBm25Index::open(&dir.path().join("bm25.db"), None).unwrap();
        index.add("c1", "alpha beta", &serde_json::Value::Null).unwrap();
        index.delete("c1").unwrap();
        assert_eq!(index.doc_count(), 0);
    }
}
