//! C5 MetadataStore: the durable relational store backing projects, files,
//! chunks, symbols, checkpoint, kv, and telemetry. Grounded on the pooled
//! rusqlite pattern used elsewhere in the pack (WAL + busy_timeout pragmas,
//! schema loaded from a `schema.sql` file, prepared statements in batch
//! transactions).

use crate::error::CoreError;
use crate::model::{Checkpoint, ChunkRow, FileRow, Project, Stage, Symbol};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

const SCHEMA: &str = include_str!("schema.sql");
const SCHEMA_VERSION: i32 = 1;

pub struct MetadataStore {
    pool: Pool<SqliteConnectionManager>,
}

fn map_sqlite(err: rusqlite::Error) -> CoreError {
    if let rusqlite::Error::SqliteFailure(e, _) = &err {
        if e.code == rusqlite::ErrorCode::DatabaseBusy || e.code == rusqlite::ErrorCode::DatabaseLocked {
            return CoreError::StoreBusy;
        }
    }
    CoreError::Sqlite(err)
}

impl MetadataStore {
    /// Opens (creating if necessary) the metadata store at `path`. Runs the
    /// schema migration and an `integrity_check` PRAGMA; a failed integrity
    /// check is logged loudly but does not refuse to open (spec: indexing
    /// aborts, serving degrades — never both at open time).
    pub fn open(path: &Path) -> Result<Self, CoreError> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "busy_timeout", 5_000)?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            Ok(())
        });
        let pool = Pool::builder().max_size(8).build(manager).map_err(CoreError::Pool)?;

        let store = Self { pool };
        store.migrate()?;
        store.check_integrity();
        Ok(store)
    }

    fn migrate(&self) -> Result<(), CoreError> {
        let conn = self.pool.get().map_err(CoreError::Pool)?;
        conn.execute_batch(SCHEMA).map_err(map_sqlite)?;
        Ok(())
    }

    fn check_integrity(&self) {
        let Ok(conn) = self.pool.get() else { return };
        let result: Result<String, rusqlite::Error> =
            conn.query_row("PRAGMA integrity_check", [], |r| r.get(0));
        match result {
            Ok(status) if status != "ok" => {
                tracing::error!(%status, "metadata store integrity_check failed");
            }
            Err(e) => tracing::error!(error = %e, "metadata store integrity_check could not run"),
            _ => {}
        }
    }

    // ---- projects ----

    pub fn save_project(&self, project: &Project) -> Result<(), CoreError> {
        let conn = self.pool.get().map_err(CoreError::Pool)?;
        conn.execute(
            "INSERT INTO projects (id, name, root_path, project_type, last_indexed_at, file_count, chunk_count, schema_version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name, root_path = excluded.root_path, project_type = excluded.project_type,
                last_indexed_at = excluded.last_indexed_at, file_count = excluded.file_count,
                chunk_count = excluded.chunk_count, schema_version = excluded.schema_version",
            params![
                project.id, project.name, project.root_path, project.project_type,
                project.last_indexed_at, project.file_count, project.chunk_count, project.schema_version
            ],
        )
        .map_err(map_sqlite)?;
        Ok(())
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>, CoreError> {
        let conn = self.pool.get().map_err(CoreError::Pool)?;
        conn.query_row(
            "SELECT id, name, root_path, project_type, last_indexed_at, file_count, chunk_count, schema_version
             FROM projects WHERE id = ?1",
            params![id],
            |r| {
                Ok(Project {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    root_path: r.get(2)?,
                    project_type: r.get(3)?,
                    last_indexed_at: r.get(4)?,
                    file_count: r.get::<_, i64>(5)? as u64,
                    chunk_count: r.get::<_, i64>(6)? as u64,
                    schema_version: r.get(7)?,
                })
            },
        )
        .optional()
        .map_err(map_sqlite)
    }

    // ---- files ----

    pub fn save_files(&self, files: &[FileRow]) -> Result<(), CoreError> {
        let mut conn = self.pool.get().map_err(CoreError::Pool)?;
        let tx = conn.transaction().map_err(map_sqlite)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO files (id, project_id, relative_path, size, mtime, content_hash, language, content_type, last_indexed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT(id) DO UPDATE SET
                        size = excluded.size, mtime = excluded.mtime, content_hash = excluded.content_hash,
                        language = excluded.language, content_type = excluded.content_type,
                        last_indexed_at = excluded.last_indexed_at",
                )
                .map_err(map_sqlite)?;
            for f in files {
                stmt.execute(params![
                    f.id, f.project_id, f.relative_path, f.size as i64, f.mtime, f.content_hash,
                    f.language, f.content_type.as_str(), f.last_indexed_at
                ])
                .map_err(map_sqlite)?;
            }
        }
        tx.commit().map_err(map_sqlite)?;
        Ok(())
    }

    /// Cursor-paginated listing of a project's files, ordered by id for a
    /// stable cursor. `cursor` is the last-seen id (exclusive), or `None`
    /// to start at the beginning. `limit` is clamped to `[1, 1000]`; a
    /// malformed or negative `cursor` is rejected rather than silently
    /// treated as "start from the beginning".
    pub fn list_files_page(
        &self,
        project_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Vec<FileRow>, CoreError> {
        let limit = limit.clamp(1, 1000);
        if let Some(c) = cursor {
            if c.is_empty() || !c.chars().all(|ch| ch.is_ascii_hexdigit()) {
                return Err(CoreError::InvalidInput(format!("invalid cursor: {c}")));
            }
        }

        let conn = self.pool.get().map_err(CoreError::Pool)?;
        let mut stmt = conn
            .prepare(
                "SELECT id, project_id, relative_path, size, mtime, content_hash, language, content_type, last_indexed_at
                 FROM files WHERE project_id = ?1 AND id > ?2 ORDER BY id LIMIT ?3",
            )
            .map_err(map_sqlite)?;
        let rows = stmt
            .query_map(params![project_id, cursor.unwrap_or(""), limit as i64], row_to_file)
            .map_err(map_sqlite)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(map_sqlite)
    }

    /// Looks up a single file by its project-relative path (the uniqueness
    /// the schema enforces via `idx_files_project_path`).
    pub fn get_file(&self, project_id: &str, relative_path: &str) -> Result<Option<FileRow>, CoreError> {
        let conn = self.pool.get().map_err(CoreError::Pool)?;
        conn.query_row(
            "SELECT id, project_id, relative_path, size, mtime, content_hash, language, content_type, last_indexed_at
             FROM files WHERE project_id = ?1 AND relative_path = ?2",
            params![project_id, relative_path],
            row_to_file,
        )
        .optional()
        .map_err(map_sqlite)
    }

    pub fn get_file_paths_under(&self, project_id: &str, prefix: &str) -> Result<Vec<String>, CoreError> {
        let conn = self.pool.get().map_err(CoreError::Pool)?;
        let mut stmt = conn
            .prepare("SELECT relative_path FROM files WHERE project_id = ?1 AND relative_path LIKE ?2")
            .map_err(map_sqlite)?;
        let pattern = format!("{prefix}%");
        let rows = stmt
            .query_map(params![project_id, pattern], |r| r.get::<_, String>(0))
            .map_err(map_sqlite)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(map_sqlite)
    }

    pub fn delete_file(&self, file_id: &str) -> Result<(), CoreError> {
        let conn = self.pool.get().map_err(CoreError::Pool)?;
        conn.execute("DELETE FROM files WHERE id = ?1", params![file_id])
            .map_err(map_sqlite)?;
        Ok(())
    }

    // ---- chunks ----

    pub fn save_chunks(&self, chunks: &[ChunkRow]) -> Result<(), CoreError> {
        let mut conn = self.pool.get().map_err(CoreError::Pool)?;
        let tx = conn.transaction().map_err(map_sqlite)?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO chunks (id, file_id, file_path, enriched_content, raw_content, context, content_type, language, start_line, end_line, metadata, created_at, updated_at, embedding, embedding_model, embedding_dim)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)
                 ON CONFLICT(id) DO UPDATE SET
                    enriched_content = excluded.enriched_content, raw_content = excluded.raw_content,
                    context = excluded.context, content_type = excluded.content_type, language = excluded.language,
                    start_line = excluded.start_line, end_line = excluded.end_line, metadata = excluded.metadata,
                    updated_at = excluded.updated_at, embedding = excluded.embedding,
                    embedding_model = excluded.embedding_model, embedding_dim = excluded.embedding_dim",
            ).map_err(map_sqlite)?;
            for c in chunks {
                let metadata_json = serde_json::to_string(&c.metadata).unwrap_or_default();
                stmt.execute(params![
                    c.id, c.file_id, c.file_path, c.enriched_content, c.raw_content, c.context,
                    c.content_type.as_str(), c.language, c.start_line, c.end_line, metadata_json,
                    c.created_at, c.updated_at, c.embedding, c.embedding_model, c.embedding_dim
                ]).map_err(map_sqlite)?;
            }
        }
        tx.commit().map_err(map_sqlite)?;
        Ok(())
    }

    pub fn save_chunk_embedding(
        &self,
        chunk_id: &str,
        embedding: &[f32],
        model: &str,
    ) -> Result<(), CoreError> {
        let conn = self.pool.get().map_err(CoreError::Pool)?;
        let bytes = embedding_to_bytes(embedding);
        conn.execute(
            "UPDATE chunks SET embedding = ?1, embedding_model = ?2, embedding_dim = ?3, updated_at = ?4 WHERE id = ?5",
            params![bytes, model, embedding.len() as i64, chrono::Utc::now().timestamp(), chunk_id],
        )
        .map_err(map_sqlite)?;
        Ok(())
    }

    pub fn get_chunks_by_ids(&self, ids: &[String]) -> Result<Vec<ChunkRow>, CoreError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let conn = self.pool.get().map_err(CoreError::Pool)?;
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT id, file_id, file_path, enriched_content, raw_content, context, content_type, language, start_line, end_line, metadata, created_at, updated_at, embedding, embedding_model, embedding_dim
             FROM chunks WHERE id IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql).map_err(map_sqlite)?;
        let params: Vec<&dyn rusqlite::ToSql> = ids.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
        let rows = stmt
            .query_map(params.as_slice(), row_to_chunk)
            .map_err(map_sqlite)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(map_sqlite)
    }

    pub fn delete_chunks_by_ids(&self, ids: &[String]) -> Result<(), CoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.pool.get().map_err(CoreError::Pool)?;
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("DELETE FROM chunks WHERE id IN ({placeholders})");
        let params: Vec<&dyn rusqlite::ToSql> = ids.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
        conn.execute(&sql, params.as_slice()).map_err(map_sqlite)?;
        Ok(())
    }

    pub fn delete_chunks_by_file(&self, file_id: &str) -> Result<Vec<String>, CoreError> {
        let conn = self.pool.get().map_err(CoreError::Pool)?;
        let mut stmt = conn
            .prepare("SELECT id FROM chunks WHERE file_id = ?1")
            .map_err(map_sqlite)?;
        let ids: Vec<String> = stmt
            .query_map(params![file_id], |r| r.get(0))
            .map_err(map_sqlite)?
            .collect::<Result<_, _>>()
            .map_err(map_sqlite)?;
        conn.execute("DELETE FROM chunks WHERE file_id = ?1", params![file_id])
            .map_err(map_sqlite)?;
        Ok(ids)
    }

    /// Streams every chunk with a stored embedding, for vector-index
    /// compaction (embeddings in metadata are the source of truth).
    pub fn all_embeddings_for_compaction(&self) -> Result<Vec<(String, Vec<f32>)>, CoreError> {
        let conn = self.pool.get().map_err(CoreError::Pool)?;
        let mut stmt = conn
            .prepare("SELECT id, embedding FROM chunks WHERE embedding IS NOT NULL")
            .map_err(map_sqlite)?;
        let rows = stmt
            .query_map([], |r| {
                let id: String = r.get(0)?;
                let bytes: Vec<u8> = r.get(1)?;
                Ok((id, bytes))
            })
            .map_err(map_sqlite)?;
        let mut out = Vec::new();
        for row in rows {
            let (id, bytes) = row.map_err(map_sqlite)?;
            out.push((id, bytes_to_embedding(&bytes)));
        }
        Ok(out)
    }

    // ---- symbols ----

    pub fn save_symbols(&self, chunk_id: &str, symbols: &[Symbol]) -> Result<(), CoreError> {
        let mut conn = self.pool.get().map_err(CoreError::Pool)?;
        let tx = conn.transaction().map_err(map_sqlite)?;
        {
            tx.execute("DELETE FROM symbols WHERE chunk_id = ?1", params![chunk_id])
                .map_err(map_sqlite)?;
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO symbols (chunk_id, name, kind, start_line, end_line, signature, doc_comment)
                     VALUES (?1,?2,?3,?4,?5,?6,?7)",
                )
                .map_err(map_sqlite)?;
            for s in symbols {
                stmt.execute(params![
                    chunk_id, s.name, s.kind.as_str(), s.start_line, s.end_line, s.signature, s.doc_comment
                ])
                .map_err(map_sqlite)?;
            }
        }
        tx.commit().map_err(map_sqlite)?;
        Ok(())
    }

    pub fn search_symbols_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<(String, Symbol)>, CoreError> {
        let conn = self.pool.get().map_err(CoreError::Pool)?;
        let mut stmt = conn
            .prepare(
                "SELECT chunk_id, name, kind, start_line, end_line, signature, doc_comment
                 FROM symbols WHERE name LIKE ?1 ORDER BY name LIMIT ?2",
            )
            .map_err(map_sqlite)?;
        let pattern = format!("{prefix}%");
        let rows = stmt
            .query_map(params![pattern, limit as i64], |r| {
                let chunk_id: String = r.get(0)?;
                let kind_str: String = r.get(2)?;
                Ok((
                    chunk_id,
                    Symbol {
                        name: r.get(1)?,
                        kind: crate::model::SymbolKind::from_str(&kind_str).unwrap_or(crate::model::SymbolKind::Unknown),
                        start_line: r.get(3)?,
                        end_line: r.get(4)?,
                        signature: r.get(5)?,
                        doc_comment: r.get(6)?,
                    },
                ))
            })
            .map_err(map_sqlite)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(map_sqlite)
    }

    /// Symbol kinds attached to each of the given chunk ids, for filtering
    /// search results by `symbol_type` without hydrating full symbol rows.
    pub fn get_symbol_kinds_for_chunks(
        &self,
        chunk_ids: &[String],
    ) -> Result<HashMap<String, Vec<crate::model::SymbolKind>>, CoreError> {
        if chunk_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.pool.get().map_err(CoreError::Pool)?;
        let placeholders = chunk_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("SELECT chunk_id, kind FROM symbols WHERE chunk_id IN ({placeholders})");
        let mut stmt = conn.prepare(&sql).map_err(map_sqlite)?;
        let params: Vec<&dyn rusqlite::ToSql> = chunk_ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
        let rows = stmt
            .query_map(params.as_slice(), |r| {
                let chunk_id: String = r.get(0)?;
                let kind_str: String = r.get(1)?;
                Ok((chunk_id, kind_str))
            })
            .map_err(map_sqlite)?;

        let mut out: HashMap<String, Vec<crate::model::SymbolKind>> = HashMap::new();
        for row in rows {
            let (chunk_id, kind_str) = row.map_err(map_sqlite)?;
            let kind = crate::model::SymbolKind::from_str(&kind_str).unwrap_or(crate::model::SymbolKind::Unknown);
            out.entry(chunk_id).or_default().push(kind);
        }
        Ok(out)
    }

    // ---- checkpoint ----

    pub fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), CoreError> {
        let conn = self.pool.get().map_err(CoreError::Pool)?;
        conn.execute(
            "INSERT INTO checkpoint (id, stage, total, embedded, files_completed, updated_at, embedder_model)
             VALUES (0, ?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                stage = excluded.stage, total = excluded.total, embedded = excluded.embedded,
                files_completed = excluded.files_completed, updated_at = excluded.updated_at,
                embedder_model = excluded.embedder_model",
            params![
                checkpoint.stage.as_str(), checkpoint.total, checkpoint.embedded,
                checkpoint.files_completed, checkpoint.updated_at, checkpoint.embedder_model
            ],
        )
        .map_err(map_sqlite)?;
        Ok(())
    }

    pub fn load_checkpoint(&self) -> Result<Option<Checkpoint>, CoreError> {
        let conn = self.pool.get().map_err(CoreError::Pool)?;
        conn.query_row(
            "SELECT stage, total, embedded, files_completed, updated_at, embedder_model FROM checkpoint WHERE id = 0",
            [],
            |r| {
                let stage_str: String = r.get(0)?;
                Ok(Checkpoint {
                    stage: Stage::from_str(&stage_str).unwrap_or(Stage::Scanning),
                    total: r.get::<_, i64>(1)? as u64,
                    embedded: r.get::<_, i64>(2)? as u64,
                    files_completed: r.get::<_, i64>(3)? as u64,
                    updated_at: r.get(4)?,
                    embedder_model: r.get(5)?,
                })
            },
        )
        .optional()
        .map_err(map_sqlite)
    }

    pub fn clear_checkpoint(&self) -> Result<(), CoreError> {
        let conn = self.pool.get().map_err(CoreError::Pool)?;
        conn.execute("DELETE FROM checkpoint WHERE id = 0", [])
            .map_err(map_sqlite)?;
        Ok(())
    }

    // ---- kv ----

    pub fn get_kv(&self, key: &str) -> Result<Option<String>, CoreError> {
        let conn = self.pool.get().map_err(CoreError::Pool)?;
        conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |r| r.get(0))
            .optional()
            .map_err(map_sqlite)
    }

    pub fn set_kv(&self, key: &str, value: &str) -> Result<(), CoreError> {
        let conn = self.pool.get().map_err(CoreError::Pool)?;
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .map_err(map_sqlite)?;
        Ok(())
    }

    // ---- telemetry ----

    pub fn record_telemetry(&self, day: &str, query_type: &str, latency_bucket: &str) -> Result<(), CoreError> {
        let conn = self.pool.get().map_err(CoreError::Pool)?;
        conn.execute(
            "INSERT INTO telemetry_daily (day, query_type, latency_bucket, count) VALUES (?1,?2,?3,1)
             ON CONFLICT(day, query_type, latency_bucket) DO UPDATE SET count = count + 1",
            params![day, query_type, latency_bucket],
        )
        .map_err(map_sqlite)?;
        Ok(())
    }

    pub fn count_chunks(&self) -> Result<usize, CoreError> {
        let conn = self.pool.get().map_err(CoreError::Pool)?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get(0))
            .map_err(map_sqlite)?;
        Ok(n as usize)
    }

    pub fn all_chunk_ids(&self) -> Result<std::collections::HashSet<String>, CoreError> {
        let conn = self.pool.get().map_err(CoreError::Pool)?;
        let mut stmt = conn.prepare("SELECT id FROM chunks").map_err(map_sqlite)?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0)).map_err(map_sqlite)?;
        rows.collect::<Result<_, _>>().map_err(map_sqlite)
    }
}

fn row_to_file(r: &rusqlite::Row) -> rusqlite::Result<FileRow> {
    let content_type_str: String = r.get(7)?;
    Ok(FileRow {
        id: r.get(0)?,
        project_id: r.get(1)?,
        relative_path: r.get(2)?,
        size: r.get::<_, i64>(3)? as u64,
        mtime: r.get(4)?,
        content_hash: r.get(5)?,
        language: r.get(6)?,
        content_type: crate::model::ContentType::from_str(&content_type_str).unwrap_or(crate::model::ContentType::Other),
        last_indexed_at: r.get(8)?,
    })
}

fn row_to_chunk(r: &rusqlite::Row) -> rusqlite::Result<ChunkRow> {
    let content_type_str: String = r.get(6)?;
    let metadata_json: String = r.get(10)?;
    let metadata: HashMap<String, String> = serde_json::from_str(&metadata_json).unwrap_or_default();
    Ok(ChunkRow {
        id: r.get(0)?,
        file_id: r.get(1)?,
        file_path: r.get(2)?,
        enriched_content: r.get(3)?,
        raw_content: r.get(4)?,
        context: r.get(5)?,
        content_type: crate::model::ContentType::from_str(&content_type_str).unwrap_or(crate::model::ContentType::Other),
        language: r.get(7)?,
        start_line: r.get(8)?,
        end_line: r.get(9)?,
        metadata,
        created_at: r.get(11)?,
        updated_at: r.get(12)?,
        embedding: r.get(13)?,
        embedding_model: r.get(14)?,
        embedding_dim: r.get(15)?,
    })
}

pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContentType, SymbolKind};
    use tempfile::tempdir;

    fn sample_project() -> Project {
        Project {
            id: "proj1".to_string(),
            name: "demo".to_string(),
            root_path: "/tmp/demo".to_string(),
            project_type: "rust".to_string(),
            last_indexed_at: None,
            file_count: 0,
            chunk_count: 0,
            schema_version: SCHEMA_VERSION,
        }
    }

    #[test]
    fn save_and_load_project_round_trips() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(&dir.path().join("meta.db")).unwrap();
        store.save_project(&sample_project()).unwrap();
        let loaded = store.get_project("proj1").unwrap().unwrap();
        assert_eq!(loaded.name, "demo");
    }

    #[test]
    fn chunk_embedding_round_trips_through_blob_encoding() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(&dir.path().join("meta.db")).unwrap();
        store.save_project(&sample_project()).unwrap();
        let file = FileRow {
            id: "file1".to_string(),
            project_id: "proj1".to_string(),
            relative_path: "src/lib.rs".to_string(),
            size: 10,
            mtime: 0,
            content_hash: "abc".to_string(),
            language: Some("rust".to_string()),
            content_type: ContentType::Code,
            last_indexed_at: 0,
        };
        store.save_files(&[file]).unwrap();

        let chunk = ChunkRow {
            id: "chunk1".to_string(),
            file_id: "file1".to_string(),
            file_path: "src/lib.rs".to_string(),
            enriched_content: "context\n\nfn a(){}".to_string(),
            raw_content: "fn a(){}".to_string(),
            context: "context".to_string(),
            content_type: ContentType::Code,
            language: Some("rust".to_string()),
            start_line: 1,
            end_line: 1,
            metadata: HashMap::new(),
            created_at: 0,
            updated_at: 0,
            embedding: None,
            embedding_model: None,
            embedding_dim: None,
        };
        store.save_chunks(&[chunk]).unwrap();
        store.save_chunk_embedding("chunk1", &[0.1, 0.2, 0.3], "hash-fallback-v1").unwrap();

        let fetched = store.get_chunks_by_ids(&["chunk1".to_string()]).unwrap();
        assert_eq!(fetched.len(), 1);
        let embedding = bytes_to_embedding(fetched[0].embedding.as_ref().unwrap());
        assert!((embedding[1] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn delete_chunks_by_file_returns_deleted_ids() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(&dir.path().join("meta.db")).unwrap();
        store.save_project(&sample_project()).unwrap();
        store
            .save_files(&[FileRow {
                id: "file1".to_string(),
                project_id: "proj1".to_string(),
                relative_path: "a.rs".to_string(),
                size: 1,
                mtime: 0,
                content_hash: "h".to_string(),
                language: None,
                content_type: ContentType::Code,
                last_indexed_at: 0,
            }])
            .unwrap();
        store
            .save_chunks(&[ChunkRow {
                id: "c1".to_string(),
                file_id: "file1".to_string(),
                file_path: "a.rs".to_string(),
                enriched_content: String::new(),
                raw_content: String::new(),
                context: String::new(),
                content_type: ContentType::Code,
                language: None,
                start_line: 1,
                end_line: 1,
                metadata: HashMap::new(),
                created_at: 0,
                updated_at: 0,
                embedding: None,
                embedding_model: None,
                embedding_dim: None,
            }])
            .unwrap();

        let deleted = store.delete_chunks_by_file("file1").unwrap();
        assert_eq!(deleted, vec!["c1".to_string()]);
        assert_eq!(store.count_chunks().unwrap(), 0);
    }

    #[test]
    fn checkpoint_round_trips_and_clears() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(&dir.path().join("meta.db")).unwrap();
        let checkpoint = Checkpoint {
            stage: Stage::Embedding,
            total: 100,
            embedded: 42,
            files_completed: 3,
            updated_at: 123,
            embedder_model: "hash-fallback-v1".to_string(),
        };
        store.save_checkpoint(&checkpoint).unwrap();
        let loaded = store.load_checkpoint().unwrap().unwrap();
        assert_eq!(loaded.embedded, 42);
        store.clear_checkpoint().unwrap();
        assert!(store.load_checkpoint().unwrap().is_none());
    }

    #[test]
    fn symbol_prefix_search_matches_name_prefix() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(&dir.path().join("meta.db")).unwrap();
        store
            .save_symbols(
                "chunk1",
                &[Symbol {
                    name: "parse_config".to_string(),
                    kind: SymbolKind::Function,
                    start_line: 1,
                    end_line: 5,
                    signature: None,
                    doc_comment: None,
                }],
            )
            .unwrap();
        let results = store.search_symbols_prefix("parse", 10).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1.name, "parse_config");
    }
}
