//! C8 Coordinator: the indexing state machine. Generalizes the teacher's
//! `Searcher::search` (scan → diff mtimes → batch-embed → upsert → cleanup,
//! inlined in one method) into the full scan/chunk/embed/persist pipeline
//! with checkpointing, incremental updates, and startup reconciliation.

use crate::chunk::{self, ChunkOptions};
use crate::consistency::ConsistencyChecker;
use crate::context::ContextGenerator;
use crate::embedding::Embedder;
use crate::error::CoreError;
use crate::model::{self, ChunkRow, Checkpoint, FileRow, Project, Stage};
use crate::scanner::{self, CancellationToken as ScanCancellationToken, ScanOptions};
use crate::store::MetadataStore;
use crate::text_index::Bm25Index;
use crate::vector_index::VectorIndex;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize)]
pub struct IndexSummary {
    pub files_scanned: usize,
    pub files_indexed: usize,
    pub files_removed: usize,
    pub chunks_indexed: usize,
    pub files_skipped: usize,
}

#[derive(Debug, Clone)]
pub enum WatchEvent {
    Created(String),
    Modified(String),
    Removed(String),
}

#[derive(Debug, Default)]
pub struct ReconciliationReport {
    pub gitignore_removed: usize,
    pub files_reconciled: usize,
    pub inconsistencies_repaired: usize,
    pub errors: Vec<String>,
}

pub struct Coordinator {
    pub metadata: Arc<MetadataStore>,
    pub bm25: Arc<dyn Bm25Index>,
    pub vectors: Arc<VectorIndex>,
    pub embedder: Arc<dyn Embedder>,
    pub context_gen: Arc<dyn ContextGenerator>,
    pub batch_size: usize,
}

impl Coordinator {
    pub fn new(
        metadata: Arc<MetadataStore>,
        bm25: Arc<dyn Bm25Index>,
        vectors: Arc<VectorIndex>,
        embedder: Arc<dyn Embedder>,
        context_gen: Arc<dyn ContextGenerator>,
    ) -> Self {
        Self {
            metadata,
            bm25,
            vectors,
            embedder,
            context_gen,
            batch_size: 32,
        }
    }

    /// Runs the full Scanning → Chunking → Embedding → Persisting pipeline,
    /// checkpointing every `batch_size` chunks so a crash can resume. Resuming
    /// is driven by content hashes rather than a replayed chunk offset: a
    /// file whose `FileRow` was durably written on a prior run is skipped
    /// outright, so a restart picks back up at the first file that wasn't
    /// fully flushed before the crash.
    pub async fn full_index(
        &self,
        root: &Path,
        scan_options: &ScanOptions,
        cancel: &CancellationToken,
    ) -> Result<IndexSummary, CoreError> {
        let project_id = model::project_id(&root.to_string_lossy());

        if let Some(checkpoint) = self.metadata.load_checkpoint()? {
            if checkpoint.stage != Stage::Complete && checkpoint.embedder_model != self.embedder.model_name() {
                return Err(CoreError::CheckpointIncomplete);
            }
        }

        self.metadata.save_checkpoint(&Checkpoint {
            stage: Stage::Scanning,
            total: 0,
            embedded: 0,
            files_completed: 0,
            updated_at: now(),
            embedder_model: self.embedder.model_name().to_string(),
        })?;

        let scan_cancel = ScanCancellationToken::new();
        let rx = scanner::scan(root, scan_options.clone(), scan_cancel.clone())
            .map_err(|e| CoreError::InvalidInput(e.to_string()))?;

        let mut records = Vec::new();
        while let Ok(record) = rx.recv() {
            if cancel.is_cancelled() {
                scan_cancel.cancel();
                return Err(CoreError::Cancelled);
            }
            records.push(record);
        }

        let files_scanned = records.len();
        let mut files_skipped = 0usize;
        let mut seen_paths = HashSet::new();
        let mut drafts_by_file = Vec::new();

        self.metadata.save_checkpoint(&Checkpoint {
            stage: Stage::Chunking,
            total: files_scanned as u64,
            embedded: 0,
            files_completed: 0,
            updated_at: now(),
            embedder_model: self.embedder.model_name().to_string(),
        })?;

        // Step 1 of the incremental contract: a file whose content hash
        // matches what's already durably recorded is a no-op — it is never
        // re-chunked, re-embedded, or re-persisted. `FileRow`s are only
        // written once their chunks are fully flushed (see the persist loop
        // below), so a hash match here also proves the file's chunks are
        // intact, even across a crash mid-run.
        for record in &records {
            seen_paths.insert(record.relative_path.clone());
            if record.is_skipped() {
                files_skipped += 1;
                continue;
            }
            let full_path = root.join(&record.relative_path);
            let Ok(content) = std::fs::read_to_string(&full_path) else {
                files_skipped += 1;
                continue;
            };
            let content_hash = model::content_hash(content.as_bytes());
            if let Some(existing) = self.metadata.get_file(&project_id, &record.relative_path)? {
                if existing.content_hash == content_hash {
                    files_skipped += 1;
                    continue;
                }
            }
            let drafts = chunk::chunk_file(
                &record.relative_path,
                &content,
                record.language.as_deref(),
                record.content_type,
                ChunkOptions::default(),
            );
            drafts_by_file.push((record.clone(), content, content_hash, drafts));
        }

        let project = Project {
            id: project_id.clone(),
            name: root
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| project_id.clone()),
            root_path: root.to_string_lossy().to_string(),
            project_type: "unknown".to_string(),
            last_indexed_at: Some(now()),
            file_count: drafts_by_file.len() as u64,
            chunk_count: drafts_by_file.iter().map(|(_, _, _, d)| d.len() as u64).sum(),
            schema_version: 1,
        };
        self.metadata.save_project(&project)?;

        let mut chunks_indexed = 0usize;
        let mut files_completed = 0usize;
        let mut pending = Vec::new();
        let mut pending_files: Vec<FileRow> = Vec::new();

        self.metadata.save_checkpoint(&Checkpoint {
            stage: Stage::Embedding,
            total: drafts_by_file.iter().map(|(_, _, _, d)| d.len() as u64).sum(),
            embedded: 0,
            files_completed: 0,
            updated_at: now(),
            embedder_model: self.embedder.model_name().to_string(),
        })?;

        for (record, _content, content_hash, drafts) in &drafts_by_file {
            let file_id = model::file_id(&project_id, &record.relative_path);

            for draft in drafts {
                let context = self.context_gen.generate(&record.relative_path, "", draft);
                let chunk_id = model::chunk_id(&file_id, draft.start_line, draft.end_line, &draft.raw_content);
                let enriched = if context.is_empty() {
                    draft.raw_content.clone()
                } else {
                    format!("{context}\n\n{}", draft.raw_content)
                };

                pending.push((
                    ChunkRow {
                        id: chunk_id,
                        file_id: file_id.clone(),
                        file_path: draft.file_path.clone(),
                        enriched_content: enriched,
                        raw_content: draft.raw_content.clone(),
                        context,
                        content_type: record.content_type,
                        language: record.language.clone(),
                        start_line: draft.start_line,
                        end_line: draft.end_line,
                        metadata: draft
                            .metadata
                            .iter()
                            .map(|(k, v)| (k.clone(), v.to_string()))
                            .collect(),
                        created_at: now(),
                        updated_at: now(),
                        embedding: None,
                        embedding_model: None,
                        embedding_dim: None,
                    },
                    draft.symbols.clone(),
                ));
            }

            // The `FileRow` (and its content hash) is only queued for
            // writing once every one of its drafts is queued for persisting
            // in the same flush, so a crash never leaves a file "marked
            // done" with missing chunks.
            pending_files.push(FileRow {
                id: file_id,
                project_id: project_id.clone(),
                relative_path: record.relative_path.clone(),
                size: record.size,
                mtime: record.mtime,
                content_hash: content_hash.clone(),
                language: record.language.clone(),
                content_type: record.content_type,
                last_indexed_at: now(),
            });

            if pending.len() >= self.batch_size {
                chunks_indexed += self.persist_batch(&mut pending).await?;
                self.metadata.save_files(&pending_files)?;
                files_completed += pending_files.len();
                pending_files.clear();
                self.metadata.save_checkpoint(&Checkpoint {
                    stage: Stage::Embedding,
                    total: project.chunk_count,
                    embedded: chunks_indexed as u64,
                    files_completed: files_completed as u64,
                    updated_at: now(),
                    embedder_model: self.embedder.model_name().to_string(),
                })?;
                if cancel.is_cancelled() {
                    return Err(CoreError::Cancelled);
                }
            }
        }

        if !pending.is_empty() {
            chunks_indexed += self.persist_batch(&mut pending).await?;
        }
        if !pending_files.is_empty() {
            self.metadata.save_files(&pending_files)?;
            files_completed += pending_files.len();
        }

        // Remove files that vanished from the scan.
        let known_paths = self.metadata.get_file_paths_under(&project_id, "")?;
        let mut files_removed = 0;
        for path in known_paths {
            if !seen_paths.contains(&path) {
                let file_id = model::file_id(&project_id, &path);
                let chunk_ids = self.metadata.delete_chunks_by_file(&file_id)?;
                for id in &chunk_ids {
                    self.bm25.delete(id)?;
                    self.vectors.delete(id);
                }
                self.metadata.delete_file(&file_id)?;
                files_removed += 1;
            }
        }

        self.metadata.save_checkpoint(&Checkpoint {
            stage: Stage::Complete,
            total: project.chunk_count,
            embedded: chunks_indexed as u64,
            files_completed: files_completed as u64,
            updated_at: now(),
            embedder_model: self.embedder.model_name().to_string(),
        })?;

        Ok(IndexSummary {
            files_scanned,
            files_indexed: drafts_by_file.len(),
            files_removed,
            chunks_indexed,
            files_skipped,
        })
    }

    /// Embeds, and stores in metadata → BM25 → vector order (per the
    /// write-ordering rule), one batch of pending chunks.
    async fn persist_batch(
        &self,
        pending: &mut Vec<(ChunkRow, Vec<model::Symbol>)>,
    ) -> Result<usize, CoreError> {
        let texts: Vec<String> = pending.iter().map(|(c, _)| c.enriched_content.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await.map_err(CoreError::from)?;

        let mut rows = Vec::with_capacity(pending.len());
        for ((mut row, symbols), embedding) in pending.drain(..).zip(embeddings) {
            row.embedding = Some(crate::store::embedding_to_bytes(&embedding));
            row.embedding_model = Some(self.embedder.model_name().to_string());
            row.embedding_dim = Some(embedding.len() as u32);
            rows.push((row, symbols, embedding));
        }

        self.metadata.save_chunks(&rows.iter().map(|(r, _, _)| r.clone()).collect::<Vec<_>>())?;
        for (row, symbols, _) in &rows {
            self.metadata.save_symbols(&row.id, symbols)?;
        }

        let bm25_docs: Vec<(String, String, serde_json::Value)> = rows
            .iter()
            .map(|(r, _, _)| (r.id.clone(), r.raw_content.clone(), serde_json::Value::Null))
            .collect();
        self.bm25.add_batch(&bm25_docs)?;

        for (row, _, embedding) in &rows {
            self.vectors.add(&row.id, embedding)?;
        }

        Ok(rows.len())
    }

    /// Incremental handling of a single filesystem event (steps 1-4 of the
    /// spec's incremental indexing path): re-scan one file, re-chunk,
    /// re-embed, and write metadata → BM25 → vector in that order.
    pub async fn handle_event(&self, root: &Path, event: WatchEvent) -> Result<(), CoreError> {
        let project_id = model::project_id(&root.to_string_lossy());

        match event {
            WatchEvent::Removed(relative_path) => {
                let file_id = model::file_id(&project_id, &relative_path);
                let chunk_ids = self.metadata.delete_chunks_by_file(&file_id)?;
                for id in &chunk_ids {
                    self.bm25.delete(id)?;
                    self.vectors.delete(id);
                }
                self.metadata.delete_file(&file_id)?;
                Ok(())
            }
            WatchEvent::Created(relative_path) | WatchEvent::Modified(relative_path) => {
                let full_path = root.join(&relative_path);
                let Ok(content) = std::fs::read_to_string(&full_path) else {
                    return Ok(());
                };
                let metadata = std::fs::metadata(&full_path)?;
                let language = scanner::detect_language(&full_path);
                let content_type = scanner::detect_content_type(&full_path, language.as_deref());

                let file_id = model::file_id(&project_id, &relative_path);
                let content_hash = model::content_hash(content.as_bytes());
                if let Some(existing) = self.metadata.get_file(&project_id, &relative_path)? {
                    if existing.content_hash == content_hash {
                        return Ok(());
                    }
                }

                let old_chunk_ids = self.metadata.delete_chunks_by_file(&file_id)?;
                for id in &old_chunk_ids {
                    self.bm25.delete(id)?;
                    self.vectors.delete(id);
                }

                let drafts = chunk::chunk_file(&relative_path, &content, language.as_deref(), content_type, ChunkOptions::default());
                let mut pending = Vec::new();
                for draft in drafts {
                    let context = self.context_gen.generate(&relative_path, "", &draft);
                    let chunk_id = model::chunk_id(&file_id, draft.start_line, draft.end_line, &draft.raw_content);
                    let enriched = if context.is_empty() {
                        draft.raw_content.clone()
                    } else {
                        format!("{context}\n\n{}", draft.raw_content)
                    };
                    pending.push((
                        ChunkRow {
                            id: chunk_id,
                            file_id: file_id.clone(),
                            file_path: draft.file_path.clone(),
                            enriched_content: enriched,
                            raw_content: draft.raw_content.clone(),
                            context,
                            content_type,
                            language: language.clone(),
                            start_line: draft.start_line,
                            end_line: draft.end_line,
                            metadata: draft.metadata.iter().map(|(k, v)| (k.clone(), v.to_string())).collect(),
                            created_at: now(),
                            updated_at: now(),
                            embedding: None,
                            embedding_model: None,
                            embedding_dim: None,
                        },
                        draft.symbols,
                    ));
                }
                self.persist_batch(&mut pending).await?;

                // Written only after the chunks above are durably persisted,
                // so a crash never leaves a stale content hash pointing at
                // chunks that were never actually written.
                let file_row = FileRow {
                    id: file_id,
                    project_id,
                    relative_path: relative_path.clone(),
                    size: metadata.len(),
                    mtime: metadata
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                        .map(|d| d.as_secs() as i64)
                        .unwrap_or(0),
                    content_hash,
                    language,
                    content_type,
                    last_indexed_at: now(),
                };
                self.metadata.save_files(&[file_row])?;
                Ok(())
            }
        }
    }

    /// Three-phase startup reconciliation: gitignore, file diff, and
    /// cross-store consistency. Always best-effort and non-fatal.
    pub async fn reconcile_startup(&self, root: &Path, scan_options: &ScanOptions) -> ReconciliationReport {
        let mut report = ReconciliationReport::default();
        let project_id = model::project_id(&root.to_string_lossy());

        let gitignore_cache = scanner::GitignoreCache::new(256);
        match self.metadata.get_file_paths_under(&project_id, "") {
            Ok(paths) => {
                for path in paths {
                    let full_path = root.join(&path);
                    if gitignore_cache.is_ignored(root, &full_path, false) {
                        if let Ok(chunk_ids) = self.metadata.delete_chunks_by_file(&model::file_id(&project_id, &path)) {
                            for id in chunk_ids {
                                let _ = self.bm25.delete(&id);
                                self.vectors.delete(&id);
                            }
                        }
                        let _ = self.metadata.delete_file(&model::file_id(&project_id, &path));
                        report.gitignore_removed += 1;
                    }
                }
            }
            Err(e) => report.errors.push(e.to_string()),
        }

        let scan_cancel = ScanCancellationToken::new();
        match scanner::scan(root, scan_options.clone(), scan_cancel) {
            Ok(rx) => {
                for record in rx.iter() {
                    if record.is_skipped() {
                        continue;
                    }
                    let file_id = model::file_id(&project_id, &record.relative_path);
                    let needs_reindex = self
                        .metadata
                        .get_file_paths_under(&project_id, &record.relative_path)
                        .map(|paths| !paths.contains(&record.relative_path))
                        .unwrap_or(true);
                    if needs_reindex {
                        let event = WatchEvent::Modified(record.relative_path.clone());
                        if self.handle_event(root, event).await.is_ok() {
                            report.files_reconciled += 1;
                        }
                    }
                    let _ = file_id;
                }
            }
            Err(e) => report.errors.push(e.to_string()),
        }

        let checker = ConsistencyChecker::new(self.metadata.clone(), self.bm25.clone(), self.vectors.clone());
        match checker.full_check() {
            Ok(inconsistencies) if !inconsistencies.is_empty() => match checker.repair(&inconsistencies) {
                Ok(n) => report.inconsistencies_repaired = n,
                Err(e) => report.errors.push(e.to_string()),
            },
            Err(e) => report.errors.push(e.to_string()),
            _ => {}
        }

        report
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NoopContextGenerator;
    use crate::embedding::HashEmbedder;
    use crate::text_index::TantivyBm25Index;
    use crate::vector_index::VectorIndexConfig;
    use tempfile::tempdir;

    fn make_coordinator(dir: &Path) -> Coordinator {
        let metadata = Arc::new(MetadataStore::open(&dir.join("meta.db")).unwrap());
        let bm25: Arc<dyn Bm25Index> = Arc::new(TantivyBm25Index::open(&dir.join("tantivy")).unwrap());
        let vectors = Arc::new(VectorIndex::new(VectorIndexConfig { dim: 32, ..Default::default() }));
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(32));
        let context_gen: Arc<dyn ContextGenerator> = Arc::new(NoopContextGenerator);
        Coordinator::new(metadata, bm25, vectors, embedder, context_gen)
    }

    #[tokio::test]
    async fn full_index_indexes_files_and_removes_deleted_ones() {
        let work = tempdir().unwrap();
        let data = tempdir().unwrap();
        std::fs::write(work.path().join("a.rs"), "fn a() {}\n").unwrap();
        std::fs::write(work.path().join("b.rs"), "fn b() {}\n").unwrap();

        let coordinator = make_coordinator(data.path());
        let summary = coordinator
            .full_index(work.path(), &ScanOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.files_indexed, 2);
        assert!(summary.chunks_indexed >= 2);

        std::fs::remove_file(work.path().join("b.rs")).unwrap();
        let summary2 = coordinator
            .full_index(work.path(), &ScanOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary2.files_removed, 1);
    }

    #[tokio::test]
    async fn handle_event_removed_deletes_chunks() {
        let work = tempdir().unwrap();
        let data = tempdir().unwrap();
        std::fs::write(work.path().join("a.rs"), "fn a() {}\n").unwrap();

        let coordinator = make_coordinator(data.path());
        coordinator
            .full_index(work.path(), &ScanOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        coordinator
            .handle_event(work.path(), WatchEvent::Removed("a.rs".to_string()))
            .await
            .unwrap();
        assert_eq!(coordinator.metadata.count_chunks().unwrap(), 0);
    }

    #[tokio::test]
    async fn full_index_skips_unchanged_files_on_second_pass() {
        let work = tempdir().unwrap();
        let data = tempdir().unwrap();
        std::fs::write(work.path().join("a.rs"), "fn a() {}\n").unwrap();

        let coordinator = make_coordinator(data.path());
        let summary = coordinator
            .full_index(work.path(), &ScanOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.files_indexed, 1);
        let chunks_after_first = coordinator.metadata.count_chunks().unwrap();

        let summary2 = coordinator
            .full_index(work.path(), &ScanOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary2.files_indexed, 0);
        assert_eq!(summary2.files_skipped, 1);
        assert_eq!(coordinator.metadata.count_chunks().unwrap(), chunks_after_first);
    }

    #[tokio::test]
    async fn handle_event_modified_is_noop_when_content_hash_unchanged() {
        let work = tempdir().unwrap();
        let data = tempdir().unwrap();
        std::fs::write(work.path().join("a.rs"), "fn a() {}\n").unwrap();

        let coordinator = make_coordinator(data.path());
        coordinator
            .full_index(work.path(), &ScanOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        let chunks_before = coordinator.metadata.count_chunks().unwrap();

        coordinator
            .handle_event(work.path(), WatchEvent::Modified("a.rs".to_string()))
            .await
            .unwrap();
        assert_eq!(coordinator.metadata.count_chunks().unwrap(), chunks_before);
    }
}
