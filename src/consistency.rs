//! C9 ConsistencyChecker: detects and repairs drift across the metadata,
//! BM25, and vector stores after a crash or a forcibly-killed process. New
//! module — the teacher has no analogue since LanceDB was its only store.

use crate::error::CoreError;
use crate::store::MetadataStore;
use crate::text_index::Bm25Index;
use crate::vector_index::VectorIndex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub enum Inconsistency {
    /// Chunk exists in metadata but is missing from BM25.
    MissingFromBm25(String),
    /// Chunk exists in metadata but is missing from the vector index.
    MissingFromVectors(String),
    /// Chunk id appears in BM25 but metadata has no matching row (orphan).
    OrphanInBm25(String),
    /// Chunk id has a live vector-index entry but metadata has no matching
    /// row (orphan left behind by a crash between the metadata delete and
    /// the vector delete of a removed chunk).
    OrphanInVectors(String),
}

pub struct ConsistencyChecker {
    metadata: Arc<MetadataStore>,
    bm25: Arc<dyn Bm25Index>,
    vectors: Arc<VectorIndex>,
}

impl ConsistencyChecker {
    pub fn new(metadata: Arc<MetadataStore>, bm25: Arc<dyn Bm25Index>, vectors: Arc<VectorIndex>) -> Self {
        Self { metadata, bm25, vectors }
    }

    /// Cheap sanity check: compares row counts across the three stores.
    /// Returns `true` when they roughly agree (a mismatch here doesn't prove
    /// which store is wrong, only that a [`Self::full_check`] is warranted).
    pub fn quick_check(&self) -> Result<bool, CoreError> {
        let chunk_count = self.metadata.count_chunks()?;
        let bm25_count = self.bm25.doc_count();
        let vector_count = self.vectors.size();
        Ok(chunk_count == bm25_count && chunk_count == vector_count)
    }

    /// Diffs the full id sets across all three stores. Only metadata rows
    /// with a stored embedding are expected to also appear in the vector
    /// index, since a chunk can be persisted before its embedding lands.
    pub fn full_check(&self) -> Result<Vec<Inconsistency>, CoreError> {
        let metadata_ids = self.metadata.all_chunk_ids()?;
        let embedded_ids: HashSet<String> = self
            .metadata
            .all_embeddings_for_compaction()?
            .into_iter()
            .map(|(id, _)| id)
            .collect();

        let mut inconsistencies = Vec::new();

        for id in &metadata_ids {
            if !self.bm25.contains(id)? {
                inconsistencies.push(Inconsistency::MissingFromBm25(id.clone()));
            }
        }

        for id in &embedded_ids {
            if !self.vectors.contains(id) {
                inconsistencies.push(Inconsistency::MissingFromVectors(id.clone()));
            }
        }

        for id in self.vectors.all_ids() {
            if !metadata_ids.contains(&id) {
                inconsistencies.push(Inconsistency::OrphanInVectors(id));
            }
        }

        Ok(inconsistencies)
    }

    /// Repairs what [`Self::full_check`] found: re-adds chunks missing from
    /// BM25 or the vector index (re-deriving from the metadata row, which is
    /// always the source of truth), and drops BM25 orphans with no backing
    /// metadata row. Returns the number of repairs applied.
    pub fn repair(&self, inconsistencies: &[Inconsistency]) -> Result<usize, CoreError> {
        let mut repaired = 0;
        let missing_bm25: Vec<String> = inconsistencies
            .iter()
            .filter_map(|i| match i {
                Inconsistency::MissingFromBm25(id) => Some(id.clone()),
                _ => None,
            })
            .collect();
        if !missing_bm25.is_empty() {
            let rows = self.metadata.get_chunks_by_ids(&missing_bm25)?;
            for row in rows {
                self.bm25.add(&row.id, &row.raw_content, &serde_json::Value::Null)?;
                repaired += 1;
            }
        }

        let missing_vectors: Vec<String> = inconsistencies
            .iter()
            .filter_map(|i| match i {
                Inconsistency::MissingFromVectors(id) => Some(id.clone()),
                _ => None,
            })
            .collect();
        if !missing_vectors.is_empty() {
            let rows = self.metadata.get_chunks_by_ids(&missing_vectors)?;
            for row in rows {
                if let Some(bytes) = &row.embedding {
                    let embedding = crate::store::bytes_to_embedding(bytes);
                    self.vectors.add(&row.id, &embedding)?;
                    repaired += 1;
                }
            }
        }

        for inconsistency in inconsistencies {
            match inconsistency {
                Inconsistency::OrphanInBm25(id) => {
                    self.bm25.delete(id)?;
                    repaired += 1;
                }
                Inconsistency::OrphanInVectors(id) => {
                    self.vectors.delete(id);
                    repaired += 1;
                }
                _ => {}
            }
        }

        Ok(repaired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChunkRow, ContentType, FileRow, Project};
    use crate::text_index::TantivyBm25Index;
    use crate::vector_index::VectorIndexConfig;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Arc<MetadataStore>, Arc<dyn Bm25Index>, Arc<VectorIndex>) {
        let dir = tempdir().unwrap();
        let metadata = Arc::new(MetadataStore::open(&dir.path().join("meta.db")).unwrap());
        let bm25: Arc<dyn Bm25Index> = Arc::new(TantivyBm25Index::open(&dir.path().join("tantivy")).unwrap());
        let vectors = Arc::new(VectorIndex::new(VectorIndexConfig { dim: 4, ..Default::default() }));
        (dir, metadata, bm25, vectors)
    }

    #[test]
    fn quick_check_detects_mismatched_counts() {
        let (_dir, metadata, bm25, vectors) = setup();
        metadata
            .save_project(&Project {
                id: "p1".to_string(),
                name: "demo".to_string(),
                root_path: "/tmp".to_string(),
                project_type: "rust".to_string(),
                last_indexed_at: None,
                file_count: 0,
                chunk_count: 0,
                schema_version: 1,
            })
            .unwrap();
        metadata
            .save_files(&[FileRow {
                id: "f1".to_string(),
                project_id: "p1".to_string(),
                relative_path: "a.rs".to_string(),
                size: 1,
                mtime: 0,
                content_hash: "h".to_string(),
                language: None,
                content_type: ContentType::Code,
                last_indexed_at: 0,
            }])
            .unwrap();
        metadata
            .save_chunks(&[ChunkRow {
                id: "c1".to_string(),
                file_id: "f1".to_string(),
                file_path: "a.rs".to_string(),
                enriched_content: "fn a(){}".to_string(),
                raw_content: "fn a(){}".to_string(),
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

        let checker = ConsistencyChecker::new(metadata, bm25, vectors);
        assert!(!checker.quick_check().unwrap());
    }

    #[test]
    fn repair_reindexes_chunks_missing_from_bm25() {
        let (_dir, metadata, bm25, vectors) = setup();
        metadata
            .save_project(&Project {
                id: "p1".to_string(),
                name: "demo".to_string(),
                root_path: "/tmp".to_string(),
                project_type: "rust".to_string(),
                last_indexed_at: None,
                file_count: 0,
                chunk_count: 0,
                schema_version: 1,
            })
            .unwrap();
        metadata
            .save_files(&[FileRow {
                id: "f1".to_string(),
                project_id: "p1".to_string(),
                relative_path: "a.rs".to_string(),
                size: 1,
                mtime: 0,
                content_hash: "h".to_string(),
                language: None,
                content_type: ContentType::Code,
                last_indexed_at: 0,
            }])
            .unwrap();
        metadata
            .save_chunks(&[ChunkRow {
                id: "c1".to_string(),
                file_id: "f1".to_string(),
                file_path: "a.rs".to_string(),
                enriched_content: "fn parse_config(){}".to_string(),
                raw_content: "fn parse_config(){}".to_string(),
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

        let checker = ConsistencyChecker::new(metadata, bm25.clone(), vectors);
        let repaired = checker
            .repair(&[Inconsistency::MissingFromBm25("c1".to_string())])
            .unwrap();
        assert_eq!(repaired, 1);
        assert_eq!(bm25.doc_count(), 1);
    }

    #[test]
    fn full_check_detects_and_repair_drops_orphaned_vector_entry() {
        let (_dir, metadata, bm25, vectors) = setup();
        vectors.add("ghost", &[1.0, 0.0, 0.0, 0.0]).unwrap();

        let checker = ConsistencyChecker::new(metadata, bm25, vectors.clone());
        let inconsistencies = checker.full_check().unwrap();
        assert!(inconsistencies
            .iter()
            .any(|i| matches!(i, Inconsistency::OrphanInVectors(id) if id == "ghost")));

        let repaired = checker.repair(&inconsistencies).unwrap();
        assert_eq!(repaired, 1);
        assert!(!vectors.contains("ghost"));
    }
}
