//! C7 VectorIndex: in-memory HNSW approximate-nearest-neighbor index over
//! chunk embeddings. New module (no teacher equivalent — the teacher used
//! LanceDB for both storage and ANN search; see DESIGN.md for why that's
//! fully replaced here). Built on `hnsw_rs`, the pure-Rust HNSW
//! implementation also used elsewhere in the pack.

use crate::config::Quantization;
use crate::error::CoreError;
use hnsw_rs::dist::DistCosine;
use hnsw_rs::hnsw::Hnsw;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

#[derive(Debug, Clone, Copy)]
pub struct VectorIndexConfig {
    pub dim: usize,
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub quantization: Quantization,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            dim: 384,
            m: 16,
            ef_construction: 200,
            ef_search: 64,
            quantization: Quantization::F32,
        }
    }
}

/// Down-cast storage representation. HNSW distance computation always
/// happens in f32 after upcasting — quantization trades memory, not
/// search-time precision.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum QuantizedVector {
    F32(Vec<f32>),
    F16(Vec<half::f16>),
    I8 { scale: f32, zero: f32, data: Vec<i8> },
}

fn quantize(vector: &[f32], q: Quantization) -> QuantizedVector {
    match q {
        Quantization::F32 => QuantizedVector::F32(vector.to_vec()),
        Quantization::F16 => QuantizedVector::F16(vector.iter().map(|v| half::f16::from_f32(*v)).collect()),
        Quantization::I8 => {
            let min = vector.iter().cloned().fold(f32::INFINITY, f32::min);
            let max = vector.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let range = (max - min).max(1e-9);
            let scale = range / 255.0;
            let data = vector
                .iter()
                .map(|v| (((v - min) / scale) - 128.0).round().clamp(-128.0, 127.0) as i8)
                .collect();
            QuantizedVector::I8 { scale, zero: min, data }
        }
    }
}

fn dequantize(q: &QuantizedVector) -> Vec<f32> {
    match q {
        QuantizedVector::F32(v) => v.clone(),
        QuantizedVector::F16(v) => v.iter().map(|f| f.to_f32()).collect(),
        QuantizedVector::I8 { scale, zero, data } => {
            data.iter().map(|b| (*b as f32 + 128.0) * scale + zero).collect()
        }
    }
}

/// Stable bidirectional map between chunk id strings and the integer
/// labels `hnsw_rs` needs internally. Freed labels (from tombstoned,
/// compacted-away entries) are reused on the next insert.
#[derive(Default)]
struct LabelMap {
    id_to_label: HashMap<String, usize>,
    label_to_id: HashMap<usize, String>,
    next_label: usize,
    free_labels: Vec<usize>,
}

impl LabelMap {
    fn intern(&mut self, id: &str) -> usize {
        if let Some(&label) = self.id_to_label.get(id) {
            return label;
        }
        let label = self.free_labels.pop().unwrap_or_else(|| {
            let l = self.next_label;
            self.next_label += 1;
            l
        });
        self.id_to_label.insert(id.to_string(), label);
        self.label_to_id.insert(label, id.to_string());
        label
    }

    fn label_for(&self, id: &str) -> Option<usize> {
        self.id_to_label.get(id).copied()
    }

    fn id_for(&self, label: usize) -> Option<&String> {
        self.label_to_id.get(&label)
    }

    fn release(&mut self, id: &str) {
        if let Some(label) = self.id_to_label.remove(id) {
            self.label_to_id.remove(&label);
            self.free_labels.push(label);
        }
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedEntry {
    chunk_id: String,
    vector: QuantizedVector,
}

#[derive(Serialize, Deserialize, Default)]
struct PersistedIndex {
    dim: usize,
    entries: Vec<PersistedEntry>,
}

pub struct VectorIndex {
    hnsw: RwLock<Hnsw<'static, f32, DistCosine>>,
    labels: RwLock<LabelMap>,
    tombstones: RwLock<HashSet<usize>>,
    stored: RwLock<HashMap<usize, QuantizedVector>>,
    config: VectorIndexConfig,
}

impl VectorIndex {
    pub fn new(config: VectorIndexConfig) -> Self {
        let hnsw = Hnsw::new(config.m, 100_000, 16, config.ef_construction, DistCosine {});
        Self {
            hnsw: RwLock::new(hnsw),
            labels: RwLock::new(LabelMap::default()),
            tombstones: RwLock::new(HashSet::new()),
            stored: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Loads a snapshot from `path`. A missing file yields an empty index;
    /// a corrupt one logs a warning and also yields an empty index rather
    /// than refusing to open (the Coordinator treats this the same as a
    /// from-scratch rebuild).
    pub fn load(path: &Path, config: VectorIndexConfig) -> Result<Self, CoreError> {
        if !path.exists() {
            return Ok(Self::new(config));
        }
        let bytes = std::fs::read(path)?;
        let persisted: PersistedIndex = match serde_json::from_slice(&bytes) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "vector index snapshot corrupt, starting empty");
                return Ok(Self::new(config));
            }
        };

        let index = Self::new(config);
        for entry in persisted.entries {
            let vector = dequantize(&entry.vector);
            index.add(&entry.chunk_id, &vector)?;
        }
        Ok(index)
    }

    /// Atomically snapshots all live (non-tombstoned) vectors to `path`.
    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        let labels = self.labels.read();
        let stored = self.stored.read();
        let tombstones = self.tombstones.read();

        let entries = stored
            .iter()
            .filter(|(label, _)| !tombstones.contains(label))
            .filter_map(|(label, vector)| {
                labels.id_for(*label).map(|id| PersistedEntry {
                    chunk_id: id.clone(),
                    vector: vector.clone(),
                })
            })
            .collect();

        let persisted = PersistedIndex { dim: self.config.dim, entries };
        let bytes = serde_json::to_vec(&persisted).map_err(|e| CoreError::StoreCorrupt(e.to_string()))?;

        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, bytes)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn add(&self, chunk_id: &str, vector: &[f32]) -> Result<(), CoreError> {
        if vector.len() != self.config.dim {
            return Err(CoreError::DimensionMismatch {
                expected: self.config.dim,
                got: vector.len(),
            });
        }
        let label = self.labels.write().intern(chunk_id);
        self.tombstones.write().remove(&label);

        let quantized = quantize(vector, self.config.quantization);
        let upcast = dequantize(&quantized);
        self.stored.write().insert(label, quantized);
        self.hnsw.write().insert((&upcast, label));
        Ok(())
    }

    /// Lazy deletion: marks the label as a tombstone without touching the
    /// live graph. Reclaimed during [`Self::compact`].
    pub fn delete(&self, chunk_id: &str) {
        let label = self.labels.read().label_for(chunk_id);
        if let Some(label) = label {
            self.tombstones.write().insert(label);
        }
    }

    pub fn search(&self, query: &[f32], k: usize, ef: usize) -> Result<Vec<(String, f32)>, CoreError> {
        if query.len() != self.config.dim {
            return Err(CoreError::DimensionMismatch {
                expected: self.config.dim,
                got: query.len(),
            });
        }
        let tombstones = self.tombstones.read();
        let labels = self.labels.read();
        // Over-fetch so tombstoned hits don't starve the caller of k results.
        let over_fetch = (k + tombstones.len()).max(k);
        let neighbours = self.hnsw.read().search(query, over_fetch, ef.max(self.config.ef_search));

        let mut results = Vec::with_capacity(k);
        for n in neighbours {
            if tombstones.contains(&n.d_id) {
                continue;
            }
            if let Some(id) = labels.id_for(n.d_id) {
                results.push((id.clone(), 1.0 - n.distance));
                if results.len() >= k {
                    break;
                }
            }
        }
        Ok(results)
    }

    /// Whether `chunk_id` currently has a live (non-tombstoned) entry.
    pub fn contains(&self, chunk_id: &str) -> bool {
        match self.labels.read().label_for(chunk_id) {
            Some(label) => !self.tombstones.read().contains(&label),
            None => false,
        }
    }

    pub fn config_snapshot(&self) -> VectorIndexConfig {
        self.config
    }

    pub fn size(&self) -> usize {
        self.stored.read().len() - self.tombstones.read().len()
    }

    pub fn tombstone_ratio(&self) -> f32 {
        let total = self.stored.read().len();
        if total == 0 {
            return 0.0;
        }
        self.tombstones.read().len() as f32 / total as f32
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.read().len()
    }

    /// All chunk ids with a live (non-tombstoned) entry, for consistency
    /// checking against the metadata store's id set.
    pub fn all_ids(&self) -> HashSet<String> {
        let labels = self.labels.read();
        let tombstones = self.tombstones.read();
        labels
            .label_to_id
            .iter()
            .filter(|(label, _)| !tombstones.contains(label))
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// Rebuilds a fresh graph from `rebuild_from` (normally
    /// `MetadataStore::all_embeddings_for_compaction`, the source of
    /// truth), discarding tombstoned entries. Replaces this index's
    /// internal state in place.
    pub fn compact(&self, rebuild_from: impl Iterator<Item = (String, Vec<f32>)>) -> Result<(), CoreError> {
        let fresh = Self::new(self.config);
        for (id, vector) in rebuild_from {
            fresh.add(&id, &vector)?;
        }

        *self.hnsw.write() = fresh.hnsw.into_inner();
        *self.labels.write() = fresh.labels.into_inner();
        *self.tombstones.write() = fresh.tombstones.into_inner();
        *self.stored.write() = fresh.stored.into_inner();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cfg() -> VectorIndexConfig {
        VectorIndexConfig { dim: 4, ..VectorIndexConfig::default() }
    }

    #[test]
    fn add_then_search_returns_nearest_by_cosine() {
        let index = VectorIndex::new(cfg());
        index.add("a", &[1.0, 0.0, 0.0, 0.0]).unwrap();
        index.add("b", &[0.0, 1.0, 0.0, 0.0]).unwrap();
        let results = index.search(&[0.9, 0.1, 0.0, 0.0], 1, 32).unwrap();
        assert_eq!(results[0].0, "a");
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let index = VectorIndex::new(cfg());
        let err = index.add("a", &[1.0, 0.0]).unwrap_err();
        assert!(matches!(err, CoreError::DimensionMismatch { expected: 4, got: 2 }));
    }

    #[test]
    fn delete_is_lazy_and_excluded_from_search() {
        let index = VectorIndex::new(cfg());
        index.add("a", &[1.0, 0.0, 0.0, 0.0]).unwrap();
        index.add("b", &[0.0, 1.0, 0.0, 0.0]).unwrap();
        index.delete("a");
        assert_eq!(index.tombstone_count(), 1);
        let results = index.search(&[1.0, 0.0, 0.0, 0.0], 2, 32).unwrap();
        assert!(!results.iter().any(|(id, _)| id == "a"));
    }

    #[test]
    fn compact_drops_tombstoned_entries_and_resets_ratio() {
        let index = VectorIndex::new(cfg());
        index.add("a", &[1.0, 0.0, 0.0, 0.0]).unwrap();
        index.add("b", &[0.0, 1.0, 0.0, 0.0]).unwrap();
        index.delete("a");
        assert!(index.tombstone_ratio() > 0.0);

        let live: Vec<(String, Vec<f32>)> = vec![("b".to_string(), vec![0.0, 1.0, 0.0, 0.0])];
        index.compact(live.into_iter()).unwrap();
        assert_eq!(index.tombstone_ratio(), 0.0);
        assert_eq!(index.size(), 1);
    }

    #[test]
    fn save_and_load_round_trips_vectors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vectors.hnsw");
        let index = VectorIndex::new(cfg());
        index.add("a", &[1.0, 0.0, 0.0, 0.0]).unwrap();
        index.save(&path).unwrap();

        let reloaded = VectorIndex::load(&path, cfg()).unwrap();
        let results = reloaded.search(&[1.0, 0.0, 0.0, 0.0], 1, 32).unwrap();
        assert_eq!(results[0].0, "a");
    }

    #[test]
    fn all_ids_excludes_tombstoned_entries() {
        let index = VectorIndex::new(cfg());
        index.add("a", &[1.0, 0.0, 0.0, 0.0]).unwrap();
        index.add("b", &[0.0, 1.0, 0.0, 0.0]).unwrap();
        index.delete("a");
        let ids = index.all_ids();
        assert_eq!(ids.len(), 1);
        assert!(ids.contains("b"));
    }

    #[test]
    fn load_missing_file_yields_empty_index() {
        let dir = tempdir().unwrap();
        let index = VectorIndex::load(&dir.path().join("missing.hnsw"), cfg()).unwrap();
        assert_eq!(index.size(), 0);
    }
}
