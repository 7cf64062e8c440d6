//! C12 Compactor: background vector-index rebuild that reclaims
//! tombstoned (lazily-deleted) entries once they accumulate past a
//! configurable ratio. New module — LanceDB's compaction was automatic in
//! the teacher; the hand-rolled HNSW index here needs an explicit trigger.

use crate::error::CoreError;
use crate::store::MetadataStore;
use crate::vector_index::VectorIndex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct CompactorOptions {
    pub tombstone_ratio_threshold: f32,
    pub min_count: usize,
    pub idle_before_compact: Duration,
    pub poll_interval: Duration,
}

impl Default for CompactorOptions {
    fn default() -> Self {
        Self {
            tombstone_ratio_threshold: 0.20,
            min_count: 100,
            idle_before_compact: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Tracks the last write so the compactor only fires during a quiet period
/// (avoids contending with an in-progress incremental index).
pub struct ActivityClock {
    last_write_unix_ms: AtomicI64,
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self { last_write_unix_ms: AtomicI64::new(0) }
    }
}

impl ActivityClock {
    pub fn touch(&self) {
        self.last_write_unix_ms.store(now_ms(), Ordering::SeqCst);
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_write_unix_ms.load(Ordering::SeqCst);
        let elapsed_ms = (now_ms() - last).max(0);
        Duration::from_millis(elapsed_ms as u64)
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct Compactor {
    metadata: Arc<MetadataStore>,
    vectors: Arc<VectorIndex>,
    snapshot_path: std::path::PathBuf,
    options: CompactorOptions,
    activity: Arc<ActivityClock>,
}

impl Compactor {
    pub fn new(
        metadata: Arc<MetadataStore>,
        vectors: Arc<VectorIndex>,
        snapshot_path: std::path::PathBuf,
        options: CompactorOptions,
        activity: Arc<ActivityClock>,
    ) -> Self {
        Self { metadata, vectors, snapshot_path, options, activity }
    }

    /// Runs forever (until `cancel` fires), polling at `poll_interval` and
    /// compacting whenever the trigger condition holds.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }

            if self.should_compact() {
                if let Err(e) = self.compact_once().await {
                    tracing::warn!(error = %e, "vector index compaction failed");
                }
            }
        }
    }

    fn should_compact(&self) -> bool {
        let ratio = self.vectors.tombstone_ratio();
        let count = self.vectors.size() + self.vectors.tombstone_count();
        ratio > self.options.tombstone_ratio_threshold
            && count >= self.options.min_count
            && self.activity.idle_for() >= self.options.idle_before_compact
    }

    /// Rebuilds the index in place from the metadata store's embeddings
    /// (the source of truth), then persists the result.
    pub async fn compact_once(&self) -> Result<(), CoreError> {
        let embeddings = self.metadata.all_embeddings_for_compaction()?;
        self.vectors.compact(embeddings.into_iter())?;
        self.vectors.save(&self.snapshot_path)?;
        tracing::info!("vector index compaction complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_index::VectorIndexConfig;
    use tempfile::tempdir;

    #[tokio::test]
    async fn compact_once_rebuilds_from_metadata_and_drops_tombstones() {
        let dir = tempdir().unwrap();
        let metadata = Arc::new(MetadataStore::open(&dir.path().join("meta.db")).unwrap());
        let vectors = Arc::new(VectorIndex::new(VectorIndexConfig { dim: 4, ..Default::default() }));
        let activity = Arc::new(ActivityClock::default());
        let compactor = Compactor::new(
            metadata.clone(),
            vectors.clone(),
            dir.path().join("vectors.hnsw"),
            CompactorOptions::default(),
            activity,
        );

        vectors.add("a", &[1.0, 0.0, 0.0, 0.0]).unwrap();
        vectors.delete("a");
        compactor.compact_once().await.unwrap();
        assert_eq!(vectors.tombstone_count(), 0);
        assert_eq!(vectors.size(), 0);
    }
}
