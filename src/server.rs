//! Top-level `Server`: owns one instance of every long-lived component per
//! data directory and enforces the single-writer PID lockfile. New module —
//! the teacher constructs a bare `Searcher` per call instead of holding
//! long-lived state across the data directory's lifetime.

use crate::compactor::{ActivityClock, Compactor, CompactorOptions};
use crate::config::Config;
use crate::context::{ContextGenerator, LayeredContextGenerator, LlmContextGenerator, NoopContextGenerator, PatternContextGenerator};
use crate::coordinator::{Coordinator, IndexSummary};
use crate::embedding::{CandleEmbedder, Embedder, HashEmbedder};
use crate::error::CoreError;
use crate::scanner::ScanOptions;
use crate::search::{NoopReranker, SearchEngine};
use crate::store::MetadataStore;
use crate::text_index::open_bm25_index;
use crate::vector_index::{VectorIndex, VectorIndexConfig};
use crate::watcher::{Watcher, WatcherOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sysinfo::{Pid, System};
use tokio_util::sync::CancellationToken;

const DATA_DIR_NAME: &str = ".code-search";

/// Owns every long-lived component backing one project's data directory.
/// `vectors` is the single shared index: the coordinator writes into it
/// incrementally, the search engine reads from it, and the compactor
/// rebuilds it in place — all through the same `Arc`.
pub struct Server {
    pub root: PathBuf,
    pub data_dir: PathBuf,
    pub metadata: Arc<MetadataStore>,
    pub vectors: Arc<VectorIndex>,
    pub coordinator: Arc<Coordinator>,
    pub search_engine: Arc<SearchEngine>,
    pub activity: Arc<ActivityClock>,
    pub watcher: Option<Watcher>,
    compactor_cancel: CancellationToken,
    lockfile_path: PathBuf,
}

impl Server {
    /// Opens (or creates) the data directory for `root`, acquiring the PID
    /// lockfile. Fails with [`CoreError::ConcurrentWriter`] if a live
    /// process already holds it; a stale PID (process no longer running)
    /// is reclaimed automatically.
    pub fn open(root: &Path, config: Config) -> Result<Self, CoreError> {
        let data_dir = root.join(DATA_DIR_NAME);
        std::fs::create_dir_all(&data_dir)?;

        let lockfile_path = data_dir.join("serve.pid");
        acquire_lockfile(&lockfile_path)?;

        let metadata = Arc::new(MetadataStore::open(&data_dir.join("metadata.db"))?);

        let bm25_path = match config.search.bm25_backend {
            crate::config::Bm25Backend::Bleve => data_dir.join("tantivy"),
            crate::config::Bm25Backend::Sqlite => data_dir.join("bm25.db"),
        };
        let bm25 = open_bm25_index(config.search.bm25_backend, &bm25_path, None)?;

        let embedder: Arc<dyn Embedder> = build_embedder(&config);
        let vector_config =
            VectorIndexConfig { dim: embedder.dimensions(), quantization: config.vector_store.quantization, ..Default::default() };
        let vectors_path = data_dir.join("vectors.hnsw");
        let vectors = Arc::new(VectorIndex::load(&vectors_path, vector_config)?);

        let context_gen = build_context_generator(&config);

        let coordinator = Arc::new(Coordinator::new(
            metadata.clone(),
            bm25.clone(),
            vectors.clone(),
            embedder.clone(),
            context_gen,
        ));

        let search_engine = Arc::new(SearchEngine::new(
            metadata.clone(),
            bm25,
            vectors.clone(),
            embedder,
            Arc::new(NoopReranker),
            config.search.clone(),
        ));

        Ok(Self {
            root: root.to_path_buf(),
            data_dir,
            metadata,
            vectors,
            coordinator,
            search_engine,
            activity: Arc::new(ActivityClock::default()),
            watcher: None,
            compactor_cancel: CancellationToken::new(),
            lockfile_path,
        })
    }

    pub fn start_watcher(&mut self) -> Result<(), CoreError> {
        self.watcher = Some(Watcher::subscribe(&self.root, WatcherOptions::default())?);
        Ok(())
    }

    pub fn spawn_compactor(&self) -> tokio::task::JoinHandle<()> {
        let compactor = Compactor::new(
            self.metadata.clone(),
            self.vectors.clone(),
            self.data_dir.join("vectors.hnsw"),
            CompactorOptions::default(),
            self.activity.clone(),
        );
        let cancel = self.compactor_cancel.clone();
        tokio::spawn(async move { compactor.run(cancel).await })
    }

    pub async fn full_index(&self) -> Result<IndexSummary, CoreError> {
        let summary = self
            .coordinator
            .full_index(&self.root, &ScanOptions::default(), &CancellationToken::new())
            .await?;
        self.activity.touch();
        Ok(summary)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.compactor_cancel.cancel();
        let _ = std::fs::remove_file(&self.lockfile_path);
    }
}

fn build_embedder(config: &Config) -> Arc<dyn Embedder> {
    if config.embeddings.provider == "hash" {
        return Arc::new(HashEmbedder::new(384));
    }
    match CandleEmbedder::new(&config.embeddings.model, std::time::Duration::from_secs(30)) {
        Ok(e) => Arc::new(e),
        Err(err) => {
            tracing::warn!(error = %err, "candle embedder unavailable, falling back to hash embedder");
            Arc::new(HashEmbedder::new(384))
        }
    }
}

fn build_context_generator(config: &Config) -> Arc<dyn ContextGenerator> {
    if !config.contextual.enabled {
        return Arc::new(NoopContextGenerator);
    }
    let primary = config.contextual.model.as_ref().map(|endpoint| {
        Arc::new(LlmContextGenerator::new(
            endpoint.clone(),
            std::time::Duration::from_millis(config.contextual.timeout_ms),
            512,
        )) as Arc<dyn ContextGenerator>
    });
    Arc::new(LayeredContextGenerator { primary, fallback: Arc::new(PatternContextGenerator) })
}

fn acquire_lockfile(path: &Path) -> Result<(), CoreError> {
    if path.exists() {
        if let Ok(contents) = std::fs::read_to_string(path) {
            if let Ok(pid) = contents.trim().parse::<u32>() {
                if process_is_alive(pid) {
                    return Err(CoreError::ConcurrentWriter(pid));
                }
                tracing::warn!(pid, "reclaiming stale writer lockfile");
            }
        }
    }
    std::fs::write(path, std::process::id().to_string())?;
    Ok(())
}

fn process_is_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
    system.process(Pid::from_u32(pid)).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_data_dir_and_lockfile() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.embeddings.provider = "hash".to_string();
        let server = Server::open(dir.path(), config).unwrap();
        assert!(server.data_dir.join("serve.pid").exists());
        assert!(server.data_dir.join("metadata.db").exists());
    }

    #[test]
    fn open_rejects_when_a_live_process_holds_the_lock() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join(DATA_DIR_NAME);
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::write(data_dir.join("serve.pid"), std::process::id().to_string()).unwrap();

        let mut config = Config::default();
        config.embeddings.provider = "hash".to_string();
        let err = Server::open(dir.path(), config).unwrap_err();
        assert!(matches!(err, CoreError::ConcurrentWriter(_)));
    }

    #[test]
    fn open_reclaims_a_stale_lockfile() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join(DATA_DIR_NAME);
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::write(data_dir.join("serve.pid"), "999999999").unwrap();

        let mut config = Config::default();
        config.embeddings.provider = "hash".to_string();
        let server = Server::open(dir.path(), config);
        assert!(server.is_ok());
    }
}
