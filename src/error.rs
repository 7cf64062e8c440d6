//! Error taxonomy for the core engine (spec.md §7).
//!
//! Indexing propagates these up so a batch failure preserves the checkpoint;
//! serving degrades component-by-component instead of aborting on most
//! variants (see each call site's doc comment for which ones it degrades on).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("data directory not initialized")]
    NotInitialized,

    #[error("checkpoint incomplete; resume the index or force a rebuild")]
    CheckpointIncomplete,

    #[error("embedder unavailable: {0}")]
    EmbedderUnavailable(String),

    #[error("embedder timed out")]
    EmbedderTimeout,

    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("store busy")]
    StoreBusy,

    #[error("store corrupt: {0}")]
    StoreCorrupt(String),

    #[error("another process holds the writer lock (pid {0})")]
    ConcurrentWriter(u32),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Pool(#[from] r2d2::Error),

    #[error(transparent)]
    Tantivy(#[from] tantivy::TantivyError),
}

impl CoreError {
    /// One-line, user-facing summary and remedy (spec.md §7: "one line
    /// summarizing the kind, one suggested remedy; detailed stack traces
    /// only to the log file").
    pub fn user_message(&self) -> String {
        match self {
            Self::NotInitialized => {
                "no index found here — run a full index first".to_string()
            }
            Self::CheckpointIncomplete => {
                "indexing was interrupted — resume it or run a forced rebuild".to_string()
            }
            Self::EmbedderUnavailable(_) => {
                "embedding backend is unreachable — check embeddings.endpoint".to_string()
            }
            Self::EmbedderTimeout => {
                "embedding backend timed out — retry or raise the timeout".to_string()
            }
            Self::DimensionMismatch { .. } => {
                "embedding dimension changed — force a rebuild with the new model".to_string()
            }
            Self::StoreBusy => "store is locked by another operation — retry shortly".to_string(),
            Self::StoreCorrupt(_) => {
                "store integrity check failed — rebuild the index".to_string()
            }
            Self::ConcurrentWriter(pid) => {
                format!("another process (pid {pid}) already owns this data directory")
            }
            Self::InvalidInput(msg) => format!("invalid input: {msg}"),
            Self::Cancelled => "operation cancelled".to_string(),
            Self::Sqlite(_) | Self::Io(_) | Self::Pool(_) | Self::Tantivy(_) => {
                "internal storage error — see logs for details".to_string()
            }
        }
    }

    /// Whether a search-serving call site should treat this as something it
    /// can degrade past (vs. an indexing call site, which should abort the
    /// batch but keep the checkpoint).
    pub fn is_degradable_for_search(&self) -> bool {
        !matches!(self, Self::ConcurrentWriter(_) | Self::Cancelled)
    }
}
