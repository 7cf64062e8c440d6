//! Configuration data (spec.md §6). Parsing a config file off disk is an
//! external concern (see spec.md §1); this module only holds the struct and
//! its defaults, which every core component reads from.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bm25Backend {
    Sqlite,
    Bleve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Quantization {
    F32,
    F16,
    I8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingsConfig {
    pub provider: String,
    pub model: String,
    pub endpoint: Option<String>,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            provider: "candle".to_string(),
            model: "sentence-transformers/all-MiniLM-L6-v2".to_string(),
            endpoint: None,
        }
    }
}

/// A glob pattern and the multiplicative adjustment applied to any result
/// whose file path matches it (spec.md §4.11 step 7: boost paths that tend
/// to hold library code, penalize paths that tend to hold entrypoints/tests).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathScoreAdjustment {
    pub pattern: String,
    pub factor: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub bm25_weight: f32,
    pub semantic_weight: f32,
    pub rrf_constant: f32,
    pub max_results: usize,
    pub bm25_backend: Bm25Backend,
    pub per_leg_deadline_ms: u64,
    pub path_score_adjustments: Vec<PathScoreAdjustment>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            bm25_weight: 0.5,
            semantic_weight: 0.5,
            rrf_constant: 60.0,
            max_results: 10,
            bm25_backend: Bm25Backend::Sqlite,
            per_leg_deadline_ms: 2_000,
            path_score_adjustments: vec![
                PathScoreAdjustment { pattern: "internal/**".to_string(), factor: 1.15 },
                PathScoreAdjustment { pattern: "cmd/**".to_string(), factor: 0.85 },
                PathScoreAdjustment { pattern: "**/tests/**".to_string(), factor: 0.85 },
                PathScoreAdjustment { pattern: "**/*_test.*".to_string(), factor: 0.85 },
            ],
        }
    }
}

impl SearchConfig {
    /// `search.max_results` is clamped to a hard cap of 100 per spec.md §6.
    pub fn clamp_limit(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.max_results).clamp(1, 100)
    }

    pub fn validate(&self) -> Result<(), crate::error::CoreError> {
        if !(0.0..=1.0).contains(&self.bm25_weight) || !(0.0..=1.0).contains(&self.semantic_weight)
        {
            return Err(crate::error::CoreError::InvalidInput(
                "search weights must be in [0,1]".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorStoreConfig {
    pub quantization: Quantization,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            quantization: Quantization::F32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub exclude: Vec<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self { exclude: vec![] }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextualConfig {
    pub enabled: bool,
    pub model: Option<String>,
    pub timeout_ms: u64,
}

impl Default for ContextualConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: None,
            timeout_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub storage_path: Option<String>,
    pub max_sessions: usize,
    pub auto_save: bool,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            storage_path: None,
            max_sessions: 20,
            auto_save: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub embeddings: EmbeddingsConfig,
    pub search: SearchConfig,
    pub vector_store: VectorStoreConfig,
    pub paths: PathsConfig,
    pub contextual: ContextualConfig,
    pub sessions: SessionsConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let cfg = Config::default();
        assert!(cfg.search.validate().is_ok());
    }

    #[test]
    fn clamp_limit_respects_hard_cap() {
        let cfg = SearchConfig::default();
        assert_eq!(cfg.clamp_limit(Some(500)), 100);
        assert_eq!(cfg.clamp_limit(Some(0)), 1);
        assert_eq!(cfg.clamp_limit(None), 10);
    }
}
