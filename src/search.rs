//! C11 SearchEngine: the hybrid retrieval pipeline. Generalizes the
//! teacher's `Searcher::search` (scan/diff/embed/upsert inlined into one
//! vector search with a flat `+0.5` substring-match boost) into query
//! classification, optional code-aware expansion, parallel BM25+vector legs
//! per sub-query, weighted RRF fusion, consensus fusion across sub-queries,
//! optional cross-encoder rerank, and filter+path-boost+hydrate.

use crate::config::SearchConfig;
use crate::embedding::Embedder;
use crate::error::CoreError;
use crate::model::{ChunkRow, ContentType, SymbolKind};
use crate::store::MetadataStore;
use crate::text_index::{split_identifier, Bm25Index};
use crate::vector_index::VectorIndex;
use globset::{Glob, GlobMatcher};
use lru::LruCache;
use serde::Serialize;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryClass {
    /// Dominated by identifier-ish tokens: "parseConfig", "fn main(".
    Lexical,
    /// Reads as prose: "how do I open a file".
    Semantic,
    /// A longer phrase that also carries an identifier-like token.
    Mixed,
}

/// Classifies a query by a cheap pattern check: presence of camelCase/
/// snake_case identifiers, punctuation typical of code (`(`, `::`, `->`),
/// token count, and whether any single token looks like an identifier.
fn classify(query: &str) -> QueryClass {
    let trimmed = query.trim();
    let has_code_punct =
        trimmed.contains("::") || trimmed.contains("->") || trimmed.contains('(') || trimmed.contains('{');
    let word_count = trimmed.split_whitespace().count();
    let has_identifier_token = trimmed.split_whitespace().any(|tok| {
        (tok.contains('_') || tok.chars().any(|c| c.is_uppercase()))
            && tok.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    });

    if has_code_punct || (word_count <= 2 && has_identifier_token) {
        QueryClass::Lexical
    } else if word_count > 2 && has_identifier_token {
        QueryClass::Mixed
    } else {
        QueryClass::Semantic
    }
}

/// Per-leg RRF weights for a query class. `Mixed` defers to the
/// admin-configured `bm25_weight`/`semantic_weight` rather than a fixed
/// preset, since a mixed query is exactly the case those knobs exist for.
fn class_weights(class: QueryClass, config: &SearchConfig) -> (f32, f32) {
    match class {
        QueryClass::Lexical => (0.85, 0.15),
        QueryClass::Semantic => (0.20, 0.80),
        QueryClass::Mixed => (config.bm25_weight, config.semantic_weight),
    }
}

/// Cross-encoder-style reranker over the top-N fused candidates. An HTTP
/// implementation can call out to a reranking service; [`NoopReranker`]
/// leaves the fused order untouched when unavailable.
#[async_trait::async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, candidates: &[(String, String)]) -> Result<Vec<(String, f32)>, CoreError>;
}

pub struct NoopReranker;

#[async_trait::async_trait]
impl Reranker for NoopReranker {
    async fn rerank(&self, _query: &str, candidates: &[(String, String)]) -> Result<Vec<(String, f32)>, CoreError> {
        Ok(candidates
            .iter()
            .enumerate()
            .map(|(i, (id, _))| (id.clone(), 1.0 - (i as f32 * 1e-4)))
            .collect())
    }
}

/// An HTTP cross-encoder reranker; a non-2xx response, a timeout, or a
/// connection failure is the caller's problem to degrade past (per spec:
/// optional rerank falls back to fused order on unavailability).
pub struct HttpReranker {
    endpoint: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpReranker {
    pub fn new(endpoint: String, timeout: Duration) -> Self {
        Self { endpoint, client: reqwest::Client::new(), timeout }
    }
}

#[async_trait::async_trait]
impl Reranker for HttpReranker {
    async fn rerank(&self, query: &str, candidates: &[(String, String)]) -> Result<Vec<(String, f32)>, CoreError> {
        #[derive(serde::Serialize)]
        struct Req<'a> {
            query: &'a str,
            documents: &'a [(String, String)],
        }
        #[derive(serde::Deserialize)]
        struct RespItem {
            id: String,
            score: f32,
        }

        let req = Req { query, documents: candidates };
        let resp = tokio::time::timeout(self.timeout, self.client.post(&self.endpoint).json(&req).send())
            .await
            .map_err(|_| CoreError::EmbedderTimeout)?
            .map_err(|e| CoreError::EmbedderUnavailable(e.to_string()))?;

        let items: Vec<RespItem> = resp
            .json()
            .await
            .map_err(|e| CoreError::EmbedderUnavailable(e.to_string()))?;
        Ok(items.into_iter().map(|i| (i.id, i.score)).collect())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub raw_content: String,
    pub context: String,
    pub score: f32,
    pub bm25_score: Option<f32>,
    pub vector_score: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub limit: usize,
    pub path_prefix: Option<String>,
    pub content_type: Option<ContentType>,
    pub language: Option<String>,
    pub symbol_type: Option<SymbolKind>,
    /// Explicit (bm25, vector) RRF weight override. When absent, weights
    /// are derived from the query's classification.
    pub weights: Option<(f32, f32)>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            path_prefix: None,
            content_type: None,
            language: None,
            symbol_type: None,
            weights: None,
        }
    }
}

#[derive(Clone)]
struct FusedCandidate {
    chunk_id: String,
    fused_score: f32,
    in_both: bool,
    bm25_score: Option<f32>,
    vector_score: Option<f32>,
}

pub struct SearchEngine {
    metadata: Arc<MetadataStore>,
    bm25: Arc<dyn Bm25Index>,
    vectors: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    reranker: Arc<dyn Reranker>,
    config: SearchConfig,
    classification_cache: Mutex<LruCache<String, QueryClass>>,
    path_adjustments: Vec<(GlobMatcher, f32)>,
}

impl SearchEngine {
    pub fn new(
        metadata: Arc<MetadataStore>,
        bm25: Arc<dyn Bm25Index>,
        vectors: Arc<VectorIndex>,
        embedder: Arc<dyn Embedder>,
        reranker: Arc<dyn Reranker>,
        config: SearchConfig,
    ) -> Self {
        let path_adjustments = config
            .path_score_adjustments
            .iter()
            .filter_map(|adj| Glob::new(&adj.pattern).ok().map(|g| (g.compile_matcher(), adj.factor)))
            .collect();
        Self {
            metadata,
            bm25,
            vectors,
            embedder,
            reranker,
            config,
            classification_cache: Mutex::new(LruCache::new(NonZeroUsize::new(512).unwrap())),
            path_adjustments,
        }
    }

    fn classify_cached(&self, query: &str) -> QueryClass {
        let mut cache = self.classification_cache.lock().unwrap();
        if let Some(class) = cache.get(query) {
            return *class;
        }
        let class = classify(query);
        cache.put(query.to_string(), class);
        class
    }

    /// Splits a code-like query into identifier pieces (reusing the BM25
    /// tokenizer's camelCase/snake_case splitter) and returns the original
    /// query plus one expansion query built from the split tokens, when
    /// expansion would add anything new.
    fn expand(&self, query: &str, class: QueryClass) -> Vec<String> {
        let mut queries = vec![query.to_string()];
        if class == QueryClass::Semantic {
            return queries;
        }
        let tokens: Vec<String> = query.split_whitespace().flat_map(split_identifier).collect();
        let expanded = tokens.join(" ");
        if !expanded.is_empty() && expanded != query.to_lowercase() {
            queries.push(expanded);
        }
        queries
    }

    pub async fn search(&self, query: &str, options: SearchOptions) -> Result<Vec<SearchResult>, CoreError> {
        let start = std::time::Instant::now();
        let class = self.classify_cached(query);
        let (weight_bm25, weight_vector) = options.weights.unwrap_or_else(|| class_weights(class, &self.config));
        let sub_queries = self.expand(query, class);
        let deadline = Duration::from_millis(self.config.per_leg_deadline_ms);
        let fetch_limit = (options.limit * 3).max(50);

        let mut per_query_fused = Vec::with_capacity(sub_queries.len());
        for sub_query in &sub_queries {
            let fused = self
                .run_one_query(sub_query, fetch_limit, deadline, weight_bm25, weight_vector)
                .await?;
            per_query_fused.push(fused);
        }

        let consensus = consensus_fuse(per_query_fused);
        let top_n: Vec<FusedCandidate> = consensus.into_iter().take(fetch_limit).collect();

        let ids: Vec<String> = top_n.iter().map(|c| c.chunk_id.clone()).collect();
        let rows = self.metadata.get_chunks_by_ids(&ids)?;
        let rows_by_id: HashMap<String, ChunkRow> = rows.into_iter().map(|r| (r.id.clone(), r)).collect();

        let symbol_kinds = if options.symbol_type.is_some() {
            self.metadata.get_symbol_kinds_for_chunks(&ids)?
        } else {
            HashMap::new()
        };

        let reranked_order = self.maybe_rerank(query, &top_n, &rows_by_id).await;

        let mut filtered: Vec<FusedCandidate> = Vec::new();
        for candidate in &reranked_order {
            let Some(row) = rows_by_id.get(&candidate.chunk_id) else { continue };
            if let Some(prefix) = &options.path_prefix {
                if !row.file_path.starts_with(prefix.as_str()) {
                    continue;
                }
            }
            if let Some(content_type) = options.content_type {
                if row.content_type != content_type {
                    continue;
                }
            }
            if let Some(language) = &options.language {
                if row.language.as_deref() != Some(language.as_str()) {
                    continue;
                }
            }
            if let Some(symbol_type) = options.symbol_type {
                let kinds = symbol_kinds.get(&row.id);
                if !kinds.map(|k| k.contains(&symbol_type)).unwrap_or(false) {
                    continue;
                }
            }
            let adjustment = self.path_score_adjustment(&row.file_path);
            filtered.push(FusedCandidate {
                chunk_id: candidate.chunk_id.clone(),
                fused_score: candidate.fused_score * adjustment,
                in_both: candidate.in_both,
                bm25_score: candidate.bm25_score,
                vector_score: candidate.vector_score,
            });
        }
        sort_with_tiebreak(&mut filtered);

        let mut results = Vec::new();
        for candidate in filtered {
            let Some(row) = rows_by_id.get(&candidate.chunk_id) else { continue };
            results.push(SearchResult {
                chunk_id: row.id.clone(),
                file_path: row.file_path.clone(),
                start_line: row.start_line,
                end_line: row.end_line,
                raw_content: row.raw_content.clone(),
                context: row.context.clone(),
                score: candidate.fused_score,
                bm25_score: candidate.bm25_score,
                vector_score: candidate.vector_score,
            });
            if results.len() >= options.limit {
                break;
            }
        }

        let latency_bucket = latency_bucket(start.elapsed());
        let query_type = match class {
            QueryClass::Lexical => "lexical",
            QueryClass::Semantic => "semantic",
            QueryClass::Mixed => "mixed",
        };
        let day = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let _ = self.metadata.record_telemetry(&day, query_type, latency_bucket);

        Ok(results)
    }

    /// Multiplicative score adjustment for a file path: the first matching
    /// configured pattern wins (spec.md §4.11 step 7); paths matching none
    /// are left unadjusted.
    fn path_score_adjustment(&self, file_path: &str) -> f32 {
        for (matcher, factor) in &self.path_adjustments {
            if matcher.is_match(file_path) {
                return *factor;
            }
        }
        1.0
    }

    /// Runs the BM25 and vector legs for one (sub-)query concurrently, each
    /// bounded by `deadline`. A leg that errors or times out degrades to an
    /// empty result set rather than failing the whole search.
    async fn run_one_query(
        &self,
        query: &str,
        fetch_limit: usize,
        deadline: Duration,
        weight_bm25: f32,
        weight_vector: f32,
    ) -> Result<Vec<FusedCandidate>, CoreError> {
        let bm25 = self.bm25.clone();
        let query_owned = query.to_string();
        let bm25_fut = tokio::time::timeout(
            deadline,
            tokio::task::spawn_blocking(move || bm25.search(&query_owned, fetch_limit)),
        );

        let embedder = self.embedder.clone();
        let vectors = self.vectors.clone();
        let query_for_embed = query.to_string();
        let ef_search = fetch_limit.max(64);
        let vector_fut = async {
            let embedding = tokio::time::timeout(deadline, embedder.embed_batch(&[query_for_embed]))
                .await
                .map_err(|_| CoreError::EmbedderTimeout)?
                .map_err(CoreError::from)?;
            let query_vector = embedding.into_iter().next().unwrap_or_default();
            vectors.search(&query_vector, fetch_limit, ef_search)
        };

        let (bm25_result, vector_result) = tokio::join!(bm25_fut, vector_fut);

        let bm25_hits: Vec<(String, f32)> = match bm25_result {
            Ok(Ok(Ok(hits))) => hits,
            Ok(Ok(Err(e))) => {
                tracing::warn!(error = %e, "bm25 leg failed, degrading to vector-only");
                vec![]
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "bm25 leg panicked, degrading to vector-only");
                vec![]
            }
            Err(_) => {
                tracing::warn!("bm25 leg timed out, degrading to vector-only");
                vec![]
            }
        };

        let vector_hits: Vec<(String, f32)> = match vector_result {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(error = %e, "vector leg failed, degrading to bm25-only");
                vec![]
            }
        };

        Ok(rrf_fuse(&bm25_hits, &vector_hits, self.config.rrf_constant, weight_bm25, weight_vector))
    }

    async fn maybe_rerank(
        &self,
        query: &str,
        candidates: &[FusedCandidate],
        rows_by_id: &HashMap<String, ChunkRow>,
    ) -> Vec<FusedCandidate> {
        let pairs: Vec<(String, String)> = candidates
            .iter()
            .filter_map(|c| rows_by_id.get(&c.chunk_id).map(|row| (c.chunk_id.clone(), row.raw_content.clone())))
            .collect();

        match self.reranker.rerank(query, &pairs).await {
            Ok(scores) if !scores.is_empty() => {
                let score_map: HashMap<String, f32> = scores.into_iter().collect();
                let mut ordered: Vec<FusedCandidate> = candidates
                    .iter()
                    .map(|c| FusedCandidate {
                        chunk_id: c.chunk_id.clone(),
                        fused_score: *score_map.get(&c.chunk_id).unwrap_or(&c.fused_score),
                        in_both: c.in_both,
                        bm25_score: c.bm25_score,
                        vector_score: c.vector_score,
                    })
                    .collect();
                ordered.sort_by(|a, b| b.fused_score.partial_cmp(&a.fused_score).unwrap_or(std::cmp::Ordering::Equal));
                ordered
            }
            _ => candidates.to_vec(),
        }
    }
}

/// Weighted Reciprocal Rank Fusion of one BM25 leg and one vector leg:
/// `score(d) = Σ_i weight_i / (k + rank_i(d))`, with the deterministic
/// tie-break: fused score desc, then in-both-lists first, then raw BM25
/// score desc, then chunk id asc.
fn rrf_fuse(
    bm25_hits: &[(String, f32)],
    vector_hits: &[(String, f32)],
    k: f32,
    weight_bm25: f32,
    weight_vector: f32,
) -> Vec<FusedCandidate> {
    let mut scores: HashMap<String, (f32, Option<f32>, Option<f32>)> = HashMap::new();

    for (rank, (id, score)) in bm25_hits.iter().enumerate() {
        let entry = scores.entry(id.clone()).or_insert((0.0, None, None));
        entry.0 += weight_bm25 / (k + rank as f32 + 1.0);
        entry.1 = Some(*score);
    }
    for (rank, (id, score)) in vector_hits.iter().enumerate() {
        let entry = scores.entry(id.clone()).or_insert((0.0, None, None));
        entry.0 += weight_vector / (k + rank as f32 + 1.0);
        entry.2 = Some(*score);
    }

    let mut candidates: Vec<FusedCandidate> = scores
        .into_iter()
        .map(|(chunk_id, (fused_score, bm25_score, vector_score))| FusedCandidate {
            in_both: bm25_score.is_some() && vector_score.is_some(),
            chunk_id,
            fused_score,
            bm25_score,
            vector_score,
        })
        .collect();

    sort_with_tiebreak(&mut candidates);
    candidates
}

fn sort_with_tiebreak(candidates: &mut [FusedCandidate]) {
    candidates.sort_by(|a, b| {
        b.fused_score
            .partial_cmp(&a.fused_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.in_both.cmp(&a.in_both))
            .then_with(|| {
                b.bm25_score
                    .unwrap_or(f32::MIN)
                    .partial_cmp(&a.bm25_score.unwrap_or(f32::MIN))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

/// Consensus fusion across sub-queries: sums each chunk's fused score from
/// every sub-query's RRF pass, keeping the same tie-break.
fn consensus_fuse(per_query: Vec<Vec<FusedCandidate>>) -> Vec<FusedCandidate> {
    let mut totals: HashMap<String, (f32, bool, Option<f32>, Option<f32>)> = HashMap::new();
    for query_results in per_query {
        for candidate in query_results {
            let entry = totals.entry(candidate.chunk_id.clone()).or_insert((0.0, false, None, None));
            entry.0 += candidate.fused_score;
            entry.1 |= candidate.in_both;
            entry.2 = entry.2.or(candidate.bm25_score);
            entry.3 = entry.3.or(candidate.vector_score);
        }
    }

    let mut candidates: Vec<FusedCandidate> = totals
        .into_iter()
        .map(|(chunk_id, (fused_score, in_both, bm25_score, vector_score))| FusedCandidate {
            chunk_id,
            fused_score,
            in_both,
            bm25_score,
            vector_score,
        })
        .collect();
    sort_with_tiebreak(&mut candidates);
    candidates
}

fn latency_bucket(elapsed: Duration) -> &'static str {
    let ms = elapsed.as_millis();
    if ms < 50 {
        "lt_50ms"
    } else if ms < 200 {
        "lt_200ms"
    } else if ms < 1000 {
        "lt_1s"
    } else {
        "gte_1s"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_detects_code_like_queries() {
        assert_eq!(classify("parseConfigFile"), QueryClass::Lexical);
        assert_eq!(classify("max_file_size"), QueryClass::Lexical);
        assert_eq!(classify("how do I open a file"), QueryClass::Semantic);
        assert_eq!(classify("how does max_file_size get validated on startup"), QueryClass::Mixed);
    }

    #[test]
    fn class_weights_uses_config_for_mixed_queries() {
        let mut config = SearchConfig::default();
        config.bm25_weight = 0.4;
        config.semantic_weight = 0.6;
        assert_eq!(class_weights(QueryClass::Lexical, &config), (0.85, 0.15));
        assert_eq!(class_weights(QueryClass::Semantic, &config), (0.20, 0.80));
        assert_eq!(class_weights(QueryClass::Mixed, &config), (0.4, 0.6));
    }

    #[test]
    fn rrf_fuse_ranks_items_in_both_lists_higher() {
        let bm25 = vec![("a".to_string(), 5.0), ("b".to_string(), 3.0)];
        let vector = vec![("b".to_string(), 0.9), ("c".to_string(), 0.8)];
        let fused = rrf_fuse(&bm25, &vector, 60.0, 0.5, 0.5);
        assert_eq!(fused[0].chunk_id, "b");
        assert!(fused[0].in_both);
    }

    #[test]
    fn rrf_fuse_weights_favor_the_heavier_leg() {
        let bm25 = vec![("a".to_string(), 5.0)];
        let vector = vec![("b".to_string(), 0.9)];
        let fused = rrf_fuse(&bm25, &vector, 60.0, 0.85, 0.15);
        let a_score = fused.iter().find(|c| c.chunk_id == "a").unwrap().fused_score;
        let b_score = fused.iter().find(|c| c.chunk_id == "b").unwrap().fused_score;
        assert!(a_score > b_score);
    }

    #[test]
    fn tiebreak_orders_by_chunk_id_when_scores_equal() {
        let mut candidates = vec![
            FusedCandidate { chunk_id: "z".to_string(), fused_score: 1.0, in_both: false, bm25_score: None, vector_score: None },
            FusedCandidate { chunk_id: "a".to_string(), fused_score: 1.0, in_both: false, bm25_score: None, vector_score: None },
        ];
        sort_with_tiebreak(&mut candidates);
        assert_eq!(candidates[0].chunk_id, "a");
    }

    #[test]
    fn consensus_fuse_sums_scores_across_sub_queries() {
        let q1 = vec![FusedCandidate {
            chunk_id: "a".to_string(),
            fused_score: 0.5,
            in_both: true,
            bm25_score: Some(1.0),
            vector_score: Some(0.5),
        }];
        let q2 = vec![FusedCandidate {
            chunk_id: "a".to_string(),
            fused_score: 0.3,
            in_both: false,
            bm25_score: None,
            vector_score: Some(0.4),
        }];
        let fused = consensus_fuse(vec![q1, q2]);
        assert!((fused[0].fused_score - 0.8).abs() < 1e-6);
    }
}
