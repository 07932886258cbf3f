//! Hybrid chunk scoring: keyword heuristics fused with embedding similarity.
//!
//! # Keyword score
//!
//! The query is lower-cased and split on whitespace; tokens of two
//! characters or fewer are ignored. For each chunk:
//!
//! 1. `+n` for each token, where `n` is its non-overlapping,
//!    case-insensitive occurrence count in the chunk.
//! 2. `+5` for each pair of query tokens adjacent in the query whose
//!    space-joined form appears in the chunk.
//! 3. `+2 × k` for each paragraph containing `k ≥ 2` distinct tokens.
//!
//! # Semantic score
//!
//! Cosine similarity between the query embedding and each chunk embedding,
//! in `[-1, 1]`.
//!
//! # Fusion
//!
//! ```text
//! hybrid = w × semantic + (1 - w) × (keyword / ceiling)
//! ```
//!
//! with `w = 0.7` and `ceiling = 10` by default. The keyword term is not
//! clamped to 1. When the query has no significant tokens but embeddings
//! are available, the raw semantic score is used alone.
//!
//! Results are sorted by score, descending. The sort is stable, so chunks
//! with equal scores keep their document order.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::capabilities::RetrievalCapabilities;
use crate::embedding::{cosine_similarity, embed_query, Embedder};
use crate::models::{ChunkIndex, EmbeddingSet, ScoredChunk};

/// Tokens this short or shorter are ignored.
const MIN_TOKEN_CHARS: usize = 2;
/// Bonus for two adjacent query tokens found together.
const ADJACENT_PAIR_BONUS: f64 = 5.0;
/// Per-token bonus for paragraphs holding several distinct tokens.
const PARAGRAPH_TOKEN_BONUS: f64 = 2.0;

/// Weights for combining semantic and keyword scores.
#[derive(Debug, Clone, Copy)]
pub struct FusionWeights {
    /// Weight of the semantic score; the keyword score gets `1 - w`.
    pub semantic_weight: f64,
    /// Divisor that maps keyword scores to an approximate `[0, 1]` range.
    pub keyword_ceiling: f64,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            semantic_weight: 0.7,
            keyword_ceiling: 10.0,
        }
    }
}

/// Which scoring path produced a ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoringPath {
    Keyword,
    Semantic,
    Hybrid,
}

/// Lower-cased query tokens.
#[derive(Debug, Clone)]
pub struct QueryTerms {
    /// Every whitespace-separated token, in query order.
    all: Vec<String>,
    /// Distinct tokens longer than [`MIN_TOKEN_CHARS`], in first-seen order.
    distinct: Vec<String>,
}

impl QueryTerms {
    pub fn parse(query: &str) -> Self {
        let all: Vec<String> = query.to_lowercase().split_whitespace().map(String::from).collect();
        let mut seen = HashSet::new();
        let distinct = all
            .iter()
            .filter(|t| significant(t))
            .filter(|t| seen.insert(t.as_str()))
            .cloned()
            .collect();
        Self { all, distinct }
    }

    pub fn is_empty(&self) -> bool {
        self.distinct.is_empty()
    }

    /// Space-joined pairs of significant tokens adjacent in the query.
    fn adjacent_pairs(&self) -> impl Iterator<Item = String> + '_ {
        self.all
            .windows(2)
            .filter(|w| significant(&w[0]) && significant(&w[1]))
            .map(|w| format!("{} {}", w[0], w[1]))
    }
}

fn significant(token: &str) -> bool {
    token.chars().count() > MIN_TOKEN_CHARS
}

/// Keyword score of one chunk's text.
pub fn keyword_score(text: &str, terms: &QueryTerms) -> f64 {
    if terms.is_empty() {
        return 0.0;
    }
    let lower = text.to_lowercase();
    let mut score = 0.0;

    for term in terms.all.iter().filter(|t| significant(t)) {
        score += lower.matches(term.as_str()).count() as f64;
    }

    for pair in terms.adjacent_pairs() {
        if lower.contains(&pair) {
            score += ADJACENT_PAIR_BONUS;
        }
    }

    for para in lower.split("\n\n") {
        let present = terms
            .distinct
            .iter()
            .filter(|t| para.contains(t.as_str()))
            .count();
        if present > 1 {
            score += PARAGRAPH_TOKEN_BONUS * present as f64;
        }
    }

    score
}

/// Cosine similarity of a query vector against every vector of a set.
pub fn semantic_scores(query_vec: &[f32], embeddings: &EmbeddingSet) -> Vec<f64> {
    embeddings
        .vectors
        .iter()
        .map(|v| f64::from(cosine_similarity(query_vec, v)))
        .collect()
}

/// Ranks an index's chunks against a query.
///
/// Holds the retriever's shared [`RetrievalCapabilities`]; a failure to
/// embed the query disables semantic scoring for every later call.
pub struct HybridScorer {
    capabilities: Arc<RetrievalCapabilities>,
    embedder: Option<Arc<dyn Embedder>>,
    weights: FusionWeights,
}

impl HybridScorer {
    pub fn new(
        capabilities: Arc<RetrievalCapabilities>,
        embedder: Option<Arc<dyn Embedder>>,
        weights: FusionWeights,
    ) -> Self {
        Self {
            capabilities,
            embedder,
            weights,
        }
    }

    /// A scorer that never attempts semantic scoring.
    pub fn keyword_only() -> Self {
        Self::new(
            Arc::new(RetrievalCapabilities::keyword_only()),
            None,
            FusionWeights::default(),
        )
    }

    pub fn score<'a>(
        &self,
        query: &str,
        index: &'a ChunkIndex,
        embeddings: Option<&EmbeddingSet>,
    ) -> Vec<ScoredChunk<'a>> {
        self.score_with_path(query, index, embeddings).1
    }

    /// Like [`score`](Self::score), also reporting which path ran.
    pub fn score_with_path<'a>(
        &self,
        query: &str,
        index: &'a ChunkIndex,
        embeddings: Option<&EmbeddingSet>,
    ) -> (ScoringPath, Vec<ScoredChunk<'a>>) {
        let terms = QueryTerms::parse(query);
        let keyword: Vec<f64> = index
            .chunks
            .iter()
            .map(|c| keyword_score(&c.content, &terms))
            .collect();

        let semantic = self.semantic(query, index, embeddings);

        let (path, scores) = match semantic {
            Some(sem) if terms.is_empty() => (ScoringPath::Semantic, sem),
            Some(sem) => {
                let w = self.weights.semantic_weight;
                let fused = sem
                    .iter()
                    .zip(keyword.iter())
                    .map(|(s, k)| w * s + (1.0 - w) * (k / self.weights.keyword_ceiling))
                    .collect();
                (ScoringPath::Hybrid, fused)
            }
            None => (ScoringPath::Keyword, keyword),
        };

        let mut ranked: Vec<ScoredChunk<'a>> = index
            .chunks
            .iter()
            .zip(scores)
            .map(|(chunk, score)| ScoredChunk { chunk, score })
            .collect();
        ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

        debug!(
            document_id = %index.document_id,
            path = ?path,
            top = ranked.first().map(|s| s.score),
            "scored chunks"
        );
        (path, ranked)
    }

    /// Semantic scores, or `None` when the semantic path is unavailable.
    fn semantic(
        &self,
        query: &str,
        index: &ChunkIndex,
        embeddings: Option<&EmbeddingSet>,
    ) -> Option<Vec<f64>> {
        if !self.capabilities.embeddings_enabled() {
            return None;
        }
        let embedder = self.embedder.as_ref()?;
        let set = embeddings?;
        if !set.matches(index) {
            warn!(
                document_id = %index.document_id,
                vectors = set.vectors.len(),
                chunks = index.chunks.len(),
                "embedding set does not match chunk index; using keyword scoring"
            );
            return None;
        }

        match embed_query(embedder.as_ref(), query) {
            Ok(qv) if qv.len() == set.dims => Some(semantic_scores(&qv, set)),
            Ok(qv) => {
                warn!(
                    expected = set.dims,
                    got = qv.len(),
                    "query embedding has the wrong dimensionality; using keyword scoring"
                );
                None
            }
            Err(e) => {
                if self.capabilities.disable_embeddings() {
                    warn!(error = %e, "query embedding failed; semantic scoring disabled");
                }
                None
            }
        }
    }
}
