//! Intent Search - the opaque embedding and scoring boundaries
//!
//! The embedding model is `encode(text) → vector`; ranking strategies live
//! behind `score(intent, candidates, contextTools) → ranked`. Both ship with
//! reference implementations: a deterministic token-hash embedder and cosine
//! similarity. Production deployments plug in real models and learned
//! scorers without touching the registry.

use std::sync::Arc;

use xxhash_rust::xxh3::xxh3_64;

use crate::registry::capability::Capability;

/// The opaque embedding model: `encode(text) → vector`.
pub trait Embedder: Send + Sync {
    fn encode(&self, text: &str) -> Vec<f32>;

    fn dimensions(&self) -> usize;
}

/// Deterministic bag-of-tokens hash embedder (reference implementation).
///
/// Not a language model: tokens hash into a fixed number of buckets and the
/// result is L2-normalised. Good enough to make similarity search
/// deterministic and testable.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(8) }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(64)
    }
}

impl Embedder for HashEmbedder {
    fn encode(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let token = token.to_lowercase();
            let bucket = (xxh3_64(token.as_bytes()) as usize) % self.dims;
            vector[bucket] += 1.0;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

/// Cosine similarity between two vectors; 0.0 when either is degenerate.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

/// A scored candidate out of the ranker.
#[derive(Debug, Clone)]
pub struct Ranked {
    pub id: String,
    pub score: f32,
}

/// The pluggable ranking strategy.
pub trait Scorer: Send + Sync {
    /// Rank candidates against an intent embedding. `context_tools` lets a
    /// strategy boost capabilities whose tools are currently connected.
    fn score(
        &self,
        intent_embedding: &[f32],
        candidates: &[Capability],
        context_tools: &[Arc<str>],
    ) -> Vec<Ranked>;
}

/// Cosine-similarity scorer with a small boost for capabilities whose tools
/// are all available in the current context.
#[derive(Debug, Clone, Default)]
pub struct CosineScorer;

impl Scorer for CosineScorer {
    fn score(
        &self,
        intent_embedding: &[f32],
        candidates: &[Capability],
        context_tools: &[Arc<str>],
    ) -> Vec<Ranked> {
        let mut ranked: Vec<Ranked> = candidates
            .iter()
            .map(|cap| {
                let mut score = cosine(intent_embedding, &cap.intent_embedding);
                if !context_tools.is_empty()
                    && cap
                        .tools_used
                        .iter()
                        .filter(|t| !t.starts_with("code:"))
                        .all(|t| context_tools.contains(t))
                {
                    score += 0.05;
                }
                Ranked {
                    id: cap.id.clone(),
                    score: score.min(1.0),
                }
            })
            .collect();

        ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        ranked
    }
}
