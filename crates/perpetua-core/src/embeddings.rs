// Deterministic embedding helpers for best-effort tool retrieval
//
// The default provider hashes text into a fixed-size normalized vector. It is
// deterministic, dependency-free at runtime, and cheap enough to run per step;
// a real embedding backend can be plugged in via `with_embedder`.

use std::sync::Arc;

use sha2::{Digest, Sha256};

pub const EMBEDDING_DIM: usize = 64;

/// Cosine similarity over pre-normalized vectors
pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    if left.is_empty() || left.len() != right.len() {
        return 0.0;
    }
    left.iter().zip(right).map(|(l, r)| l * r).sum()
}

fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }
    vector
}

/// An embedding vector with similarity utilities
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub vector: Vec<f32>,
}

impl Embedding {
    pub fn similarity(&self, other: &[f32]) -> f32 {
        cosine_similarity(&self.vector, other)
    }
}

type EmbedderFn = dyn Fn(&str) -> Vec<f32> + Send + Sync;

/// Embedding provider with a pluggable backend
#[derive(Clone)]
pub struct EmbeddingProvider {
    embedder: Arc<EmbedderFn>,
}

impl Default for EmbeddingProvider {
    fn default() -> Self {
        Self {
            embedder: Arc::new(hash_embed),
        }
    }
}

impl std::fmt::Debug for EmbeddingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingProvider").finish_non_exhaustive()
    }
}

impl EmbeddingProvider {
    pub fn with_embedder(embedder: impl Fn(&str) -> Vec<f32> + Send + Sync + 'static) -> Self {
        Self {
            embedder: Arc::new(embedder),
        }
    }

    pub fn embed_text(&self, text: &str) -> Embedding {
        Embedding {
            vector: normalize((self.embedder)(text)),
        }
    }
}

fn hash_embed(text: &str) -> Vec<f32> {
    let digest = Sha256::digest(text.as_bytes());
    digest
        .iter()
        .cycle()
        .take(EMBEDDING_DIM)
        .map(|byte| *byte as f32 / 255.0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_is_deterministic_and_normalized() {
        let provider = EmbeddingProvider::default();
        let a = provider.embed_text("web search");
        let b = provider.embed_text("web search");
        assert_eq!(a, b);
        let norm: f32 = a.vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn identical_text_has_max_similarity() {
        let provider = EmbeddingProvider::default();
        let a = provider.embed_text("memory file tool");
        assert!((a.similarity(&a.vector) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn mismatched_lengths_score_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }
}
