//! Page embedding index
//!
//! Linear-scan nearest neighbour search over page embeddings. Collections are
//! a handful of manuals, so a full scan per query is cheap.

use super::encoder::cosine_similarity;
use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VectorIndex {
    embeddings: Vec<Vec<f32>>,
    page_ids: Vec<u32>, // position -> page id
    embedding_dim: usize,
}

impl VectorIndex {
    pub fn new(embedding_dim: usize) -> Self {
        Self {
            embeddings: Vec::new(),
            page_ids: Vec::new(),
            embedding_dim,
        }
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    pub fn add(&mut self, page_id: u32, embedding: Vec<f32>) -> Result<()> {
        if embedding.len() != self.embedding_dim {
            anyhow::bail!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.embedding_dim,
                embedding.len()
            );
        }

        self.embeddings.push(embedding);
        self.page_ids.push(page_id);

        Ok(())
    }

    /// Top `k` pages by cosine similarity, best first
    pub fn search(&self, query_embedding: &[f32], k: usize) -> Vec<(u32, f32)> {
        self.search_filtered(query_embedding, k, |_| true)
    }

    /// Top `k` pages accepted by `keep`, best first.
    ///
    /// Filtering happens before truncation, so up to `k` matching pages are
    /// returned even when better-scoring pages are rejected.
    pub fn search_filtered<F>(&self, query_embedding: &[f32], k: usize, keep: F) -> Vec<(u32, f32)>
    where
        F: Fn(u32) -> bool,
    {
        if query_embedding.len() != self.embedding_dim || k == 0 {
            return Vec::new();
        }

        let mut results: Vec<(u32, f32)> = self
            .embeddings
            .iter()
            .zip(&self.page_ids)
            .filter(|(_, page_id)| keep(**page_id))
            .map(|(emb, &page_id)| (page_id, cosine_similarity(query_embedding, emb)))
            .collect();

        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(k);

        results
    }

    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }
}
