//! Guideline retrieval: query embedding, vector lookup and the similarity
//! threshold policy.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::RetrievalError;
use crate::models::ContextChunk;

#[cfg(feature = "fastembed")]
mod onnx;
#[cfg(feature = "postgres")]
mod pgvector;

#[cfg(feature = "fastembed")]
pub use self::onnx::FastEmbedder;
#[cfg(feature = "postgres")]
pub use self::pgvector::PgVectorIndex;

/// Turns query text into a vector in the same space as the stored chunks.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError>;
}

/// A chunk returned by an index together with its cosine similarity.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub page: u32,
    pub text: String,
    pub similarity: f32,
}

/// Read-only nearest-neighbour lookup over the ingested guideline.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Up to `k` chunks ordered by descending similarity.
    async fn search(&self, embedding: &[f32], k: usize) -> Result<Vec<ScoredChunk>, RetrievalError>;
}

/// Query text in, ranked guideline excerpts out.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<ContextChunk>, RetrievalError>;
}

/// Embeds the query, searches the index, then applies the similarity
/// threshold and collapses chunks with identical text.
pub struct GuidelineRetriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    similarity_threshold: f32,
}

impl GuidelineRetriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        similarity_threshold: f32,
    ) -> Self {
        Self {
            embedder,
            index,
            similarity_threshold,
        }
    }
}

#[async_trait]
impl Retriever for GuidelineRetriever {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<ContextChunk>, RetrievalError> {
        if k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let embedding = self.embedder.embed(query).await?;
        // over-fetch so that de-duplication can still fill k slots
        let mut candidates = self.index.search(&embedding, k * 2).await?;
        candidates.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));

        let fetched = candidates.len();
        let mut seen = std::collections::HashSet::new();
        let chunks: Vec<ContextChunk> = candidates
            .into_iter()
            .filter(|c| c.similarity >= self.similarity_threshold)
            .filter(|c| seen.insert(c.text.trim().to_string()))
            .take(k)
            .enumerate()
            .map(|(i, c)| ContextChunk {
                rank: i + 1,
                page: c.page,
                text: c.text,
                similarity: c.similarity,
            })
            .collect();

        debug!(
            fetched,
            kept = chunks.len(),
            threshold = self.similarity_threshold,
            "guideline retrieval finished"
        );
        Ok(chunks)
    }
}

/// One stored chunk of the ingested guideline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedChunk {
    pub page: u32,
    pub text: String,
    pub embedding: Vec<f32>,
}

/// Exhaustive cosine scan over chunks held in memory, loaded from a JSON
/// export of the ingested index.
#[derive(Debug, Clone, Default)]
pub struct InMemoryVectorIndex {
    chunks: Vec<IndexedChunk>,
}

impl InMemoryVectorIndex {
    pub fn new(chunks: Vec<IndexedChunk>) -> Self {
        Self { chunks }
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, RetrievalError> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            RetrievalError::IndexUnavailable(format!("cannot read {}: {e}", path.display()))
        })?;
        let chunks: Vec<IndexedChunk> = serde_json::from_slice(&bytes).map_err(|e| {
            RetrievalError::IndexUnavailable(format!("cannot parse {}: {e}", path.display()))
        })?;
        info!(path = %path.display(), chunks = chunks.len(), "loaded guideline index");
        Ok(Self::new(chunks))
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn search(&self, embedding: &[f32], k: usize) -> Result<Vec<ScoredChunk>, RetrievalError> {
        let mut scored = Vec::with_capacity(self.chunks.len());
        for chunk in &self.chunks {
            if chunk.embedding.len() != embedding.len() {
                return Err(RetrievalError::DimensionMismatch {
                    query: embedding.len(),
                    index: chunk.embedding.len(),
                });
            }
            scored.push(ScoredChunk {
                page: chunk.page,
                text: chunk.text.clone(),
                similarity: cosine_similarity(embedding, &chunk.embedding),
            });
        }
        scored.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        scored.truncate(k);
        Ok(scored)
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Fixed query → vector table, for wiring retrieval without a model.
#[derive(Debug, Clone, Default)]
pub struct StaticEmbedder {
    vectors: HashMap<String, Vec<f32>>,
    fallback: Vec<f32>,
}

impl StaticEmbedder {
    pub fn new(fallback: Vec<f32>) -> Self {
        Self {
            vectors: HashMap::new(),
            fallback,
        }
    }

    pub fn with(mut self, query: impl Into<String>, vector: Vec<f32>) -> Self {
        self.vectors.insert(query.into(), vector);
        self
    }
}

#[async_trait]
impl Embedder for StaticEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        Ok(self
            .vectors
            .get(text)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone()))
    }
}
