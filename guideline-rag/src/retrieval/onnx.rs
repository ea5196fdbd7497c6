use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use tracing::{debug, info};

use super::Embedder;
use crate::error::RetrievalError;

/// Local ONNX sentence embedder; must match the model used at ingestion.
#[derive(Clone)]
pub struct FastEmbedder {
    model: Arc<Mutex<TextEmbedding>>,
}

impl FastEmbedder {
    /// Loads (and on first use downloads) the AllMiniLML6V2 model.
    pub async fn new() -> Result<Self, RetrievalError> {
        info!("Loading fastembed model AllMiniLML6V2");
        let model = tokio::task::spawn_blocking(|| {
            TextEmbedding::try_new(
                InitOptions::new(EmbeddingModel::AllMiniLML6V2).with_show_download_progress(true),
            )
        })
        .await
        .map_err(|e| RetrievalError::Embedding(format!("model loader panicked: {e}")))?
        .map_err(|e| RetrievalError::Embedding(e.to_string()))?;

        Ok(Self {
            model: Arc::new(Mutex::new(model)),
        })
    }
}

#[async_trait]
impl Embedder for FastEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        let input = text.to_owned();
        let model = Arc::clone(&self.model);

        // Off-load the ONNX inference to a blocking thread so we don't
        // obstruct Tokio's async scheduler.
        let embedding = tokio::task::spawn_blocking(move || {
            let mut model = model.lock().unwrap_or_else(PoisonError::into_inner);
            let mut embeddings = model.embed(vec![input], None)?;
            embeddings
                .pop()
                .ok_or_else(|| anyhow::anyhow!("embedding model returned no vectors"))
        })
        .await
        .map_err(|e| RetrievalError::Embedding(format!("embedding task panicked: {e}")))?
        .map_err(|e: anyhow::Error| RetrievalError::Embedding(e.to_string()))?;

        debug!(dimensions = embedding.len(), "query embedded");
        Ok(embedding)
    }
}
