use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{debug, info};

use super::{ScoredChunk, VectorIndex};
use crate::error::RetrievalError;

/// Table written by the ingestion job: `page_number INT, content TEXT,
/// embedding VECTOR(n)`.
const CHUNK_TABLE: &str = "guideline_chunks";

/// pgvector-backed index, queried read-only with cosine distance.
#[derive(Clone)]
pub struct PgVectorIndex {
    pool: PgPool,
}

impl PgVectorIndex {
    pub async fn connect(database_url: &str) -> Result<Self, RetrievalError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| RetrievalError::IndexUnavailable(e.to_string()))?;
        info!("Connected to pgvector guideline index");
        Ok(Self { pool })
    }
}

/// Literal vector representation suitable for pgvector. Only numbers are
/// formatted in, so inlining it into the statement is safe.
fn vector_literal(embedding: &[f32]) -> String {
    let values = embedding
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join(",");
    format!("ARRAY[{values}]::vector")
}

#[async_trait]
impl VectorIndex for PgVectorIndex {
    async fn search(&self, embedding: &[f32], k: usize) -> Result<Vec<ScoredChunk>, RetrievalError> {
        if embedding.iter().any(|f| !f.is_finite()) {
            return Err(RetrievalError::Embedding(
                "query embedding contains non-finite values".to_string(),
            ));
        }

        let vector = vector_literal(embedding);
        let sql = format!(
            "SELECT page_number, content, 1 - (embedding <=> {vector}) AS similarity \
             FROM {CHUNK_TABLE} \
             ORDER BY embedding <=> {vector} \
             LIMIT $1"
        );

        let rows = sqlx::query_as::<_, (i32, String, f64)>(&sql)
            .bind(i64::try_from(k).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RetrievalError::IndexUnavailable(e.to_string()))?;

        debug!(rows = rows.len(), "pgvector search finished");

        Ok(rows
            .into_iter()
            .map(|(page, content, similarity)| ScoredChunk {
                page: u32::try_from(page).unwrap_or(0),
                text: content,
                similarity: similarity as f32,
            })
            .collect())
    }
}
