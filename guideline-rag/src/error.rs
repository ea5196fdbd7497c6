use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Step of the request state machine a failure was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    CacheCheck,
    Retrieve,
    Prompt,
    Generate,
    Validate,
    CacheStore,
    Respond,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::CacheCheck => "cache_check",
            Stage::Retrieve => "retrieve",
            Stage::Prompt => "prompt",
            Stage::Generate => "generate",
            Stage::Validate => "validate",
            Stage::CacheStore => "cache_store",
            Stage::Respond => "respond",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while looking up guideline context.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("query embedding failed: {0}")]
    Embedding(String),

    #[error("vector index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("embedding dimension mismatch: query has {query}, index has {index}")]
    DimensionMismatch { query: usize, index: usize },
}

/// Errors raised by a hosted model call.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation request failed: {0}")]
    Request(String),

    #[error("generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited by the model provider: {0}")]
    RateLimited(String),

    #[error("model returned no text: {0}")]
    EmptyResponse(String),
}

impl GenerationError {
    /// Only rate-limit rejections are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GenerationError::RateLimited(_))
    }
}

/// The model's text did not match the expected answer shape.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("response is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("response must be a JSON object")]
    NotAnObject,

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` is malformed: {reason}")]
    Malformed { field: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid input: {0}")]
    Input(String),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("model output failed validation after {attempts} attempt(s): {source}")]
    Schema {
        attempts: u32,
        #[source]
        source: SchemaError,
    },
}

impl PipelineError {
    pub fn input(message: impl Into<String>) -> Self {
        PipelineError::Input(message.into())
    }

    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Input(_) => Stage::Received,
            PipelineError::Retrieval(_) => Stage::Retrieve,
            PipelineError::Generation(_) => Stage::Generate,
            PipelineError::Schema { .. } => Stage::Validate,
        }
    }

    /// Whether the caller may reasonably try the same request again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Input(_) => false,
            PipelineError::Retrieval(_) => false,
            PipelineError::Generation(e) => {
                e.is_retryable() || matches!(e, GenerationError::Timeout(_))
            }
            PipelineError::Schema { .. } => false,
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
