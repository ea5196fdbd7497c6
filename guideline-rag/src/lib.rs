pub mod cache;
pub mod error;
pub mod fingerprint;
pub mod generation;
pub mod models;
pub mod pipeline;
pub mod prompt;
pub mod retrieval;
pub mod validation;
pub mod warmup;

// Re-export commonly used types
pub use cache::ResponseCache;
pub use error::{GenerationError, PipelineError, Result, RetrievalError, SchemaError, Stage};
pub use fingerprint::Fingerprint;
pub use generation::{GenerationClient, RetryPolicy, RetryingClient, VertexClient, VertexConfig};
pub use models::{
    AssessmentAnswer, ChatAnswer, ChatQuery, Citation, ContextChunk, ConversationTurn, Mode,
    PatientInput, Role, StructuredAnswer,
};
pub use pipeline::{Outcome, Pipeline, PipelineConfig};
pub use prompt::REFUSAL;
pub use retrieval::{
    Embedder, GuidelineRetriever, InMemoryVectorIndex, IndexedChunk, Retriever, ScoredChunk,
    StaticEmbedder, VectorIndex,
};
pub use warmup::WarmupReport;

#[cfg(feature = "rig")]
pub use generation::RigClient;
#[cfg(feature = "fastembed")]
pub use retrieval::FastEmbedder;
#[cfg(feature = "postgres")]
pub use retrieval::PgVectorIndex;
