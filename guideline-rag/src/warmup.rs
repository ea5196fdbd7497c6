//! Best-effort start-up probe of the retrieval and generation paths, so the
//! first real request does not pay for model loading or connection setup.

use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::generation::GenerationClient;
use crate::retrieval::Retriever;

const WARMUP_QUERY: &str = "suspected cancer referral";
const WARMUP_PROMPT: &str = r#"Reply with the JSON object {"status": "ok"}."#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WarmupReport {
    pub retrieval_ok: bool,
    pub generation_ok: bool,
}

impl WarmupReport {
    pub fn is_ready(&self) -> bool {
        self.retrieval_ok && self.generation_ok
    }
}

/// Never fails: each probe is bounded by `budget` and failures are logged.
pub async fn run(
    retriever: &dyn Retriever,
    generator: &dyn GenerationClient,
    budget: Duration,
) -> WarmupReport {
    let retrieval_ok = match tokio::time::timeout(budget, retriever.retrieve(WARMUP_QUERY, 1)).await {
        Ok(Ok(chunks)) => {
            info!(chunks = chunks.len(), "retrieval warm-up finished");
            true
        }
        Ok(Err(e)) => {
            warn!(error = %e, "retrieval warm-up failed");
            false
        }
        Err(_) => {
            warn!(budget_ms = budget.as_millis() as u64, "retrieval warm-up timed out");
            false
        }
    };

    let generation_ok = match tokio::time::timeout(budget, generator.generate(WARMUP_PROMPT)).await {
        Ok(Ok(_)) => {
            info!(model = generator.model(), "generation warm-up finished");
            true
        }
        Ok(Err(e)) => {
            warn!(model = generator.model(), error = %e, "generation warm-up failed");
            false
        }
        Err(_) => {
            warn!(model = generator.model(), "generation warm-up timed out");
            false
        }
    };

    WarmupReport {
        retrieval_ok,
        generation_ok,
    }
}
