use std::time::Duration;

use async_trait::async_trait;
use rig::{
    agent::Agent,
    client::CompletionClient,
    completion::Prompt,
    providers::openrouter,
};

use super::GenerationClient;
use crate::error::GenerationError;

const PREAMBLE: &str = "You answer strictly from the guideline excerpts supplied in each prompt \
and always reply with a single JSON object.";

/// Any model reachable through OpenRouter, driven by a rig agent.
pub struct RigClient {
    agent: Agent<openrouter::CompletionModel>,
    model: String,
    timeout: Duration,
}

impl RigClient {
    pub fn openrouter(api_key: &str, model: &str, timeout: Duration) -> Self {
        let client = openrouter::Client::new(api_key);
        let agent = client.agent(model).preamble(PREAMBLE).build();
        Self {
            agent,
            model: model.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl GenerationClient for RigClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let response = tokio::time::timeout(self.timeout, self.agent.prompt(prompt.to_owned()))
            .await
            .map_err(|_| GenerationError::Timeout(self.timeout))?
            .map_err(|e| classify(e.to_string()))?;

        if response.trim().is_empty() {
            return Err(GenerationError::EmptyResponse("empty completion".to_string()));
        }
        Ok(response)
    }
}

/// rig flattens provider failures into its own error type, so the status is
/// recovered from the message.
fn classify(message: String) -> GenerationError {
    let lower = message.to_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests")
    {
        GenerationError::RateLimited(message)
    } else {
        GenerationError::Request(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_messages_are_recognised() {
        assert!(classify("ProviderError: 429 Too Many Requests".into()).is_retryable());
        assert!(classify("Rate limit exceeded for model".into()).is_retryable());
        assert!(!classify("invalid api key".into()).is_retryable());
    }
}
