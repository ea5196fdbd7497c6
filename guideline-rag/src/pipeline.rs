//! Request orchestration: cache check, retrieval, prompt assembly, generation
//! and validation, in that order.

use std::sync::Arc;
use std::time::Duration;

use tracing::{Instrument, debug, info, info_span, warn};

use crate::cache::ResponseCache;
use crate::error::{PipelineError, Result, SchemaError, Stage};
use crate::fingerprint::{self, Fingerprint};
use crate::generation::GenerationClient;
use crate::models::{
    AssessmentAnswer, ChatAnswer, ChatQuery, ContextChunk, Mode, PatientInput, StructuredAnswer,
};
use crate::prompt::{self, PromptInput};
use crate::retrieval::Retriever;
use crate::validation;
use crate::warmup::{self, WarmupReport};

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub cache_capacity: usize,
    /// Whether prior chat turns take part in the cache key.
    pub include_history_in_fingerprint: bool,
    pub chat_top_k: usize,
    pub max_top_k: usize,
    pub assessment_top_k: usize,
    /// Corrective generations allowed after a schema failure.
    pub schema_retries: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 32,
            include_history_in_fingerprint: true,
            chat_top_k: 5,
            max_top_k: 20,
            assessment_top_k: 3,
            schema_retries: 1,
        }
    }
}

/// A validated answer and whether it came from the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome<T> {
    pub answer: T,
    pub cached: bool,
    pub fingerprint: Fingerprint,
}

/// Owns the response cache and the shared clients for the life of the process.
pub struct Pipeline {
    retriever: Arc<dyn Retriever>,
    generator: Arc<dyn GenerationClient>,
    cache: ResponseCache,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        retriever: Arc<dyn Retriever>,
        generator: Arc<dyn GenerationClient>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            retriever,
            generator,
            cache: ResponseCache::new(config.cache_capacity),
            config,
        }
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub async fn warmup(&self, budget: Duration) -> WarmupReport {
        warmup::run(self.retriever.as_ref(), self.generator.as_ref(), budget).await
    }

    pub async fn assess(&self, patient: &PatientInput) -> Result<Outcome<AssessmentAnswer>> {
        patient.validate()?;
        let fingerprint = fingerprint::assessment(patient);
        let span = info_span!("assessment", mode = "assessment", fingerprint = %fingerprint.short());
        self.run_assessment(patient, fingerprint)
            .instrument(span)
            .await
    }

    pub async fn chat(&self, query: &ChatQuery) -> Result<Outcome<ChatAnswer>> {
        if query.query.trim().is_empty() {
            return Err(PipelineError::input("query must not be empty"));
        }
        let top_k = match query.top_k {
            Some(0) => return Err(PipelineError::input("top_k must be at least 1")),
            Some(k) => k.min(self.config.max_top_k),
            None => self.config.chat_top_k,
        };

        let fingerprint = fingerprint::chat(
            &query.query,
            &query.history,
            top_k,
            self.config.include_history_in_fingerprint,
        );
        let span = info_span!("chat", mode = "chat", fingerprint = %fingerprint.short(), top_k);
        self.run_chat(query, top_k, fingerprint)
            .instrument(span)
            .await
    }

    async fn run_assessment(
        &self,
        patient: &PatientInput,
        fingerprint: Fingerprint,
    ) -> Result<Outcome<AssessmentAnswer>> {
        if let Some(StructuredAnswer::Assessment(answer)) = self.lookup(&fingerprint) {
            return Ok(Outcome {
                answer,
                cached: true,
                fingerprint,
            });
        }

        let context = self
            .retrieve(&patient.retrieval_query(), self.config.assessment_top_k)
            .await?;
        let prompt = build_prompt(PromptInput::Assessment {
            patient,
            context: &context,
        })?;
        let answer = self
            .generate_validated(Mode::Assessment, &prompt, validation::parse_assessment)
            .await?;

        self.store(&fingerprint, StructuredAnswer::Assessment(answer.clone()));
        Ok(Outcome {
            answer,
            cached: false,
            fingerprint,
        })
    }

    async fn run_chat(
        &self,
        query: &ChatQuery,
        top_k: usize,
        fingerprint: Fingerprint,
    ) -> Result<Outcome<ChatAnswer>> {
        if let Some(StructuredAnswer::Chat(answer)) = self.lookup(&fingerprint) {
            return Ok(Outcome {
                answer,
                cached: true,
                fingerprint,
            });
        }

        let context = self.retrieve(&query.query, top_k).await?;
        let answer = if context.is_empty() {
            info!(stage = %Stage::Prompt, "no guideline context retrieved, refusing");
            ChatAnswer::refusal()
        } else {
            let prompt = build_prompt(PromptInput::Chat {
                query: &query.query,
                history: &query.history,
                context: &context,
            })?;
            let parsed = self
                .generate_validated(Mode::Chat, &prompt, validation::parse_chat)
                .await?;
            validation::ground_citations(parsed, &context)
        };

        self.store(&fingerprint, StructuredAnswer::Chat(answer.clone()));
        Ok(Outcome {
            answer,
            cached: false,
            fingerprint,
        })
    }

    fn lookup(&self, fingerprint: &Fingerprint) -> Option<StructuredAnswer> {
        match self.cache.get(fingerprint) {
            Some(entry) => {
                info!(stage = %Stage::CacheCheck, inserted_at = %entry.inserted_at, "cache hit");
                Some(entry.answer)
            }
            None => {
                debug!(stage = %Stage::CacheCheck, "cache miss");
                None
            }
        }
    }

    fn store(&self, fingerprint: &Fingerprint, answer: StructuredAnswer) {
        if let Some(evicted) = self.cache.put(fingerprint.clone(), answer) {
            debug!(stage = %Stage::CacheStore, evicted = %evicted.short(), "evicted least recently used answer");
        }
    }

    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<ContextChunk>> {
        let context = self.retriever.retrieve(query, k).await.map_err(|e| {
            warn!(stage = %Stage::Retrieve, error = %e, "guideline retrieval failed");
            PipelineError::from(e)
        })?;
        let pages: Vec<u32> = context.iter().map(|c| c.page).collect();
        debug!(stage = %Stage::Retrieve, chunks = context.len(), ?pages, "context retrieved");
        Ok(context)
    }

    /// Generates and parses, re-prompting with a corrective instruction on a
    /// schema failure until `schema_retries` is exhausted.
    async fn generate_validated<T>(
        &self,
        mode: Mode,
        prompt: &str,
        parse: fn(&str) -> Result<T, SchemaError>,
    ) -> Result<T> {
        let attempts = self.config.schema_retries + 1;
        let mut current = prompt.to_owned();
        let mut attempt = 1;

        loop {
            let raw = self.generator.generate(&current).await.map_err(|e| {
                warn!(
                    stage = %Stage::Generate,
                    model = self.generator.model(),
                    attempt,
                    error = %e,
                    "generation failed"
                );
                PipelineError::from(e)
            })?;

            match parse(&raw) {
                Ok(answer) => {
                    debug!(stage = %Stage::Validate, attempt, "model output accepted");
                    return Ok(answer);
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        stage = %Stage::Validate,
                        mode = mode.as_str(),
                        attempt,
                        error = %e,
                        "model output rejected, retrying with corrective prompt"
                    );
                    current = prompt::corrective(prompt, &e);
                    attempt += 1;
                }
                Err(e) => {
                    warn!(
                        stage = %Stage::Validate,
                        mode = mode.as_str(),
                        attempt,
                        error = %e,
                        "model output rejected, giving up"
                    );
                    return Err(PipelineError::Schema {
                        attempts,
                        source: e,
                    });
                }
            }
        }
    }
}

fn build_prompt(input: PromptInput<'_>) -> Result<String> {
    prompt::assemble(input)
        .map_err(|_| PipelineError::input("request could not be encoded for the model"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GenerationError, RetrievalError};
    use crate::retrieval::{GuidelineRetriever, InMemoryVectorIndex, IndexedChunk, StaticEmbedder};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const LUNG: &str = "Offer an urgent chest X-ray (to be performed within 2 weeks) to assess for lung cancer in people aged 40 and over if they have 2 or more of the following unexplained symptoms, or if they have ever smoked and have 1 or more of the following unexplained symptoms: cough, fatigue, shortness of breath, chest pain, weight loss, appetite loss.";
    const OESOPHAGEAL: &str = "Offer urgent, direct access upper gastrointestinal endoscopy (to be performed within 2 weeks) to assess for oesophageal or stomach cancer in people with dysphagia.";

    const ASSESSMENT_JSON: &str = r#"{
        "patient_summary": "55-year-old current smoker with a persistent cough for 3 weeks.",
        "guideline_analysis": "Aged over 40, has ever smoked and has an unexplained cough lasting 3 weeks, which meets the urgent chest X-ray criterion on page 12.",
        "recommendation": "Urgent referral: offer an urgent chest X-ray within 2 weeks.",
        "next_steps": "Request chest X-ray; refer on the suspected cancer pathway if findings suggest lung cancer."
    }"#;

    /// Returns scripted outputs in order, repeating the last, and records prompts.
    struct FakeModel {
        outputs: Mutex<Vec<std::result::Result<String, GenerationError>>>,
        prompts: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    impl FakeModel {
        fn new(outputs: Vec<std::result::Result<String, GenerationError>>) -> Arc<Self> {
            let mut outputs = outputs;
            outputs.reverse();
            Arc::new(Self {
                outputs: Mutex::new(outputs),
                prompts: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            })
        }

        fn replying(text: &str) -> Arc<Self> {
            Self::new(vec![Ok(text.to_string())])
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GenerationClient for FakeModel {
        fn model(&self) -> &str {
            "fake"
        }

        async fn generate(&self, prompt: &str) -> std::result::Result<String, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(prompt.to_string());
            let mut outputs = self.outputs.lock().unwrap();
            if outputs.len() > 1 {
                return outputs.pop().unwrap();
            }
            match outputs.last().unwrap() {
                Ok(text) => Ok(text.clone()),
                Err(GenerationError::RateLimited(m)) => Err(GenerationError::RateLimited(m.clone())),
                Err(e) => Err(GenerationError::Request(e.to_string())),
            }
        }
    }

    struct CountingRetriever {
        inner: GuidelineRetriever,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Retriever for CountingRetriever {
        async fn retrieve(
            &self,
            query: &str,
            k: usize,
        ) -> std::result::Result<Vec<ContextChunk>, RetrievalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.retrieve(query, k).await
        }
    }

    struct BrokenIndex;

    #[async_trait]
    impl Retriever for BrokenIndex {
        async fn retrieve(
            &self,
            _query: &str,
            _k: usize,
        ) -> std::result::Result<Vec<ContextChunk>, RetrievalError> {
            Err(RetrievalError::IndexUnavailable("connection refused".into()))
        }
    }

    /// Symptom text about lungs lands on page 12, dysphagia on page 30,
    /// everything else on an orthogonal vector that matches nothing.
    fn retriever() -> Arc<CountingRetriever> {
        let embedder = StaticEmbedder::new(vec![0.0, 0.0, 1.0])
            .with("persistent cough", vec![1.0, 0.0, 0.0])
            .with("When should I refer for a chest X-ray?", vec![1.0, 0.0, 0.0])
            .with("dysphagia", vec![0.0, 1.0, 0.0]);
        let index = InMemoryVectorIndex::new(vec![
            IndexedChunk {
                page: 12,
                text: LUNG.into(),
                embedding: vec![1.0, 0.0, 0.0],
            },
            IndexedChunk {
                page: 30,
                text: OESOPHAGEAL.into(),
                embedding: vec![0.0, 1.0, 0.0],
            },
        ]);
        Arc::new(CountingRetriever {
            inner: GuidelineRetriever::new(Arc::new(embedder), Arc::new(index), 0.3),
            calls: AtomicUsize::new(0),
        })
    }

    fn smoker() -> PatientInput {
        PatientInput {
            age: 55,
            sex: None,
            symptoms: vec!["persistent cough".into()],
            duration_weeks: Some(3),
            smoker: Some(true),
            risk_factors: vec![],
        }
    }

    fn pipeline(
        retriever: Arc<dyn Retriever>,
        model: Arc<FakeModel>,
        config: PipelineConfig,
    ) -> Pipeline {
        Pipeline::new(retriever, model, config)
    }

    #[tokio::test]
    async fn smoker_with_persistent_cough_gets_urgent_referral() {
        let model = FakeModel::replying(ASSESSMENT_JSON);
        let p = pipeline(retriever(), model.clone(), PipelineConfig::default());

        let outcome = p.assess(&smoker()).await.unwrap();
        assert!(!outcome.cached);
        assert!(outcome.answer.patient_summary.contains("55"));
        assert!(outcome.answer.patient_summary.to_lowercase().contains("smoker"));
        assert!(outcome.answer.guideline_analysis.contains("3 weeks"));
        assert!(outcome.answer.recommendation.starts_with("Urgent referral"));

        let prompts = model.prompts.lock().unwrap();
        assert!(prompts[0].contains(r#""age":55"#));
        assert!(prompts[0].contains("[Excerpt 1 | Page 12]"));
    }

    #[tokio::test]
    async fn repeated_assessment_is_served_from_cache() {
        let model = FakeModel::replying(ASSESSMENT_JSON);
        let retriever = retriever();
        let p = pipeline(retriever.clone(), model.clone(), PipelineConfig::default());

        let first = p.assess(&smoker()).await.unwrap();
        let mut same = smoker();
        same.symptoms = vec!["  Persistent   Cough ".into()];
        let second = p.assess(&same).await.unwrap();

        assert!(second.cached);
        assert_eq!(first.answer, second.answer);
        assert_eq!(first.fingerprint, second.fingerprint);
        assert_eq!(model.calls(), 1);
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn least_recently_used_answer_is_evicted() {
        let model = FakeModel::replying(ASSESSMENT_JSON);
        let config = PipelineConfig {
            cache_capacity: 2,
            ..PipelineConfig::default()
        };
        let p = pipeline(retriever(), model.clone(), config);

        let patients: Vec<PatientInput> = (60..63)
            .map(|age| PatientInput { age, ..smoker() })
            .collect();
        for patient in &patients {
            p.assess(patient).await.unwrap();
        }
        assert_eq!(model.calls(), 3);
        assert_eq!(p.cache().len(), 2);

        // the oldest entry was evicted, the newer two still hit
        assert!(p.assess(&patients[2]).await.unwrap().cached);
        assert!(p.assess(&patients[1]).await.unwrap().cached);
        assert!(!p.assess(&patients[0]).await.unwrap().cached);
        assert_eq!(model.calls(), 4);
    }

    #[tokio::test]
    async fn chat_without_context_refuses_without_calling_the_model() {
        let model = FakeModel::replying(r#"{"answer": "should not be used"}"#);
        let p = pipeline(retriever(), model.clone(), PipelineConfig::default());

        let query = ChatQuery::new("What is the capital of France?");
        let outcome = p.chat(&query).await.unwrap();
        assert_eq!(outcome.answer.answer, prompt::REFUSAL);
        assert!(outcome.answer.citations.is_empty());
        assert_eq!(model.calls(), 0);

        // refusals are cached like any answer
        assert!(p.chat(&query).await.unwrap().cached);
    }

    #[tokio::test]
    async fn chat_citations_stay_within_retrieved_pages() {
        let model = FakeModel::replying(
            r#"{"answer": "Offer an urgent chest X-ray.", "citations": [
                {"page": 12, "excerpt": "Offer an urgent chest X-ray"},
                {"page": 87, "excerpt": "not in the context"}
            ]}"#,
        );
        let p = pipeline(retriever(), model.clone(), PipelineConfig::default());

        let outcome = p
            .chat(&ChatQuery::new("When should I refer for a chest X-ray?"))
            .await
            .unwrap();
        let pages: Vec<u32> = outcome.answer.citations.iter().map(|c| c.page).collect();
        assert_eq!(pages, vec![12]);
    }

    #[tokio::test]
    async fn invalid_json_gets_exactly_one_corrective_retry() {
        let model = FakeModel::new(vec![
            Ok("Urgent referral recommended.".into()),
            Ok(ASSESSMENT_JSON.into()),
        ]);
        let p = pipeline(retriever(), model.clone(), PipelineConfig::default());

        let outcome = p.assess(&smoker()).await.unwrap();
        assert!(outcome.answer.recommendation.starts_with("Urgent referral"));
        assert_eq!(model.calls(), 2);

        let prompts = model.prompts.lock().unwrap();
        assert!(prompts[1].starts_with(prompts[0].as_str()));
        assert!(prompts[1].contains("PREVIOUS RESPONSE WAS REJECTED"));
    }

    #[tokio::test]
    async fn second_schema_failure_is_a_processing_error() {
        let model = FakeModel::replying("still not json");
        let p = pipeline(retriever(), model.clone(), PipelineConfig::default());

        let err = p.assess(&smoker()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Schema { attempts: 2, .. }));
        assert_eq!(err.stage(), Stage::Validate);
        assert_eq!(model.calls(), 2);
        // failures are never cached
        assert!(p.cache().is_empty());
    }

    #[tokio::test]
    async fn retrieval_failure_surfaces_before_generation() {
        let model = FakeModel::replying(ASSESSMENT_JSON);
        let p = pipeline(Arc::new(BrokenIndex), model.clone(), PipelineConfig::default());

        let err = p.assess(&smoker()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Retrieval(_)));
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn generation_errors_propagate_unchanged() {
        let model = FakeModel::new(vec![Err(GenerationError::RateLimited("429".into()))]);
        let p = pipeline(retriever(), model.clone(), PipelineConfig::default());

        let err = p.assess(&smoker()).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Generation(GenerationError::RateLimited(_))
        ));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_before_any_io() {
        let model = FakeModel::replying(ASSESSMENT_JSON);
        let retriever = retriever();
        let p = pipeline(retriever.clone(), model.clone(), PipelineConfig::default());

        let no_symptoms = PatientInput {
            symptoms: vec![],
            ..smoker()
        };
        assert!(matches!(p.assess(&no_symptoms).await, Err(PipelineError::Input(_))));
        assert!(matches!(
            p.chat(&ChatQuery::new("   ")).await,
            Err(PipelineError::Input(_))
        ));
        assert!(matches!(
            p.chat(&ChatQuery::new("dysphagia").with_top_k(0)).await,
            Err(PipelineError::Input(_))
        ));
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 0);
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn oversized_top_k_is_capped() {
        let model = FakeModel::replying(r#"{"answer": "Offer endoscopy.", "citations": [{"page": 30, "excerpt": "dysphagia"}]}"#);
        let p = pipeline(retriever(), model.clone(), PipelineConfig::default());

        let capped = p.chat(&ChatQuery::new("dysphagia").with_top_k(500)).await.unwrap();
        let at_max = p.chat(&ChatQuery::new("dysphagia").with_top_k(20)).await.unwrap();
        assert_eq!(capped.fingerprint, at_max.fingerprint);
        assert!(at_max.cached);
    }
}
