//! Process configuration, read once from the environment at start-up.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use guideline_rag::{PipelineConfig, RetryPolicy};
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
/// OpenRouter names the same model with its vendor prefix.
pub const DEFAULT_OPENROUTER_MODEL: &str = "google/gemini-2.5-flash";
pub const DEFAULT_LOCATION: &str = "europe-west2";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} is required{context}")]
    Missing { name: &'static str, context: String },

    #[error("{name} has invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Which hosted model API answers prompts, with its credentials.
#[derive(Clone)]
pub enum GenerationSettings {
    Vertex {
        project_id: String,
        location: String,
        access_token: String,
    },
    OpenRouter {
        api_key: String,
    },
}

impl fmt::Debug for GenerationSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationSettings::Vertex {
                project_id,
                location,
                ..
            } => f
                .debug_struct("Vertex")
                .field("project_id", project_id)
                .field("location", location)
                .field("access_token", &"<redacted>")
                .finish(),
            GenerationSettings::OpenRouter { .. } => f
                .debug_struct("OpenRouter")
                .field("api_key", &"<redacted>")
                .finish(),
        }
    }
}

/// Where guideline chunks are read from.
#[derive(Debug, Clone, PartialEq)]
pub enum VectorIndexSource {
    Postgres(String),
    JsonFile(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    pub generation: GenerationSettings,
    pub model: String,
    pub generation_timeout: Duration,
    pub retry: RetryPolicy,
    pub pipeline: PipelineConfig,
    pub similarity_threshold: f32,
    pub vector_index: VectorIndexSource,
    pub patients_path: PathBuf,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let provider = var("GENERATION_PROVIDER").unwrap_or_else(|| "vertex".to_string());
        let generation = match provider.trim().to_lowercase().as_str() {
            "vertex" => GenerationSettings::Vertex {
                project_id: required(&var, "GCP_PROJECT_ID", "vertex")?,
                location: var("GCP_LOCATION").unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
                access_token: required(&var, "VERTEX_ACCESS_TOKEN", "vertex")?,
            },
            "openrouter" => GenerationSettings::OpenRouter {
                api_key: required(&var, "OPENROUTER_API_KEY", "openrouter")?,
            },
            other => {
                return Err(ConfigError::Invalid {
                    name: "GENERATION_PROVIDER",
                    value: other.to_string(),
                    reason: "expected `vertex` or `openrouter`".to_string(),
                });
            }
        };

        let defaults = PipelineConfig::default();
        let retry_defaults = RetryPolicy::default();

        let pipeline = PipelineConfig {
            cache_capacity: parsed(&var, "CACHE_CAPACITY", defaults.cache_capacity)?,
            include_history_in_fingerprint: parsed(
                &var,
                "CACHE_INCLUDE_HISTORY",
                defaults.include_history_in_fingerprint,
            )?,
            chat_top_k: parsed(&var, "CHAT_TOP_K", defaults.chat_top_k)?,
            max_top_k: defaults.max_top_k,
            assessment_top_k: parsed(&var, "ASSESSMENT_TOP_K", defaults.assessment_top_k)?,
            schema_retries: parsed(&var, "SCHEMA_RETRIES", defaults.schema_retries)?,
        };
        if pipeline.chat_top_k == 0 || pipeline.chat_top_k > pipeline.max_top_k {
            return Err(ConfigError::Invalid {
                name: "CHAT_TOP_K",
                value: pipeline.chat_top_k.to_string(),
                reason: format!("must be between 1 and {}", pipeline.max_top_k),
            });
        }

        let retry = RetryPolicy {
            max_retries: parsed(&var, "RATE_LIMIT_MAX_RETRIES", retry_defaults.max_retries)?,
            initial_backoff: Duration::from_millis(parsed(
                &var,
                "RATE_LIMIT_INITIAL_BACKOFF_MS",
                retry_defaults.initial_backoff.as_millis() as u64,
            )?),
            max_backoff: Duration::from_millis(parsed(
                &var,
                "RATE_LIMIT_MAX_BACKOFF_MS",
                retry_defaults.max_backoff.as_millis() as u64,
            )?),
            ..retry_defaults
        };

        let similarity_threshold: f32 = parsed(&var, "SIMILARITY_THRESHOLD", 0.3)?;
        if !(-1.0..=1.0).contains(&similarity_threshold) {
            return Err(ConfigError::Invalid {
                name: "SIMILARITY_THRESHOLD",
                value: similarity_threshold.to_string(),
                reason: "cosine similarity lies between -1 and 1".to_string(),
            });
        }

        let vector_index = match var("VECTOR_INDEX_URL") {
            Some(url) => VectorIndexSource::Postgres(url),
            None => VectorIndexSource::JsonFile(
                var("VECTOR_INDEX_PATH")
                    .unwrap_or_else(|| "data/guideline_index.json".to_string())
                    .into(),
            ),
        };

        let model = var("LLM_MODEL").unwrap_or_else(|| match generation {
            GenerationSettings::Vertex { .. } => DEFAULT_MODEL.to_string(),
            GenerationSettings::OpenRouter { .. } => DEFAULT_OPENROUTER_MODEL.to_string(),
        });

        Ok(Self {
            port: parsed(&var, "PORT", DEFAULT_PORT)?,
            generation,
            model,
            generation_timeout: Duration::from_secs(parsed(&var, "GENERATION_TIMEOUT_SECS", 30)?),
            retry,
            pipeline,
            similarity_threshold,
            vector_index,
            patients_path: var("PATIENTS_PATH")
                .unwrap_or_else(|| "data/patients.json".to_string())
                .into(),
        })
    }
}

fn required<F>(var: &F, name: &'static str, provider: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    var(name).ok_or_else(|| ConfigError::Missing {
        name,
        context: format!(" when GENERATION_PROVIDER={provider}"),
    })
}

fn parsed<F, T>(var: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match var(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<ServiceConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServiceConfig::from_lookup(|name| vars.get(name).cloned())
    }

    const VERTEX: [(&str, &str); 2] = [
        ("GCP_PROJECT_ID", "ng12-demo"),
        ("VERTEX_ACCESS_TOKEN", "ya29.token"),
    ];

    #[test]
    fn defaults_apply() {
        let cfg = config(&VERTEX).unwrap();
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.model, "gemini-2.5-flash");
        assert_eq!(cfg.generation_timeout, Duration::from_secs(30));
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.retry.initial_backoff, Duration::from_millis(500));
        assert_eq!(cfg.retry.max_backoff, Duration::from_secs(8));
        assert_eq!(cfg.pipeline, PipelineConfig::default());
        assert_eq!(cfg.similarity_threshold, 0.3);
        assert_eq!(
            cfg.vector_index,
            VectorIndexSource::JsonFile("data/guideline_index.json".into())
        );
        assert!(matches!(
            cfg.generation,
            GenerationSettings::Vertex { ref location, .. } if location == "europe-west2"
        ));
    }

    #[test]
    fn overrides_are_parsed() {
        let mut pairs = VERTEX.to_vec();
        pairs.extend([
            ("PORT", "8080"),
            ("CACHE_CAPACITY", "0"),
            ("CACHE_INCLUDE_HISTORY", "false"),
            ("SCHEMA_RETRIES", "2"),
            ("VECTOR_INDEX_URL", "postgres://localhost/ng12"),
        ]);
        let cfg = config(&pairs).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.pipeline.cache_capacity, 0);
        assert!(!cfg.pipeline.include_history_in_fingerprint);
        assert_eq!(cfg.pipeline.schema_retries, 2);
        assert_eq!(
            cfg.vector_index,
            VectorIndexSource::Postgres("postgres://localhost/ng12".into())
        );
    }

    #[test]
    fn missing_credentials_are_rejected() {
        let err = config(&[("GCP_PROJECT_ID", "ng12-demo")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { name: "VERTEX_ACCESS_TOKEN", .. }));

        let err = config(&[("GENERATION_PROVIDER", "openrouter")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { name: "OPENROUTER_API_KEY", .. }));

        let cfg = config(&[
            ("GENERATION_PROVIDER", "OpenRouter"),
            ("OPENROUTER_API_KEY", "sk-or-test"),
        ])
        .unwrap();
        assert!(matches!(cfg.generation, GenerationSettings::OpenRouter { .. }));
        assert_eq!(cfg.model, "google/gemini-2.5-flash");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut pairs = VERTEX.to_vec();
        pairs.push(("GENERATION_TIMEOUT_SECS", "soon"));
        assert!(matches!(
            config(&pairs).unwrap_err(),
            ConfigError::Invalid { name: "GENERATION_TIMEOUT_SECS", .. }
        ));

        let mut pairs = VERTEX.to_vec();
        pairs.push(("CHAT_TOP_K", "50"));
        assert!(matches!(
            config(&pairs).unwrap_err(),
            ConfigError::Invalid { name: "CHAT_TOP_K", .. }
        ));

        assert!(matches!(
            config(&[("GENERATION_PROVIDER", "bard")]).unwrap_err(),
            ConfigError::Invalid { name: "GENERATION_PROVIDER", .. }
        ));
    }

    #[test]
    fn debug_output_redacts_credentials() {
        let cfg = config(&VERTEX).unwrap();
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("ya29.token"));
    }
}
