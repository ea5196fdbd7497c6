use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::prompt::REFUSAL;

/// Oldest age accepted in an assessment payload.
pub const MAX_AGE: u32 = 130;

/// Which of the two answering modes a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Assessment,
    Chat,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Assessment => "assessment",
            Mode::Chat => "chat",
        }
    }
}

/// Structured patient data submitted for a referral assessment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientInput {
    pub age: u32,
    #[serde(default, alias = "gender", skip_serializing_if = "Option::is_none")]
    pub sex: Option<String>,
    pub symptoms: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_weeks: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smoker: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub risk_factors: Vec<String>,
}

impl PatientInput {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.age > MAX_AGE {
            return Err(PipelineError::input(format!(
                "age must be at most {MAX_AGE}"
            )));
        }
        if self.symptoms.iter().all(|s| s.trim().is_empty()) {
            return Err(PipelineError::input("at least one symptom is required"));
        }
        Ok(())
    }

    /// Text used to look up the guideline sections relevant to this patient.
    pub fn retrieval_query(&self) -> String {
        self.symptoms
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// A guideline excerpt returned by the retriever for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextChunk {
    /// 1-based position by descending similarity.
    pub rank: usize,
    pub page: u32,
    pub text: String,
    pub similarity: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    #[serde(alias = "model")]
    Assistant,
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

/// One prior message of a client-held conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    #[serde(alias = "content")]
    pub text: String,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

/// A free-text question about the guideline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatQuery {
    #[serde(alias = "message")]
    pub query: String,
    #[serde(default)]
    pub history: Vec<ConversationTurn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
}

impl ChatQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            history: Vec::new(),
            top_k: None,
        }
    }

    pub fn with_history(mut self, history: Vec<ConversationTurn>) -> Self {
        self.history = history;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentAnswer {
    pub patient_summary: String,
    pub guideline_analysis: String,
    pub recommendation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_steps: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Citation {
    pub page: u32,
    pub excerpt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatAnswer {
    pub answer: String,
    #[serde(default)]
    pub citations: Vec<Citation>,
}

impl ChatAnswer {
    /// The fixed reply used when the guideline text offers no support.
    pub fn refusal() -> Self {
        Self {
            answer: REFUSAL.to_string(),
            citations: Vec::new(),
        }
    }

    pub fn is_refusal(&self) -> bool {
        self.answer.trim() == REFUSAL
    }
}

/// A validated answer of either mode, as stored in the response cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StructuredAnswer {
    Assessment(AssessmentAnswer),
    Chat(ChatAnswer),
}

impl StructuredAnswer {
    pub fn mode(&self) -> Mode {
        match self {
            StructuredAnswer::Assessment(_) => Mode::Assessment,
            StructuredAnswer::Chat(_) => Mode::Chat,
        }
    }
}
