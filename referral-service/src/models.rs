use guideline_rag::{AssessmentAnswer, ChatAnswer, Outcome};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct AssessmentResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    #[serde(flatten)]
    pub assessment: AssessmentAnswer,
    pub cached: bool,
}

impl AssessmentResponse {
    pub fn new(outcome: Outcome<AssessmentAnswer>, patient_id: Option<String>) -> Self {
        Self {
            patient_id,
            assessment: outcome.answer,
            cached: outcome.cached,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    #[serde(flatten)]
    pub reply: ChatAnswer,
    pub cached: bool,
}

impl From<Outcome<ChatAnswer>> for ChatResponse {
    fn from(outcome: Outcome<ChatAnswer>) -> Self {
        Self {
            reply: outcome.answer,
            cached: outcome.cached,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PatientsAdded {
    pub message: String,
    pub added_count: usize,
}

impl PatientsAdded {
    pub fn new(added_count: usize) -> Self {
        Self {
            message: format!("Added {added_count} new patients."),
            added_count,
        }
    }
}
