use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use guideline_rag::{GenerationError, PipelineError, Stage};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::patients::RegistryError;

/// Everything a handler can fail with, mapped onto an HTTP status and a body
/// that never echoes prompts or patient data.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(&'static str),

    #[error("{what} not found")]
    NotFound { what: &'static str },

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Pipeline(e) => match e {
                PipelineError::Input(_) => StatusCode::BAD_REQUEST,
                PipelineError::Retrieval(_) => StatusCode::SERVICE_UNAVAILABLE,
                PipelineError::Generation(GenerationError::RateLimited(_)) => {
                    StatusCode::TOO_MANY_REQUESTS
                }
                PipelineError::Generation(GenerationError::Timeout(_)) => {
                    StatusCode::GATEWAY_TIMEOUT
                }
                PipelineError::Generation(_) => StatusCode::BAD_GATEWAY,
                PipelineError::Schema { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn stage(&self) -> Option<Stage> {
        match self {
            ApiError::Pipeline(e) => Some(e.stage()),
            _ => None,
        }
    }

    /// Client errors carry their own message; upstream failures get a
    /// generic one so provider responses never leak.
    fn public_message(&self) -> String {
        match self {
            ApiError::BadRequest(message) => message.to_string(),
            ApiError::NotFound { .. } => self.to_string(),
            ApiError::Registry(_) => "Failed to update the patient registry".to_string(),
            ApiError::Pipeline(e) => match e {
                PipelineError::Input(message) => message.clone(),
                PipelineError::Retrieval(_) => "Guideline index is unavailable".to_string(),
                PipelineError::Generation(GenerationError::RateLimited(_)) => {
                    "Model provider is rate limiting requests, try again later".to_string()
                }
                PipelineError::Generation(GenerationError::Timeout(_)) => {
                    "Model provider did not answer in time".to_string()
                }
                PipelineError::Generation(_) => "Model provider request failed".to_string(),
                PipelineError::Schema { .. } => {
                    "Could not produce a valid structured answer".to_string()
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            error!(status = status.as_u16(), stage = ?self.stage(), error = %self, "request failed");
        }

        let mut body = json!({ "error": self.public_message() });
        if let Some(stage) = self.stage() {
            body["stage"] = json!(stage.as_str());
        }
        (status, Json(body)).into_response()
    }
}
