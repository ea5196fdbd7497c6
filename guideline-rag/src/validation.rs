//! Parsing of raw model output into typed answers.
//!
//! The model's text is parsed as JSON and checked field by field. Nothing is
//! inferred from text that is not valid JSON.

use std::collections::HashSet;

use serde_json::{Map, Value};
use tracing::warn;

use crate::error::SchemaError;
use crate::models::{AssessmentAnswer, ChatAnswer, Citation, ContextChunk, Mode, StructuredAnswer};

pub fn parse(raw: &str, schema: Mode) -> Result<StructuredAnswer, SchemaError> {
    match schema {
        Mode::Assessment => parse_assessment(raw).map(StructuredAnswer::Assessment),
        Mode::Chat => parse_chat(raw).map(StructuredAnswer::Chat),
    }
}

pub fn parse_assessment(raw: &str) -> Result<AssessmentAnswer, SchemaError> {
    let object = parse_object(raw)?;
    Ok(AssessmentAnswer {
        patient_summary: required_text(&object, "patient_summary")?,
        guideline_analysis: required_text(&object, "guideline_analysis")?,
        recommendation: required_text(&object, "recommendation")?,
        next_steps: optional_text(&object, "next_steps"),
    })
}

pub fn parse_chat(raw: &str) -> Result<ChatAnswer, SchemaError> {
    let object = parse_object(raw)?;
    let answer = required_text(&object, "answer")?;

    let citations = match object.get("citations") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(parse_citation)
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => {
            return Err(SchemaError::Malformed {
                field: "citations",
                reason: "expected an array".to_string(),
            });
        }
    };

    Ok(ChatAnswer { answer, citations })
}

/// Drops citations to pages outside the supplied context and collapses
/// duplicate (page, excerpt) pairs, keeping first occurrences.
pub fn ground_citations(answer: ChatAnswer, context: &[ContextChunk]) -> ChatAnswer {
    let pages: HashSet<u32> = context.iter().map(|c| c.page).collect();
    let mut seen = HashSet::new();
    let mut citations = Vec::with_capacity(answer.citations.len());

    for citation in answer.citations {
        if !pages.contains(&citation.page) {
            warn!(
                page = citation.page,
                "dropping citation to a page that was not in the supplied context"
            );
            continue;
        }
        if seen.insert((citation.page, citation.excerpt.clone())) {
            citations.push(citation);
        }
    }

    ChatAnswer {
        answer: answer.answer,
        citations,
    }
}

/// Removes a surrounding markdown code fence, if the model added one.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn parse_object(raw: &str) -> Result<Map<String, Value>, SchemaError> {
    match serde_json::from_str::<Value>(strip_code_fences(raw))? {
        Value::Object(object) => Ok(object),
        _ => Err(SchemaError::NotAnObject),
    }
}

/// Strings are taken as-is; numbers, booleans and nested structures are kept
/// in their JSON rendering.
fn as_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    };
    (!text.is_empty()).then_some(text)
}

fn required_text(object: &Map<String, Value>, field: &'static str) -> Result<String, SchemaError> {
    object
        .get(field)
        .and_then(as_text)
        .ok_or(SchemaError::MissingField(field))
}

fn optional_text(object: &Map<String, Value>, field: &str) -> Option<String> {
    object.get(field).and_then(as_text)
}

fn parse_citation(value: &Value) -> Result<Citation, SchemaError> {
    let malformed = |reason: &str| SchemaError::Malformed {
        field: "citations",
        reason: reason.to_string(),
    };

    let object = value
        .as_object()
        .ok_or_else(|| malformed("each citation must be an object"))?;

    let page = match object.get("page") {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().trim_start_matches("Page").trim().parse().ok(),
        _ => None,
    }
    .and_then(|p| u32::try_from(p).ok())
    .ok_or_else(|| malformed("citation page must be a positive integer"))?;

    let excerpt = object
        .get("excerpt")
        .and_then(as_text)
        .unwrap_or_default();

    Ok(Citation { page, excerpt })
}
