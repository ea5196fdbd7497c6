//! Prompt assembly. Everything here is a pure function of its inputs.

use crate::error::SchemaError;
use crate::models::{ContextChunk, ConversationTurn, PatientInput};

/// Reply mandated when the supplied guideline text does not support an answer.
pub const REFUSAL: &str = "I couldn't find support in the NG12 text for that.";

const ASSESSMENT_INSTRUCTIONS: &str = r#"You are a clinical decision support assistant for the NICE NG12 guideline (Suspected cancer: recognition and referral).
Analyse the patient's data against the guideline excerpts provided below.
Use ONLY the supplied guideline excerpts. Do not use outside knowledge.

Return a single JSON object with these keys, in this order:
- "patient_summary": a brief summary of age, sex, symptoms, symptom duration and risk factors.
- "guideline_analysis": how the guideline criteria apply to this patient, citing the specific criteria and page numbers.
- "recommendation": the clinical recommendation (for example "Urgent referral", "Routine referral", "Safety netting" or "No referral").
- "next_steps": specific actions for the GP (optional).

Respond with the JSON object only."#;

const CHAT_INSTRUCTIONS: &str = r#"You are an expert assistant for the NICE NG12 guideline (Suspected cancer: recognition and referral).
Answer the user's question ACCURATELY using ONLY the context guidelines below.

RULES:
1. GROUNDING: use only the provided context guidelines. Do not use outside knowledge.
2. REFUSAL: if the context is empty or does not contain the answer, set "answer" to exactly: "{refusal}" and return no citations.
3. CITATIONS: cite the page number of the source excerpt for every factual claim. Only cite pages that appear in the context.
4. FORMAT: respond with a single JSON object and nothing else.

JSON SCHEMA:
{
  "answer": "natural language answer",
  "citations": [
    { "page": 12, "excerpt": "direct quote or close summary of the supporting rule" }
  ]
}"#;

const NO_CONTEXT: &str = "(no guideline excerpts were retrieved)";

/// Inputs for one prompt; the variant selects the mode.
#[derive(Debug, Clone, Copy)]
pub enum PromptInput<'a> {
    Assessment {
        patient: &'a PatientInput,
        context: &'a [ContextChunk],
    },
    Chat {
        query: &'a str,
        history: &'a [ConversationTurn],
        context: &'a [ContextChunk],
    },
}

pub fn assemble(input: PromptInput<'_>) -> serde_json::Result<String> {
    match input {
        PromptInput::Assessment { patient, context } => assessment_prompt(patient, context),
        PromptInput::Chat {
            query,
            history,
            context,
        } => Ok(chat_prompt(query, history, context)),
    }
}

pub fn assessment_prompt(
    patient: &PatientInput,
    context: &[ContextChunk],
) -> serde_json::Result<String> {
    let patient_json = serde_json::to_string(patient)?;
    Ok(format!(
        "{ASSESSMENT_INSTRUCTIONS}\n\nPATIENT (JSON):\n{patient_json}\n\nGUIDELINE EXCERPTS:\n{}\n",
        context_block(context)
    ))
}

pub fn chat_prompt(query: &str, history: &[ConversationTurn], context: &[ContextChunk]) -> String {
    let instructions = CHAT_INSTRUCTIONS.replace("{refusal}", REFUSAL);
    let conversation = history
        .iter()
        .map(|turn| format!("{}: {}", turn.role.label(), turn.text.trim()))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "{instructions}\n\nCONTEXT GUIDELINES:\n{}\n\nCONVERSATION HISTORY:\n{}\n\nUser: {}\nAssistant:",
        context_block(context),
        if conversation.is_empty() {
            "(none)"
        } else {
            conversation.as_str()
        },
        query.trim()
    )
}

/// Follow-up prompt sent after the model's output failed validation.
pub fn corrective(prompt: &str, error: &SchemaError) -> String {
    format!(
        "{prompt}\n\nYOUR PREVIOUS RESPONSE WAS REJECTED: {error}.\n\
         Respond again with ONLY a valid JSON object that follows the required keys exactly. \
         Do not wrap it in markdown and do not add any text before or after it."
    )
}

fn context_block(chunks: &[ContextChunk]) -> String {
    if chunks.is_empty() {
        return NO_CONTEXT.to_string();
    }
    chunks
        .iter()
        .map(|c| format!("[Excerpt {} | Page {}]\n{}", c.rank, c.page, c.text.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}
