//! Cache keys derived from normalized request content.
//!
//! Two requests that differ only in letter case, surrounding or repeated
//! whitespace, or the order of list-valued patient fields produce the same
//! fingerprint. Anything else that could change the model's answer takes part
//! in the hash.

use std::fmt;

use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::models::{ConversationTurn, Mode, PatientInput};

/// Hex-encoded SHA-256 of a mode discriminator plus canonical request JSON.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix used in log lines.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trim, collapse inner whitespace and lowercase.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn normalize_set(items: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = items
        .iter()
        .map(|s| normalize_text(s))
        .filter(|s| !s.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();
    normalized
}

pub fn assessment(patient: &PatientInput) -> Fingerprint {
    digest(
        Mode::Assessment,
        json!({
            "age": patient.age,
            "sex": patient.sex.as_deref().map(normalize_text),
            "symptoms": normalize_set(&patient.symptoms),
            "duration_weeks": patient.duration_weeks,
            "smoker": patient.smoker,
            "risk_factors": normalize_set(&patient.risk_factors),
        }),
    )
}

/// `include_history` controls whether prior turns take part in the key.
pub fn chat(
    query: &str,
    history: &[ConversationTurn],
    top_k: usize,
    include_history: bool,
) -> Fingerprint {
    let history: Vec<Value> = if include_history {
        history
            .iter()
            .map(|turn| json!([turn.role.label(), normalize_text(&turn.text)]))
            .collect()
    } else {
        Vec::new()
    };

    digest(
        Mode::Chat,
        json!({
            "query": normalize_text(query),
            "top_k": top_k,
            "history": history,
        }),
    )
}

fn digest(mode: Mode, payload: Value) -> Fingerprint {
    let canonical = json!({ "mode": mode.as_str(), "payload": payload });
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    Fingerprint(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patient() -> PatientInput {
        PatientInput {
            age: 55,
            sex: Some("Male".into()),
            symptoms: vec!["Persistent cough".into(), "weight loss".into()],
            duration_weeks: Some(3),
            smoker: Some(true),
            risk_factors: vec![],
        }
    }

    #[test]
    fn normalizes_case_whitespace_and_order() {
        let mut other = patient();
        other.sex = Some(" male ".into());
        other.symptoms = vec!["weight   loss".into(), "PERSISTENT COUGH".into()];
        assert_eq!(assessment(&patient()), assessment(&other));
    }

    #[test]
    fn clinical_fields_change_the_fingerprint() {
        let base = assessment(&patient());

        let mut older = patient();
        older.age = 56;
        assert_ne!(base, assessment(&older));

        let mut non_smoker = patient();
        non_smoker.smoker = Some(false);
        assert_ne!(base, assessment(&non_smoker));

        let mut longer = patient();
        longer.duration_weeks = Some(4);
        assert_ne!(base, assessment(&longer));
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        let fp = assessment(&patient());
        assert_eq!(fp.as_str().len(), 64);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fp.short().len(), 12);
    }

    #[test]
    fn modes_never_collide() {
        let a = chat("persistent cough", &[], 5, true);
        let b = digest(Mode::Assessment, json!({"query": "persistent cough", "top_k": 5, "history": []}));
        assert_ne!(a, b);
    }

    #[test]
    fn chat_query_is_normalized() {
        assert_eq!(
            chat("  What is the 2WW  pathway? ", &[], 5, true),
            chat("what is the 2ww pathway?", &[], 5, true)
        );
        assert_ne!(chat("dysphagia", &[], 5, true), chat("dysphagia", &[], 3, true));
    }

    #[test]
    fn history_participates_only_when_enabled() {
        let history = vec![
            ConversationTurn::user("Tell me about lung cancer"),
            ConversationTurn::assistant("Page 12 covers it."),
        ];
        assert_ne!(
            chat("and for smokers?", &history, 5, true),
            chat("and for smokers?", &[], 5, true)
        );
        assert_eq!(
            chat("and for smokers?", &history, 5, false),
            chat("and for smokers?", &[], 5, false)
        );
    }
}
