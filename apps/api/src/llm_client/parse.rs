//! Two-tier parsing of model output into a `GeneratedResume`.
//!
//! Tier 1: strip code fences, strict JSON.
//! Tier 2: the outermost `{...}` block as JSON, then a regex capture of the
//! `tailoredResume` string field.
//! Anything else is `ParsedGeneration::Unparseable`.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::tools::ResumeSection;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedResume {
    pub tailored_resume: String,
    #[serde(default)]
    pub changes: Vec<String>,
    #[serde(default)]
    pub sections: Vec<ResumeSection>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedGeneration {
    Strict(GeneratedResume),
    Recovered(GeneratedResume),
    Unparseable,
}

impl ParsedGeneration {
    pub fn into_resume(self) -> Option<GeneratedResume> {
        match self {
            ParsedGeneration::Strict(r) | ParsedGeneration::Recovered(r) => Some(r),
            ParsedGeneration::Unparseable => None,
        }
    }
}

pub fn parse_generation(text: &str) -> ParsedGeneration {
    let stripped = strip_json_fences(text);
    if let Some(resume) = from_json(stripped) {
        return ParsedGeneration::Strict(resume);
    }

    if let Some(resume) = extract_object(text).and_then(from_json) {
        return ParsedGeneration::Recovered(resume);
    }

    if let Some(tailored_resume) = extract_tailored_field(text) {
        return ParsedGeneration::Recovered(GeneratedResume {
            tailored_resume,
            changes: vec![],
            sections: vec![],
        });
    }

    ParsedGeneration::Unparseable
}

fn from_json(text: &str) -> Option<GeneratedResume> {
    serde_json::from_str::<GeneratedResume>(text)
        .ok()
        .filter(|r| !r.tailored_resume.trim().is_empty())
}

/// Strips ```json ... ``` or ``` ... ``` code fences from LLM output.
pub fn strip_json_fences(text: &str) -> &str {
    let text = text.trim();
    if let Some(stripped) = text.strip_prefix("```json") {
        stripped
            .trim_start()
            .strip_suffix("```")
            .map(|s| s.trim())
            .unwrap_or(stripped.trim_start())
    } else if let Some(stripped) = text.strip_prefix("```") {
        stripped
            .trim_start()
            .strip_suffix("```")
            .map(|s| s.trim())
            .unwrap_or(stripped.trim_start())
    } else {
        text
    }
}

/// From the first `{` to the last `}`.
fn extract_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn tailored_field_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""tailoredResume"\s*:\s*"((?:[^"\\]|\\.)*)""#).ok())
        .as_ref()
}

fn extract_tailored_field(text: &str) -> Option<String> {
    let captured = tailored_field_regex()?.captures(text)?.get(1)?.as_str();
    let unescaped: String = serde_json::from_str(&format!("\"{captured}\"")).ok()?;
    (!unescaped.trim().is_empty()).then_some(unescaped)
}
