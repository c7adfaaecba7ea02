//! Prompt construction and strict parsing of model output.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::server::ChatMessage;

pub const SYSTEM_PROMPT: &str = "You are precise and always return strict JSON only.";

const MAX_KEYWORDS: usize = 10;

const PROMPT_TEMPLATE: &str = r#"You are a Bourbaki-style pure mathematician: formal and entirely abstract. Analyze one LaTeX expression and return strict JSON that satisfies the schema. No text outside JSON.

INPUT
- latex_raw: the raw LaTeX string of a single expression

TASKS (pure math; no domain flavor)
1) math_keywords — ≤10 mathematical keywords, most→least important.
2) math_sentence — Single natural-language sentence description
3) katex — KaTeX representation (fix punctuation/braces; do NOT wrap in $...$ or \[...\]).
4) equiv_form_1 — Algebraically equivalent form with "name_of_trafo" and "assumptions".
5) equiv_form_2 — A different algebraically equivalent form with its own "name_of_trafo" and "assumptions".

OUTPUT RULES
- Output MUST be a single JSON object and nothing else.
- All keys/strings use double quotes.
- Escape backslashes in JSON strings (e.g., "\\frac").
- Keep LaTeX inside strings; do not add $...$ or \[...\].

JSON SCHEMA (informative, do not echo)
{schema}

Return only the JSON object.

LaTeX expression (raw):
{latex_raw}
"#;

/// JSON schema in declaration order with `", "` and `": "` separators.
const SCHEMA_TEXT: &str = r#"{"type": "object", "required": ["input", "analysis", "equivalents"], "additionalProperties": false, "properties": {"input": {"type": "object", "required": ["latex_raw"], "additionalProperties": false, "properties": {"latex_raw": {"type": "string", "minLength": 1}}}, "analysis": {"type": "object", "required": ["math_keywords", "math_sentence", "katex"], "additionalProperties": false, "properties": {"math_keywords": {"type": "array", "items": {"type": "string"}, "maxItems": 10}, "math_sentence": {"type": "string", "minLength": 1}, "katex": {"type": "string", "minLength": 1}}}, "equivalents": {"type": "object", "required": ["equiv_form_1", "equiv_form_2"], "additionalProperties": false, "properties": {"equiv_form_1": {"type": "object", "required": ["name_of_trafo", "assumptions", "latex"], "additionalProperties": false, "properties": {"name_of_trafo": {"type": "string", "minLength": 1}, "assumptions": {"type": "array", "items": {"type": "string"}}, "latex": {"type": "string", "minLength": 1}}}, "equiv_form_2": {"type": "object", "required": ["name_of_trafo", "assumptions", "latex"], "additionalProperties": false, "properties": {"name_of_trafo": {"type": "string", "minLength": 1}, "assumptions": {"type": "array", "items": {"type": "string"}}, "latex": {"type": "string", "minLength": 1}}}}}}}"#;

/// Remove `\label{...}`, surrounding whitespace and trailing commas.
pub fn clean_latex(raw: &str) -> String {
    const LABEL: &str = "\\label{";
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find(LABEL) {
        let after = &rest[start + LABEL.len()..];
        match after.find('}') {
            Some(end) => {
                out.push_str(&rest[..start]);
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out.trim().trim_end_matches(',').to_string()
}

pub fn build_prompt(latex: &str) -> String {
    PROMPT_TEMPLATE
        .replace("{schema}", SCHEMA_TEXT)
        .replace("{latex_raw}", latex)
}

/// System and user messages around a prompt from [`build_prompt`].
pub fn build_messages(prompt: String) -> Vec<ChatMessage> {
    vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputEcho {
    pub latex_raw: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Analysis {
    pub math_keywords: Vec<String>,
    pub math_sentence: String,
    pub katex: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EquivalentForm {
    pub name_of_trafo: String,
    pub assumptions: Vec<String>,
    pub latex: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Equivalents {
    pub equiv_form_1: EquivalentForm,
    pub equiv_form_2: EquivalentForm,
}

/// Model output that passed validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MathAnalysis {
    pub input: InputEcho,
    pub analysis: Analysis,
    pub equivalents: Equivalents,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("no JSON object at end of output")]
    NoJson,
    #[error("invalid JSON: {0}")]
    Json(String),
    #[error("schema violation: {0}")]
    Schema(String),
}

fn require_non_empty(field: &str, value: &str) -> Result<(), ParseError> {
    if value.is_empty() {
        return Err(ParseError::Schema(format!("{field} is empty")));
    }
    Ok(())
}

impl MathAnalysis {
    fn validate(&self) -> Result<(), ParseError> {
        require_non_empty("input.latex_raw", &self.input.latex_raw)?;
        require_non_empty("analysis.math_sentence", &self.analysis.math_sentence)?;
        require_non_empty("analysis.katex", &self.analysis.katex)?;
        if self.analysis.math_keywords.len() > MAX_KEYWORDS {
            return Err(ParseError::Schema(format!(
                "{} keywords, at most {MAX_KEYWORDS} allowed",
                self.analysis.math_keywords.len()
            )));
        }
        for (name, form) in [
            ("equiv_form_1", &self.equivalents.equiv_form_1),
            ("equiv_form_2", &self.equivalents.equiv_form_2),
        ] {
            require_non_empty(&format!("{name}.name_of_trafo"), &form.name_of_trafo)?;
            require_non_empty(&format!("{name}.latex"), &form.latex)?;
        }
        Ok(())
    }
}

/// Take the JSON object that ends the output (from its first `{` to the final
/// `}`) and validate it.
pub fn parse_strict_json(content: &str) -> Result<MathAnalysis, ParseError> {
    let trimmed = content.trim_end();
    if !trimmed.ends_with('}') {
        return Err(ParseError::NoJson);
    }
    let start = trimmed.find('{').ok_or(ParseError::NoJson)?;
    let parsed: MathAnalysis =
        serde_json::from_str(&trimmed[start..]).map_err(|e| ParseError::Json(e.to_string()))?;
    parsed.validate()?;
    Ok(parsed)
}
