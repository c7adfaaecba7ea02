//! Classification of probe responses.
//!
//! An inference server goes through starting, loading and ready phases but only
//! exposes them through HTTP responses. [`classify`] is the single place that
//! turns a response into a verdict:
//!
//! | Response | Verdict |
//! |---|---|
//! | body is not JSON | [`ProbeVerdict::Malformed`] |
//! | JSON error whose message mentions "loading model" | [`ProbeVerdict::Loading`] |
//! | HTTP 503 with no error message | [`ProbeVerdict::Loading`] |
//! | any other JSON body, whatever the status | [`ProbeVerdict::Ready`] |
//!
//! Application errors unrelated to loading (bad request, context overflow, ...)
//! are `Ready`: the server is serving, it just didn't like the request.

use serde_json::Value;

const LOADING_MARKER: &str = "loading model";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// Server is up but the model is still loading
    Loading,
    /// Server produced a structurally valid response
    Ready,
    /// Response body could not be interpreted
    Malformed,
}

impl std::fmt::Display for ProbeVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeVerdict::Loading => write!(f, "loading"),
            ProbeVerdict::Ready => write!(f, "ready"),
            ProbeVerdict::Malformed => write!(f, "malformed"),
        }
    }
}

/// Classify a response by HTTP status and raw body.
pub fn classify(status: u16, body: &str) -> ProbeVerdict {
    let value: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => return ProbeVerdict::Malformed,
    };

    match error_message(&value) {
        Some(msg) if msg.to_ascii_lowercase().contains(LOADING_MARKER) => ProbeVerdict::Loading,
        None if status == 503 => ProbeVerdict::Loading,
        _ => ProbeVerdict::Ready,
    }
}

/// Extract the error message from `{"error": {"message": ...}}` or `{"error": "..."}`.
pub fn error_message(value: &Value) -> Option<&str> {
    match value.get("error")? {
        Value::String(s) => Some(s.as_str()),
        Value::Object(obj) => obj.get("message").and_then(Value::as_str),
        _ => None,
    }
}
