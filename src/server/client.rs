//! HTTP client for the inference server's OpenAI-compatible API.
//!
//! Two calls are used: `GET /health` for liveness and
//! `POST /v1/chat/completions` for both readiness probes and real work.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Result;
use crate::server::verdict::{self, ProbeVerdict};
use crate::server::ServerEndpoint;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub n: u32,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>, max_tokens: u32) -> Self {
        Self {
            model: model.into(),
            messages,
            max_tokens,
            temperature: 0.0,
            top_p: 1.0,
            n: 1,
        }
    }

    /// Smallest request that exercises the model: one message, one token.
    pub fn probe(model: impl Into<String>) -> Self {
        Self::new(model, vec![ChatMessage::user("ping")], 1)
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// Status and body of a response, before interpretation.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

impl RawResponse {
    pub fn verdict(&self) -> ProbeVerdict {
        verdict::classify(self.status, &self.body)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("model still loading")]
    Loading,

    #[error("server returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response: {0}")]
    Malformed(String),

    #[error("cancelled")]
    Cancelled,
}

impl InferenceError {
    /// Connection-level failure: nothing is listening on the endpoint.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, InferenceError::Unreachable(_))
    }
}

impl From<reqwest::Error> for InferenceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            InferenceError::Timeout
        } else if e.is_connect() {
            InferenceError::Unreachable(e.to_string())
        } else {
            InferenceError::Transport(e.to_string())
        }
    }
}

/// Client shared by readiness gates and workers. Cheap to clone.
///
/// Proxies are disabled: servers live on the cluster network or loopback and
/// must never be reached through an HTTP proxy.
#[derive(Debug, Clone)]
pub struct InferenceClient {
    http: Client,
}

impl InferenceClient {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .no_proxy()
            .timeout(request_timeout)
            .connect_timeout(request_timeout.min(Duration::from_secs(10)))
            .build()?;
        Ok(Self { http })
    }

    /// `GET /health`. Any HTTP response means the process is reachable.
    pub async fn health(
        &self,
        endpoint: &ServerEndpoint,
    ) -> std::result::Result<RawResponse, InferenceError> {
        let url = format!("{}/health", endpoint.base_url());
        let resp = self.http.get(&url).send().await?;
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Ok(RawResponse { status, body })
    }

    /// `POST /v1/chat/completions` without interpreting the response.
    pub async fn send_chat(
        &self,
        endpoint: &ServerEndpoint,
        request: &ChatRequest,
    ) -> std::result::Result<RawResponse, InferenceError> {
        let url = format!("{}/v1/chat/completions", endpoint.base_url());
        let resp = self.http.post(&url).json(request).send().await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        Ok(RawResponse { status, body })
    }

    /// Run one chat completion and return the first choice's content.
    pub async fn complete(
        &self,
        endpoint: &ServerEndpoint,
        request: &ChatRequest,
    ) -> std::result::Result<String, InferenceError> {
        let raw = self.send_chat(endpoint, request).await?;
        if raw.verdict() == ProbeVerdict::Loading {
            return Err(InferenceError::Loading);
        }
        if raw.status != 200 {
            return Err(InferenceError::Status {
                status: raw.status,
                body: raw.body,
            });
        }
        parse_completion(&raw.body)
    }
}

fn parse_completion(body: &str) -> std::result::Result<String, InferenceError> {
    let completion: ChatCompletion = serde_json::from_str(body)
        .map_err(|e| InferenceError::Malformed(format!("invalid completion JSON: {e}")))?;
    completion
        .choices
        .into_iter()
        .next()
        .map(|c| c.message.content)
        .ok_or_else(|| InferenceError::Malformed("completion has no choices".to_string()))
}
