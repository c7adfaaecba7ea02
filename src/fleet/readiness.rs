use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::ReadinessConfig;
use crate::server::{ChatRequest, InferenceClient, ProbeVerdict, ServerEndpoint};

const OBSERVATION_LIMIT: usize = 240;

/// Lifecycle of a server as seen from outside.
///
/// Moves forward only: `Starting -> ProbeReachable -> LoadingModel -> Ready`.
/// `Failed` is terminal and can be reached from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadinessState {
    Starting,
    ProbeReachable,
    LoadingModel,
    Ready,
    Failed,
}

impl std::fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadinessState::Starting => write!(f, "starting"),
            ReadinessState::ProbeReachable => write!(f, "reachable"),
            ReadinessState::LoadingModel => write!(f, "loading"),
            ReadinessState::Ready => write!(f, "ready"),
            ReadinessState::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of one gate run.
#[derive(Debug, Clone)]
pub struct ReadinessReport {
    pub state: ReadinessState,
    /// Probe attempts across both phases
    pub attempts: u32,
    /// Last response or error seen, for diagnostics
    pub last_observation: Option<String>,
    pub elapsed: Duration,
}

impl ReadinessReport {
    pub fn is_ready(&self) -> bool {
        self.state == ReadinessState::Ready
    }
}

/// Polls one server until it is ready or its budget runs out.
///
/// Phase 1 waits for `/health` to answer at all. Phase 2 sends a one-token
/// chat request until the response is no longer "loading". A gate holds no
/// shared mutable state, so any number can run at once.
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    client: InferenceClient,
    config: ReadinessConfig,
    model: String,
}

struct Progress {
    state: ReadinessState,
    attempts: u32,
    last: Option<String>,
    started: Instant,
}

impl Progress {
    fn observe(&mut self, observation: String) {
        let mut observation = observation;
        if observation.len() > OBSERVATION_LIMIT {
            let mut cut = OBSERVATION_LIMIT;
            while !observation.is_char_boundary(cut) {
                cut -= 1;
            }
            observation.truncate(cut);
        }
        self.last = Some(observation);
    }

    fn finish(self, state: ReadinessState) -> ReadinessReport {
        ReadinessReport {
            state,
            attempts: self.attempts,
            last_observation: self.last,
            elapsed: self.started.elapsed(),
        }
    }
}

impl ReadinessGate {
    pub fn new(client: InferenceClient, config: ReadinessConfig, model: impl Into<String>) -> Self {
        Self {
            client,
            config,
            model: model.into(),
        }
    }

    pub fn config(&self) -> &ReadinessConfig {
        &self.config
    }

    pub async fn await_ready(&self, endpoint: &ServerEndpoint) -> ReadinessReport {
        let mut progress = Progress {
            state: ReadinessState::Starting,
            attempts: 0,
            last: None,
            started: Instant::now(),
        };

        if !self.await_reachable(endpoint, &mut progress).await {
            tracing::warn!(
                endpoint = %endpoint,
                attempts = progress.attempts,
                last = ?progress.last,
                "Server never became reachable"
            );
            return progress.finish(ReadinessState::Failed);
        }
        progress.state = ReadinessState::ProbeReachable;
        tracing::debug!(endpoint = %endpoint, "Server reachable, probing model");

        let state = self.await_model(endpoint, &mut progress).await;
        match state {
            ReadinessState::Ready => tracing::info!(
                endpoint = %endpoint,
                attempts = progress.attempts,
                elapsed_ms = progress.started.elapsed().as_millis() as u64,
                "Server ready"
            ),
            _ => tracing::warn!(
                endpoint = %endpoint,
                attempts = progress.attempts,
                last = ?progress.last,
                "Server failed to finish loading"
            ),
        }
        progress.finish(state)
    }

    /// Phase 1. Returns false when the process died or the health budget ran out.
    async fn await_reachable(&self, endpoint: &ServerEndpoint, progress: &mut Progress) -> bool {
        let max_attempts = self.config.max_attempts(self.config.health_timeout);
        let deadline = Instant::now() + self.config.health_timeout;
        let mut attempts = 0;

        loop {
            if let Some(exit) = endpoint.exited() {
                progress.observe(format!("process exited: {exit}"));
                return false;
            }

            attempts += 1;
            progress.attempts += 1;
            match self.client.health(endpoint).await {
                Ok(raw) => {
                    progress.observe(format!("health HTTP {}: {}", raw.status, raw.body));
                    return true;
                }
                Err(e) => progress.observe(format!("health probe: {e}")),
            }

            // The process may have died while we were connecting.
            if let Some(exit) = endpoint.exited() {
                progress.observe(format!("process exited: {exit}"));
                return false;
            }
            if attempts >= max_attempts || Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Phase 2. Returns `Ready` or `Failed`.
    async fn await_model(
        &self,
        endpoint: &ServerEndpoint,
        progress: &mut Progress,
    ) -> ReadinessState {
        let max_attempts = self.config.max_attempts(self.config.load_timeout);
        let deadline = Instant::now() + self.config.load_timeout;
        let probe = ChatRequest::probe(self.model.clone());
        let mut attempts = 0;

        loop {
            if let Some(exit) = endpoint.exited() {
                progress.observe(format!("process exited: {exit}"));
                return ReadinessState::Failed;
            }

            attempts += 1;
            progress.attempts += 1;
            match self.client.send_chat(endpoint, &probe).await {
                Ok(raw) => match raw.verdict() {
                    ProbeVerdict::Ready => {
                        progress.observe(format!("HTTP {}: {}", raw.status, raw.body));
                        return ReadinessState::Ready;
                    }
                    ProbeVerdict::Loading => {
                        if progress.state != ReadinessState::LoadingModel {
                            tracing::debug!(endpoint = %endpoint, "Model loading");
                        }
                        progress.state = ReadinessState::LoadingModel;
                        progress.observe(format!("HTTP {}: {}", raw.status, raw.body));
                    }
                    ProbeVerdict::Malformed => {
                        progress.observe(format!("malformed HTTP {}: {}", raw.status, raw.body));
                    }
                },
                Err(e) => progress.observe(format!("inference probe: {e}")),
            }

            if attempts >= max_attempts || Instant::now() >= deadline {
                return ReadinessState::Failed;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}
