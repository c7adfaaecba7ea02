use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::{DispatchConfig, InferenceConfig, RetryConfig};
use crate::fsutil;
use crate::scheduler::{ShardStatus, WorkShard};
use crate::server::{ChatRequest, EndpointId, InferenceClient, InferenceError, ServerEndpoint};
use crate::worker::prompt::{build_messages, build_prompt, clean_latex, parse_strict_json};
use crate::worker::records::{encode_artifact, read_shard, InputRecord, OutputRecord, RecordStatus};

/// Why a shard ended up `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardFailure {
    /// The worker's server stopped answering; the shard can go elsewhere
    EndpointLost,
    /// Shutdown or time budget interrupted the shard
    Cancelled,
    /// Input file could not be read
    Unreadable,
    /// Artifact could not be encoded or written
    WriteFailed,
    /// The worker task ended without reporting the shard
    WorkerAborted,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardResult {
    pub shard: WorkShard,
    pub worker: usize,
    pub endpoint: EndpointId,
    pub status: ShardStatus,
    /// Rows written to the artifact
    pub records: usize,
    /// Rows written with status `error`
    pub record_errors: usize,
    pub artifact: Option<PathBuf>,
    pub error: Option<String>,
    pub failure: Option<ShardFailure>,
}

impl ShardResult {
    pub(crate) fn failed(
        worker: &Worker,
        shard: WorkShard,
        failure: ShardFailure,
        error: String,
    ) -> Self {
        Self {
            shard,
            worker: worker.index,
            endpoint: worker.endpoint.id(),
            status: ShardStatus::Failed,
            records: 0,
            record_errors: 0,
            artifact: None,
            error: Some(error),
            failure: Some(failure),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == ShardStatus::Completed
    }
}

enum RecordOutcome {
    Done(OutputRecord),
    EndpointLost(String),
    Cancelled,
}

/// Processes an ordered list of shards against one server.
///
/// Records are sent one at a time. A failing record is retried with backoff
/// and then written as an `error` placeholder; only losing the server fails
/// the shard. Once the server is lost every remaining shard is returned
/// `Failed` so the caller can hand it to another worker.
#[derive(Debug, Clone)]
pub struct Worker {
    index: usize,
    endpoint: ServerEndpoint,
    client: InferenceClient,
    inference: InferenceConfig,
    retry: RetryConfig,
    dst_dir: PathBuf,
    cancel: CancellationToken,
}

impl Worker {
    pub fn new(
        index: usize,
        endpoint: ServerEndpoint,
        client: InferenceClient,
        config: &DispatchConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            index,
            endpoint,
            client,
            inference: config.inference.clone(),
            retry: config.retry.clone(),
            dst_dir: config.dst_dir.clone(),
            cancel,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn endpoint(&self) -> &ServerEndpoint {
        &self.endpoint
    }

    pub async fn run(&self, shards: Vec<WorkShard>) -> Vec<ShardResult> {
        tracing::info!(
            worker = self.index,
            endpoint = %self.endpoint,
            shards = shards.len(),
            "Worker started"
        );
        let mut results = Vec::with_capacity(shards.len());
        let mut lost: Option<String> = None;

        for shard in shards {
            if let Some(reason) = &lost {
                tracing::warn!(
                    worker = self.index,
                    shard = %shard.name,
                    status = %ShardStatus::Failed,
                    "Endpoint lost before shard started"
                );
                results.push(ShardResult::failed(
                    self,
                    shard,
                    ShardFailure::EndpointLost,
                    format!("endpoint lost before shard started: {reason}"),
                ));
                continue;
            }
            if self.cancel.is_cancelled() {
                results.push(ShardResult::failed(
                    self,
                    shard,
                    ShardFailure::Cancelled,
                    "cancelled before shard started".to_string(),
                ));
                continue;
            }

            let result = self.process_shard(shard).await;
            if result.failure == Some(ShardFailure::EndpointLost) {
                lost = result.error.clone();
            }
            results.push(result);
        }

        let completed = results.iter().filter(|r| r.is_completed()).count();
        tracing::info!(
            worker = self.index,
            endpoint = %self.endpoint,
            completed,
            failed = results.len() - completed,
            "Worker finished"
        );
        results
    }

    /// Run every record of one shard and write its artifact.
    pub async fn process_shard(&self, shard: WorkShard) -> ShardResult {
        tracing::info!(
            worker = self.index,
            shard = %shard.name,
            status = %ShardStatus::InProgress,
            "Shard started"
        );

        let path = shard.path.clone();
        let inputs = match tokio::task::spawn_blocking(move || read_shard(&path)).await {
            Ok(Ok(inputs)) => inputs,
            Ok(Err(e)) => return self.fail(shard, ShardFailure::Unreadable, e.to_string()),
            Err(e) => return self.fail(shard, ShardFailure::Unreadable, e.to_string()),
        };

        let mut rows = Vec::with_capacity(inputs.len());
        for input in &inputs {
            match self.infer_record(input).await {
                RecordOutcome::Done(row) => rows.push(row),
                RecordOutcome::EndpointLost(reason) => {
                    return self.fail(shard, ShardFailure::EndpointLost, reason);
                }
                RecordOutcome::Cancelled => {
                    return self.fail(
                        shard,
                        ShardFailure::Cancelled,
                        format!("cancelled after {} of {} records", rows.len(), inputs.len()),
                    );
                }
            }
        }

        let record_errors = rows
            .iter()
            .filter(|r| r.status == RecordStatus::Error)
            .count();
        let records = rows.len();
        let artifact = shard.artifact_path(&self.dst_dir);
        let target = artifact.clone();
        let written = tokio::task::spawn_blocking(move || -> crate::error::Result<()> {
            let bytes = encode_artifact(&rows)?;
            fsutil::write_atomic(&target, &bytes)
        })
        .await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return self.fail(shard, ShardFailure::WriteFailed, e.to_string()),
            Err(e) => return self.fail(shard, ShardFailure::WriteFailed, e.to_string()),
        }

        tracing::info!(
            worker = self.index,
            shard = %shard.name,
            status = %ShardStatus::Completed,
            records,
            record_errors,
            artifact = %artifact.display(),
            "Shard completed"
        );
        ShardResult {
            shard,
            worker: self.index,
            endpoint: self.endpoint.id(),
            status: ShardStatus::Completed,
            records,
            record_errors,
            artifact: Some(artifact),
            error: None,
            failure: None,
        }
    }

    fn fail(&self, shard: WorkShard, failure: ShardFailure, error: String) -> ShardResult {
        tracing::error!(
            worker = self.index,
            endpoint = %self.endpoint,
            shard = %shard.name,
            status = %ShardStatus::Failed,
            failure = ?failure,
            error = %error,
            "Shard failed"
        );
        ShardResult::failed(self, shard, failure, error)
    }

    async fn infer_record(&self, input: &InputRecord) -> RecordOutcome {
        let Some(latex_raw) = input.content.as_deref() else {
            return RecordOutcome::Done(OutputRecord::placeholder(
                input,
                String::new(),
                RecordStatus::Error,
                Some("record has no LaTeX content".to_string()),
            ));
        };
        let latex_clean = clean_latex(latex_raw);
        let prompt = build_prompt(&latex_clean);

        // The budget covers the filled template, not the fixed system message.
        let prompt_chars = prompt.chars().count();
        let budget = self.inference.max_prompt_chars();
        if prompt_chars > budget {
            tracing::debug!(
                worker = self.index,
                row = input.row_index,
                prompt_chars,
                budget,
                "Skipping over-long prompt"
            );
            return RecordOutcome::Done(OutputRecord::placeholder(
                input,
                latex_clean,
                RecordStatus::Skipped,
                Some(format!("prompt too long ({prompt_chars} > {budget} chars)")),
            ));
        }

        let request = ChatRequest::new(
            self.inference.model.clone(),
            build_messages(prompt),
            self.inference.max_tokens,
        );
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error = InferenceError::Cancelled;

        for attempt in 1..=max_attempts {
            let response = tokio::select! {
                _ = self.cancel.cancelled() => return RecordOutcome::Cancelled,
                r = self.client.complete(&self.endpoint, &request) => r,
            };
            match response {
                Ok(content) => {
                    return RecordOutcome::Done(self.record_from_content(
                        input,
                        latex_clean,
                        content,
                        attempt,
                    ));
                }
                Err(e) => {
                    tracing::debug!(
                        worker = self.index,
                        row = input.row_index,
                        attempt,
                        error = %e,
                        "Inference attempt failed"
                    );
                    last_error = e;
                }
            }

            if let Some(exit) = self.endpoint.exited() {
                return RecordOutcome::EndpointLost(format!("server process exited: {exit}"));
            }
            if attempt < max_attempts {
                let delay = with_jitter(self.retry.backoff(attempt));
                tokio::select! {
                    _ = self.cancel.cancelled() => return RecordOutcome::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        // A server that died mid-answer fails with a transport error first and
        // refuses connections after, so only the final attempt decides.
        if last_error.is_unreachable() {
            return RecordOutcome::EndpointLost(last_error.to_string());
        }
        tracing::warn!(
            worker = self.index,
            row = input.row_index,
            attempts = max_attempts,
            error = %last_error,
            "Record failed, writing placeholder"
        );
        let mut row = OutputRecord::placeholder(
            input,
            latex_clean,
            RecordStatus::Error,
            Some(last_error.to_string()),
        );
        row.attempts = max_attempts;
        RecordOutcome::Done(row)
    }

    fn record_from_content(
        &self,
        input: &InputRecord,
        latex_clean: String,
        content: String,
        attempts: u32,
    ) -> OutputRecord {
        let parsed = parse_strict_json(&content);
        let status = if parsed.is_ok() {
            RecordStatus::Ok
        } else {
            RecordStatus::Unparsed
        };
        let mut row = OutputRecord::placeholder(input, latex_clean, status, None);
        row.attempts = attempts;
        row.llm_raw_output = Some(content);

        match parsed {
            Ok(parsed) => {
                row.math_keywords = serde_json::to_string(&parsed.analysis.math_keywords).ok();
                row.math_sentence = Some(parsed.analysis.math_sentence.clone());
                row.katex = Some(parsed.analysis.katex.clone());
                row.equiv_form_1 = serde_json::to_string(&parsed.equivalents.equiv_form_1).ok();
                row.equiv_form_2 = serde_json::to_string(&parsed.equivalents.equiv_form_2).ok();
                row.output_json = serde_json::to_string(&parsed).ok();
            }
            Err(e) => row.error = Some(e.to_string()),
        }
        row
    }
}

/// Add up to 25% random jitter.
fn with_jitter(delay: Duration) -> Duration {
    let max_ms = (delay.as_millis() / 4) as u64;
    if max_ms == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}
