//! The dispatch phase: split shards across ready endpoints, run one worker
//! per endpoint, and hand shards lost to a dead endpoint to the survivors.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::DispatchConfig;
use crate::error::{FleetError, Result};
use crate::scheduler::{artifact_exists, discover_shards, partition, WorkShard};
use crate::server::{EndpointId, InferenceClient, ServerEndpoint};
use crate::worker::{ShardFailure, ShardResult, Worker};

#[derive(Debug, Clone, Serialize)]
pub struct EndpointSummary {
    pub endpoint: EndpointId,
    pub addr: String,
    pub worker: usize,
    /// False once the endpoint was lost during dispatch
    pub healthy: bool,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchSummary {
    /// Shards found in the source directory
    pub shards_total: usize,
    /// Shards skipped because a valid artifact already existed
    pub skipped_done: usize,
    /// Reassignment rounds actually run
    pub reassign_rounds: u32,
    /// Final outcome of every shard that was attempted, ordered by shard
    pub results: Vec<ShardResult>,
    pub endpoints: Vec<EndpointSummary>,
}

impl DispatchSummary {
    pub fn completed(&self) -> usize {
        self.results.iter().filter(|r| r.is_completed()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.completed()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }
}

/// Run every shard without an artifact through the given endpoints.
///
/// Fails only when there is nothing to dispatch to or the directories are
/// unusable. Per-shard problems are reported in the summary.
pub async fn dispatch(
    config: &DispatchConfig,
    endpoints: Vec<ServerEndpoint>,
    client: InferenceClient,
    cancel: &CancellationToken,
) -> Result<DispatchSummary> {
    if endpoints.is_empty() {
        return Err(FleetError::AllEndpointsFailed(0));
    }
    if !config.src_dir.is_dir() {
        return Err(FleetError::InvalidArgument(format!(
            "source directory {} does not exist",
            config.src_dir.display()
        )));
    }
    std::fs::create_dir_all(&config.dst_dir)?;

    let shards = discover_shards(&config.src_dir)?;
    let workers: Vec<Worker> = endpoints
        .into_iter()
        .enumerate()
        .map(|(i, ep)| Worker::new(i, ep, client.clone(), config, cancel.clone()))
        .collect();

    let assignment = partition(&shards, workers.len(), |s| {
        artifact_exists(s, &config.dst_dir)
    })?;
    let pending: usize = assignment.values().map(Vec::len).sum();
    let skipped_done = shards.len() - pending;
    tracing::info!(
        shards = shards.len(),
        skipped_done,
        pending,
        workers = workers.len(),
        "Dispatch started"
    );

    let mut outcomes: BTreeMap<String, ShardResult> = BTreeMap::new();
    let round = run_round(&workers, assignment.into_iter().collect()).await;
    let mut unhealthy = lost_workers(&round);
    record(&mut outcomes, round);

    let mut rounds_run = 0;
    while rounds_run < config.reassign_rounds && !cancel.is_cancelled() {
        let lost: Vec<WorkShard> = outcomes
            .values()
            .filter(|r| r.failure == Some(ShardFailure::EndpointLost))
            .map(|r| r.shard.clone())
            .collect();
        if lost.is_empty() {
            break;
        }
        let healthy: Vec<usize> = (0..workers.len())
            .filter(|w| !unhealthy.contains(w))
            .collect();
        if healthy.is_empty() {
            tracing::error!(shards = lost.len(), "No healthy endpoints left for lost shards");
            break;
        }

        rounds_run += 1;
        tracing::warn!(
            round = rounds_run,
            shards = lost.len(),
            workers = healthy.len(),
            "Reassigning shards from lost endpoints"
        );
        let reassignment = partition(&lost, healthy.len(), |_| false)?;
        let plan = reassignment
            .into_iter()
            .map(|(slot, shards)| (healthy[slot], shards))
            .collect();
        let round = run_round(&workers, plan).await;
        unhealthy.extend(lost_workers(&round));
        record(&mut outcomes, round);
    }

    let results: Vec<ShardResult> = outcomes.into_values().collect();
    let endpoints = workers
        .iter()
        .map(|w| {
            let mine = results.iter().filter(|r| r.worker == w.index());
            let (completed, failed) = mine.fold((0, 0), |(c, f), r| {
                if r.is_completed() {
                    (c + 1, f)
                } else {
                    (c, f + 1)
                }
            });
            EndpointSummary {
                endpoint: w.endpoint().id(),
                addr: w.endpoint().addr(),
                worker: w.index(),
                healthy: !unhealthy.contains(&w.index()),
                completed,
                failed,
            }
        })
        .collect();

    let summary = DispatchSummary {
        shards_total: shards.len(),
        skipped_done,
        reassign_rounds: rounds_run,
        results,
        endpoints,
    };
    tracing::info!(
        completed = summary.completed(),
        failed = summary.failed(),
        skipped_done,
        rounds = rounds_run,
        "Dispatch finished"
    );
    Ok(summary)
}

fn lost_workers(results: &[ShardResult]) -> BTreeSet<usize> {
    results
        .iter()
        .filter(|r| r.failure == Some(ShardFailure::EndpointLost))
        .map(|r| r.worker)
        .collect()
}

fn record(outcomes: &mut BTreeMap<String, ShardResult>, results: Vec<ShardResult>) {
    for result in results {
        outcomes.insert(result.shard.name.clone(), result);
    }
}

/// Run one worker task per non-empty shard list and collect every result.
/// A shard whose worker task died is reported `WorkerAborted`.
async fn run_round(workers: &[Worker], plan: Vec<(usize, Vec<WorkShard>)>) -> Vec<ShardResult> {
    let mut tasks = JoinSet::new();
    let mut expected: BTreeMap<usize, Vec<WorkShard>> = BTreeMap::new();
    for (index, shards) in plan {
        let Some(worker) = workers.get(index) else {
            continue;
        };
        if shards.is_empty() {
            continue;
        }
        expected.insert(index, shards.clone());
        let worker = worker.clone();
        tasks.spawn(async move { (index, worker.run(shards).await) });
    }

    let mut results = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, mut shard_results)) => {
                expected.remove(&index);
                results.append(&mut shard_results);
            }
            Err(e) => tracing::error!(error = %e, "Worker task failed"),
        }
    }

    for (index, shards) in expected {
        let Some(worker) = workers.get(index) else {
            continue;
        };
        for shard in shards {
            results.push(ShardResult::failed(
                worker,
                shard,
                ShardFailure::WorkerAborted,
                "worker task ended without a result".to_string(),
            ));
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn no_endpoints_is_fleet_wide_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = DispatchConfig::new(dir.path().into(), dir.path().join("out"));
        let client = InferenceClient::new(Duration::from_secs(1)).unwrap();
        let err = dispatch(&config, vec![], client, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::AllEndpointsFailed(0)));
    }

    #[tokio::test]
    async fn missing_source_dir_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = DispatchConfig::new(dir.path().join("absent"), dir.path().join("out"));
        let client = InferenceClient::new(Duration::from_secs(1)).unwrap();
        let endpoints = vec![ServerEndpoint::new("n", 0, "127.0.0.1", 1)];
        let err = dispatch(&config, endpoints, client, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn empty_source_dir_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let config = DispatchConfig::new(dir.path().into(), dir.path().join("out"));
        let client = InferenceClient::new(Duration::from_secs(1)).unwrap();
        let endpoints = vec![ServerEndpoint::new("n", 0, "127.0.0.1", 1)];
        let summary = dispatch(&config, endpoints, client, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.shards_total, 0);
        assert!(summary.is_success());
    }
}
