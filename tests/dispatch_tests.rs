
use std::collections::BTreeSet;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use fleet_infer::dispatch::dispatch;
use fleet_infer::scheduler::{artifact_exists, discover_shards};
use fleet_infer::server::{InferenceClient, ServerEndpoint};
use fleet_infer::worker::{read_artifact, ShardFailure};
use test_harness::{closed_port, fast_dispatch_config, write_shards, MockBehavior, MockServer};

fn client() -> InferenceClient {
    InferenceClient::new(Duration::from_secs(5)).unwrap()
}

async fn start_mocks(count: usize, behavior: MockBehavior) -> Vec<MockServer> {
    let mut mocks = Vec::new();
    for _ in 0..count {
        mocks.push(MockServer::start("127.0.0.1", 0, behavior.clone()).await);
    }
    mocks
}

fn endpoints(mocks: &[MockServer]) -> Vec<ServerEndpoint> {
    mocks
        .iter()
        .enumerate()
        .map(|(i, m)| m.endpoint("local", i))
        .collect()
}

/// Ten shards on three endpoints produce exactly ten artifacts.
#[tokio::test]
async fn test_all_shards_get_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("in");
    let dst = dir.path().join("out");
    write_shards(&src, 10, 2);

    let mocks = start_mocks(3, MockBehavior::ready()).await;
    let config = fast_dispatch_config(&src, &dst);
    let summary = dispatch(&config, endpoints(&mocks), client(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.shards_total, 10);
    assert_eq!(summary.skipped_done, 0);
    assert_eq!(summary.completed(), 10);
    assert_eq!(summary.reassign_rounds, 0);

    let artifacts: Vec<_> = std::fs::read_dir(&dst).unwrap().collect();
    assert_eq!(artifacts.len(), 10);
    for shard in discover_shards(&src).unwrap() {
        assert!(artifact_exists(&shard, &dst));
        assert_eq!(read_artifact(&shard.artifact_path(&dst)).unwrap().len(), 2);
    }

    // Round-robin over three workers: 4 + 3 + 3 shards.
    let mut per_endpoint: Vec<usize> = summary.endpoints.iter().map(|e| e.completed).collect();
    per_endpoint.sort();
    assert_eq!(per_endpoint, vec![3, 3, 4]);
    let total_completions: usize = mocks.iter().map(MockServer::completions).sum();
    assert_eq!(total_completions, 20);
}

/// A rerun only processes shards without an artifact.
#[tokio::test]
async fn test_resume_skips_completed_shards() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("in");
    let dst = dir.path().join("out");
    write_shards(&src, 10, 1);

    // First run on a budget of six shards: one worker, cancelled once six are done.
    let config = fast_dispatch_config(&src, &dst);
    {
        let mocks = start_mocks(1, MockBehavior::ready()).await;
        let shards = discover_shards(&src).unwrap();
        let partial_src = dir.path().join("partial");
        std::fs::create_dir_all(&partial_src).unwrap();
        for shard in shards.iter().take(6) {
            std::fs::copy(&shard.path, partial_src.join(&shard.name)).unwrap();
        }
        let partial = fast_dispatch_config(&partial_src, &dst);
        let summary = dispatch(&partial, endpoints(&mocks), client(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.completed(), 6);
    }

    let mocks = start_mocks(2, MockBehavior::ready()).await;
    let summary = dispatch(&config, endpoints(&mocks), client(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.shards_total, 10);
    assert_eq!(summary.skipped_done, 6);
    assert_eq!(summary.results.len(), 4);
    let total_completions: usize = mocks.iter().map(MockServer::completions).sum();
    assert_eq!(total_completions, 4);

    let done: BTreeSet<String> = summary.results.iter().map(|r| r.shard.name.clone()).collect();
    let expected: BTreeSet<String> = (6..10).map(|i| format!("shard_{i:03}.parquet")).collect();
    assert_eq!(done, expected);
}

/// A corrupt artifact does not count as done.
#[tokio::test]
async fn test_truncated_artifact_is_redone() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("in");
    let dst = dir.path().join("out");
    write_shards(&src, 2, 1);
    std::fs::create_dir_all(&dst).unwrap();
    std::fs::write(dst.join("shard_000__inferred.parquet"), b"PAR1 truncated").unwrap();

    let mocks = start_mocks(1, MockBehavior::ready()).await;
    let config = fast_dispatch_config(&src, &dst);
    let summary = dispatch(&config, endpoints(&mocks), client(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.skipped_done, 0);
    assert_eq!(summary.completed(), 2);
    assert_eq!(read_artifact(&dst.join("shard_000__inferred.parquet")).unwrap().len(), 1);
}

/// Shards of an endpoint that is gone are handed to the healthy endpoints.
#[tokio::test]
async fn test_dead_endpoint_shards_are_reassigned() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("in");
    let dst = dir.path().join("out");
    write_shards(&src, 9, 2);

    let mocks = start_mocks(2, MockBehavior::ready()).await;
    let mut eps = endpoints(&mocks);
    eps.insert(
        0,
        ServerEndpoint::new("dead", 0, "127.0.0.1", closed_port("127.0.0.1").await),
    );

    let config = fast_dispatch_config(&src, &dst);
    let summary = dispatch(&config, eps, client(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(summary.is_success(), "failed: {:?}", summary.results);
    assert_eq!(summary.completed(), 9);
    assert_eq!(summary.reassign_rounds, 1);
    let dead = summary
        .endpoints
        .iter()
        .find(|e| e.endpoint.node == "dead")
        .unwrap();
    assert!(!dead.healthy);
    assert_eq!(dead.completed, 0);
    assert!(summary
        .endpoints
        .iter()
        .filter(|e| e.endpoint.node != "dead")
        .all(|e| e.healthy));
}

/// An endpoint dying mid-run loses no shards when reassignment is allowed.
#[tokio::test]
async fn test_endpoint_dying_mid_run() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("in");
    let dst = dir.path().join("out");
    write_shards(&src, 6, 4);

    let dying = MockServer::start(
        "127.0.0.1",
        0,
        MockBehavior {
            die_after: Some(2),
            ..Default::default()
        },
    )
    .await;
    let healthy = MockServer::start("127.0.0.1", 0, MockBehavior::ready()).await;
    let eps = vec![dying.endpoint("local", 0), healthy.endpoint("local", 1)];

    let config = fast_dispatch_config(&src, &dst);
    let summary = dispatch(&config, eps, client(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.completed(), 6);
    assert!(!summary.endpoints[0].healthy);
    assert!(summary.endpoints[1].healthy);
    for shard in discover_shards(&src).unwrap() {
        assert!(artifact_exists(&shard, &dst));
    }
}

/// Without reassignment rounds, lost shards are reported failed and a rerun
/// picks them up.
#[tokio::test]
async fn test_lost_shards_without_reassignment() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("in");
    let dst = dir.path().join("out");
    write_shards(&src, 4, 1);

    let mocks = start_mocks(1, MockBehavior::ready()).await;
    let mut eps = endpoints(&mocks);
    eps.push(ServerEndpoint::new("dead", 0, "127.0.0.1", closed_port("127.0.0.1").await));

    let mut config = fast_dispatch_config(&src, &dst);
    config.reassign_rounds = 0;
    let summary = dispatch(&config, eps, client(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(!summary.is_success());
    assert_eq!(summary.completed(), 2);
    assert!(summary
        .results
        .iter()
        .filter(|r| !r.is_completed())
        .all(|r| r.failure == Some(ShardFailure::EndpointLost)));

    let summary = dispatch(&config, endpoints(&mocks), client(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(summary.is_success());
    assert_eq!(summary.skipped_done, 2);
    assert_eq!(summary.completed(), 2);
}

/// Cancelling dispatch abandons unfinished shards without artifacts.
#[tokio::test]
async fn test_cancelled_dispatch_leaves_unfinished_shards() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("in");
    let dst = dir.path().join("out");
    write_shards(&src, 4, 10);

    let behavior = MockBehavior {
        delay: Duration::from_millis(50),
        ..Default::default()
    };
    let mocks = start_mocks(2, behavior).await;
    let config = fast_dispatch_config(&src, &dst);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let summary = dispatch(&config, endpoints(&mocks), client(), &cancel)
        .await
        .unwrap();

    assert_eq!(summary.completed(), 0);
    assert!(summary
        .results
        .iter()
        .all(|r| r.failure == Some(ShardFailure::Cancelled)));
    for shard in discover_shards(&src).unwrap() {
        assert!(!artifact_exists(&shard, &dst));
    }
}
