
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use fleet_infer::config::{FleetConfig, ReadinessConfig, SyncConfig};
use fleet_infer::dispatch::dispatch;
use fleet_infer::fleet::{
    gate_endpoints, launch_fleet, teardown, FleetManifest, ReadinessGate, ReadinessState,
    TeardownConfig,
};
use fleet_infer::server::{EndpointId, InferenceClient, Termination};
use fleet_infer::scheduler::{artifact_exists, discover_shards};
use fleet_infer::sync::SyncLoop;
use test_harness::{fast_dispatch_config, write_shards, MockBehavior, MockServer, StubSpawner};

fn fast_readiness() -> ReadinessConfig {
    ReadinessConfig::default()
        .with_timeouts(Duration::from_millis(500), Duration::from_secs(2))
        .with_poll_interval(Duration::from_millis(20))
}

fn gate() -> ReadinessGate {
    let client = InferenceClient::new(Duration::from_secs(2)).unwrap();
    ReadinessGate::new(client, fast_readiness(), "test-model")
}

fn fleet_config(nodes: &[&str], slots: usize, base_port: u16) -> FleetConfig {
    let nodes = nodes.iter().map(|n| n.to_string()).collect();
    let mut config = FleetConfig::new(nodes, slots, base_port);
    config.readiness = fast_readiness();
    config
}

fn id(node: &str, slot: usize) -> EndpointId {
    EndpointId {
        node: node.to_string(),
        slot,
    }
}

/// Two nodes with two servers each; one server dies at start. The fleet
/// reports exactly one failure and three ready endpoints.
#[tokio::test]
async fn test_launch_two_nodes_one_failure() {
    let base_port = 18710;
    let _a0 = MockServer::start("127.0.0.1", base_port, MockBehavior::loading_for(2)).await;
    let _a1 = MockServer::start("127.0.0.1", base_port + 1, MockBehavior::ready()).await;
    let _b0 = MockServer::start("127.0.0.2", base_port, MockBehavior::ready()).await;
    // Nothing listens for node-b slot 1 and its process exits at once.

    let spawner = StubSpawner::new(&[("node-a", "127.0.0.1"), ("node-b", "127.0.0.2")])
        .with_dying("node-b", 1);
    let config = fleet_config(&["node-a", "node-b"], 2, base_port);

    let fleet = launch_fleet(&config, Arc::new(spawner), gate(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(fleet.len(), 4);
    assert_eq!(fleet.count_ready(), 3);
    assert_eq!(fleet.count_failed(), 1);
    let states = fleet.states();
    assert_eq!(states[&id("node-a", 0)], ReadinessState::Ready);
    assert_eq!(states[&id("node-a", 1)], ReadinessState::Ready);
    assert_eq!(states[&id("node-b", 0)], ReadinessState::Ready);
    assert_eq!(states[&id("node-b", 1)], ReadinessState::Failed);

    let ready = fleet.require_ready().unwrap();
    assert_eq!(ready.len(), 3);
    assert!(ready.iter().all(|e| e.pid().is_some()));

    let report = teardown(fleet, None, &TeardownConfig::default()).await;
    assert_eq!(report.terminations.len(), 4);
    assert_eq!(report.terminations[&id("node-b", 1)], Termination::AlreadyExited);
    assert_eq!(report.count(Termination::Graceful), 3);
}

/// A 2x2 fleet with one server failing readiness still processes all ten
/// shards on the three ready endpoints.
#[tokio::test]
async fn test_launch_then_dispatch_end_to_end() {
    let base_port = 18770;
    let a0 = MockServer::start("127.0.0.1", base_port, MockBehavior::ready()).await;
    let a1 = MockServer::start("127.0.0.1", base_port + 1, MockBehavior::ready()).await;
    let b0 = MockServer::start("127.0.0.2", base_port, MockBehavior::ready()).await;

    let spawner = StubSpawner::new(&[("node-a", "127.0.0.1"), ("node-b", "127.0.0.2")])
        .with_dying("node-b", 1);
    let config = fleet_config(&["node-a", "node-b"], 2, base_port);
    let fleet = launch_fleet(&config, Arc::new(spawner), gate(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(fleet.count_failed(), 1);

    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("in");
    let dst = dir.path().join("out");
    write_shards(&src, 10, 2);
    let client = InferenceClient::new(Duration::from_secs(5)).unwrap();
    let summary = dispatch(
        &fast_dispatch_config(&src, &dst),
        fleet.require_ready().unwrap(),
        client,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.completed(), 10);
    assert_eq!(summary.endpoints.len(), 3);
    assert_eq!(std::fs::read_dir(&dst).unwrap().count(), 10);
    for shard in discover_shards(&src).unwrap() {
        assert!(artifact_exists(&shard, &dst));
    }
    let served = a0.completions() + a1.completions() + b0.completions();
    assert_eq!(served, 20);

    teardown(fleet, None, &TeardownConfig::default()).await;
}

/// Every server failing readiness is a fleet-wide failure.
#[tokio::test]
async fn test_all_servers_failing_is_fatal() {
    let spawner = StubSpawner::new(&[("node-a", "127.0.0.1")])
        .with_dying("node-a", 0)
        .with_dying("node-a", 1);
    let config = fleet_config(&["node-a"], 2, 18720);

    let fleet = launch_fleet(&config, Arc::new(spawner), gate(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(fleet.count_failed(), 2);
    assert!(fleet.require_ready().is_err());
    teardown(fleet, None, &TeardownConfig::default()).await;
}

/// Cancelling during readiness fails the gates still running.
#[tokio::test]
async fn test_cancel_during_launch() {
    let _mock = MockServer::start("127.0.0.1", 18730, MockBehavior::loading_for(usize::MAX)).await;
    let spawner = StubSpawner::new(&[("node-a", "127.0.0.1")]);
    let mut config = fleet_config(&["node-a"], 1, 18730);
    config.readiness = ReadinessConfig::default()
        .with_timeouts(Duration::from_secs(30), Duration::from_secs(30))
        .with_poll_interval(Duration::from_millis(20));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let fleet = tokio::time::timeout(
        Duration::from_secs(5),
        launch_fleet(&config, Arc::new(spawner), gate(), &cancel),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(fleet.count_failed(), 1);
    teardown(fleet, None, &TeardownConfig::default()).await;
}

/// Two servers mapped to the same address are rejected before anything starts.
#[tokio::test]
async fn test_duplicate_addresses_rejected() {
    let spawner = StubSpawner::new(&[("node-a", "127.0.0.1"), ("node-b", "127.0.0.1")]);
    let config = fleet_config(&["node-a", "node-b"], 1, 18740);

    let result = launch_fleet(&config, Arc::new(spawner), gate(), &CancellationToken::new()).await;
    assert!(result.is_err());
}

/// The manifest written after launch lets a later process re-gate the fleet.
#[tokio::test]
async fn test_manifest_round_trip_and_regate() {
    let dir = tempfile::tempdir().unwrap();
    let base_port = 18750;
    let _a0 = MockServer::start("127.0.0.1", base_port, MockBehavior::ready()).await;
    let spawner = StubSpawner::new(&[("node-a", "127.0.0.1")]).with_dying("node-a", 1);
    let config = fleet_config(&["node-a"], 2, base_port);

    let fleet = launch_fleet(&config, Arc::new(spawner), gate(), &CancellationToken::new())
        .await
        .unwrap();
    let path = dir.path().join("fleet.json");
    fleet.manifest().save(&path).unwrap();

    let manifest = FleetManifest::load(&path).unwrap();
    assert_eq!(manifest.endpoints.len(), 2);
    let ready = manifest.ready_endpoints();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].port, base_port);

    let regated = gate_endpoints(ready, &gate(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(regated.count_ready(), 1);
    // Re-gated endpoints carry no process handle.
    assert!(regated.members()[0].endpoint.pid().is_none());

    teardown(fleet, None, &TeardownConfig::default()).await;
}

/// Teardown runs the final sync pass before stopping servers, so artifacts
/// written after the last periodic cycle still reach durable storage.
#[tokio::test]
async fn test_teardown_runs_final_sync() {
    let dir = tempfile::tempdir().unwrap();
    let transient = dir.path().join("transient");
    let durable = dir.path().join("durable");
    std::fs::create_dir_all(&transient).unwrap();

    let sync = SyncLoop::start(
        SyncConfig::new(transient.clone(), durable.clone()).with_interval(Duration::from_secs(3600)),
    );
    std::fs::write(transient.join("late__inferred.parquet"), b"artifact").unwrap();

    let _mock = MockServer::start("127.0.0.1", 18760, MockBehavior::ready()).await;
    let spawner = StubSpawner::new(&[("node-a", "127.0.0.1")]);
    let config = fleet_config(&["node-a"], 1, 18760);
    let fleet = launch_fleet(&config, Arc::new(spawner), gate(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(fleet.count_ready(), 1);

    let report = teardown(
        fleet,
        Some(sync),
        &TeardownConfig {
            grace: Duration::from_millis(500),
            kill_deadline: Duration::from_secs(2),
        },
    )
    .await;

    let final_sync = report.final_sync.as_ref().unwrap();
    assert_eq!(final_sync.copied, 1);
    assert_eq!(
        std::fs::read(durable.join("late__inferred.parquet")).unwrap(),
        b"artifact"
    );
    assert_eq!(report.count(Termination::Graceful), 1);
}
