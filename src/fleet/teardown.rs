use std::collections::BTreeMap;
use std::time::Duration;

use tokio::task::JoinSet;

use crate::fleet::Fleet;
use crate::server::{EndpointId, Termination};
use crate::sync::{SyncLoop, SyncReport};

#[derive(Debug, Clone)]
pub struct TeardownConfig {
    /// Time a server gets to exit after SIGTERM
    pub grace: Duration,
    /// Time allowed for SIGKILL to take effect before giving up on a server
    pub kill_deadline: Duration,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(30),
            kill_deadline: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Default)]
pub struct TeardownReport {
    pub final_sync: Option<SyncReport>,
    pub terminations: BTreeMap<EndpointId, Termination>,
}

impl TeardownReport {
    pub fn count(&self, outcome: Termination) -> usize {
        self.terminations.values().filter(|t| **t == outcome).count()
    }
}

/// Final sync pass, then stop every server, then drop the fleet.
///
/// Best effort throughout: a failed sync is logged, and a server that ignores
/// both signals is reported `Unresponsive` once the hard deadline passes.
pub async fn teardown(
    fleet: Fleet,
    sync: Option<SyncLoop>,
    config: &TeardownConfig,
) -> TeardownReport {
    let mut report = TeardownReport::default();

    if let Some(sync) = sync {
        match sync.stop().await {
            Ok(final_sync) => report.final_sync = Some(final_sync),
            Err(e) => tracing::error!(error = %e, "Final sync failed"),
        }
    }

    let mut pending = BTreeMap::new();
    let mut stops = JoinSet::new();
    for member in fleet.into_members() {
        let endpoint = member.endpoint;
        let Some(process) = endpoint.process().cloned() else {
            continue;
        };
        let id = endpoint.id();
        pending.insert(id.clone(), endpoint.to_string());
        let (grace, kill_deadline) = (config.grace, config.kill_deadline);
        stops.spawn(async move { (id, process.terminate(grace, kill_deadline).await) });
    }

    let hard_deadline = config.grace + config.kill_deadline + Duration::from_secs(1);
    let collect = async {
        while let Some(joined) = stops.join_next().await {
            match joined {
                Ok((id, outcome)) => {
                    if let Some(endpoint) = pending.remove(&id) {
                        tracing::info!(endpoint = %endpoint, outcome = ?outcome, "Server stopped");
                    }
                    report.terminations.insert(id, outcome);
                }
                Err(e) => tracing::warn!(error = %e, "Terminate task failed"),
            }
        }
    };
    if tokio::time::timeout(hard_deadline, collect).await.is_err() {
        stops.abort_all();
    }

    for (id, endpoint) in pending {
        tracing::error!(endpoint = %endpoint, "Server did not stop before the hard deadline");
        report.terminations.insert(id, Termination::Unresponsive);
    }

    tracing::info!(
        stopped = report.terminations.len(),
        killed = report.count(Termination::Killed),
        unresponsive = report.count(Termination::Unresponsive),
        "Fleet torn down"
    );
    report
}
