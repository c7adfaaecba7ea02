//! Fleet supervision: launching servers, gating readiness, tearing down.
//!
//! A [`Fleet`] owns every server process of a job together with its readiness
//! outcome. Callers get aggregate views (ready endpoints, counts, a manifest);
//! stopping processes only happens through [`teardown::teardown`].

pub mod launcher;
pub mod readiness;
pub mod teardown;

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};
use crate::fsutil;
use crate::server::{EndpointId, ServerEndpoint};

pub use launcher::{
    gate_endpoints, launch_fleet, plan_launch, CommandSpawner, LaunchSpec, ServerSpawner, SpawnError,
};
pub use readiness::{ReadinessGate, ReadinessReport, ReadinessState};
pub use teardown::{teardown, TeardownConfig, TeardownReport};

#[derive(Debug, Clone)]
pub struct FleetMember {
    pub endpoint: ServerEndpoint,
    pub report: ReadinessReport,
}

impl FleetMember {
    pub fn new(endpoint: ServerEndpoint, report: ReadinessReport) -> Self {
        Self { endpoint, report }
    }

    pub fn state(&self) -> ReadinessState {
        self.report.state
    }
}

#[derive(Debug, Default)]
pub struct Fleet {
    members: Vec<FleetMember>,
}

impl Fleet {
    pub fn new(mut members: Vec<FleetMember>) -> Self {
        members.sort_by(|a, b| a.endpoint.id().cmp(&b.endpoint.id()));
        Self { members }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> &[FleetMember] {
        &self.members
    }

    pub fn states(&self) -> BTreeMap<EndpointId, ReadinessState> {
        self.members
            .iter()
            .map(|m| (m.endpoint.id(), m.state()))
            .collect()
    }

    pub fn count_ready(&self) -> usize {
        self.members
            .iter()
            .filter(|m| m.state() == ReadinessState::Ready)
            .count()
    }

    pub fn count_failed(&self) -> usize {
        self.members
            .iter()
            .filter(|m| m.state() == ReadinessState::Failed)
            .count()
    }

    /// Ready endpoints in (node, slot) order.
    pub fn ready_endpoints(&self) -> Vec<ServerEndpoint> {
        self.members
            .iter()
            .filter(|m| m.state() == ReadinessState::Ready)
            .map(|m| m.endpoint.clone())
            .collect()
    }

    /// Ready endpoints, or the fleet-wide failure when there are none.
    pub fn require_ready(&self) -> Result<Vec<ServerEndpoint>> {
        let ready = self.ready_endpoints();
        if ready.is_empty() {
            return Err(FleetError::AllEndpointsFailed(self.members.len()));
        }
        Ok(ready)
    }

    pub fn manifest(&self) -> FleetManifest {
        FleetManifest {
            created_at: Utc::now(),
            endpoints: self
                .members
                .iter()
                .map(|m| ManifestEntry {
                    node: m.endpoint.node.clone(),
                    slot: m.endpoint.slot,
                    host: m.endpoint.host.clone(),
                    port: m.endpoint.port,
                    pid: m.endpoint.pid(),
                    state: m.state(),
                    detail: m.report.last_observation.clone(),
                })
                .collect(),
        }
    }

    pub(crate) fn into_members(self) -> Vec<FleetMember> {
        self.members
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub node: String,
    pub slot: usize,
    pub host: String,
    pub port: u16,
    pub pid: Option<u32>,
    pub state: ReadinessState,
    pub detail: Option<String>,
}

impl ManifestEntry {
    pub fn endpoint(&self) -> ServerEndpoint {
        ServerEndpoint::new(self.node.clone(), self.slot, self.host.clone(), self.port)
    }
}

/// Endpoints of a launched fleet, written by `launch` and read by `dispatch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetManifest {
    pub created_at: DateTime<Utc>,
    pub endpoints: Vec<ManifestEntry>,
}

impl FleetManifest {
    /// Endpoints recorded as ready at launch time.
    pub fn ready_endpoints(&self) -> Vec<ServerEndpoint> {
        self.endpoints
            .iter()
            .filter(|e| e.state == ReadinessState::Ready)
            .map(ManifestEntry::endpoint)
            .collect()
    }

    /// Write through a temporary file so readers never see a partial manifest.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        fsutil::write_atomic(path, &json)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| FleetError::Manifest(format!("{}: {e}", path.display())))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| FleetError::Manifest(format!("{}: {e}", path.display())))
    }
}

/// Parse `host:port[,host:port...]` into endpoints. Each endpoint's node is its
/// host and its slot is its position among endpoints on that host.
pub fn parse_endpoints(list: &str) -> Result<Vec<ServerEndpoint>> {
    let mut per_host: BTreeMap<String, usize> = BTreeMap::new();
    let mut endpoints = Vec::new();
    for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (host, port) = item.rsplit_once(':').ok_or_else(|| {
            FleetError::InvalidArgument(format!("endpoint {item:?} is not host:port"))
        })?;
        let port: u16 = port
            .parse()
            .map_err(|_| FleetError::InvalidArgument(format!("bad port in {item:?}")))?;
        let slot = per_host.entry(host.to_string()).or_insert(0);
        endpoints.push(ServerEndpoint::new(host, *slot, host, port));
        *slot += 1;
    }
    if endpoints.is_empty() {
        return Err(FleetError::InvalidArgument("no endpoints given".to_string()));
    }
    Ok(endpoints)
}
