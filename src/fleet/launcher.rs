use std::collections::HashSet;
use std::fs::File;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::{Child, Command};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{FleetConfig, ServerConfig};
use crate::error::{FleetError, Result};
use crate::fleet::readiness::{ReadinessGate, ReadinessReport, ReadinessState};
use crate::fleet::{Fleet, FleetMember};
use crate::server::{ProcessHandle, ServerEndpoint};

/// Everything needed to start one server.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub node: String,
    pub slot: usize,
    pub port: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Starts server processes. The launcher never waits on a spawn: `spawn`
/// returns as soon as the child exists.
pub trait ServerSpawner: Send + Sync {
    fn spawn(&self, spec: &LaunchSpec) -> std::result::Result<Child, SpawnError>;

    /// Host the dispatcher uses to reach a server on `node`.
    fn host_for(&self, node: &str) -> String {
        node.to_string()
    }
}

/// Spawns the configured server binary, directly on the local node or through
/// the remote shell on other nodes.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    config: ServerConfig,
    local_host: String,
}

impl CommandSpawner {
    pub fn new(config: ServerConfig) -> Self {
        let local_host = nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default();
        Self { config, local_host }
    }

    pub fn is_local(&self, node: &str) -> bool {
        matches!(node, "localhost" | "127.0.0.1" | "::1")
            || (!self.local_host.is_empty() && node == self.local_host)
    }

    /// Environment for one server: device pinning, transport, proxy bypass.
    pub fn environment(&self, spec: &LaunchSpec) -> Vec<(String, String)> {
        let mut env = vec![(
            self.config.device_selector_var.clone(),
            self.config.device_selector(spec.slot),
        )];
        if let Some(provider) = &self.config.network_provider {
            env.push(("FI_PROVIDER".to_string(), provider.clone()));
        }
        let no_proxy = format!("localhost,127.0.0.1,{}", spec.node);
        env.push(("no_proxy".to_string(), no_proxy.clone()));
        env.push(("NO_PROXY".to_string(), no_proxy));
        env
    }

    pub fn log_path(&self, spec: &LaunchSpec) -> Option<PathBuf> {
        self.config
            .log_dir
            .as_ref()
            .map(|dir| dir.join(format!("server-{}-{}.log", spec.node, spec.slot)))
    }

    /// Build the command without spawning it.
    pub fn command(&self, spec: &LaunchSpec) -> Command {
        let env = self.environment(spec);
        let args = self.config.server_args(spec.port);

        let mut cmd = if self.is_local(&spec.node) {
            let mut cmd = Command::new(&self.config.binary);
            cmd.args(&args).envs(env);
            cmd
        } else {
            let mut cmd = Command::new(&self.config.remote_shell);
            cmd.args(&self.config.remote_shell_args);
            cmd.arg(&spec.node).arg("env");
            cmd.args(env.iter().map(|(k, v)| format!("{k}={v}")));
            cmd.arg(&self.config.binary).args(&args);
            cmd
        };
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }
}

impl ServerSpawner for CommandSpawner {
    fn spawn(&self, spec: &LaunchSpec) -> std::result::Result<Child, SpawnError> {
        let mut cmd = self.command(spec);
        match self.log_path(spec) {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let log = File::create(&path)?;
                cmd.stdout(Stdio::from(log.try_clone()?)).stderr(Stdio::from(log));
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }
        Ok(cmd.spawn()?)
    }

    fn host_for(&self, node: &str) -> String {
        if self.is_local(node) {
            "127.0.0.1".to_string()
        } else {
            node.to_string()
        }
    }
}

/// One launch slot per (node, slot) with port `base_port + slot`.
pub fn plan_launch(config: &FleetConfig) -> Result<Vec<LaunchSpec>> {
    if config.nodes.is_empty() {
        return Err(FleetError::InvalidArgument("no nodes given".to_string()));
    }
    if config.slots_per_node == 0 {
        return Err(FleetError::InvalidArgument(
            "servers per node must be at least 1".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    let mut specs = Vec::with_capacity(config.nodes.len() * config.slots_per_node);
    for node in &config.nodes {
        if !seen.insert(node.as_str()) {
            return Err(FleetError::InvalidArgument(format!(
                "node {node} listed twice"
            )));
        }
        for slot in 0..config.slots_per_node {
            let port = u16::try_from(slot)
                .ok()
                .and_then(|s| config.base_port.checked_add(s))
                .ok_or_else(|| {
                    FleetError::InvalidArgument(format!(
                        "port for slot {slot} overflows base port {}",
                        config.base_port
                    ))
                })?;
            specs.push(LaunchSpec {
                node: node.clone(),
                slot,
                port,
            });
        }
    }
    Ok(specs)
}

fn failed_report(reason: String) -> ReadinessReport {
    ReadinessReport {
        state: ReadinessState::Failed,
        attempts: 0,
        last_observation: Some(reason),
        elapsed: std::time::Duration::ZERO,
    }
}

/// Start every server, then gate them all concurrently.
///
/// Servers that fail to spawn or to become ready stay in the returned fleet
/// as `Failed`; the caller decides whether enough are left (see
/// [`Fleet::require_ready`]). Cancelling `cancel` fails every gate still
/// running.
pub async fn launch_fleet(
    config: &FleetConfig,
    spawner: Arc<dyn ServerSpawner>,
    gate: ReadinessGate,
    cancel: &CancellationToken,
) -> Result<Fleet> {
    let specs = plan_launch(config)?;

    let mut addrs = HashSet::new();
    let mut members = Vec::with_capacity(specs.len());
    let mut gates = JoinSet::new();

    for spec in specs {
        let host = spawner.host_for(&spec.node);
        if !addrs.insert((host.clone(), spec.port)) {
            return Err(FleetError::InvalidArgument(format!(
                "{host}:{} assigned to more than one server",
                spec.port
            )));
        }
        let endpoint = ServerEndpoint::new(spec.node.clone(), spec.slot, host, spec.port);

        match spawner.spawn(&spec) {
            Ok(child) => {
                let endpoint = endpoint.with_process(ProcessHandle::new(child));
                tracing::info!(
                    endpoint = %endpoint,
                    pid = ?endpoint.pid(),
                    "Server launched"
                );
                spawn_gate(&mut gates, endpoint, &gate, cancel);
            }
            Err(e) => {
                tracing::error!(endpoint = %endpoint, error = %e, "Server failed to launch");
                members.push(FleetMember::new(endpoint, failed_report(e.to_string())));
            }
        }
    }

    collect_gates(gates, &mut members).await?;

    let fleet = Fleet::new(members);
    tracing::info!(
        total = fleet.len(),
        ready = fleet.count_ready(),
        failed = fleet.count_failed(),
        "Fleet launch finished"
    );
    Ok(fleet)
}

/// Gate servers that are already running, such as those listed in the
/// manifest of an earlier launch.
pub async fn gate_endpoints(
    endpoints: Vec<ServerEndpoint>,
    gate: &ReadinessGate,
    cancel: &CancellationToken,
) -> Result<Fleet> {
    let mut gates = JoinSet::new();
    for endpoint in endpoints {
        spawn_gate(&mut gates, endpoint, gate, cancel);
    }
    let mut members = Vec::new();
    collect_gates(gates, &mut members).await?;

    let fleet = Fleet::new(members);
    tracing::info!(
        total = fleet.len(),
        ready = fleet.count_ready(),
        failed = fleet.count_failed(),
        "Endpoint gating finished"
    );
    Ok(fleet)
}

fn spawn_gate(
    gates: &mut JoinSet<FleetMember>,
    endpoint: ServerEndpoint,
    gate: &ReadinessGate,
    cancel: &CancellationToken,
) {
    let gate = gate.clone();
    let cancel = cancel.clone();
    gates.spawn(async move {
        let report = tokio::select! {
            report = gate.await_ready(&endpoint) => report,
            _ = cancel.cancelled() => failed_report("cancelled during readiness".to_string()),
        };
        FleetMember::new(endpoint, report)
    });
}

async fn collect_gates(
    mut gates: JoinSet<FleetMember>,
    members: &mut Vec<FleetMember>,
) -> Result<()> {
    while let Some(joined) = gates.join_next().await {
        match joined {
            Ok(member) => members.push(member),
            Err(e) => {
                return Err(FleetError::Internal(format!("readiness task panicked: {e}")));
            }
        }
    }
    Ok(())
}
