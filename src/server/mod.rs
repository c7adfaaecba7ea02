//! Inference server endpoints.
//!
//! The inference server itself is an external process. This module only knows
//! where it listens ([`ServerEndpoint`]), whether its process is still alive
//! ([`ProcessHandle`]), and how to talk to it ([`InferenceClient`]).

pub mod client;
pub mod verdict;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::process::Child;

pub use client::{ChatMessage, ChatRequest, InferenceClient, InferenceError};
pub use verdict::{classify, ProbeVerdict};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Stable identity of a server within a fleet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId {
    pub node: String,
    pub slot: usize,
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.slot)
    }
}

/// Network address of one server plus, when this process launched it, the
/// handle used to watch and stop it.
#[derive(Debug, Clone)]
pub struct ServerEndpoint {
    pub node: String,
    pub slot: usize,
    pub host: String,
    pub port: u16,
    process: Option<ProcessHandle>,
}

impl ServerEndpoint {
    pub fn new(node: impl Into<String>, slot: usize, host: impl Into<String>, port: u16) -> Self {
        Self {
            node: node.into(),
            slot,
            host: host.into(),
            port,
            process: None,
        }
    }

    pub fn with_process(mut self, process: ProcessHandle) -> Self {
        self.process = Some(process);
        self
    }

    pub fn id(&self) -> EndpointId {
        EndpointId {
            node: self.node.clone(),
            slot: self.slot,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(ProcessHandle::pid)
    }

    /// `Some(description)` if the backing process is known to have exited.
    /// Endpoints without a process handle are assumed alive.
    pub fn exited(&self) -> Option<String> {
        self.process.as_ref().and_then(ProcessHandle::exit_status)
    }

    pub(crate) fn process(&self) -> Option<&ProcessHandle> {
        self.process.as_ref()
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}:{}", self.node, self.slot, self.host, self.port)
    }
}

/// How a terminated process went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Termination {
    /// Already gone before teardown started
    AlreadyExited,
    /// Exited within the grace period after SIGTERM
    Graceful,
    /// Needed SIGKILL
    Killed,
    /// Still running after the hard deadline
    Unresponsive,
}

/// Shared handle to a spawned server process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    child: Arc<Mutex<Child>>,
    pid: Option<u32>,
}

impl ProcessHandle {
    pub fn new(child: Child) -> Self {
        let pid = child.id();
        Self {
            child: Arc::new(Mutex::new(child)),
            pid,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn lock(&self) -> MutexGuard<'_, Child> {
        match self.child.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Non-blocking check for process exit.
    pub fn exit_status(&self) -> Option<String> {
        match self.lock().try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("unable to query process: {e}")),
        }
    }

    async fn wait_exit(&self, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            if self.exit_status().is_some() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL and wait up to `kill_deadline`.
    pub(crate) async fn terminate(&self, grace: Duration, kill_deadline: Duration) -> Termination {
        if self.exit_status().is_some() {
            return Termination::AlreadyExited;
        }

        if let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()) {
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                tracing::debug!(pid, error = %e, "SIGTERM failed");
            }
            if self.wait_exit(grace).await {
                return Termination::Graceful;
            }
        }

        if let Err(e) = self.lock().start_kill() {
            tracing::debug!(pid = ?self.pid, error = %e, "SIGKILL failed");
        }
        if self.wait_exit(kill_deadline).await {
            Termination::Killed
        } else {
            Termination::Unresponsive
        }
    }
}
