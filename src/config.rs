use std::path::PathBuf;
use std::time::Duration;

/// How a single inference server process is started.
///
/// One process is launched per (node, slot). The slot index selects the
/// accelerator through the device-selector variable and offsets the port.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server executable (e.g. `llama-server`)
    pub binary: PathBuf,
    /// Model file passed with `-m`
    pub model_path: PathBuf,
    pub ctx_size: u32,
    pub gpu_layers: u32,
    pub threads: u32,
    /// Address the server binds to. Must be reachable from the dispatcher.
    pub bind_host: String,
    /// Extra arguments appended verbatim
    pub extra_args: Vec<String>,
    /// Environment variable that pins a process to one accelerator
    pub device_selector_var: String,
    /// Value for the device selector; `{slot}` is replaced by the slot index
    pub device_selector_template: String,
    /// Value for `FI_PROVIDER` (cross-node transport). `None` leaves it unset.
    pub network_provider: Option<String>,
    /// Command used to reach nodes other than the local host
    pub remote_shell: String,
    /// Arguments given to the remote shell before the node name. The default
    /// `-tt` puts the remote server on a terminal, so it is hung up when the
    /// local session is terminated.
    pub remote_shell_args: Vec<String>,
    /// Directory receiving one stdout/stderr log per server
    pub log_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("llama-server"),
            model_path: PathBuf::new(),
            ctx_size: 1024,
            gpu_layers: 80,
            threads: 8,
            bind_host: "0.0.0.0".to_string(),
            extra_args: Vec::new(),
            device_selector_var: "ONEAPI_DEVICE_SELECTOR".to_string(),
            device_selector_template: "level_zero:{slot}".to_string(),
            network_provider: Some("tcp".to_string()),
            remote_shell: "ssh".to_string(),
            remote_shell_args: vec!["-tt".to_string()],
            log_dir: None,
        }
    }
}

impl ServerConfig {
    /// Device selector value for a slot
    pub fn device_selector(&self, slot: usize) -> String {
        self.device_selector_template
            .replace("{slot}", &slot.to_string())
    }

    /// Command-line arguments for a server bound to `port`.
    pub fn server_args(&self, port: u16) -> Vec<String> {
        let mut args = vec![
            "-m".to_string(),
            self.model_path.display().to_string(),
            "-c".to_string(),
            self.ctx_size.to_string(),
            "-ngl".to_string(),
            self.gpu_layers.to_string(),
            "-t".to_string(),
            self.threads.to_string(),
            "--host".to_string(),
            self.bind_host.clone(),
            "--port".to_string(),
            port.to_string(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Budgets for the readiness gate.
#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    /// How long to wait for the health probe to answer at all
    pub health_timeout: Duration,
    /// How long to wait for the model to finish loading
    pub load_timeout: Duration,
    /// Delay between probe attempts
    pub poll_interval: Duration,
    /// Timeout for one probe request
    pub request_timeout: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            health_timeout: Duration::from_secs(300),
            load_timeout: Duration::from_secs(1800),
            poll_interval: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl ReadinessConfig {
    pub fn with_timeouts(mut self, health_timeout: Duration, load_timeout: Duration) -> Self {
        self.health_timeout = health_timeout;
        self.load_timeout = load_timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Upper bound on attempts for a phase of the given length. Always at least 1.
    pub fn max_attempts(&self, phase_timeout: Duration) -> u32 {
        let poll = self.poll_interval.as_millis().max(1);
        let attempts = phase_timeout.as_millis().div_ceil(poll);
        attempts.clamp(1, u32::MAX as u128) as u32
    }
}

/// Per-record retry policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `attempt` (1-based), doubling up to `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

/// Parameters of each inference request.
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// Model name sent in the request body
    pub model: String,
    pub max_tokens: u32,
    pub request_timeout: Duration,
    /// Context size of the servers; bounds the prompt length
    pub ctx_size: u32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            model: "gpt-oss-120b".to_string(),
            max_tokens: 500,
            request_timeout: Duration::from_secs(600),
            ctx_size: 1024,
        }
    }
}

impl InferenceConfig {
    /// Coarse character budget for a prompt (about 4 characters per token).
    pub fn max_prompt_chars(&self) -> usize {
        self.ctx_size as usize * 4
    }
}

#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub nodes: Vec<String>,
    pub slots_per_node: usize,
    pub base_port: u16,
    pub server: ServerConfig,
    pub readiness: ReadinessConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            nodes: vec!["localhost".to_string()],
            slots_per_node: 1,
            base_port: 18080,
            server: ServerConfig::default(),
            readiness: ReadinessConfig::default(),
        }
    }
}

impl FleetConfig {
    pub fn new(nodes: Vec<String>, slots_per_node: usize, base_port: u16) -> Self {
        Self {
            nodes,
            slots_per_node,
            base_port,
            ..Default::default()
        }
    }
}

/// Mirror of the transient output tree into durable storage.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub interval: Duration,
}

impl SyncConfig {
    pub fn new(source: PathBuf, destination: PathBuf) -> Self {
        Self {
            source,
            destination,
            interval: Duration::from_secs(300),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub src_dir: PathBuf,
    pub dst_dir: PathBuf,
    pub inference: InferenceConfig,
    pub retry: RetryConfig,
    /// How many times shards lost to a failed endpoint are handed to the
    /// remaining workers
    pub reassign_rounds: u32,
}

impl DispatchConfig {
    pub fn new(src_dir: PathBuf, dst_dir: PathBuf) -> Self {
        Self {
            src_dir,
            dst_dir,
            inference: InferenceConfig::default(),
            retry: RetryConfig::default(),
            reassign_rounds: 1,
        }
    }
}
