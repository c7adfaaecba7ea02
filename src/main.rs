use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args as ClapArgs, Parser, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use fleet_infer::config::{
    DispatchConfig, FleetConfig, InferenceConfig, ReadinessConfig, RetryConfig, ServerConfig,
    SyncConfig,
};
use fleet_infer::dispatch::{dispatch, DispatchSummary};
use fleet_infer::error::FleetError;
use fleet_infer::fleet::{
    gate_endpoints, launch_fleet, parse_endpoints, teardown, CommandSpawner, Fleet, FleetManifest,
    ReadinessGate, TeardownConfig,
};
use fleet_infer::server::{InferenceClient, ServerEndpoint};
use fleet_infer::shutdown::{install_shutdown_handler, install_time_budget};
use fleet_infer::sync::{SyncLoop, SyncReport};

/// Every shard completed.
const EXIT_OK: u8 = 0;
/// Some shards failed; re-run with the same directories to resume.
const EXIT_PARTIAL: u8 = 1;
/// No usable endpoint, or bad configuration.
const EXIT_FATAL: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "fleet-infer")]
#[command(version)]
#[command(about = "Launch a fleet of inference servers and run sharded batch inference on it")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Launch servers, write the fleet manifest, and hold them until signalled
    Launch(LaunchArgs),

    /// Run shards against an already running fleet
    Dispatch(DispatchArgs),

    /// Launch, dispatch, sync and tear down in one process
    Run(RunArgs),
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(ClapArgs, Debug)]
struct ServerArgs {
    /// Inference server executable
    #[arg(long, default_value = "llama-server")]
    server_binary: PathBuf,

    /// Model file loaded by every server
    #[arg(long)]
    model_path: PathBuf,

    /// Context size of each server (also bounds prompt length)
    #[arg(long, default_value = "1024")]
    ctx_size: u32,

    /// Layers offloaded to the accelerator
    #[arg(long, default_value = "80")]
    gpu_layers: u32,

    #[arg(long, default_value = "8")]
    threads: u32,

    /// Address servers bind to
    #[arg(long, default_value = "0.0.0.0")]
    bind_host: String,

    /// Extra argument passed to every server (repeatable)
    #[arg(long = "server-arg", allow_hyphen_values = true)]
    server_args: Vec<String>,

    /// Directory for per-server stdout/stderr logs
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Command used to start servers on remote nodes
    #[arg(long, default_value = "ssh")]
    remote_shell: String,

    /// Argument passed to the remote shell before the node name (repeatable)
    #[arg(long = "remote-shell-arg", default_value = "-tt", allow_hyphen_values = true)]
    remote_shell_args: Vec<String>,
}

#[derive(ClapArgs, Debug)]
struct ReadinessArgs {
    /// Seconds a server gets to answer its health endpoint
    #[arg(long, default_value = "300")]
    health_timeout_secs: u64,

    /// Seconds a server gets to finish loading the model
    #[arg(long, default_value = "1800")]
    load_timeout_secs: u64,

    /// Seconds between readiness probes
    #[arg(long, default_value = "10")]
    poll_interval_secs: u64,
}

#[derive(ClapArgs, Debug)]
struct FleetArgs {
    /// Nodes to launch servers on (comma-separated)
    #[arg(long, value_delimiter = ',', required = true)]
    nodes: Vec<String>,

    /// Servers per node; server k binds base_port + k and accelerator k
    #[arg(long, default_value = "1")]
    servers_per_node: usize,

    #[arg(long, env = "LLAMA_SERVER_BASE_PORT", default_value = "18080")]
    base_port: u16,

    #[command(flatten)]
    readiness: ReadinessArgs,

    /// Seconds a server gets to exit after SIGTERM
    #[arg(long, default_value = "30")]
    term_grace_secs: u64,
}

#[derive(ClapArgs, Debug)]
struct JobArgs {
    /// Directory of input shards
    #[arg(long)]
    src: PathBuf,

    /// Directory for output artifacts
    #[arg(long)]
    dst: PathBuf,

    /// Durable directory that `dst` is mirrored into
    #[arg(long)]
    durable_dst: Option<PathBuf>,

    /// Seconds between mirror passes
    #[arg(long, default_value = "300")]
    sync_interval_secs: u64,

    /// Model name sent with each request
    #[arg(long, default_value = "gpt-oss-120b")]
    model: String,

    #[arg(long, env = "LLAMA_SERVER_MAX_TOKENS", default_value = "500")]
    max_tokens: u32,

    /// Per-request timeout in seconds
    #[arg(long, env = "LLAMA_SERVER_TIMEOUT", default_value = "600")]
    request_timeout_secs: u64,

    /// Attempts per record before writing an error placeholder
    #[arg(long, default_value = "3")]
    max_attempts: u32,

    /// Rounds of handing shards from lost endpoints to healthy ones
    #[arg(long, default_value = "1")]
    reassign_rounds: u32,

    /// Stop dispatching after this many seconds; unfinished shards are left for the next run
    #[arg(long)]
    time_budget_secs: Option<u64>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(ClapArgs, Debug)]
struct LaunchArgs {
    #[command(flatten)]
    server: ServerArgs,

    #[command(flatten)]
    fleet: FleetArgs,

    /// Model name sent with readiness probes
    #[arg(long, default_value = "gpt-oss-120b")]
    model: String,

    /// Where to write the fleet manifest
    #[arg(long, default_value = "fleet.json")]
    manifest: PathBuf,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(ClapArgs, Debug)]
struct DispatchArgs {
    #[command(flatten)]
    job: JobArgs,

    /// Context size the servers were started with
    #[arg(long, default_value = "1024")]
    ctx_size: u32,

    /// Fleet manifest written by `launch`
    #[arg(long, conflicts_with = "endpoints", required_unless_present = "endpoints")]
    manifest: Option<PathBuf>,

    /// Explicit endpoints, `host:port[,host:port...]`
    #[arg(long)]
    endpoints: Option<String>,

    #[command(flatten)]
    readiness: ReadinessArgs,
}

#[derive(ClapArgs, Debug)]
struct RunArgs {
    #[command(flatten)]
    server: ServerArgs,

    #[command(flatten)]
    fleet: FleetArgs,

    #[command(flatten)]
    job: JobArgs,

    /// Also write the fleet manifest here
    #[arg(long)]
    manifest: Option<PathBuf>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

impl ServerArgs {
    fn to_config(&self) -> ServerConfig {
        ServerConfig {
            binary: self.server_binary.clone(),
            model_path: self.model_path.clone(),
            ctx_size: self.ctx_size,
            gpu_layers: self.gpu_layers,
            threads: self.threads,
            bind_host: self.bind_host.clone(),
            extra_args: self.server_args.clone(),
            log_dir: self.log_dir.clone(),
            remote_shell: self.remote_shell.clone(),
            remote_shell_args: self.remote_shell_args.clone(),
            ..Default::default()
        }
    }
}

impl ReadinessArgs {
    fn to_config(&self) -> ReadinessConfig {
        ReadinessConfig::default()
            .with_timeouts(
                Duration::from_secs(self.health_timeout_secs),
                Duration::from_secs(self.load_timeout_secs),
            )
            .with_poll_interval(Duration::from_secs(self.poll_interval_secs))
    }
}

impl FleetArgs {
    fn to_config(&self, server: ServerConfig) -> FleetConfig {
        FleetConfig {
            server,
            readiness: self.readiness.to_config(),
            ..FleetConfig::new(self.nodes.clone(), self.servers_per_node, self.base_port)
        }
    }

    fn teardown_config(&self) -> TeardownConfig {
        TeardownConfig {
            grace: Duration::from_secs(self.term_grace_secs),
            ..Default::default()
        }
    }
}

impl JobArgs {
    fn to_config(&self, ctx_size: u32) -> DispatchConfig {
        let mut config = DispatchConfig::new(self.src.clone(), self.dst.clone());
        config.inference = InferenceConfig {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            ctx_size,
        };
        config.retry = RetryConfig {
            max_attempts: self.max_attempts,
            ..Default::default()
        };
        config.reassign_rounds = self.reassign_rounds;
        config
    }

    fn sync_config(&self) -> Option<SyncConfig> {
        self.durable_dst.as_ref().map(|durable| {
            SyncConfig::new(self.dst.clone(), durable.clone())
                .with_interval(Duration::from_secs(self.sync_interval_secs))
        })
    }
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct EndpointOutput {
    endpoint: String,
    addr: String,
    pid: Option<u32>,
    state: String,
    attempts: u32,
    detail: Option<String>,
}

#[derive(Serialize)]
struct FleetOutput {
    total: usize,
    ready: usize,
    failed: usize,
    endpoints: Vec<EndpointOutput>,
}

#[derive(Serialize)]
struct RunOutput<'a> {
    dispatch: &'a DispatchSummary,
    final_sync: Option<&'a SyncReport>,
}

// =============================================================================
// Output
// =============================================================================

fn print_fleet(fleet: &Fleet, format: &OutputFormat) -> Result<(), FleetError> {
    match format {
        OutputFormat::Json => {
            let output = FleetOutput {
                total: fleet.len(),
                ready: fleet.count_ready(),
                failed: fleet.count_failed(),
                endpoints: fleet
                    .members()
                    .iter()
                    .map(|m| EndpointOutput {
                        endpoint: m.endpoint.id().to_string(),
                        addr: m.endpoint.addr(),
                        pid: m.endpoint.pid(),
                        state: m.state().to_string(),
                        attempts: m.report.attempts,
                        detail: m.report.last_observation.clone(),
                    })
                    .collect(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Fleet");
            println!("{}", "=".repeat(40));
            println!(
                "Ready: {} of {} ({} failed)",
                fleet.count_ready(),
                fleet.len(),
                fleet.count_failed()
            );
            println!();
            println!("{:<24} {:<22} {:<10} {:<8} DETAIL", "ENDPOINT", "ADDRESS", "STATE", "PID");
            println!("{}", "-".repeat(90));
            for member in fleet.members() {
                let pid = member
                    .endpoint
                    .pid()
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let status_icon = if member.report.is_ready() { "[+]" } else { "[-]" };
                let detail = member.report.last_observation.as_deref().unwrap_or("");
                let detail = if detail.len() > 40 {
                    format!("{}...", detail.chars().take(37).collect::<String>())
                } else {
                    detail.to_string()
                };
                println!(
                    "{:<24} {:<22} {} {:<6} {:<8} {}",
                    member.endpoint.id().to_string(),
                    member.endpoint.addr(),
                    status_icon,
                    member.state().to_string(),
                    pid,
                    detail
                );
            }
        }
    }
    Ok(())
}

fn print_summary(
    summary: &DispatchSummary,
    final_sync: Option<&SyncReport>,
    format: &OutputFormat,
) -> Result<(), FleetError> {
    match format {
        OutputFormat::Json => {
            let output = RunOutput {
                dispatch: summary,
                final_sync,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Dispatch Summary");
            println!("{}", "=".repeat(40));
            println!("Shards:       {}", summary.shards_total);
            println!("Already done: {}", summary.skipped_done);
            println!("Completed:    {}", summary.completed());
            println!("Failed:       {}", summary.failed());
            println!("Reassigned:   {} round(s)", summary.reassign_rounds);
            println!();

            if !summary.results.is_empty() {
                println!("{:<40} {:<10} {:<8} {:<8} ERROR", "SHARD", "STATUS", "RECORDS", "ERRORS");
                println!("{}", "-".repeat(90));
                for result in &summary.results {
                    println!(
                        "{:<40} {:<10} {:<8} {:<8} {}",
                        result.shard.name,
                        result.status.to_string(),
                        result.records,
                        result.record_errors,
                        result.error.as_deref().unwrap_or("")
                    );
                }
                println!();
            }

            println!("{:<24} {:<22} {:<10} {:<10} FAILED", "ENDPOINT", "ADDRESS", "HEALTH", "COMPLETED");
            println!("{}", "-".repeat(78));
            for ep in &summary.endpoints {
                let health = if ep.healthy { "[+] ok" } else { "[-] lost" };
                println!(
                    "{:<24} {:<22} {:<10} {:<10} {}",
                    ep.endpoint.to_string(),
                    ep.addr,
                    health,
                    ep.completed,
                    ep.failed
                );
            }

            if let Some(sync) = final_sync {
                println!();
                println!(
                    "Final sync: {} copied ({} bytes), {} unchanged, {} failed",
                    sync.copied, sync.bytes_copied, sync.unchanged, sync.failed
                );
            }
        }
    }
    Ok(())
}

fn summary_exit_code(summary: &DispatchSummary) -> u8 {
    if summary.is_success() {
        EXIT_OK
    } else {
        EXIT_PARTIAL
    }
}

// =============================================================================
// Commands
// =============================================================================

async fn run_launch(args: LaunchArgs, shutdown: CancellationToken) -> Result<u8, FleetError> {
    let config = args.fleet.to_config(args.server.to_config());
    let client = InferenceClient::new(config.readiness.request_timeout)?;
    let gate = ReadinessGate::new(client, config.readiness.clone(), args.model.clone());
    let spawner = Arc::new(CommandSpawner::new(config.server.clone()));

    let fleet = launch_fleet(&config, spawner, gate, &shutdown).await?;
    fleet.manifest().save(&args.manifest)?;
    tracing::info!(manifest = %args.manifest.display(), "Fleet manifest written");
    print_fleet(&fleet, &args.output)?;

    let code = if fleet.count_ready() == 0 {
        tracing::error!("No server became ready");
        EXIT_FATAL
    } else {
        tracing::info!("Fleet is up; waiting for SIGTERM or SIGINT");
        shutdown.cancelled().await;
        EXIT_OK
    };

    teardown(fleet, None, &args.fleet.teardown_config()).await;
    Ok(code)
}

async fn run_dispatch(args: DispatchArgs, shutdown: CancellationToken) -> Result<u8, FleetError> {
    let config = args.job.to_config(args.ctx_size);
    let endpoints: Vec<ServerEndpoint> = match (&args.manifest, &args.endpoints) {
        (Some(path), _) => FleetManifest::load(path)?.ready_endpoints(),
        (None, Some(list)) => parse_endpoints(list)?,
        (None, None) => {
            return Err(FleetError::InvalidArgument(
                "one of --manifest or --endpoints is required".to_string(),
            ))
        }
    };

    let readiness = args.readiness.to_config();
    let gate_client = InferenceClient::new(readiness.request_timeout)?;
    let gate = ReadinessGate::new(gate_client, readiness, config.inference.model.clone());
    let gated = gate_endpoints(endpoints, &gate, &shutdown).await?;
    let ready = match gated.require_ready() {
        Ok(ready) => ready,
        Err(e) => {
            tracing::error!(error = %e, "No usable endpoint");
            return Ok(EXIT_FATAL);
        }
    };

    if let Some(budget) = args.job.time_budget_secs {
        install_time_budget(&shutdown, Duration::from_secs(budget));
    }
    let sync = args.job.sync_config().map(SyncLoop::start);

    let client = InferenceClient::new(config.inference.request_timeout)?;
    let result = dispatch(&config, ready, client, &shutdown).await;

    let final_sync = match sync {
        Some(sync) => match sync.stop().await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::error!(error = %e, "Final sync failed");
                None
            }
        },
        None => None,
    };

    let summary = result?;
    print_summary(&summary, final_sync.as_ref(), &args.job.output)?;
    Ok(summary_exit_code(&summary))
}

async fn run_all(args: RunArgs, shutdown: CancellationToken) -> Result<u8, FleetError> {
    let fleet_config = args.fleet.to_config(args.server.to_config());
    let config = args.job.to_config(fleet_config.server.ctx_size);
    let teardown_config = args.fleet.teardown_config();

    let gate_client = InferenceClient::new(fleet_config.readiness.request_timeout)?;
    let gate = ReadinessGate::new(
        gate_client,
        fleet_config.readiness.clone(),
        config.inference.model.clone(),
    );
    let spawner = Arc::new(CommandSpawner::new(fleet_config.server.clone()));
    let fleet = launch_fleet(&fleet_config, spawner, gate, &shutdown).await?;
    if let Some(path) = &args.manifest {
        fleet.manifest().save(path)?;
    }

    let ready = match fleet.require_ready() {
        Ok(ready) => ready,
        Err(e) => {
            tracing::error!(error = %e, "Aborting before dispatch");
            print_fleet(&fleet, &args.job.output)?;
            teardown(fleet, None, &teardown_config).await;
            return Ok(EXIT_FATAL);
        }
    };

    if let Some(budget) = args.job.time_budget_secs {
        install_time_budget(&shutdown, Duration::from_secs(budget));
    }
    let sync = args.job.sync_config().map(SyncLoop::start);

    let client = InferenceClient::new(config.inference.request_timeout)?;
    let result = dispatch(&config, ready, client, &shutdown).await;

    let report = teardown(fleet, sync, &teardown_config).await;
    let summary = result?;
    print_summary(&summary, report.final_sync.as_ref(), &args.job.output)?;
    Ok(summary_exit_code(&summary))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let shutdown = match install_shutdown_handler() {
        Ok(token) => token,
        Err(e) => {
            eprintln!("Error: failed to install signal handlers: {}", e);
            return ExitCode::from(EXIT_FATAL);
        }
    };

    let result = match args.command {
        Commands::Launch(launch_args) => run_launch(launch_args, shutdown).await,
        Commands::Dispatch(dispatch_args) => run_dispatch(dispatch_args, shutdown).await,
        Commands::Run(run_args) => run_all(run_args, shutdown).await,
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}
