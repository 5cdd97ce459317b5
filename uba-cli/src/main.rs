//! Scheduler CLI / YAML process-graph loader, built on `clap`'s derive
//! idiom since the library this crate grew from has no CLI surface of
//! its own.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use serde::Deserialize;
use tracing::{error, info};

use uba_core::cache::{LocalCacheClient, PathHashRegistry};
use uba_core::config::{ConfigBuilder, UbaConfig};
use uba_core::scheduler::{EnqueueProcessInfo, ProcessRunner, Scheduler};
use uba_core::session::{ProcessInfo, ProcessRegistry};

/// Exit codes this CLI assigns meaning to.
const EXIT_SUCCESS: u8 = 0;
const EXIT_FORCED_KILL_REPEAT: u8 = 13;
const EXIT_USAGE_ERROR: u8 = 255; // process exit codes are u8; -1 truncates to 255

#[derive(Parser, Debug)]
#[command(name = "uba-cli", version, about = "UBA scheduler CLI / YAML process-graph loader")]
struct Cli {
    /// Run as host (coordinator + CAS server) rather than a local-only run.
    #[arg(long = "host")]
    host: bool,

    /// Address:port to listen on when acting as host or a network-facing helper.
    #[arg(long = "listen")]
    listen: Option<String>,

    /// Working/storage directory (CAS root, session scratch space).
    #[arg(long = "dir")]
    dir: Option<PathBuf>,

    /// Maximum local processor slots the scheduler may occupy.
    #[arg(long = "maxcpu")]
    maxcpu: Option<u32>,

    /// Desired connection count per network client.
    #[arg(long = "maxcon")]
    maxcon: Option<u32>,

    /// CAS capacity in bytes.
    #[arg(long = "capacity")]
    capacity: Option<u64>,

    /// Enable AES-128-CTR body encryption; takes the hex-encoded key.
    #[arg(long = "crypto")]
    crypto: Option<String>,

    /// Availability zone override, bypassing cloud metadata discovery.
    #[arg(long = "zone")]
    zone: Option<String>,

    /// Prefer the QUIC transport backend where available.
    #[arg(long = "quic")]
    quic: bool,

    /// Disable the custom allocator hook (no-op in this port; recorded
    /// for CLI-surface parity with the original).
    #[arg(long = "nocustomalloc")]
    nocustomalloc: bool,

    /// Send CAS bodies uncompressed.
    #[arg(long = "sendraw")]
    sendraw: bool,

    /// Store CAS bodies uncompressed on disk.
    #[arg(long = "storeraw")]
    storeraw: bool,

    /// Pre-populate the CAS store from an existing directory tree.
    #[arg(long = "populate-cas", value_name = "DIR")]
    populate_cas: Option<PathBuf>,

    /// Config file path (default: `UbaHost.toml` next to the binary).
    #[arg(long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Delete and recreate the CAS store before starting.
    #[arg(long = "resetstore")]
    resetstore: bool,

    /// YAML process graph to run instead of acting as a host/helper.
    #[arg(long = "graph", value_name = "FILE")]
    graph: Option<PathBuf>,
}

/// One node in the YAML process graph: a process plus the
/// ids of the processes it depends on.
#[derive(Debug, Deserialize)]
struct GraphProcess {
    id: u64,
    argv: Vec<String>,
    #[serde(default)]
    working_dir: String,
    #[serde(default)]
    dependencies: Vec<u64>,
    #[serde(default = "default_weight")]
    weight: f32,
    #[serde(default)]
    cache_bucket_id: Option<u32>,
    #[serde(default)]
    can_detour: bool,
    #[serde(default)]
    can_execute_remotely: bool,
    #[serde(default)]
    force_remote: bool,
    #[serde(default)]
    write_to_cache: bool,
}

fn default_weight() -> f32 {
    1.0
}

#[derive(Debug, Deserialize)]
struct ProcessGraph {
    processes: Vec<GraphProcess>,
}

/// Runs a process graph entirely locally by shelling out to the real
/// argv. Local capacity follows the scheduler's `max_local_processors`
/// (set from `--maxcpu`) rather than the raw core count, so the flag
/// actually bounds concurrency.
struct LocalShellRunner {
    max_local_processors: u32,
}

#[async_trait::async_trait]
impl ProcessRunner for LocalShellRunner {
    async fn run_local(&self, process: &ProcessInfo) -> uba_core::error::UbaResult<i32> {
        if process.argv.is_empty() {
            return Ok(0);
        }
        let status = tokio::process::Command::new(&process.argv[0])
            .args(&process.argv[1..])
            .current_dir(&process.working_dir)
            .status()
            .await
            .map_err(uba_core::error::CasError::Io)?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn run_remote(&self, _process: &ProcessInfo) -> uba_core::error::UbaResult<i32> {
        Err(uba_core::error::ProcessError::Crashed {
            process_id: 0,
            reason: "this CLI build has no remote helpers configured".to_string(),
        }
        .into())
    }

    fn free_local_weight(&self) -> f32 {
        self.max_local_processors as f32
    }

    fn remote_available(&self) -> bool {
        false
    }
}

async fn run_graph(path: &PathBuf, config: &UbaConfig) -> anyhow::Result<u8> {
    let text = std::fs::read_to_string(path)?;
    let graph: ProcessGraph = serde_yaml::from_str(&text)?;

    let registry = ProcessRegistry::new();
    let path_hashes = Arc::new(PathHashRegistry::new());
    let cache = LocalCacheClient::new(path_hashes, 4, true);
    let runner = Arc::new(LocalShellRunner {
        max_local_processors: config.scheduler.max_local_processors,
    });
    let scheduler = Scheduler::new(registry, Some(cache), runner, config.scheduler.clone());

    for p in &graph.processes {
        scheduler.enqueue(EnqueueProcessInfo {
            process: ProcessInfo {
                id: p.id,
                argv: p.argv.clone(),
                working_dir: p.working_dir.clone(),
                roots: None,
                weight: p.weight,
                dependencies: p.dependencies.clone(),
                cache_bucket_id: p.cache_bucket_id,
                exit_code: None,
                log_lines: Vec::new(),
            },
            can_detour: p.can_detour,
            can_execute_remotely: p.can_execute_remotely,
            force_remote: p.force_remote,
            write_to_cache: p.write_to_cache,
        });
    }

    let failed = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let failed_in_callback = Arc::clone(&failed);
    scheduler.set_process_finished_callback(move |id, state| {
        if let uba_core::session::ProcessState::Finished(kind) = state {
            match kind {
                uba_core::session::FinishedKind::Success => {}
                other => {
                    error!(id, ?other, "process did not finish successfully");
                    failed_in_callback.store(true, std::sync::atomic::Ordering::Relaxed);
                }
            }
        }
    });

    scheduler.run_until_drained().await;
    let counters = scheduler.counters();
    info!(
        finished = counters.finished.load(std::sync::atomic::Ordering::Relaxed),
        "graph run complete"
    );

    // a non-zero exit anywhere in the graph is surfaced as a non-zero
    // process exit.
    if failed.load(std::sync::atomic::Ordering::Relaxed) {
        Ok(EXIT_FORCED_KILL_REPEAT)
    } else {
        Ok(EXIT_SUCCESS)
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<UbaConfig> {
    let mut network = uba_core::config::NetworkConfig::default();
    let mut storage = uba_core::config::StorageConfig::default();
    let mut scheduler = uba_core::config::SchedulerConfig::default();
    let mut crypto = uba_core::config::CryptoConfig::default();
    let mut coordinator = uba_core::config::CoordinatorConfig::default();

    if let Some(path) = &cli.config {
        let table = uba_core::config::ConfigTable::load_from_file(path)?;
        if let Some(v) = table.get_u32("Network.listen_port") {
            network.listen_port = v as u16;
        }
        if let Some(v) = table.get_u64("Storage.capacity_bytes") {
            storage.capacity_bytes = v;
        }
        if let Some(v) = table.get_string("Coordinator.zone") {
            coordinator.zone = Some(v);
        }
    }

    if let Some(dir) = &cli.dir {
        storage.cas_directory = dir.to_string_lossy().to_string();
    }
    if let Some(capacity) = cli.capacity {
        storage.capacity_bytes = capacity;
    }
    if let Some(maxcpu) = cli.maxcpu {
        scheduler.max_local_processors = maxcpu;
    }
    if let Some(maxcon) = cli.maxcon {
        network.desired_connection_count = maxcon;
    }
    if let Some(listen) = &cli.listen {
        if let Some((host, port)) = listen.rsplit_once(':') {
            network.bind_address = host.to_string();
            if let Ok(port) = port.parse() {
                network.listen_port = port;
            }
        }
    }
    if let Some(key_hex) = &cli.crypto {
        crypto.enabled = true;
        crypto.key_hex = Some(key_hex.clone());
    }
    if let Some(zone) = &cli.zone {
        coordinator.zone = Some(zone.clone());
    }
    storage.compress = !cli.storeraw;

    ConfigBuilder::new()
        .network(network)
        .storage(storage)
        .scheduler(scheduler)
        .crypto(crypto)
        .coordinator(coordinator)
        .build()
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "bad config or flags");
            return ExitCode::from(EXIT_USAGE_ERROR);
        }
    };

    if cli.resetstore {
        let _ = std::fs::remove_dir_all(&config.storage.cas_directory);
    }

    let code = if let Some(graph) = &cli.graph {
        match run_graph(graph, &config).await {
            Ok(code) => code,
            Err(e) => {
                error!(error = %e, "process graph run failed");
                EXIT_USAGE_ERROR
            }
        }
    } else if cli.host {
        info!(listen = ?config.network.bind_address, port = config.network.listen_port, "host mode is not wired up by this CLI build; pass -graph=FILE to run a process graph");
        EXIT_SUCCESS
    } else {
        info!("nothing to do: pass -graph=FILE to run a process graph, or -host to act as a host");
        EXIT_SUCCESS
    };

    ExitCode::from(code)
}
