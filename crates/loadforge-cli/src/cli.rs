use std::net::SocketAddr;

use clap::Parser;

/// Stands up a single local coordinator + node pair, runs one benchmark to
/// completion, and prints the resulting summary.
///
/// This binary wires the core crates together for a local demo; it does not
/// load or merge YAML configuration, SSH to remote hosts, or render
/// plots/CSVs — a front end that needs those builds them on top of
/// `loadforge-coordinator`/`loadforge-node` directly.
#[derive(Debug, Clone, Parser)]
#[command(name = "loadforge", version, about = "loadforge benchmarking harness")]
pub struct Cli {
    /// Address this process's node listens for coordinator protocol
    /// messages on (it coordinates itself for this single-process demo).
    #[arg(long, env = "LOADFORGE_BIND", default_value = "127.0.0.1:9400")]
    pub bind: SocketAddr,

    /// Registered workload to run.
    #[arg(long, env = "LOADFORGE_BENCHMARK", default_value = "random_rw")]
    pub benchmark: String,

    /// Task-runner processes spawned per node during the measured run.
    #[arg(long, default_value_t = default_parallelism())]
    pub processes_per_node: u32,

    /// Loader processes spawned per node during preload.
    #[arg(long, default_value_t = 1)]
    pub load_processes_per_node: u32,

    /// Duration of the measured run, in seconds.
    #[arg(long, default_value_t = 10)]
    pub duration_secs: u64,

    /// Frame logger cadence, in frames per second.
    #[arg(long, default_value_t = 10.0)]
    pub log_framerate: f64,

    /// Width of each latency histogram bin, in seconds.
    #[arg(long, default_value_t = 0.0005)]
    pub log_latency_bin_size: f64,

    /// Frames trimmed from each end of the logger before alignment.
    #[arg(long, default_value_t = 1)]
    pub log_dead_frames: u32,

    /// Workload-specific configuration, as an inline JSON object (e.g.
    /// `{"keys": 10000, "read": 9.0, "write": 1.0}` for `random_rw`).
    #[arg(long, default_value = "{}")]
    pub workload_json: String,
}

fn default_parallelism() -> u32 {
    std::thread::available_parallelism().map(|n| n.get() as u32).unwrap_or(1)
}
