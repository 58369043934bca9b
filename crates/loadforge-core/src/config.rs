//! The typed configuration surface the core accepts.
//!
//! Loading this struct from YAML and merging CLI overrides is a front-end
//! concern the core does not implement; it only defines the shape a front
//! end must produce.

use serde::{Deserialize, Serialize};

/// Configuration for one benchmark run, handed to the coordinator's
/// `load`/`run` calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    /// Identifier of the registered workload to run (e.g. `"random_rw"`).
    pub benchmark: String,
    /// Number of nodes that participate in preloading.
    pub load_nodes: u32,
    /// Loader processes spawned per node during preload.
    pub load_processes_per_node: u32,
    /// Task-runner processes spawned per node during the measured run.
    pub processes_per_node: u32,
    /// Duration of the measured run.
    pub duration_secs: u64,
    /// Frame logger cadence, in frames per second.
    pub log_framerate: f64,
    /// Width of each latency histogram bin, in seconds.
    pub log_latency_bin_size: f64,
    /// Frames trimmed from each end of every logger before alignment.
    pub log_dead_frames: u32,
    /// Workload-specific knobs, opaque to the core.
    #[serde(default)]
    pub workload: serde_json::Value,
}

impl BenchmarkConfig {
    /// The logger frame period implied by `log_framerate`.
    pub fn frame_period(&self) -> f64 {
        1.0 / self.log_framerate
    }
}
