//! RandomRW: a key-value read/write mix over a key space of configurable
//! size, weighted by `read`/`write` ratios.

use std::sync::Arc;

use loadforge_core::KvsBackend;
use loadforge_engine::Node;
use rand::Rng;
use serde::Deserialize;

use crate::WorkloadError;

/// The `workload` knobs RandomRW reads out of [`loadforge_core::BenchmarkConfig`].
#[derive(Debug, Clone, Deserialize)]
pub struct RandomRwConfig {
    /// Size of the key space; keys are `0..keys`.
    pub keys: u64,
    /// Relative weight of the `read` tasklet.
    pub read: f64,
    /// Relative weight of the `write` tasklet.
    pub write: f64,
}

impl RandomRwConfig {
    /// Parse from the opaque `workload` field of a `BenchmarkConfig`.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, WorkloadError> {
        serde_json::from_value(value.clone()).map_err(|err| WorkloadError(err.to_string()))
    }
}

fn random_key(rng: &mut impl Rng, keys: u64) -> String {
    rng.gen_range(0..keys).to_string()
}

/// Build the RandomRW task tree against `kvs`.
pub fn build_tree(kvs: Arc<dyn KvsBackend>, cfg: &RandomRwConfig) -> Node {
    let keys = cfg.keys.max(1);

    let read_kvs = kvs.clone();
    let read = Node::leaf(
        "read",
        cfg.read,
        true,
        Arc::new(move |ctx| {
            let mut rng = rand::thread_rng();
            let key = random_key(&mut rng, keys);
            if read_kvs.get(key.as_bytes()).is_err() {
                ctx.fail(0);
            }
        }),
    );

    let write_kvs = kvs.clone();
    let write = Node::leaf(
        "write",
        cfg.write,
        true,
        Arc::new(move |ctx| {
            let mut rng = rand::thread_rng();
            let key = random_key(&mut rng, keys);
            let value = rng.gen_range(0u64..1_000_000).to_string();
            if write_kvs.set(key.as_bytes(), value.as_bytes()).is_err() {
                ctx.fail(0);
            }
        }),
    );

    Node::composite("RandomRW", 1.0, vec![read, write])
}

/// Preload the key space for one loader partition. Partitions `0..keys`
/// into `total_loaders` contiguous ranges, the last absorbing any remainder.
pub fn preload(kvs: &dyn KvsBackend, cfg: &RandomRwConfig, loader_index: u32, total_loaders: u32) -> Result<(), WorkloadError> {
    let keys_per_loader = cfg.keys / total_loaders as u64;
    let start = loader_index as u64 * keys_per_loader;
    let end = if loader_index + 1 == total_loaders {
        cfg.keys
    } else {
        start + keys_per_loader
    };

    let mut rng = rand::thread_rng();
    let mut pairs = (start..end).map(|key| {
        let value: u64 = rng.gen_range(0..1_000_000);
        (key.to_string().into_bytes(), value.to_string().into_bytes())
    });
    kvs.bulk_load(&mut pairs).map_err(|err| WorkloadError(err.to_string()))
}

/// Clear the key space before a run. Mirrors the RandomRW preload hook that
/// runs once locally before per-loader `load` is dispatched.
pub fn clear(kvs: &dyn KvsBackend) -> Result<(), WorkloadError> {
    kvs.delete_all().map_err(|err| WorkloadError(err.to_string()))
}
