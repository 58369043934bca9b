//! Wires registered workloads to concrete (demo-only) backends.

use std::sync::Arc;

use loadforge_core::{BenchmarkConfig, KvsBackend};
use loadforge_engine::Node;
use loadforge_node::{NodeError, WorkloadFactory};
use loadforge_workloads::random_rw;

/// Runs the `random_rw` workload against a shared in-process KVS.
pub struct RandomRwFactory {
    kvs: Arc<dyn KvsBackend>,
}

impl RandomRwFactory {
    /// Build a factory over `kvs`, shared by every worker this node spawns.
    pub fn new(kvs: Arc<dyn KvsBackend>) -> Self {
        Self { kvs }
    }
}

impl WorkloadFactory for RandomRwFactory {
    fn preload(&self, cfg: &BenchmarkConfig, loader_index: u32, total_loaders: u32) -> Result<(), NodeError> {
        let rw_cfg = random_rw::RandomRwConfig::from_value(&cfg.workload).map_err(|err| NodeError::Preload(err.to_string()))?;
        random_rw::preload(self.kvs.as_ref(), &rw_cfg, loader_index, total_loaders)
            .map_err(|err| NodeError::Preload(err.to_string()))
    }

    fn build_tree(&self, cfg: &BenchmarkConfig) -> Node {
        let rw_cfg = random_rw::RandomRwConfig::from_value(&cfg.workload).expect("validated during preload");
        random_rw::build_tree(self.kvs.clone(), &rw_cfg)
    }
}
