mod cli;
mod demo_backend;
mod factories;
mod shutdown;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::sync::mpsc;

use loadforge_core::{BenchmarkConfig, Endpoint};
use loadforge_coordinator::Coordinator;
use loadforge_node::NodeService;
use loadforge_transport::Transport;

use crate::cli::Cli;
use crate::demo_backend::InMemoryKvs;
use crate::factories::RandomRwFactory;
use crate::shutdown::{spawn_ctrl_c_handler, ShutdownController};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();

    let workload: serde_json::Value =
        serde_json::from_str(&cli.workload_json).context("--workload-json must be a JSON object")?;
    let config = BenchmarkConfig {
        benchmark: cli.benchmark.clone(),
        load_nodes: 1,
        load_processes_per_node: cli.load_processes_per_node,
        processes_per_node: cli.processes_per_node,
        duration_secs: cli.duration_secs,
        log_framerate: cli.log_framerate,
        log_latency_bin_size: cli.log_latency_bin_size,
        log_dead_frames: cli.log_dead_frames,
        workload,
    };

    let transport = Transport::bind(cli.bind).await.context("binding node transport")?;
    let endpoint = Endpoint::new(transport.local_addr().context("reading bound local address")?);

    let kvs = Arc::new(InMemoryKvs::default());
    let mut factories: HashMap<String, Arc<dyn loadforge_node::WorkloadFactory>> = HashMap::new();
    factories.insert("random_rw".to_string(), Arc::new(RandomRwFactory::new(kvs)));

    if !factories.contains_key(&config.benchmark) {
        bail!("no demo factory registered for benchmark '{}'", config.benchmark);
    }

    // Kept alive by the listener closures `NodeService::new` registers on
    // `transport`; this process acts as both coordinator and the single
    // node it coordinates, round-tripping protocol messages over loopback.
    let _node = NodeService::new(transport.clone(), factories);
    let coordinator = Coordinator::new(transport, vec![endpoint], config, None);

    let shutdown = Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();
    spawn_ctrl_c_handler(shutdown.clone(), shutdown_tx);

    tracing::info!(%endpoint, "starting local benchmark run");

    let run = async {
        coordinator.load().await?;
        tracing::info!("preload complete");
        coordinator.run().await?;
        tracing::info!("measured run complete, collecting results");
        let summary = coordinator.collect().await?;
        anyhow::Ok(summary)
    };

    let summary = tokio::select! {
        result = run => result?,
        event = shutdown_rx.recv() => {
            tracing::warn!(?event, "interrupted, shutting down nodes");
            coordinator.shutdown().await;
            bail!("run interrupted by ctrl-c");
        }
    };

    for (path, stat) in &summary {
        println!(
            "{:<32} latency={:.6}s throughput={:.3}/s fail%={:.2}",
            path.join("/"),
            stat.average_latency,
            stat.average_throughput,
            stat.fail_percentage,
        );
    }

    coordinator.shutdown().await;
    Ok(())
}
