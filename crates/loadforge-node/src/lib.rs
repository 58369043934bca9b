#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Worker process pool (C3) and benchmark manager (C4): the node side of
//! the coordinator protocol. A [`NodeService`] registers transport
//! listeners for `Load`/`Start`/`Stop`/`Shutdown` and drives one
//! [`pool::WorkerPool`] plus [`manager`] per run.

mod manager;
mod pool;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use loadforge_core::{BenchmarkConfig, Endpoint, MessageKind, WireMessage};
use loadforge_engine::Node;
use loadforge_transport::{SendCallback, SendOptions, Transport};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

pub use manager::run as run_manager;
pub use pool::WorkerPool;

/// Errors a node can encounter running the coordinator protocol.
#[derive(Debug, Error)]
pub enum NodeError {
    /// No workload factory is registered for the requested benchmark name.
    #[error("unknown benchmark '{0}'")]
    UnknownBenchmark(String),
    /// The workload's preload step failed.
    #[error("preload failed: {0}")]
    Preload(String),
    /// A wire payload could not be decoded.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Builds a workload's task tree and runs its preload step. One
/// implementation per benchmark name, registered with [`NodeService::new`].
///
/// Implementations own the concrete backend client construction (a fresh
/// connection per worker, per the no-sharing invariant); this crate never
/// constructs a backend itself.
pub trait WorkloadFactory: Send + Sync {
    /// Partition and load this node's share of the dataset.
    fn preload(&self, cfg: &BenchmarkConfig, loader_index: u32, total_loaders: u32) -> Result<(), NodeError>;

    /// Build one worker's task tree. Called once per worker process; must
    /// not share backend client state across calls.
    fn build_tree(&self, cfg: &BenchmarkConfig) -> Node;
}

enum RunState {
    Idle,
    Loaded(BenchmarkConfig),
    Running {
        pool: WorkerPool,
        manager: JoinHandle<(loadforge_engine::Logger, Option<String>)>,
    },
}

/// The node-side runtime for one benchmark worker process group.
pub struct NodeService {
    transport: Transport,
    factories: HashMap<String, Arc<dyn WorkloadFactory>>,
    state: Mutex<RunState>,
    soft_stop_timeout: Duration,
    send_timeout: Duration,
    max_sequential_failures: u32,
    /// Signaled when a `Shutdown` message is received.
    pub shutdown: Arc<Notify>,
}

impl NodeService {
    /// Build a node service bound to `transport`, dispatching by benchmark
    /// name to `factories`.
    pub fn new(transport: Transport, factories: HashMap<String, Arc<dyn WorkloadFactory>>) -> Arc<Self> {
        let service = Arc::new(Self {
            transport,
            factories,
            state: Mutex::new(RunState::Idle),
            soft_stop_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_millis(500),
            max_sequential_failures: 5,
            shutdown: Arc::new(Notify::new()),
        });
        service.clone().register_listeners();
        service
    }

    fn register_listeners(self: Arc<Self>) {
        let load_self = self.clone();
        self.transport.register_listener(
            MessageKind::Load,
            Arc::new(move |msg, from| {
                let service = load_self.clone();
                tokio::spawn(async move {
                    service.handle_load(msg, from).await;
                });
            }),
        );

        let start_self = self.clone();
        self.transport.register_listener(
            MessageKind::Start,
            Arc::new(move |msg, from| {
                let service = start_self.clone();
                tokio::spawn(async move {
                    service.handle_start(msg, from).await;
                });
            }),
        );

        let stop_self = self.clone();
        self.transport.register_listener(
            MessageKind::Stop,
            Arc::new(move |_msg, from| {
                let service = stop_self.clone();
                tokio::spawn(async move {
                    service.handle_stop(from).await;
                });
            }),
        );

        let shutdown_self = self.clone();
        self.transport.register_listener(
            MessageKind::Shutdown,
            Arc::new(move |_msg, _from| {
                shutdown_self.shutdown.notify_one();
            }),
        );
    }

    async fn handle_load(&self, msg: WireMessage, from: Endpoint) {
        let (cfg, loader_index): (BenchmarkConfig, u32) = match msg.decode() {
            Ok(pair) => pair,
            Err(err) => {
                tracing::error!(%err, "failed to decode load payload");
                return;
            }
        };

        let result = self.factories.get(&cfg.benchmark).ok_or_else(|| {
            NodeError::UnknownBenchmark(cfg.benchmark.clone())
        }).and_then(|factory| {
            factory
                .preload(&cfg, loader_index, cfg.load_nodes)
                .map_err(|err| NodeError::Preload(err.to_string()))
        });

        match result {
            Ok(()) => {
                *self.state.lock().await = RunState::Loaded(cfg);
                self.transport.send(
                    WireMessage::empty(MessageKind::FinishedLoading),
                    from,
                    SendOptions::at_least_once(self.send_timeout, self.max_sequential_failures),
                    self.noop_callback(),
                );
            }
            Err(err) => {
                tracing::error!(%err, "load failed");
                self.transport.send(
                    WireMessage::encode(MessageKind::Err, &err.to_string()).expect("string always encodes"),
                    from,
                    SendOptions::fire_and_forget(),
                    self.noop_callback(),
                );
            }
        }
    }

    async fn handle_start(self: &Arc<Self>, msg: WireMessage, from: Endpoint) {
        let cfg: BenchmarkConfig = match msg.decode() {
            Ok(cfg) => cfg,
            Err(err) => {
                tracing::error!(%err, "failed to decode start payload");
                return;
            }
        };

        let factory = match self.factories.get(&cfg.benchmark) {
            Some(factory) => factory.clone(),
            None => {
                tracing::error!(benchmark = %cfg.benchmark, "unknown benchmark on start");
                return;
            }
        };

        let (report_tx, report_rx) = mpsc::channel(4096);
        let workers = cfg.processes_per_node;
        let factory_for_pool = factory.clone();
        let cfg_for_pool = cfg.clone();
        let pool = WorkerPool::spawn(workers, report_tx, move || factory_for_pool.build_tree(&cfg_for_pool));

        let logger = loadforge_engine::Logger::new(cfg.frame_period(), cfg.log_latency_bin_size, 0.0);
        let epoch = Instant::now();
        let rate_limit = Duration::from_millis(20);
        let (error_tx, mut error_rx) = mpsc::unbounded_channel();
        let manager = tokio::spawn(run_manager(logger, report_rx, rate_limit, epoch, error_tx));

        *self.state.lock().await = RunState::Running { pool, manager };

        // A workload exception ends the run before the coordinator's next
        // `stop`; report it as soon as the manager observes it rather than
        // waiting for that round trip.
        let service = self.clone();
        tokio::spawn(async move {
            if let Some(reason) = error_rx.recv().await {
                service.report_workload_error(from, reason).await;
            }
        });
    }

    async fn report_workload_error(&self, from: Endpoint, reason: String) {
        tracing::error!(%reason, "workload exception reported by worker pool");
        self.transport.send(
            WireMessage::encode(MessageKind::Err, &reason).expect("string always encodes"),
            from,
            SendOptions::fire_and_forget(),
            self.noop_callback(),
        );
    }

    async fn handle_stop(&self, from: Endpoint) {
        let previous = {
            let mut state = self.state.lock().await;
            std::mem::replace(&mut *state, RunState::Idle)
        };

        let RunState::Running { pool, manager } = previous else {
            tracing::warn!("received stop while not running");
            return;
        };

        pool.soft_stop(self.soft_stop_timeout).await;
        let (logger, failure) = match manager.await {
            Ok(pair) => pair,
            Err(err) => {
                tracing::error!(%err, "benchmark manager task panicked");
                return;
            }
        };

        if let Some(reason) = failure {
            // Already reported to the coordinator as soon as the manager
            // observed it; nothing useful to send as results.
            tracing::warn!(%reason, "run ended with a workload exception, not sending results");
            return;
        }

        match bincode::serialize(&logger) {
            Ok(payload) => {
                self.transport.send(
                    WireMessage { kind: MessageKind::Results, payload },
                    from,
                    SendOptions::at_least_once(self.send_timeout, self.max_sequential_failures),
                    self.noop_callback(),
                );
            }
            Err(err) => {
                tracing::error!(%err, "failed to encode results logger");
            }
        }
    }

    fn noop_callback(&self) -> SendCallback {
        Arc::new(|endpoint, ok| {
            if !ok {
                tracing::warn!(?endpoint, "send did not reach ack within retry budget");
            }
        })
    }
}
