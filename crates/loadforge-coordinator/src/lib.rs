#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! The coordinator (C6): drives the `init → loading → loaded → running →
//! stopping → collecting → done` state machine across a fixed set of node
//! endpoints, then runs the log alignment/averaging pipeline (C7/C8) over
//! the collected per-worker logs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use loadforge_core::{BenchmarkConfig, Endpoint, MessageKind, WireMessage};
use loadforge_engine::{align, AlignError, EventPath, Logger, Summary};
use loadforge_transport::{SendOptions, Transport};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

/// A callback invoked once a run's summary is ready, given the chance to
/// persist it (e.g. to the historian's Postgres tables). Boxed rather than
/// a concrete trait object so this crate does not depend on any particular
/// storage backend.
pub type HistorianRecorder =
    Arc<dyn Fn(BenchmarkConfig, BTreeMap<EventPath, Summary>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Errors that can terminate a coordinator run.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// A `load` delivery failed against at least one endpoint; the run is
    /// closed and the caller should exit non-zero.
    #[error("load phase failed: {0}")]
    LoadFailed(String),
    /// A `start` delivery failed against at least one endpoint; the run is
    /// closed.
    #[error("run phase failed: {0}")]
    StartFailed(String),
    /// A node reported a workload exception mid-run (an `err` message); the
    /// run is closed.
    #[error("node {endpoint} reported a workload exception: {reason}")]
    WorkloadFailed {
        /// The node endpoint that reported the exception.
        endpoint: Endpoint,
        /// The failure reason the node sent.
        reason: String,
    },
    /// The collected logs could not be aligned (e.g. disjoint runtimes).
    #[error("log alignment failed: {0}")]
    Align(#[from] AlignError),
    /// A wire payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// The coordinator's current phase. `Failed` is reachable from any other
/// state.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorState {
    /// No protocol messages sent yet.
    Init,
    /// `load` sent, awaiting `finished_loading` from every loader endpoint.
    Loading,
    /// Every loader endpoint has finished loading.
    Loaded,
    /// `start` sent to every endpoint; the measured run is in progress.
    Running,
    /// `stop` sent to every endpoint.
    Stopping,
    /// Awaiting `results` from every endpoint.
    Collecting,
    /// The run completed and was summarized.
    Done,
    /// The run was aborted; the field is a human-readable reason.
    Failed(String),
}

/// Telemetry emitted over [`Coordinator::subscribe`], event-sourced the way
/// the teacher's engine streams progress to its UI over a broadcast
/// channel, rather than only being observable by polling [`Coordinator::state`].
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    /// The coordinator transitioned to a new phase.
    StateChanged(CoordinatorState),
}

/// Drives one benchmark run across a fixed set of node endpoints.
pub struct Coordinator {
    transport: Transport,
    endpoints: Vec<Endpoint>,
    config: BenchmarkConfig,
    historian: Option<HistorianRecorder>,
    send_timeout: Duration,
    max_sequential_failures: u32,
    poll_interval: Duration,

    state: Mutex<CoordinatorState>,
    loaded: Mutex<HashSet<Endpoint>>,
    unreachable_on_stop: Mutex<HashSet<Endpoint>>,
    results: Mutex<HashMap<Endpoint, Logger>>,
    events: broadcast::Sender<CoordinatorEvent>,
}

impl Coordinator {
    /// Build a coordinator for `endpoints`, configured by `config`, and
    /// register its `finished_loading`/`results`/`err` transport listeners.
    /// `historian` is invoked once after a successful `collect()`, if set.
    pub fn new(
        transport: Transport,
        endpoints: Vec<Endpoint>,
        config: BenchmarkConfig,
        historian: Option<HistorianRecorder>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let coordinator = Arc::new(Self {
            transport,
            endpoints,
            config,
            historian,
            send_timeout: Duration::from_millis(500),
            max_sequential_failures: 5,
            poll_interval: Duration::from_millis(50),
            state: Mutex::new(CoordinatorState::Init),
            loaded: Mutex::new(HashSet::new()),
            unreachable_on_stop: Mutex::new(HashSet::new()),
            results: Mutex::new(HashMap::new()),
            events,
        });
        coordinator.clone().register_listeners();
        coordinator
    }

    /// Register the transport listeners that feed [`Coordinator::note_finished_loading`]
    /// and [`Coordinator::note_results`], mirroring `loadforge-node`'s own
    /// `register_listeners` on the other side of the protocol.
    fn register_listeners(self: Arc<Self>) {
        let loading_self = self.clone();
        self.transport.register_listener(
            MessageKind::FinishedLoading,
            Arc::new(move |_msg, from| {
                let coordinator = loading_self.clone();
                tokio::spawn(async move {
                    coordinator.note_finished_loading(from).await;
                });
            }),
        );

        let results_self = self.clone();
        self.transport.register_listener(
            MessageKind::Results,
            Arc::new(move |msg, from| {
                let coordinator = results_self.clone();
                tokio::spawn(async move {
                    match msg.decode::<Logger>() {
                        Ok(logger) => coordinator.note_results(from, logger).await,
                        Err(err) => tracing::error!(%err, %from, "failed to decode results payload"),
                    }
                });
            }),
        );

        let err_self = self.clone();
        self.transport.register_listener(
            MessageKind::Err,
            Arc::new(move |msg, from| {
                let coordinator = err_self.clone();
                let reason = msg.decode::<String>().unwrap_or_else(|_| "<undecodable>".to_string());
                tracing::error!(%from, %reason, "node reported an error");
                tokio::spawn(async move {
                    coordinator.fail_closed(CoordinatorError::WorkloadFailed { endpoint: from, reason }).await;
                });
            }),
        );
    }

    /// The coordinator's current phase.
    pub async fn state(&self) -> CoordinatorState {
        self.state.lock().await.clone()
    }

    /// Subscribe to state-transition telemetry. Tests can assert against
    /// this directly; `loadforge-cli` logs it via `tracing` instead.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    async fn set_state(&self, state: CoordinatorState) {
        *self.state.lock().await = state.clone();
        let _ = self.events.send(CoordinatorEvent::StateChanged(state));
    }

    /// Register this endpoint's `finished_loading` acknowledgement. Invoked
    /// by the [`MessageKind::FinishedLoading`] listener registered in [`Coordinator::new`];
    /// exposed so tests can drive the state machine without a real transport.
    pub async fn note_finished_loading(&self, endpoint: Endpoint) {
        self.loaded.lock().await.insert(endpoint);
    }

    /// Record a node's `results` payload. Only the first `results` message
    /// from a given endpoint counts; later deliveries of the same
    /// at-least-once send are ignored.
    pub async fn note_results(&self, endpoint: Endpoint, logger: Logger) {
        self.results.lock().await.entry(endpoint).or_insert(logger);
    }

    /// Send `load(config, i)` to the first `load_nodes` endpoints, with
    /// retry, and block until every one of them has acknowledged
    /// `finished_loading`.
    pub async fn load(self: &Arc<Self>) -> Result<(), CoordinatorError> {
        self.set_state(CoordinatorState::Loading).await;

        let load_node_count = (self.config.load_nodes as usize).min(self.endpoints.len());
        let targets: Vec<Endpoint> = self.endpoints[..load_node_count].to_vec();

        for (i, endpoint) in targets.iter().enumerate() {
            let payload = (self.config.clone(), i as u32);
            let msg = WireMessage::encode(MessageKind::Load, &payload)?;
            self.dispatch(msg, *endpoint, |this, endpoint, reason| {
                Box::pin(async move {
                    this.fail_closed(CoordinatorError::LoadFailed(format!("{endpoint}: {reason}"))).await;
                })
            });
        }

        loop {
            if let CoordinatorState::Failed(reason) = &*self.state.lock().await {
                return Err(CoordinatorError::LoadFailed(reason.clone()));
            }
            if self.loaded.lock().await.len() >= targets.len() {
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        self.set_state(CoordinatorState::Loaded).await;
        Ok(())
    }

    /// Send `start(config)` to every endpoint, sleep for the configured
    /// run duration, then send `stop` to every endpoint. A `stop` delivery
    /// failure marks that endpoint unreachable rather than aborting the run
    /// (`collect()` proceeds without it).
    pub async fn run(self: &Arc<Self>) -> Result<(), CoordinatorError> {
        self.set_state(CoordinatorState::Running).await;

        let start_msg = WireMessage::encode(MessageKind::Start, &self.config)?;
        for endpoint in self.endpoints.clone() {
            self.dispatch(start_msg.clone(), endpoint, |this, endpoint, reason| {
                Box::pin(async move {
                    this.fail_closed(CoordinatorError::StartFailed(format!("{endpoint}: {reason}"))).await;
                })
            });
        }

        if let CoordinatorState::Failed(reason) = &*self.state.lock().await {
            return Err(CoordinatorError::StartFailed(reason.clone()));
        }

        tokio::time::sleep(Duration::from_secs(self.config.duration_secs)).await;

        if let CoordinatorState::Failed(reason) = &*self.state.lock().await {
            return Err(CoordinatorError::StartFailed(reason.clone()));
        }

        self.set_state(CoordinatorState::Stopping).await;

        let stop_msg = WireMessage::empty(MessageKind::Stop);
        for endpoint in self.endpoints.clone() {
            self.dispatch(stop_msg.clone(), endpoint, |this, endpoint, reason| {
                Box::pin(async move {
                    tracing::warn!(%endpoint, %reason, "stop delivery failed, excluding endpoint from collection");
                    this.unreachable_on_stop.lock().await.insert(endpoint);
                })
            });
        }

        self.set_state(CoordinatorState::Collecting).await;
        Ok(())
    }

    /// Block until every reachable endpoint has reported `results` (or has
    /// been marked unreachable by a `stop` failure), then run the alignment
    /// pipeline and invoke the historian recorder if one was configured.
    pub async fn collect(self: &Arc<Self>) -> Result<BTreeMap<EventPath, Summary>, CoordinatorError> {
        loop {
            let expected = self.endpoints.len();
            let have = self.results.lock().await.len() + self.unreachable_on_stop.lock().await.len();
            if have >= expected {
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        let loggers: Vec<Logger> = self.results.lock().await.values().cloned().collect();
        let summary = align(&loggers, self.config.log_dead_frames)?;

        if let Some(historian) = &self.historian {
            historian(self.config.clone(), summary.clone()).await;
        }

        self.set_state(CoordinatorState::Done).await;
        Ok(summary)
    }

    /// Send `shutdown` to every endpoint. Delivery failures are logged and
    /// otherwise ignored, per the protocol's failure-routing rules.
    pub async fn shutdown(self: &Arc<Self>) {
        let msg = WireMessage::empty(MessageKind::Shutdown);
        for endpoint in self.endpoints.clone() {
            self.dispatch(msg.clone(), endpoint, |_this, endpoint, reason| {
                Box::pin(async move {
                    tracing::warn!(%endpoint, %reason, "shutdown delivery failed, logging only");
                })
            });
        }
    }

    fn dispatch(
        self: &Arc<Self>,
        msg: WireMessage,
        endpoint: Endpoint,
        on_failure: fn(Arc<Self>, Endpoint, String) -> Pin<Box<dyn Future<Output = ()> + Send>>,
    ) {
        let this = self.clone();
        self.transport.send(
            msg,
            endpoint,
            SendOptions::at_least_once(self.send_timeout, self.max_sequential_failures),
            Arc::new(move |endpoint, ok| {
                if ok {
                    return;
                }
                let this = this.clone();
                tokio::spawn(async move {
                    on_failure(this, endpoint, "exceeded retry budget".to_string()).await;
                });
            }),
        );
    }

    async fn fail_closed(self: &Arc<Self>, err: CoordinatorError) {
        tracing::error!(%err, "closing coordinator run");
        self.set_state(CoordinatorState::Failed(err.to_string())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config(benchmark: &str) -> BenchmarkConfig {
        BenchmarkConfig {
            benchmark: benchmark.to_string(),
            load_nodes: 1,
            load_processes_per_node: 1,
            processes_per_node: 1,
            duration_secs: 0,
            log_framerate: 10.0,
            log_latency_bin_size: 0.0005,
            log_dead_frames: 0,
            workload: serde_json::Value::Null,
        }
    }

    async fn bind_local() -> Transport {
        Transport::bind("127.0.0.1:0".parse().unwrap()).await.expect("bind")
    }

    #[tokio::test]
    async fn note_finished_loading_is_idempotent_per_endpoint() {
        let transport = bind_local().await;
        let endpoints = vec![Endpoint::new(transport.local_addr().unwrap())];
        let coordinator = Coordinator::new(transport, endpoints.clone(), sample_config("random_rw"), None);

        coordinator.note_finished_loading(endpoints[0]).await;
        coordinator.note_finished_loading(endpoints[0]).await;

        assert_eq!(coordinator.loaded.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn note_results_keeps_first_delivery_per_endpoint() {
        let transport = bind_local().await;
        let endpoints = vec![Endpoint::new(transport.local_addr().unwrap())];
        let coordinator = Coordinator::new(transport, endpoints.clone(), sample_config("random_rw"), None);

        let first = Logger::new(0.1, 0.0005, 0.0);
        // A logger built with a different bin size serializes differently,
        // so we can tell which of the two "won" the dedup.
        let second = Logger::new(0.1, 0.0009, 0.0);

        coordinator.note_results(endpoints[0], first.clone()).await;
        coordinator.note_results(endpoints[0], second).await;

        let results = coordinator.results.lock().await;
        assert_eq!(results.len(), 1);
        assert_eq!(
            bincode::serialize(&results[&endpoints[0]]).unwrap(),
            bincode::serialize(&first).unwrap(),
            "second delivery of the same at-least-once send must not overwrite the first"
        );
    }

    #[tokio::test]
    async fn full_protocol_round_trip_reaches_done_and_broadcasts_state_changes() {
        let node_transport = bind_local().await;
        let coordinator_transport = bind_local().await;
        let node_endpoint = Endpoint::new(node_transport.local_addr().unwrap());
        let coordinator_endpoint = Endpoint::new(coordinator_transport.local_addr().unwrap());

        // A minimal stand-in node: ack `load`/`start` implicitly (the
        // transport layer acks every received message), then reply
        // `finished_loading` to `load` and `results` to `stop`.
        let reply_transport = node_transport.clone();
        node_transport.register_listener(
            MessageKind::Load,
            Arc::new(move |_msg, _from| {
                let transport = reply_transport.clone();
                tokio::spawn(async move {
                    transport.send(
                        WireMessage::empty(MessageKind::FinishedLoading),
                        coordinator_endpoint,
                        SendOptions::at_least_once(Duration::from_millis(200), 3),
                        Arc::new(|_, _| {}),
                    );
                });
            }),
        );
        let reply_transport = node_transport.clone();
        node_transport.register_listener(
            MessageKind::Stop,
            Arc::new(move |_msg, _from| {
                let transport = reply_transport.clone();
                tokio::spawn(async move {
                    let mut logger = Logger::new(10.0, 0.0005, 0.0);
                    logger.log(Arc::new(vec!["probe".to_string()]), 0.001, false, 0.0);
                    logger.finish(20.0);
                    let payload = bincode::serialize(&logger).unwrap();
                    transport.send(
                        WireMessage { kind: MessageKind::Results, payload },
                        coordinator_endpoint,
                        SendOptions::at_least_once(Duration::from_millis(200), 3),
                        Arc::new(|_, _| {}),
                    );
                });
            }),
        );

        let mut config = sample_config("random_rw");
        config.duration_secs = 0;
        let coordinator = Coordinator::new(coordinator_transport, vec![node_endpoint], config, None);
        let mut events = coordinator.subscribe();

        coordinator.load().await.expect("load");
        coordinator.run().await.expect("run");
        coordinator.collect().await.expect("collect");

        assert_eq!(coordinator.state().await, CoordinatorState::Done);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            let CoordinatorEvent::StateChanged(state) = event;
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                CoordinatorState::Loading,
                CoordinatorState::Loaded,
                CoordinatorState::Running,
                CoordinatorState::Stopping,
                CoordinatorState::Collecting,
                CoordinatorState::Done,
            ]
        );
    }
}
