//! Worker process pool (C3): N independent task runners, each driven from
//! its own `tokio` task under `spawn_blocking` so the single-threaded task
//! engine invariant holds per worker, with true OS-thread parallelism
//! across workers via the multi-thread runtime.

use std::time::Duration;

use loadforge_engine::{stop_channel, Node, Runner, StopHandle, TaskTree, WorkerMessage};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// A running set of worker task runners sharing one outbound report queue.
pub struct WorkerPool {
    stop_handles: Vec<StopHandle>,
    join_set: JoinSet<()>,
}

impl WorkerPool {
    /// Spawn `count` workers, each built from a fresh invocation of
    /// `tree_factory` (so each worker constructs its own backend client
    /// connection, never shared across workers), reporting to `report_tx`.
    pub fn spawn<F>(count: u32, report_tx: mpsc::Sender<WorkerMessage>, tree_factory: F) -> Self
    where
        F: Fn() -> Node + Send + Sync + 'static,
    {
        let mut stop_handles = Vec::with_capacity(count as usize);
        let mut join_set = JoinSet::new();

        for _ in 0..count {
            let tree = TaskTree::build(tree_factory());
            let (stop_handle, stop_signal) = stop_channel();
            let tx = report_tx.clone();
            stop_handles.push(stop_handle);
            join_set.spawn_blocking(move || {
                let mut runner = Runner::new(tree, tx, stop_signal);
                runner.run();
            });
        }

        Self { stop_handles, join_set }
    }

    /// Request every worker to stop at its next leaf boundary, then wait up
    /// to `soft_stop_timeout` for them to exit on their own. Workers still
    /// running after the deadline are aborted.
    pub async fn soft_stop(mut self, soft_stop_timeout: Duration) {
        for handle in &self.stop_handles {
            handle.request_stop().await;
        }

        let deadline = tokio::time::Instant::now() + soft_stop_timeout;
        loop {
            if self.join_set.is_empty() {
                return;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::select! {
                res = self.join_set.join_next() => report_join_panic(res),
                _ = tokio::time::sleep(remaining) => break,
            }
        }

        self.join_set.abort_all();
        while let Some(res) = self.join_set.join_next().await {
            report_join_panic(Some(res));
        }
    }
}

/// Log a worker task's `JoinError` rather than silently discarding it.
/// Cancellation from `abort_all` is expected and not logged; an actual panic
/// means a worker died outside the task engine's own panic handling (e.g. in
/// `Runner::new` or the pool's tree factory) and would otherwise vanish.
fn report_join_panic(res: Option<Result<(), tokio::task::JoinError>>) {
    if let Some(Err(err)) = res {
        if err.is_panic() {
            tracing::error!(%err, "worker task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    // A composite root with a single leaf that never calls finish/fail
    // spins the runner's `while active` loop forever, observed only at the
    // poll-stop point after each leaf invocation; this is the shape a real
    // open-ended benchmark leaf (e.g. `random_rw`'s read/write leaves) has.
    fn spinning_tree() -> Node {
        Node::composite(
            "root",
            1.0,
            vec![Node::leaf("spin", 1.0, false, Arc::new(|_ctx| {}))],
        )
    }

    #[tokio::test]
    async fn soft_stop_returns_within_timeout_for_spinning_workers() {
        let (report_tx, _report_rx) = mpsc::channel(8);
        let pool = WorkerPool::spawn(4, report_tx, spinning_tree);

        let budget = Duration::from_millis(300);
        let start = Instant::now();
        pool.soft_stop(budget).await;
        let elapsed = start.elapsed();

        assert!(
            elapsed < budget + Duration::from_millis(200),
            "soft_stop took {elapsed:?}, expected to return close to its {budget:?} budget"
        );
    }
}
