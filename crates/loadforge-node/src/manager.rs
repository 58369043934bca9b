//! Benchmark manager (C4): owns the node's [`Logger`], drains worker report
//! queues at a fixed cadence, and bins each report into it.

use std::time::{Duration, Instant};

use loadforge_engine::{Logger, WorkerMessage};
use tokio::sync::mpsc;

fn now_seconds(epoch: Instant) -> f64 {
    epoch.elapsed().as_secs_f64()
}

fn describe(path: &loadforge_engine::EventPath, message: &str) -> String {
    format!("{}: {message}", path.join("/"))
}

/// Drains `report_rx` into `logger` at `rate_limit` cadence until the
/// channel is closed (all worker senders dropped), `stop` is requested, or a
/// worker reports a workload exception.
///
/// On a [`WorkerMessage::Err`], initiates close immediately (stops draining
/// further reports) and returns the failure reason for the caller to
/// propagate upward to the coordinator; `error_tx` carries the same reason
/// out-of-band so the caller can notify the coordinator without waiting for
/// this function to return.
///
/// Returns the closed logger, ready to be sent upstream as a `Results`
/// message payload, paired with `Some(reason)` if a workload exception ended
/// the run early.
pub async fn run(
    mut logger: Logger,
    mut report_rx: mpsc::Receiver<WorkerMessage>,
    rate_limit: Duration,
    epoch: Instant,
    error_tx: mpsc::UnboundedSender<String>,
) -> (Logger, Option<String>) {
    let mut failure = None;

    'drain: loop {
        tokio::select! {
            maybe = report_rx.recv() => {
                match maybe {
                    Some(WorkerMessage::Report(report)) => {
                        logger.log(report.path, report.elapsed.as_secs_f64(), report.failed, now_seconds(epoch));
                    }
                    Some(WorkerMessage::Err { path, message }) => {
                        let reason = describe(&path, &message);
                        let _ = error_tx.send(reason.clone());
                        failure = Some(reason);
                        break 'drain;
                    }
                    None => break 'drain,
                }
            }
            _ = tokio::time::sleep(rate_limit) => {}
        }
    }

    // Drain anything queued between the last recv and channel closure, unless
    // a workload exception already closed the run.
    if failure.is_none() {
        while let Ok(message) = report_rx.try_recv() {
            match message {
                WorkerMessage::Report(report) => {
                    logger.log(report.path, report.elapsed.as_secs_f64(), report.failed, now_seconds(epoch));
                }
                WorkerMessage::Err { path, message } => {
                    let reason = describe(&path, &message);
                    let _ = error_tx.send(reason.clone());
                    failure = Some(reason);
                    break;
                }
            }
        }
    }

    logger.finish(now_seconds(epoch));
    (logger, failure)
}
