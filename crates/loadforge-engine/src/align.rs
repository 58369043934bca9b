//! Log alignment and averaging (C7): clip per-worker loggers to their
//! overlapping runtime, average their frames, and derive a per-event
//! summary with latency percentiles.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::logger::{significant_figures, EventInfo, Frame, Logger};
use crate::task::EventPath;

/// Errors from the alignment pipeline.
#[derive(Debug, Error)]
pub enum AlignError {
    /// The loggers' runtimes, once `dead_frames` are trimmed from each end,
    /// do not overlap at all.
    #[error("runtimes do not overlap")]
    NoOverlap,
    /// Loggers disagreed on frame period or bin size, or ended up with
    /// different surviving frame counts after clipping.
    #[error("logger mismatch: {0}")]
    Mismatch(String),
}

/// Per-event aggregate statistics over an averaged, clipped log.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    /// Unweighted mean of the per-frame average latencies, across frames in
    /// which the event appeared. Kept as the source computes it: this is
    /// not the same as total-time-over-total-count.
    pub average_latency: f64,
    /// Unweighted mean of the per-frame throughputs, across frames in which
    /// the event appeared.
    pub average_throughput: f64,
    /// `100 * failed / total`, across all frames.
    pub fail_percentage: f64,
    /// Percentile latencies, keyed by the percentile (e.g. `0.99`).
    pub percentiles: BTreeMap<OrderedPercentile, f64>,
}

/// A percentile in `(0, 1]`, ordered so it can key a `BTreeMap`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct OrderedPercentile(pub f64);

impl Eq for OrderedPercentile {}
impl Ord for OrderedPercentile {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.partial_cmp(&other.0).expect("percentiles are never NaN")
    }
}

/// The percentiles a summary reports latencies for.
pub const PERCENTILES: [f64; 5] = [0.50, 0.90, 0.95, 0.99, 0.999];

fn approx_ge(a: f64, b: f64, tolerance: f64) -> bool {
    a >= b - tolerance
}

fn approx_le(a: f64, b: f64, tolerance: f64) -> bool {
    a <= b + tolerance
}

/// Clip each logger's frames down to the window all loggers overlap in,
/// trimming `dead_frames` extra frames from each end to discard warm-up and
/// cool-down noise.
pub fn clip(loggers: &[Logger], dead_frames: u32) -> Result<Vec<Logger>, AlignError> {
    let first = loggers.first().ok_or_else(|| AlignError::Mismatch("no loggers".into()))?;
    let frame_period = first.frame_period();

    let mut max_begin = first.frames()[0].start_time;
    let mut min_end = first.frames().last().expect("logger has a frame").start_time;

    for logger in loggers {
        if (logger.frame_period() - frame_period).abs() > f64::EPSILON {
            return Err(AlignError::Mismatch("frame periods differ".into()));
        }
        let begin = logger.frames()[0].start_time;
        let end = logger.frames().last().expect("logger has a frame").start_time;
        max_begin = max_begin.max(begin + dead_frames as f64 * frame_period);
        min_end = min_end.min(end - dead_frames as f64 * frame_period);
    }

    if max_begin >= min_end {
        return Err(AlignError::NoOverlap);
    }

    let tolerance = 0.1 * frame_period;
    let mut clipped = Vec::with_capacity(loggers.len());
    for logger in loggers {
        let frames: Vec<Frame> = logger
            .frames()
            .iter()
            .filter(|f| approx_ge(f.start_time, max_begin, tolerance) && approx_le(f.start_time, min_end, tolerance))
            .cloned()
            .collect();
        let histograms = logger.histograms().clone();
        clipped.push(Logger::from_parts(
            logger.frame_period(),
            logger.latency_bin_size(),
            frames,
            histograms,
        ));
    }
    Ok(clipped)
}

/// Average a set of clipped, fully-overlapping loggers into one combined
/// logger: frame counters are summed position-by-position and histogram
/// bins are summed per event per bin.
pub fn average(loggers: &[Logger]) -> Result<Logger, AlignError> {
    let first = loggers.first().ok_or_else(|| AlignError::Mismatch("no loggers".into()))?;
    let frame_count = first.frames().len();

    for logger in loggers {
        if logger.frames().len() != frame_count {
            return Err(AlignError::Mismatch(format!(
                "frame counts do not match: expected {frame_count}, got {}",
                logger.frames().len()
            )));
        }
    }

    let mut averaged_frames = Vec::with_capacity(frame_count);
    for frame_index in 0..frame_count {
        let start_time = first.frames()[frame_index].start_time;
        let end_time = first.frames()[frame_index].end_time;
        let mut events: BTreeMap<EventPath, EventInfo> = BTreeMap::new();

        for logger in loggers {
            for (path, info) in &logger.frames()[frame_index].events {
                let entry = events.entry(path.clone()).or_default();
                entry.count += info.count;
                entry.failed_count += info.failed_count;
                entry.total_time += info.total_time;
            }
        }

        let width = (end_time - start_time).max(f64::MIN_POSITIVE);
        for info in events.values_mut() {
            if info.count > 0 {
                info.latency = significant_figures(info.total_time / info.count as f64, 4);
                info.throughput = significant_figures(info.count as f64 / width, 4);
            }
        }

        averaged_frames.push(Frame {
            start_time,
            end_time,
            events,
        });
    }

    let mut histograms: BTreeMap<EventPath, BTreeMap<u64, u64>> = BTreeMap::new();
    for logger in loggers {
        for (path, bins) in logger.histograms() {
            let entry = histograms.entry(path.clone()).or_default();
            for (bin, count) in bins {
                *entry.entry(*bin).or_insert(0) += count;
            }
        }
    }

    Ok(Logger::from_parts(
        first.frame_period(),
        first.latency_bin_size(),
        averaged_frames,
        histograms,
    ))
}

/// Derive a per-event summary from an averaged log: average latency and
/// throughput (unweighted means over frames the event appeared in), fail
/// percentage, and latency percentiles walked off the histogram.
pub fn summarize(log: &Logger) -> BTreeMap<EventPath, Summary> {
    let mut totals: BTreeMap<EventPath, (u64, u64, u64, f64, f64)> = BTreeMap::new();
    // (frame_count, total_events, total_fails, sum_latency, sum_throughput)

    for frame in log.frames() {
        for (path, info) in &frame.events {
            let entry = totals.entry(path.clone()).or_insert((0, 0, 0, 0.0, 0.0));
            entry.0 += 1;
            entry.1 += info.count;
            entry.2 += info.failed_count;
            entry.3 += info.latency;
            entry.4 += info.throughput;
        }
    }

    let mut summaries = BTreeMap::new();
    for (path, (frames_with_event, total, total_fails, sum_latency, sum_throughput)) in totals {
        let average_latency = significant_figures(sum_latency / frames_with_event as f64, 4);
        let average_throughput = significant_figures(sum_throughput / frames_with_event as f64, 4);
        let fail_percentage = if total > 0 {
            significant_figures(total_fails as f64 / total as f64 * 100.0, 4)
        } else {
            0.0
        };

        let mut percentiles = BTreeMap::new();
        if let Some(bins) = log.histograms().get(&path) {
            let bin_total: u64 = bins.values().sum();
            if bin_total > 0 {
                for p in PERCENTILES {
                    let mut observed = 0u64;
                    let mut result_bin = None;
                    for (bin, count) in bins {
                        observed += count;
                        if observed as f64 / bin_total as f64 >= p {
                            result_bin = Some(*bin);
                            break;
                        }
                    }
                    if let Some(bin) = result_bin {
                        let value = significant_figures(bin as f64 * log.latency_bin_size(), 4);
                        percentiles.insert(OrderedPercentile(p), value);
                    }
                }
            }
        }

        summaries.insert(
            path,
            Summary {
                average_latency,
                average_throughput,
                fail_percentage,
                percentiles,
            },
        );
    }
    summaries
}

/// Run the full alignment pipeline: clip, average, summarize.
pub fn align(loggers: &[Logger], dead_frames: u32) -> Result<BTreeMap<EventPath, Summary>, AlignError> {
    let clipped = clip(loggers, dead_frames)?;
    let averaged = average(&clipped)?;
    Ok(summarize(&averaged))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn path(name: &str) -> EventPath {
        Arc::new(vec![name.to_string()])
    }

    fn logger_with_events(frame_period: f64, frame_count: usize, counts: &[u64]) -> Logger {
        let mut logger = Logger::new(frame_period, 0.01, 0.0);
        for (i, &count) in counts.iter().enumerate().take(frame_count) {
            for _ in 0..count {
                logger.log(path("op"), 0.01, false, i as f64 * frame_period);
            }
        }
        logger.finish(frame_count as f64 * frame_period);
        logger
    }

    #[test]
    fn clipping_keeps_only_overlapping_frames_within_bounds() {
        let a = logger_with_events(1.0, 5, &[1, 1, 1, 1, 1]);
        let b = logger_with_events(1.0, 5, &[1, 1, 1, 1, 1]);
        let clipped = clip(&[a, b], 1).expect("overlapping runtimes");

        for logger in &clipped {
            for frame in logger.frames() {
                assert!(frame.start_time >= 1.0 - 0.2);
                assert!(frame.start_time <= 3.0 + 0.2);
            }
        }
        let counts: Vec<usize> = clipped.iter().map(|l| l.frames().len()).collect();
        assert_eq!(counts[0], counts[1]);
    }

    #[test]
    fn clip_refuses_disjoint_runtimes() {
        let a = logger_with_events(1.0, 2, &[1, 1]);
        let mut b = Logger::new(1.0, 0.01, 5.0);
        b.log(path("op"), 0.01, false, 5.0);
        b.finish(7.0);

        let err = clip(&[a, b], 0).unwrap_err();
        assert!(matches!(err, AlignError::NoOverlap));
    }

    #[test]
    fn averaging_sums_counts_across_loggers() {
        let a = logger_with_events(1.0, 3, &[2, 2, 2]);
        let b = logger_with_events(1.0, 3, &[3, 3, 3]);
        let averaged = average(&[a, b]).expect("matching frame counts");
        for frame in averaged.frames() {
            assert_eq!(frame.events[&path("op")].count, 5);
        }
    }

    #[test]
    fn percentile_monotonicity() {
        let logger = logger_with_events(1.0, 4, &[10, 10, 10, 10]);
        let summaries = summarize(&logger);
        let summary = &summaries[&path("op")];
        let values: Vec<f64> = PERCENTILES
            .iter()
            .filter_map(|p| summary.percentiles.get(&OrderedPercentile(*p)).copied())
            .collect();
        for w in values.windows(2) {
            assert!(w[0] <= w[1]);
        }
    }

    #[test]
    fn align_end_to_end_produces_fail_percentage() {
        let mut a = Logger::new(1.0, 0.01, 0.0);
        a.log(path("op"), 0.01, false, 0.0);
        a.log(path("op"), 0.01, true, 0.0);
        a.finish(2.0);

        let mut b = Logger::new(1.0, 0.01, 0.0);
        b.log(path("op"), 0.01, false, 0.0);
        b.finish(2.0);

        let summaries = align(&[a, b], 0).expect("overlapping runtimes");
        let summary = &summaries[&path("op")];
        assert!((summary.fail_percentage - 100.0 / 3.0).abs() < 0.5);
    }
}
