//! Per-process frame logger (C2): bins events into fixed-cadence frames and
//! latency histograms.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::task::EventPath;

/// Round `x` to `n` significant figures.
///
/// `round(x, n - ceil(log10(|x|)))`; `0.0` rounds to `0.0` rather than
/// taking `log10(0)`.
pub fn significant_figures(x: f64, n: i32) -> f64 {
    if x == 0.0 {
        return 0.0;
    }
    let digits_before_point = x.abs().log10().ceil() as i32;
    let decimals = n - digits_before_point;
    let scale = 10f64.powi(decimals);
    (x * scale).round() / scale
}

/// Per-event counters for one frame. `latency`/`throughput` are derived
/// exactly once, when the frame closes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventInfo {
    /// Number of invocations observed in this frame.
    pub count: u64,
    /// Number of those invocations that failed.
    pub failed_count: u64,
    /// Sum of elapsed seconds across all invocations.
    pub total_time: f64,
    /// `total_time / count`, rounded to 4 significant figures at close.
    pub latency: f64,
    /// `count / frame_width_secs`, rounded to 4 significant figures at close.
    pub throughput: f64,
}

/// A fixed-width window of wall-clock time and the events observed in it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    /// Start of this frame, in seconds.
    pub start_time: f64,
    /// End of this frame, in seconds. Equal to `start_time` until closed.
    pub end_time: f64,
    /// Per-event-path counters.
    pub events: BTreeMap<EventPath, EventInfo>,
}

impl Frame {
    fn new(start_time: f64) -> Self {
        Self {
            start_time,
            end_time: start_time,
            events: BTreeMap::new(),
        }
    }

    fn close(&mut self, end_time: f64) {
        self.end_time = end_time;
        let width = (end_time - self.start_time).max(f64::MIN_POSITIVE);
        for info in self.events.values_mut() {
            if info.count > 0 {
                info.latency = significant_figures(info.total_time / info.count as f64, 4);
                info.throughput = significant_figures(info.count as f64 / width, 4);
            }
        }
    }
}

/// A per-worker time-series of frames plus per-event latency histograms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logger {
    frame_period: f64,
    latency_bin_size: f64,
    start_time: f64,
    current_index: i64,
    frames: Vec<Frame>,
    histograms: BTreeMap<EventPath, BTreeMap<u64, u64>>,
}

impl Logger {
    /// Build a logger. `now` is the wall-clock time (seconds) at which the
    /// logger starts observing; its start boundary is floored to the
    /// nearest `frame_period`, so two loggers built with the same
    /// `frame_period` always share frame boundaries.
    pub fn new(frame_period: f64, latency_bin_size: f64, now: f64) -> Self {
        let start_time = (now / frame_period).floor() * frame_period;
        Self {
            frame_period,
            latency_bin_size,
            start_time,
            current_index: 0,
            frames: vec![Frame::new(start_time)],
            histograms: BTreeMap::new(),
        }
    }

    /// Reassemble a logger from already-computed parts. Used by the
    /// alignment pipeline to build clipped/averaged loggers without
    /// re-deriving their start time from a wall-clock reading.
    pub(crate) fn from_parts(
        frame_period: f64,
        latency_bin_size: f64,
        frames: Vec<Frame>,
        histograms: BTreeMap<EventPath, BTreeMap<u64, u64>>,
    ) -> Self {
        let start_time = frames.first().map(|f| f.start_time).unwrap_or(0.0);
        let current_index = frames.len().saturating_sub(1) as i64;
        Self {
            frame_period,
            latency_bin_size,
            start_time,
            current_index,
            frames,
            histograms,
        }
    }

    /// The frame period (seconds).
    pub fn frame_period(&self) -> f64 {
        self.frame_period
    }

    /// The latency histogram bin width (seconds).
    pub fn latency_bin_size(&self) -> f64 {
        self.latency_bin_size
    }

    /// The aligned start time of frame 0.
    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    /// Closed (and the still-open) frames observed so far, in order.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Latency histograms, per event path, keyed by bin index.
    pub fn histograms(&self) -> &BTreeMap<EventPath, BTreeMap<u64, u64>> {
        &self.histograms
    }

    fn target_index(&self, now: f64) -> i64 {
        ((now - self.start_time) / self.frame_period).floor() as i64
    }

    fn roll_to(&mut self, target_index: i64) {
        while self.current_index < target_index {
            let next_start = self.start_time + (self.current_index + 1) as f64 * self.frame_period;
            self.frames
                .last_mut()
                .expect("logger always has at least one frame")
                .close(next_start);
            self.current_index += 1;
            self.frames.push(Frame::new(next_start));
        }
    }

    /// Record one event. `elapsed` is the operation's wall-clock duration in
    /// seconds; `now` is the wall-clock time the event completed.
    pub fn log(&mut self, path: EventPath, elapsed: f64, failed: bool, now: f64) {
        let target = self.target_index(now).max(self.current_index);
        self.roll_to(target);

        let frame = self.frames.last_mut().expect("rolled at least to current");
        let info = frame.events.entry(path.clone()).or_default();
        info.count += 1;
        if failed {
            info.failed_count += 1;
        }
        info.total_time += elapsed;

        let bin = ((elapsed / self.latency_bin_size).floor().max(0.0)) as u64;
        *self.histograms.entry(path).or_default().entry(bin).or_insert(0) += 1;
    }

    /// Close the last open frame. Call once the worker has stopped
    /// producing events, so its final frame's derived stats are computed.
    pub fn finish(&mut self, now: f64) {
        let target = self.target_index(now).max(self.current_index);
        self.roll_to(target);
        let end = self.start_time + (self.current_index + 1) as f64 * self.frame_period;
        self.frames
            .last_mut()
            .expect("logger always has at least one frame")
            .close(end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn path(name: &str) -> EventPath {
        Arc::new(vec![name.to_string()])
    }

    #[test]
    fn significant_figures_rounds_as_documented() {
        assert_eq!(significant_figures(0.0, 4), 0.0);
        assert_eq!(significant_figures(123456.0, 4), 123500.0);
        assert_eq!(significant_figures(0.00123449, 4), 0.001234);
        assert_eq!(significant_figures(0.00123451, 4), 0.001235);
    }

    #[test]
    fn frame_contiguity_across_idle_gap() {
        let mut logger = Logger::new(0.1, 0.001, 0.0);
        logger.log(path("op"), 0.001, false, 0.0);
        logger.log(path("op"), 0.001, false, 0.25);

        let frames = logger.frames();
        assert_eq!(frames.len(), 3);
        for w in frames.windows(2) {
            assert!((w[1].start_time - w[0].start_time - 0.1).abs() < 1e-9);
            assert!((w[0].end_time - w[1].start_time).abs() < 1e-9);
        }
        assert_eq!(frames[0].events.len(), 1);
        assert!(frames[1].events.is_empty());
        assert_eq!(frames[2].events.len(), 1);
    }

    #[test]
    fn histogram_totals_match_frame_counts() {
        let mut logger = Logger::new(1.0, 0.01, 0.0);
        for i in 0..10 {
            logger.log(path("op"), 0.02 * i as f64, false, 0.0);
        }
        logger.finish(1.0);

        let frame_count: u64 = logger.frames()[0].events[&path("op")].count;
        let hist_count: u64 = logger.histograms()[&path("op")].values().sum();
        assert_eq!(frame_count, hist_count);
        assert_eq!(frame_count, 10);
    }
}
