//! Rolling performance telemetry for the dashboard: ingest and display
//! rates, render and check timings, and heartbeat round-trip time. All
//! windows cover the trailing sixty seconds and reset together with the
//! buffer.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const PERF_WINDOW: Duration = Duration::from_secs(60);

/// Average render time above this flags the render pipeline as slow. One
/// frame at 60fps.
pub const RENDER_WARN_MILLIS: f64 = 16.0;
/// Average per-entry check evaluation above this flags the check set.
pub const CHECK_WARN_MILLIS: f64 = 5.0;
/// Sustained ingest above this rate flags the stream as hot.
pub const INGEST_WARN_RATE: f64 = 250.0;

/// Counts occurrences over a trailing window.
#[derive(Debug)]
struct RateWindow {
    samples: VecDeque<Instant>,
    window: Duration,
    started: Instant,
}

impl RateWindow {
    fn new(window: Duration, now: Instant) -> Self {
        Self { samples: VecDeque::new(), window, started: now }
    }

    fn record(&mut self, now: Instant) {
        self.samples.push_back(now);
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.samples.front() {
            if now.duration_since(oldest) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Events per second over the covered span. Early on the span is the
    /// monitor's lifetime, not the full window, so rates ramp in honestly
    /// instead of starting near zero.
    fn rate(&mut self, now: Instant) -> f64 {
        self.prune(now);
        if self.samples.is_empty() {
            return 0.0;
        }
        let span = now
            .duration_since(self.started)
            .min(self.window)
            .max(Duration::from_secs(1));
        self.samples.len() as f64 / span.as_secs_f64()
    }

    fn reset(&mut self, now: Instant) {
        self.samples.clear();
        self.started = now;
    }
}

/// Duration samples over a trailing window.
#[derive(Debug)]
struct DurationWindow {
    samples: VecDeque<(Instant, f64)>,
    window: Duration,
}

impl DurationWindow {
    fn new(window: Duration) -> Self {
        Self { samples: VecDeque::new(), window }
    }

    fn record(&mut self, now: Instant, millis: f64) {
        self.samples.push_back((now, millis));
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(oldest, _)) = self.samples.front() {
            if now.duration_since(oldest) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn average(&mut self, now: Instant) -> Option<f64> {
        self.prune(now);
        if self.samples.is_empty() {
            return None;
        }
        let total: f64 = self.samples.iter().map(|(_, millis)| millis).sum();
        Some(total / self.samples.len() as f64)
    }

    fn maximum(&mut self, now: Instant) -> Option<f64> {
        self.prune(now);
        self.samples
            .iter()
            .map(|(_, millis)| *millis)
            .fold(None, |acc, millis| Some(acc.map_or(millis, |max: f64| max.max(millis))))
    }

    fn reset(&mut self) {
        self.samples.clear();
    }
}

/// Point-in-time readout for the status pane.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PerfSnapshot {
    pub ingest_rate: f64,
    pub display_rate: f64,
    pub render_avg_millis: Option<f64>,
    pub render_max_millis: Option<f64>,
    pub check_avg_millis: Option<f64>,
    pub rtt_millis: Option<f64>,
    pub render_slow: bool,
    pub checks_slow: bool,
    pub ingest_hot: bool,
}

#[derive(Debug)]
pub struct PerfMonitor {
    ingest: RateWindow,
    display: RateWindow,
    render: DurationWindow,
    checks: DurationWindow,
    rtt_millis: Option<f64>,
}

impl PerfMonitor {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(now: Instant) -> Self {
        Self {
            ingest: RateWindow::new(PERF_WINDOW, now),
            display: RateWindow::new(PERF_WINDOW, now),
            render: DurationWindow::new(PERF_WINDOW),
            checks: DurationWindow::new(PERF_WINDOW),
            rtt_millis: None,
        }
    }

    /// One event accepted off the wire.
    pub fn record_ingest(&mut self, now: Instant) {
        self.ingest.record(now);
    }

    /// One entry admitted to the visible list.
    pub fn record_display(&mut self, now: Instant) {
        self.display.record(now);
    }

    /// One full frame render.
    pub fn record_render(&mut self, now: Instant, millis: f64) {
        self.render.record(now, millis);
    }

    /// Aggregate check-evaluation time spent on one entry.
    pub fn record_check_eval(&mut self, now: Instant, millis: f64) {
        self.checks.record(now, millis);
    }

    /// Latest heartbeat round trip. Overwrites, no history.
    pub fn record_rtt(&mut self, millis: f64) {
        self.rtt_millis = Some(millis);
    }

    pub fn clear_rtt(&mut self) {
        self.rtt_millis = None;
    }

    pub fn snapshot(&mut self, now: Instant) -> PerfSnapshot {
        let ingest_rate = self.ingest.rate(now);
        let display_rate = self.display.rate(now);
        let render_avg_millis = self.render.average(now);
        let render_max_millis = self.render.maximum(now);
        let check_avg_millis = self.checks.average(now);
        PerfSnapshot {
            ingest_rate,
            display_rate,
            render_avg_millis,
            render_max_millis,
            check_avg_millis,
            rtt_millis: self.rtt_millis,
            render_slow: render_avg_millis.is_some_and(|avg| avg > RENDER_WARN_MILLIS),
            checks_slow: check_avg_millis.is_some_and(|avg| avg > CHECK_WARN_MILLIS),
            ingest_hot: ingest_rate > INGEST_WARN_RATE,
        }
    }

    /// Drops all telemetry. Keeps the round-trip time since the connection
    /// outlives a buffer clear.
    pub fn reset(&mut self, now: Instant) {
        self.ingest.reset(now);
        self.display.reset(now);
        self.render.reset();
        self.checks.reset();
    }
}

impl Default for PerfMonitor {
    fn default() -> Self {
        Self::new()
    }
}
