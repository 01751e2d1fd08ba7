use crate::config::{RampConfig, Stage};
use std::time::Duration;

/// One stage resolved to absolute offsets on the run timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageWindow {
    pub stage_idx: usize,
    pub start_ms: u64,
    pub end_ms: u64,
    pub from_rate: f64,
    pub to_rate: f64,
    /// Arrivals issued before this stage begins
    pub arrivals_before: f64,
}

impl StageWindow {
    fn duration_s(&self) -> f64 {
        (self.end_ms - self.start_ms) as f64 / 1000.0
    }

    /// Arrivals over the whole window (area under the rate line).
    fn arrivals(&self) -> f64 {
        (self.from_rate + self.to_rate) / 2.0 * self.duration_s()
    }

    fn rate_at(&self, offset_s: f64) -> f64 {
        let d = self.duration_s();
        if d <= 0.0 {
            return self.to_rate;
        }
        self.from_rate + (self.to_rate - self.from_rate) * (offset_s / d)
    }
}

/// Piecewise-linear arrival-rate curve. Within each stage the rate moves
/// linearly from the previous stage's target (or `start_rate`) to its own.
#[derive(Debug, Clone)]
pub struct RampPlanner {
    stages: Vec<Stage>,
    windows: Vec<StageWindow>,
}

impl RampPlanner {
    pub fn new(config: RampConfig) -> Self {
        let mut windows = Vec::with_capacity(config.stages.len());
        let mut start_ms = 0u64;
        let mut from_rate = config.start_rate as f64;
        let mut arrivals_before = 0.0;

        for (stage_idx, stage) in config.stages.iter().enumerate() {
            let window = StageWindow {
                stage_idx,
                start_ms,
                end_ms: start_ms + stage.duration_ms,
                from_rate,
                to_rate: stage.target as f64,
                arrivals_before,
            };
            arrivals_before += window.arrivals();
            start_ms = window.end_ms;
            from_rate = window.to_rate;
            windows.push(window);
        }

        Self {
            stages: config.stages,
            windows,
        }
    }

    pub fn steps(&self) -> &[Stage] {
        &self.stages
    }

    pub fn windows(&self) -> &[StageWindow] {
        &self.windows
    }

    pub fn total_duration_ms(&self) -> u64 {
        self.stages.iter().map(|s| s.duration_ms).sum()
    }

    /// Area under the whole curve.
    pub fn total_arrivals(&self) -> f64 {
        self.windows
            .last()
            .map(|w| w.arrivals_before + w.arrivals())
            .unwrap_or(0.0)
    }

    /// Number of arrivals the scheduler issues: arrival `i` exists iff the
    /// cumulative curve reaches `i` strictly before the run ends.
    pub fn arrival_count(&self) -> u64 {
        let total = self.total_arrivals();
        if total <= 0.0 {
            return 0;
        }
        // Arrival 0 sits at t=0 whenever any arrival exists. The epsilon keeps
        // float noise on integral totals from adding a phantom arrival.
        (total - 1e-6).ceil().max(1.0) as u64
    }

    /// Index of the stage active at `elapsed_ms`, or `None` after the run.
    pub fn stage_at(&self, elapsed_ms: u64) -> Option<usize> {
        self.windows
            .iter()
            .find(|w| elapsed_ms >= w.start_ms && elapsed_ms < w.end_ms)
            .map(|w| w.stage_idx)
    }

    /// Target arrival rate at `elapsed_ms`; `None` once every stage elapsed.
    pub fn current_rate(&self, elapsed_ms: u64) -> Option<f64> {
        let idx = self.stage_at(elapsed_ms)?;
        let w = &self.windows[idx];
        Some(w.rate_at((elapsed_ms - w.start_ms) as f64 / 1000.0))
    }

    /// Offset from run start at which arrival `index` (0-based) is due, found
    /// by inverting the cumulative arrival curve.
    pub fn arrival_offset(&self, index: u64) -> Option<Duration> {
        if index >= self.arrival_count() {
            return None;
        }
        let target = index as f64;

        for w in &self.windows {
            let area = w.arrivals();
            if target > w.arrivals_before + area || area <= 0.0 {
                continue;
            }

            let x = target - w.arrivals_before;
            let d = w.duration_s();
            let slope = (w.to_rate - w.from_rate) / d;
            // Solve from_rate*t + slope*t^2/2 = x for the smallest t >= 0.
            let t = if slope.abs() < 1e-9 {
                x / w.from_rate
            } else {
                let disc = (w.from_rate * w.from_rate + 2.0 * slope * x).max(0.0);
                (disc.sqrt() - w.from_rate) / slope
            };
            let offset_s = w.start_ms as f64 / 1000.0 + t.clamp(0.0, d);
            return Some(Duration::from_secs_f64(offset_s));
        }

        None
    }
}
