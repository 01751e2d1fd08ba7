use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Series the flow engine and scheduler emit.
pub mod names {
    use super::MetricKind;

    pub const INQUIRY_DURATION: &str = "inquiry_duration";
    pub const PAYMENT_DURATION: &str = "payment_duration";
    pub const STATUS_DURATION: &str = "status_duration";
    pub const HTTP_REQ_DURATION: &str = "http_req_duration";
    pub const ITERATION_DURATION: &str = "iteration_duration";
    pub const ERROR_RATE: &str = "error_rate";
    pub const HTTP_REQS: &str = "http_reqs";
    pub const ITERATIONS: &str = "iterations";
    pub const DROPPED_ITERATIONS: &str = "dropped_iterations";
    pub const PAYMENT_CONFLICTS: &str = "payment_conflicts";

    pub const ALL: &[(&str, MetricKind)] = &[
        (INQUIRY_DURATION, MetricKind::Trend),
        (PAYMENT_DURATION, MetricKind::Trend),
        (STATUS_DURATION, MetricKind::Trend),
        (HTTP_REQ_DURATION, MetricKind::Trend),
        (ITERATION_DURATION, MetricKind::Trend),
        (ERROR_RATE, MetricKind::Rate),
        (HTTP_REQS, MetricKind::Counter),
        (ITERATIONS, MetricKind::Counter),
        (DROPPED_ITERATIONS, MetricKind::Counter),
        (PAYMENT_CONFLICTS, MetricKind::Counter),
    ];

    pub fn kind_of(name: &str) -> Option<MetricKind> {
        ALL.iter().find(|(n, _)| *n == name).map(|(_, k)| *k)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Numeric samples (milliseconds) queried by percentile
    Trend,
    /// Boolean samples reported as the fraction of `true`
    Rate,
    /// Monotonic sum
    Counter,
}

/// Where workers push samples. Implementations must tolerate concurrent
/// appends from every in-flight iteration.
pub trait MetricsSink: Send + Sync {
    fn add_trend(&self, name: &str, value_ms: f64);

    fn add_rate(&self, name: &str, hit: bool);

    fn add_counter(&self, name: &str, delta: u64);

    fn add_duration(&self, name: &str, elapsed: Duration) {
        self.add_trend(name, elapsed.as_secs_f64() * 1000.0);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Series {
    Trend(Vec<f64>),
    Rate { passes: u64, fails: u64 },
    Counter(u64),
}

impl Series {
    fn empty(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Trend => Series::Trend(Vec::new()),
            MetricKind::Rate => Series::Rate {
                passes: 0,
                fails: 0,
            },
            MetricKind::Counter => Series::Counter(0),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            Series::Trend(_) => MetricKind::Trend,
            Series::Rate { .. } => MetricKind::Rate,
            Series::Counter(_) => MetricKind::Counter,
        }
    }
}

/// Concurrency-safe aggregator shared by every worker. Known series get their
/// own lock so appends to different series never contend.
pub struct MetricsRegistry {
    started: Instant,
    known: BTreeMap<&'static str, Mutex<Series>>,
    custom: Mutex<BTreeMap<String, Series>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let known = names::ALL
            .iter()
            .map(|(name, kind)| (*name, Mutex::new(Series::empty(*kind))))
            .collect();
        Self {
            started: Instant::now(),
            known,
            custom: Mutex::new(BTreeMap::new()),
        }
    }

    fn with_series(&self, name: &str, kind: MetricKind, f: impl FnOnce(&mut Series)) {
        if let Some(series) = self.known.get(name) {
            let mut series = series.lock();
            if series.kind() == kind {
                f(&mut series);
            } else {
                tracing::debug!("metric {} is a {:?}, dropping {:?} sample", name, series.kind(), kind);
            }
            return;
        }

        let mut custom = self.custom.lock();
        let series = custom
            .entry(name.to_string())
            .or_insert_with(|| Series::empty(kind));
        if series.kind() == kind {
            f(series);
        }
    }

    /// Read-only copy of every series; trend samples come back sorted.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut series: BTreeMap<String, Series> = self
            .known
            .iter()
            .map(|(name, s)| (name.to_string(), s.lock().clone()))
            .collect();
        for (name, s) in self.custom.lock().iter() {
            series.insert(name.clone(), s.clone());
        }
        for s in series.values_mut() {
            if let Series::Trend(samples) = s {
                samples.sort_by(|a, b| a.total_cmp(b));
            }
        }

        MetricsSnapshot {
            elapsed: self.started.elapsed(),
            series,
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for MetricsRegistry {
    fn add_trend(&self, name: &str, value_ms: f64) {
        self.with_series(name, MetricKind::Trend, |s| {
            if let Series::Trend(samples) = s {
                samples.push(value_ms);
            }
        });
    }

    fn add_rate(&self, name: &str, hit: bool) {
        self.with_series(name, MetricKind::Rate, |s| {
            if let Series::Rate { passes, fails } = s {
                if hit {
                    *passes += 1;
                } else {
                    *fails += 1;
                }
            }
        });
    }

    fn add_counter(&self, name: &str, delta: u64) {
        self.with_series(name, MetricKind::Counter, |s| {
            if let Series::Counter(count) = s {
                *count += delta;
            }
        });
    }
}

/// Aggregate functions thresholds can be expressed over.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregate {
    Avg,
    Min,
    Max,
    Med,
    Percentile(f64),
    /// Fraction of `true` samples for rates, per-second rate for counters
    Rate,
    Count,
}

impl Aggregate {
    pub fn applies_to(self, kind: MetricKind) -> bool {
        match kind {
            MetricKind::Trend => matches!(
                self,
                Aggregate::Avg
                    | Aggregate::Min
                    | Aggregate::Max
                    | Aggregate::Med
                    | Aggregate::Percentile(_)
            ),
            MetricKind::Rate => matches!(self, Aggregate::Rate),
            MetricKind::Counter => matches!(self, Aggregate::Count | Aggregate::Rate),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub elapsed: Duration,
    series: BTreeMap<String, Series>,
}

impl MetricsSnapshot {
    pub fn series(&self, name: &str) -> Option<&Series> {
        self.series.get(name)
    }

    pub fn trend(&self, name: &str) -> &[f64] {
        match self.series.get(name) {
            Some(Series::Trend(samples)) => samples,
            _ => &[],
        }
    }

    pub fn counter(&self, name: &str) -> u64 {
        match self.series.get(name) {
            Some(Series::Counter(count)) => *count,
            _ => 0,
        }
    }

    /// Returns `(passes, fails)`.
    pub fn rate(&self, name: &str) -> (u64, u64) {
        match self.series.get(name) {
            Some(Series::Rate { passes, fails }) => (*passes, *fails),
            _ => (0, 0),
        }
    }

    /// Value of `agg` over `name`. Missing or empty series aggregate to 0.
    pub fn aggregate(&self, name: &str, agg: Aggregate) -> f64 {
        match (self.series.get(name), agg) {
            (Some(Series::Trend(samples)), agg) => trend_aggregate(samples, agg),
            (Some(Series::Rate { passes, fails }), _) => ratio(*passes, passes + fails),
            (Some(Series::Counter(count)), Aggregate::Rate) => {
                let secs = self.elapsed.as_secs_f64();
                if secs > 0.0 {
                    *count as f64 / secs
                } else {
                    0.0
                }
            }
            (Some(Series::Counter(count)), _) => *count as f64,
            (None, _) => 0.0,
        }
    }

    pub fn summaries(&self) -> BTreeMap<String, SeriesSummary> {
        self.series
            .iter()
            .map(|(name, series)| {
                let summary = match series {
                    Series::Trend(samples) => SeriesSummary::Trend {
                        count: samples.len() as u64,
                        min: trend_aggregate(samples, Aggregate::Min),
                        max: trend_aggregate(samples, Aggregate::Max),
                        avg: trend_aggregate(samples, Aggregate::Avg),
                        med: trend_aggregate(samples, Aggregate::Med),
                        p90: percentile(samples, 90.0),
                        p95: percentile(samples, 95.0),
                        p99: percentile(samples, 99.0),
                    },
                    Series::Rate { passes, fails } => SeriesSummary::Rate {
                        rate: ratio(*passes, passes + fails),
                        passes: *passes,
                        fails: *fails,
                    },
                    Series::Counter(count) => SeriesSummary::Counter {
                        count: *count,
                        rate: self.aggregate(name, Aggregate::Rate),
                    },
                };
                (name.clone(), summary)
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SeriesSummary {
    Trend {
        count: u64,
        min: f64,
        max: f64,
        avg: f64,
        med: f64,
        p90: f64,
        p95: f64,
        p99: f64,
    },
    Rate {
        rate: f64,
        passes: u64,
        fails: u64,
    },
    Counter {
        count: u64,
        rate: f64,
    },
}

fn ratio(n: u64, d: u64) -> f64 {
    if d == 0 {
        0.0
    } else {
        n as f64 / d as f64
    }
}

/// `sorted` must be ascending.
fn trend_aggregate(sorted: &[f64], agg: Aggregate) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    match agg {
        Aggregate::Min => sorted[0],
        Aggregate::Max => sorted[sorted.len() - 1],
        Aggregate::Avg => sorted.iter().sum::<f64>() / sorted.len() as f64,
        Aggregate::Med => percentile(sorted, 50.0),
        Aggregate::Percentile(p) => percentile(sorted, p),
        Aggregate::Count => sorted.len() as f64,
        Aggregate::Rate => 0.0,
    }
}

/// Linear interpolation between closest ranks over an ascending slice.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_percentile_interpolation() {
        let samples: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        assert_eq!(percentile(&samples, 0.0), 1.0);
        assert_eq!(percentile(&samples, 100.0), 100.0);
        assert!((percentile(&samples, 50.0) - 50.5).abs() < 1e-9);
        assert!((percentile(&samples, 95.0) - 95.05).abs() < 1e-9);
        assert_eq!(percentile(&[], 95.0), 0.0);
        assert_eq!(percentile(&[7.0], 99.0), 7.0);
    }

    #[test]
    fn test_registry_kinds() {
        let registry = MetricsRegistry::new();
        registry.add_trend(names::INQUIRY_DURATION, 30.0);
        registry.add_trend(names::INQUIRY_DURATION, 10.0);
        registry.add_trend(names::INQUIRY_DURATION, 20.0);
        registry.add_rate(names::ERROR_RATE, true);
        registry.add_rate(names::ERROR_RATE, false);
        registry.add_rate(names::ERROR_RATE, false);
        registry.add_rate(names::ERROR_RATE, false);
        registry.add_counter(names::HTTP_REQS, 3);
        // wrong kind for a known series is ignored
        registry.add_counter(names::ERROR_RATE, 10);

        let snap = registry.snapshot();
        assert_eq!(snap.trend(names::INQUIRY_DURATION), &[10.0, 20.0, 30.0]);
        assert_eq!(snap.rate(names::ERROR_RATE), (1, 3));
        assert_eq!(snap.aggregate(names::ERROR_RATE, Aggregate::Rate), 0.25);
        assert_eq!(snap.counter(names::HTTP_REQS), 3);
        assert_eq!(snap.aggregate(names::INQUIRY_DURATION, Aggregate::Med), 20.0);
        assert_eq!(snap.aggregate(names::INQUIRY_DURATION, Aggregate::Avg), 20.0);
        assert_eq!(snap.aggregate(names::STATUS_DURATION, Aggregate::Percentile(95.0)), 0.0);
    }

    #[test]
    fn test_custom_series() {
        let registry = MetricsRegistry::new();
        registry.add_counter("checks_total", 2);
        registry.add_counter("checks_total", 5);
        let snap = registry.snapshot();
        assert_eq!(snap.counter("checks_total"), 7);
        assert!(matches!(
            snap.summaries().get("checks_total"),
            Some(SeriesSummary::Counter { count: 7, .. })
        ));
    }

    #[test]
    fn test_summaries_cover_known_series() {
        let registry = MetricsRegistry::new();
        registry.add_duration(names::PAYMENT_DURATION, Duration::from_millis(250));
        let summaries = registry.snapshot().summaries();
        assert_eq!(summaries.len(), names::ALL.len());
        match &summaries[names::PAYMENT_DURATION] {
            SeriesSummary::Trend { count, p95, .. } => {
                assert_eq!(*count, 1);
                assert!((p95 - 250.0).abs() < 1e-9);
            }
            other => panic!("unexpected summary {other:?}"),
        }
    }

    #[test]
    fn test_aggregate_applicability() {
        assert!(Aggregate::Percentile(95.0).applies_to(MetricKind::Trend));
        assert!(!Aggregate::Percentile(95.0).applies_to(MetricKind::Rate));
        assert!(Aggregate::Rate.applies_to(MetricKind::Rate));
        assert!(Aggregate::Rate.applies_to(MetricKind::Counter));
        assert!(!Aggregate::Count.applies_to(MetricKind::Trend));
    }

    #[test]
    fn test_concurrent_appends() {
        let registry = Arc::new(MetricsRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        registry.add_trend(names::HTTP_REQ_DURATION, i as f64);
                        registry.add_rate(names::ERROR_RATE, i % 10 == 0);
                        registry.add_counter(names::HTTP_REQS, 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snap = registry.snapshot();
        assert_eq!(snap.trend(names::HTTP_REQ_DURATION).len(), 8000);
        assert_eq!(snap.counter(names::HTTP_REQS), 8000);
        assert_eq!(snap.rate(names::ERROR_RATE), (800, 7200));
    }
}
