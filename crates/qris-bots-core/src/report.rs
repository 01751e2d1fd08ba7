use crate::metrics::{MetricsSnapshot, SeriesSummary};
use crate::scheduler::SchedulerStats;
use crate::thresholds::{ThresholdReport, ThresholdResult};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// End-of-run summary written as the run artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub worker_id: String,
    pub transport: String,
    pub started_at: String,
    pub duration_ms: u64,
    pub scheduler: SchedulerStats,
    pub metrics: BTreeMap<String, SeriesSummary>,
    pub thresholds: Vec<ThresholdResult>,
    pub passed: bool,
}

impl RunReport {
    pub fn new(
        worker_id: impl Into<String>,
        transport: impl Into<String>,
        started_at: chrono::DateTime<chrono::Utc>,
        scheduler: SchedulerStats,
        snapshot: &MetricsSnapshot,
        thresholds: ThresholdReport,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            transport: transport.into(),
            started_at: started_at.to_rfc3339(),
            duration_ms: scheduler.elapsed_ms,
            scheduler,
            metrics: snapshot.summaries(),
            thresholds: thresholds.results,
            passed: thresholds.passed,
        }
    }

    pub fn violations(&self) -> impl Iterator<Item = &ThresholdResult> {
        self.thresholds.iter().filter(|t| !t.passed)
    }

    /// Achieved iteration start rate over the whole run.
    pub fn achieved_rate(&self) -> f64 {
        if self.duration_ms == 0 {
            return 0.0;
        }
        self.scheduler.started as f64 * 1000.0 / self.duration_ms as f64
    }

    /// Writes `summary_<worker>_<timestamp>.json` under `dir` and returns its path.
    pub fn write_to(&self, dir: impl AsRef<Path>) -> anyhow::Result<PathBuf> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create results dir {:?}", dir))?;

        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let path = dir.join(format!("summary_{}_{}.json", self.worker_id, timestamp));
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json).with_context(|| format!("Failed to write {:?}", path))?;
        Ok(path)
    }

    pub fn print_summary(&self) {
        println!("\n=== Worker {} Summary ({}) ===", self.worker_id, self.transport);
        println!("Duration: {}ms", self.duration_ms);
        println!("Scheduled: {}", self.scheduler.scheduled);
        println!("Started: {}", self.scheduler.started);
        println!("Dropped: {}", self.scheduler.dropped);
        println!("Completed: {}", self.scheduler.completed);
        println!(
            "Workers: {} (peak concurrency {})",
            self.scheduler.workers_allocated, self.scheduler.peak_concurrency
        );
        println!("Achieved rate: {:.1}/s", self.achieved_rate());
        if self.scheduler.interrupted {
            println!("Run was interrupted by the soft stop");
        }
        println!();

        for (name, summary) in &self.metrics {
            match summary {
                SeriesSummary::Trend {
                    count,
                    avg,
                    med,
                    p95,
                    p99,
                    max,
                    ..
                } => println!(
                    "{name:<20} count={count} avg={avg:.1}ms med={med:.1}ms p95={p95:.1}ms p99={p99:.1}ms max={max:.1}ms"
                ),
                SeriesSummary::Rate {
                    rate,
                    passes,
                    fails,
                } => println!("{name:<20} rate={:.2}% ({passes} of {})", rate * 100.0, passes + fails),
                SeriesSummary::Counter { count, rate } => {
                    println!("{name:<20} count={count} rate={rate:.1}/s")
                }
            }
        }

        println!();
        for t in &self.thresholds {
            println!("{t}");
        }
        println!(
            "\nResult: {}",
            if self.passed { "PASSED" } else { "FAILED" }
        );
        println!();
    }
}
