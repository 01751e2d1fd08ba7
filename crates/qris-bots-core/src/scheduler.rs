use crate::config::RampConfig;
use crate::metrics::{names, MetricsSink};
use crate::ramp::RampPlanner;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{info, warn};

/// Soft-stop flag shared by the scheduler and every in-flight iteration.
/// Iterations finish the request they are waiting on and start no new step.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

#[derive(Default)]
struct StopInner {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub async fn stopped(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

/// One unit of work started per arrival
pub trait Iteration: Send + Sync + 'static {
    fn run<'a>(&'a self, stop: &'a StopSignal) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerBudget {
    /// Workers spawned before the first arrival
    pub pre_allocated: usize,
    /// Hard cap on concurrently executing iterations
    pub max: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub scheduled: u64,
    pub started: u64,
    pub dropped: u64,
    pub completed: u64,
    pub workers_allocated: usize,
    pub peak_concurrency: usize,
    /// Soft stop was raised (external stop or graceful drain timeout)
    pub interrupted: bool,
    pub elapsed_ms: u64,
}

/// Open-model scheduler: arrivals follow the ramp curve no matter how long
/// each iteration takes, bounded by the worker budget.
pub struct ArrivalScheduler {
    planner: RampPlanner,
    budget: WorkerBudget,
    graceful_stop: Duration,
    progress_every: Duration,
}

impl ArrivalScheduler {
    pub fn new(config: RampConfig) -> Self {
        let budget = WorkerBudget {
            pre_allocated: config.pre_allocated_workers,
            max: config.max_workers.max(1),
        };
        let graceful_stop = Duration::from_millis(config.graceful_stop_ms);
        Self {
            planner: RampPlanner::new(config),
            budget,
            graceful_stop,
            progress_every: Duration::from_secs(1),
        }
    }

    pub fn with_progress_every(mut self, every: Duration) -> Self {
        self.progress_every = every.max(Duration::from_millis(1));
        self
    }

    pub fn planner(&self) -> &RampPlanner {
        &self.planner
    }

    pub fn budget(&self) -> WorkerBudget {
        self.budget
    }

    pub async fn run<I: Iteration>(
        &self,
        iteration: Arc<I>,
        metrics: Arc<dyn MetricsSink>,
        stop: StopSignal,
    ) -> SchedulerStats {
        let start = Instant::now();
        let mut pool = WorkerPool::new(iteration, self.budget, stop.clone());
        let mut stats = SchedulerStats::default();

        let total = self.planner.arrival_count();
        info!(
            "Planned {} stages, {} arrivals over {}ms (workers: {} pre-allocated, {} max)",
            self.planner.steps().len(),
            total,
            self.planner.total_duration_ms(),
            self.budget.pre_allocated,
            self.budget.max
        );

        let mut current_stage = None;
        let mut last_progress = start;
        let mut dropped_since_progress = 0u64;

        for index in 0..total {
            let Some(offset) = self.planner.arrival_offset(index) else {
                break;
            };

            if stop.is_stopped() {
                break;
            }
            tokio::select! {
                _ = sleep_until(start + offset) => {}
                _ = stop.stopped() => break,
            }

            let stage = self.planner.stage_at(offset.as_millis() as u64);
            if stage.is_some() && stage != current_stage {
                current_stage = stage;
                if let Some(idx) = stage {
                    let w = self.planner.windows()[idx];
                    info!(
                        "Starting stage {}: {:.0} -> {:.0}/s over {}ms",
                        idx,
                        w.from_rate,
                        w.to_rate,
                        w.end_ms - w.start_ms
                    );
                }
            }

            stats.scheduled += 1;
            if pool.dispatch(index) {
                stats.started += 1;
            } else {
                stats.dropped += 1;
                dropped_since_progress += 1;
                metrics.add_counter(names::DROPPED_ITERATIONS, 1);
            }

            if last_progress.elapsed() >= self.progress_every {
                last_progress = Instant::now();
                let elapsed_ms = start.elapsed().as_millis() as u64;
                info!(
                    "Progress: t={}ms rate={:.0}/s scheduled={} started={} dropped={} active={} workers={}",
                    elapsed_ms,
                    self.planner.current_rate(elapsed_ms).unwrap_or(0.0),
                    stats.scheduled,
                    stats.started,
                    stats.dropped,
                    pool.active(),
                    pool.allocated
                );
                if dropped_since_progress > 0 {
                    warn!(
                        "Dropped {} arrivals: all {} workers busy",
                        dropped_since_progress, self.budget.max
                    );
                    dropped_since_progress = 0;
                }
            }
        }

        // The run lasts as long as the stage table even if the last arrival came early.
        let end = start + Duration::from_millis(self.planner.total_duration_ms());
        if !stop.is_stopped() {
            tokio::select! {
                _ = sleep_until(end) => {}
                _ = stop.stopped() => {}
            }
        }

        stats.workers_allocated = pool.allocated;
        info!("Waiting for {} in-flight iterations to complete...", pool.active());
        stats.interrupted = pool.drain(self.graceful_stop).await || stop.is_stopped();
        stats.completed = pool.shared.completed.load(Ordering::SeqCst);
        stats.peak_concurrency = pool.shared.peak.load(Ordering::SeqCst);
        stats.elapsed_ms = start.elapsed().as_millis() as u64;
        stats
    }
}

#[derive(Default)]
struct PoolShared {
    idle: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    completed: AtomicU64,
}

/// Long-lived workers pulling arrival indices off a shared queue. Workers are
/// added lazily up to the cap; an arrival with nobody free is dropped.
struct WorkerPool<I: Iteration> {
    iteration: Arc<I>,
    stop: StopSignal,
    tx: Option<mpsc::Sender<u64>>,
    rx: Arc<Mutex<mpsc::Receiver<u64>>>,
    workers: JoinSet<()>,
    allocated: usize,
    max: usize,
    shared: Arc<PoolShared>,
}

impl<I: Iteration> WorkerPool<I> {
    fn new(iteration: Arc<I>, budget: WorkerBudget, stop: StopSignal) -> Self {
        let (tx, rx) = mpsc::channel(budget.max);
        let mut pool = Self {
            iteration,
            stop,
            tx: Some(tx),
            rx: Arc::new(Mutex::new(rx)),
            workers: JoinSet::new(),
            allocated: 0,
            max: budget.max,
            shared: Arc::new(PoolShared::default()),
        };
        for _ in 0..budget.pre_allocated.min(budget.max) {
            pool.spawn_worker();
            pool.shared.idle.fetch_add(1, Ordering::SeqCst);
        }
        pool
    }

    fn active(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    fn spawn_worker(&mut self) {
        let iteration = self.iteration.clone();
        let stop = self.stop.clone();
        let rx = self.rx.clone();
        let shared = self.shared.clone();

        self.allocated += 1;
        self.workers.spawn(async move {
            loop {
                let next = { rx.lock().await.recv().await };
                if next.is_none() {
                    break;
                }

                let now_active = shared.active.fetch_add(1, Ordering::SeqCst) + 1;
                shared.peak.fetch_max(now_active, Ordering::SeqCst);

                iteration.run(&stop).await;

                shared.active.fetch_sub(1, Ordering::SeqCst);
                shared.completed.fetch_add(1, Ordering::SeqCst);
                shared.idle.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    /// Hand the arrival to an idle worker, growing the pool if allowed.
    /// Returns `false` when the arrival is dropped.
    fn dispatch(&mut self, index: u64) -> bool {
        let Some(tx) = self.tx.clone() else {
            return false;
        };

        let claimed = self
            .shared
            .idle
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !claimed {
            if self.allocated >= self.max {
                return false;
            }
            self.spawn_worker();
        }

        // Queued arrivals never exceed free workers, so the queue has room.
        if tx.try_send(index).is_ok() {
            true
        } else {
            if claimed {
                self.shared.idle.fetch_add(1, Ordering::SeqCst);
            }
            false
        }
    }

    /// Close the queue and wait for workers. Raises the soft stop when the
    /// drain outlasts `graceful`; returns whether that happened.
    async fn drain(&mut self, graceful: Duration) -> bool {
        self.tx = None;

        let workers = &mut self.workers;
        let drained = timeout(graceful, async {
            while workers.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if drained {
            return false;
        }

        warn!(
            "Graceful stop of {}ms elapsed with {} iterations in flight; stopping",
            graceful.as_millis(),
            self.active()
        );
        self.stop.stop();
        while self.workers.join_next().await.is_some() {}
        true
    }
}
