use crate::client::{HttpTransport, SignedClient};
use crate::config::Config;
use crate::error::ConfigError;
use crate::flow::FlowEngine;
use crate::metrics::MetricsRegistry;
use crate::report::RunReport;
use crate::scheduler::{ArrivalScheduler, StopSignal};
use crate::thresholds::{Threshold, ThresholdReport};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A validated run: scheduler, flow engine and thresholds wired together.
pub struct LoadTest {
    config: Config,
    thresholds: Vec<Threshold>,
    transport: Arc<dyn HttpTransport>,
    progress_every: Duration,
}

impl LoadTest {
    /// Fails with the first configuration problem; nothing is scheduled then.
    pub fn new(config: Config, transport: Arc<dyn HttpTransport>) -> Result<Self, ConfigError> {
        let thresholds = config.validate()?;
        Ok(Self {
            config,
            thresholds,
            transport,
            progress_every: Duration::from_secs(1),
        })
    }

    pub fn with_progress_every(mut self, every: Duration) -> Self {
        self.progress_every = every;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn run(&self, stop: StopSignal) -> RunReport {
        let started_at = chrono::Utc::now();
        let metrics = Arc::new(MetricsRegistry::new());

        let client = SignedClient::new(self.transport.clone(), &self.config.target);
        info!(
            "Worker '{}' targeting {} via {} transport",
            self.config.worker.id,
            self.config.target.base_url,
            client.transport_name()
        );
        let engine = Arc::new(FlowEngine::new(
            client,
            self.config.scenario.clone(),
            metrics.clone(),
        ));

        let scheduler = ArrivalScheduler::new(self.config.ramp.clone())
            .with_progress_every(self.progress_every);
        let stats = scheduler.run(engine, metrics.clone(), stop).await;

        let snapshot = metrics.snapshot();
        let verdict = ThresholdReport::evaluate(&self.thresholds, &snapshot);
        for violation in verdict.violations() {
            warn!("Threshold crossed: {}", violation);
        }

        RunReport::new(
            self.config.worker.id.clone(),
            self.transport.name(),
            started_at,
            stats,
            &snapshot,
            verdict,
        )
    }
}
