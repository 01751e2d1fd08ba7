pub mod client;
pub mod config;
pub mod error;
pub mod flow;
pub mod metrics;
pub mod ramp;
pub mod report;
pub mod runner;
pub mod scheduler;
pub mod signer;
pub mod thresholds;

pub use client::*;
pub use config::*;
pub use error::*;
pub use flow::*;
pub use metrics::{
    names, Aggregate, MetricKind, MetricsRegistry, MetricsSink, MetricsSnapshot, SeriesSummary,
};
pub use ramp::*;
pub use report::*;
pub use runner::*;
pub use scheduler::*;
pub use signer::*;
pub use thresholds::*;
