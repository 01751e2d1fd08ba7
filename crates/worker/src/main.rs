use anyhow::{Context, Result};
use clap::Parser;
use qris_bots_core::{
    Config, HttpTransport, LoadTest, MockTransport, RampPlanner, ReqwestTransport, StopSignal,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Exit status when the run finished but a threshold was crossed.
const THRESHOLDS_FAILED_EXIT: i32 = 99;

#[derive(Parser, Debug)]
#[command(name = "worker")]
#[command(about = "QRIS load test worker - drives inquiry, payment and status at a target arrival rate")]
struct Args {
    /// Path to configuration file; the built-in scenario is used when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Transport mode: mock or http
    #[arg(long, default_value = "mock")]
    mode: String,

    /// Worker ID (overrides config)
    #[arg(long)]
    worker_id: Option<String>,

    /// Target base URL (overrides config)
    #[arg(long, env = "BASE_URL")]
    base_url: Option<String>,

    /// Client key sent as X-Client-Key (overrides config)
    #[arg(long, env = "CLIENT_KEY")]
    client_key: Option<String>,

    /// Shared HMAC secret (overrides config)
    #[arg(long, env = "CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,

    /// Simulated latency of the mock transport in milliseconds
    #[arg(long, default_value = "5")]
    mock_delay_ms: u64,

    /// Answer every Nth mock payment with 409 (0 disables)
    #[arg(long, default_value = "0")]
    mock_conflict_every: u64,

    /// Print progress every N milliseconds
    #[arg(long, default_value = "1000")]
    print_every_ms: u64,

    /// Only print the ramp schedule without running
    #[arg(long)]
    ramp_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => Config::default_scenario(),
    };
    apply_overrides(&mut config, &args);

    print_ramp_schedule(&RampPlanner::new(config.ramp.clone()));
    if args.ramp_only {
        return Ok(());
    }

    let transport: Arc<dyn HttpTransport> = match args.mode.as_str() {
        "mock" => Arc::new(
            MockTransport::new(args.mock_delay_ms)
                .with_secret(config.target.client_secret.clone())
                .with_conflict_every(args.mock_conflict_every),
        ),
        "http" => Arc::new(
            ReqwestTransport::new(config.target.timeout_ms)
                .context("Failed to create HTTP transport")?,
        ),
        _ => anyhow::bail!("Invalid mode: {}, must be 'mock' or 'http'", args.mode),
    };

    let results_dir = config.worker.results_dir.clone();
    let load_test = LoadTest::new(config, transport)
        .context("Invalid configuration")?
        .with_progress_every(Duration::from_millis(args.print_every_ms));

    info!(
        "Starting worker '{}' in {} mode",
        load_test.config().worker.id,
        args.mode
    );
    info!("Payment user: {}", load_test.config().scenario.user_id);
    info!("Payment amount: {}", load_test.config().scenario.amount);

    let stop = StopSignal::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping after in-flight requests");
                stop.stop();
            }
        });
    }

    let report = load_test.run(stop).await;

    let output_path = report.write_to(&results_dir)?;
    info!("Results written to {}", output_path.display());
    report.print_summary();

    if !report.passed {
        let failed: Vec<String> = report
            .violations()
            .map(|t| format!("{} {}", t.metric, t.condition))
            .collect();
        warn!("Thresholds crossed: {}", failed.join(", "));
        std::process::exit(THRESHOLDS_FAILED_EXIT);
    }

    Ok(())
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(worker_id) = &args.worker_id {
        config.worker.id = worker_id.clone();
    }
    if let Some(base_url) = &args.base_url {
        config.target.base_url = base_url.clone();
    }
    if let Some(client_key) = &args.client_key {
        config.target.client_key = client_key.clone();
    }
    if let Some(client_secret) = &args.client_secret {
        config.target.client_secret = client_secret.clone();
    }
}

fn print_ramp_schedule(planner: &RampPlanner) {
    println!("\n=== Ramp Schedule ===");
    println!("Total duration: {}ms", planner.total_duration_ms());
    println!("Planned arrivals: {}", planner.arrival_count());
    println!();

    for w in planner.windows() {
        println!(
            "Stage {}: {:.0} -> {:.0}/s over {}ms",
            w.stage_idx,
            w.from_rate,
            w.to_rate,
            w.end_ms - w.start_ms
        );
    }
    println!();
}
