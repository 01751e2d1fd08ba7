use crate::error::ConfigError;
use crate::metrics::names;
use crate::ramp::RampPlanner;
use crate::thresholds::Threshold;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_BASE_URL: &str = "http://localhost:3000";
pub const DEFAULT_CLIENT_KEY: &str = "MK-9921-X";
pub const DEFAULT_CLIENT_SECRET: &str = "super-secret-key-123";
pub const DEFAULT_QRIS_PAYLOAD: &str = "00020101021126690021ID.CO.BANKMANDIRI.WWW01189360000801299399930211712993999340303UKE51440014ID.CO.QRIS.WWW0215ID10232756067300303UKE5204274153033605802ID5912MIvanStore6015JakartaTimur";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub scenario: ScenarioConfig,
    pub ramp: RampConfig,
    pub target: TargetConfig,
    #[serde(default)]
    pub thresholds: Vec<ThresholdConfig>,
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// The load profile the QRIS service is benchmarked with: warm up to 50/s,
    /// ramp to 1000/s, hold, then ramp down.
    pub fn default_scenario() -> Self {
        let stage = |duration_ms, target| Stage {
            duration_ms,
            target,
        };
        let threshold = |metric: &str, condition: &str| ThresholdConfig {
            metric: metric.to_string(),
            condition: condition.to_string(),
        };

        Self {
            scenario: ScenarioConfig::default(),
            ramp: RampConfig {
                start_rate: 10,
                pre_allocated_workers: 100,
                max_workers: 300,
                graceful_stop_ms: default_graceful_stop_ms(),
                stages: vec![
                    stage(15_000, 50),
                    stage(15_000, 200),
                    stage(30_000, 500),
                    stage(60_000, 1000),
                    stage(60_000, 1000),
                    stage(15_000, 0),
                ],
            },
            target: TargetConfig::default(),
            thresholds: vec![
                threshold(names::HTTP_REQ_DURATION, "p(95)<3000"),
                threshold(names::ERROR_RATE, "rate<0.30"),
                threshold(names::INQUIRY_DURATION, "p(95)<2000"),
                threshold(names::PAYMENT_DURATION, "p(95)<3000"),
                threshold(names::STATUS_DURATION, "p(95)<2000"),
            ],
            worker: WorkerConfig::default(),
        }
    }

    /// Check every invariant the run relies on. Thresholds are parsed here so
    /// that a malformed expression aborts before the first arrival.
    pub fn validate(&self) -> Result<Vec<Threshold>, ConfigError> {
        self.ramp.validate()?;
        self.target.validate()?;
        self.scenario.validate()?;

        self.thresholds
            .iter()
            .map(|t| Threshold::parse(&t.metric, &t.condition))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Encoded QRIS string identifying the merchant being paid
    #[serde(default = "default_qris_payload")]
    pub qris_payload: String,
    #[serde(default = "default_user_id")]
    pub user_id: String,
    /// Payment amount; kept minimal to avoid exhausting the test balance
    #[serde(default = "default_amount")]
    pub amount: u64,
    #[serde(default = "default_payment_method")]
    pub payment_method: String,
    #[serde(default = "default_pincode")]
    pub pincode: String,
    /// Think time after every finished iteration in milliseconds
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,
}

impl ScenarioConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.qris_payload.is_empty() {
            return Err(ConfigError::MissingPayload);
        }
        // The payload is signed as part of the path, so it must reach the wire unencoded.
        if let Some(c) = self.qris_payload.chars().find(|&c| !is_path_safe(c)) {
            return Err(ConfigError::UnsafePayload(c));
        }
        if self.amount == 0 {
            return Err(ConfigError::ZeroAmount);
        }
        Ok(())
    }
}

/// Unreserved and sub-delimiter characters of a URL path segment.
fn is_path_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-._~!$&'()*+,;=:@".contains(c)
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            qris_payload: default_qris_payload(),
            user_id: default_user_id(),
            amount: default_amount(),
            payment_method: default_payment_method(),
            pincode: default_pincode(),
            pacing_ms: default_pacing_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    /// Length of the ramp segment in milliseconds
    pub duration_ms: u64,
    /// Arrival rate (iterations per second) reached at the end of the segment
    pub target: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RampConfig {
    /// Rate the first stage ramps from
    #[serde(default)]
    pub start_rate: u64,
    pub pre_allocated_workers: usize,
    pub max_workers: usize,
    /// How long in-flight iterations may drain before the soft stop is raised
    #[serde(default = "default_graceful_stop_ms")]
    pub graceful_stop_ms: u64,
    pub stages: Vec<Stage>,
}

impl RampConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.stages.is_empty() {
            return Err(ConfigError::EmptyStages);
        }

        let total_ms: u64 = self.stages.iter().map(|s| s.duration_ms).sum();
        let peak_rate = self
            .stages
            .iter()
            .map(|s| s.target)
            .chain(std::iter::once(self.start_rate))
            .max()
            .unwrap_or(0);
        let arrivals = RampPlanner::new(self.clone()).arrival_count();
        if total_ms == 0 || peak_rate == 0 || arrivals == 0 {
            return Err(ConfigError::NoArrivals {
                total_ms,
                peak_rate,
            });
        }

        if self.max_workers == 0 || self.pre_allocated_workers > self.max_workers {
            return Err(ConfigError::InvalidWorkerBounds {
                pre_allocated: self.pre_allocated_workers,
                max: self.max_workers,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub base_url: String,
    pub client_key: String,
    pub client_secret: String,
    /// Request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl TargetConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let url = url::Url::parse(&self.base_url).map_err(|e| ConfigError::InvalidBaseUrl {
            url: self.base_url.clone(),
            reason: e.to_string(),
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::InvalidBaseUrl {
                url: self.base_url.clone(),
                reason: format!("unsupported scheme {}", url.scheme()),
            });
        }
        // Paths are appended verbatim and signed, so the base must not carry its own.
        if url.path() != "/" || url.query().is_some() || url.fragment().is_some() {
            return Err(ConfigError::InvalidBaseUrl {
                url: self.base_url.clone(),
                reason: "base URL must not include a path, query or fragment".to_string(),
            });
        }

        if self.client_key.is_empty() {
            return Err(ConfigError::MissingClientKey);
        }
        if self.client_secret.is_empty() {
            return Err(ConfigError::MissingSecret);
        }
        Ok(())
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            client_key: DEFAULT_CLIENT_KEY.to_string(),
            client_secret: DEFAULT_CLIENT_SECRET.to_string(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub metric: String,
    /// Expression such as `p(95)<3000` or `rate<0.30`
    pub condition: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker identifier for logs and result files
    #[serde(default = "default_worker_id")]
    pub id: String,
    #[serde(default = "default_results_dir")]
    pub results_dir: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            id: default_worker_id(),
            results_dir: default_results_dir(),
        }
    }
}

fn default_qris_payload() -> String {
    DEFAULT_QRIS_PAYLOAD.to_string()
}

fn default_user_id() -> String {
    "user_123".to_string()
}

fn default_amount() -> u64 {
    1
}

fn default_payment_method() -> String {
    "balance".to_string()
}

fn default_pincode() -> String {
    "123456".to_string()
}

fn default_pacing_ms() -> u64 {
    100
}

fn default_graceful_stop_ms() -> u64 {
    30_000
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_worker_id() -> String {
    "worker-0".to_string()
}

fn default_results_dir() -> String {
    "results".to_string()
}
