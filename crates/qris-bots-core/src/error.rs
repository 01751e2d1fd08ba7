use thiserror::Error;

/// Invalid run configuration. Always fatal, raised before any iteration is scheduled.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("ramp.stages must contain at least one stage")]
    EmptyStages,

    #[error("ramp stages produce no arrivals (total duration {total_ms}ms, peak rate {peak_rate}/s)")]
    NoArrivals { total_ms: u64, peak_rate: u64 },

    #[error("target.client_key must not be empty")]
    MissingClientKey,

    #[error("target.client_secret must not be empty")]
    MissingSecret,

    #[error("invalid target.base_url {url}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("invalid worker bounds: pre_allocated_workers={pre_allocated} max_workers={max}")]
    InvalidWorkerBounds { pre_allocated: usize, max: usize },

    #[error("scenario.amount must be greater than zero")]
    ZeroAmount,

    #[error("scenario.qris_payload must not be empty")]
    MissingPayload,

    #[error("scenario.qris_payload contains {0:?}, which is not sent verbatim in a URL path")]
    UnsafePayload(char),

    #[error("threshold on {metric} has invalid condition {condition:?}: {reason}")]
    InvalidThreshold {
        metric: String,
        condition: String,
        reason: String,
    },

    #[error("threshold references unknown metric {0}")]
    UnknownMetric(String),
}

/// Network-level failure reported by a transport.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else {
            TransportError::Request(e.to_string())
        }
    }
}

/// Why a flow step was classified as a failure.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StepError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("unexpected status {0}")]
    UnexpectedStatus(u16),

    #[error("malformed response body: {0}")]
    MalformedBody(String),

    #[error("rejected by target: {0}")]
    Rejected(String),
}
