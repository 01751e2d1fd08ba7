use crate::config::TargetConfig;
use crate::error::TransportError;
use crate::signer::{sign, Method};
use chrono::{SecondsFormat, Utc};
use serde_json::json;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_CLIENT_KEY: &str = "X-Client-Key";
pub const HEADER_TIMESTAMP: &str = "X-Timestamp";
pub const HEADER_SIGNATURE: &str = "X-Signature";

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    /// Path component as signed, starting with `/`.
    pub path: String,
    pub headers: Vec<(String, String)>,
    /// Exact payload; empty for bodyless requests.
    pub body: String,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

pub type SendFuture<'a> =
    Pin<Box<dyn std::future::Future<Output = Result<HttpResponse, TransportError>> + Send + 'a>>;

/// Trait for the HTTP transport underneath the signed client
pub trait HttpTransport: Send + Sync {
    fn name(&self) -> &'static str;

    fn send<'a>(&'a self, request: HttpRequest) -> SendFuture<'a>;
}

/// One signed round trip. Latency is measured even when the transport fails.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub method: Method,
    pub path: String,
    pub elapsed: Duration,
    pub result: Result<HttpResponse, TransportError>,
}

impl Exchange {
    pub fn status(&self) -> Option<u16> {
        self.result.as_ref().ok().map(|r| r.status)
    }
}

/// Stamps every request with the client key, a fresh timestamp and its HMAC.
#[derive(Clone)]
pub struct SignedClient {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
    client_key: String,
    client_secret: String,
}

impl SignedClient {
    pub fn new(transport: Arc<dyn HttpTransport>, target: &TargetConfig) -> Self {
        Self {
            transport,
            base_url: target.base_url.trim_end_matches('/').to_string(),
            client_key: target.client_key.clone(),
            client_secret: target.client_secret.clone(),
        }
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// ISO-8601 UTC with millisecond precision, e.g. `2024-05-01T10:00:00.000Z`.
    pub fn timestamp_now() -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn signed_headers(
        &self,
        method: Method,
        path: &str,
        timestamp: &str,
        body: &str,
    ) -> Vec<(String, String)> {
        let signature = sign(method, path, timestamp, body, &self.client_secret);
        vec![
            (HEADER_CONTENT_TYPE.to_string(), "application/json".to_string()),
            (HEADER_CLIENT_KEY.to_string(), self.client_key.clone()),
            (HEADER_TIMESTAMP.to_string(), timestamp.to_string()),
            (HEADER_SIGNATURE.to_string(), signature),
        ]
    }

    pub async fn call(&self, method: Method, path: &str, body: String) -> Exchange {
        let timestamp = Self::timestamp_now();
        let headers = self.signed_headers(method, path, &timestamp, &body);
        let request = HttpRequest {
            method,
            url: format!("{}{}", self.base_url, path),
            path: path.to_string(),
            headers,
            body,
        };

        let start = Instant::now();
        let result = self.transport.send(request).await;
        Exchange {
            method,
            path: path.to_string(),
            elapsed: start.elapsed(),
            result,
        }
    }
}

/// reqwest-backed transport
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout_ms: u64) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms.max(1)))
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    fn send<'a>(&'a self, request: HttpRequest) -> SendFuture<'a> {
        Box::pin(async move {
            let mut builder = match request.method {
                Method::Get => self.client.get(&request.url),
                Method::Post => self.client.post(&request.url).body(request.body),
            };
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }

            let response = builder.send().await?;
            let status = response.status().as_u16();
            let body = response.text().await?;
            Ok(HttpResponse { status, body })
        })
    }
}

/// In-process stand-in for the QRIS service (inquiry, payment, status) with
/// a fixed delay. Verifies signatures when constructed with a secret.
pub struct MockTransport {
    delay: Duration,
    secret: Option<String>,
    conflict_every: u64,
    inquiries: AtomicU64,
    payments: AtomicU64,
    status_checks: AtomicU64,
}

impl MockTransport {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            secret: None,
            conflict_every: 0,
            inquiries: AtomicU64::new(0),
            payments: AtomicU64::new(0),
            status_checks: AtomicU64::new(0),
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Answer every `n`th payment with 409. Zero disables conflicts.
    pub fn with_conflict_every(mut self, n: u64) -> Self {
        self.conflict_every = n;
        self
    }

    pub fn inquiries(&self) -> u64 {
        self.inquiries.load(Ordering::Relaxed)
    }

    pub fn payments(&self) -> u64 {
        self.payments.load(Ordering::Relaxed)
    }

    pub fn status_checks(&self) -> u64 {
        self.status_checks.load(Ordering::Relaxed)
    }

    fn authenticate(&self, request: &HttpRequest) -> bool {
        let Some(secret) = &self.secret else {
            return true;
        };
        let (Some(timestamp), Some(signature)) = (
            request.header(HEADER_TIMESTAMP),
            request.header(HEADER_SIGNATURE),
        ) else {
            return false;
        };
        sign(request.method, &request.path, timestamp, &request.body, secret) == signature
    }

    fn respond(&self, request: &HttpRequest) -> HttpResponse {
        if !self.authenticate(request) {
            return error_response(401, "Invalid signature");
        }

        match (request.method, request.path.as_str()) {
            (Method::Get, path) if path.starts_with("/api/qris/inquiry/") => {
                let n = self.inquiries.fetch_add(1, Ordering::Relaxed) + 1;
                ok_response(json!({
                    "merchant_id": "M-0001",
                    "merchant_name": "MIvanStore",
                    "city": "JakartaTimur",
                    "inquiry_id": format!("INQ-{n}"),
                }))
            }
            (Method::Post, "/api/qris/payment") => {
                let n = self.payments.fetch_add(1, Ordering::Relaxed) + 1;
                let parsed: Result<serde_json::Value, _> = serde_json::from_str(&request.body);
                if parsed.is_err() {
                    return error_response(400, "Invalid request body");
                }
                if self.conflict_every > 0 && n % self.conflict_every == 0 {
                    return error_response(409, "optimistic lock conflict");
                }
                ok_response(json!({
                    "status": "PENDING",
                    "transaction_id": format!("TXN-{n}"),
                    "message": "payment accepted",
                }))
            }
            (Method::Get, path) if path.starts_with("/api/transaction/status/") => {
                self.status_checks.fetch_add(1, Ordering::Relaxed);
                let id = path.trim_start_matches("/api/transaction/status/");
                ok_response(json!({
                    "transaction_id": id,
                    "status": "SUCCESS",
                }))
            }
            _ => error_response(404, "not found"),
        }
    }
}

impl HttpTransport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn send<'a>(&'a self, request: HttpRequest) -> SendFuture<'a> {
        Box::pin(async move {
            sleep(self.delay).await;
            Ok(self.respond(&request))
        })
    }
}

fn ok_response(data: serde_json::Value) -> HttpResponse {
    HttpResponse {
        status: 200,
        body: json!({ "status": "success", "data": data }).to_string(),
    }
}

fn error_response(status: u16, errors: &str) -> HttpResponse {
    HttpResponse {
        status,
        body: json!({ "status": "error", "errors": errors }).to_string(),
    }
}
