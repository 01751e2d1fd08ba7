use crate::client::{Exchange, SignedClient};
use crate::config::ScenarioConfig;
use crate::error::StepError;
use crate::metrics::{names, MetricsSink};
use crate::scheduler::{Iteration, StopSignal};
use crate::signer::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

pub const INQUIRY_PATH_PREFIX: &str = "/api/qris/inquiry/";
pub const PAYMENT_PATH: &str = "/api/qris/payment";
pub const STATUS_PATH_PREFIX: &str = "/api/transaction/status/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Inquiry,
    Payment,
    Status,
}

impl Step {
    pub fn duration_metric(self) -> &'static str {
        match self {
            Step::Inquiry => names::INQUIRY_DURATION,
            Step::Payment => names::PAYMENT_DURATION,
            Step::Status => names::STATUS_DURATION,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Step::Inquiry => "inquiry",
            Step::Payment => "payment",
            Step::Status => "status",
        };
        f.write_str(s)
    }
}

/// Classification of one step's response.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success,
    /// 409 on payment: optimistic-lock contention on the target, not an error
    ExpectedConflict,
    Failure(StepError),
}

impl Outcome {
    /// Whether this outcome counts toward the error rate.
    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Failure(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AbortReason {
    Failed(StepError),
    Conflict,
    Stopped,
}

/// Flow state machine. Identifiers are bound as the steps that produce them
/// succeed and die with the iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowState {
    Start,
    Inquiring,
    Paying {
        inquiry_id: String,
    },
    CheckingStatus {
        inquiry_id: String,
        transaction_id: String,
    },
    Done {
        inquiry_id: String,
        transaction_id: String,
    },
    Aborted {
        at: Step,
        reason: AbortReason,
    },
}

impl FlowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowState::Done { .. } | FlowState::Aborted { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub step: Step,
    pub outcome: Outcome,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IterationReport {
    /// Always `Done` or `Aborted`
    pub state: FlowState,
    pub steps: Vec<StepRecord>,
    pub elapsed: Duration,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    #[serde(default)]
    status: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct InquiryData {
    #[serde(default)]
    inquiry_id: String,
}

#[derive(Debug, Deserialize)]
struct PaymentData {
    #[serde(default)]
    transaction_id: String,
}

#[derive(Debug, Deserialize)]
struct StatusData {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Serialize)]
struct PaymentRequest<'a> {
    inquiry_id: &'a str,
    user_id: &'a str,
    amount: u64,
    payment_method: &'a str,
    pincode: &'a str,
}

/// Result of classifying the payment response.
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentOutcome {
    Accepted { transaction_id: String },
    Conflict,
    Failed(StepError),
}

fn parse_body<T: DeserializeOwned>(body: &str) -> Result<ApiResponse<T>, StepError> {
    serde_json::from_str(body).map_err(|e| StepError::MalformedBody(e.to_string()))
}

/// Body of a 200 response; transport errors and other statuses are failures.
fn ok_body(exchange: &Exchange) -> Result<&str, StepError> {
    match &exchange.result {
        Err(e) => Err(StepError::Transport(e.clone())),
        Ok(r) if r.status == 200 => Ok(&r.body),
        Ok(r) => Err(StepError::UnexpectedStatus(r.status)),
    }
}

/// Success needs 200, `status == "success"` and a non-empty `data.inquiry_id`.
pub fn classify_inquiry(exchange: &Exchange) -> Result<String, StepError> {
    let parsed: ApiResponse<InquiryData> = parse_body(ok_body(exchange)?)?;
    if parsed.status != "success" {
        return Err(StepError::Rejected(format!("status {:?}", parsed.status)));
    }
    match parsed.data {
        Some(d) if !d.inquiry_id.is_empty() => Ok(d.inquiry_id),
        _ => Err(StepError::MalformedBody("missing data.inquiry_id".to_string())),
    }
}

/// 200 binds the transaction id, 409 is an expected conflict, anything else fails.
pub fn classify_payment(exchange: &Exchange) -> PaymentOutcome {
    if exchange.status() == Some(409) {
        return PaymentOutcome::Conflict;
    }
    let parsed: Result<ApiResponse<PaymentData>, StepError> =
        ok_body(exchange).and_then(parse_body::<PaymentData>);
    match parsed {
        Ok(ApiResponse {
            data: Some(d), ..
        }) if !d.transaction_id.is_empty() => PaymentOutcome::Accepted {
            transaction_id: d.transaction_id,
        },
        Ok(_) => PaymentOutcome::Failed(StepError::MalformedBody(
            "missing data.transaction_id".to_string(),
        )),
        Err(e) => PaymentOutcome::Failed(e),
    }
}

/// Success needs 200 and `data.status == "SUCCESS"`.
pub fn classify_status(exchange: &Exchange) -> Result<(), StepError> {
    let parsed: ApiResponse<StatusData> = parse_body(ok_body(exchange)?)?;
    match parsed.data {
        Some(d) if d.status == "SUCCESS" => Ok(()),
        Some(d) => Err(StepError::Rejected(format!("transaction status {:?}", d.status))),
        None => Err(StepError::MalformedBody("missing data.status".to_string())),
    }
}

/// Runs inquiry -> payment -> status once per arrival.
pub struct FlowEngine {
    client: SignedClient,
    scenario: ScenarioConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl FlowEngine {
    pub fn new(
        client: SignedClient,
        scenario: ScenarioConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            client,
            scenario,
            metrics,
        }
    }

    fn pacing(&self) -> Duration {
        Duration::from_millis(self.scenario.pacing_ms)
    }

    /// One pass through the state machine, without the trailing pacing delay.
    pub async fn run_iteration(&self, stop: &StopSignal) -> IterationReport {
        let start = Instant::now();
        let mut steps = Vec::with_capacity(3);
        let mut state = FlowState::Start;

        while !state.is_terminal() {
            state = match state {
                FlowState::Start => FlowState::Inquiring,

                FlowState::Inquiring => {
                    let path = format!("{}{}", INQUIRY_PATH_PREFIX, self.scenario.qris_payload);
                    let exchange = self.client.call(Method::Get, &path, String::new()).await;
                    match classify_inquiry(&exchange) {
                        Ok(inquiry_id) => {
                            self.record(&mut steps, Step::Inquiry, &exchange, Outcome::Success);
                            FlowState::Paying { inquiry_id }
                        }
                        Err(e) => {
                            let outcome = Outcome::Failure(e.clone());
                            self.record(&mut steps, Step::Inquiry, &exchange, outcome);
                            FlowState::Aborted {
                                at: Step::Inquiry,
                                reason: AbortReason::Failed(e),
                            }
                        }
                    }
                }

                FlowState::Paying { .. } if stop.is_stopped() => FlowState::Aborted {
                    at: Step::Payment,
                    reason: AbortReason::Stopped,
                },

                FlowState::CheckingStatus { .. } if stop.is_stopped() => FlowState::Aborted {
                    at: Step::Status,
                    reason: AbortReason::Stopped,
                },

                FlowState::Paying { inquiry_id } => {
                    let exchange = match self.payment_body(&inquiry_id) {
                        Ok(body) => self.client.call(Method::Post, PAYMENT_PATH, body).await,
                        Err(e) => {
                            return self.finish(start, steps, FlowState::Aborted {
                                at: Step::Payment,
                                reason: AbortReason::Failed(e),
                            })
                        }
                    };
                    match classify_payment(&exchange) {
                        PaymentOutcome::Accepted { transaction_id } => {
                            self.record(&mut steps, Step::Payment, &exchange, Outcome::Success);
                            FlowState::CheckingStatus {
                                inquiry_id,
                                transaction_id,
                            }
                        }
                        PaymentOutcome::Conflict => {
                            self.record(
                                &mut steps,
                                Step::Payment,
                                &exchange,
                                Outcome::ExpectedConflict,
                            );
                            self.metrics.add_counter(names::PAYMENT_CONFLICTS, 1);
                            FlowState::Aborted {
                                at: Step::Payment,
                                reason: AbortReason::Conflict,
                            }
                        }
                        PaymentOutcome::Failed(e) => {
                            let outcome = Outcome::Failure(e.clone());
                            self.record(&mut steps, Step::Payment, &exchange, outcome);
                            FlowState::Aborted {
                                at: Step::Payment,
                                reason: AbortReason::Failed(e),
                            }
                        }
                    }
                }

                FlowState::CheckingStatus {
                    inquiry_id,
                    transaction_id,
                } => {
                    let path = format!("{}{}", STATUS_PATH_PREFIX, transaction_id);
                    let exchange = self.client.call(Method::Get, &path, String::new()).await;
                    match classify_status(&exchange) {
                        Ok(()) => {
                            self.record(&mut steps, Step::Status, &exchange, Outcome::Success);
                            FlowState::Done {
                                inquiry_id,
                                transaction_id,
                            }
                        }
                        Err(e) => {
                            let outcome = Outcome::Failure(e.clone());
                            self.record(&mut steps, Step::Status, &exchange, outcome);
                            FlowState::Aborted {
                                at: Step::Status,
                                reason: AbortReason::Failed(e),
                            }
                        }
                    }
                }

                terminal => terminal,
            };
        }

        self.finish(start, steps, state)
    }

    /// Serialized once; the same string is signed and sent.
    fn payment_body(&self, inquiry_id: &str) -> Result<String, StepError> {
        let request = PaymentRequest {
            inquiry_id,
            user_id: &self.scenario.user_id,
            amount: self.scenario.amount,
            payment_method: &self.scenario.payment_method,
            pincode: &self.scenario.pincode,
        };
        serde_json::to_string(&request).map_err(|e| StepError::MalformedBody(e.to_string()))
    }

    fn record(&self, steps: &mut Vec<StepRecord>, step: Step, exchange: &Exchange, outcome: Outcome) {
        self.metrics.add_duration(step.duration_metric(), exchange.elapsed);
        self.metrics.add_duration(names::HTTP_REQ_DURATION, exchange.elapsed);
        self.metrics.add_counter(names::HTTP_REQS, 1);
        self.metrics.add_rate(names::ERROR_RATE, outcome.is_error());

        if let Outcome::Failure(e) = &outcome {
            debug!(
                "{} {} failed after {}ms: {}",
                exchange.method,
                exchange.path,
                exchange.elapsed.as_millis(),
                e
            );
        }

        steps.push(StepRecord {
            step,
            outcome,
            elapsed: exchange.elapsed,
        });
    }

    fn finish(&self, start: Instant, steps: Vec<StepRecord>, state: FlowState) -> IterationReport {
        let elapsed = start.elapsed();
        self.metrics.add_counter(names::ITERATIONS, 1);
        self.metrics.add_duration(names::ITERATION_DURATION, elapsed);
        IterationReport {
            state,
            steps,
            elapsed,
        }
    }
}

impl Iteration for FlowEngine {
    fn run<'a>(&'a self, stop: &'a StopSignal) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            self.run_iteration(stop).await;
            // Think time bounds how fast one worker can loop, including on errors.
            if !stop.is_stopped() {
                tokio::select! {
                    _ = sleep(self.pacing()) => {}
                    _ = stop.stopped() => {}
                }
            }
        })
    }
}
