use crate::error::ConfigError;
use crate::metrics::{names, Aggregate, MetricsSnapshot};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    fn holds(self, observed: f64, bound: f64) -> bool {
        match self {
            Comparison::Lt => observed < bound,
            Comparison::Le => observed <= bound,
            Comparison::Gt => observed > bound,
            Comparison::Ge => observed >= bound,
            Comparison::Eq => observed == bound,
            Comparison::Ne => observed != bound,
        }
    }
}

/// A pass/fail predicate over one aggregated series, e.g. `p(95)<3000`.
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub metric: String,
    pub condition: String,
    pub aggregate: Aggregate,
    pub comparison: Comparison,
    pub bound: f64,
}

impl Threshold {
    pub fn parse(metric: &str, condition: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidThreshold {
            metric: metric.to_string(),
            condition: condition.to_string(),
            reason: reason.to_string(),
        };

        let kind = names::kind_of(metric)
            .ok_or_else(|| ConfigError::UnknownMetric(metric.to_string()))?;

        let compact: String = condition.chars().filter(|c| !c.is_whitespace()).collect();
        let op_at = compact
            .find(|c: char| matches!(c, '<' | '>' | '=' | '!'))
            .ok_or_else(|| invalid("missing comparison operator"))?;
        let (lhs, rest) = compact.split_at(op_at);

        let (comparison, rhs) = [
            ("<=", Comparison::Le),
            (">=", Comparison::Ge),
            ("==", Comparison::Eq),
            ("!=", Comparison::Ne),
            ("<", Comparison::Lt),
            (">", Comparison::Gt),
        ]
        .iter()
        .find_map(|(tok, cmp)| rest.strip_prefix(tok).map(|rhs| (*cmp, rhs)))
        .ok_or_else(|| invalid("unknown comparison operator"))?;

        let bound: f64 = rhs
            .parse()
            .map_err(|_| invalid("right-hand side is not a number"))?;
        if !bound.is_finite() {
            return Err(invalid("right-hand side is not finite"));
        }

        let aggregate = parse_aggregate(lhs).ok_or_else(|| invalid("unknown aggregate"))?;
        if !aggregate.applies_to(kind) {
            return Err(invalid(&format!("aggregate not supported for a {kind:?} metric")));
        }

        Ok(Self {
            metric: metric.to_string(),
            condition: condition.to_string(),
            aggregate,
            comparison,
            bound,
        })
    }

    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> ThresholdResult {
        let observed = snapshot.aggregate(&self.metric, self.aggregate);
        ThresholdResult {
            metric: self.metric.clone(),
            condition: self.condition.clone(),
            observed,
            passed: self.comparison.holds(observed, self.bound),
        }
    }
}

fn parse_aggregate(lhs: &str) -> Option<Aggregate> {
    match lhs {
        "avg" => Some(Aggregate::Avg),
        "min" => Some(Aggregate::Min),
        "max" => Some(Aggregate::Max),
        "med" => Some(Aggregate::Med),
        "rate" => Some(Aggregate::Rate),
        "count" => Some(Aggregate::Count),
        _ => {
            let p: f64 = lhs.strip_prefix("p(")?.strip_suffix(')')?.parse().ok()?;
            (0.0..=100.0).contains(&p).then_some(Aggregate::Percentile(p))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub condition: String,
    pub observed: f64,
    pub passed: bool,
}

impl fmt::Display for ThresholdResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} (observed {:.3})",
            if self.passed { "PASS" } else { "FAIL" },
            self.metric,
            self.condition,
            self.observed
        )
    }
}

/// Outcome of every threshold after the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdReport {
    pub passed: bool,
    pub results: Vec<ThresholdResult>,
}

impl ThresholdReport {
    pub fn evaluate(thresholds: &[Threshold], snapshot: &MetricsSnapshot) -> Self {
        let results: Vec<ThresholdResult> =
            thresholds.iter().map(|t| t.evaluate(snapshot)).collect();
        Self {
            passed: results.iter().all(|r| r.passed),
            results,
        }
    }

    pub fn violations(&self) -> impl Iterator<Item = &ThresholdResult> {
        self.results.iter().filter(|r| !r.passed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{MetricsRegistry, MetricsSink};

    #[test]
    fn test_parse_expressions() {
        let t = Threshold::parse("http_req_duration", "p(95)<3000").unwrap();
        assert_eq!(t.aggregate, Aggregate::Percentile(95.0));
        assert_eq!(t.comparison, Comparison::Lt);
        assert_eq!(t.bound, 3000.0);

        let t = Threshold::parse("error_rate", " rate < 0.30 ").unwrap();
        assert_eq!(t.aggregate, Aggregate::Rate);
        assert_eq!(t.bound, 0.30);

        let t = Threshold::parse("inquiry_duration", "p(99.9)<=150").unwrap();
        assert_eq!(t.aggregate, Aggregate::Percentile(99.9));
        assert_eq!(t.comparison, Comparison::Le);

        let t = Threshold::parse("http_reqs", "count>=1").unwrap();
        assert_eq!(t.aggregate, Aggregate::Count);
        assert_eq!(t.comparison, Comparison::Ge);

        let t = Threshold::parse("status_duration", "med!=0").unwrap();
        assert_eq!(t.aggregate, Aggregate::Med);
        assert_eq!(t.comparison, Comparison::Ne);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for cond in ["p(95)", "p(95)<abc", "p(101)<1", "q(95)<1", "p(95)=>1", "avg<inf"] {
            assert!(
                matches!(
                    Threshold::parse("http_req_duration", cond),
                    Err(ConfigError::InvalidThreshold { .. })
                ),
                "{cond} should be rejected"
            );
        }
        assert!(matches!(
            Threshold::parse("error_rate", "avg<1"),
            Err(ConfigError::InvalidThreshold { .. })
        ));
        assert_eq!(
            Threshold::parse("latency", "avg<1").unwrap_err(),
            ConfigError::UnknownMetric("latency".to_string())
        );
    }

    #[test]
    fn test_p95_above_threshold_fails() {
        let registry = MetricsRegistry::new();
        // 90 fast samples, 10 slow: p95 lands among the slow ones
        for _ in 0..90 {
            registry.add_trend(names::INQUIRY_DURATION, 100.0);
        }
        for _ in 0..10 {
            registry.add_trend(names::INQUIRY_DURATION, 5000.0);
        }
        let threshold = Threshold::parse(names::INQUIRY_DURATION, "p(95)<2000").unwrap();

        let report = ThresholdReport::evaluate(&[threshold], &registry.snapshot());
        assert!(!report.passed);
        assert_eq!(report.results[0].observed, 5000.0);
        assert_eq!(report.violations().count(), 1);
    }

    #[test]
    fn test_series_below_threshold_passes() {
        let registry = MetricsRegistry::new();
        for v in 0..100 {
            registry.add_trend(names::INQUIRY_DURATION, v as f64);
        }
        registry.add_rate(names::ERROR_RATE, false);
        registry.add_rate(names::ERROR_RATE, true);
        registry.add_rate(names::ERROR_RATE, false);
        registry.add_rate(names::ERROR_RATE, false);

        let thresholds = vec![
            Threshold::parse(names::INQUIRY_DURATION, "p(95)<2000").unwrap(),
            Threshold::parse(names::ERROR_RATE, "rate<0.30").unwrap(),
        ];
        let report = ThresholdReport::evaluate(&thresholds, &registry.snapshot());
        assert!(report.passed, "{:?}", report);
        assert_eq!(report.results[1].observed, 0.25);
    }

    #[test]
    fn test_error_rate_over_limit_fails() {
        let registry = MetricsRegistry::new();
        registry.add_rate(names::ERROR_RATE, true);
        registry.add_rate(names::ERROR_RATE, false);
        let t = Threshold::parse(names::ERROR_RATE, "rate<0.30").unwrap();
        let result = t.evaluate(&registry.snapshot());
        assert!(!result.passed);
        assert!(result.to_string().starts_with("FAIL error_rate"));
    }

    #[test]
    fn test_empty_series_aggregates_to_zero() {
        let registry = MetricsRegistry::new();
        let t = Threshold::parse(names::STATUS_DURATION, "p(95)<2000").unwrap();
        let result = t.evaluate(&registry.snapshot());
        assert!(result.passed);
        assert_eq!(result.observed, 0.0);
    }
}
