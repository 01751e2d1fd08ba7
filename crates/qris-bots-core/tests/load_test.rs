use qris_bots_core::{
    names, Config, ConfigError, LoadTest, MockTransport, SeriesSummary, Stage, StopSignal,
    ThresholdConfig,
};
use std::sync::Arc;
use std::time::Duration;

fn short_config() -> Config {
    let mut config = Config::default_scenario();
    config.ramp.start_rate = 20;
    config.ramp.pre_allocated_workers = 5;
    config.ramp.max_workers = 50;
    config.ramp.stages = vec![Stage {
        duration_ms: 5_000,
        target: 20,
    }];
    config.worker.id = "it-worker".to_string();
    config
}

#[tokio::test(start_paused = true)]
async fn test_full_run_against_mock_service() {
    let mock = Arc::new(
        MockTransport::new(10)
            .with_secret(qris_bots_core::DEFAULT_CLIENT_SECRET)
            .with_conflict_every(4),
    );
    let load_test = LoadTest::new(short_config(), mock.clone())
        .unwrap()
        .with_progress_every(Duration::from_millis(500));

    let report = load_test.run(StopSignal::new()).await;

    assert_eq!(report.scheduler.scheduled, 100);
    assert_eq!(report.scheduler.started, 100);
    assert_eq!(report.scheduler.dropped, 0);
    assert_eq!(report.scheduler.completed, 100);
    assert_eq!(report.transport, "mock");
    assert_eq!(report.worker_id, "it-worker");

    assert_eq!(mock.inquiries(), 100);
    assert_eq!(mock.payments(), 100);
    assert_eq!(mock.status_checks(), 75);

    // Conflicts are expected and never count as errors.
    match &report.metrics[names::ERROR_RATE] {
        SeriesSummary::Rate { rate, passes, fails } => {
            assert_eq!(*rate, 0.0);
            assert_eq!(*passes, 0);
            assert_eq!(*fails, 275);
        }
        other => panic!("unexpected {other:?}"),
    }
    match &report.metrics[names::PAYMENT_CONFLICTS] {
        SeriesSummary::Counter { count, .. } => assert_eq!(*count, 25),
        other => panic!("unexpected {other:?}"),
    }
    match &report.metrics[names::STATUS_DURATION] {
        SeriesSummary::Trend { count, p95, .. } => {
            assert_eq!(*count, 75);
            assert!(*p95 >= 10.0);
        }
        other => panic!("unexpected {other:?}"),
    }

    assert!(report.passed, "{:?}", report.thresholds);
    assert_eq!(report.thresholds.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_bad_signatures_fail_error_rate_threshold() {
    let mock = Arc::new(MockTransport::new(1).with_secret("rotated-secret"));
    let load_test = LoadTest::new(short_config(), mock.clone()).unwrap();

    let report = load_test.run(StopSignal::new()).await;

    assert_eq!(mock.inquiries(), 0);
    assert_eq!(mock.payments(), 0);
    assert!(!report.passed);
    let failed: Vec<_> = report.violations().map(|t| t.metric.as_str()).collect();
    assert_eq!(failed, vec![names::ERROR_RATE]);
}

#[tokio::test(start_paused = true)]
async fn test_latency_threshold_violation_is_reported() {
    let mut config = short_config();
    config.thresholds = vec![ThresholdConfig {
        metric: names::INQUIRY_DURATION.to_string(),
        condition: "p(95)<50".to_string(),
    }];
    let mock = Arc::new(MockTransport::new(200));
    let report = LoadTest::new(config, mock)
        .unwrap()
        .run(StopSignal::new())
        .await;

    assert!(!report.passed);
    assert_eq!(report.thresholds[0].metric, names::INQUIRY_DURATION);
    assert!(report.thresholds[0].observed >= 200.0);
}

#[test]
fn test_configuration_error_aborts_before_scheduling() {
    let mut config = short_config();
    config.target.client_secret.clear();
    let mock = Arc::new(MockTransport::new(0));

    let err = LoadTest::new(config, mock.clone()).err();
    assert_eq!(err, Some(ConfigError::MissingSecret));
    assert_eq!(mock.inquiries(), 0);
}

#[test]
fn test_stage_table_without_arrivals_is_rejected() {
    let mut config = short_config();
    config.ramp.start_rate = 10;
    config.ramp.stages = vec![
        Stage {
            duration_ms: 0,
            target: 0,
        },
        Stage {
            duration_ms: 1_000,
            target: 0,
        },
    ];
    let mock = Arc::new(MockTransport::new(0));

    let err = LoadTest::new(config, mock.clone()).err();
    assert!(matches!(err, Some(ConfigError::NoArrivals { .. })), "{err:?}");
    assert_eq!(mock.inquiries(), 0);
}
