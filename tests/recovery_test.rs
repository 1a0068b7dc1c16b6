//! Integration tests for the error recovery manager

use multimodal_capture::core::{SensorKind, TimeBase};
use multimodal_capture::recovery::{
    health_check, ErrorKind, ErrorRecoveryManager, RecoverableError, RecoveryEvent,
    RecoveryResult, RecoveryStatus, RecoveryStrategy, ReportOutcome, SharedRecoveryManager,
    Severity,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn error_for(service_id: &str, kind: ErrorKind) -> RecoverableError {
    RecoverableError::new(
        kind,
        service_id,
        "injected fault",
        TimeBase::system().now(),
    )
}

fn record_events(manager: &SharedRecoveryManager) -> Arc<Mutex<Vec<RecoveryEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    manager.subscribe(move |event| sink.lock().push(event.clone()));
    events
}

fn count(events: &Mutex<Vec<RecoveryEvent>>, pred: impl Fn(&RecoveryEvent) -> bool) -> usize {
    events.lock().iter().filter(|e| pred(e)).count()
}

/// Strategy whose action fails `failures` times, then recovers.
fn flaky_strategy(failures: u32, max_retries: u32, calls: Arc<AtomicU32>) -> RecoveryStrategy {
    RecoveryStrategy::new(
        "flaky_reconnect",
        max_retries,
        Duration::from_millis(10),
        move |_ctx| {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < failures {
                    RecoveryResult::Retry("device still busy".to_string())
                } else {
                    RecoveryResult::Recovered
                }
            }
        },
    )
}

#[tokio::test]
async fn test_fails_twice_then_succeeds() {
    let calls = Arc::new(AtomicU32::new(0));
    let manager = ErrorRecoveryManager::builder(TimeBase::shared())
        .with_strategy(
            ErrorKind::DeviceUnresponsive,
            flaky_strategy(2, 3, Arc::clone(&calls)),
        )
        .build();
    let events = record_events(&manager);

    let outcome = match manager.report_error(error_for("gsr", ErrorKind::DeviceUnresponsive)) {
        ReportOutcome::Recovering(handle) => handle.wait().await,
        other => panic!("expected recovery to start, got {other:?}"),
    };

    assert!(outcome.succeeded());
    assert_eq!(outcome.attempts, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        count(&events, |e| matches!(e, RecoveryEvent::RecoverySucceeded { .. })),
        1
    );
    assert_eq!(
        count(&events, |e| matches!(e, RecoveryEvent::RecoveryFailed { .. })),
        0
    );
    assert_eq!(
        count(&events, |e| matches!(e, RecoveryEvent::AttemptFailed { .. })),
        2
    );
    assert!(manager.active_recoveries().is_empty());
}

#[tokio::test]
async fn test_exhausted_retries_fail_once() {
    let calls = Arc::new(AtomicU32::new(0));
    let manager = ErrorRecoveryManager::builder(TimeBase::shared())
        .with_strategy(
            ErrorKind::TransportConnectionLost,
            flaky_strategy(u32::MAX, 2, Arc::clone(&calls)),
        )
        .build();
    let events = record_events(&manager);

    let ReportOutcome::Recovering(handle) =
        manager.report_error(error_for("bt", ErrorKind::TransportConnectionLost))
    else {
        panic!("expected recovery to start");
    };
    let outcome = handle.wait().await;

    assert!(matches!(outcome.status, RecoveryStatus::Failed(_)));
    assert_eq!(outcome.attempts, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        count(&events, |e| matches!(e, RecoveryEvent::RecoveryFailed { .. })),
        1
    );
}

async fn crashing_reset() -> RecoveryResult {
    panic!("reset handler crashed")
}

#[tokio::test]
async fn test_panicking_action_fails_the_recovery() {
    let manager = ErrorRecoveryManager::builder(TimeBase::shared())
        .with_strategy(
            ErrorKind::DeviceUnresponsive,
            RecoveryStrategy::new(
                "crashing_reset",
                3,
                Duration::from_millis(10),
                |_ctx| crashing_reset(),
            ),
        )
        .build();
    let events = record_events(&manager);

    let ReportOutcome::Recovering(handle) =
        manager.report_error(error_for("gsr", ErrorKind::DeviceUnresponsive))
    else {
        panic!("expected recovery to start");
    };
    let outcome = handle.wait().await;

    match &outcome.status {
        RecoveryStatus::Failed(message) => assert!(message.contains("reset handler crashed")),
        other => panic!("expected a failed recovery, got {other:?}"),
    }
    assert_eq!(outcome.attempts, 1);
    assert_eq!(
        count(&events, |e| matches!(e, RecoveryEvent::RecoveryFailed { .. })),
        1
    );
    assert!(manager.active_recoveries().is_empty());
}

#[tokio::test]
async fn test_concurrent_reports_run_one_loop() {
    let calls = Arc::new(AtomicU32::new(0));
    let action_calls = Arc::clone(&calls);
    let strategy = RecoveryStrategy::new(
        "slow_reconnect",
        1,
        Duration::ZERO,
        move |_ctx| {
            let calls = Arc::clone(&action_calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                RecoveryResult::Recovered
            }
        },
    );
    let kind = ErrorKind::SensorDisconnection(SensorKind::Biosignal);
    let manager = ErrorRecoveryManager::builder(TimeBase::shared())
        .with_strategy(kind, strategy)
        .build();
    let events = record_events(&manager);

    let reports = (0..2).map(|_| {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.report_error(error_for("recorder.biosignal", kind)) })
    });
    let outcomes: Vec<ReportOutcome> = futures::future::join_all(reports)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let mut handles = Vec::new();
    let mut deduplicated = 0;
    for outcome in outcomes {
        match outcome {
            ReportOutcome::Recovering(handle) => handles.push(handle),
            ReportOutcome::Deduplicated => deduplicated += 1,
            ReportOutcome::Surfaced(reason) => panic!("unexpected surfacing: {reason}"),
        }
    }
    assert_eq!(handles.len(), 1);
    assert_eq!(deduplicated, 1);
    for handle in handles {
        assert!(handle.wait().await.succeeded());
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        count(&events, |e| matches!(e, RecoveryEvent::RecoveryStarted { .. })),
        1
    );
}

#[tokio::test]
async fn test_same_kind_on_different_services_is_not_deduplicated() {
    let calls = Arc::new(AtomicU32::new(0));
    let manager = ErrorRecoveryManager::builder(TimeBase::shared())
        .with_strategy(
            ErrorKind::DeviceUnresponsive,
            flaky_strategy(0, 1, Arc::clone(&calls)),
        )
        .build();

    let a = manager.report_error(error_for("recorder.thermal", ErrorKind::DeviceUnresponsive));
    let b = manager.report_error(error_for("recorder.rgb", ErrorKind::DeviceUnresponsive));
    for outcome in [a, b] {
        let ReportOutcome::Recovering(handle) = outcome else {
            panic!("expected both reports to recover");
        };
        assert!(handle.wait().await.succeeded());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_fatal_and_unregistered_errors_surface() {
    let manager = ErrorRecoveryManager::with_defaults(TimeBase::shared());
    let events = record_events(&manager);

    let fatal = error_for("recorder.rgb", ErrorKind::DeviceUnresponsive).with_severity(Severity::Fatal);
    assert!(manager.report_error(fatal).is_surfaced());

    // Stop failures have no registered strategy.
    let stop_failure = error_for(
        "recorder.thermal",
        ErrorKind::RecordingStopFailure(SensorKind::Thermal),
    );
    assert!(manager.report_error(stop_failure).is_surfaced());

    assert_eq!(
        count(&events, |e| matches!(e, RecoveryEvent::Unresolved { .. })),
        2
    );
    assert_eq!(
        count(&events, |e| matches!(e, RecoveryEvent::RecoveryStarted { .. })),
        0
    );
}

#[tokio::test]
async fn test_default_strategy_recovers_when_service_is_healthy_again() {
    let manager = ErrorRecoveryManager::builder(TimeBase::shared())
        .with_default_strategies()
        .health_check_interval(Duration::from_secs(60))
        .build();
    let probes = Arc::new(AtomicU32::new(0));
    let p = Arc::clone(&probes);
    // Unhealthy on the first probe, healthy afterwards.
    manager.register_health_check(
        "recorder.biosignal",
        health_check(move || {
            let p = Arc::clone(&p);
            async move { p.fetch_add(1, Ordering::SeqCst) >= 1 }
        }),
    );

    let error = error_for(
        "recorder.biosignal",
        ErrorKind::DataStreamFailure(SensorKind::Biosignal),
    );
    let ReportOutcome::Recovering(handle) = manager.report_error(error) else {
        panic!("expected recovery to start");
    };
    let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .unwrap();
    assert!(outcome.succeeded());
    assert_eq!(outcome.attempts, 2);
    manager.shutdown();
}

#[tokio::test]
async fn test_shutdown_cancels_in_flight_recovery() {
    let calls = Arc::new(AtomicU32::new(0));
    let strategy = RecoveryStrategy::new(
        "never_recovers",
        10,
        Duration::from_secs(30),
        {
            let calls = Arc::clone(&calls);
            move |_ctx| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    RecoveryResult::Retry("still down".to_string())
                }
            }
        },
    );
    let manager = ErrorRecoveryManager::builder(TimeBase::shared())
        .with_strategy(ErrorKind::DeviceUnresponsive, strategy)
        .build();

    let ReportOutcome::Recovering(handle) =
        manager.report_error(error_for("gsr", ErrorKind::DeviceUnresponsive))
    else {
        panic!("expected recovery to start");
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.shutdown();

    let outcome = tokio::time::timeout(Duration::from_secs(2), handle.wait())
        .await
        .unwrap();
    assert_eq!(outcome.status, RecoveryStatus::Cancelled);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(manager.is_shut_down());
    assert!(manager
        .report_error(error_for("gsr", ErrorKind::DeviceUnresponsive))
        .is_surfaced());
}
