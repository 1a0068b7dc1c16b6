//! Integration tests for the biosignal recorder

use async_trait::async_trait;
use multimodal_capture::config::BiosignalConfig;
use multimodal_capture::core::{SensorKind, TimeBase};
use multimodal_capture::recorder::biosignal::{convert_raw, BiosignalSummaryDocument};
use multimodal_capture::recorder::{
    AcquisitionMode, BiosignalRecorder, GsrTransducer, RecorderEvent, RecorderSettings,
    ReplayTransducer, SensorRecorder, StopError, TransducerError,
};
use multimodal_capture::recovery::{ErrorKind, ErrorRecoveryManager, RecoveryEvent};
use multimodal_capture::storage::{read_json, read_signals, read_sync_marks, SessionLayout};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const REPLAY: [u16; 6] = [400, 900, 1500, 2100, 2800, 3600];

fn config(rate_hz: f64) -> BiosignalConfig {
    BiosignalConfig {
        sampling_rate_hz: rate_hz,
        ..BiosignalConfig::default()
    }
}

fn hardware_recorder(config: BiosignalConfig, transducer: ReplayTransducer) -> BiosignalRecorder {
    BiosignalRecorder::new(config, TimeBase::shared()).with_transducer(Box::new(transducer))
}

#[tokio::test]
async fn test_signals_file_matches_summary() {
    let dir = TempDir::new().unwrap();
    let layout = SessionLayout::at(dir.path());
    let recorder = BiosignalRecorder::new(
        BiosignalConfig {
            simulate: true,
            ..config(100.0)
        },
        TimeBase::shared(),
    );

    recorder
        .start("GSR_A", &RecorderSettings::new(dir.path()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let summary = recorder.stop().await.unwrap();

    let samples = read_signals(&layout.signals_csv()).unwrap();
    assert!(samples.len() > 10);
    assert_eq!(samples.len() as u64, summary.sample_count);
    assert_eq!(summary.fallback_sample_count, 0);
    for (i, sample) in samples.iter().enumerate() {
        assert_eq!(sample.sample_index, i as u64);
        assert_eq!(sample.session_id, "GSR_A");
        assert!(sample.is_reciprocal_consistent(1e-6));
    }
    for pair in samples.windows(2) {
        assert!(pair[1].timestamp_ms >= pair[0].timestamp_ms);
    }
}

#[tokio::test]
async fn test_hardware_samples_follow_conversion() {
    let dir = TempDir::new().unwrap();
    let recorder = hardware_recorder(config(100.0), ReplayTransducer::new(REPLAY.to_vec()));

    recorder
        .start("GSR_HW", &RecorderSettings::new(dir.path()))
        .await
        .unwrap();
    assert_eq!(recorder.mode(), Some(AcquisitionMode::HardwareBacked));
    tokio::time::sleep(Duration::from_millis(200)).await;
    let summary = recorder.stop().await.unwrap();

    let samples = read_signals(&SessionLayout::at(dir.path()).signals_csv()).unwrap();
    assert!(!samples.is_empty());
    for (i, sample) in samples.iter().enumerate() {
        let expected = convert_raw(REPLAY[i % REPLAY.len()]);
        assert!((sample.conductance_us - expected.conductance_us).abs() < 1e-9);
        assert!((sample.resistance_kohms - expected.resistance_kohms).abs() < 1e-9);
    }
    assert_eq!(summary.fallback_sample_count, 0);
}

#[tokio::test]
async fn test_failed_read_is_filled_by_one_fallback_sample() {
    let dir = TempDir::new().unwrap();
    // The read of sample 4 and its retry both fail.
    let transducer = ReplayTransducer::new(REPLAY.to_vec()).with_failing_reads([4, 5]);
    let recorder = hardware_recorder(config(100.0), transducer);

    recorder
        .start("GSR_GAP", &RecorderSettings::new(dir.path()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    let summary = recorder.stop().await.unwrap();

    assert_eq!(summary.fallback_sample_count, 1);
    assert!(recorder.is_healthy());

    let samples = read_signals(&SessionLayout::at(dir.path()).signals_csv()).unwrap();
    assert!(samples.len() > 6);
    let mut cursor = 0;
    for (i, sample) in samples.iter().enumerate() {
        assert_eq!(sample.sample_index, i as u64);
        if i == 4 {
            continue;
        }
        let expected = convert_raw(REPLAY[cursor % REPLAY.len()]);
        assert!((sample.conductance_us - expected.conductance_us).abs() < 1e-9);
        cursor += 1;
    }
}

#[tokio::test]
async fn test_disconnect_and_reconnect_flip_health() {
    let dir = TempDir::new().unwrap();
    let recovery = ErrorRecoveryManager::builder(TimeBase::shared()).build();
    let reported = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reported);
    recovery.subscribe(move |event| {
        if let RecoveryEvent::ErrorDetected(error) = event {
            sink.lock().push(error.kind);
        }
    });

    // Reads 5..=10 fail: three samples in a row lose both attempts.
    let transducer = ReplayTransducer::new(REPLAY.to_vec()).with_failing_reads(5..11);
    let recorder = hardware_recorder(
        BiosignalConfig {
            failure_threshold: 3,
            ..config(20.0)
        },
        transducer,
    )
    .with_recovery(Arc::clone(&recovery));

    let events = Arc::new(Mutex::new(Vec::new()));
    let event_sink = Arc::clone(&events);
    recorder.subscribe(Box::new(move |event: &RecorderEvent| match event {
        RecorderEvent::DeviceDisconnected { .. } => event_sink.lock().push("disconnected"),
        RecorderEvent::DeviceConnected { .. } => event_sink.lock().push("connected"),
        _ => {}
    }));

    recorder
        .start("GSR_RECONNECT", &RecorderSettings::new(dir.path()))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(!recorder.is_healthy());
    assert!(recorder.is_running());
    assert_eq!(
        *reported.lock(),
        vec![ErrorKind::SensorDisconnection(SensorKind::Biosignal)]
    );

    // One reconnect attempt per second of samples.
    tokio::time::sleep(Duration::from_millis(1400)).await;
    assert!(recorder.is_healthy());
    assert_eq!(*events.lock(), vec!["disconnected", "connected"]);

    let summary = recorder.stop().await.unwrap();
    assert!(summary.fallback_sample_count >= 3);
    let samples = read_signals(&SessionLayout::at(dir.path()).signals_csv()).unwrap();
    assert_eq!(samples.len() as u64, summary.sample_count);
    for (i, sample) in samples.iter().enumerate() {
        assert_eq!(sample.sample_index, i as u64);
    }
    recovery.shutdown();
}

#[tokio::test]
async fn test_stop_twice_returns_same_summary() {
    let dir = TempDir::new().unwrap();
    let recorder = BiosignalRecorder::new(config(50.0), TimeBase::shared());

    recorder
        .start("GSR_TWICE", &RecorderSettings::new(dir.path()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let first = recorder.stop().await.unwrap();
    let second = recorder.stop().await.unwrap();

    assert_eq!(first, second);
    assert!(!recorder.is_running());

    let document: BiosignalSummaryDocument =
        read_json(&SessionLayout::at(dir.path()).biosignal_summary_json()).unwrap();
    assert_eq!(document.session_id, "GSR_TWICE");
    assert_eq!(document.sample_count, first.sample_count);
    assert_eq!(document.mode, AcquisitionMode::EnhancedFallback);
    assert_eq!(document.duration_ms, first.duration_ms);
}

#[tokio::test]
async fn test_sync_marks_round_trip_with_metadata() {
    let dir = TempDir::new().unwrap();
    let recorder = BiosignalRecorder::new(config(50.0), TimeBase::shared());
    recorder
        .start("GSR_MARKS", &RecorderSettings::new(dir.path()))
        .await
        .unwrap();

    let mut metadata = BTreeMap::new();
    metadata.insert("stimulus".to_string(), "image, 3".to_string());
    metadata.insert("block".to_string(), "2".to_string());
    assert!(recorder.trigger_sync_mark("STIMULUS_ONSET", metadata.clone()));
    assert!(recorder.trigger_sync_mark("RESPONSE", BTreeMap::new()));
    let summary = recorder.stop().await.unwrap();
    assert_eq!(summary.sync_mark_count, 2);
    assert!(!recorder.trigger_sync_mark("LATE", BTreeMap::new()));

    let marks = read_sync_marks(&SessionLayout::at(dir.path()).sync_marks_csv()).unwrap();
    assert_eq!(marks.len(), 2);
    assert_eq!(marks[0].event_type, "STIMULUS_ONSET");
    assert_eq!(marks[0].session_id, "GSR_MARKS");
    assert_eq!(marks[0].metadata, metadata);
    assert_eq!(marks[1].event_type, "RESPONSE");
    assert!(marks[1].metadata.is_empty());
    assert!(marks[1].timestamp_ms >= marks[0].timestamp_ms);
}

#[tokio::test]
async fn test_unread_samples_do_not_leak_into_next_recording() {
    let dir = TempDir::new().unwrap();
    let recorder = BiosignalRecorder::new(
        BiosignalConfig {
            simulate: true,
            ..config(100.0)
        },
        TimeBase::shared(),
    );

    recorder
        .start("SESSION_A", &RecorderSettings::new(dir.path().join("a")))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    recorder.stop().await.unwrap();
    assert!(!recorder.receiver().is_empty());

    recorder
        .start("SESSION_B", &RecorderSettings::new(dir.path().join("b")))
        .await
        .unwrap();
    let live = recorder.receiver().clone();
    let waiting = tokio::task::spawn_blocking(move || live.recv_timeout(Duration::from_secs(1)));
    let sample = waiting.await.unwrap().unwrap();
    assert_eq!(sample.session_id, "SESSION_B");
    assert_eq!(sample.sample_index, 0);

    recorder.stop().await.unwrap();
    assert_eq!(recorder.dropped_sample_count(), 0);
    let layout = SessionLayout::at(dir.path().join("b"));
    let document: BiosignalSummaryDocument = read_json(&layout.biosignal_summary_json()).unwrap();
    assert_eq!(document.dropped_sample_count, 0);
}

#[tokio::test]
async fn test_failed_stop_is_reported_on_every_call() {
    let dir = TempDir::new().unwrap();
    let layout = SessionLayout::at(dir.path());
    let recorder = BiosignalRecorder::new(config(50.0), TimeBase::shared());

    recorder
        .start("GSR_BLOCKED", &RecorderSettings::new(dir.path()))
        .await
        .unwrap();
    // A directory where the summary file belongs makes the final write fail.
    std::fs::create_dir_all(layout.biosignal_summary_json().join("occupied")).unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    let first = recorder.stop().await.unwrap_err();
    let second = recorder.stop().await.unwrap_err();
    assert!(matches!(first, StopError::Storage(_)));
    assert_eq!(first.to_string(), second.to_string());
    assert!(!recorder.is_running());

    // The next recording starts clean.
    let next = TempDir::new().unwrap();
    recorder
        .start("GSR_CLEAN", &RecorderSettings::new(next.path()))
        .await
        .unwrap();
    let summary = recorder.stop().await.unwrap();
    assert_eq!(recorder.stop().await.unwrap(), summary);
}

/// Transducer whose driver panics on the first read.
struct CrashingTransducer;

#[async_trait]
impl GsrTransducer for CrashingTransducer {
    async fn connect(&mut self) -> Result<(), TransducerError> {
        Ok(())
    }

    async fn read_raw(&mut self) -> Result<u16, TransducerError> {
        panic!("GSR driver crashed")
    }

    async fn disconnect(&mut self) {}

    fn describe(&self) -> String {
        "crashing transducer".to_string()
    }
}

#[tokio::test]
async fn test_crashed_acquisition_task_is_reported() {
    let dir = TempDir::new().unwrap();
    let recovery = ErrorRecoveryManager::builder(TimeBase::shared()).build();
    let reported = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reported);
    recovery.subscribe(move |event| {
        if let RecoveryEvent::ErrorDetected(error) = event {
            sink.lock().push(error.kind);
        }
    });
    let recorder = BiosignalRecorder::new(config(50.0), TimeBase::shared())
        .with_transducer(Box::new(CrashingTransducer))
        .with_recovery(Arc::clone(&recovery));
    let errors = Arc::new(Mutex::new(Vec::new()));
    let error_sink = Arc::clone(&errors);
    recorder.subscribe(Box::new(move |event: &RecorderEvent| {
        if let RecorderEvent::Error { message, .. } = event {
            error_sink.lock().push(message.clone());
        }
    }));

    recorder
        .start("GSR_CRASH", &RecorderSettings::new(dir.path().join("crash")))
        .await
        .unwrap();
    assert_eq!(recorder.mode(), Some(AcquisitionMode::HardwareBacked));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = recorder.stop().await.unwrap_err();
    assert!(matches!(err, StopError::Failed(_)));
    assert!(!recorder.is_healthy());
    assert!(errors.lock().iter().any(|m| m.contains("crashing transducer lost")));
    assert_eq!(
        *reported.lock(),
        vec![ErrorKind::SensorDisconnection(SensorKind::Biosignal)]
    );

    // Without its transducer the recorder falls back to the generator.
    recorder
        .start("GSR_AFTER", &RecorderSettings::new(dir.path().join("after")))
        .await
        .unwrap();
    assert_eq!(recorder.mode(), Some(AcquisitionMode::EnhancedFallback));
    assert!(recorder.is_healthy());
    recorder.stop().await.unwrap();
    recovery.shutdown();
}
