//! Demonstration of an orchestrated multi-sensor recording.
//!
//! This example shows how to:
//! 1. Build the time base, session manager and recovery manager
//! 2. Register thermal, RGB and biosignal recorders
//! 3. Start them in parallel with one sensor failing
//! 4. Consume live biosignal samples and add sync marks
//! 5. Stop the recording and read the data back
//!
//! Run with: cargo run --example record_demo

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use multimodal_capture::{
    config::BiosignalConfig,
    orchestrator::OrchestratorEvent,
    recorder::{FrameSourceError, SimulatedFrameSource},
    storage::{read_signals, read_sync_marks, SignalStatistics},
    BiosignalRecorder, CameraRecorder, ErrorRecoveryManager, RecordingOrchestrator, SensorKind,
    SessionManager, StartRequest, TimeBase,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Multimodal Capture - Record Demo");
    println!("================================");
    println!();

    let root = std::env::temp_dir().join("mmcapture-demo");
    let time_base = TimeBase::shared();
    let recovery = ErrorRecoveryManager::with_defaults(time_base.clone());
    let sessions = Arc::new(SessionManager::new(time_base.clone(), &root, "Demo"));

    // The RGB camera is "unplugged" to show partial success.
    let rgb_source = SimulatedFrameSource::rgb()
        .failing_with(FrameSourceError::Unavailable("no camera attached".to_string()));
    let biosignal = Arc::new(
        BiosignalRecorder::new(
            BiosignalConfig {
                simulate: true,
                ..BiosignalConfig::default()
            },
            time_base.clone(),
        )
        .with_recovery(recovery.clone()),
    );
    let samples = biosignal.receiver().clone();

    let orchestrator = RecordingOrchestrator::new(time_base.clone(), sessions)
        .with_recorder(Arc::new(CameraRecorder::thermal(
            Box::new(SimulatedFrameSource::thermal()),
            time_base.clone(),
        )))
        .with_recorder(Arc::new(CameraRecorder::rgb(
            Box::new(rgb_source),
            time_base.clone(),
        )))
        .with_recorder(biosignal)
        .with_recovery(recovery.clone());

    orchestrator.subscribe(|event| {
        if let OrchestratorEvent::SensorStatusChanged { sensor, status } = event {
            println!("  [{sensor}] {status:?}");
        }
    });

    println!("Starting all sensors...");
    let result = orchestrator
        .start_all(StartRequest::new(SensorKind::ALL).participant("demo"))
        .await?;
    println!();
    println!("{}", result.describe());
    println!("Session directory: {}", result.session_dir.display());
    println!();

    for second in 1..=3 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let received: Vec<_> = samples.try_iter().collect();
        if let Some(last) = received.last() {
            println!(
                "  {second}s: {} live samples, latest {:.2} µS (index {})",
                received.len(),
                last.conductance_us,
                last.sample_index
            );
        }
        let mut metadata = BTreeMap::new();
        metadata.insert("second".to_string(), second.to_string());
        orchestrator.add_sync_event("DEMO_TICK", metadata);
    }

    println!();
    println!("Stopping...");
    let report = orchestrator.stop_all().await?;
    recovery.shutdown();

    if let Some(summary) = report.summary {
        let layout = multimodal_capture::SessionLayout::new(&root, &summary.session.session_id);
        let signals = read_signals(&layout.signals_csv())?;
        let marks = read_sync_marks(&layout.sync_marks_csv())?;

        println!("Session {}", summary.session.session_id);
        println!("  Data: {}", summary.session.data_type_summary());
        println!("  Sync marks on biosignal channel: {}", marks.len());
        if let Some(stats) = SignalStatistics::from_samples(&signals) {
            println!(
                "  {} samples at {:.1} Hz, mean conductance {:.2} µS",
                stats.sample_count, stats.effective_rate_hz, stats.mean_conductance_us
            );
        }
    }

    Ok(())
}
