//! Biosignal (GSR) acquisition pipeline.
//!
//! A long-lived task samples at a fixed rate, converts raw transducer readings
//! to conductance and resistance, and appends every sample to `signals.csv`.
//! When the transducer cannot be read the fallback generator fills in, so the
//! sample index never skips and downstream consumers never see an
//! out-of-range value.

pub mod conversion;
pub mod transducer;

pub use conversion::{convert_raw, AcquisitionMode, FallbackGenerator, GsrReading};
pub use transducer::{GsrTransducer, ReplayTransducer, TransducerError};

use super::types::{RecorderEvent, RecorderListener, RecorderSettings, StartError, StopError};
use super::{report_fault, SensorRecorder};
use crate::config::BiosignalConfig;
use crate::core::{
    BiosignalSample, ListenerRegistry, SensorKind, SessionSummary, SharedTimeBase,
    SubscriptionId, SyncMark, Timestamp,
};
use crate::recovery::{ErrorKind, SharedRecoveryManager};
use crate::storage::{
    write_json_atomic, CsvLog, SessionLayout, StorageError, SyncMarkRow, SIGNALS_HEADER,
};
use async_trait::async_trait;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the live sample channel. Samples are dropped, and counted,
/// when it is full.
const SAMPLE_CHANNEL_CAPACITY: usize = 10_000;

/// Written atomically to `biosignal_summary.json` when a recording stops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiosignalSummaryDocument {
    pub session_id: String,
    pub mode: AcquisitionMode,
    pub device: String,
    pub sampling_rate_hz: f64,
    pub sample_count: u64,
    pub fallback_sample_count: u64,
    /// Samples the live channel could not take; they are still in the CSV.
    #[serde(default)]
    pub dropped_sample_count: u64,
    pub sync_mark_count: u64,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    pub duration_ms: i64,
}

struct ActiveAcquisition {
    session_id: String,
    started: Timestamp,
    mode: AcquisitionMode,
    device: String,
    rate_hz: f64,
    cancel: CancellationToken,
    task: JoinHandle<AcquisitionResult>,
    sync_log: CsvLog<SyncMarkRow>,
    layout: SessionLayout,
}

struct AcquisitionResult {
    transducer: Option<Box<dyn GsrTransducer>>,
    signals: CsvLog<BiosignalSample>,
    error: Option<StorageError>,
}

/// Sensor recorder for the GSR biosignal stream.
pub struct BiosignalRecorder {
    config: BiosignalConfig,
    time_base: SharedTimeBase,
    recovery: Option<SharedRecoveryManager>,
    transducer: Mutex<Option<Box<dyn GsrTransducer>>>,
    active: Mutex<Option<ActiveAcquisition>>,
    lifecycle: tokio::sync::Mutex<()>,
    running: AtomicBool,
    healthy: Arc<AtomicBool>,
    next_index: Arc<AtomicU64>,
    fallback_count: Arc<AtomicU64>,
    dropped_count: Arc<AtomicU64>,
    sample_tx: Sender<BiosignalSample>,
    sample_rx: Receiver<BiosignalSample>,
    last_mode: Mutex<Option<AcquisitionMode>>,
    last_summary: Mutex<SessionSummary>,
    last_failure: Mutex<Option<StopError>>,
    listeners: Arc<ListenerRegistry<RecorderEvent>>,
}

impl BiosignalRecorder {
    /// Recorder without a transducer; it always runs the fallback generator
    /// unless `require_hardware` is set.
    pub fn new(config: BiosignalConfig, time_base: SharedTimeBase) -> Self {
        let (sample_tx, sample_rx) = bounded(SAMPLE_CHANNEL_CAPACITY);
        Self {
            config,
            time_base,
            recovery: None,
            transducer: Mutex::new(None),
            active: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            running: AtomicBool::new(false),
            healthy: Arc::new(AtomicBool::new(true)),
            next_index: Arc::new(AtomicU64::new(0)),
            fallback_count: Arc::new(AtomicU64::new(0)),
            dropped_count: Arc::new(AtomicU64::new(0)),
            sample_tx,
            sample_rx,
            last_mode: Mutex::new(None),
            last_summary: Mutex::new(SessionSummary::empty(SensorKind::Biosignal)),
            last_failure: Mutex::new(None),
            listeners: Arc::new(ListenerRegistry::new()),
        }
    }

    pub fn with_transducer(self, transducer: Box<dyn GsrTransducer>) -> Self {
        *self.transducer.lock() = Some(transducer);
        self
    }

    /// Reports acquisition faults to `recovery`.
    pub fn with_recovery(mut self, recovery: SharedRecoveryManager) -> Self {
        self.recovery = Some(recovery);
        self
    }

    /// Live samples of the current recording. Unread samples are discarded
    /// when the next recording starts. Consumers that fall more than the
    /// channel capacity behind lose samples; the CSV file is always complete.
    pub fn receiver(&self) -> &Receiver<BiosignalSample> {
        &self.sample_rx
    }

    /// Live samples the current (or last) recording could not deliver.
    pub fn dropped_sample_count(&self) -> u64 {
        self.dropped_count.load(Ordering::SeqCst)
    }

    /// Samples written in the current (or last) recording.
    pub fn sample_count(&self) -> u64 {
        self.next_index.load(Ordering::SeqCst)
    }

    /// Mode of the current (or last) recording.
    pub fn mode(&self) -> Option<AcquisitionMode> {
        *self.last_mode.lock()
    }

    /// Connects the transducer (if any) and decides the acquisition mode.
    async fn select_mode(
        &self,
        transducer: &mut Option<Box<dyn GsrTransducer>>,
    ) -> Result<AcquisitionMode, StartError> {
        if self.config.simulate {
            return Ok(AcquisitionMode::EnhancedFallback);
        }
        let Some(device) = transducer.as_mut() else {
            if self.config.require_hardware {
                return Err(StartError::DeviceUnavailable(
                    "no GSR transducer attached".to_string(),
                ));
            }
            return Ok(AcquisitionMode::EnhancedFallback);
        };

        match device.connect().await {
            Ok(()) => {
                info!(device = %device.describe(), "GSR transducer connected");
                Ok(AcquisitionMode::HardwareBacked)
            }
            Err(e) if self.config.require_hardware => {
                Err(StartError::DeviceUnavailable(e.to_string()))
            }
            Err(e) => {
                warn!(error = %e, "GSR transducer unavailable, using enhanced fallback");
                Ok(AcquisitionMode::EnhancedFallback)
            }
        }
    }

    fn open_logs(
        &self,
        layout: &SessionLayout,
    ) -> Result<(CsvLog<BiosignalSample>, CsvLog<SyncMarkRow>), StorageError> {
        layout.ensure()?;
        let signals_path = layout.signals_csv();
        let signals = CsvLog::create(&signals_path, &SIGNALS_HEADER, self.config.flush_batch)?;
        match CsvLog::sync_marks(&layout.sync_marks_csv()) {
            Ok(sync_log) => Ok((signals, sync_log)),
            Err(e) => {
                drop(signals);
                let _ = std::fs::remove_file(&signals_path);
                Err(e)
            }
        }
    }

    async fn return_transducer(&self, transducer: Option<Box<dyn GsrTransducer>>, connected: bool) {
        if let Some(mut device) = transducer {
            if connected {
                device.disconnect().await;
            }
            *self.transducer.lock() = Some(device);
        }
    }
}

enum HardwareRead {
    Reading(GsrReading),
    Unreadable,
    Cancelled,
}

struct AcquisitionLoop {
    session_id: String,
    mode: AcquisitionMode,
    rate_hz: f64,
    transducer: Option<Box<dyn GsrTransducer>>,
    connected: bool,
    signals: CsvLog<BiosignalSample>,
    generator: FallbackGenerator,
    time_base: SharedTimeBase,
    recovery: Option<SharedRecoveryManager>,
    cancel: CancellationToken,
    healthy: Arc<AtomicBool>,
    next_index: Arc<AtomicU64>,
    fallback_count: Arc<AtomicU64>,
    dropped_count: Arc<AtomicU64>,
    sample_tx: Sender<BiosignalSample>,
    listeners: Arc<ListenerRegistry<RecorderEvent>>,
    failure_threshold: u32,
    consecutive_failures: u32,
    reconnect_every: u64,
    ticks_since_reconnect: u64,
}

impl AcquisitionLoop {
    async fn run(mut self) -> AcquisitionResult {
        let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / self.rate_hz));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let index = self.next_index.load(Ordering::SeqCst);
            let elapsed_s = index as f64 / self.rate_hz;
            let reading = match self.mode {
                AcquisitionMode::EnhancedFallback => self.generator.sample(elapsed_s),
                AcquisitionMode::HardwareBacked => match self.read_hardware().await {
                    HardwareRead::Reading(reading) => reading,
                    HardwareRead::Unreadable => {
                        self.fallback_count.fetch_add(1, Ordering::SeqCst);
                        self.generator.sample(elapsed_s)
                    }
                    HardwareRead::Cancelled => break,
                },
            };

            let at = self.time_base.now();
            let sample = BiosignalSample {
                timestamp_ms: at.device_ms,
                utc_timestamp_ms: at.wall_clock_ms,
                conductance_us: reading.conductance_us,
                resistance_kohms: reading.resistance_kohms,
                sample_index: index,
                session_id: self.session_id.clone(),
            };

            if let Err(e) = self.signals.append(&sample) {
                self.fail_storage(&e);
                return AcquisitionResult {
                    transducer: self.transducer,
                    signals: self.signals,
                    error: Some(e),
                };
            }
            self.next_index.store(index + 1, Ordering::SeqCst);
            if let Err(TrySendError::Full(_)) = self.sample_tx.try_send(sample) {
                if self.dropped_count.fetch_add(1, Ordering::SeqCst) == 0 {
                    warn!(
                        session_id = %self.session_id,
                        capacity = SAMPLE_CHANNEL_CAPACITY,
                        "live sample consumer is behind, dropping samples"
                    );
                }
            }
        }

        if self.connected {
            if let Some(device) = self.transducer.as_mut() {
                device.disconnect().await;
            }
        }
        AcquisitionResult {
            transducer: self.transducer,
            signals: self.signals,
            error: None,
        }
    }

    /// One sample's worth of hardware access: a read plus one retry, or a
    /// reconnect attempt while disconnected.
    async fn read_hardware(&mut self) -> HardwareRead {
        if !self.connected {
            self.ticks_since_reconnect += 1;
            if self.ticks_since_reconnect >= self.reconnect_every {
                self.ticks_since_reconnect = 0;
                self.try_reconnect().await;
            }
            if !self.connected {
                return HardwareRead::Unreadable;
            }
        }

        let Some(device) = self.transducer.as_mut() else {
            return HardwareRead::Unreadable;
        };
        let mut outcome = Err(TransducerError::NotConnected);
        for attempt in 0..2 {
            outcome = tokio::select! {
                _ = self.cancel.cancelled() => return HardwareRead::Cancelled,
                read = device.read_raw() => read,
            };
            match &outcome {
                Ok(_) => break,
                Err(e) => debug!(attempt, error = %e, "GSR read failed"),
            }
        }

        match outcome {
            Ok(raw) => {
                self.consecutive_failures = 0;
                HardwareRead::Reading(convert_raw(raw))
            }
            Err(e) => {
                self.on_read_failed(e).await;
                HardwareRead::Unreadable
            }
        }
    }

    async fn on_read_failed(&mut self, e: TransducerError) {
        self.consecutive_failures += 1;
        if self.consecutive_failures == 1 {
            warn!(
                session_id = %self.session_id,
                error = %e,
                "GSR read failed, substituting fallback samples"
            );
        }
        if self.consecutive_failures < self.failure_threshold {
            return;
        }

        error!(
            session_id = %self.session_id,
            failures = self.consecutive_failures,
            "GSR transducer unresponsive, treating as disconnected"
        );
        self.connected = false;
        self.ticks_since_reconnect = 0;
        if let Some(device) = self.transducer.as_mut() {
            device.disconnect().await;
        }
        self.healthy.store(false, Ordering::SeqCst);
        self.listeners.emit(&RecorderEvent::DeviceDisconnected {
            sensor: SensorKind::Biosignal,
        });
        report_fault(
            self.recovery.as_ref(),
            &self.time_base,
            SensorKind::Biosignal,
            ErrorKind::SensorDisconnection(SensorKind::Biosignal),
            format!(
                "{} consecutive read failures: {e}",
                self.consecutive_failures
            ),
        );
    }

    async fn try_reconnect(&mut self) {
        let Some(device) = self.transducer.as_mut() else {
            return;
        };
        match device.connect().await {
            Ok(()) => {
                info!(session_id = %self.session_id, "GSR transducer reconnected");
                self.connected = true;
                self.consecutive_failures = 0;
                self.healthy.store(true, Ordering::SeqCst);
                self.listeners.emit(&RecorderEvent::DeviceConnected {
                    sensor: SensorKind::Biosignal,
                });
            }
            Err(e) => debug!(error = %e, "GSR reconnect attempt failed"),
        }
    }

    fn fail_storage(&self, e: &StorageError) {
        error!(session_id = %self.session_id, error = %e, "signals.csv write failed");
        self.healthy.store(false, Ordering::SeqCst);
        self.listeners.emit(&RecorderEvent::Error {
            sensor: SensorKind::Biosignal,
            message: e.to_string(),
        });
        report_fault(
            self.recovery.as_ref(),
            &self.time_base,
            SensorKind::Biosignal,
            e.error_kind()
                .unwrap_or(ErrorKind::DataStreamFailure(SensorKind::Biosignal)),
            e.to_string(),
        );
    }
}

#[async_trait]
impl SensorRecorder for BiosignalRecorder {
    fn kind(&self) -> SensorKind {
        SensorKind::Biosignal
    }

    async fn start(&self, session_id: &str, settings: &RecorderSettings) -> Result<(), StartError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.running.load(Ordering::SeqCst) {
            return Err(StartError::AlreadyRunning);
        }

        let rate_hz = settings
            .option_f64("sampling_rate_hz")
            .unwrap_or(self.config.sampling_rate_hz);
        if !(rate_hz.is_finite() && rate_hz > 0.0) {
            return Err(StartError::Failed(format!(
                "invalid sampling rate {rate_hz}"
            )));
        }

        let mut transducer = self.transducer.lock().take();
        let mode = match self.select_mode(&mut transducer).await {
            Ok(mode) => mode,
            Err(e) => {
                self.return_transducer(transducer, false).await;
                return Err(e);
            }
        };
        let connected = mode == AcquisitionMode::HardwareBacked;

        let layout = SessionLayout::at(&settings.session_dir);
        let (signals, sync_log) = match self.open_logs(&layout) {
            Ok(logs) => logs,
            Err(e) => {
                self.return_transducer(transducer, connected).await;
                return Err(e.into());
            }
        };

        let device = match &transducer {
            Some(device) if connected => device.describe(),
            _ => "fallback generator".to_string(),
        };
        let started = self.time_base.now();
        let cancel = CancellationToken::new();
        let stale = self.sample_rx.try_iter().count();
        if stale > 0 {
            debug!(
                session_id,
                stale,
                "discarded unread samples of the previous recording"
            );
        }
        self.next_index.store(0, Ordering::SeqCst);
        self.fallback_count.store(0, Ordering::SeqCst);
        self.dropped_count.store(0, Ordering::SeqCst);
        self.healthy.store(true, Ordering::SeqCst);
        *self.last_mode.lock() = Some(mode);
        self.last_failure.lock().take();

        let acquisition = AcquisitionLoop {
            session_id: session_id.to_string(),
            mode,
            rate_hz,
            transducer,
            connected,
            signals,
            generator: FallbackGenerator::new(self.config.fallback_seed),
            time_base: Arc::clone(&self.time_base),
            recovery: self.recovery.clone(),
            cancel: cancel.clone(),
            healthy: Arc::clone(&self.healthy),
            next_index: Arc::clone(&self.next_index),
            fallback_count: Arc::clone(&self.fallback_count),
            dropped_count: Arc::clone(&self.dropped_count),
            sample_tx: self.sample_tx.clone(),
            listeners: Arc::clone(&self.listeners),
            failure_threshold: self.config.failure_threshold.max(1),
            consecutive_failures: 0,
            reconnect_every: rate_hz.round().max(1.0) as u64,
            ticks_since_reconnect: 0,
        };
        let task = tokio::spawn(acquisition.run());

        *self.active.lock() = Some(ActiveAcquisition {
            session_id: session_id.to_string(),
            started,
            mode,
            device,
            rate_hz,
            cancel,
            task,
            sync_log,
            layout,
        });
        self.running.store(true, Ordering::SeqCst);

        info!(session_id, mode = %mode, rate_hz, "biosignal recording started");
        self.listeners.emit(&RecorderEvent::Started {
            sensor: SensorKind::Biosignal,
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    async fn stop(&self) -> Result<SessionSummary, StopError> {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(active) = self.active.lock().take() else {
            if let Some(e) = self.last_failure.lock().clone() {
                return Err(e);
            }
            return Ok(self.last_summary.lock().clone());
        };

        let ActiveAcquisition {
            session_id,
            started,
            mode,
            device,
            rate_hz,
            cancel,
            task,
            sync_log,
            layout,
        } = active;
        cancel.cancel();

        let mut failure = None;
        match task.await {
            Ok(result) => {
                if let Some(e) = &result.error {
                    warn!(session_id = %session_id, error = %e, "acquisition ended early");
                }
                if let Err(e) = result.signals.close() {
                    failure = Some(StopError::from(e));
                }
                // The loop disconnects before returning.
                self.return_transducer(result.transducer, false).await;
            }
            Err(e) => {
                // The transducer was owned by the task and is gone with it.
                let hardware = mode == AcquisitionMode::HardwareBacked;
                error!(
                    session_id = %session_id,
                    error = %e,
                    device = %device,
                    "acquisition task failed, transducer lost; later recordings use the fallback generator"
                );
                self.healthy.store(false, Ordering::SeqCst);
                let message = format!("acquisition task failed, {device} lost: {e}");
                self.listeners.emit(&RecorderEvent::Error {
                    sensor: SensorKind::Biosignal,
                    message: message.clone(),
                });
                let kind = if hardware {
                    ErrorKind::SensorDisconnection(SensorKind::Biosignal)
                } else {
                    ErrorKind::DataStreamFailure(SensorKind::Biosignal)
                };
                report_fault(
                    self.recovery.as_ref(),
                    &self.time_base,
                    SensorKind::Biosignal,
                    kind,
                    message,
                );
                failure = Some(StopError::Failed(e.to_string()));
            }
        }

        let sync_mark_count = sync_log.rows_written();
        if let Err(e) = sync_log.close() {
            if failure.is_none() {
                failure = Some(StopError::from(e));
            }
        }

        let ended = self.time_base.now();
        let sample_count = self.next_index.load(Ordering::SeqCst);
        let fallback_sample_count = self.fallback_count.load(Ordering::SeqCst);
        let dropped_sample_count = self.dropped_count.load(Ordering::SeqCst);
        let document = BiosignalSummaryDocument {
            session_id: session_id.clone(),
            mode,
            device,
            sampling_rate_hz: rate_hz,
            sample_count,
            fallback_sample_count,
            dropped_sample_count,
            sync_mark_count,
            start_time_ms: started.wall_clock_ms,
            end_time_ms: ended.wall_clock_ms,
            duration_ms: ended.millis_since(&started),
        };
        if let Err(e) = write_json_atomic(&layout.biosignal_summary_json(), &document) {
            error!(session_id = %session_id, error = %e, "failed to write biosignal summary");
            if failure.is_none() {
                failure = Some(StopError::from(e));
            }
        }

        let summary = SessionSummary {
            sensor: SensorKind::Biosignal,
            session_id: Some(session_id.clone()),
            start: Some(started),
            end: Some(ended),
            duration_ms: document.duration_ms,
            sample_count,
            sync_mark_count,
            fallback_sample_count,
            output_files: vec![
                layout.signals_csv(),
                layout.sync_marks_csv(),
                layout.biosignal_summary_json(),
            ],
        };
        *self.last_summary.lock() = summary.clone();
        *self.last_failure.lock() = failure.clone();
        self.running.store(false, Ordering::SeqCst);

        info!(
            session_id = %session_id,
            samples = sample_count,
            fallback_samples = fallback_sample_count,
            dropped_samples = dropped_sample_count,
            duration_ms = summary.duration_ms,
            "biosignal recording stopped"
        );
        self.listeners.emit(&RecorderEvent::Stopped {
            sensor: SensorKind::Biosignal,
            summary: summary.clone(),
        });

        match failure {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    fn trigger_sync_mark(&self, event_type: &str, metadata: BTreeMap<String, String>) -> bool {
        let mut active = self.active.lock();
        let Some(acquisition) = active.as_mut() else {
            return false;
        };
        let mark = SyncMark::new(
            self.time_base.now(),
            event_type,
            acquisition.session_id.clone(),
            metadata,
        );
        let written = acquisition.sync_log.append_mark(&mark);
        drop(active);

        match written {
            Ok(()) => {
                debug!(event_type, "biosignal sync mark recorded");
                self.listeners.emit(&RecorderEvent::SyncMarkRecorded {
                    sensor: SensorKind::Biosignal,
                    mark,
                });
                true
            }
            Err(e) => {
                warn!(error = %e, "sync mark write failed");
                self.listeners.emit(&RecorderEvent::Error {
                    sensor: SensorKind::Biosignal,
                    message: e.to_string(),
                });
                false
            }
        }
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn subscribe(&self, listener: RecorderListener) -> SubscriptionId {
        self.listeners.subscribe(listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TimeBase;
    use crate::storage::{read_json, read_signals};
    use tempfile::TempDir;

    fn config(rate: f64) -> BiosignalConfig {
        BiosignalConfig {
            sampling_rate_hz: rate,
            ..BiosignalConfig::default()
        }
    }

    #[tokio::test]
    async fn test_fallback_recording_writes_contiguous_indices() {
        let dir = TempDir::new().unwrap();
        let recorder = BiosignalRecorder::new(config(200.0), TimeBase::shared());

        recorder
            .start("GSR_1", &RecorderSettings::new(dir.path()))
            .await
            .unwrap();
        assert_eq!(recorder.mode(), Some(AcquisitionMode::EnhancedFallback));
        tokio::time::sleep(Duration::from_millis(150)).await;
        let summary = recorder.stop().await.unwrap();

        let samples = read_signals(&dir.path().join("signals.csv")).unwrap();
        assert!(!samples.is_empty());
        assert_eq!(samples.len() as u64, summary.sample_count);
        for (i, sample) in samples.iter().enumerate() {
            assert_eq!(sample.sample_index, i as u64);
            assert!((5.0..=50.0).contains(&sample.conductance_us));
        }

        let doc: BiosignalSummaryDocument =
            read_json(&dir.path().join("biosignal_summary.json")).unwrap();
        assert_eq!(doc.sample_count, summary.sample_count);
        assert_eq!(doc.mode, AcquisitionMode::EnhancedFallback);
    }

    #[tokio::test]
    async fn test_require_hardware_rolls_back() {
        let dir = TempDir::new().unwrap();
        let recorder = BiosignalRecorder::new(
            BiosignalConfig {
                require_hardware: true,
                ..config(128.0)
            },
            TimeBase::shared(),
        )
        .with_transducer(Box::new(ReplayTransducer::unavailable()));

        let err = recorder
            .start("GSR_1", &RecorderSettings::new(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, StartError::DeviceUnavailable(_)));
        assert!(!recorder.is_running());
        assert!(!dir.path().join("signals.csv").exists());
    }

    #[tokio::test]
    async fn test_sync_mark_only_while_running() {
        let dir = TempDir::new().unwrap();
        let recorder = BiosignalRecorder::new(config(64.0), TimeBase::shared());
        assert!(!recorder.trigger_sync_mark("EARLY", BTreeMap::new()));

        recorder
            .start("GSR_1", &RecorderSettings::new(dir.path()))
            .await
            .unwrap();
        assert!(recorder.trigger_sync_mark("USER_TRIGGER", BTreeMap::new()));
        let summary = recorder.stop().await.unwrap();
        assert_eq!(summary.sync_mark_count, 1);
        assert!(!recorder.trigger_sync_mark("LATE", BTreeMap::new()));
    }

    #[tokio::test]
    async fn test_live_samples_are_fanned_out() {
        let dir = TempDir::new().unwrap();
        let recorder = BiosignalRecorder::new(config(200.0), TimeBase::shared());
        recorder
            .start("GSR_1", &RecorderSettings::new(dir.path()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        recorder.stop().await.unwrap();

        let received: Vec<_> = recorder.receiver().try_iter().collect();
        assert_eq!(received.len() as u64, recorder.sample_count());
        assert_eq!(received.first().map(|s| s.sample_index), Some(0));
    }
}
