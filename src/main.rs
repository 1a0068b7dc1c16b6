//! Multimodal Capture CLI
//!
//! Runs orchestrated recording sessions and inspects recorded data.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use multimodal_capture::{
    audit::AuditLog,
    config::{Config, SensorSelection},
    core::{Session, TimeBase},
    orchestrator::{OrchestratorSettings, RecordingOrchestrator, StartRequest, StopStatus},
    recorder::{
        BiosignalRecorder, CameraRecorder, FrameSourceError, ReplayTransducer,
        SimulatedFrameSource,
    },
    recovery::{ErrorRecoveryManager, RecoveryEvent},
    session::SessionManager,
    storage::{read_signals, SignalStatistics},
    SensorKind, VERSION,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mmcapture")]
#[command(version = VERSION)]
#[command(about = "Timestamp-aligned multi-sensor capture", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record one session
    Record {
        /// Sensors to record (thermal, rgb, biosignal/gsr, or all)
        #[arg(long)]
        sensors: Option<String>,

        /// Stop after this many seconds (default: until Ctrl+C)
        #[arg(long)]
        duration: Option<u64>,

        /// Session id (default: generated)
        #[arg(long)]
        session_id: Option<String>,

        #[arg(long)]
        participant: Option<String>,

        #[arg(long)]
        study: Option<String>,

        /// Generate biosignal samples instead of reading a transducer
        #[arg(long)]
        simulate: bool,

        /// Replay raw 12-bit GSR readings (one per line) as the transducer
        #[arg(long)]
        replay: Option<PathBuf>,

        /// Make one sensor fail to start
        #[arg(long)]
        fail_sensor: Option<SensorKind>,

        /// Add a sync mark every N seconds
        #[arg(long)]
        mark_every: Option<u64>,
    },

    /// List recorded sessions
    Sessions,

    /// Show a recorded session
    Show {
        session_id: String,
    },

    /// Show cumulative recording statistics
    Status,

    /// Show configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Record {
            sensors,
            duration,
            session_id,
            participant,
            study,
            simulate,
            replay,
            fail_sensor,
            mark_every,
        } => {
            let options = RecordOptions {
                sensors,
                duration: duration.map(Duration::from_secs),
                session_id,
                participant,
                study,
                simulate,
                replay,
                fail_sensor,
                mark_every: mark_every.map(Duration::from_secs),
            };
            cmd_record(options).await
        }
        Commands::Sessions => cmd_sessions(),
        Commands::Show { session_id } => cmd_show(&session_id),
        Commands::Status => cmd_status(),
        Commands::Config => cmd_config(),
    }
}

struct RecordOptions {
    sensors: Option<String>,
    duration: Option<Duration>,
    session_id: Option<String>,
    participant: Option<String>,
    study: Option<String>,
    simulate: bool,
    replay: Option<PathBuf>,
    fail_sensor: Option<SensorKind>,
    mark_every: Option<Duration>,
}

fn load_config() -> Config {
    Config::load().unwrap_or_else(|e| {
        warn!(error = %e, "could not load config, using defaults");
        Config::default()
    })
}

async fn cmd_record(options: RecordOptions) -> Result<()> {
    println!("Multimodal Capture v{VERSION}");
    println!();

    let mut config = load_config();
    let selection = match &options.sensors {
        Some(list) => SensorSelection::from_csv(list),
        None => config.sensors.clone(),
    };
    if !selection.any_enabled() {
        bail!("at least one sensor must be selected (thermal, rgb, biosignal)");
    }
    if options.simulate {
        config.biosignal.simulate = true;
    }
    config
        .ensure_directories()
        .context("could not create data directories")?;

    let time_base = TimeBase::shared();
    let recovery = ErrorRecoveryManager::builder(Arc::clone(&time_base))
        .with_default_strategies()
        .health_check_interval(config.health_check_interval)
        .health_failure_threshold(config.health_failure_threshold)
        .build();
    recovery.subscribe(log_recovery_event);

    let sessions = Arc::new(SessionManager::new(
        Arc::clone(&time_base),
        config.sessions_path.clone(),
        config.session_prefix.clone(),
    ));

    let camera_source = |kind: SensorKind, fps: f64, width: u32, height: u32| {
        let source = SimulatedFrameSource::new(fps, width, height);
        if options.fail_sensor == Some(kind) {
            source.failing_with(FrameSourceError::Unavailable(format!(
                "{} camera disabled by --fail-sensor",
                kind.display_name()
            )))
        } else {
            source
        }
    };
    let thermal = CameraRecorder::thermal(
        Box::new(camera_source(SensorKind::Thermal, config.camera.thermal_fps, 256, 192)),
        Arc::clone(&time_base),
    )
    .with_recovery(Arc::clone(&recovery));
    let rgb = CameraRecorder::rgb(
        Box::new(camera_source(SensorKind::Rgb, config.camera.rgb_fps, 1920, 1080)),
        Arc::clone(&time_base),
    )
    .with_recovery(Arc::clone(&recovery));

    let mut biosignal_config = config.biosignal.clone();
    let mut biosignal = if options.fail_sensor == Some(SensorKind::Biosignal) {
        biosignal_config.simulate = false;
        biosignal_config.require_hardware = true;
        BiosignalRecorder::new(biosignal_config, Arc::clone(&time_base))
            .with_transducer(Box::new(ReplayTransducer::unavailable()))
    } else {
        BiosignalRecorder::new(biosignal_config, Arc::clone(&time_base))
    };
    if let Some(path) = &options.replay {
        let values = read_replay_file(path)?;
        println!("Replaying {} raw readings from {}", values.len(), path.display());
        biosignal = biosignal.with_transducer(Box::new(ReplayTransducer::new(values)));
    }
    let biosignal = biosignal.with_recovery(Arc::clone(&recovery));

    let orchestrator = RecordingOrchestrator::new(Arc::clone(&time_base), Arc::clone(&sessions))
        .with_recorder(Arc::new(thermal))
        .with_recorder(Arc::new(rgb))
        .with_recorder(Arc::new(biosignal))
        .with_recovery(Arc::clone(&recovery))
        .with_settings(OrchestratorSettings::from(&config));

    let audit = Arc::new(AuditLog::with_persistence(config.audit_path()));
    audit.observe_orchestrator(&orchestrator);
    audit.observe_recovery(&recovery);

    let running = Arc::new(AtomicBool::new(true));
    ctrlc_handler(Arc::clone(&running))?;

    let mut request = StartRequest::new(selection.kinds());
    request.session_id = options.session_id.clone();
    request.participant_id = options.participant.clone();
    request.study_name = options.study.clone();

    let result = match orchestrator.start_all(request).await {
        Ok(result) => result,
        Err(e) => {
            recovery.shutdown();
            if let Err(save_err) = audit.save() {
                warn!(error = %save_err, "could not save audit log");
            }
            return Err(e).context("recording did not start");
        }
    };

    println!("Session: {}", result.session_id);
    println!("Directory: {}", result.session_dir.display());
    println!("{}", result.describe());
    println!();
    match options.duration {
        Some(d) => println!("Recording for {}s (Ctrl+C to stop early)", d.as_secs()),
        None => println!("Press Ctrl+C to stop"),
    }
    println!();

    let started = tokio::time::Instant::now();
    let mut last_mark = started;
    let mut mark_index = 0u64;
    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;

        if options.duration.is_some_and(|d| started.elapsed() >= d) {
            break;
        }
        if let Some(every) = options.mark_every {
            if last_mark.elapsed() >= every {
                mark_index += 1;
                let mut metadata = BTreeMap::new();
                metadata.insert("mark_index".to_string(), mark_index.to_string());
                if let Some(mark) = orchestrator.add_sync_event("USER_MARK", metadata) {
                    info!(mark_index, utc_ms = mark.utc_timestamp_ms, "sync mark added");
                }
                last_mark = tokio::time::Instant::now();
            }
        }
    }

    println!();
    println!("Stopping recording...");
    let reason = if running.load(Ordering::SeqCst) {
        "duration_elapsed"
    } else {
        "interrupted"
    };
    let report = orchestrator
        .stop_with_reason(reason)
        .await
        .context("failed to stop recording")?;

    recovery.shutdown();

    if report.status == StopStatus::Stopped {
        if let Some(summary) = &report.summary {
            print_session(&summary.session);
            for (sensor, message) in &summary.stop_failures {
                println!("  {sensor} failed to stop: {message}");
            }
            println!();
            println!("Files:");
            for file in &summary.output_files {
                println!("  {}", file.display());
            }
        }
    }

    if let Err(e) = audit.save() {
        eprintln!("Warning: Could not save audit log: {e}");
    }
    println!();
    println!("{}", audit.summary());
    Ok(())
}

fn cmd_sessions() -> Result<()> {
    let config = load_config();
    let sessions = SessionManager::new(
        TimeBase::shared(),
        config.sessions_path.clone(),
        config.session_prefix.clone(),
    );

    let ids = sessions.list_sessions().context("could not list sessions")?;
    if ids.is_empty() {
        println!("No sessions found in {}", config.sessions_path.display());
        println!("Run 'mmcapture record' to record one.");
        return Ok(());
    }

    println!("{:<36} {:<24} {:>10}  Data", "Session", "Started", "Duration");
    for id in ids {
        match sessions.load_session(&id) {
            Ok(session) => println!(
                "{:<36} {:<24} {:>10}  {}",
                session.session_id,
                TimeBase::format_timestamp(session.start_time_ms),
                Session::format_duration(session.duration_ms(session.start_time_ms)),
                session.data_type_summary()
            ),
            Err(_) => println!("{id:<36} (not finalized)"),
        }
    }
    Ok(())
}

fn cmd_show(session_id: &str) -> Result<()> {
    let config = load_config();
    let sessions = SessionManager::new(
        TimeBase::shared(),
        config.sessions_path.clone(),
        config.session_prefix.clone(),
    );
    let session = sessions
        .load_session(session_id)
        .with_context(|| format!("could not load session {session_id}"))?;

    print_session(&session);

    let signals = sessions.layout(session_id).signals_csv();
    if signals.exists() {
        let samples = read_signals(&signals).context("could not read signals.csv")?;
        if let Some(stats) = SignalStatistics::from_samples(&samples) {
            println!();
            println!("Biosignal:");
            println!("  Samples: {}", stats.sample_count);
            println!(
                "  Conductance: mean {:.2} µS, sd {:.2}, range {:.2}-{:.2}",
                stats.mean_conductance_us,
                stats.std_conductance_us,
                stats.min_conductance_us,
                stats.max_conductance_us
            );
            println!("  Effective rate: {:.1} Hz", stats.effective_rate_hz);
        }
    }

    if !session.sync_marks.is_empty() {
        println!();
        println!("Sync marks:");
        for mark in &session.sync_marks {
            println!(
                "  {} {}",
                TimeBase::format_timestamp(mark.utc_timestamp_ms),
                mark.event_type
            );
        }
    }
    Ok(())
}

fn cmd_status() -> Result<()> {
    let config = load_config();

    println!("Multimodal Capture Status");
    println!("=========================");
    println!();
    println!("Configuration:");
    println!("  Sessions: {}", config.sessions_path.display());
    println!(
        "  Default sensors: {}",
        multimodal_capture::core::join_sensors(&config.sensors.kinds())
    );
    println!(
        "  Biosignal: {} Hz{}",
        config.biosignal.sampling_rate_hz,
        if config.biosignal.simulate {
            " (simulated)"
        } else {
            ""
        }
    );
    println!();

    if config.audit_path().exists() {
        let audit = AuditLog::with_persistence(config.audit_path());
        println!("{}", audit.summary());
    } else {
        println!("No previous recording data found.");
    }
    Ok(())
}

fn cmd_config() -> Result<()> {
    let config = load_config();

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&config).context("could not serialize config")?
    );
    Ok(())
}

fn print_session(session: &Session) {
    println!();
    println!("Session {}", session.session_id);
    println!("  Started: {}", TimeBase::format_timestamp(session.start_time_ms));
    if let Some(end) = session.end_time_ms() {
        println!("  Ended: {}", TimeBase::format_timestamp(end));
    }
    println!(
        "  Duration: {}",
        Session::format_duration(session.duration_ms(session.start_time_ms))
    );
    if let Some(participant) = &session.participant_id {
        println!("  Participant: {participant}");
    }
    if let Some(study) = &session.study_name {
        println!("  Study: {study}");
    }
    println!("  Data: {}", session.data_type_summary());
    for (sensor, summary) in &session.sensor_summaries {
        println!(
            "  {sensor}: {} records, {} sync marks",
            summary.sample_count, summary.sync_mark_count
        );
    }
}

fn read_replay_file(path: &Path) -> Result<Vec<u16>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("could not read {}", path.display()))?;
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.parse::<u16>()
                .with_context(|| format!("invalid raw reading {line:?}"))
        })
        .collect()
}

/// Set up Ctrl+C handler.
fn ctrlc_handler(running: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .context("could not set Ctrl+C handler")
}

fn log_recovery_event(event: &RecoveryEvent) {
    match event {
        RecoveryEvent::RecoveryStarted { error, strategy, .. } => {
            info!(service_id = %error.service_id, strategy = %strategy, "recovering: {}", error.kind);
        }
        RecoveryEvent::RecoverySucceeded { error, attempts } => {
            info!(service_id = %error.service_id, attempts, "recovered from {}", error.kind);
        }
        RecoveryEvent::RecoveryFailed { error, message, .. } => {
            warn!(service_id = %error.service_id, "recovery failed: {message}");
        }
        RecoveryEvent::Unresolved { error, reason } => {
            warn!(service_id = %error.service_id, "{}: {reason}", error.message);
        }
        _ => {}
    }
}
