//! Default recovery strategy table.
//!
//! Services own their reconnect and reset logic and expose it through their
//! health check, so the default action re-probes that check: healthy means
//! recovered, unhealthy means try again (or give up, for faults that need a
//! person to act).

use super::types::{ErrorKind, RecoveryContext, RecoveryResult, RecoveryStrategy};
use crate::core::SensorKind;
use std::time::Duration;

/// `(kind, name, max retries, delay ms, requires intervention)`
const DEFAULT_TABLE: &[(ErrorKind, &str, u32, u64, bool)] = &[
    (
        ErrorKind::SensorDisconnection(SensorKind::Biosignal),
        "biosignal_reconnect",
        5,
        3000,
        false,
    ),
    (
        ErrorKind::DataStreamFailure(SensorKind::Biosignal),
        "biosignal_stream_restart",
        3,
        1000,
        false,
    ),
    (
        ErrorKind::SensorDisconnection(SensorKind::Thermal),
        "thermal_reconnect",
        3,
        2000,
        false,
    ),
    (
        ErrorKind::DataStreamFailure(SensorKind::Thermal),
        "thermal_stream_restart",
        2,
        1500,
        false,
    ),
    (
        ErrorKind::RecordingStartFailure(SensorKind::Thermal),
        "thermal_recording_restart",
        2,
        1500,
        false,
    ),
    (
        ErrorKind::SensorDisconnection(SensorKind::Rgb),
        "rgb_reconnect",
        3,
        2000,
        false,
    ),
    (
        ErrorKind::DataStreamFailure(SensorKind::Rgb),
        "rgb_stream_restart",
        2,
        1000,
        false,
    ),
    (
        ErrorKind::RecordingStartFailure(SensorKind::Rgb),
        "rgb_recording_restart",
        2,
        1000,
        false,
    ),
    (
        ErrorKind::RecordingStartFailure(SensorKind::Biosignal),
        "biosignal_recording_restart",
        3,
        2000,
        false,
    ),
    (
        ErrorKind::CameraAccessDenied,
        "camera_permission_check",
        1,
        0,
        true,
    ),
    (ErrorKind::StorageFull, "storage_space_check", 1, 0, true),
    (
        ErrorKind::StorageAccessDenied,
        "storage_permission_check",
        2,
        1000,
        false,
    ),
    (
        ErrorKind::TransportConnectionLost,
        "transport_reconnect",
        4,
        2500,
        false,
    ),
    (
        ErrorKind::DeviceUnresponsive,
        "device_reset",
        3,
        5000,
        false,
    ),
    (
        ErrorKind::SessionCorruption,
        "session_integrity_check",
        1,
        0,
        false,
    ),
    (
        ErrorKind::SynchronizationFailure,
        "sync_realign",
        2,
        1000,
        false,
    ),
    (ErrorKind::BatteryCritical, "battery_check", 1, 0, true),
    (
        ErrorKind::MemoryExhaustion,
        "buffer_release",
        2,
        1000,
        false,
    ),
    (
        ErrorKind::ServiceUnhealthy,
        "service_health_recheck",
        DEFAULT_MAX_RETRIES,
        DEFAULT_RETRY_DELAY_MS,
        false,
    ),
];

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 2000;

/// Strategy whose action re-probes the failing service's health check.
pub fn health_probe_strategy(
    name: &str,
    max_retries: u32,
    retry_delay: Duration,
    requires_intervention: bool,
) -> RecoveryStrategy {
    let strategy = RecoveryStrategy::new(name, max_retries, retry_delay, move |ctx| {
        probe_service(ctx, requires_intervention)
    });
    if requires_intervention {
        strategy.requiring_intervention()
    } else {
        strategy
    }
}

async fn probe_service(ctx: RecoveryContext, requires_intervention: bool) -> RecoveryResult {
    match ctx.probe_health().await {
        Some(true) => RecoveryResult::Recovered,
        Some(false) if requires_intervention => RecoveryResult::Abort(format!(
            "{} on {} needs user action",
            ctx.error.kind, ctx.error.service_id
        )),
        Some(false) => RecoveryResult::Retry(format!("{} still unhealthy", ctx.error.service_id)),
        None if requires_intervention => RecoveryResult::Abort(format!(
            "{} on {} needs user action",
            ctx.error.kind, ctx.error.service_id
        )),
        None => RecoveryResult::Retry(format!(
            "no health check registered for {}",
            ctx.error.service_id
        )),
    }
}

/// The built-in strategy table. Recording stop failures have no entry and are
/// surfaced to the caller.
pub fn default_strategies() -> Vec<(ErrorKind, RecoveryStrategy)> {
    DEFAULT_TABLE
        .iter()
        .map(|(kind, name, retries, delay_ms, intervention)| {
            (
                *kind,
                health_probe_strategy(
                    name,
                    *retries,
                    Duration::from_millis(*delay_ms),
                    *intervention,
                ),
            )
        })
        .collect()
}
