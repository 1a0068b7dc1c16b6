//! Shared time base for every stream in a recording session.
//!
//! All timestamps written by recorders, the orchestrator, the session manager
//! and the recovery manager are issued here. Device time is a wall-clock anchor
//! captured once plus monotonic elapsed time, so it never runs backwards. The
//! wall-clock component additionally carries an external reference offset
//! (e.g. from a paired host) which only affects timestamps issued afterwards.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A correlated pair of device and wall-clock times, in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Monotonic device time
    pub device_ms: i64,
    /// Device time corrected by the external clock offset
    pub wall_clock_ms: i64,
}

impl Timestamp {
    /// Milliseconds elapsed on the device clock since `earlier`.
    pub fn millis_since(&self, earlier: &Timestamp) -> i64 {
        self.device_ms - earlier.device_ms
    }
}

/// Source of raw device time in milliseconds.
pub trait ClockSource: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Wall-clock anchor plus monotonic elapsed time.
#[derive(Debug)]
pub struct SystemClock {
    anchor_instant: Instant,
    anchor_wall_ms: i64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            anchor_instant: Instant::now(),
            anchor_wall_ms: Utc::now().timestamp_millis(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for SystemClock {
    fn now_ms(&self) -> i64 {
        self.anchor_wall_ms + self.anchor_instant.elapsed().as_millis() as i64
    }
}

/// Manually driven clock for deterministic tests and offline replay.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: i64) {
        self.now_ms.fetch_add(ms.max(0), Ordering::SeqCst);
    }

    /// Moves the clock to `ms`; earlier values are ignored so time never runs backwards.
    pub fn set(&self, ms: i64) {
        self.now_ms.fetch_max(ms, Ordering::SeqCst);
    }
}

impl ClockSource for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// The single trusted translation layer between sensor clocks and wall time.
pub struct TimeBase {
    clock: Arc<dyn ClockSource>,
    anchor_ms: i64,
    external_offset_ms: AtomicI64,
    last_session_token_ms: AtomicI64,
}

impl std::fmt::Debug for TimeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeBase")
            .field("anchor_ms", &self.anchor_ms)
            .field("external_offset_ms", &self.external_clock_offset())
            .finish()
    }
}

/// Thread-safe shared time base.
pub type SharedTimeBase = Arc<TimeBase>;

impl TimeBase {
    /// Time base backed by the system clock.
    pub fn system() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn ClockSource>) -> Self {
        let anchor_ms = clock.now_ms();
        Self {
            clock,
            anchor_ms,
            external_offset_ms: AtomicI64::new(0),
            last_session_token_ms: AtomicI64::new(i64::MIN),
        }
    }

    /// Convenience constructor returning a shared handle.
    pub fn shared() -> SharedTimeBase {
        Arc::new(Self::system())
    }

    /// Current device and wall-clock time.
    pub fn now(&self) -> Timestamp {
        let device_ms = self.clock.now_ms();
        Timestamp {
            device_ms,
            wall_clock_ms: device_ms + self.external_offset_ms.load(Ordering::SeqCst),
        }
    }

    /// Sets the offset applied to the wall-clock component of future timestamps.
    pub fn set_external_clock_offset(&self, offset_ms: i64) {
        let previous = self.external_offset_ms.swap(offset_ms, Ordering::SeqCst);
        tracing::info!(previous, offset_ms, "external clock offset updated");
    }

    pub fn external_clock_offset(&self) -> i64 {
        self.external_offset_ms.load(Ordering::SeqCst)
    }

    /// Generates `"{prefix}_{YYYYMMDD_HHMMSS_mmm}"`.
    ///
    /// The token is strictly increasing for the lifetime of this time base, so
    /// ids with the same prefix sort lexically in issue order and never repeat.
    pub fn new_session_id(&self, prefix: &str) -> String {
        let now = self.now().wall_clock_ms;
        let mut last = self.last_session_token_ms.load(Ordering::SeqCst);
        let token_ms = loop {
            let candidate = if now > last { now } else { last + 1 };
            match self.last_session_token_ms.compare_exchange(
                last,
                candidate,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break candidate,
                Err(actual) => last = actual,
            }
        };

        let token = to_datetime(token_ms)
            .format("%Y%m%d_%H%M%S_%3f")
            .to_string();
        format!("{prefix}_{token}")
    }

    /// Human-readable `YYYY-MM-DD HH:MM:SS.mmm` (UTC).
    pub fn format_timestamp(ms: i64) -> String {
        to_datetime(ms).format("%Y-%m-%d %H:%M:%S%.3f").to_string()
    }

    /// Timing details recorded alongside each session for later auditing.
    pub fn timing_metadata(&self) -> BTreeMap<String, String> {
        let now = self.now();
        let mut meta = BTreeMap::new();
        meta.insert("timing.anchor_ms".to_string(), self.anchor_ms.to_string());
        meta.insert(
            "timing.external_offset_ms".to_string(),
            self.external_clock_offset().to_string(),
        );
        meta.insert("timing.device_ms".to_string(), now.device_ms.to_string());
        meta.insert(
            "timing.wall_clock_ms".to_string(),
            now.wall_clock_ms.to_string(),
        );
        meta.insert(
            "timing.mode".to_string(),
            "monotonic_anchor_with_offset".to_string(),
        );
        meta
    }
}

fn to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual(start: i64) -> (Arc<ManualClock>, TimeBase) {
        let clock = Arc::new(ManualClock::new(start));
        let tb = TimeBase::with_clock(clock.clone());
        (clock, tb)
    }

    #[test]
    fn test_offset_is_forward_only() {
        let (clock, tb) = manual(1_700_000_000_000);
        let before = tb.now();

        tb.set_external_clock_offset(250);
        clock.advance(10);
        let after = tb.now();

        assert_eq!(before.wall_clock_ms, before.device_ms);
        assert_eq!(after.wall_clock_ms, after.device_ms + 250);
        assert_eq!(after.device_ms - before.device_ms, 10);
    }

    #[test]
    fn test_session_ids_sort_chronologically_and_never_repeat() {
        let (clock, tb) = manual(1_700_000_000_000);
        let a = tb.new_session_id("GSR");
        let b = tb.new_session_id("GSR");
        clock.advance(1_500);
        let c = tb.new_session_id("GSR");

        assert!(a.starts_with("GSR_20231114_"));
        assert_ne!(a, b);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let tb = TimeBase::system();
        let first = tb.now();
        let second = tb.now();
        assert!(second.device_ms >= first.device_ms);
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(
            TimeBase::format_timestamp(1_700_000_000_123),
            "2023-11-14 22:13:20.123"
        );
    }

    #[test]
    fn test_timing_metadata_keys() {
        let (_clock, tb) = manual(42);
        tb.set_external_clock_offset(-5);
        let meta = tb.timing_metadata();
        assert_eq!(meta["timing.external_offset_ms"], "-5");
        assert_eq!(meta["timing.anchor_ms"], "42");
    }
}
