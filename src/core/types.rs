//! Shared data model for recording sessions.

use crate::core::timebase::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

/// The closed set of sensor modalities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Thermal,
    Rgb,
    Biosignal,
}

impl SensorKind {
    pub const ALL: [SensorKind; 3] = [SensorKind::Thermal, SensorKind::Rgb, SensorKind::Biosignal];

    /// Stable lowercase identifier used in file names and service ids.
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorKind::Thermal => "thermal",
            SensorKind::Rgb => "rgb",
            SensorKind::Biosignal => "biosignal",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            SensorKind::Thermal => "Thermal",
            SensorKind::Rgb => "RGB",
            SensorKind::Biosignal => "Biosignal",
        }
    }
}

impl std::fmt::Display for SensorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for SensorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "thermal" | "ir" => Ok(SensorKind::Thermal),
            "rgb" | "camera" => Ok(SensorKind::Rgb),
            "biosignal" | "gsr" | "eda" => Ok(SensorKind::Biosignal),
            other => Err(format!("unknown sensor kind: {other}")),
        }
    }
}

/// Joins sensor names with commas for sync-mark metadata and log lines.
pub fn join_sensors<'a>(sensors: impl IntoIterator<Item = &'a SensorKind>) -> String {
    sensors
        .into_iter()
        .map(|s| s.display_name())
        .collect::<Vec<_>>()
        .join(",")
}

/// One biosignal (galvanic skin response) sample.
///
/// Field names match the `signals.csv` header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiosignalSample {
    /// Device-clock timestamp
    pub timestamp_ms: i64,
    /// Correlated wall-clock timestamp
    pub utc_timestamp_ms: i64,
    /// Skin conductance in microsiemens
    pub conductance_us: f64,
    /// Skin resistance in kilohms
    pub resistance_kohms: f64,
    /// Strictly increasing per session, starting at 0
    pub sample_index: u64,
    pub session_id: String,
}

impl BiosignalSample {
    /// Conductance (µS) times resistance (kΩ) is 1000 for a consistent pair.
    pub fn is_reciprocal_consistent(&self, tolerance: f64) -> bool {
        if self.conductance_us <= 0.0 || self.resistance_kohms <= 0.0 {
            return false;
        }
        let expected = 1000.0 / self.conductance_us;
        (expected - self.resistance_kohms).abs() <= tolerance * self.resistance_kohms.max(1.0)
    }
}

/// Timestamped, labelled event used to align independently clocked streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMark {
    pub timestamp_ms: i64,
    pub utc_timestamp_ms: i64,
    /// e.g. `RECORDING_STARTED`, `USER_TRIGGER`
    pub event_type: String,
    pub session_id: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl SyncMark {
    pub fn new(
        at: Timestamp,
        event_type: impl Into<String>,
        session_id: impl Into<String>,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        Self {
            timestamp_ms: at.device_ms,
            utc_timestamp_ms: at.wall_clock_ms,
            event_type: event_type.into(),
            session_id: session_id.into(),
            metadata,
        }
    }
}

/// Flattens a metadata map as `k=v;k=v` (keys in sorted order).
pub fn encode_metadata(metadata: &BTreeMap<String, String>) -> String {
    metadata
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(";")
}

/// Inverse of [`encode_metadata`]. Splits entries on `;` and each entry on the first `=`.
pub fn decode_metadata(encoded: &str) -> BTreeMap<String, String> {
    encoded
        .split(';')
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (entry.to_string(), String::new()),
        })
        .collect()
}

/// Per-sensor result of a start or stop attempt. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingOutcome {
    pub sensor: SensorKind,
    pub success: bool,
    pub detail: String,
}

impl RecordingOutcome {
    pub fn succeeded(sensor: SensorKind, detail: impl Into<String>) -> Self {
        Self {
            sensor,
            success: true,
            detail: detail.into(),
        }
    }

    pub fn failed(sensor: SensorKind, detail: impl Into<String>) -> Self {
        Self {
            sensor,
            success: false,
            detail: detail.into(),
        }
    }
}

/// What a recorder reports when it stops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub sensor: SensorKind,
    pub session_id: Option<String>,
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
    pub duration_ms: i64,
    /// Samples (biosignal) or frames (cameras) written
    pub sample_count: u64,
    pub sync_mark_count: u64,
    /// Samples produced by the fallback generator while hardware was unreadable
    #[serde(default)]
    pub fallback_sample_count: u64,
    #[serde(default)]
    pub output_files: Vec<PathBuf>,
}

impl SessionSummary {
    /// Summary for a recorder that has never recorded.
    pub fn empty(sensor: SensorKind) -> Self {
        Self {
            sensor,
            session_id: None,
            start: None,
            end: None,
            duration_ms: 0,
            sample_count: 0,
            sync_mark_count: 0,
            fallback_sample_count: 0,
            output_files: Vec::new(),
        }
    }
}

/// One bounded recording episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub start_time_ms: i64,
    end_time_ms: Option<i64>,
    pub participant_id: Option<String>,
    pub study_name: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub sync_marks: Vec<SyncMark>,
    sample_count: u64,
    #[serde(default)]
    pub has_biosignal_data: bool,
    #[serde(default)]
    pub has_rgb_data: bool,
    #[serde(default)]
    pub has_thermal_data: bool,
    /// Per-sensor summaries merged in when the session is stopped
    #[serde(default)]
    pub sensor_summaries: BTreeMap<SensorKind, SessionSummary>,
}

impl Session {
    pub fn new(session_id: impl Into<String>, start_time_ms: i64) -> Self {
        Self {
            session_id: session_id.into(),
            start_time_ms,
            end_time_ms: None,
            participant_id: None,
            study_name: None,
            metadata: BTreeMap::new(),
            sync_marks: Vec::new(),
            sample_count: 0,
            has_biosignal_data: false,
            has_rgb_data: false,
            has_thermal_data: false,
            sensor_summaries: BTreeMap::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.end_time_ms.is_none()
    }

    pub fn end_time_ms(&self) -> Option<i64> {
        self.end_time_ms
    }

    /// Sets the end time once; later calls keep the first value.
    pub(crate) fn finish(&mut self, end_time_ms: i64) {
        if self.end_time_ms.is_none() {
            self.end_time_ms = Some(end_time_ms.max(self.start_time_ms));
        }
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    /// Raises the sample count; a lower value is ignored.
    pub fn record_sample_count(&mut self, count: u64) {
        self.sample_count = self.sample_count.max(count);
    }

    /// Duration until `now_ms` while active, or the recorded duration once finished.
    pub fn duration_ms(&self, now_ms: i64) -> i64 {
        self.end_time_ms.unwrap_or(now_ms) - self.start_time_ms
    }

    pub fn add_sync_mark(&mut self, mark: SyncMark) {
        self.sync_marks.push(mark);
    }

    pub fn mark_data_present(&mut self, sensor: SensorKind) {
        match sensor {
            SensorKind::Thermal => self.has_thermal_data = true,
            SensorKind::Rgb => self.has_rgb_data = true,
            SensorKind::Biosignal => self.has_biosignal_data = true,
        }
    }

    /// e.g. `"Biosignal, RGB"` or `"No data"`.
    pub fn data_type_summary(&self) -> String {
        let mut types = Vec::new();
        if self.has_biosignal_data {
            types.push("Biosignal");
        }
        if self.has_rgb_data {
            types.push("RGB");
        }
        if self.has_thermal_data {
            types.push("Thermal");
        }
        if types.is_empty() {
            "No data".to_string()
        } else {
            types.join(", ")
        }
    }

    /// `"1h 2m"`, `"3m 4s"` or `"5s"`.
    pub fn format_duration(duration_ms: i64) -> String {
        let seconds = duration_ms.max(0) / 1000;
        let minutes = seconds / 60;
        let hours = minutes / 60;
        if hours > 0 {
            format!("{}h {}m", hours, minutes % 60)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds % 60)
        } else {
            format!("{seconds}s")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensor_kind_parsing() {
        assert_eq!("GSR".parse::<SensorKind>(), Ok(SensorKind::Biosignal));
        assert_eq!(" rgb ".parse::<SensorKind>(), Ok(SensorKind::Rgb));
        assert_eq!("thermal".parse::<SensorKind>(), Ok(SensorKind::Thermal));
        assert!("lidar".parse::<SensorKind>().is_err());
    }

    #[test]
    fn test_metadata_flattening() {
        let mut meta = BTreeMap::new();
        meta.insert("selected".to_string(), "Thermal,RGB".to_string());
        meta.insert("expr".to_string(), "a=b".to_string());

        let encoded = encode_metadata(&meta);
        assert_eq!(encoded, "expr=a=b;selected=Thermal,RGB");
        assert_eq!(decode_metadata(&encoded), meta);
        assert!(decode_metadata("").is_empty());
    }

    #[test]
    fn test_session_end_time_is_never_cleared() {
        let mut session = Session::new("S1", 1_000);
        assert!(session.is_active());

        session.finish(5_000);
        session.finish(9_000);

        assert!(!session.is_active());
        assert_eq!(session.end_time_ms(), Some(5_000));
        assert_eq!(session.duration_ms(99_999), 4_000);
    }

    #[test]
    fn test_sample_count_is_monotonic() {
        let mut session = Session::new("S1", 0);
        session.record_sample_count(10);
        session.record_sample_count(4);
        assert_eq!(session.sample_count(), 10);
    }

    #[test]
    fn test_data_type_summary() {
        let mut session = Session::new("S1", 0);
        assert_eq!(session.data_type_summary(), "No data");
        session.mark_data_present(SensorKind::Rgb);
        session.mark_data_present(SensorKind::Biosignal);
        assert_eq!(session.data_type_summary(), "Biosignal, RGB");
    }

    #[test]
    fn test_duration_formatting() {
        assert_eq!(Session::format_duration(5_000), "5s");
        assert_eq!(Session::format_duration(185_000), "3m 5s");
        assert_eq!(Session::format_duration(3_720_000), "1h 2m");
    }

    #[test]
    fn test_reciprocal_consistency() {
        let sample = BiosignalSample {
            timestamp_ms: 0,
            utc_timestamp_ms: 0,
            conductance_us: 10.0,
            resistance_kohms: 100.0,
            sample_index: 0,
            session_id: "S".to_string(),
        };
        assert!(sample.is_reciprocal_consistent(1e-9));
    }
}
