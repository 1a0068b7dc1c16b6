//! Configuration for the capture orchestrator.

use crate::core::SensorKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const APP_DIR: &str = "multimodal-capture";

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path for the audit log and other state
    pub data_path: PathBuf,

    /// Root directory holding one directory per session
    pub sessions_path: PathBuf,

    /// Prefix of generated session ids
    pub session_prefix: String,

    /// Sensors recorded when none are named on the command line
    pub sensors: SensorSelection,

    pub biosignal: BiosignalConfig,

    pub camera: CameraConfig,

    /// Per-sensor bound on `start()`
    #[serde(with = "duration_serde")]
    pub start_timeout: Duration,

    /// Per-sensor bound on `stop()`
    #[serde(with = "duration_serde")]
    pub stop_timeout: Duration,

    #[serde(with = "duration_serde")]
    pub health_check_interval: Duration,

    /// Consecutive unhealthy polls before a service is escalated
    pub health_failure_threshold: u32,

    /// Sensors that must all start, or the whole start is rolled back
    pub strict_sensors: BTreeSet<SensorKind>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);

        Self {
            sessions_path: data_dir.join("sessions"),
            data_path: data_dir,
            session_prefix: "MultiModal".to_string(),
            sensors: SensorSelection::default(),
            biosignal: BiosignalConfig::default(),
            camera: CameraConfig::default(),
            start_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(5),
            health_failure_threshold: 3,
            strict_sensors: BTreeSet::new(),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = serde_json::from_str(&content).map_err(ConfigError::Parse)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(&config_path, content)?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.json")
    }

    /// Location of the persisted audit log.
    pub fn audit_path(&self) -> PathBuf {
        self.data_path.join("audit.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_path)?;
        std::fs::create_dir_all(&self.sessions_path)?;
        Ok(())
    }
}

/// Which sensors to record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorSelection {
    pub thermal: bool,
    pub rgb: bool,
    pub biosignal: bool,
}

impl Default for SensorSelection {
    fn default() -> Self {
        Self {
            thermal: true,
            rgb: true,
            biosignal: true,
        }
    }
}

impl SensorSelection {
    /// Parse a selection from a comma-separated string such as `thermal,gsr`.
    pub fn from_csv(s: &str) -> Self {
        let sensors: Vec<String> = s.split(',').map(|s| s.trim().to_lowercase()).collect();
        let any = |names: &[&str]| sensors.iter().any(|s| s == "all" || names.contains(&s.as_str()));

        Self {
            thermal: any(&["thermal", "ir"]),
            rgb: any(&["rgb", "camera"]),
            biosignal: any(&["biosignal", "gsr", "eda"]),
        }
    }

    /// Check if at least one sensor is enabled.
    pub fn any_enabled(&self) -> bool {
        self.thermal || self.rgb || self.biosignal
    }

    pub fn kinds(&self) -> BTreeSet<SensorKind> {
        let mut kinds = BTreeSet::new();
        if self.thermal {
            kinds.insert(SensorKind::Thermal);
        }
        if self.rgb {
            kinds.insert(SensorKind::Rgb);
        }
        if self.biosignal {
            kinds.insert(SensorKind::Biosignal);
        }
        kinds
    }
}

/// Biosignal acquisition settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BiosignalConfig {
    pub sampling_rate_hz: f64,
    /// Samples per flush of `signals.csv`
    pub flush_batch: usize,
    /// Skip the transducer and generate samples
    pub simulate: bool,
    /// Fail the start instead of falling back when the transducer cannot connect
    pub require_hardware: bool,
    pub fallback_seed: u64,
    /// Consecutive failed reads before the sensor is treated as disconnected
    pub failure_threshold: u32,
}

impl Default for BiosignalConfig {
    fn default() -> Self {
        Self {
            sampling_rate_hz: 128.0,
            flush_batch: 10,
            simulate: false,
            require_hardware: false,
            fallback_seed: 42,
            failure_threshold: 5,
        }
    }
}

/// Camera settings used for the built-in simulated frame sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub thermal_fps: f64,
    pub rgb_fps: f64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            thermal_fps: 25.0,
            rgb_fps: 30.0,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(serde_json::Error),

    #[error("Serialize error: {0}")]
    Serialize(serde_json::Error),
}

/// Serde support for Duration as integer milliseconds.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensor_selection_parsing() {
        let selection = SensorSelection::from_csv("thermal,gsr");
        assert!(selection.thermal);
        assert!(!selection.rgb);
        assert!(selection.biosignal);

        let selection = SensorSelection::from_csv("RGB");
        assert_eq!(selection.kinds().into_iter().collect::<Vec<_>>(), vec![SensorKind::Rgb]);

        let selection = SensorSelection::from_csv("all");
        assert_eq!(selection.kinds().len(), 3);

        assert!(!SensorSelection::from_csv("lidar").any_enabled());
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.session_prefix, "MultiModal");
        assert_eq!(config.biosignal.sampling_rate_hz, 128.0);
        assert_eq!(config.biosignal.flush_batch, 10);
        assert_eq!(config.start_timeout, Duration::from_secs(5));
        assert_eq!(config.health_failure_threshold, 3);
        assert!(config.strict_sensors.is_empty());
    }

    #[test]
    fn test_durations_serialize_as_millis() {
        let config = Config {
            start_timeout: Duration::from_millis(1500),
            ..Config::default()
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["start_timeout"], 1500);

        let parsed: Config =
            serde_json::from_str(r#"{"start_timeout": 250, "strict_sensors": ["rgb"]}"#).unwrap();
        assert_eq!(parsed.start_timeout, Duration::from_millis(250));
        assert!(parsed.strict_sensors.contains(&SensorKind::Rgb));
        assert_eq!(parsed.stop_timeout, Duration::from_secs(5));
    }
}
