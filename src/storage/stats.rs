//! Summary statistics over a recorded biosignal stream.

use crate::core::BiosignalSample;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalStatistics {
    pub sample_count: usize,
    pub mean_conductance_us: f64,
    pub std_conductance_us: f64,
    pub min_conductance_us: f64,
    pub max_conductance_us: f64,
    pub duration_ms: i64,
    /// Samples per second over the recorded span
    pub effective_rate_hz: f64,
}

impl SignalStatistics {
    /// Returns `None` for an empty stream.
    pub fn from_samples(samples: &[BiosignalSample]) -> Option<Self> {
        let first = samples.first()?;
        let last = samples.last()?;

        let conductance: Vec<f64> = samples.iter().map(|s| s.conductance_us).collect();
        let std_dev = if conductance.len() > 1 {
            conductance.iter().std_dev()
        } else {
            0.0
        };

        let duration_ms = last.timestamp_ms - first.timestamp_ms;
        let effective_rate_hz = if duration_ms > 0 {
            (samples.len() - 1) as f64 * 1000.0 / duration_ms as f64
        } else {
            0.0
        };

        Some(Self {
            sample_count: samples.len(),
            mean_conductance_us: conductance.iter().mean(),
            std_conductance_us: std_dev,
            min_conductance_us: Statistics::min(conductance.iter()),
            max_conductance_us: Statistics::max(conductance.iter()),
            duration_ms,
            effective_rate_hz,
        })
    }
}
