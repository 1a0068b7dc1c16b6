//! Core building blocks shared by every subsystem.
//!
//! This module contains:
//! - The shared time base every timestamp is issued from
//! - The session data model (sessions, samples, sync marks, summaries)
//! - The listener registry used for event fan-out

pub mod listeners;
pub mod timebase;
pub mod types;

// Re-export commonly used types
pub use listeners::{ListenerRegistry, SubscriptionId};
pub use timebase::{ClockSource, ManualClock, SharedTimeBase, SystemClock, TimeBase, Timestamp};
pub use types::{
    decode_metadata, encode_metadata, join_sensors, BiosignalSample, RecordingOutcome, SensorKind,
    Session, SessionSummary, SyncMark,
};
