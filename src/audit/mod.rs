//! Audit module for recording activity.
//!
//! Tracks what the capture stack has done across runs (sessions, samples,
//! sync marks, recoveries) so an operator can review it with
//! `mmcapture status`.

pub mod log;

pub use log::{AuditLog, AuditStats, SharedAuditLog};
