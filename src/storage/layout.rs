//! Per-session directory layout.

use crate::core::SensorKind;
use std::path::{Path, PathBuf};

pub const SIGNALS_FILE: &str = "signals.csv";
pub const SYNC_MARKS_FILE: &str = "sync_marks.csv";
pub const SESSION_METADATA_FILE: &str = "session_metadata.json";
pub const BIOSIGNAL_SUMMARY_FILE: &str = "biosignal_summary.json";

/// Names every file a session directory may contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLayout {
    dir: PathBuf,
}

impl SessionLayout {
    pub fn new(sessions_root: &Path, session_id: &str) -> Self {
        Self {
            dir: sessions_root.join(session_id),
        }
    }

    /// Layout rooted at an already-resolved session directory.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn signals_csv(&self) -> PathBuf {
        self.dir.join(SIGNALS_FILE)
    }

    pub fn sync_marks_csv(&self) -> PathBuf {
        self.dir.join(SYNC_MARKS_FILE)
    }

    pub fn session_metadata_json(&self) -> PathBuf {
        self.dir.join(SESSION_METADATA_FILE)
    }

    pub fn biosignal_summary_json(&self) -> PathBuf {
        self.dir.join(BIOSIGNAL_SUMMARY_FILE)
    }

    /// `<kind>_frames.csv`, the frame timestamp index of a camera recorder.
    pub fn frames_csv(&self, kind: SensorKind) -> PathBuf {
        self.dir.join(format!("{}_frames.csv", kind.as_str()))
    }

    /// `<kind>_sync_marks.csv`, the sync-mark log of a camera recorder.
    pub fn camera_sync_marks_csv(&self, kind: SensorKind) -> PathBuf {
        self.dir.join(format!("{}_sync_marks.csv", kind.as_str()))
    }

    /// Creates the session directory (and parents) if missing.
    pub fn ensure(&self) -> super::Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| super::StorageError::io(&self.dir, e))
    }
}
