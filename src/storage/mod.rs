//! On-disk persistence for recording sessions.
//!
//! Every session owns one directory under the sessions root. Recorders append
//! rows to their own CSV logs; finalized metadata is written as JSON with an
//! atomic temp-file rename so a crash never leaves a half-written file behind.

pub mod csv_log;
pub mod layout;
pub mod metadata;
pub mod stats;

pub use csv_log::{
    read_frames, read_signals, read_sync_marks, CsvLog, FrameRow, SyncMarkRow, FRAMES_HEADER,
    SIGNALS_HEADER, SYNC_MARKS_HEADER,
};
pub use layout::SessionLayout;
pub use metadata::{read_json, write_json_atomic};
pub use stats::SignalStatistics;

use crate::recovery::ErrorKind;
use std::path::PathBuf;
use thiserror::Error;

/// ENOSPC on Linux and macOS.
const NO_SPACE_OS_ERROR: i32 = 28;

/// Errors from session file I/O.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error on {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("JSON error on {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn csv(path: impl Into<PathBuf>, source: csv::Error) -> Self {
        StorageError::Csv {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        StorageError::Json {
            path: path.into(),
            source,
        }
    }

    /// Recovery classification for storage faults, if the fault is one the
    /// recovery manager has a dedicated kind for.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            StorageError::Io { source, .. } => classify(source.kind(), source.raw_os_error()),
            StorageError::Csv { source, .. } => match source.kind() {
                csv::ErrorKind::Io(err) => classify(err.kind(), err.raw_os_error()),
                _ => None,
            },
            StorageError::Json { source, .. } => {
                source.io_error_kind().and_then(|kind| classify(kind, None))
            }
        }
    }
}

fn classify(kind: std::io::ErrorKind, raw_os_error: Option<i32>) -> Option<ErrorKind> {
    if kind == std::io::ErrorKind::PermissionDenied {
        Some(ErrorKind::StorageAccessDenied)
    } else if raw_os_error == Some(NO_SPACE_OS_ERROR) {
        Some(ErrorKind::StorageFull)
    } else {
        None
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
