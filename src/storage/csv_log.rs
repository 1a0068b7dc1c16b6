//! Append-only CSV logs with batched flushing.

use super::{Result, StorageError};
use crate::core::{decode_metadata, encode_metadata, BiosignalSample, SyncMark};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

pub const SIGNALS_HEADER: [&str; 6] = [
    "timestamp_ms",
    "utc_timestamp_ms",
    "conductance_us",
    "resistance_kohms",
    "sample_index",
    "session_id",
];

pub const SYNC_MARKS_HEADER: [&str; 5] = [
    "timestamp_ms",
    "utc_timestamp_ms",
    "event_type",
    "session_id",
    "metadata",
];

pub const FRAMES_HEADER: [&str; 6] = [
    "frame_index",
    "timestamp_ms",
    "utc_timestamp_ms",
    "width",
    "height",
    "session_id",
];

/// A sync mark as stored on disk, with its metadata flattened to `k=v;k=v`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMarkRow {
    pub timestamp_ms: i64,
    pub utc_timestamp_ms: i64,
    pub event_type: String,
    pub session_id: String,
    pub metadata: String,
}

impl From<&SyncMark> for SyncMarkRow {
    fn from(mark: &SyncMark) -> Self {
        Self {
            timestamp_ms: mark.timestamp_ms,
            utc_timestamp_ms: mark.utc_timestamp_ms,
            event_type: mark.event_type.clone(),
            session_id: mark.session_id.clone(),
            metadata: encode_metadata(&mark.metadata),
        }
    }
}

impl From<SyncMarkRow> for SyncMark {
    fn from(row: SyncMarkRow) -> Self {
        SyncMark {
            timestamp_ms: row.timestamp_ms,
            utc_timestamp_ms: row.utc_timestamp_ms,
            event_type: row.event_type,
            session_id: row.session_id,
            metadata: decode_metadata(&row.metadata),
        }
    }
}

/// One row of a camera frame timestamp index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRow {
    pub frame_index: u64,
    pub timestamp_ms: i64,
    pub utc_timestamp_ms: i64,
    pub width: u32,
    pub height: u32,
    pub session_id: String,
}

/// Append-only CSV file owned by exactly one recorder.
///
/// The header is written and flushed on creation. Rows are flushed every
/// `batch` appends, bounding loss on a crash to fewer than `batch` rows.
pub struct CsvLog<R> {
    path: PathBuf,
    writer: csv::Writer<File>,
    batch: usize,
    pending: usize,
    rows_written: u64,
    _row: PhantomData<fn(&R)>,
}

impl<R: Serialize> CsvLog<R> {
    pub fn create(path: &Path, header: &[&str], batch: usize) -> Result<Self> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(path)
            .map_err(|e| StorageError::csv(path, e))?;
        writer
            .write_record(header)
            .map_err(|e| StorageError::csv(path, e))?;
        writer.flush().map_err(|e| StorageError::io(path, e))?;

        Ok(Self {
            path: path.to_path_buf(),
            writer,
            batch: batch.max(1),
            pending: 0,
            rows_written: 0,
            _row: PhantomData,
        })
    }

    pub fn append(&mut self, row: &R) -> Result<()> {
        self.writer
            .serialize(row)
            .map_err(|e| StorageError::csv(&self.path, e))?;
        self.pending += 1;
        self.rows_written += 1;
        if self.pending >= self.batch {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| StorageError::io(&self.path, e))?;
        self.pending = 0;
        Ok(())
    }

    /// Flushes outstanding rows and returns the number of rows written.
    pub fn close(mut self) -> Result<u64> {
        self.flush()?;
        Ok(self.rows_written)
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CsvLog<SyncMarkRow> {
    /// Sync-mark log, flushed after every row.
    pub fn sync_marks(path: &Path) -> Result<Self> {
        Self::create(path, &SYNC_MARKS_HEADER, 1)
    }

    pub fn append_mark(&mut self, mark: &SyncMark) -> Result<()> {
        self.append(&SyncMarkRow::from(mark))
    }
}

fn read_rows<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| StorageError::csv(path, e))?;
    reader
        .deserialize()
        .collect::<std::result::Result<Vec<T>, _>>()
        .map_err(|e| StorageError::csv(path, e))
}

/// Re-parses a `signals.csv` file.
pub fn read_signals(path: &Path) -> Result<Vec<BiosignalSample>> {
    read_rows(path)
}

/// Re-parses a sync-mark log, restoring each metadata map.
pub fn read_sync_marks(path: &Path) -> Result<Vec<SyncMark>> {
    Ok(read_rows::<SyncMarkRow>(path)?
        .into_iter()
        .map(SyncMark::from)
        .collect())
}

pub fn read_frames(path: &Path) -> Result<Vec<FrameRow>> {
    read_rows(path)
}
