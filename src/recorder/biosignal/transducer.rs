//! Driver seam for the GSR transducer.

use async_trait::async_trait;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransducerError {
    #[error("transducer not connected")]
    NotConnected,

    #[error("transducer unavailable: {0}")]
    Unavailable(String),

    #[error("read failed: {0}")]
    ReadFailed(String),

    #[error("transducer disconnected: {0}")]
    Disconnected(String),
}

/// A source of raw 12-bit GSR readings.
///
/// The transport (e.g. Bluetooth) lives behind this trait.
#[async_trait]
pub trait GsrTransducer: Send {
    async fn connect(&mut self) -> Result<(), TransducerError>;

    async fn read_raw(&mut self) -> Result<u16, TransducerError>;

    async fn disconnect(&mut self);

    fn describe(&self) -> String;
}

/// Replays a recorded raw-ADC sequence, cycling when it runs out.
#[derive(Debug, Clone)]
pub struct ReplayTransducer {
    values: Vec<u16>,
    cursor: usize,
    reads: u64,
    connected: bool,
    connect_failures: u32,
    failing_reads: HashSet<u64>,
    fail_from: Option<u64>,
}

impl ReplayTransducer {
    pub fn new(values: Vec<u16>) -> Self {
        Self {
            values,
            cursor: 0,
            reads: 0,
            connected: false,
            connect_failures: 0,
            failing_reads: HashSet::new(),
            fail_from: None,
        }
    }

    /// A transducer whose every connect fails.
    pub fn unavailable() -> Self {
        Self::new(Vec::new()).with_connect_failures(u32::MAX)
    }

    /// The next `count` connect attempts fail.
    pub fn with_connect_failures(mut self, count: u32) -> Self {
        self.connect_failures = count;
        self
    }

    /// Read attempts with these zero-based numbers fail.
    pub fn with_failing_reads(mut self, reads: impl IntoIterator<Item = u64>) -> Self {
        self.failing_reads.extend(reads);
        self
    }

    /// Every read attempt from number `read` on fails.
    pub fn failing_from(mut self, read: u64) -> Self {
        self.fail_from = Some(read);
        self
    }

    /// Read attempts made so far, failed ones included.
    pub fn reads(&self) -> u64 {
        self.reads
    }
}

#[async_trait]
impl GsrTransducer for ReplayTransducer {
    async fn connect(&mut self) -> Result<(), TransducerError> {
        if self.connect_failures > 0 {
            self.connect_failures -= 1;
            return Err(TransducerError::Unavailable(
                "replay device not reachable".to_string(),
            ));
        }
        if self.values.is_empty() {
            return Err(TransducerError::Unavailable(
                "replay sequence is empty".to_string(),
            ));
        }
        self.connected = true;
        Ok(())
    }

    async fn read_raw(&mut self) -> Result<u16, TransducerError> {
        if !self.connected {
            return Err(TransducerError::NotConnected);
        }
        let attempt = self.reads;
        self.reads += 1;
        if self.failing_reads.contains(&attempt) || self.fail_from.is_some_and(|n| attempt >= n) {
            return Err(TransducerError::ReadFailed(format!(
                "injected failure on read {attempt}"
            )));
        }
        let value = self.values[self.cursor % self.values.len()];
        self.cursor += 1;
        Ok(value)
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    fn describe(&self) -> String {
        format!("replay transducer ({} values)", self.values.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replay_cycles_values() {
        let mut t = ReplayTransducer::new(vec![100, 200]);
        assert_eq!(t.read_raw().await, Err(TransducerError::NotConnected));
        t.connect().await.unwrap();
        assert_eq!(t.read_raw().await, Ok(100));
        assert_eq!(t.read_raw().await, Ok(200));
        assert_eq!(t.read_raw().await, Ok(100));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let mut t = ReplayTransducer::new(vec![1000])
            .with_connect_failures(1)
            .with_failing_reads([1]);
        assert!(t.connect().await.is_err());
        t.connect().await.unwrap();

        assert!(t.read_raw().await.is_ok());
        assert!(matches!(
            t.read_raw().await,
            Err(TransducerError::ReadFailed(_))
        ));
        assert!(t.read_raw().await.is_ok());
        assert_eq!(t.reads(), 3);
    }
}
