//! Incremental log reading and metrics extraction.

use chrono::Utc;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::backend::Backend;
use crate::types::MetricsEvent;

/// Follows an append-only log file, yielding each complete line once.
pub struct LogTailer {
    path: PathBuf,
    position: u64,
    partial: Vec<u8>,
}

impl LogTailer {
    /// Start tailing at the current end of `path` (or its beginning if it
    /// does not exist yet)
    pub fn from_end(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let position = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Self {
            path,
            position,
            partial: Vec::new(),
        }
    }

    pub fn from_start(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            position: 0,
            partial: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset of the next unread byte
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read whatever was appended since the last poll.
    ///
    /// A trailing line without its newline is held back until it completes.
    /// A file that shrank was truncated or rotated; reading restarts at 0.
    pub fn poll(&mut self) -> io::Result<Vec<String>> {
        let len = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        if len < self.position {
            info!(
                "Log {} shrank from {} to {} bytes, reading from the start",
                self.path.display(),
                self.position,
                len
            );
            self.position = 0;
            self.partial.clear();
        }
        if len == self.position {
            return Ok(Vec::new());
        }

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.position))?;
        let mut chunk = Vec::new();
        let read = file.take(len - self.position).read_to_end(&mut chunk)?;
        self.position += read as u64;

        self.partial.extend_from_slice(&chunk);
        let Some(last_newline) = self.partial.iter().rposition(|b| *b == b'\n') else {
            return Ok(Vec::new());
        };

        let rest = self.partial.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial, rest);

        Ok(complete
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| {
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                String::from_utf8_lossy(line).into_owned()
            })
            .collect())
    }
}

/// Folds backend log samples into cumulative [`MetricsEvent`]s.
///
/// Share counters stay monotonic across worker restarts: totals reached by
/// earlier workers become the base for the next one.
pub struct MetricsExtractor {
    backend: Arc<dyn Backend>,
    hashrate: f64,
    accepted: u64,
    rejected: u64,
    base_accepted: u64,
    base_rejected: u64,
}

impl MetricsExtractor {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            hashrate: 0.0,
            accepted: 0,
            rejected: 0,
            base_accepted: 0,
            base_rejected: 0,
        }
    }

    /// Parse one line; `None` when it carries no metrics
    pub fn ingest(&mut self, line: &str) -> Option<MetricsEvent> {
        let Some(sample) = self.backend.parse_log_line(line) else {
            debug!("Skipping log line: {}", line);
            return None;
        };

        if let Some(hashrate) = sample.hashrate {
            self.hashrate = hashrate.max(0.0);
        }
        if let Some(accepted) = sample.accepted {
            self.accepted = self.accepted.max(self.base_accepted + accepted);
        }
        if let Some(rejected) = sample.rejected {
            self.rejected = self.rejected.max(self.base_rejected + rejected);
        }

        Some(MetricsEvent {
            timestamp: Utc::now(),
            hashrate: self.hashrate,
            accepted: self.accepted,
            rejected: self.rejected,
            status: sample.status,
        })
    }

    /// A new worker starts counting from zero
    pub fn worker_restarted(&mut self) {
        self.base_accepted = self.accepted;
        self.base_rejected = self.rejected;
        self.hashrate = 0.0;
    }

    pub fn totals(&self) -> (u64, u64) {
        (self.accepted, self.rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SimulatedBackend, SimulatorOptions};
    use pretty_assertions::assert_eq;
    use std::fs::OpenOptions;
    use std::io::Write;

    fn append(path: &Path, text: &[u8]) {
        let mut file = OpenOptions::new().create(true).append(true).open(path).unwrap();
        file.write_all(text).unwrap();
    }

    #[test]
    fn test_starts_at_end_of_existing_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("session.log");
        append(&log, b"previous session line\n");

        let mut tailer = LogTailer::from_end(&log);
        assert!(tailer.poll().unwrap().is_empty());

        append(&log, b"new line\n");
        assert_eq!(tailer.poll().unwrap(), vec!["new line"]);
    }

    #[test]
    fn test_lines_emitted_once_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("session.log");
        let mut tailer = LogTailer::from_end(&log);
        assert!(tailer.poll().unwrap().is_empty());

        append(&log, b"one\ntwo\n");
        append(&log, b"three\n");
        assert_eq!(tailer.poll().unwrap(), vec!["one", "two", "three"]);
        assert!(tailer.poll().unwrap().is_empty());

        append(&log, b"four\r\n");
        assert_eq!(tailer.poll().unwrap(), vec!["four"]);
    }

    #[test]
    fn test_partial_lines_are_buffered() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("session.log");
        let mut tailer = LogTailer::from_start(&log);

        append(&log, b"Speed: 10");
        assert!(tailer.poll().unwrap().is_empty());
        append(&log, b"0 H/s\nnext");
        assert_eq!(tailer.poll().unwrap(), vec!["Speed: 100 H/s"]);
        append(&log, b"\n");
        assert_eq!(tailer.poll().unwrap(), vec!["next"]);
    }

    #[test]
    fn test_truncation_restarts_from_beginning() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("session.log");
        let mut tailer = LogTailer::from_start(&log);

        append(&log, b"a fairly long first line\nsecond line\n");
        assert_eq!(tailer.poll().unwrap().len(), 2);

        std::fs::write(&log, b"fresh\n").unwrap();
        assert_eq!(tailer.poll().unwrap(), vec!["fresh"]);
        assert_eq!(tailer.position(), 6);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("session.log");
        let mut tailer = LogTailer::from_start(&log);

        append(&log, b"bad \xff byte\n");
        assert_eq!(tailer.poll().unwrap(), vec!["bad \u{fffd} byte"]);
    }

    #[test]
    fn test_missing_log_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut tailer = LogTailer::from_end(dir.path().join("absent.log"));
        assert!(tailer.poll().unwrap().is_empty());
    }

    #[test]
    fn test_extractor_keeps_counters_monotonic_across_restarts() {
        let backend = Arc::new(SimulatedBackend::new(SimulatorOptions::default()));
        let mut extractor = MetricsExtractor::new(backend);

        assert!(extractor.ingest("Simulated miner starting | pool p:1").is_none());

        let event = extractor.ingest("[t] Speed: 1500.00 H/s | accepted=4 rejected=1").unwrap();
        assert_eq!((event.hashrate, event.accepted, event.rejected), (1500.0, 4, 1));

        extractor.worker_restarted();
        let event = extractor.ingest("[t] Speed: 1200.00 H/s | accepted=1 rejected=0").unwrap();
        assert_eq!((event.accepted, event.rejected), (5, 1));
        assert_eq!(extractor.totals(), (5, 1));
    }

    #[test]
    fn test_extractor_ignores_counter_regressions() {
        let backend = Arc::new(SimulatedBackend::new(SimulatorOptions::default()));
        let mut extractor = MetricsExtractor::new(backend);
        extractor.ingest("Speed: 10 H/s | accepted=7 rejected=2").unwrap();
        let event = extractor.ingest("Speed: 10 H/s | accepted=3 rejected=0").unwrap();
        assert_eq!((event.accepted, event.rejected), (7, 2));
    }
}
