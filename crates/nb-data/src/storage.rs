//! Append-only JSON-lines result log, one file per worker.
//!
//! Every append opens the file for the duration of the call, writes the
//! record as one buffer and syncs it before returning. A crash can therefore
//! leave at most one partial line at the end of the file, which the opening
//! scan drops and truncates away.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use nb_types::{PersistenceError, ResultKey, TrainingResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Exponential backoff for result writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 200,
            max_delay_ms: 5000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    pub fn with_initial_delay(mut self, delay_ms: u64) -> Self {
        self.initial_delay_ms = delay_ms;
        self
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }
}

/// Outcome of reading an existing result file.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub results: Vec<TrainingResult>,
    /// Byte length of the well-formed prefix of the file.
    pub valid_len: u64,
    pub skipped_lines: usize,
    pub truncated_tail: bool,
}

/// Parse a result file without modifying it.
///
/// A final line without its terminating newline is treated as a partial
/// write and excluded. Interior lines that do not parse are skipped.
pub fn scan_results<P: AsRef<Path>>(path: P) -> Result<ScanReport, PersistenceError> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|e| PersistenceError::ReadFailed {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut report = ScanReport::default();
    let mut offset = 0usize;
    let mut line_no = 0usize;

    while offset < bytes.len() {
        let Some(newline) = bytes[offset..].iter().position(|&b| b == b'\n') else {
            warn!(
                "Dropping partial record at the end of {} ({} bytes)",
                path.display(),
                bytes.len() - offset
            );
            report.truncated_tail = true;
            break;
        };

        line_no += 1;
        let line = &bytes[offset..offset + newline];
        offset += newline + 1;
        report.valid_len = offset as u64;

        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<TrainingResult>(line) {
            Ok(result) => report.results.push(result),
            Err(e) => {
                warn!("Skipping corrupt record at {}:{}: {}", path.display(), line_no, e);
                report.skipped_lines += 1;
            }
        }
    }

    Ok(report)
}

/// Per-worker result log. Owned exclusively by one worker process.
#[derive(Debug)]
pub struct ResultRecorder {
    path: PathBuf,
    retry: RetryConfig,
    recorded: HashSet<ResultKey>,
    appended: usize,
}

impl ResultRecorder {
    /// Open (creating directories as needed) and index existing records.
    pub fn open<P: AsRef<Path>>(path: P, retry: RetryConfig) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| PersistenceError::CreateDirFailed {
                path: parent.to_path_buf(),
                message: e.to_string(),
            })?;
        }

        let mut recorded = HashSet::new();
        if path.exists() {
            let report = scan_results(&path)?;
            if report.truncated_tail {
                Self::truncate_to(&path, report.valid_len)?;
            }
            recorded.extend(report.results.iter().map(TrainingResult::key));
            info!(
                "Result log {}: {} records, {} skipped",
                path.display(),
                recorded.len(),
                report.skipped_lines
            );
        } else {
            info!("Starting new result log {}", path.display());
        }

        Ok(Self {
            path,
            retry,
            recorded,
            appended: 0,
        })
    }

    fn truncate_to(path: &Path, len: u64) -> Result<(), PersistenceError> {
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| PersistenceError::WriteFailed {
                path: path.to_path_buf(),
                attempts: 1,
                message: e.to_string(),
            })?;
        file.set_len(len)
            .and_then(|_| file.sync_data())
            .map_err(|e| PersistenceError::WriteFailed {
                path: path.to_path_buf(),
                attempts: 1,
                message: format!("cannot truncate partial record: {e}"),
            })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has_result(&self, key: &ResultKey) -> bool {
        self.recorded.contains(key)
    }

    /// Distinct keys on record, including earlier sessions.
    pub fn len(&self) -> usize {
        self.recorded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recorded.is_empty()
    }

    /// Records written by this session.
    pub fn appended(&self) -> usize {
        self.appended
    }

    /// Durably append one record, retrying with backoff.
    pub fn append(&mut self, result: &TrainingResult) -> Result<(), PersistenceError> {
        let mut buffer = serde_json::to_vec(result).map_err(|e| PersistenceError::WriteFailed {
            path: self.path.clone(),
            attempts: 0,
            message: format!("cannot serialize record: {e}"),
        })?;
        buffer.push(b'\n');

        let mut attempt = 0;
        loop {
            match self.write_once(&buffer) {
                Ok(()) => break,
                Err(e) if attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.calculate_delay(attempt);
                    warn!(
                        "Write to {} failed (attempt {}): {}; retrying in {:?}",
                        self.path.display(),
                        attempt + 1,
                        e,
                        delay
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => {
                    return Err(PersistenceError::WriteFailed {
                        path: self.path.clone(),
                        attempts: attempt + 1,
                        message: e.to_string(),
                    })
                }
            }
        }

        self.recorded.insert(result.key());
        self.appended += 1;
        debug!("Recorded {} to {}", result.arch, self.path.display());
        Ok(())
    }

    fn write_once(&self, buffer: &[u8]) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let before = file.metadata()?.len();

        let written = file.write_all(buffer).and_then(|_| file.sync_data());
        if written.is_err() {
            // Leave no partial line behind for the next attempt.
            if let Err(e) = file.set_len(before) {
                warn!("Rollback of {} failed: {}", self.path.display(), e);
            }
        }
        written
    }
}
