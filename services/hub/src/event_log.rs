//! Append-only hub log: node events plus the hub's own warnings.
//!
//! One line per entry, prefixed with the time it was recorded:
//!
//! ```text
//! 2024-01-02 03:04:05,678 ~ cam2|motion|triggered
//! 2024-01-02 03:04:09,120 ~ WARNING: partition 2024-01-02 reached max_images_write=5000, discarding further images
//! ```
//!
//! The log is shared between the receive loop and the writer thread.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{info, warn};

/// Errors from the event log sink.
#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("Failed to open event log {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("Failed to append to event log {path}: {source}")]
    Append { path: PathBuf, source: io::Error },
}

/// Timestamp-prefixed, append-only event log file.
pub struct EventLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    lines_written: AtomicU64,
}

impl EventLog {
    /// Open (or create) the log file at `path`, creating parent directories.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, EventLogError> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| EventLogError::Open {
                path: path.clone(),
                source,
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| EventLogError::Open {
                path: path.clone(),
                source,
            })?;

        info!(path = %path.display(), "Event log opened");

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
            lines_written: AtomicU64::new(0),
        })
    }

    /// Number of lines appended since opening.
    pub fn lines_written(&self) -> u64 {
        self.lines_written.load(Ordering::Relaxed)
    }

    /// Append one line and flush it.
    pub fn append(&self, at: DateTime<Utc>, text: &str) -> Result<(), EventLogError> {
        let line = format_line(at, text);

        {
            let mut writer = self.writer.lock();
            writer
                .write_all(line.as_bytes())
                .and_then(|_| writer.flush())
                .map_err(|source| EventLogError::Append {
                    path: self.path.clone(),
                    source,
                })?;
        }

        self.lines_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Record a hub-side warning, timestamped now.
    ///
    /// A failure to record it is reported through tracing only.
    pub fn warning(&self, text: &str) {
        if let Err(e) = self.append(Utc::now(), &format!("{}{}", WARNING_PREFIX, text)) {
            warn!(error = %e, warning = %text, "Warning not recorded in event log");
        }
    }
}

/// Prefix of hub-side warning lines.
pub const WARNING_PREFIX: &str = "WARNING: ";

/// Format one log line, newline-terminated. Embedded newlines are escaped so
/// that an event always occupies exactly one line.
pub fn format_line(at: DateTime<Utc>, text: &str) -> String {
    format!(
        "{} ~ {}\n",
        at.format("%Y-%m-%d %H:%M:%S,%3f"),
        text.replace('\n', "\\n").replace('\r', "\\r")
    )
}
