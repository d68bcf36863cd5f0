//! On-disk layout and per-partition write caps.
//!
//! ```text
//! <data_directory>/
//!     images/<YYYY-MM-DD>/<node>-<timestamp>.jpg
//!     logs/<logfile>
//! ```
//!
//! Partition bookkeeping is owned by the writer thread and needs no locking.

use crate::queue::{WriteJob, IMAGE_EXTENSION};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Subdirectory for image partitions.
pub const IMAGES_DIR: &str = "images";

/// Subdirectory for the event log.
pub const LOGS_DIR: &str = "logs";

/// Filesystem errors while persisting images.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to create directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("Failed to write image {path}: {source}")]
    WriteFile { path: PathBuf, source: io::Error },
}

/// Result of committing one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Image written to `path`
    Written { path: PathBuf, bytes: usize },
    /// Partition cap reached; the job was discarded. `first` is true only
    /// for the job that tripped the cap.
    CapReached { partition: String, first: bool },
}

/// Bookkeeping for one date partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionState {
    pub image_count: u64,
    pub cap_exceeded: bool,
}

/// Resolves partition directories and commits write jobs into them.
#[derive(Debug)]
pub struct DirectoryManager {
    images_dir: PathBuf,
    max_images_write: u64,
    partitions: HashMap<String, PartitionState>,
}

impl DirectoryManager {
    /// Create a manager rooted at `data_root`, creating `images/` and `logs/`.
    pub fn new(data_root: &Path, max_images_write: u64) -> Result<Self, StorageError> {
        let images_dir = data_root.join(IMAGES_DIR);
        create_dir(&images_dir)?;
        create_dir(&data_root.join(LOGS_DIR))?;

        info!(
            images_dir = %images_dir.display(),
            max_images_write,
            "Image directory ready"
        );

        Ok(Self {
            images_dir,
            max_images_write,
            partitions: HashMap::new(),
        })
    }

    /// Per-partition image cap.
    pub fn max_images_write(&self) -> u64 {
        self.max_images_write
    }

    /// Current bookkeeping for a partition, if it has been resolved.
    pub fn partition(&self, key: &str) -> Option<&PartitionState> {
        self.partitions.get(key)
    }

    /// Resolve the directory for a partition, creating it when absent.
    ///
    /// A freshly created directory starts at an image count of zero. A
    /// directory that already exists on disk but is not yet tracked (left
    /// over from an earlier run) starts at the number of images it holds.
    /// Calling this again for a tracked, existing partition changes nothing.
    pub fn ensure_partition(&mut self, key: &str) -> Result<PathBuf, StorageError> {
        let path = self.images_dir.join(key);

        if path.is_dir() {
            if !self.partitions.contains_key(key) {
                let image_count = count_images(&path);
                debug!(partition = %key, image_count, "Resuming existing partition");
                self.partitions.insert(
                    key.to_string(),
                    PartitionState {
                        image_count,
                        cap_exceeded: false,
                    },
                );
            }
            return Ok(path);
        }

        create_dir(&path)?;
        info!(partition = %key, path = %path.display(), "Created image partition");

        self.partitions.insert(
            key.to_string(),
            PartitionState {
                image_count: 0,
                cap_exceeded: false,
            },
        );

        Ok(path)
    }

    /// Persist one job, honoring the per-partition cap.
    ///
    /// Reaching the cap is reported through the outcome; the caller warns
    /// once per partition, on the outcome flagged `first`.
    pub fn commit(&mut self, job: &WriteJob) -> Result<CommitOutcome, StorageError> {
        let key = job.partition_key();
        let partition_path = self.ensure_partition(key)?;
        let max_images_write = self.max_images_write;

        let state = self
            .partitions
            .entry(key.to_string())
            .or_insert_with(|| PartitionState {
                image_count: 0,
                cap_exceeded: false,
            });

        if state.image_count >= max_images_write {
            let first = !state.cap_exceeded;
            state.cap_exceeded = true;
            return Ok(CommitOutcome::CapReached {
                partition: key.to_string(),
                first,
            });
        }

        state.image_count += 1;

        let path = partition_path.join(job.file_name());
        fs::write(&path, job.payload()).map_err(|source| StorageError::WriteFile {
            path: path.clone(),
            source,
        })?;

        Ok(CommitOutcome::Written {
            path,
            bytes: job.payload().len(),
        })
    }
}

fn create_dir(path: &Path) -> Result<(), StorageError> {
    fs::create_dir_all(path).map_err(|source| StorageError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

/// Count image files already present in a partition directory.
fn count_images(path: &Path) -> u64 {
    match fs::read_dir(path) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .filter(|entry| {
                entry
                    .path()
                    .extension()
                    .map(|ext| ext == IMAGE_EXTENSION)
                    .unwrap_or(false)
            })
            .count() as u64,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to scan partition");
            0
        }
    }
}
