//! Dedicated writer thread that drains the queue to disk.
//!
//! The writer owns the [`DirectoryManager`] for its whole life, so partition
//! counters are never shared. When the thread exits it hands the manager
//! back, and any jobs still queued are force-drained on the caller's thread.

use crate::config::WriterConfig;
use crate::directory::{CommitOutcome, DirectoryManager};
use crate::event_log::EventLog;
use crate::queue::{BoundedQueue, WriteJob};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Counters updated by the writer.
#[derive(Debug, Default)]
pub struct WriterStats {
    images_written: AtomicU64,
    bytes_written: AtomicU64,
    cap_discarded: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`WriterStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStatsSnapshot {
    pub images_written: u64,
    pub bytes_written: u64,
    pub cap_discarded: u64,
    pub failed: u64,
}

impl WriterStats {
    pub fn snapshot(&self) -> WriterStatsSnapshot {
        WriterStatsSnapshot {
            images_written: self.images_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            cap_discarded: self.cap_discarded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Handle to the running writer thread.
pub struct ImageWriter {
    handle: Option<JoinHandle<DirectoryManager>>,
    queue: Arc<BoundedQueue>,
    event_log: Arc<EventLog>,
    stats: Arc<WriterStats>,
    /// Stop once the queue is empty
    stop: Arc<AtomicBool>,
    /// Stop after the current job, even if work remains
    abort: Arc<AtomicBool>,
    data_root: PathBuf,
    max_images_write: u64,
}

impl ImageWriter {
    /// Spawn the writer thread. Cap and write failures are recorded in
    /// `event_log` as well as traced.
    pub fn spawn(
        queue: Arc<BoundedQueue>,
        directory: DirectoryManager,
        event_log: Arc<EventLog>,
        data_root: PathBuf,
        config: &WriterConfig,
    ) -> io::Result<Self> {
        let stats = Arc::new(WriterStats::default());
        let stop = Arc::new(AtomicBool::new(false));
        let abort = Arc::new(AtomicBool::new(false));
        let max_images_write = directory.max_images_write();
        let idle_poll = config.idle_poll();

        let handle = thread::Builder::new().name("image-writer".into()).spawn({
            let queue = Arc::clone(&queue);
            let event_log = Arc::clone(&event_log);
            let stats = Arc::clone(&stats);
            let stop = Arc::clone(&stop);
            let abort = Arc::clone(&abort);
            move || writer_loop(queue, directory, event_log, stats, stop, abort, idle_poll)
        })?;

        info!(idle_poll_us = idle_poll.as_micros() as u64, "Image writer started");

        Ok(Self {
            handle: Some(handle),
            queue,
            event_log,
            stats,
            stop,
            abort,
            data_root,
            max_images_write,
        })
    }

    /// Current writer statistics.
    pub fn stats(&self) -> WriterStatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether the writer thread is still running.
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Stop the writer and make sure every queued job reaches disk.
    ///
    /// The thread is asked to exit once the queue is empty and given `grace`
    /// to do so. After that it is told to stop after its current job, and
    /// whatever is left in the queue is written synchronously here.
    pub fn shutdown(mut self, grace: Duration) -> WriterStatsSnapshot {
        let pending = self.queue.len();
        info!(pending, grace_secs = grace.as_secs(), "Stopping image writer");

        self.stop.store(true, Ordering::SeqCst);

        let Some(handle) = self.handle.take() else {
            return self.stats();
        };

        // A grace period too long to represent means waiting for the writer
        let deadline = Instant::now().checked_add(grace);
        while !handle.is_finished() && deadline.map_or(true, |d| Instant::now() < d) {
            thread::sleep(Duration::from_millis(10));
        }

        if !handle.is_finished() {
            warn!(
                remaining = self.queue.len(),
                "Writer did not drain within grace period, forcing drain"
            );
            self.abort.store(true, Ordering::SeqCst);
        }

        let mut directory = match handle.join() {
            Ok(directory) => directory,
            Err(_) => {
                error!("Writer thread panicked, rebuilding directory manager for drain");
                match DirectoryManager::new(&self.data_root, self.max_images_write) {
                    Ok(directory) => directory,
                    Err(e) => {
                        let lost = self.queue.len();
                        error!(error = %e, lost, "Cannot drain queue, images lost");
                        self.event_log
                            .warning(&format!("shutdown drain failed, {} images lost: {}", lost, e));
                        return self.stats();
                    }
                }
            }
        };

        let mut drained = 0usize;
        while let Some(job) = self.queue.dequeue() {
            commit_job(&mut directory, &job, &self.event_log, &self.stats);
            drained += 1;
        }

        if drained > 0 {
            info!(drained, "Force-drained remaining images");
        }

        let stats = self.stats();
        info!(
            images_written = stats.images_written,
            bytes_written = stats.bytes_written,
            cap_discarded = stats.cap_discarded,
            failed = stats.failed,
            "Image writer stopped"
        );
        stats
    }
}

impl Drop for ImageWriter {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.stop.store(true, Ordering::SeqCst);
            self.abort.store(true, Ordering::SeqCst);
            let _ = handle.join();
        }
    }
}

fn writer_loop(
    queue: Arc<BoundedQueue>,
    mut directory: DirectoryManager,
    event_log: Arc<EventLog>,
    stats: Arc<WriterStats>,
    stop: Arc<AtomicBool>,
    abort: Arc<AtomicBool>,
    idle_poll: Duration,
) -> DirectoryManager {
    while !abort.load(Ordering::SeqCst) {
        match queue.dequeue() {
            Some(job) => commit_job(&mut directory, &job, &event_log, &stats),
            None => {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                thread::sleep(idle_poll);
            }
        }
    }

    debug!("Image writer loop exited");
    directory
}

/// Commit one job and record the outcome. Failures are logged, never raised.
fn commit_job(
    directory: &mut DirectoryManager,
    job: &WriteJob,
    event_log: &EventLog,
    stats: &WriterStats,
) {
    match directory.commit(job) {
        Ok(CommitOutcome::Written { path, bytes }) => {
            stats.images_written.fetch_add(1, Ordering::Relaxed);
            stats.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
            debug!(path = %path.display(), bytes, "Image written");
        }
        Ok(CommitOutcome::CapReached { partition, first }) => {
            stats.cap_discarded.fetch_add(1, Ordering::Relaxed);
            if first {
                let max_images_write = directory.max_images_write();
                warn!(
                    partition = %partition,
                    max_images_write,
                    "Partition image cap reached; discarding further images for this partition"
                );
                event_log.warning(&format!(
                    "partition {} reached max_images_write={}, discarding further images",
                    partition, max_images_write
                ));
            }
        }
        Err(e) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            error!(
                file = %job.target_filename(),
                partition = %job.partition_key(),
                error = %e,
                "Failed to write image"
            );
            event_log.warning(&format!(
                "failed to write image {}: {}",
                job.target_filename(),
                e
            ));
        }
    }
}
