//! Bounded in-memory queue of pending image writes.
//!
//! The queue sits between the dispatcher (single producer) and the writer
//! thread (single consumer). It never blocks the producer: when full, the
//! oldest job is evicted to admit the newest, like a ring buffer.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

/// File extension for persisted images.
pub const IMAGE_EXTENSION: &str = "jpg";

/// A unit of work for the writer: one image to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteJob {
    target_filename: String,
    payload: Bytes,
    partition_key: String,
}

impl WriteJob {
    /// Build a job for an image received from `node_name` at `received_at`.
    ///
    /// The filename is `<node_name>-<ISO8601 timestamp>` with `:` replaced by
    /// `.`, and the partition key is the UTC calendar date.
    pub fn new(node_name: &str, payload: Bytes, received_at: DateTime<Utc>) -> Self {
        let timestamp = received_at.format("%Y-%m-%dT%H.%M.%S%.3f");

        Self {
            target_filename: format!("{}-{}", node_name, timestamp),
            payload,
            partition_key: partition_key(received_at),
        }
    }

    /// Filename without extension.
    pub fn target_filename(&self) -> &str {
        &self.target_filename
    }

    /// Filename including the image extension.
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.target_filename, IMAGE_EXTENSION)
    }

    /// Raw image bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Date partition (`YYYY-MM-DD`).
    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }
}

/// Partition key for a timestamp: its UTC calendar date.
pub fn partition_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d").to_string()
}

/// Snapshot of queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub evicted: u64,
    pub overload_episodes: u64,
    pub depth: usize,
}

struct QueueState {
    jobs: VecDeque<WriteJob>,
    /// Set on the first eviction of an overload episode, cleared once the
    /// queue drains empty.
    overloaded: bool,
}

/// Fixed-capacity FIFO with drop-oldest overflow.
pub struct BoundedQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    evicted: AtomicU64,
    overload_episodes: AtomicU64,
}

impl BoundedQueue {
    /// Create a queue holding at most `capacity` jobs (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);

        Self {
            state: Mutex::new(QueueState {
                jobs: VecDeque::with_capacity(capacity),
                overloaded: false,
            }),
            capacity,
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            overload_episodes: AtomicU64::new(0),
        }
    }

    /// Admit a job, evicting and returning the oldest one if the queue is full.
    pub fn enqueue(&self, job: WriteJob) -> Option<WriteJob> {
        let (evicted, episode_started) = {
            let mut state = self.state.lock();
            let evicted = if state.jobs.len() >= self.capacity {
                state.jobs.pop_front()
            } else {
                None
            };
            state.jobs.push_back(job);

            let episode_started = evicted.is_some() && !state.overloaded;
            if episode_started {
                state.overloaded = true;
            }
            (evicted, episode_started)
        };

        self.enqueued.fetch_add(1, Ordering::Relaxed);

        if let Some(ref old) = evicted {
            self.evicted.fetch_add(1, Ordering::Relaxed);

            if episode_started {
                self.overload_episodes.fetch_add(1, Ordering::Relaxed);
                warn!(
                    capacity = self.capacity,
                    evicted_file = %old.target_filename(),
                    "Write queue full, evicting oldest images"
                );
            }
        }

        evicted
    }

    /// Take the oldest job, if any.
    pub fn dequeue(&self) -> Option<WriteJob> {
        let (job, episode_ended) = {
            let mut state = self.state.lock();
            let job = state.jobs.pop_front();
            let episode_ended = state.jobs.is_empty() && state.overloaded;
            if episode_ended {
                state.overloaded = false;
            }
            (job, episode_ended)
        };

        if job.is_some() {
            self.dequeued.fetch_add(1, Ordering::Relaxed);
        }

        if episode_ended {
            info!(
                evicted_total = self.evicted.load(Ordering::Relaxed),
                "Write queue drained after overload"
            );
        }

        job
    }

    /// Current number of queued jobs.
    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.state.lock().jobs.is_empty()
    }

    /// Maximum number of queued jobs.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of counters.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            overload_episodes: self.overload_episodes.load(Ordering::Relaxed),
            depth: self.len(),
        }
    }
}
