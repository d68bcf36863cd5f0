//! Message dispatch: classify each inbound envelope and act on it.
//!
//! | first char of kind | action                                  |
//! |--------------------|-----------------------------------------|
//! | `H`                | heartbeat, reply immediately            |
//! | `i`                | uncompressed image, accepted, not saved |
//! | `j`                | JPEG image, queued for the writer       |
//! | anything else      | event, appended to the event log        |
//!
//! Every message is acknowledged with `OK`, whatever happens to it locally,
//! so that a sending node never stalls on a hub-side problem.

use crate::envelope::{Envelope, EnvelopeError, MessageKind};
use crate::event_log::{EventLog, EventLogError};
use crate::queue::{BoundedQueue, WriteJob};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, trace, warn};

/// Acknowledgement sent for every exchange.
pub const REPLY_OK: &[u8] = b"OK";

/// Errors raised while handling a message. None of them reach the node.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Protocol violation: {0}")]
    Protocol(#[from] EnvelopeError),

    #[error(transparent)]
    EventLog(#[from] EventLogError),
}

/// What the dispatcher did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Fewer than two fields; acknowledged only
    Probe,
    /// Heartbeat; acknowledged only
    Heartbeat,
    /// Uncompressed image; accepted but not persisted
    RawImageIgnored,
    /// Image queued for writing; `evicted` is true if an older job was dropped
    Queued { evicted: bool },
    /// Event appended to the event log
    Logged,
}

/// Counters for dispatched messages.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherStats {
    pub probes: u64,
    pub heartbeats: u64,
    pub raw_images_ignored: u64,
    pub images_queued: u64,
    pub events_logged: u64,
    pub protocol_errors: u64,
    pub event_log_errors: u64,
}

/// Classifies envelopes and routes them to the queue or the event log.
pub struct Dispatcher {
    queue: Arc<BoundedQueue>,
    event_log: Arc<EventLog>,
    stats: DispatcherStats,
}

impl Dispatcher {
    pub fn new(queue: Arc<BoundedQueue>, event_log: Arc<EventLog>) -> Self {
        Self {
            queue,
            event_log,
            stats: DispatcherStats::default(),
        }
    }

    /// Current dispatch counters.
    pub fn stats(&self) -> DispatcherStats {
        self.stats
    }

    /// Handle one message and produce the reply for the node.
    pub fn classify_and_handle(&mut self, envelope_text: &str, image: Bytes) -> Bytes {
        self.classify_and_handle_at(envelope_text, image, Utc::now())
    }

    /// Handle one message as if received at `now`.
    pub fn classify_and_handle_at(
        &mut self,
        envelope_text: &str,
        image: Bytes,
        now: DateTime<Utc>,
    ) -> Bytes {
        match self.dispatch(envelope_text, image, now) {
            // Heartbeats leave no trace anywhere
            Ok(Disposition::Heartbeat) => {}
            Ok(disposition) => {
                trace!(?disposition, "Message dispatched");
            }
            Err(DispatchError::Protocol(e)) => {
                self.stats.protocol_errors += 1;
                warn!(error = %e, "Malformed envelope from node");
                self.event_log.warning(&format!("protocol violation: {}", e));
            }
            Err(DispatchError::EventLog(e)) => {
                self.stats.event_log_errors += 1;
                warn!(error = %e, envelope = %envelope_text, "Event not recorded");
            }
        }

        Bytes::from_static(REPLY_OK)
    }

    /// Classify and act on one message.
    pub fn dispatch(
        &mut self,
        envelope_text: &str,
        image: Bytes,
        now: DateTime<Utc>,
    ) -> Result<Disposition, DispatchError> {
        let Some(envelope) = Envelope::parse(envelope_text) else {
            self.stats.probes += 1;
            return Ok(Disposition::Probe);
        };

        match envelope.classify()? {
            MessageKind::Heartbeat => {
                self.stats.heartbeats += 1;
                Ok(Disposition::Heartbeat)
            }
            // TODO: persist uncompressed images once an encoder is chosen for them
            MessageKind::RawImage => {
                self.stats.raw_images_ignored += 1;
                Ok(Disposition::RawImageIgnored)
            }
            MessageKind::Jpeg => {
                let job = WriteJob::new(&envelope.node_name(), image, now);
                let evicted = self.queue.enqueue(job).is_some();
                self.stats.images_queued += 1;
                Ok(Disposition::Queued { evicted })
            }
            MessageKind::Event => {
                self.event_log.append(now, envelope.text)?;
                self.stats.events_logged += 1;
                info!(node = %envelope.node_and_view, event = %envelope.text, "Node event");
                Ok(Disposition::Logged)
            }
        }
    }
}
