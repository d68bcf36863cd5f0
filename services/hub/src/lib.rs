//! Imagehub
//!
//! Ingestion hub for remote camera nodes. Nodes send (envelope, image)
//! pairs over a request/reply channel; the hub acknowledges every message
//! straight away, queues JPEG images for a dedicated writer thread, and
//! appends event messages to a log file.
//!
//! ## Architecture
//!
//! ```text
//!  Nodes                 Hub (receive loop)                Writer thread
//! ┌────────┐  request  ┌────────────┐  'j'  ┌──────────┐  ┌──────────────┐
//! │ cam1   │──────────▶│ Dispatcher │──────▶│ Bounded  │─▶│ Directory    │
//! │ cam2   │◀──────────│            │       │ Queue    │  │ Manager      │
//! │ ...    │   "OK"    └────────────┘       └──────────┘  └──────────────┘
//! └────────┘                │ other                              │
//!                           ▼                                    ▼
//!                    logs/imagehub.log             images/YYYY-MM-DD/*.jpg
//! ```
//!
//! The queue drops its oldest job when full, so a burst larger than disk
//! throughput never blocks a node. Each date partition is capped at
//! `max_images_write` images. At shutdown every queued image is written
//! before the process exits.

pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod envelope;
pub mod event_log;
pub mod health;
pub mod hub;
pub mod liveness;
pub mod queue;
pub mod transport;
pub mod writer;

pub use config::{ConfigValidationError, HubConfig, HubSettings};
pub use directory::{CommitOutcome, DirectoryManager, PartitionState, StorageError};
pub use dispatcher::{DispatchError, Dispatcher, DispatcherStats, Disposition, REPLY_OK};
pub use envelope::{Envelope, EnvelopeError, MessageKind};
pub use event_log::{EventLog, EventLogError};
pub use health::SystemType;
pub use hub::{Hub, HubError, HubSummary};
pub use liveness::{LivenessMonitor, LivenessState};
pub use queue::{BoundedQueue, QueueStats, WriteJob};
pub use transport::{
    ChannelTransport, InboundMessage, NodeClient, TcpNodeClient, TcpTransport, Transport,
    TransportError,
};
pub use writer::{ImageWriter, WriterStatsSnapshot};
