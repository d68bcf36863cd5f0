//! The hub: owns the queue, writer, dispatcher and liveness monitor, and
//! runs the receive / dispatch / reply loop.

use crate::config::{ConfigValidationError, HubConfig};
use crate::directory::{DirectoryManager, StorageError, LOGS_DIR};
use crate::dispatcher::{Dispatcher, DispatcherStats};
use crate::event_log::{EventLog, EventLogError};
use crate::liveness::{LivenessMonitor, LivenessState};
use crate::queue::{BoundedQueue, QueueStats};
use crate::transport::{Transport, TransportError};
use crate::writer::{ImageWriter, WriterStatsSnapshot};
use bytes::Bytes;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors while assembling the hub. All of them abort startup.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigValidationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    EventLog(#[from] EventLogError),

    #[error("Failed to start image writer: {0}")]
    WriterSpawn(#[source] io::Error),
}

/// Totals reported when the hub shuts down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubSummary {
    pub messages_received: u64,
    pub liveness_timeouts: u64,
    pub event_log_lines: u64,
    pub dispatcher: DispatcherStats,
    pub queue: QueueStats,
    pub writer: WriterStatsSnapshot,
}

/// One hub per process.
pub struct Hub {
    config: HubConfig,
    queue: Arc<BoundedQueue>,
    event_log: Arc<EventLog>,
    dispatcher: Dispatcher,
    liveness: LivenessMonitor,
    writer: ImageWriter,
    messages_received: u64,
}

impl Hub {
    /// Validate the configuration, prepare the data directory and start the
    /// writer thread.
    pub fn new(config: HubConfig) -> Result<Self, HubError> {
        config.validate()?;

        let settings = &config.hub;
        let data_root = settings.data_root();

        let directory = DirectoryManager::new(&data_root, settings.max_images_write)?;
        let event_log = Arc::new(EventLog::open(
            data_root.join(LOGS_DIR).join(&settings.logfile),
        )?);
        let queue = Arc::new(BoundedQueue::new(settings.queuemax));

        let writer = ImageWriter::spawn(
            Arc::clone(&queue),
            directory,
            Arc::clone(&event_log),
            data_root.clone(),
            &config.writer,
        )
        .map_err(HubError::WriterSpawn)?;

        let dispatcher = Dispatcher::new(Arc::clone(&queue), Arc::clone(&event_log));
        let liveness = LivenessMonitor::new(settings.patience(), Instant::now());

        info!(
            data_root = %data_root.display(),
            queuemax = settings.queuemax,
            max_images_write = settings.max_images_write,
            patience_secs = settings.patience,
            "Hub initialized"
        );

        Ok(Self {
            config,
            queue,
            event_log,
            dispatcher,
            liveness,
            writer,
            messages_received: 0,
        })
    }

    pub fn liveness_state(&self) -> LivenessState {
        self.liveness.state()
    }

    /// Process one received message and produce its reply.
    pub fn process(&mut self, envelope: &str, image: Bytes) -> Bytes {
        self.messages_received += 1;

        if let Some(silence) = self.liveness.on_message(Instant::now()) {
            info!(
                silence_secs = silence.as_secs_f64(),
                "Node traffic resumed"
            );
        }

        self.dispatcher.classify_and_handle(envelope, image)
    }

    /// Called when patience expired with no message.
    pub fn handle_timeout(&mut self) {
        if let Some(silence) = self.liveness.check(Instant::now()) {
            let patience_secs = self.liveness.patience().as_secs();
            warn!(
                silence_secs = silence.as_secs_f64(),
                patience_secs,
                "No messages from any node within patience window"
            );
            self.event_log.warning(&format!(
                "no messages from any node for {} seconds",
                patience_secs
            ));
        }
    }

    /// Serve exchanges until `shutdown` completes or the transport closes.
    ///
    /// Each wait for a message is bounded by the patience window; expiry is
    /// recorded and the wait starts again. A reply already in progress is
    /// always delivered before shutdown is observed.
    pub async fn run<T, S>(&mut self, transport: &mut T, shutdown: S) -> Result<(), TransportError>
    where
        T: Transport + ?Sized,
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let patience = self.liveness.patience();

        info!("Hub receive loop started");

        loop {
            let received = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested, leaving receive loop");
                    return Ok(());
                }
                received = tokio::time::timeout(patience, transport.receive_next()) => received,
            };

            let message = match received {
                Err(_elapsed) => {
                    self.handle_timeout();
                    continue;
                }
                Ok(Err(TransportError::Closed)) => {
                    info!("Transport closed, leaving receive loop");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Receive failed");
                    continue;
                }
                Ok(Ok(message)) => message,
            };

            let reply = self.process(&message.envelope, message.image);

            if let Err(e) = transport.send_reply(reply).await {
                warn!(error = %e, "Failed to deliver reply");
            }
        }
    }

    /// Stop the writer, drain every queued image to disk, and report totals.
    pub async fn shutdown(self) -> HubSummary {
        let Hub {
            config,
            queue,
            event_log,
            dispatcher,
            liveness,
            writer,
            messages_received,
        } = self;

        let grace = config.writer.shutdown_grace();
        debug!(pending = queue.len(), "Draining write queue");

        let writer_stats = match tokio::task::spawn_blocking(move || writer.shutdown(grace)).await {
            Ok(stats) => stats,
            Err(e) => {
                error!(error = %e, "Writer shutdown task failed");
                WriterStatsSnapshot::default()
            }
        };

        HubSummary {
            messages_received,
            liveness_timeouts: liveness.timeouts(),
            event_log_lines: event_log.lines_written(),
            dispatcher: dispatcher.stats(),
            queue: queue.stats(),
            writer: writer_stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HubSettings, LoggingConfig, TransportConfig, WriterConfig};
    use crate::transport;
    use std::time::Duration;
    use tempfile::tempdir;

    fn create_test_config(root: &std::path::Path) -> HubConfig {
        HubConfig {
            hub: HubSettings {
                data_directory: root.join("data"),
                patience: 1,
                ..HubSettings::default()
            },
            transport: TransportConfig::default(),
            writer: WriterConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn test_invalid_config_aborts_startup() {
        let dir = tempdir().unwrap();
        let mut config = create_test_config(dir.path());
        config.hub.queuemax = 0;

        assert!(matches!(Hub::new(config), Err(HubError::Config(_))));
    }

    #[tokio::test]
    async fn test_process_and_shutdown_drain() {
        let dir = tempdir().unwrap();
        let mut hub = Hub::new(create_test_config(dir.path())).unwrap();

        for n in 0..5 {
            let reply = hub.process(&format!("cam{}|jpg", n), Bytes::from_static(b"img"));
            assert_eq!(&reply[..], b"OK");
        }

        let summary = hub.shutdown().await;
        assert_eq!(summary.messages_received, 5);
        assert_eq!(summary.dispatcher.images_queued, 5);
        assert_eq!(summary.writer.images_written, 5);
        assert_eq!(summary.queue.depth, 0);
    }

    #[tokio::test]
    async fn test_run_records_timeout_and_stops_on_shutdown() {
        let dir = tempdir().unwrap();
        let mut hub = Hub::new(create_test_config(dir.path())).unwrap();
        let (mut transport, _client) = transport::channel(4);

        hub.run(&mut transport, tokio::time::sleep(Duration::from_millis(1500)))
            .await
            .unwrap();

        assert_eq!(hub.liveness_state(), LivenessState::TimedOut);
        let summary = hub.shutdown().await;
        assert_eq!(summary.liveness_timeouts, 1);
        assert_eq!(summary.event_log_lines, 1);

        let log = std::fs::read_to_string(dir.path().join("data/logs/imagehub.log")).unwrap();
        assert!(log.contains("WARNING: no messages from any node for 1 seconds"));
    }

    #[tokio::test]
    async fn test_shutdown_with_huge_grace_reports_writes() {
        let dir = tempdir().unwrap();
        let mut config = create_test_config(dir.path());
        config.writer.shutdown_grace_secs = u64::MAX;
        let mut hub = Hub::new(config).unwrap();

        for n in 0..20 {
            hub.process(&format!("node{}|jpg", n), Bytes::from_static(b"img"));
        }

        let summary = hub.shutdown().await;
        assert_eq!(summary.writer.images_written, 20);
        assert_eq!(summary.queue.depth, 0);
    }

    #[tokio::test]
    async fn test_run_returns_when_transport_closes() {
        let dir = tempdir().unwrap();
        let mut hub = Hub::new(create_test_config(dir.path())).unwrap();
        let (mut transport, client) = transport::channel(4);

        let node = tokio::spawn(async move {
            let reply = client.request("cam1|H", Bytes::new()).await.unwrap();
            assert_eq!(&reply[..], b"OK");
        });

        hub.run(&mut transport, std::future::pending()).await.unwrap();
        node.await.unwrap();

        let summary = hub.shutdown().await;
        assert_eq!(summary.dispatcher.heartbeats, 1);
    }
}
