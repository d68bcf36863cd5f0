//! End-to-end tests for the receive / queue / write pipeline.

use bytes::Bytes;
use chrono::{TimeZone, Utc};
use imagehub::config::{HubConfig, HubSettings, LoggingConfig, TransportConfig, WriterConfig};
use imagehub::queue::partition_key;
use imagehub::transport;
use imagehub::{
    BoundedQueue, DirectoryManager, Dispatcher, EventLog, Hub, ImageWriter, TcpNodeClient,
    TcpTransport, REPLY_OK,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn create_test_config(data_root: &Path) -> HubConfig {
    HubConfig {
        hub: HubSettings {
            data_directory: data_root.to_path_buf(),
            queuemax: 100,
            max_images_write: 1000,
            patience: 5,
            ..HubSettings::default()
        },
        transport: TransportConfig {
            bind_address: "127.0.0.1:0".to_string(),
            max_frame_bytes: 1024 * 1024,
        },
        writer: WriterConfig::default(),
        logging: LoggingConfig::default(),
    }
}

fn list_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries.filter_map(Result::ok).map(|e| e.path()).collect(),
        Err(_) => Vec::new(),
    };
    files.sort();
    files
}

#[test]
fn test_jpeg_scenario_lands_in_date_partition() {
    let dir = tempdir().unwrap();
    let queue = Arc::new(BoundedQueue::new(10));
    let directory = DirectoryManager::new(dir.path(), 100).unwrap();
    let log = Arc::new(EventLog::open(dir.path().join("logs/imagehub.log")).unwrap());
    let mut dispatcher = Dispatcher::new(queue.clone(), log.clone());

    let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()
        + chrono::Duration::milliseconds(678);
    let payload = Bytes::from((0u8..20).collect::<Vec<u8>>());

    let reply = dispatcher.classify_and_handle_at("cam1 porch|j", payload.clone(), at);
    assert_eq!(&reply[..], REPLY_OK);

    let writer = ImageWriter::spawn(
        queue,
        directory,
        log,
        dir.path().to_path_buf(),
        &WriterConfig::default(),
    )
    .unwrap();
    let stats = writer.shutdown(Duration::from_secs(1));
    assert_eq!(stats.images_written, 1);

    let expected = dir
        .path()
        .join("images/2024-01-02/cam1-porch-2024-01-02T03.04.05.678.jpg");
    assert_eq!(fs::read(expected).unwrap(), payload.to_vec());
}

#[tokio::test]
async fn test_hub_over_channel_transport() {
    let dir = tempdir().unwrap();
    let data_root = dir.path().join("data");
    let mut hub = Hub::new(create_test_config(&data_root)).unwrap();
    let (mut transport, client) = transport::channel(8);

    let day_before = partition_key(Utc::now());

    let node = tokio::spawn(async move {
        let mut replies = Vec::new();
        replies.push(client.request("probe", Bytes::new()).await.unwrap());
        replies.push(client.request("cam1 porch|H", Bytes::new()).await.unwrap());
        replies.push(
            client
                .request("cam1 porch|jpg", Bytes::from_static(b"jpeg-bytes"))
                .await
                .unwrap(),
        );
        replies.push(
            client
                .request("cam2|motion|triggered", Bytes::new())
                .await
                .unwrap(),
        );
        replies
    });

    hub.run(&mut transport, std::future::pending()).await.unwrap();
    let replies = node.await.unwrap();
    assert!(replies.iter().all(|r| &r[..] == REPLY_OK));

    let summary = hub.shutdown().await;
    let day_after = partition_key(Utc::now());

    assert_eq!(summary.messages_received, 4);
    assert_eq!(summary.dispatcher.probes, 1);
    assert_eq!(summary.dispatcher.heartbeats, 1);
    assert_eq!(summary.dispatcher.images_queued, 1);
    assert_eq!(summary.dispatcher.events_logged, 1);
    assert_eq!(summary.writer.images_written, 1);

    // Exactly one image, in today's UTC partition
    let partitions = list_files(&data_root.join("images"));
    assert_eq!(partitions.len(), 1);
    let partition_name = partitions[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(partition_name == day_before || partition_name == day_after);

    let images = list_files(&partitions[0]);
    assert_eq!(images.len(), 1);
    let image_name = images[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(image_name.starts_with("cam1-porch-"));
    assert!(image_name.ends_with(".jpg"));
    assert!(!image_name.contains(':'));
    assert_eq!(fs::read(&images[0]).unwrap(), b"jpeg-bytes");

    // Only the event reached the event log
    let log = fs::read_to_string(data_root.join("logs/imagehub.log")).unwrap();
    let lines: Vec<_> = log.lines().collect();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("cam2|motion|triggered"));
}

#[tokio::test]
async fn test_shutdown_drains_all_queued_jobs() {
    let dir = tempdir().unwrap();
    let data_root = dir.path().join("data");
    let mut config = create_test_config(&data_root);
    config.writer.shutdown_grace_secs = 0;
    let mut hub = Hub::new(config).unwrap();

    for n in 0..50 {
        hub.process(&format!("node{}|jpg", n), Bytes::from(vec![n as u8; 64]));
    }

    let summary = hub.shutdown().await;
    assert_eq!(summary.writer.images_written, 50);
    assert_eq!(summary.queue.evicted, 0);

    let partitions = list_files(&data_root.join("images"));
    let total: usize = partitions.iter().map(|p| list_files(p).len()).sum();
    assert_eq!(total, 50);
}

#[tokio::test]
async fn test_hub_warnings_reach_event_log() {
    let dir = tempdir().unwrap();
    let data_root = dir.path().join("data");
    let mut config = create_test_config(&data_root);
    config.hub.max_images_write = 1;
    let mut hub = Hub::new(config).unwrap();

    for _ in 0..3 {
        let reply = hub.process("cam0|jpg", Bytes::from_static(b"jpeg-bytes"));
        assert_eq!(&reply[..], REPLY_OK);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let reply = hub.process("cam1|", Bytes::new());
    assert_eq!(&reply[..], REPLY_OK);

    let summary = hub.shutdown().await;
    assert_eq!(summary.writer.images_written, 1);
    assert_eq!(summary.writer.cap_discarded, 2);
    assert_eq!(summary.dispatcher.protocol_errors, 1);
    assert_eq!(summary.event_log_lines, 2);

    let log = fs::read_to_string(data_root.join("logs/imagehub.log")).unwrap();
    let warnings: Vec<_> = log.lines().filter(|l| l.contains(" ~ WARNING: ")).collect();
    assert_eq!(warnings.len(), 2);
    assert!(warnings.iter().any(|l| l.contains("reached max_images_write=1")));
    assert!(warnings.iter().any(|l| l.contains("protocol violation") && l.contains("cam1|")));
}

#[tokio::test]
async fn test_hub_over_tcp_transport() {
    let dir = tempdir().unwrap();
    let data_root = dir.path().join("data");
    let config = create_test_config(&data_root);
    let mut hub = Hub::new(config.clone()).unwrap();
    let mut transport = TcpTransport::bind(&config.transport).await.unwrap();
    let addr = transport.local_addr();

    let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();

    let nodes = tokio::spawn(async move {
        let mut handles = Vec::new();
        for node in 0..3 {
            handles.push(tokio::spawn(async move {
                let mut client = TcpNodeClient::connect(addr, 1024 * 1024).await.unwrap();
                for frame in 0..4 {
                    let reply = client
                        .request(
                            &format!("cam{} view|jpg", node),
                            Bytes::from(vec![frame as u8; 32]),
                        )
                        .await
                        .unwrap();
                    assert_eq!(&reply[..], REPLY_OK);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let _ = done_tx.send(());
    });

    hub.run(&mut transport, async {
        let _ = done_rx.await;
    })
    .await
    .unwrap();
    nodes.await.unwrap();
    drop(transport);

    let summary = hub.shutdown().await;
    assert_eq!(summary.messages_received, 12);
    assert_eq!(summary.writer.images_written, 12);
}
