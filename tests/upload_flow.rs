use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use recorder::naming::Locale;
use recorder::upload::{
    DispatchConfig, Dispatcher, LocalStore, QueueConfig, SegmentEvents, UploadQueue,
};
use recorder::watcher::StabilityConfig;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

fn quick_dispatch(locale: Locale) -> DispatchConfig {
    DispatchConfig {
        stability: StabilityConfig {
            poll_interval: Duration::from_millis(20),
            required_checks: 2,
            ..StabilityConfig::default()
        },
        locale,
        store_retries: 0,
        store_retry_delay: Duration::from_millis(1),
    }
}

async fn wait_for_file(path: &Path) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !path.exists() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{} never appeared", path.display()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn new_segments_are_uploaded_once_settled() {
    let dir = tempdir().expect("tempdir");
    let root = dir.path().join("rec");
    let bucket = dir.path().join("bucket");
    std::fs::create_dir_all(&root).expect("mkdir root");

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(LocalStore::new(&bucket)),
        quick_dispatch(Locale::Spanish),
    ));
    let (queue, workers) = UploadQueue::start(dispatcher, QueueConfig::default());
    let events = SegmentEvents::watch(&root, &["mp4".to_string()]).expect("watch");
    let cancel = CancellationToken::new();
    let forwarder = tokio::spawn(events.forward(queue.clone(), cancel.clone()));

    let day = root.join("2025-10-18");
    std::fs::create_dir_all(&day).expect("mkdir day");
    tokio::time::sleep(Duration::from_millis(100)).await;
    std::fs::write(day.join("Sábado_2025-10-18_10-00-00.mp4"), vec![1u8; 4096]).expect("segment");
    std::fs::write(day.join("ffmpeg.log"), b"ignored").expect("log");

    let uploaded = bucket.join("2025/Octubre/18/Sábado_2025-10-18_10-00-00.mp4");
    wait_for_file(&uploaded).await;
    assert_eq!(std::fs::metadata(&uploaded).expect("stat").len(), 4096);

    cancel.cancel();
    forwarder.await.expect("forwarder");
    let summary = workers.shutdown().await;
    assert_eq!(summary.uploaded, 1);
    assert!(summary.failed.is_empty());
    assert!(!bucket.join("2025/Octubre/18/ffmpeg.log").exists());
}

#[tokio::test]
async fn queue_uploads_every_distinct_path() {
    let dir = tempdir().expect("tempdir");
    let bucket = dir.path().join("bucket");
    let paths: Vec<PathBuf> = (0..6)
        .map(|hour| {
            let path = dir
                .path()
                .join(format!("Monday_2025-10-13_{hour:02}-00-00.mp4"));
            std::fs::write(&path, vec![hour as u8; 64]).expect("segment");
            path
        })
        .collect();

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(LocalStore::new(&bucket)),
        quick_dispatch(Locale::English),
    ));
    let (queue, workers) = UploadQueue::start(
        dispatcher,
        QueueConfig {
            capacity: 2,
            workers: 2,
            ..QueueConfig::default()
        },
    );
    for path in &paths {
        assert!(queue.submit(path.clone()).await);
    }
    let summary = workers.shutdown().await;

    assert_eq!(summary.uploaded, paths.len());
    for hour in 0..6 {
        let key = bucket.join(format!("2025/October/13/Monday_2025-10-13_{hour:02}-00-00.mp4"));
        assert!(key.exists(), "missing {}", key.display());
    }
}

#[cfg(feature = "http-store")]
mod http {
    use super::*;
    use recorder::upload::{HttpStore, HttpStoreConfig, ObjectStore};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accepts one request and answers with `status`; returns the raw request head and body.
    async fn serve_once(listener: TcpListener, status: &'static str) -> (String, Vec<u8>) {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let head_end = loop {
            let n = socket.read(&mut chunk).await.expect("read");
            assert!(n > 0, "connection closed early");
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
        let length: usize = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .expect("content-length header");
        let mut body = buf[head_end..].to_vec();
        while body.len() < length {
            let n = socket.read(&mut chunk).await.expect("read body");
            assert!(n > 0, "body truncated");
            body.extend_from_slice(&chunk[..n]);
        }
        let response = format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        socket.write_all(response.as_bytes()).await.expect("respond");
        (head, body)
    }

    fn store(endpoint: String) -> HttpStore {
        HttpStore::new(HttpStoreConfig {
            endpoint,
            bucket: "camera1".to_string(),
            authorization: Some("Bearer test-token".to_string()),
            timeout: Duration::from_secs(10),
            no_proxy: true,
        })
        .expect("store")
    }

    #[tokio::test]
    async fn put_streams_file_to_bucket_key() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("Monday_2025-10-13_00-00-00.mp4");
        std::fs::write(&path, b"segment bytes").expect("segment");

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(serve_once(listener, "200 OK"));

        store(format!("http://{addr}"))
            .put_file("2025/October/13/Monday_2025-10-13_00-00-00.mp4", &path)
            .await
            .expect("put");

        let (head, body) = server.await.expect("server");
        assert!(head.starts_with(
            "PUT /camera1/2025/October/13/Monday_2025-10-13_00-00-00.mp4 HTTP/1.1"
        ));
        assert!(head.to_ascii_lowercase().contains("authorization: bearer test-token"));
        assert_eq!(body, b"segment bytes");
    }

    #[tokio::test]
    async fn error_status_is_a_store_failure() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("Monday_2025-10-13_00-00-00.mp4");
        std::fs::write(&path, b"x").expect("segment");

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(serve_once(listener, "403 Forbidden"));

        let result = store(format!("http://{addr}"))
            .put_file("2025/October/13/Monday_2025-10-13_00-00-00.mp4", &path)
            .await;
        assert!(matches!(result, Err(recorder::Error::Store { .. })));
        server.await.expect("server");
    }
}
