//! End-to-end coordinator tests against a local HTTP server.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::StreamExt;
use modelstore::prelude::*;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Deterministic pseudo-random payload so tests agree on the digest.
fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) % 251) as u8).collect()
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

struct ServerState {
    payload: Vec<u8>,
    gets: AtomicUsize,
    ranged_gets: AtomicUsize,
    support_ranges: bool,
    /// Delay inserted before each streamed chunk; `None` serves the whole
    /// body at once.
    throttle: Option<Duration>,
}

impl ServerState {
    fn plain(payload: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            payload,
            gets: AtomicUsize::new(0),
            ranged_gets: AtomicUsize::new(0),
            support_ranges: true,
            throttle: None,
        })
    }

    fn throttled(payload: Vec<u8>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            payload,
            gets: AtomicUsize::new(0),
            ranged_gets: AtomicUsize::new(0),
            support_ranges: true,
            throttle: Some(delay),
        })
    }

    fn without_ranges(payload: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            payload,
            gets: AtomicUsize::new(0),
            ranged_gets: AtomicUsize::new(0),
            support_ranges: false,
            throttle: None,
        })
    }
}

fn parse_range_start(value: &str) -> Option<usize> {
    value
        .strip_prefix("bytes=")?
        .split('-')
        .next()?
        .parse()
        .ok()
}

async fn serve_model(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    state.gets.fetch_add(1, Ordering::SeqCst);
    let requested_start = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range_start);
    if requested_start.is_some() {
        state.ranged_gets.fetch_add(1, Ordering::SeqCst);
    }

    let total = state.payload.len();
    let (status, start) = match requested_start {
        Some(start) if state.support_ranges => {
            if start >= total {
                return StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            }
            (StatusCode::PARTIAL_CONTENT, start)
        }
        // A server that ignores range requests replies with the full body.
        _ => (StatusCode::OK, 0),
    };

    let body_bytes = state.payload[start..].to_vec();
    let mut builder = Response::builder().status(status);
    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, total - 1, total),
        );
    }

    match state.throttle {
        None => builder.body(Body::from(body_bytes)).unwrap(),
        Some(delay) => {
            let chunks: Vec<Bytes> = body_bytes
                .chunks(8 * 1024)
                .map(Bytes::copy_from_slice)
                .collect();
            let stream = futures_util::stream::iter(
                chunks.into_iter().map(Ok::<_, std::io::Error>),
            )
            .then(move |item| async move {
                tokio::time::sleep(delay).await;
                item
            });
            builder.body(Body::from_stream(stream)).unwrap()
        }
    }
}

async fn spawn_server(state: Arc<ServerState>) -> String {
    let app = Router::new()
        .route("/model.bin", get(serve_model))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/model.bin")
}

fn config(url: &str, sha256: Option<String>, estimated_size: u64) -> ModelConfig {
    ModelConfig {
        name: "whisper-base".into(),
        version: "1.0".into(),
        url: url.into(),
        sha256,
        estimated_size,
        min_memory_bytes: None,
    }
}

async fn collect_until_terminal(stream: &mut EventStream) -> Vec<DownloadEvent> {
    let mut events = Vec::new();
    let deadline = Duration::from_secs(30);
    loop {
        let event = tokio::time::timeout(deadline, stream.next())
            .await
            .expect("timed out waiting for download events");
        match event {
            Some(event) => {
                let terminal = event.is_terminal();
                events.push(event);
                if terminal {
                    break;
                }
            }
            None => break,
        }
    }
    events
}

#[tokio::test]
async fn full_install_flow_emits_ordered_events() {
    let data = payload(128 * 1024);
    let digest = sha256_hex(&data);
    let state = ServerState::plain(data.clone());
    let url = spawn_server(state.clone()).await;

    let root = tempfile::tempdir().unwrap();
    let manager = ModelManager::new(root.path(), ManagerConfig::default())
        .await
        .unwrap();

    let mut stream = manager
        .ensure_installed(config(&url, Some(digest), data.len() as u64))
        .await
        .unwrap();
    let events = collect_until_terminal(&mut stream).await;

    assert_eq!(events.first(), Some(&DownloadEvent::Started));
    let installing = events
        .iter()
        .position(|e| matches!(e, DownloadEvent::Installing))
        .expect("no installing event");
    let progress = events
        .iter()
        .position(|e| matches!(e, DownloadEvent::Progress { .. }))
        .expect("no progress event");
    assert!(progress < installing);
    let path = match events.last() {
        Some(DownloadEvent::Completed { path }) => path.clone(),
        other => panic!("expected completed, got {other:?}"),
    };

    assert_eq!(tokio::fs::read(&path).await.unwrap(), data);
    let installed = manager.list_installed().await.unwrap();
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].name, "whisper-base");
    assert_eq!(installed[0].version, "1.0");
    assert_eq!(installed[0].size_bytes, data.len() as u64);
}

#[tokio::test]
async fn second_request_completes_without_network_activity() {
    let data = payload(32 * 1024);
    let digest = sha256_hex(&data);
    let state = ServerState::plain(data.clone());
    let url = spawn_server(state.clone()).await;

    let root = tempfile::tempdir().unwrap();
    let manager = ModelManager::new(root.path(), ManagerConfig::default())
        .await
        .unwrap();

    let cfg = config(&url, Some(digest), data.len() as u64);
    let mut stream = manager.ensure_installed(cfg.clone()).await.unwrap();
    collect_until_terminal(&mut stream).await;
    let gets_after_first = state.gets.load(Ordering::SeqCst);

    let mut stream = manager.ensure_installed(cfg).await.unwrap();
    let events = collect_until_terminal(&mut stream).await;
    assert!(matches!(
        events.as_slice(),
        [DownloadEvent::Completed { .. }]
    ));
    assert_eq!(state.gets.load(Ordering::SeqCst), gets_after_first);
}

#[tokio::test]
async fn concurrent_requests_share_one_transfer() {
    let data = payload(64 * 1024);
    let digest = sha256_hex(&data);
    let state = ServerState::throttled(data.clone(), Duration::from_millis(20));
    let url = spawn_server(state.clone()).await;

    let root = tempfile::tempdir().unwrap();
    let manager = ModelManager::new(root.path(), ManagerConfig::default())
        .await
        .unwrap();

    let cfg = config(&url, Some(digest), data.len() as u64);
    let mut first = manager.ensure_installed(cfg.clone()).await.unwrap();
    let mut second = manager.ensure_installed(cfg).await.unwrap();

    let first_terminal = tokio::time::timeout(Duration::from_secs(30), first.wait_terminal())
        .await
        .unwrap();
    let second_terminal = tokio::time::timeout(Duration::from_secs(30), second.wait_terminal())
        .await
        .unwrap();

    assert!(matches!(first_terminal, Some(DownloadEvent::Completed { .. })));
    assert!(matches!(second_terminal, Some(DownloadEvent::Completed { .. })));
    assert_eq!(state.gets.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn checksum_mismatch_discards_artifact() {
    let data = payload(32 * 1024);
    let state = ServerState::plain(data.clone());
    let url = spawn_server(state).await;

    let root = tempfile::tempdir().unwrap();
    let manager = ModelManager::new(root.path(), ManagerConfig::default())
        .await
        .unwrap();

    let wrong_digest = "0".repeat(64);
    let mut stream = manager
        .ensure_installed(config(&url, Some(wrong_digest), data.len() as u64))
        .await
        .unwrap();
    let events = collect_until_terminal(&mut stream).await;

    assert!(matches!(
        events.last(),
        Some(DownloadEvent::Failed {
            reason: FailureReason::ChecksumMismatch { .. }
        })
    ));
    assert!(manager.list_installed().await.unwrap().is_empty());

    // The corrupt partial must not linger in the scratch area.
    let store = ModelStore::new(root.path()).unwrap();
    let partial = store.partial_path(&ModelKey::new("whisper-base", "1.0"));
    assert!(!tokio::fs::try_exists(&partial).await.unwrap());
}

#[tokio::test]
async fn preflight_rejects_oversized_download() {
    let state = ServerState::plain(payload(1024));
    let url = spawn_server(state.clone()).await;

    let root = tempfile::tempdir().unwrap();
    let manager = ModelManager::new(root.path(), ManagerConfig::default())
        .await
        .unwrap();

    // More than any test machine has free.
    let mut stream = manager
        .ensure_installed(config(&url, None, u64::MAX / 4))
        .await
        .unwrap();
    let events = collect_until_terminal(&mut stream).await;

    assert!(matches!(
        events.as_slice(),
        [DownloadEvent::Failed {
            reason: FailureReason::InsufficientDiskSpace { .. }
        }]
    ));
    // Preflight failed before any network activity.
    assert_eq!(state.gets.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn pause_then_resume_produces_intact_artifact() {
    let data = payload(256 * 1024);
    let digest = sha256_hex(&data);
    let state = ServerState::throttled(data.clone(), Duration::from_millis(15));
    let url = spawn_server(state.clone()).await;

    let root = tempfile::tempdir().unwrap();
    let manager = ModelManager::new(root.path(), ManagerConfig::default())
        .await
        .unwrap();

    let mut stream = manager
        .ensure_installed(config(&url, Some(digest), data.len() as u64))
        .await
        .unwrap();

    // Let some bytes land before pausing.
    loop {
        let event = tokio::time::timeout(Duration::from_secs(30), stream.next())
            .await
            .unwrap()
            .expect("stream ended before progress");
        if let DownloadEvent::Progress { bytes, .. } = event {
            if bytes > 0 {
                break;
            }
        }
    }
    manager.pause("whisper-base", "1.0").await.unwrap();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(30), stream.next())
            .await
            .unwrap()
            .expect("stream ended before pause acknowledgement");
        match event {
            DownloadEvent::Paused { resumable } => {
                assert!(resumable);
                break;
            }
            e if e.is_terminal() => panic!("unexpected terminal event {e:?}"),
            _ => {}
        }
    }

    manager.resume("whisper-base", "1.0").await.unwrap();
    let terminal = tokio::time::timeout(Duration::from_secs(30), stream.wait_terminal())
        .await
        .unwrap();
    let path = match terminal {
        Some(DownloadEvent::Completed { path }) => path,
        other => panic!("expected completed, got {other:?}"),
    };

    // Resume never produces a corrupted concatenation.
    let installed = tokio::fs::read(&path).await.unwrap();
    assert_eq!(installed.len(), data.len());
    assert_eq!(sha256_hex(&installed), sha256_hex(&data));
    // The second attempt resumed with a byte-range request.
    assert!(state.ranged_gets.load(Ordering::SeqCst) >= 1);
    assert!(state.gets.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn server_without_range_support_restarts_cleanly() {
    let data = payload(64 * 1024);
    let digest = sha256_hex(&data);
    let state = ServerState::without_ranges(data.clone());
    let url = spawn_server(state.clone()).await;

    let root = tempfile::tempdir().unwrap();
    // Seed a stale partial that does not match the remote content, as if a
    // previous attempt had died against a different upload.
    let store = ModelStore::new(root.path()).unwrap();
    let partial = store.partial_path(&ModelKey::new("whisper-base", "1.0"));
    tokio::fs::write(&partial, vec![0xff; 10 * 1024]).await.unwrap();

    let manager = ModelManager::new(root.path(), ManagerConfig::default())
        .await
        .unwrap();
    let mut stream = manager
        .ensure_installed(config(&url, Some(digest), data.len() as u64))
        .await
        .unwrap();
    let events = collect_until_terminal(&mut stream).await;

    // The server ignored the range; the engine restarted from zero and the
    // final artifact still verifies.
    let path = match events.last() {
        Some(DownloadEvent::Completed { path }) => path.clone(),
        other => panic!("expected completed, got {other:?}"),
    };
    assert_eq!(tokio::fs::read(&path).await.unwrap(), data);
}

#[tokio::test]
async fn interrupted_download_resumes_after_restart() {
    let data = payload(256 * 1024);
    let digest = sha256_hex(&data);
    let state = ServerState::throttled(data.clone(), Duration::from_millis(15));
    let url = spawn_server(state.clone()).await;

    let root = tempfile::tempdir().unwrap();
    let cfg = config(&url, Some(digest), data.len() as u64);

    // First process: download some bytes, then stop making progress
    // (paused and parked, like a process about to be killed).
    let first = ModelManager::new(root.path(), ManagerConfig::default())
        .await
        .unwrap();
    let mut stream = first.ensure_installed(cfg.clone()).await.unwrap();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(30), stream.next())
            .await
            .unwrap()
            .expect("stream ended before progress");
        if let DownloadEvent::Progress { bytes, .. } = event {
            if bytes > 0 {
                break;
            }
        }
    }
    first.pause("whisper-base", "1.0").await.unwrap();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(30), stream.next())
            .await
            .unwrap()
            .expect("stream ended before pause acknowledgement");
        if matches!(event, DownloadEvent::Paused { .. }) {
            break;
        }
    }
    drop(stream);
    drop(first);

    // Second process over the same root: recovery finds the durable record
    // and the partial, and resumes to completion.
    let second = ModelManager::new(root.path(), ManagerConfig::default())
        .await
        .unwrap();
    let mut streams = second.recover().await.unwrap();
    assert_eq!(streams.len(), 1);
    let terminal = tokio::time::timeout(Duration::from_secs(30), streams[0].wait_terminal())
        .await
        .unwrap();
    let path = match terminal {
        Some(DownloadEvent::Completed { path }) => path,
        other => panic!("expected completed, got {other:?}"),
    };
    assert_eq!(sha256_hex(&tokio::fs::read(&path).await.unwrap()), sha256_hex(&data));
    assert!(state.ranged_gets.load(Ordering::SeqCst) >= 1);

    let installed = second.list_installed().await.unwrap();
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].sha256.as_deref(), Some(sha256_hex(&data).as_str()));
}

#[tokio::test]
async fn recovery_discards_records_whose_partial_vanished() {
    let root = tempfile::tempdir().unwrap();

    // A leftover record pointing at a partial that no longer exists.
    let state = StateManager::new(&root.path().join("tasks.db")).await.unwrap();
    let cfg = config("http://127.0.0.1:9/model.bin", None, 1024);
    let record = modelstore::models::TaskRecord::new(
        cfg.clone(),
        root.path().join("scratch").join("whisper-base-1.0.partial"),
    );
    state.save(&cfg.key(), &record).await.unwrap();

    let manager = ModelManager::new(root.path(), ManagerConfig::default())
        .await
        .unwrap();
    let streams = manager.recover().await.unwrap();
    assert!(streams.is_empty());

    let remaining = StateManager::new(&root.path().join("tasks.db"))
        .await
        .unwrap()
        .load_all()
        .await
        .unwrap();
    assert!(remaining.is_empty());
}

#[tokio::test]
async fn exhausted_retries_fail_but_keep_partial_for_resume() {
    let data = payload(64 * 1024);
    // Stream so slowly that every attempt stalls.
    let state = ServerState::throttled(data.clone(), Duration::from_secs(10));
    let url = spawn_server(state.clone()).await;

    let root = tempfile::tempdir().unwrap();
    let manager_config = ManagerConfig {
        max_retries: 1,
        retry_base_delay: Duration::from_millis(50),
        engine: EngineConfig {
            stall_timeout: Duration::from_millis(300),
            progress_interval: Duration::from_millis(50),
        },
        ..ManagerConfig::default()
    };
    let manager = ModelManager::new(root.path(), manager_config).await.unwrap();

    let mut stream = manager
        .ensure_installed(config(&url, None, data.len() as u64))
        .await
        .unwrap();
    let events = collect_until_terminal(&mut stream).await;

    // Transient stalls surface as resumable pauses until retries run out.
    assert!(events
        .iter()
        .any(|e| matches!(e, DownloadEvent::Paused { resumable: true })));
    assert!(matches!(
        events.last(),
        Some(DownloadEvent::Failed {
            reason: FailureReason::Network { .. }
        })
    ));
    assert!(state.gets.load(Ordering::SeqCst) >= 2);

    // The durable record survives so a later request can resume.
    let remaining = StateManager::new(&root.path().join("tasks.db"))
        .await
        .unwrap()
        .load_all()
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
}

#[tokio::test]
async fn delete_and_queries() {
    let data = payload(16 * 1024);
    let digest = sha256_hex(&data);
    let state = ServerState::plain(data.clone());
    let url = spawn_server(state).await;

    let root = tempfile::tempdir().unwrap();
    let manager = ModelManager::new(root.path(), ManagerConfig::default())
        .await
        .unwrap();

    let mut stream = manager
        .ensure_installed(config(&url, Some(digest), data.len() as u64))
        .await
        .unwrap();
    collect_until_terminal(&mut stream).await;

    let path = manager.resolve_installed("whisper-base", "1.0").await;
    assert!(path.is_some());
    assert_eq!(manager.verify_installed("whisper-base", "1.0").await.unwrap(), Some(true));

    let info = manager.storage_info().await.unwrap();
    assert!(info.used_bytes >= data.len() as u64);
    assert!(info.available_bytes > 0);

    manager.delete("whisper-base", None).await.unwrap();
    assert!(manager.resolve_installed("whisper-base", "1.0").await.is_none());
    assert!(manager.list_installed().await.unwrap().is_empty());
    assert_eq!(manager.verify_installed("whisper-base", "1.0").await.unwrap(), None);
}

#[tokio::test]
async fn cancel_discards_partial_and_emits_terminal() {
    let data = payload(256 * 1024);
    let state = ServerState::throttled(data.clone(), Duration::from_millis(15));
    let url = spawn_server(state).await;

    let root = tempfile::tempdir().unwrap();
    let manager = ModelManager::new(root.path(), ManagerConfig::default())
        .await
        .unwrap();

    let mut stream = manager
        .ensure_installed(config(&url, None, data.len() as u64))
        .await
        .unwrap();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(30), stream.next())
            .await
            .unwrap()
            .expect("stream ended before progress");
        if let DownloadEvent::Progress { bytes, .. } = event {
            if bytes > 0 {
                break;
            }
        }
    }
    manager.cancel("whisper-base", "1.0").await.unwrap();

    let terminal = tokio::time::timeout(Duration::from_secs(30), stream.wait_terminal())
        .await
        .unwrap();
    assert_eq!(terminal, Some(DownloadEvent::Cancelled));

    let store = ModelStore::new(root.path()).unwrap();
    let partial = store.partial_path(&ModelKey::new("whisper-base", "1.0"));
    assert!(!tokio::fs::try_exists(&partial).await.unwrap());
    assert!(manager.list_installed().await.unwrap().is_empty());
}
