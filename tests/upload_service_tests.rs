// Integration tests for the chunked upload engine
//
// These tests drive ChunkedUploadService against an in-memory transport
// and store, covering completion, retries, pause/resume, restarts and cancel.

use anyhow::Result;
use bytes::Bytes;
use matchcast::upload::{
    AssembleRequest, AssembledUpload, ChunkAck, ChunkRequest, ChunkTransport, ChunkedUploadService,
    MemoryUploadStore, PostProcessor, RetryPolicy, StageReporter, UploadConfig, UploadError,
    UploadEvent, UploadRequest, UploadResult, UploadState, UploadStatus, UploadStore,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const MB: usize = 1024 * 1024;

#[derive(Clone, Copy)]
enum Failure {
    Transient,
    Protocol,
}

/// Transport that stores chunks in memory and can be told to fail
#[derive(Default)]
struct FakeTransport {
    requests: Mutex<Vec<usize>>,
    stored: Mutex<HashMap<usize, Bytes>>,
    /// chunk index -> (remaining failures, kind)
    failures: Mutex<HashMap<usize, (u32, Failure)>>,
    /// Artificial latency per chunk index
    delays: Mutex<HashMap<usize, Duration>>,
    default_delay: Mutex<Duration>,
}

impl FakeTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn fail(&self, index: usize, times: u32, kind: Failure) {
        self.failures.lock().unwrap().insert(index, (times, kind));
    }

    fn delay_all(&self, delay: Duration) {
        *self.default_delay.lock().unwrap() = delay;
    }

    fn delay(&self, index: usize, delay: Duration) {
        self.delays.lock().unwrap().insert(index, delay);
    }

    fn requests(&self) -> Vec<usize> {
        self.requests.lock().unwrap().clone()
    }

    fn stored_bytes(&self) -> Vec<u8> {
        let stored = self.stored.lock().unwrap();
        let mut indices: Vec<_> = stored.keys().copied().collect();
        indices.sort();
        indices
            .iter()
            .flat_map(|i| stored[i].iter().copied())
            .collect()
    }
}

#[async_trait::async_trait]
impl ChunkTransport for FakeTransport {
    async fn send_chunk(&self, chunk: ChunkRequest) -> UploadResult<ChunkAck> {
        let index = chunk.chunk_index;
        self.requests.lock().unwrap().push(index);

        let delay = {
            let delays = self.delays.lock().unwrap();
            delays
                .get(&index)
                .copied()
                .unwrap_or(*self.default_delay.lock().unwrap())
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        {
            let mut failures = self.failures.lock().unwrap();
            if let Some((remaining, kind)) = failures.get_mut(&index) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(match kind {
                        Failure::Transient => UploadError::Transient("connection reset".into()),
                        Failure::Protocol => UploadError::Protocol("HTTP 404: unknown upload".into()),
                    });
                }
            }
        }

        let mut stored = self.stored.lock().unwrap();
        stored.insert(index, chunk.data);
        Ok(ChunkAck {
            upload_id: chunk.upload_id,
            chunk_index: index,
            received_chunks: stored.len(),
        })
    }

    async fn assemble(
        &self,
        upload_id: &str,
        request: AssembleRequest,
    ) -> UploadResult<AssembledUpload> {
        let stored = self.stored.lock().unwrap();
        if (0..request.total_chunks).any(|i| !stored.contains_key(&i)) {
            return Err(UploadError::Protocol("HTTP 409: missing chunks".into()));
        }
        let size_bytes: u64 = stored.values().map(|b| b.len() as u64).sum();

        Ok(AssembledUpload {
            upload_id: upload_id.to_string(),
            file_url: format!("/files/{}-{}", upload_id, request.filename),
            size_bytes,
        })
    }
}

fn config(chunk_size: usize) -> UploadConfig {
    UploadConfig {
        chunk_size_bytes: chunk_size as u64,
        retry: RetryPolicy::immediate(3),
        ..UploadConfig::default()
    }
}

fn request(data: Vec<u8>) -> UploadRequest {
    UploadRequest {
        data: Bytes::from(data),
        filename: "final.mp4".to_string(),
        match_id: "match-42".to_string(),
        resume_upload_id: None,
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Collect events until the session completes or fails
async fn until_settled(rx: &mut mpsc::Receiver<UploadEvent>) -> Vec<UploadEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for upload events")
            .expect("event channel closed");
        let done = matches!(event, UploadEvent::Completed(_) | UploadEvent::Failed(_));
        events.push(event);
        if done {
            return events;
        }
    }
}

async fn wait_until_idle(service: &ChunkedUploadService) {
    for _ in 0..500 {
        if !service.is_active().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("upload worker never went idle");
}

fn progress_fractions(events: &[UploadEvent]) -> Vec<f64> {
    events
        .iter()
        .filter_map(|e| match e {
            UploadEvent::Progress(p) => Some(p.fraction),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_upload_sends_every_chunk_once_and_completes() -> Result<()> {
    let transport = FakeTransport::new();
    let store = Arc::new(MemoryUploadStore::new());
    let service = ChunkedUploadService::new(config(10), transport.clone(), store.clone());
    let (tx, mut rx) = mpsc::channel(64);

    let data = pattern(25);
    let upload_id = service.start(request(data.clone()), tx).await?;
    let events = until_settled(&mut rx).await;

    match events.last() {
        Some(UploadEvent::Completed(assembled)) => {
            assert_eq!(assembled.upload_id, upload_id);
            assert_eq!(assembled.size_bytes, 25);
        }
        other => panic!("expected completion, got {:?}", other),
    }

    assert_eq!(transport.requests(), vec![0, 1, 2]);
    assert_eq!(transport.stored_bytes(), data);

    let state = service.state().await.expect("state");
    assert_eq!(state.status, UploadStatus::Complete);
    assert_eq!(state.sent_chunks, BTreeSet::from([0, 1, 2]));
    assert_eq!(state.uploaded_bytes(), 25);

    // Completed sessions are removed from durable storage
    assert!(store.load(&upload_id).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_progress_is_monotonic() -> Result<()> {
    let transport = FakeTransport::new();
    let service = ChunkedUploadService::new(
        config(7),
        transport.clone(),
        Arc::new(MemoryUploadStore::new()),
    );
    let (tx, mut rx) = mpsc::channel(64);

    service.start(request(pattern(100)), tx).await?;
    let events = until_settled(&mut rx).await;

    let fractions = progress_fractions(&events);
    assert!(fractions.windows(2).all(|w| w[0] <= w[1]), "{:?}", fractions);
    assert_eq!(fractions.last().copied(), Some(1.0));
    Ok(())
}

#[tokio::test]
async fn test_transient_failures_are_retried_in_place() -> Result<()> {
    let transport = FakeTransport::new();
    transport.fail(1, 2, Failure::Transient);
    let service = ChunkedUploadService::new(
        config(10),
        transport.clone(),
        Arc::new(MemoryUploadStore::new()),
    );
    let (tx, mut rx) = mpsc::channel(64);

    service.start(request(pattern(30)), tx).await?;
    let events = until_settled(&mut rx).await;

    assert!(matches!(events.last(), Some(UploadEvent::Completed(_))));
    assert_eq!(transport.requests(), vec![0, 1, 1, 1, 2]);
    Ok(())
}

#[tokio::test]
async fn test_protocol_errors_are_not_retried() -> Result<()> {
    let transport = FakeTransport::new();
    transport.fail(2, 1, Failure::Protocol);
    let store = Arc::new(MemoryUploadStore::new());
    let service = ChunkedUploadService::new(config(10), transport.clone(), store.clone());
    let (tx, mut rx) = mpsc::channel(64);

    let upload_id = service.start(request(pattern(50)), tx).await?;
    let events = until_settled(&mut rx).await;

    assert!(matches!(
        events.last(),
        Some(UploadEvent::Failed(UploadError::Protocol(_)))
    ));
    assert_eq!(transport.requests(), vec![0, 1, 2]);

    // Progress is kept for an explicit resume or cancel
    let persisted = store.load(&upload_id).await?.expect("persisted state");
    assert_eq!(persisted.status, UploadStatus::Error);
    assert_eq!(persisted.sent_chunks, BTreeSet::from([0, 1]));
    Ok(())
}

#[tokio::test]
async fn test_failed_chunk_then_pause_and_resume_completes() -> Result<()> {
    // 100 MB file in 5 MB chunks = 20 chunks; chunk 10 fails every attempt once
    let transport = FakeTransport::new();
    transport.fail(10, 3, Failure::Transient);
    let store = Arc::new(MemoryUploadStore::new());
    let service = ChunkedUploadService::new(config(5 * MB), transport.clone(), store.clone());
    let (tx, mut rx) = mpsc::channel(64);

    let upload_id = service.start(request(vec![7u8; 100 * MB]), tx).await?;
    let events = until_settled(&mut rx).await;
    assert!(matches!(events.last(), Some(UploadEvent::Failed(_))));

    let persisted = store.load(&upload_id).await?.expect("persisted state");
    assert_eq!(persisted.total_chunks, 20);
    assert_eq!(persisted.sent_chunks, (0..10).collect::<BTreeSet<_>>());

    service.pause().await?;
    assert_eq!(service.state().await.map(|s| s.status), Some(UploadStatus::Paused));
    service.pause().await?;

    let requests_before_resume = transport.requests().len();
    service.resume().await?;
    let events = until_settled(&mut rx).await;
    assert!(matches!(events.last(), Some(UploadEvent::Completed(_))));

    let resumed: Vec<usize> = transport.requests()[requests_before_resume..].to_vec();
    assert_eq!(resumed, (10..20).collect::<Vec<_>>());

    let state = service.state().await.expect("state");
    assert_eq!(state.status, UploadStatus::Complete);
    assert_eq!(state.sent_chunks.len(), 20);
    Ok(())
}

#[tokio::test]
async fn test_resume_after_restart_skips_acknowledged_chunks() -> Result<()> {
    let store = Arc::new(MemoryUploadStore::new());
    let data = pattern(80);

    // First process: dies with chunk 5 rejected
    let upload_id = {
        let transport = FakeTransport::new();
        transport.fail(5, 1, Failure::Protocol);
        let service = ChunkedUploadService::new(config(10), transport.clone(), store.clone());
        let (tx, mut rx) = mpsc::channel(64);
        let upload_id = service.start(request(data.clone()), tx).await?;
        until_settled(&mut rx).await;
        upload_id
    };

    let persisted = store.load(&upload_id).await?.expect("persisted state");
    assert_eq!(
        persisted.sent_chunks.iter().max().copied(),
        Some(4),
        "chunks 0-4 acknowledged before the failure"
    );

    // Second process: new engine instance, same store
    let transport = FakeTransport::new();
    let service = ChunkedUploadService::new(config(10), transport.clone(), store.clone());
    let (tx, mut rx) = mpsc::channel(64);
    let resumed_id = service
        .start(
            UploadRequest {
                resume_upload_id: Some(upload_id.clone()),
                ..request(data)
            },
            tx,
        )
        .await?;

    assert_eq!(resumed_id, upload_id);
    let events = until_settled(&mut rx).await;
    assert!(matches!(events.last(), Some(UploadEvent::Completed(_))));
    assert_eq!(transport.requests(), vec![5, 6, 7]);
    Ok(())
}

#[tokio::test]
async fn test_resume_rejects_different_file() -> Result<()> {
    let store = Arc::new(MemoryUploadStore::new());
    let state = UploadState::new(
        "upload-old".to_string(),
        "match-42".to_string(),
        "final.mp4".to_string(),
        1000,
        10,
    );
    store.save(&state).await?;

    let service = ChunkedUploadService::new(config(10), FakeTransport::new(), store);
    let (tx, _rx) = mpsc::channel(64);
    let result = service
        .start(
            UploadRequest {
                resume_upload_id: Some("upload-old".to_string()),
                ..request(pattern(999))
            },
            tx,
        )
        .await;

    assert!(matches!(result, Err(UploadError::InvalidInput(_))));
    Ok(())
}

#[tokio::test]
async fn test_empty_file_is_rejected() {
    let service = ChunkedUploadService::new(
        config(10),
        FakeTransport::new(),
        Arc::new(MemoryUploadStore::new()),
    );
    let (tx, _rx) = mpsc::channel(64);

    let result = service.start(request(Vec::new()), tx).await;
    assert!(matches!(result, Err(UploadError::InvalidInput(_))));
}

#[tokio::test]
async fn test_pause_stops_after_in_flight_chunk() -> Result<()> {
    let transport = FakeTransport::new();
    transport.delay_all(Duration::from_millis(10));
    let store = Arc::new(MemoryUploadStore::new());
    let service = ChunkedUploadService::new(config(10), transport.clone(), store.clone());
    let (tx, mut rx) = mpsc::channel(64);

    let upload_id = service.start(request(pattern(200)), tx).await?;

    // Pause once two chunks are acknowledged
    loop {
        match rx.recv().await {
            Some(UploadEvent::Progress(p)) if p.sent_chunks >= 2 => break,
            Some(_) => continue,
            None => panic!("event channel closed"),
        }
    }
    service.pause().await?;
    wait_until_idle(&service).await;

    let requested = transport.requests();
    assert!(requested.len() < 20, "paused before the end: {:?}", requested);

    let persisted = store.load(&upload_id).await?.expect("persisted state");
    assert_eq!(persisted.status, UploadStatus::Paused);
    let acknowledged = persisted.sent_chunks.len();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.requests().len(), requested.len(), "no requests while paused");

    service.resume().await?;
    let events = until_settled(&mut rx).await;
    assert!(matches!(events.last(), Some(UploadEvent::Completed(_))));

    let all = transport.requests();
    let unique: BTreeSet<usize> = all.iter().copied().collect();
    assert_eq!(unique.len(), 20);
    assert_eq!(all.len(), 20, "no chunk re-sent after resume: {:?}", all);
    assert!(acknowledged >= 2);
    Ok(())
}

#[tokio::test]
async fn test_cancel_discards_persisted_state() -> Result<()> {
    let transport = FakeTransport::new();
    transport.delay_all(Duration::from_millis(20));
    let store = Arc::new(MemoryUploadStore::new());
    let service = ChunkedUploadService::new(config(10), transport.clone(), store.clone());
    let (tx, mut rx) = mpsc::channel(64);

    let upload_id = service.start(request(pattern(100)), tx).await?;
    loop {
        match rx.recv().await {
            Some(UploadEvent::Progress(p)) if p.sent_chunks >= 1 => break,
            Some(_) => continue,
            None => panic!("event channel closed"),
        }
    }

    service.cancel().await?;
    assert!(store.load(&upload_id).await?.is_none());
    assert!(!service.is_active().await);

    let acknowledged = service.state().await.map(|s| s.sent_chunks.len());
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(
        service.state().await.map(|s| s.sent_chunks.len()),
        acknowledged,
        "late results are ignored after cancel"
    );

    assert!(matches!(
        service.resume().await,
        Err(UploadError::SessionClosed(_))
    ));
    service.cancel().await?;
    Ok(())
}

#[tokio::test]
async fn test_concurrent_chunks_acknowledge_out_of_order() -> Result<()> {
    let transport = FakeTransport::new();
    // Earlier chunks are slower, so completions arrive in reverse
    for i in 0..8 {
        transport.delay(i, Duration::from_millis(5 * (8 - i as u64)));
    }
    let store = Arc::new(MemoryUploadStore::new());
    let service = ChunkedUploadService::new(
        UploadConfig {
            max_concurrent_chunks: 4,
            ..config(10)
        },
        transport.clone(),
        store,
    );
    let (tx, mut rx) = mpsc::channel(64);

    let data = pattern(80);
    service.start(request(data.clone()), tx).await?;
    let events = until_settled(&mut rx).await;

    assert!(matches!(events.last(), Some(UploadEvent::Completed(_))));
    let state = service.state().await.expect("state");
    assert_eq!(state.sent_chunks, (0..8).collect::<BTreeSet<_>>());
    assert_eq!(transport.stored_bytes(), data);

    let fractions = progress_fractions(&events);
    assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
    Ok(())
}

struct StagedProcessor;

#[async_trait::async_trait]
impl PostProcessor for StagedProcessor {
    async fn process(
        &self,
        _assembled: &AssembledUpload,
        stages: &StageReporter,
    ) -> UploadResult<()> {
        stages.enter(UploadStatus::Converting).await?;
        stages.enter(UploadStatus::Extracting).await?;
        stages.enter(UploadStatus::Transcribing).await?;
        Ok(())
    }
}

#[tokio::test]
async fn test_post_processing_stages_precede_completion() -> Result<()> {
    let service = ChunkedUploadService::with_post_processor(
        config(10),
        FakeTransport::new(),
        Arc::new(MemoryUploadStore::new()),
        Arc::new(StagedProcessor),
    );
    let (tx, mut rx) = mpsc::channel(64);

    service.start(request(pattern(15)), tx).await?;
    let events = until_settled(&mut rx).await;

    let statuses: Vec<UploadStatus> = events
        .iter()
        .filter_map(|e| match e {
            UploadEvent::StatusChanged(s) => Some(*s),
            _ => None,
        })
        .collect();

    assert_eq!(
        statuses,
        vec![
            UploadStatus::Uploading,
            UploadStatus::Assembling,
            UploadStatus::Converting,
            UploadStatus::Extracting,
            UploadStatus::Transcribing,
            UploadStatus::Complete,
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_persisted_uploads_are_listed_per_match() -> Result<()> {
    let store = MemoryUploadStore::new();

    let mut first = UploadState::new(
        "upload-a".to_string(),
        "match-1".to_string(),
        "first-half.mp4".to_string(),
        100,
        10,
    );
    first.acknowledge(0);
    first.acknowledge(1);
    store.save(&first).await?;
    store
        .save(&UploadState::new(
            "upload-b".to_string(),
            "match-2".to_string(),
            "other.mp4".to_string(),
            100,
            10,
        ))
        .await?;

    let uploads = ChunkedUploadService::get_persisted_uploads_for_match(&store, "match-1").await?;
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].upload_id, "upload-a");
    assert_eq!(uploads[0].filename, "first-half.mp4");
    assert_eq!(uploads[0].sent_chunks, 2);
    assert_eq!(uploads[0].total_chunks, 10);

    ChunkedUploadService::clear_persisted_upload(&store, "upload-a").await?;
    assert!(ChunkedUploadService::get_persisted_uploads_for_match(&store, "match-1")
        .await?
        .is_empty());
    Ok(())
}

/// Memory store with a slow write for paused sessions and an optional failing delete
#[derive(Default)]
struct FlakyStore {
    inner: MemoryUploadStore,
    paused_save_delay: Duration,
    fail_delete: bool,
}

#[async_trait::async_trait]
impl UploadStore for FlakyStore {
    async fn save(&self, state: &UploadState) -> Result<()> {
        if state.status == UploadStatus::Paused && !self.paused_save_delay.is_zero() {
            tokio::time::sleep(self.paused_save_delay).await;
        }
        self.inner.save(state).await
    }

    async fn load(&self, upload_id: &str) -> Result<Option<UploadState>> {
        self.inner.load(upload_id).await
    }

    async fn delete(&self, upload_id: &str) -> Result<()> {
        if self.fail_delete {
            anyhow::bail!("state directory is read-only");
        }
        self.inner.delete(upload_id).await
    }

    async fn list(&self) -> Result<Vec<UploadState>> {
        self.inner.list().await
    }
}

#[tokio::test]
async fn test_cancel_while_pause_is_being_saved() -> Result<()> {
    let transport = FakeTransport::new();
    transport.delay_all(Duration::from_millis(20));
    let store = Arc::new(FlakyStore {
        paused_save_delay: Duration::from_millis(50),
        ..FlakyStore::default()
    });
    let service = Arc::new(ChunkedUploadService::new(
        config(10),
        transport.clone(),
        store.clone(),
    ));
    let (tx, _rx) = mpsc::channel(64);

    let upload_id = service.start(request(pattern(100)), tx).await?;

    let pausing = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.pause().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    service.cancel().await?;

    // Pause either finished before the cancel or was refused by it
    let _ = pausing.await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(store.load(&upload_id).await?.is_none());
    let resumable =
        ChunkedUploadService::get_persisted_uploads_for_match(store.as_ref(), "match-42").await?;
    assert!(resumable.is_empty(), "cancelled upload listed: {:?}", resumable);
    Ok(())
}

#[tokio::test]
async fn test_completion_stands_when_record_cleanup_fails() -> Result<()> {
    let transport = FakeTransport::new();
    let store = Arc::new(FlakyStore {
        fail_delete: true,
        ..FlakyStore::default()
    });
    let service = ChunkedUploadService::new(config(10), transport.clone(), store.clone());
    let (tx, mut rx) = mpsc::channel(64);

    service.start(request(pattern(30)), tx).await?;
    let events = until_settled(&mut rx).await;

    assert!(matches!(events.last(), Some(UploadEvent::Completed(_))));
    assert!(!events.iter().any(|e| matches!(e, UploadEvent::Failed(_))));
    assert_eq!(
        service.state().await.map(|s| s.status),
        Some(UploadStatus::Complete)
    );
    Ok(())
}
