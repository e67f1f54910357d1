use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::config::UploadConfig;
use super::error::{UploadError, UploadResult};
use super::retry::with_retry;
use super::state::{PersistedUploadSummary, UploadProgress, UploadState, UploadStatus};
use super::store::UploadStore;
use super::transport::{AssembleRequest, AssembledUpload, ChunkRequest, ChunkTransport};

/// Notifications delivered to the caller while an upload runs
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    /// Sent after every acknowledged chunk
    Progress(UploadProgress),
    StatusChanged(UploadStatus),
    /// All chunks acknowledged and the server assembled the file
    Completed(AssembledUpload),
    /// Unrecoverable failure. Persisted state is left in place for a later resume.
    Failed(UploadError),
}

/// A file to upload
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub data: Bytes,
    pub filename: String,
    pub match_id: String,
    /// Adopt this persisted session instead of starting a new one
    pub resume_upload_id: Option<String>,
}

/// Work that runs on the assembled file before the session is considered complete
/// (transcoding, audio extraction, transcription, ...)
#[async_trait::async_trait]
pub trait PostProcessor: Send + Sync {
    async fn process(&self, assembled: &AssembledUpload, stages: &StageReporter)
        -> UploadResult<()>;
}

/// Handle given to a [`PostProcessor`] to publish which stage it is in
pub struct StageReporter {
    inner: Arc<Inner>,
    generation: u64,
}

impl StageReporter {
    pub async fn enter(&self, stage: UploadStatus) -> UploadResult<()> {
        if !stage.is_processing_stage() {
            return Err(UploadError::InvalidInput(format!(
                "{:?} is not a processing stage",
                stage
            )));
        }

        let (events, state) = {
            let mut session = self.inner.session.lock().await;
            let state = session.current(self.generation)?;
            state.set_status(stage);
            let state = state.clone();
            self.inner.persist(&state).await?;
            (session.events.clone(), state)
        };

        info!("Upload {} entered {:?}", state.upload_id, stage);
        emit(&events, vec![UploadEvent::StatusChanged(stage)]).await;
        Ok(())
    }
}

/// Resumable, chunked file upload engine.
///
/// One instance drives one upload session. Network and durable storage are
/// reached only through the injected [`ChunkTransport`] and [`UploadStore`].
pub struct ChunkedUploadService {
    inner: Arc<Inner>,
}

struct Inner {
    config: UploadConfig,
    transport: Arc<dyn ChunkTransport>,
    store: Arc<dyn UploadStore>,
    post_processor: Option<Arc<dyn PostProcessor>>,
    session: Mutex<Session>,
}

#[derive(Default)]
struct Session {
    state: Option<UploadState>,
    data: Bytes,
    events: Option<mpsc::Sender<UploadEvent>>,
    paused: bool,
    cancelled: bool,
    /// Bumped whenever a worker is started or the session is cancelled.
    /// Workers holding an older value have their results ignored.
    generation: u64,
    worker: Option<JoinHandle<()>>,
}

impl Session {
    fn current(&mut self, generation: u64) -> UploadResult<&mut UploadState> {
        let upload_id = self
            .state
            .as_ref()
            .map(|s| s.upload_id.clone())
            .unwrap_or_default();

        if self.cancelled || self.generation != generation {
            return Err(UploadError::SessionClosed(upload_id));
        }
        self.state
            .as_mut()
            .ok_or(UploadError::SessionClosed(upload_id))
    }
}

/// What a worker should do once its in-flight requests have drained
enum Gate {
    Continue,
    Paused,
    Assemble,
    Superseded,
}

impl ChunkedUploadService {
    pub fn new(
        config: UploadConfig,
        transport: Arc<dyn ChunkTransport>,
        store: Arc<dyn UploadStore>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                store,
                post_processor: None,
                session: Mutex::new(Session::default()),
            }),
        }
    }

    pub fn with_post_processor(
        config: UploadConfig,
        transport: Arc<dyn ChunkTransport>,
        store: Arc<dyn UploadStore>,
        post_processor: Arc<dyn PostProcessor>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                store,
                post_processor: Some(post_processor),
                session: Mutex::new(Session::default()),
            }),
        }
    }

    /// Register the session and start transferring in the background.
    ///
    /// Returns the upload id as soon as the initial state is persisted.
    pub async fn start(
        &self,
        request: UploadRequest,
        events: mpsc::Sender<UploadEvent>,
    ) -> UploadResult<String> {
        if request.data.is_empty() {
            return Err(UploadError::InvalidInput("file is empty".to_string()));
        }
        if self.inner.config.chunk_size_bytes == 0 {
            return Err(UploadError::InvalidInput(
                "chunk size must be greater than zero".to_string(),
            ));
        }

        let mut session = self.inner.session.lock().await;
        if let Some(state) = &session.state {
            if !session.cancelled && !state.status.is_terminal() {
                return Err(UploadError::InvalidInput(format!(
                    "upload {} is still active",
                    state.upload_id
                )));
            }
        }

        let total_bytes = request.data.len() as u64;
        let mut state = match &request.resume_upload_id {
            Some(upload_id) => {
                let persisted = self
                    .inner
                    .store
                    .load(upload_id)
                    .await?
                    .ok_or_else(|| {
                        UploadError::InvalidInput(format!(
                            "no persisted upload named {}",
                            upload_id
                        ))
                    })?;

                if persisted.total_bytes != total_bytes {
                    return Err(UploadError::InvalidInput(format!(
                        "file is {} bytes but upload {} expects {}",
                        total_bytes, upload_id, persisted.total_bytes
                    )));
                }
                if persisted.match_id != request.match_id {
                    warn!(
                        "Resuming upload {} under match {} (was {})",
                        upload_id, request.match_id, persisted.match_id
                    );
                }

                info!(
                    "Resuming upload {}: {}/{} chunks already acknowledged",
                    upload_id,
                    persisted.sent_chunks.len(),
                    persisted.total_chunks
                );
                persisted
            }
            None => UploadState::new(
                uuid::Uuid::new_v4().to_string(),
                request.match_id.clone(),
                request.filename.clone(),
                total_bytes,
                self.inner.config.chunk_size_bytes,
            ),
        };

        state.set_status(UploadStatus::Uploading);
        self.inner.persist(&state).await?;

        info!(
            "Starting upload {} for match {}: {} ({} bytes, {} chunks of {} bytes)",
            state.upload_id,
            state.match_id,
            state.filename,
            state.total_bytes,
            state.total_chunks,
            state.chunk_size
        );

        let upload_id = state.upload_id.clone();
        session.state = Some(state);
        session.data = request.data;
        session.events = Some(events);
        session.paused = false;
        session.cancelled = false;
        self.spawn_worker(&mut session);

        Ok(upload_id)
    }

    /// Stop issuing chunk requests once the in-flight ones settle. Idempotent.
    pub async fn pause(&self) -> UploadResult<()> {
        let (events, state) = {
            let mut session = self.inner.session.lock().await;
            if session.cancelled {
                return Err(UploadError::SessionClosed(session_id(&session)));
            }
            if session.paused {
                return Ok(());
            }

            let Some(state) = session.state.as_mut() else {
                return Err(UploadError::InvalidInput("no upload to pause".to_string()));
            };
            if !matches!(state.status, UploadStatus::Uploading | UploadStatus::Error) {
                debug!("Ignoring pause of upload {} in {:?}", state.upload_id, state.status);
                return Ok(());
            }

            state.set_status(UploadStatus::Paused);
            let state = state.clone();
            // Written under the lock so a concurrent cancel always deletes after it
            self.inner.persist(&state).await?;
            session.paused = true;
            (session.events.clone(), state)
        };

        info!(
            "Paused upload {} at {}/{} chunks",
            state.upload_id,
            state.sent_chunks.len(),
            state.total_chunks
        );
        emit(&events, vec![UploadEvent::StatusChanged(UploadStatus::Paused)]).await;
        Ok(())
    }

    /// Continue from the lowest chunk index not acknowledged in persisted state
    pub async fn resume(&self) -> UploadResult<()> {
        let mut session = self.inner.session.lock().await;
        if session.cancelled {
            return Err(UploadError::SessionClosed(session_id(&session)));
        }

        let Some(current) = session.state.clone() else {
            return Err(UploadError::InvalidInput("no upload to resume".to_string()));
        };
        if !matches!(current.status, UploadStatus::Paused | UploadStatus::Error) {
            debug!("Ignoring resume of upload {} in {:?}", current.upload_id, current.status);
            return Ok(());
        }

        let mut state = match self.inner.store.load(&current.upload_id).await? {
            Some(persisted) => persisted,
            None => {
                warn!(
                    "Upload {} missing from durable storage; resuming from memory",
                    current.upload_id
                );
                current
            }
        };
        state.set_status(UploadStatus::Uploading);
        self.inner.persist(&state).await?;

        info!(
            "Resuming upload {} from chunk {:?}",
            state.upload_id,
            state.next_pending_chunk()
        );

        session.state = Some(state);
        session.paused = false;
        if session.worker.is_none() {
            self.spawn_worker(&mut session);
        } else {
            // The worker is still draining and will pick the flag change up
            let events = session.events.clone();
            drop(session);
            emit(&events, vec![UploadEvent::StatusChanged(UploadStatus::Uploading)]).await;
        }

        Ok(())
    }

    /// Abort in-flight requests and forget the session, including its persisted state
    pub async fn cancel(&self) -> UploadResult<()> {
        let mut session = self.inner.session.lock().await;
        if session.cancelled {
            return Ok(());
        }

        session.cancelled = true;
        session.generation += 1;
        if let Some(worker) = session.worker.take() {
            worker.abort();
        }
        session.events = None;
        session.data = Bytes::new();

        let Some(upload_id) = session.state.as_ref().map(|s| s.upload_id.clone()) else {
            return Ok(());
        };
        self.inner.store.delete(&upload_id).await?;
        info!("Cancelled upload {}", upload_id);
        Ok(())
    }

    pub async fn state(&self) -> Option<UploadState> {
        self.inner.session.lock().await.state.clone()
    }

    pub async fn upload_id(&self) -> Option<String> {
        let session = self.inner.session.lock().await;
        session.state.as_ref().map(|s| s.upload_id.clone())
    }

    /// Whether a worker is currently driving requests
    pub async fn is_active(&self) -> bool {
        self.inner.session.lock().await.worker.is_some()
    }

    /// Resumable sessions left behind for `match_id`
    pub async fn get_persisted_uploads_for_match(
        store: &dyn UploadStore,
        match_id: &str,
    ) -> UploadResult<Vec<PersistedUploadSummary>> {
        let states = store.list().await?;
        Ok(states
            .iter()
            .filter(|s| s.match_id == match_id && s.status != UploadStatus::Complete)
            .map(UploadState::summary)
            .collect())
    }

    pub async fn clear_persisted_upload(store: &dyn UploadStore, upload_id: &str) -> UploadResult<()> {
        store.delete(upload_id).await?;
        info!("Cleared persisted upload {}", upload_id);
        Ok(())
    }

    fn spawn_worker(&self, session: &mut Session) {
        session.generation += 1;
        let generation = session.generation;
        let inner = Arc::clone(&self.inner);
        session.worker = Some(tokio::spawn(async move {
            inner.run(generation).await;
        }));
    }
}

impl Inner {
    async fn persist(&self, state: &UploadState) -> UploadResult<()> {
        self.store.save(state).await.map_err(UploadError::from)
    }

    async fn run(self: Arc<Self>, generation: u64) {
        match Arc::clone(&self).drive(generation).await {
            Ok(()) => {}
            Err(UploadError::SessionClosed(upload_id)) => {
                debug!("Worker for upload {} superseded", upload_id);
            }
            Err(err) => self.fail(generation, err).await,
        }
    }

    async fn drive(self: Arc<Self>, generation: u64) -> UploadResult<()> {
        let (mut state, data, events) = {
            let mut session = self.session.lock().await;
            let state = session.current(generation)?.clone();
            (state, session.data.clone(), session.events.clone())
        };

        emit(
            &events,
            vec![
                UploadEvent::StatusChanged(UploadStatus::Uploading),
                UploadEvent::Progress(state.progress()),
            ],
        )
        .await;

        let mut pending: VecDeque<usize> = state.pending_chunks().into();
        let mut in_flight = FuturesUnordered::new();
        let max_in_flight = self.config.max_concurrent_chunks.max(1);

        loop {
            while in_flight.len() < max_in_flight && !pending.is_empty() {
                match self.gate(generation, false).await {
                    Gate::Continue => {}
                    Gate::Superseded => return Err(UploadError::SessionClosed(state.upload_id)),
                    _ => break,
                }
                let Some(index) = pending.pop_front() else {
                    break;
                };

                let range = state.chunk_range(index);
                let chunk = ChunkRequest {
                    upload_id: state.upload_id.clone(),
                    match_id: state.match_id.clone(),
                    filename: state.filename.clone(),
                    chunk_index: index,
                    total_chunks: state.total_chunks,
                    data: data.slice(range),
                };
                in_flight.push(self.send_chunk(chunk));
            }

            match in_flight.next().await {
                Some(result) => {
                    let index = result?;
                    state = self.acknowledge(generation, index).await?;
                }
                None => match self.gate(generation, true).await {
                    Gate::Continue => {
                        if pending.is_empty() {
                            // A resume while draining may have reloaded acks from storage
                            pending = state.pending_chunks().into();
                        }
                    }
                    Gate::Paused => {
                        debug!("Worker for upload {} parked", state.upload_id);
                        return Ok(());
                    }
                    Gate::Assemble => break,
                    Gate::Superseded => return Err(UploadError::SessionClosed(state.upload_id)),
                },
            }
        }

        drop(in_flight);
        self.assemble(generation).await
    }

    /// Decide whether to keep issuing requests. With `idle` set, no request
    /// is in flight and a paused worker releases its slot.
    async fn gate(&self, generation: u64, idle: bool) -> Gate {
        let mut session = self.session.lock().await;
        if session.cancelled || session.generation != generation {
            return Gate::Superseded;
        }

        let all_sent = session
            .state
            .as_ref()
            .map(UploadState::all_chunks_sent)
            .unwrap_or(false);

        if session.paused {
            if idle {
                session.worker = None;
            }
            Gate::Paused
        } else if idle && all_sent {
            Gate::Assemble
        } else {
            Gate::Continue
        }
    }

    async fn send_chunk(&self, chunk: ChunkRequest) -> UploadResult<usize> {
        let index = chunk.chunk_index;
        let what = format!("chunk {} of upload {}", index, chunk.upload_id);

        let ack = with_retry(&self.config.retry, &what, || {
            self.transport.send_chunk(chunk.clone())
        })
        .await?;

        if ack.chunk_index != index || ack.upload_id != chunk.upload_id {
            return Err(UploadError::Protocol(format!(
                "server acknowledged chunk {} of {} while {} of {} was sent",
                ack.chunk_index, ack.upload_id, index, chunk.upload_id
            )));
        }
        Ok(index)
    }

    async fn acknowledge(&self, generation: u64, index: usize) -> UploadResult<UploadState> {
        let (events, state) = {
            let mut session = self.session.lock().await;
            let state = session.current(generation)?;
            if !state.acknowledge(index) {
                debug!("Duplicate acknowledgment for chunk {}", index);
            }
            let state = state.clone();

            // Persist while holding the lock so records are written in ack order
            self.persist(&state).await?;
            (session.events.clone(), state)
        };

        debug!(
            "Upload {}: chunk {} acknowledged ({}/{})",
            state.upload_id,
            index,
            state.sent_chunks.len(),
            state.total_chunks
        );
        emit(&events, vec![UploadEvent::Progress(state.progress())]).await;
        Ok(state)
    }

    async fn assemble(self: Arc<Self>, generation: u64) -> UploadResult<()> {
        let (events, state) = {
            let mut session = self.session.lock().await;
            let state = session.current(generation)?;
            state.set_status(UploadStatus::Assembling);
            let state = state.clone();
            self.persist(&state).await?;
            (session.events.clone(), state)
        };
        emit(&events, vec![UploadEvent::StatusChanged(UploadStatus::Assembling)]).await;

        info!(
            "All {} chunks of upload {} acknowledged, requesting assembly",
            state.total_chunks, state.upload_id
        );

        let request = AssembleRequest {
            filename: state.filename.clone(),
            match_id: state.match_id.clone(),
            total_chunks: state.total_chunks,
            total_bytes: state.total_bytes,
        };
        let what = format!("assembly of upload {}", state.upload_id);
        let assembled = with_retry(&self.config.retry, &what, || {
            self.transport.assemble(&state.upload_id, request.clone())
        })
        .await?;

        if let Some(post_processor) = &self.post_processor {
            let reporter = StageReporter {
                inner: Arc::clone(&self),
                generation,
            };
            post_processor.process(&assembled, &reporter).await?;
        }

        {
            let mut session = self.session.lock().await;
            session.current(generation)?.set_status(UploadStatus::Complete);
            session.worker = None;

            // The file is assembled; a leftover record does not undo completion
            if let Err(e) = self.store.delete(&state.upload_id).await {
                warn!(
                    "Upload {} complete but its persisted record was not removed: {:#}",
                    state.upload_id, e
                );
            }
        }

        info!(
            "Upload {} complete: {} ({} bytes)",
            state.upload_id, assembled.file_url, assembled.size_bytes
        );
        emit(
            &events,
            vec![
                UploadEvent::StatusChanged(UploadStatus::Complete),
                UploadEvent::Completed(assembled),
            ],
        )
        .await;
        Ok(())
    }

    async fn fail(&self, generation: u64, err: UploadError) {
        let (events, state) = {
            let mut session = self.session.lock().await;
            let Ok(state) = session.current(generation) else {
                return;
            };
            state.set_status(UploadStatus::Error);
            let state = state.clone();
            session.worker = None;

            // Keep acknowledged chunks on disk so the caller can resume or cancel
            if let Err(e) = self.persist(&state).await {
                error!("Failed to persist errored upload {}: {}", state.upload_id, e);
            }
            (session.events.clone(), state)
        };

        error!(
            "Upload {} failed at {}/{} chunks: {}",
            state.upload_id,
            state.sent_chunks.len(),
            state.total_chunks,
            err
        );
        emit(
            &events,
            vec![
                UploadEvent::StatusChanged(UploadStatus::Error),
                UploadEvent::Failed(err),
            ],
        )
        .await;
    }
}

fn session_id(session: &Session) -> String {
    session
        .state
        .as_ref()
        .map(|s| s.upload_id.clone())
        .unwrap_or_default()
}

async fn emit(events: &Option<mpsc::Sender<UploadEvent>>, batch: Vec<UploadEvent>) {
    let Some(events) = events else {
        return;
    };
    for event in batch {
        if events.send(event).await.is_err() {
            debug!("Upload event receiver dropped");
            return;
        }
    }
}
