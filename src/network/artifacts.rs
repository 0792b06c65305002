//! Artifact listener
//!
//! One long-lived socket on the artifact port receives everything the
//! training server sends back: ridge model JSON, chunked TFLite payloads,
//! progress lines and error reports. Each datagram is decoded into an
//! `InboundMessage` and dispatched against the shared `ArtifactState`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use super::NetworkConfig;
use crate::protocol::{
    ChunkBuffer, InboundMessage, InsertOutcome, ModelArtifact, ModelType, RidgeModel,
    MAX_DATAGRAM_SIZE,
};

/// Listener errors
#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Listener already running")]
    AlreadyRunning,

    #[error("Listener not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type ListenerResult<T> = Result<T, ListenerError>;

/// Events emitted by the artifact listener
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactEvent {
    /// A complete model arrived
    Model(ModelArtifact),
    /// Training progress
    Progress { current: u32, total: u32, percent: u32 },
    /// Failure text reported by the training server
    ServerError(String),
}

struct SessionInner {
    generation: u64,
    chunks: ChunkBuffer,
    model_received: bool,
}

/// Chunk buffer and model-received flag shared between the listener and the uploader.
///
/// Both live under one lock together with a session generation, so a session
/// boundary clears them atomically.
pub struct ArtifactState {
    inner: Mutex<SessionInner>,
}

impl Default for ArtifactState {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SessionInner {
                generation: 0,
                chunks: ChunkBuffer::new(),
                model_received: false,
            }),
        }
    }

    /// Start a new training session: clear chunks and the flag, return the new generation
    pub fn begin_session(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        discard_partial(&mut inner.chunks);
        inner.model_received = false;
        inner.generation
    }

    /// Clear temporary data after a session while keeping the listener alive
    pub fn cleanup(&self) {
        let mut inner = self.inner.lock();
        discard_partial(&mut inner.chunks);
        inner.model_received = false;
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    pub fn is_model_received(&self) -> bool {
        self.inner.lock().model_received
    }

    /// True if a model arrived and no newer session has begun since `generation`
    pub fn model_received_since(&self, generation: u64) -> bool {
        let inner = self.inner.lock();
        inner.generation == generation && inner.model_received
    }

    /// Forget a received model, e.g. after the server reported an error
    pub fn reset_model_received(&self) {
        self.inner.lock().model_received = false;
    }

    pub fn buffered_chunks(&self) -> usize {
        self.inner.lock().chunks.len()
    }

    /// Indices of the artifact being collected that have not arrived yet
    pub fn missing_chunks(&self) -> Vec<u32> {
        self.inner.lock().chunks.missing()
    }

    fn mark_model_received(&self) {
        self.inner.lock().model_received = true;
    }

    /// Apply one decoded datagram; returns the event to publish, if any
    pub fn dispatch(&self, message: InboundMessage) -> Option<ArtifactEvent> {
        match message {
            InboundMessage::RidgeModel(json) => {
                match RidgeModel::from_json(&json) {
                    Ok(model) if model.model_type == ModelType::RidgeForExo => {
                        tracing::info!(
                            "Ridge model received: {} classes, window {}",
                            model.models.len(),
                            model.preprocessing.window_size
                        );
                    }
                    Ok(model) => {
                        tracing::warn!("Model JSON tagged {}, forwarding anyway", model.model_type);
                    }
                    Err(e) => {
                        tracing::warn!("Model JSON does not match the ridge schema: {}", e);
                    }
                }
                self.mark_model_received();
                Some(ArtifactEvent::Model(ModelArtifact::Ridge(json)))
            }
            InboundMessage::Chunk {
                index,
                total,
                payload,
            } => {
                let mut inner = self.inner.lock();
                match inner.chunks.insert(index, total, payload) {
                    InsertOutcome::Pending { received, total } => {
                        tracing::debug!("Model chunk {} stored ({}/{})", index, received, total);
                        None
                    }
                    InsertOutcome::Complete(bytes) => {
                        inner.model_received = true;
                        tracing::info!("TFLite model reassembled: {} bytes", bytes.len());
                        Some(ArtifactEvent::Model(ModelArtifact::Tflite(bytes)))
                    }
                }
            }
            InboundMessage::Progress(progress) => {
                let percent = progress.percent();
                tracing::debug!(
                    "Training progress {}/{} = {}%",
                    progress.current,
                    progress.total,
                    percent
                );
                Some(ArtifactEvent::Progress {
                    current: progress.current,
                    total: progress.total,
                    percent,
                })
            }
            InboundMessage::ServerError(message) => {
                tracing::warn!("Training server error: {}", message);
                Some(ArtifactEvent::ServerError(message))
            }
            InboundMessage::Malformed { kind, reason } => {
                tracing::warn!("Dropping malformed {} message: {}", kind, reason);
                None
            }
            InboundMessage::Unknown => None,
        }
    }
}

fn discard_partial(chunks: &mut ChunkBuffer) {
    if !chunks.is_empty() {
        tracing::warn!(
            "Discarding incomplete model: {} chunks buffered, {} missing",
            chunks.len(),
            chunks.missing().len()
        );
    }
    chunks.clear();
}

/// Long-lived receiver on the artifact port
pub struct ArtifactListener {
    config: NetworkConfig,
    state: Arc<ArtifactState>,
    event_tx: mpsc::Sender<ArtifactEvent>,
    event_rx: Option<mpsc::Receiver<ArtifactEvent>>,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    task: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl ArtifactListener {
    pub fn new(config: NetworkConfig, state: Arc<ArtifactState>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            config,
            state,
            event_tx,
            event_rx: Some(event_rx),
            local_addr: None,
            shutdown_tx: None,
            task: None,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ArtifactEvent>> {
        self.event_rx.take()
    }

    pub fn state(&self) -> Arc<ArtifactState> {
        self.state.clone()
    }

    /// Bind the artifact port and spawn the receive loop
    pub async fn start(&mut self) -> ListenerResult<SocketAddr> {
        if self.is_running() {
            return Err(ListenerError::AlreadyRunning);
        }

        let bind_addr = self.config.artifact_bind();
        let socket = UdpSocket::bind(&bind_addr).await.map_err(|e| {
            ListenerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;
        let local_addr = socket.local_addr()?;
        tracing::info!("Artifact listener on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local_addr);
        self.running.store(true, Ordering::SeqCst);

        self.task = Some(tokio::spawn(artifact_loop(
            socket,
            self.state.clone(),
            self.event_tx.clone(),
            self.config.timings.artifact_recv_timeout,
            shutdown_rx,
            self.running.clone(),
        )));

        Ok(local_addr)
    }

    /// Stop the receive loop and wait until the port is released
    pub async fn stop(&mut self) -> ListenerResult<()> {
        let Some(tx) = self.shutdown_tx.take() else {
            return Err(ListenerError::NotRunning);
        };
        let _ = tx.send(()).await;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.local_addr = None;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

async fn artifact_loop(
    socket: UdpSocket,
    state: Arc<ArtifactState>,
    event_tx: mpsc::Sender<ArtifactEvent>,
    recv_timeout: Duration,
    mut shutdown_rx: mpsc::Receiver<()>,
    running: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            result = tokio::time::timeout(recv_timeout, socket.recv_from(&mut buf)) => {
                match result {
                    Ok(Ok((n, from))) => {
                        let message = InboundMessage::decode(&buf[..n]);
                        tracing::trace!("{} message ({} bytes) from {}", message.kind(), n, from);

                        if let Some(event) = state.dispatch(message) {
                            match event_tx.try_send(event) {
                                Ok(()) => {}
                                Err(TrySendError::Full(event)) => {
                                    tracing::warn!("Event queue full, dropping {:?}", event);
                                }
                                Err(TrySendError::Closed(_)) => {
                                    tracing::trace!("No artifact event consumer");
                                }
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        tracing::error!("Artifact listener error: {}", e);
                    }
                    Err(_) => continue,
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::info!("Artifact listener shutdown requested");
                break;
            }
        }
    }

    running.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

    const RIDGE_JSON: &str = r#"{"type":"RIDGE_FOR_EXO","models":[{"intercept":0.1,"coef":[1.0]}],"preprocessing":{"window_size":25,"features":["rms"]}}"#;

    fn chunk_message(index: usize, total: usize, payload: &[u8]) -> InboundMessage {
        let line = format!("MLP_TFLITE_CHUNK:{}:{}:{}", index, total, BASE64.encode(payload));
        InboundMessage::decode(line.as_bytes())
    }

    #[test]
    fn test_dispatch_ridge_marks_received() {
        let state = ArtifactState::new();
        let generation = state.begin_session();

        let event = state.dispatch(InboundMessage::decode(RIDGE_JSON.as_bytes()));
        assert_eq!(
            event,
            Some(ArtifactEvent::Model(ModelArtifact::Ridge(RIDGE_JSON.to_string())))
        );
        assert!(state.model_received_since(generation));
    }

    #[test]
    fn test_dispatch_chunks_out_of_order() {
        let state = ArtifactState::new();
        let generation = state.begin_session();
        let model: Vec<u8> = (0..=255u8).cycle().take(5000).collect();
        let parts: Vec<&[u8]> = model.chunks(1200).collect();

        for index in [3, 0, 4, 2] {
            assert_eq!(state.dispatch(chunk_message(index, parts.len(), parts[index])), None);
            assert!(!state.is_model_received());
        }
        let event = state.dispatch(chunk_message(1, parts.len(), parts[1]));

        assert_eq!(event, Some(ArtifactEvent::Model(ModelArtifact::Tflite(model))));
        assert!(state.model_received_since(generation));
        assert_eq!(state.buffered_chunks(), 0);
    }

    #[test]
    fn test_dispatch_progress_and_errors() {
        let state = ArtifactState::new();

        assert_eq!(
            state.dispatch(InboundMessage::decode(b"TRAINING_PROGRESS 40/200")),
            Some(ArtifactEvent::Progress {
                current: 40,
                total: 200,
                percent: 20
            })
        );
        assert_eq!(state.dispatch(InboundMessage::decode(b"TRAINING_PROGRESS x/y")), None);
        assert_eq!(
            state.dispatch(InboundMessage::decode(b"SERVER_ERROR:train_and_send_models: bad csv")),
            Some(ArtifactEvent::ServerError("train_and_send_models: bad csv".to_string()))
        );
        assert_eq!(state.dispatch(InboundMessage::decode(b"ALL_CHUNKS_RECEIVED")), None);
        assert!(!state.is_model_received());
    }

    #[test]
    fn test_new_session_discards_stale_chunks() {
        let state = ArtifactState::new();
        let first = state.begin_session();
        state.dispatch(chunk_message(0, 2, b"old"));
        state.dispatch(InboundMessage::decode(RIDGE_JSON.as_bytes()));

        let second = state.begin_session();
        assert_ne!(first, second);
        assert_eq!(state.buffered_chunks(), 0);
        assert!(!state.model_received_since(second));
        assert!(!state.model_received_since(first));

        state.dispatch(chunk_message(1, 3, b"new"));
        assert_eq!(state.buffered_chunks(), 1);
        assert_eq!(state.missing_chunks(), vec![0, 2]);

        state.cleanup();
        assert!(state.missing_chunks().is_empty());
    }

    #[tokio::test]
    async fn test_listener_emits_events() {
        let state = Arc::new(ArtifactState::new());
        let mut listener = ArtifactListener::new(NetworkConfig::loopback(), state.clone());
        let mut events = listener.take_event_receiver().unwrap();
        let addr = listener.start().await.unwrap();

        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        server.send_to(b"TRAINING_PROGRESS 1/4", addr).await.unwrap();
        server.send_to(b"SERVER_ERROR:oops", addr).await.unwrap();
        server.send_to(RIDGE_JSON.as_bytes(), addr).await.unwrap();

        let mut received = Vec::new();
        for _ in 0..3 {
            let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
                .await
                .unwrap()
                .unwrap();
            received.push(event);
        }

        assert_eq!(
            received,
            vec![
                ArtifactEvent::Progress {
                    current: 1,
                    total: 4,
                    percent: 25
                },
                ArtifactEvent::ServerError("oops".to_string()),
                ArtifactEvent::Model(ModelArtifact::Ridge(RIDGE_JSON.to_string())),
            ]
        );
        assert!(state.is_model_received());

        listener.stop().await.unwrap();
        assert!(!listener.is_running());
    }
}
