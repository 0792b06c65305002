//! Training dataset upload
//!
//! Stop-and-wait transfer over UDP: a text header acknowledged with
//! `HEADER_ACK`, then one chunk at a time, each acknowledged with
//! `ACK:<index>`, then a bounded wait for the artifact listener to report
//! that the trained model arrived.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::artifacts::ArtifactState;
use super::{ephemeral_bind_for, resolve_host, NetworkConfig, Timings};
use crate::protocol::{
    encode_training_header, is_header_ack, parse_chunk_ack, ChunkPlan, CodecError, ModelType,
    ALL_CHUNKS_RECEIVED,
};

const REPLY_BUFFER_SIZE: usize = 64;

/// Upload errors; every variant ends the upload call
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Dataset is empty")]
    EmptyDataset,

    #[error("Header ACK not received after {attempts} attempts")]
    HeaderAckTimeout { attempts: u32 },

    #[error("Chunk {index} failed after {attempts} attempts")]
    ChunkAckTimeout { index: u32, attempts: u32 },

    #[error("Model not received in time ({0:?})")]
    ModelTimeout(Duration),

    #[error("Upload aborted")]
    Aborted,
}

pub type UploadResult<T> = Result<T, UploadError>;

/// Summary of a successful upload
#[derive(Debug, Clone)]
pub struct UploadReport {
    pub session_id: Uuid,
    pub model_type: ModelType,
    pub total_chunks: u32,
    pub bytes: usize,
    /// Datagrams sent beyond the first attempt of each unit
    pub retransmissions: u32,
    pub elapsed: Duration,
    pub message: String,
}

struct ActiveSession {
    id: Uuid,
    // Dropping this sender tears the session down
    _abort_tx: mpsc::Sender<()>,
}

/// Drives one training upload at a time
pub struct TrainingUploader {
    config: NetworkConfig,
    artifacts: Arc<ArtifactState>,
    active: Mutex<Option<ActiveSession>>,
}

impl TrainingUploader {
    pub fn new(config: NetworkConfig, artifacts: Arc<ArtifactState>) -> Self {
        Self {
            config,
            artifacts,
            active: Mutex::new(None),
        }
    }

    /// Upload a dataset and wait for the resulting model.
    ///
    /// Starting an upload while another is in flight tears the older one
    /// down; it fails with `UploadError::Aborted`.
    pub async fn upload(
        &self,
        data: impl Into<Bytes>,
        model_type: ModelType,
    ) -> UploadResult<UploadReport> {
        let id = Uuid::new_v4();
        let generation = self.artifacts.begin_session();
        let (abort_tx, abort_rx) = mpsc::channel::<()>(1);

        if let Some(previous) = self.active.lock().replace(ActiveSession {
            id,
            _abort_tx: abort_tx,
        }) {
            tracing::warn!("Training session {} superseded by {}", previous.id, id);
        }

        let result = self
            .run(id, generation, data.into(), model_type, abort_rx)
            .await;

        {
            let mut active = self.active.lock();
            if active.as_ref().is_some_and(|s| s.id == id) {
                *active = None;
            }
        }

        match &result {
            Ok(report) => tracing::info!(
                "Training session {} complete: {} chunks, {} retransmissions, {:?}",
                id,
                report.total_chunks,
                report.retransmissions,
                report.elapsed
            ),
            Err(e) => tracing::error!("Training session {} failed: {}", id, e),
        }
        result
    }

    /// Tear down the in-flight upload, if any
    pub fn abort(&self) -> bool {
        self.active.lock().take().is_some()
    }

    pub fn is_busy(&self) -> bool {
        self.active.lock().is_some()
    }

    async fn run(
        &self,
        id: Uuid,
        generation: u64,
        data: Bytes,
        model_type: ModelType,
        abort_rx: mpsc::Receiver<()>,
    ) -> UploadResult<UploadReport> {
        let started = Instant::now();
        let timings = &self.config.timings;

        let plan = ChunkPlan::new(data, timings.chunk_size)?;
        if plan.is_empty() {
            return Err(UploadError::EmptyDataset);
        }

        let peer = resolve_host(&self.config.training_host, self.config.training_port).await?;
        let socket = UdpSocket::bind(ephemeral_bind_for(&peer)).await?;
        tracing::info!(
            "Training session {}: {} bytes of {} in {} chunks to {}",
            id,
            plan.len_bytes(),
            model_type,
            plan.total(),
            peer
        );

        let mut session = Session {
            socket,
            peer,
            abort_rx,
            buf: [0u8; REPLY_BUFFER_SIZE],
            retransmissions: 0,
        };

        session.send_header(model_type, plan.total(), timings).await?;
        session.send_chunks(&plan, timings).await?;
        session
            .wait_for_model(&self.artifacts, generation, timings)
            .await?;

        Ok(UploadReport {
            session_id: id,
            model_type,
            total_chunks: plan.total(),
            bytes: plan.len_bytes(),
            retransmissions: session.retransmissions,
            elapsed: started.elapsed(),
            message: "Model received".to_string(),
        })
    }
}

/// Socket and abort signal owned by one upload call
struct Session {
    socket: UdpSocket,
    peer: SocketAddr,
    abort_rx: mpsc::Receiver<()>,
    buf: [u8; REPLY_BUFFER_SIZE],
    retransmissions: u32,
}

impl Session {
    async fn send_header(
        &mut self,
        model_type: ModelType,
        total: u32,
        timings: &Timings,
    ) -> UploadResult<()> {
        let header = encode_training_header(model_type, total);

        for attempt in 1..=timings.header_attempts {
            if attempt > 1 {
                self.retransmissions += 1;
            }
            self.socket.send_to(header.as_bytes(), self.peer).await?;
            if self
                .await_reply(timings.header_ack_timeout, is_header_ack)
                .await?
            {
                tracing::debug!("HEADER_ACK after {} attempt(s)", attempt);
                return Ok(());
            }
            tracing::debug!(
                "No HEADER_ACK (attempt {}/{})",
                attempt,
                timings.header_attempts
            );
        }

        Err(UploadError::HeaderAckTimeout {
            attempts: timings.header_attempts,
        })
    }

    async fn send_chunks(&mut self, plan: &ChunkPlan, timings: &Timings) -> UploadResult<()> {
        for index in 0..plan.total() {
            let datagram = plan.datagram(index);
            let mut acked = false;

            for attempt in 1..=timings.chunk_attempts {
                if attempt > 1 {
                    self.retransmissions += 1;
                }
                self.socket.send_to(&datagram, self.peer).await?;
                if self
                    .await_reply(timings.chunk_ack_timeout, |reply| match parse_chunk_ack(reply) {
                        Some(acked) if acked == index => true,
                        Some(stale) => {
                            tracing::debug!("Stale ACK:{} while waiting for chunk {}", stale, index);
                            false
                        }
                        None => false,
                    })
                    .await?
                {
                    acked = true;
                    break;
                }
                tracing::debug!(
                    "No ACK for chunk {} (attempt {}/{})",
                    index,
                    attempt,
                    timings.chunk_attempts
                );
            }

            if !acked {
                return Err(UploadError::ChunkAckTimeout {
                    index,
                    attempts: timings.chunk_attempts,
                });
            }
            tracing::trace!("Chunk {}/{} acknowledged", index + 1, plan.total());
        }
        Ok(())
    }

    async fn wait_for_model(
        &mut self,
        artifacts: &ArtifactState,
        generation: u64,
        timings: &Timings,
    ) -> UploadResult<()> {
        let deadline = Instant::now() + timings.model_wait;

        loop {
            if artifacts.model_received_since(generation) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(UploadError::ModelTimeout(timings.model_wait));
            }
            // Doubles as the poll interval while draining late server replies
            self.await_reply(timings.model_poll_interval, |reply| {
                if reply == ALL_CHUNKS_RECEIVED {
                    tracing::debug!("Training server has every chunk");
                } else if reply.starts_with("RESEND:") {
                    tracing::warn!("Server requested {} after all chunks were acked", reply);
                }
                false
            })
            .await?;
        }
    }

    /// Wait up to `window` for a reply accepted by `accept`; other replies are skipped
    async fn await_reply(
        &mut self,
        window: Duration,
        accept: impl Fn(&str) -> bool,
    ) -> UploadResult<bool> {
        let deadline = tokio::time::Instant::now() + window;

        loop {
            tokio::select! {
                result = tokio::time::timeout_at(deadline, self.socket.recv_from(&mut self.buf)) => {
                    match result {
                        Ok(Ok((n, from))) => {
                            let reply = String::from_utf8_lossy(&self.buf[..n]);
                            if accept(&*reply) {
                                return Ok(true);
                            }
                            tracing::trace!("Skipping reply {:?} from {}", reply, from);
                        }
                        Ok(Err(e)) => return Err(e.into()),
                        Err(_) => return Ok(false),
                    }
                }
                _ = self.abort_rx.recv() => {
                    return Err(UploadError::Aborted);
                }
            }
        }
    }
}
