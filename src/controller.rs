//! Motor controller
//!
//! Process-scoped owner of every socket and background task of the link.
//! Construct once, `start` once, `shutdown` once.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::network::{
    ArtifactEvent, ArtifactListener, ArtifactState, CommandResult, CommandSender,
    ConfirmationListener, ConnectionState, ConnectionStateMachine, ListenerError, NetworkConfig,
    RegressionStreamer, SendOutcome, StateChange, TrainingUploader, UploadReport, UploadResult,
};
use crate::protocol::{ModelType, MotorSettings, REGRESSION_VALUES};

/// Controller errors
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),

    #[error("Timed out waiting for link state {expected} (still {actual})")]
    StateTimeout {
        expected: ConnectionState,
        actual: ConnectionState,
    },
}

pub type ControllerResult<T> = Result<T, ControllerError>;

/// Addresses the background listeners are bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerAddrs {
    pub confirmation: SocketAddr,
    pub artifacts: SocketAddr,
}

/// Owns the motor link, the training upload and the regression stream
pub struct MotorController {
    state: Arc<ConnectionStateMachine>,
    artifacts: Arc<ArtifactState>,
    commands: CommandSender,
    confirmations: ConfirmationListener,
    listener: ArtifactListener,
    uploader: TrainingUploader,
    regression: RegressionStreamer,
}

impl MotorController {
    pub fn new(config: NetworkConfig) -> Self {
        let state = Arc::new(ConnectionStateMachine::new());
        let artifacts = Arc::new(ArtifactState::new());

        Self {
            commands: CommandSender::new(config.clone(), state.clone()),
            confirmations: ConfirmationListener::new(config.clone(), state.clone()),
            listener: ArtifactListener::new(config.clone(), artifacts.clone()),
            uploader: TrainingUploader::new(config.clone(), artifacts.clone()),
            regression: RegressionStreamer::new(&config, state.clone()),
            state,
            artifacts,
        }
    }

    /// Bind both listeners and start their receive loops
    pub async fn start(&mut self) -> ControllerResult<ListenerAddrs> {
        let confirmation = self.confirmations.start().await?;

        let artifacts = match self.listener.start().await {
            Ok(addr) => addr,
            Err(e) => {
                let _ = self.confirmations.stop().await;
                return Err(e.into());
            }
        };

        tracing::info!(
            "Motor controller started (confirmations {}, artifacts {})",
            confirmation,
            artifacts
        );
        Ok(ListenerAddrs {
            confirmation,
            artifacts,
        })
    }

    /// Both listeners are bound and receiving
    pub fn is_ready(&self) -> bool {
        self.confirmations.is_running() && self.listener.is_running()
    }

    /// Stop the listeners and release the regression socket.
    ///
    /// Takes `&mut self`, so no upload borrowed from this controller can still be running.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.listener.stop().await {
            tracing::debug!("Artifact listener: {}", e);
        }
        if let Err(e) = self.confirmations.stop().await {
            tracing::debug!("Confirmation listener: {}", e);
        }
        self.artifacts.cleanup();
        self.regression.close().await;
        tracing::info!("Motor controller stopped");
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.current()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StateChange> {
        self.state.subscribe()
    }

    /// Return the link to `Disconnected` without sending anything, e.g. to leave `Error`
    pub fn reset_link(&self) -> Option<StateChange> {
        self.state.reset()
    }

    /// Take the artifact event receiver (can only be called once)
    pub fn take_artifact_events(&mut self) -> Option<mpsc::Receiver<ArtifactEvent>> {
        self.listener.take_event_receiver()
    }

    /// Wait until the link reaches `expected`
    pub async fn wait_for_state(
        &self,
        expected: ConnectionState,
        timeout: Duration,
    ) -> ControllerResult<()> {
        let mut changes = self.state.subscribe();
        if self.state.current() == expected {
            return Ok(());
        }

        let wait = async {
            while let Some(change) = changes.recv().await {
                if change.to == expected {
                    return true;
                }
            }
            false
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(true) => Ok(()),
            _ => Err(ControllerError::StateTimeout {
                expected,
                actual: self.state.current(),
            }),
        }
    }

    pub async fn send_settings(&self, settings: &MotorSettings) -> CommandResult<()> {
        self.commands.send_settings(settings).await
    }

    pub async fn send_start(&self) -> CommandResult<()> {
        self.commands.send_start().await
    }

    pub async fn send_disconnect(&self) -> CommandResult<()> {
        self.commands.send_disconnect().await
    }

    pub async fn upload_training_data(
        &self,
        data: impl Into<Bytes>,
        model_type: ModelType,
    ) -> UploadResult<UploadReport> {
        self.uploader.upload(data, model_type).await
    }

    pub async fn send_regression_values(&self, values: &[f64; REGRESSION_VALUES]) -> SendOutcome {
        self.regression.send(values).await
    }

    /// Clear chunk buffer and model flag, keeping the listeners alive
    pub fn cleanup_after_session(&self) {
        self.artifacts.cleanup();
    }

    /// Forget a received model (the application does this on a server error)
    pub fn reset_model_received(&self) {
        self.artifacts.reset_model_received();
    }

    pub async fn close_regression_socket(&self) {
        self.regression.close().await;
    }
}
