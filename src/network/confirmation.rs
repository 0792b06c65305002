//! Settings confirmation listener
//!
//! Long-lived receiver on the confirmation port. A datagram containing
//! "success" while settings are pending moves the link to `ReadyToStart`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::artifacts::{ListenerError, ListenerResult};
use super::connection::{ConnectionState, ConnectionStateMachine, LinkTrigger};
use super::NetworkConfig;
use crate::protocol::CONFIRMATION_TOKEN;

const CONFIRMATION_BUFFER_SIZE: usize = 1024;

/// Background task completing the `SettingsSent -> ReadyToStart` step
pub struct ConfirmationListener {
    config: NetworkConfig,
    state: Arc<ConnectionStateMachine>,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    task: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl ConfirmationListener {
    pub fn new(config: NetworkConfig, state: Arc<ConnectionStateMachine>) -> Self {
        Self {
            config,
            state,
            local_addr: None,
            shutdown_tx: None,
            task: None,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Bind the confirmation port and spawn the receive loop
    pub async fn start(&mut self) -> ListenerResult<SocketAddr> {
        if self.is_running() {
            return Err(ListenerError::AlreadyRunning);
        }

        let bind_addr = self.config.confirmation_bind();
        let socket = UdpSocket::bind(&bind_addr).await.map_err(|e| {
            ListenerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;
        let local_addr = socket.local_addr()?;
        tracing::info!("Confirmation listener on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local_addr);
        self.running.store(true, Ordering::SeqCst);

        self.task = Some(tokio::spawn(confirmation_loop(
            socket,
            self.state.clone(),
            self.config.timings.confirmation_recv_timeout,
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

async fn confirmation_loop(
    socket: UdpSocket,
    state: Arc<ConnectionStateMachine>,
    recv_timeout: Duration,
    mut shutdown_rx: mpsc::Receiver<()>,
    running: Arc<AtomicBool>,
) {
    let mut buf = [0u8; CONFIRMATION_BUFFER_SIZE];

    loop {
        tokio::select! {
            result = tokio::time::timeout(recv_timeout, socket.recv_from(&mut buf)) => {
                match result {
                    Ok(Ok((n, from))) => {
                        let text = String::from_utf8_lossy(&buf[..n]);
                        handle_confirmation(&state, &text, from);
                    }
                    Ok(Err(e)) => {
                        tracing::error!("Confirmation listener error: {}", e);
                    }
                    // Timeout only re-polls
                    Err(_) => continue,
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::info!("Confirmation listener shutdown requested");
                break;
            }
        }
    }

    running.store(false, Ordering::SeqCst);
}

fn handle_confirmation(state: &ConnectionStateMachine, text: &str, from: SocketAddr) {
    if !text.contains(CONFIRMATION_TOKEN) {
        tracing::debug!("Ignoring confirmation-port datagram from {}: {:?}", from, text);
        return;
    }

    if state.current() != ConnectionState::SettingsSent {
        tracing::debug!(
            "Confirmation from {} while link is {}, ignored",
            from,
            state.current()
        );
        return;
    }

    if state.apply(LinkTrigger::ConfirmationReceived).is_some() {
        tracing::info!("Settings confirmed by {}, ready to start", from);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn started() -> (ConfirmationListener, Arc<ConnectionStateMachine>, SocketAddr) {
        let state = Arc::new(ConnectionStateMachine::new());
        let mut listener = ConfirmationListener::new(NetworkConfig::loopback(), state.clone());
        let addr = listener.start().await.unwrap();
        (listener, state, addr)
    }

    async fn send(addr: SocketAddr, text: &str) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.send_to(text.as_bytes(), addr).await.unwrap();
    }

    #[tokio::test]
    async fn test_success_confirms_pending_settings() {
        let (mut listener, state, addr) = started().await;
        let mut changes = state.subscribe();
        state.apply(LinkTrigger::SettingsSent);

        send(addr, "settings update: success").await;

        let mut last = None;
        while let Ok(Some(change)) =
            tokio::time::timeout(Duration::from_secs(1), changes.recv()).await
        {
            last = Some(change.to);
            if change.to == ConnectionState::ReadyToStart {
                break;
            }
        }
        assert_eq!(last, Some(ConnectionState::ReadyToStart));

        listener.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_other_content_is_ignored() {
        let (mut listener, state, addr) = started().await;
        state.apply(LinkTrigger::SettingsSent);

        send(addr, "failure").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(state.current(), ConnectionState::SettingsSent);

        listener.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_success_outside_settings_sent_is_ignored() {
        let (mut listener, state, addr) = started().await;

        send(addr, "success").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(state.current(), ConnectionState::Disconnected);

        listener.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let (mut listener, _state, _addr) = started().await;
        assert!(listener.is_running());
        assert!(matches!(listener.start().await, Err(ListenerError::AlreadyRunning)));

        listener.stop().await.unwrap();
        assert!(matches!(listener.stop().await, Err(ListenerError::NotRunning)));
        assert!(listener.local_addr().is_none());
    }
}
