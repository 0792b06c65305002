//! Regression value stream
//!
//! Best-effort, high-rate delivery of 4-value prediction vectors to the
//! motor. Samples are dropped rather than reported when anything fails.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::Mutex;

use super::connection::{ConnectionState, ConnectionStateMachine};
use super::{ephemeral_bind_for, resolve_host, NetworkConfig};
use crate::protocol::{encode_regression, REGRESSION_VALUES};

/// What happened to one regression sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Link not connected; nothing was sent
    Skipped(ConnectionState),
    /// Wrong number of values; nothing was sent
    Rejected,
    /// The send failed; the socket will be recreated on the next sample
    Dropped,
}

/// Lazily created outbound socket shared by concurrent senders.
///
/// Reconnect policy: any send failure drops the socket, the next send
/// creates a fresh one.
pub struct RegressionSocket {
    host: String,
    port: u16,
    send_timeout: Duration,
    inner: Mutex<Option<(UdpSocket, SocketAddr)>>,
}

impl RegressionSocket {
    pub fn new(host: impl Into<String>, port: u16, send_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            send_timeout,
            inner: Mutex::new(None),
        }
    }

    /// Send one datagram, creating the socket first if needed
    pub async fn send(&self, payload: &[u8]) -> io::Result<()> {
        let mut guard = self.inner.lock().await;

        if guard.is_none() {
            let peer = resolve_host(&self.host, self.port).await?;
            let socket = UdpSocket::bind(ephemeral_bind_for(&peer)).await?;
            tracing::debug!("Regression socket {} -> {}", socket.local_addr()?, peer);
            *guard = Some((socket, peer));
        }

        let result = match guard.as_ref() {
            Some((socket, peer)) => {
                match tokio::time::timeout(self.send_timeout, socket.send_to(payload, *peer)).await
                {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "send timed out")),
                }
            }
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "no socket")),
        };

        if result.is_err() {
            *guard = None;
        }
        result
    }

    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    pub async fn close(&self) {
        if self.inner.lock().await.take().is_some() {
            tracing::debug!("Regression socket closed");
        }
    }
}

/// Pushes prediction vectors to the motor while the link is connected
pub struct RegressionStreamer {
    state: Arc<ConnectionStateMachine>,
    socket: RegressionSocket,
}

impl RegressionStreamer {
    pub fn new(config: &NetworkConfig, state: Arc<ConnectionStateMachine>) -> Self {
        Self {
            state,
            socket: RegressionSocket::new(
                config.motor_host.clone(),
                config.regression_port,
                config.timings.regression_send_timeout,
            ),
        }
    }

    /// Send one vector; a no-op unless the link is `Connected`
    pub async fn send(&self, values: &[f64; REGRESSION_VALUES]) -> SendOutcome {
        if !self.state.is_connected() {
            let current = self.state.current();
            tracing::trace!("Link {}, skipping regression values", current);
            return SendOutcome::Skipped(current);
        }

        match self.socket.send(&encode_regression(values)).await {
            Ok(()) => SendOutcome::Sent,
            Err(e) => {
                tracing::warn!("Failed to send regression values: {}", e);
                SendOutcome::Dropped
            }
        }
    }

    /// Like `send`, for callers holding an unchecked slice
    pub async fn send_slice(&self, values: &[f64]) -> SendOutcome {
        match <&[f64; REGRESSION_VALUES]>::try_from(values) {
            Ok(values) => self.send(values).await,
            Err(_) => {
                tracing::error!(
                    "Regression values must contain exactly {} elements, got {}",
                    REGRESSION_VALUES,
                    values.len()
                );
                SendOutcome::Rejected
            }
        }
    }

    /// Release the socket; the next send recreates it
    pub async fn close(&self) {
        self.socket.close().await;
    }

    pub async fn is_socket_open(&self) -> bool {
        self.socket.is_open().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::LinkTrigger;
    use crate::protocol::decode_regression;

    async fn setup() -> (UdpSocket, RegressionStreamer, Arc<ConnectionStateMachine>) {
        let motor = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = NetworkConfig::loopback().with_motor_addr(motor.local_addr().unwrap());
        let state = Arc::new(ConnectionStateMachine::new());
        let streamer = RegressionStreamer::new(&config, state.clone());
        (motor, streamer, state)
    }

    fn connect(state: &ConnectionStateMachine) {
        state.apply(LinkTrigger::SettingsSent);
        state.apply(LinkTrigger::ConfirmationReceived);
        state.apply(LinkTrigger::StartSent);
    }

    async fn recv(socket: &UdpSocket) -> Option<Vec<u8>> {
        let mut buf = [0u8; 128];
        let (n, _) = tokio::time::timeout(Duration::from_millis(200), socket.recv_from(&mut buf))
            .await
            .ok()?
            .ok()?;
        Some(buf[..n].to_vec())
    }

    #[tokio::test]
    async fn test_noop_when_not_connected() {
        let (motor, streamer, state) = setup().await;
        state.apply(LinkTrigger::SettingsSent);

        let outcome = streamer.send(&[1.0, 2.0, 3.0, 4.0]).await;
        assert_eq!(outcome, SendOutcome::Skipped(ConnectionState::SettingsSent));
        assert!(recv(&motor).await.is_none());
        assert!(!streamer.is_socket_open().await);
    }

    #[tokio::test]
    async fn test_sends_one_datagram_when_connected() {
        let (motor, streamer, state) = setup().await;
        connect(&state);

        let values = [0.5, -1.25, 3.0, 1e-3];
        assert_eq!(streamer.send(&values).await, SendOutcome::Sent);

        let datagram = recv(&motor).await.unwrap();
        assert_eq!(datagram.len(), 32);
        assert_eq!(decode_regression(&datagram).unwrap(), values);
        assert!(recv(&motor).await.is_none());
    }

    #[tokio::test]
    async fn test_socket_is_reused_and_recreated() {
        let (motor, streamer, state) = setup().await;
        connect(&state);

        streamer.send(&[1.0; 4]).await;
        let mut buf = [0u8; 64];
        let (_, first_from) = motor.recv_from(&mut buf).await.unwrap();
        streamer.send(&[2.0; 4]).await;
        let (_, second_from) = motor.recv_from(&mut buf).await.unwrap();
        assert_eq!(first_from, second_from);

        streamer.close().await;
        assert!(!streamer.is_socket_open().await);
        assert_eq!(streamer.send(&[3.0; 4]).await, SendOutcome::Sent);
        assert!(streamer.is_socket_open().await);
    }

    #[tokio::test]
    async fn test_concurrent_senders() {
        let (motor, streamer, state) = setup().await;
        connect(&state);
        let streamer = Arc::new(streamer);

        let mut handles = Vec::new();
        for i in 0..8 {
            let streamer = streamer.clone();
            handles.push(tokio::spawn(async move {
                streamer.send(&[i as f64; 4]).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), SendOutcome::Sent);
        }

        let mut count = 0;
        while recv(&motor).await.is_some() {
            count += 1;
        }
        assert_eq!(count, 8);
    }

    #[tokio::test]
    async fn test_failure_drops_socket() {
        let state = Arc::new(ConnectionStateMachine::new());
        connect(&state);
        let config = NetworkConfig {
            regression_port: 0,
            ..NetworkConfig::loopback()
        };
        let streamer = RegressionStreamer::new(&config, state);

        assert_eq!(streamer.send(&[1.0; 4]).await, SendOutcome::Dropped);
        assert!(!streamer.is_socket_open().await);
    }

    #[tokio::test]
    async fn test_wrong_length_rejected() {
        let (motor, streamer, state) = setup().await;
        connect(&state);

        assert_eq!(streamer.send_slice(&[1.0, 2.0]).await, SendOutcome::Rejected);
        assert!(recv(&motor).await.is_none());
        assert_eq!(streamer.send_slice(&[1.0, 2.0, 3.0, 4.0]).await, SendOutcome::Sent);
    }
}
