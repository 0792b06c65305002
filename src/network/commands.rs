//! One-shot motor commands
//!
//! Every operation opens a fresh socket, sends exactly one datagram and
//! advances the link state on local send success. Nothing is retried and
//! no peer acknowledgement is awaited here.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::UdpSocket;

use super::connection::{ConnectionState, ConnectionStateMachine, LinkTrigger};
use super::{ephemeral_bind_for, resolve_host, NetworkConfig};
use crate::protocol::{Command, MotorSettings, SettingsError};

/// Command errors
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid settings: {0}")]
    Settings(#[from] SettingsError),

    #[error("Command encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not ready to start (link is {0})")]
    NotReady(ConnectionState),
}

pub type CommandResult<T> = Result<T, CommandError>;

/// Sends settings, start and disconnect datagrams to the motor server
#[derive(Clone)]
pub struct CommandSender {
    config: NetworkConfig,
    state: Arc<ConnectionStateMachine>,
}

impl CommandSender {
    pub fn new(config: NetworkConfig, state: Arc<ConnectionStateMachine>) -> Self {
        Self { config, state }
    }

    /// Send motor settings; the link moves to `SettingsSent` once the datagram is out.
    ///
    /// The peer's confirmation is handled by the confirmation listener.
    pub async fn send_settings(&self, settings: &MotorSettings) -> CommandResult<()> {
        let result = async {
            settings.validate()?;
            let payload = settings.to_json()?;
            self.send_datagram(self.config.settings_port, payload.as_bytes())
                .await?;
            Ok::<_, CommandError>(())
        }
        .await;

        match result {
            Ok(()) => {
                self.state.apply(LinkTrigger::SettingsSent);
                tracing::info!("Motor settings sent");
                Ok(())
            }
            Err(e) => {
                self.state.apply(LinkTrigger::SettingsFailed);
                tracing::error!("Failed to send motor settings: {}", e);
                Err(e)
            }
        }
    }

    /// Send the start signal; only allowed once settings are confirmed
    pub async fn send_start(&self) -> CommandResult<()> {
        let current = self.state.current();
        if current != ConnectionState::ReadyToStart {
            return Err(CommandError::NotReady(current));
        }

        match self.send_command(Command::Start, self.config.start_port).await {
            Ok(()) => {
                self.state.apply(LinkTrigger::StartSent);
                Ok(())
            }
            Err(e) => {
                self.state.apply(LinkTrigger::StartFailed);
                Err(e)
            }
        }
    }

    /// Send the disconnect signal; a failure leaves the link state untouched
    pub async fn send_disconnect(&self) -> CommandResult<()> {
        match self
            .send_command(Command::Disconnect, self.config.disconnect_port)
            .await
        {
            Ok(()) => {
                self.state.apply(LinkTrigger::DisconnectSent);
                Ok(())
            }
            Err(e) => {
                self.state.apply(LinkTrigger::DisconnectFailed);
                Err(e)
            }
        }
    }

    async fn send_command(&self, command: Command, port: u16) -> CommandResult<()> {
        let payload = command.to_json()?;
        match self.send_datagram(port, payload.as_bytes()).await {
            Ok(peer) => {
                tracing::info!("Sent {} command to {}", command.name(), peer);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to send {} command: {}", command.name(), e);
                Err(e.into())
            }
        }
    }

    async fn send_datagram(&self, port: u16, payload: &[u8]) -> std::io::Result<SocketAddr> {
        let peer = resolve_host(&self.config.motor_host, port).await?;
        let socket = UdpSocket::bind(ephemeral_bind_for(&peer)).await?;
        socket.send_to(payload, peer).await?;
        Ok(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn fake_motor() -> (UdpSocket, NetworkConfig) {
        let motor = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = NetworkConfig::loopback().with_motor_addr(motor.local_addr().unwrap());
        (motor, config)
    }

    async fn recv_text(socket: &UdpSocket) -> Option<String> {
        let mut buf = [0u8; 2048];
        let (n, _) = tokio::time::timeout(Duration::from_millis(300), socket.recv_from(&mut buf))
            .await
            .ok()?
            .ok()?;
        Some(String::from_utf8_lossy(&buf[..n]).into_owned())
    }

    #[tokio::test]
    async fn test_send_settings() {
        let (motor, config) = fake_motor().await;
        let state = Arc::new(ConnectionStateMachine::new());
        let sender = CommandSender::new(config, state.clone());

        sender.send_settings(&MotorSettings::default()).await.unwrap();
        assert_eq!(state.current(), ConnectionState::SettingsSent);

        let json = recv_text(&motor).await.unwrap();
        assert_eq!(MotorSettings::from_json(&json).unwrap(), MotorSettings::default());
    }

    #[tokio::test]
    async fn test_invalid_settings_drive_error() {
        let (motor, config) = fake_motor().await;
        let state = Arc::new(ConnectionStateMachine::new());
        let sender = CommandSender::new(config, state.clone());

        let settings = MotorSettings {
            position_kp: -1.0,
            ..Default::default()
        };
        let result = sender.send_settings(&settings).await;
        assert!(matches!(result, Err(CommandError::Settings(_))));
        assert_eq!(state.current(), ConnectionState::Error);
        assert!(recv_text(&motor).await.is_none());
    }

    #[tokio::test]
    async fn test_start_requires_ready_state() {
        let (motor, config) = fake_motor().await;
        let state = Arc::new(ConnectionStateMachine::new());
        let sender = CommandSender::new(config, state.clone());

        for setup in [None, Some(LinkTrigger::SettingsSent)] {
            if let Some(trigger) = setup {
                state.apply(trigger);
            }
            let before = state.current();
            let result = sender.send_start().await;
            assert!(matches!(result, Err(CommandError::NotReady(s)) if s == before));
            assert_eq!(state.current(), before);
        }
        assert!(recv_text(&motor).await.is_none());
    }

    #[tokio::test]
    async fn test_start_and_disconnect() {
        let (motor, config) = fake_motor().await;
        let state = Arc::new(ConnectionStateMachine::new());
        let sender = CommandSender::new(config, state.clone());

        state.apply(LinkTrigger::SettingsSent);
        state.apply(LinkTrigger::ConfirmationReceived);

        sender.send_start().await.unwrap();
        assert_eq!(state.current(), ConnectionState::Connected);
        assert_eq!(recv_text(&motor).await.unwrap(), r#"{"command":"start"}"#);

        sender.send_disconnect().await.unwrap();
        assert_eq!(state.current(), ConnectionState::Disconnected);
        assert_eq!(recv_text(&motor).await.unwrap(), r#"{"command":"disconnect"}"#);
    }

    #[tokio::test]
    async fn test_disconnect_failure_keeps_state() {
        // Linux refuses to send UDP to port 0
        let config = NetworkConfig {
            disconnect_port: 0,
            ..NetworkConfig::loopback()
        };
        let state = Arc::new(ConnectionStateMachine::new());
        state.apply(LinkTrigger::SettingsSent);
        let sender = CommandSender::new(config, state.clone());

        assert!(sender.send_disconnect().await.is_err());
        assert_eq!(state.current(), ConnectionState::SettingsSent);
    }

    #[tokio::test]
    async fn test_settings_send_failure_drives_error() {
        let config = NetworkConfig {
            settings_port: 0,
            ..NetworkConfig::loopback()
        };
        let state = Arc::new(ConnectionStateMachine::new());
        let sender = CommandSender::new(config, state.clone());

        let result = sender.send_settings(&MotorSettings::default()).await;
        assert!(matches!(result, Err(CommandError::Io(_))));
        assert_eq!(state.current(), ConnectionState::Error);
    }
}
