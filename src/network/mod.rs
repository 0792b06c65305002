//! Network module - Handles the UDP links to the motor and training servers
//!
//! Provides:
//! - The motor link state machine
//! - One-shot command sending and the settings confirmation listener
//! - The artifact listener and chunked training upload
//! - The best-effort regression stream

mod artifacts;
mod commands;
mod confirmation;
mod connection;
mod regression;
mod uploader;

pub use artifacts::*;
pub use commands::*;
pub use confirmation::*;
pub use connection::*;
pub use regression::*;
pub use uploader::*;

use std::net::SocketAddr;
use std::time::Duration;

use crate::config::Config;
use crate::protocol::{
    ARTIFACT_PORT, CONFIRMATION_PORT, DEFAULT_CHUNK_SIZE, DISCONNECT_PORT, REGRESSION_PORT,
    SETTINGS_PORT, START_PORT, TRAINING_PORT,
};

/// Retry and timeout budget of the protocol
#[derive(Debug, Clone)]
pub struct Timings {
    /// Receive timeout of the confirmation listener
    pub confirmation_recv_timeout: Duration,
    /// Receive timeout of the artifact listener
    pub artifact_recv_timeout: Duration,
    pub header_ack_timeout: Duration,
    pub header_attempts: u32,
    pub chunk_ack_timeout: Duration,
    pub chunk_attempts: u32,
    pub chunk_size: usize,
    /// How long to wait for the trained model after the last chunk ack
    pub model_wait: Duration,
    pub model_poll_interval: Duration,
    pub regression_send_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            confirmation_recv_timeout: Duration::from_secs(5),
            artifact_recv_timeout: Duration::from_secs(2),
            header_ack_timeout: Duration::from_secs(2),
            header_attempts: 3,
            chunk_ack_timeout: Duration::from_secs(1),
            chunk_attempts: 5,
            chunk_size: DEFAULT_CHUNK_SIZE,
            model_wait: Duration::from_secs(20),
            model_poll_interval: Duration::from_millis(100),
            regression_send_timeout: Duration::from_millis(100),
        }
    }
}

/// Runtime network configuration
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Motor server host (name or IP)
    pub motor_host: String,
    /// Training server host (name or IP)
    pub training_host: String,
    /// Local interface the listeners bind to
    pub bind_address: String,
    pub settings_port: u16,
    pub start_port: u16,
    pub disconnect_port: u16,
    pub regression_port: u16,
    pub training_port: u16,
    /// Local listen port for settings confirmations
    pub confirmation_port: u16,
    /// Local listen port for trained artifacts
    pub artifact_port: u16,
    pub timings: Timings,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            motor_host: crate::config::DEFAULT_SERVER_HOST.to_string(),
            training_host: crate::config::DEFAULT_SERVER_HOST.to_string(),
            bind_address: "0.0.0.0".to_string(),
            settings_port: SETTINGS_PORT,
            start_port: START_PORT,
            disconnect_port: DISCONNECT_PORT,
            regression_port: REGRESSION_PORT,
            training_port: TRAINING_PORT,
            confirmation_port: CONFIRMATION_PORT,
            artifact_port: ARTIFACT_PORT,
            timings: Timings::default(),
        }
    }
}

impl NetworkConfig {
    /// Build the runtime form of a loaded configuration file
    pub fn from_config(config: &Config) -> Self {
        let net = &config.network;
        let timing = &config.timing;
        Self {
            motor_host: net.motor_host.clone(),
            training_host: net.training_host.clone(),
            bind_address: net.bind_address.clone(),
            settings_port: net.settings_port,
            start_port: net.start_port,
            disconnect_port: net.disconnect_port,
            regression_port: net.regression_port,
            training_port: net.training_port,
            confirmation_port: net.confirmation_port,
            artifact_port: net.artifact_port,
            timings: Timings {
                confirmation_recv_timeout: Duration::from_millis(timing.confirmation_recv_timeout_ms),
                artifact_recv_timeout: Duration::from_millis(timing.artifact_recv_timeout_ms),
                header_ack_timeout: Duration::from_millis(timing.header_ack_timeout_ms),
                header_attempts: timing.header_attempts,
                chunk_ack_timeout: Duration::from_millis(timing.chunk_ack_timeout_ms),
                chunk_attempts: timing.chunk_attempts,
                chunk_size: timing.chunk_size,
                model_wait: Duration::from_millis(timing.model_wait_ms),
                model_poll_interval: Duration::from_millis(timing.model_poll_interval_ms),
                regression_send_timeout: Duration::from_millis(timing.regression_send_timeout_ms),
            },
        }
    }

    /// Everything on 127.0.0.1 with OS-assigned listen ports
    pub fn loopback() -> Self {
        Self {
            motor_host: "127.0.0.1".to_string(),
            training_host: "127.0.0.1".to_string(),
            bind_address: "127.0.0.1".to_string(),
            confirmation_port: 0,
            artifact_port: 0,
            ..Default::default()
        }
    }

    /// Point every motor command port at one address
    pub fn with_motor_addr(mut self, addr: SocketAddr) -> Self {
        self.motor_host = addr.ip().to_string();
        self.settings_port = addr.port();
        self.start_port = addr.port();
        self.disconnect_port = addr.port();
        self.regression_port = addr.port();
        self
    }

    pub fn with_training_addr(mut self, addr: SocketAddr) -> Self {
        self.training_host = addr.ip().to_string();
        self.training_port = addr.port();
        self
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    pub fn confirmation_bind(&self) -> String {
        format!("{}:{}", self.bind_address, self.confirmation_port)
    }

    pub fn artifact_bind(&self) -> String {
        format!("{}:{}", self.bind_address, self.artifact_port)
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}

/// Unbound-port address of the same family as `peer`, for outbound sockets
pub(crate) fn ephemeral_bind_for(peer: &SocketAddr) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    }
}
