//! Configuration module
//!
//! Handles loading and saving ExoLink configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::protocol::{
    MotorSettings, ARTIFACT_PORT, CONFIRMATION_PORT, DEFAULT_CHUNK_SIZE, DISCONNECT_PORT,
    REGRESSION_PORT, SETTINGS_PORT, START_PORT, TRAINING_PORT,
};

/// Address of the motor and training servers unless configured otherwise
pub const DEFAULT_SERVER_HOST: &str = "10.207.176.1";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Protocol timeouts and retry budgets
    #[serde(default)]
    pub timing: TimingConfig,

    /// Settings sent to the motor on connect
    #[serde(default)]
    pub motor: MotorSettings,
}

/// General configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log filter (e.g. "info", "exolink=debug"); overridden by --verbose
    pub log_level: Option<String>,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Motor server host
    #[serde(default = "default_host")]
    pub motor_host: String,
    /// Training server host
    #[serde(default = "default_host")]
    pub training_host: String,
    /// Interface the listeners bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_settings_port")]
    pub settings_port: u16,
    #[serde(default = "default_start_port")]
    pub start_port: u16,
    #[serde(default = "default_disconnect_port")]
    pub disconnect_port: u16,
    #[serde(default = "default_regression_port")]
    pub regression_port: u16,
    #[serde(default = "default_training_port")]
    pub training_port: u16,
    #[serde(default = "default_confirmation_port")]
    pub confirmation_port: u16,
    #[serde(default = "default_artifact_port")]
    pub artifact_port: u16,
}

fn default_host() -> String {
    DEFAULT_SERVER_HOST.to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_settings_port() -> u16 {
    SETTINGS_PORT
}

fn default_start_port() -> u16 {
    START_PORT
}

fn default_disconnect_port() -> u16 {
    DISCONNECT_PORT
}

fn default_regression_port() -> u16 {
    REGRESSION_PORT
}

fn default_training_port() -> u16 {
    TRAINING_PORT
}

fn default_confirmation_port() -> u16 {
    CONFIRMATION_PORT
}

fn default_artifact_port() -> u16 {
    ARTIFACT_PORT
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            motor_host: default_host(),
            training_host: default_host(),
            bind_address: default_bind_address(),
            settings_port: default_settings_port(),
            start_port: default_start_port(),
            disconnect_port: default_disconnect_port(),
            regression_port: default_regression_port(),
            training_port: default_training_port(),
            confirmation_port: default_confirmation_port(),
            artifact_port: default_artifact_port(),
        }
    }
}

/// Timeouts (ms) and retry budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub confirmation_recv_timeout_ms: u64,
    pub artifact_recv_timeout_ms: u64,
    pub header_ack_timeout_ms: u64,
    pub header_attempts: u32,
    pub chunk_ack_timeout_ms: u64,
    pub chunk_attempts: u32,
    /// Payload bytes per training chunk
    pub chunk_size: usize,
    pub model_wait_ms: u64,
    pub model_poll_interval_ms: u64,
    pub regression_send_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            confirmation_recv_timeout_ms: 5000,
            artifact_recv_timeout_ms: 2000,
            header_ack_timeout_ms: 2000,
            header_attempts: 3,
            chunk_ack_timeout_ms: 1000,
            chunk_attempts: 5,
            chunk_size: DEFAULT_CHUNK_SIZE,
            model_wait_ms: 20_000,
            model_poll_interval_ms: 100,
            regression_send_timeout_ms: 100,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("exolink/config.toml")),
            Some(PathBuf::from("./exolink.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            log_level: Some("info".to_string()),
        },
        network: NetworkConfig {
            motor_host: "192.168.1.16".to_string(),
            training_host: "192.168.1.20".to_string(),
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.settings_port, SETTINGS_PORT);
        assert_eq!(config.network.artifact_port, ARTIFACT_PORT);
        assert_eq!(config.timing.chunk_attempts, 5);
        assert_eq!(config.motor, MotorSettings::default());
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.motor.position_kp = 10.0;
        config.timing.model_wait_ms = 5000;
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.motor.position_kp, 10.0);
        assert_eq!(loaded.timing.model_wait_ms, 5000);
        assert_eq!(loaded.network.training_port, config.network.training_port);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [network]
            motor_host = "127.0.0.1"

            [timing]
            chunk_size = 512
            "#,
        )
        .unwrap();
        assert_eq!(parsed.network.motor_host, "127.0.0.1");
        assert_eq!(parsed.network.training_host, DEFAULT_SERVER_HOST);
        assert_eq!(parsed.timing.chunk_size, 512);
        assert_eq!(parsed.timing.header_attempts, 3);
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.network.motor_host, "192.168.1.16");
        assert!(parsed.motor.validate().is_ok());
    }

    #[test]
    fn test_missing_file() {
        let result = Config::load(Path::new("/nonexistent/exolink.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }
}
