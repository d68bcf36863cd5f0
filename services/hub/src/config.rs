//! Configuration management for the image hub.
//!
//! Settings are loaded once at startup from configuration files and
//! environment variables, validated, and then handed by ownership to the
//! components that need them. Nothing mutates them afterwards.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the hub.
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Core hub settings (required section)
    pub hub: HubSettings,

    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Writer thread configuration
    #[serde(default)]
    pub writer: WriterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Core settings for queueing, partition caps and liveness.
#[derive(Debug, Clone, Deserialize)]
pub struct HubSettings {
    /// Maximum number of write jobs held in memory
    #[serde(default = "default_queuemax")]
    pub queuemax: usize,

    /// Maximum number of images written to a single date partition
    #[serde(default = "default_max_images_write")]
    pub max_images_write: u64,

    /// Seconds of silence tolerated before a liveness timeout is logged
    #[serde(default = "default_patience")]
    pub patience: u64,

    /// Base data directory, relative to `userdir` unless absolute
    #[serde(default = "default_data_directory")]
    pub data_directory: PathBuf,

    /// Home/user directory root (defaults to $HOME)
    #[serde(default)]
    pub userdir: Option<PathBuf>,

    /// Event log file name under `<data_directory>/logs`
    #[serde(default = "default_logfile")]
    pub logfile: String,

    /// Log the resolved settings at startup
    #[serde(default)]
    pub print_settings: bool,
}

/// Request/reply transport configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// Address the hub listens on for node connections
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Largest single frame accepted from a node, in bytes
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

/// Writer thread configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WriterConfig {
    /// Sleep between polls of an empty queue, in microseconds
    #[serde(default = "default_idle_poll_micros")]
    pub idle_poll_micros: u64,

    /// Time the writer is given to drain on its own at shutdown
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_queuemax() -> usize {
    500
}
fn default_max_images_write() -> u64 {
    5000
}
fn default_patience() -> u64 {
    10
}
fn default_data_directory() -> PathBuf {
    PathBuf::from("imagehub_data")
}
fn default_logfile() -> String {
    "imagehub.log".to_string()
}
fn default_bind_address() -> String {
    "0.0.0.0:5555".to_string()
}
fn default_max_frame_bytes() -> usize {
    16 * 1024 * 1024
}
fn default_idle_poll_micros() -> u64 {
    500
}
fn default_shutdown_grace_secs() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            queuemax: default_queuemax(),
            max_images_write: default_max_images_write(),
            patience: default_patience(),
            data_directory: default_data_directory(),
            userdir: None,
            logfile: default_logfile(),
            print_settings: false,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            idle_poll_micros: default_idle_poll_micros(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl HubConfig {
    /// Load configuration from files and environment variables.
    ///
    /// Sources, later overriding earlier:
    /// 1. `~/imagehub.yaml`
    /// 2. `config/imagehub` (any format the `config` crate understands)
    /// 3. Environment variables prefixed with `IMAGEHUB` (e.g. `IMAGEHUB__HUB__QUEUEMAX`)
    ///
    /// The `hub` section is required; deserialization fails without it.
    pub fn load() -> Result<Self, ConfigError> {
        let home_file = home_dir().join("imagehub.yaml");

        let config = Config::builder()
            .add_source(File::from(home_file).required(false))
            .add_source(File::with_name("config/imagehub").required(false))
            .add_source(
                Environment::with_prefix("IMAGEHUB")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a single explicit file plus the environment.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::from(path.to_path_buf()))
            .add_source(
                Environment::with_prefix("IMAGEHUB")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.hub.queuemax == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "hub.queuemax".to_string(),
                message: "Queue capacity must be greater than 0".to_string(),
            });
        }

        if self.hub.max_images_write == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "hub.max_images_write".to_string(),
                message: "Partition cap must be greater than 0".to_string(),
            });
        }

        if self.hub.patience == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "hub.patience".to_string(),
                message: "Patience must be greater than 0".to_string(),
            });
        }

        if self.hub.data_directory.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "hub.data_directory".to_string(),
            ));
        }

        if self.hub.logfile.is_empty() {
            return Err(ConfigValidationError::MissingField("hub.logfile".to_string()));
        }

        if self.transport.bind_address.parse::<SocketAddr>().is_err() {
            return Err(ConfigValidationError::InvalidValue {
                field: "transport.bind_address".to_string(),
                message: format!("Not a socket address: {}", self.transport.bind_address),
            });
        }

        if self.transport.max_frame_bytes == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "transport.max_frame_bytes".to_string(),
                message: "Frame limit must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

impl HubSettings {
    /// Get patience as Duration.
    pub fn patience(&self) -> Duration {
        Duration::from_secs(self.patience)
    }

    /// Resolve the user directory root.
    pub fn user_directory(&self) -> PathBuf {
        self.userdir.clone().unwrap_or_else(home_dir)
    }

    /// Resolve the base data directory against the user directory.
    pub fn data_root(&self) -> PathBuf {
        if self.data_directory.is_absolute() {
            self.data_directory.clone()
        } else {
            self.user_directory().join(&self.data_directory)
        }
    }
}

impl WriterConfig {
    /// Get idle poll interval as Duration.
    pub fn idle_poll(&self) -> Duration {
        Duration::from_micros(self.idle_poll_micros)
    }

    /// Get shutdown grace period as Duration.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn create_test_config() -> HubConfig {
        HubConfig {
            hub: HubSettings {
                userdir: Some(PathBuf::from("/home/pi")),
                ..HubSettings::default()
            },
            transport: TransportConfig::default(),
            writer: WriterConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = create_test_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_values() {
        let settings = HubSettings::default();
        assert_eq!(settings.queuemax, 500);
        assert_eq!(settings.max_images_write, 5000);
        assert_eq!(settings.patience, 10);
        assert_eq!(settings.data_directory, PathBuf::from("imagehub_data"));
    }

    #[test]
    fn test_zero_queuemax_rejected() {
        let mut config = create_test_config();
        config.hub.queuemax = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_zero_patience_rejected() {
        let mut config = create_test_config();
        config.hub.patience = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_empty_data_directory_rejected() {
        let mut config = create_test_config();
        config.hub.data_directory = PathBuf::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_invalid_bind_address() {
        let mut config = create_test_config();
        config.transport.bind_address = "not-an-address".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_data_root_relative_to_userdir() {
        let config = create_test_config();
        assert_eq!(
            config.hub.data_root(),
            PathBuf::from("/home/pi/imagehub_data")
        );
    }

    #[test]
    fn test_data_root_absolute() {
        let mut config = create_test_config();
        config.hub.data_directory = PathBuf::from("/srv/imagehub");
        assert_eq!(config.hub.data_root(), PathBuf::from("/srv/imagehub"));
    }

    #[test]
    fn test_from_file_with_hub_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("imagehub.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "hub:\n  queuemax: 42\n  patience: 3").unwrap();

        let config = HubConfig::from_file(&path).unwrap();
        assert_eq!(config.hub.queuemax, 42);
        assert_eq!(config.hub.patience, 3);
        assert_eq!(config.hub.max_images_write, 5000);
        assert_eq!(config.transport.bind_address, "0.0.0.0:5555");
    }

    #[test]
    fn test_from_file_missing_hub_section_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("imagehub.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "logging:\n  level: debug").unwrap();

        assert!(HubConfig::from_file(&path).is_err());
    }
}
