//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via STREAMKINECT_CONFIG)
//! 3. Environment variables

use crate::server::ServerConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use streamkinect_core::{DeviceConfig, PipelineConfig, SimulatedSourceConfig, MAX_IN_FLIGHT_LIMIT};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Control server and discovery settings.
    pub server: ServerSection,
    /// Compression pipeline settings.
    pub pipeline: PipelineSection,
    /// Device selection.
    pub device: DeviceSection,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("STREAMKINECT_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.server.apply_env_overrides();
        self.pipeline.apply_env_overrides();
        self.device.apply_env_overrides();
    }

    /// Checks that every setting is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(name) = &self.server.name {
            if name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "server.name must not be empty".to_string(),
                ));
            }
        }
        if self.pipeline.max_in_flight == 0 {
            return Err(ConfigError::ValidationError(
                "pipeline.max_in_flight must be at least 1".to_string(),
            ));
        }
        if self.pipeline.max_in_flight > MAX_IN_FLIGHT_LIMIT {
            return Err(ConfigError::ValidationError(format!(
                "pipeline.max_in_flight must be at most {}",
                MAX_IN_FLIGHT_LIMIT
            )));
        }
        if self.device.simulated {
            if self.device.width == 0 || self.device.height == 0 {
                return Err(ConfigError::ValidationError(
                    "device.width and device.height must be non-zero".to_string(),
                ));
            }
            if self.device.fps == 0 {
                return Err(ConfigError::ValidationError(
                    "device.fps must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Builds the server configuration.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            name: self.server.name.clone(),
            control_bind: self.server.bind_addr,
            discovery_timeout: self.server.discovery_timeout(),
            pipeline: self.pipeline_config(),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig::default()
            .with_max_in_flight(self.pipeline.max_in_flight)
            .with_dispose_timeout(Duration::from_millis(self.pipeline.dispose_timeout_ms))
    }

    pub fn device_config(&self) -> DeviceConfig {
        DeviceConfig {
            simulated: self.device.simulated,
            simulated_source: SimulatedSourceConfig {
                width: self.device.width,
                height: self.device.height,
                fps: self.device.fps,
            },
        }
    }
}

/// Control server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Advertised instance name (default "Kinect stream on <host>").
    pub name: Option<String>,
    /// Control socket bind address.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Discovery timeout in seconds (0 disables).
    pub discovery_timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            name: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            discovery_timeout_secs: 10,
        }
    }
}

impl ServerSection {
    fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("STREAMKINECT_NAME") {
            self.name = Some(name);
        }

        if let Ok(addr) = std::env::var("STREAMKINECT_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(timeout) = std::env::var("STREAMKINECT_DISCOVERY_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.discovery_timeout_secs = secs;
            }
        }
    }

    /// Returns the discovery timeout, or `None` when disabled.
    pub fn discovery_timeout(&self) -> Option<Duration> {
        match self.discovery_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Compression pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    /// Maximum concurrent compressions per device.
    pub max_in_flight: usize,
    /// How long stopping a device waits for compressions, in milliseconds.
    pub dispose_timeout_ms: u64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_in_flight: 1,
            dispose_timeout_ms: 500,
        }
    }
}

impl PipelineSection {
    fn apply_env_overrides(&mut self) {
        if let Ok(max) = std::env::var("STREAMKINECT_MAX_IN_FLIGHT") {
            if let Ok(n) = max.parse() {
                self.max_in_flight = n;
            }
        }

        if let Ok(timeout) = std::env::var("STREAMKINECT_DISPOSE_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.dispose_timeout_ms = ms;
            }
        }
    }
}

/// Device configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSection {
    /// Serve the simulated device.
    pub simulated: bool,
    /// Simulated frame width.
    pub width: u16,
    /// Simulated frame height.
    pub height: u16,
    /// Simulated frame rate.
    pub fps: u32,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            simulated: true,
            width: 1920,
            height: 1080,
            fps: 60,
        }
    }
}

impl DeviceSection {
    fn apply_env_overrides(&mut self) {
        if let Ok(simulated) = std::env::var("STREAMKINECT_SIMULATED") {
            self.simulated = simulated == "1" || simulated.to_lowercase() == "true";
        }

        if let Ok(width) = std::env::var("STREAMKINECT_SIM_WIDTH") {
            if let Ok(n) = width.parse() {
                self.width = n;
            }
        }

        if let Ok(height) = std::env::var("STREAMKINECT_SIM_HEIGHT") {
            if let Ok(n) = height.parse() {
                self.height = n;
            }
        }

        if let Ok(fps) = std::env::var("STREAMKINECT_SIM_FPS") {
            if let Ok(n) = fps.parse() {
                self.fps = n;
            }
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
