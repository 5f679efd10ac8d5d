//! Process configuration.
//!
//! Values come from three layers, highest precedence first: command-line
//! flags / environment variables, an optional TOML file, and compiled-in
//! defaults. [`RawConfig::resolve`] validates the merged layers into an
//! immutable [`Settings`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::throughput::iperf::TestParams;
use crate::throughput::Protocol;

pub const DEFAULT_PORT: u16 = 5201;
pub const DEFAULT_DURATION_SECS: u32 = 5;
pub const DEFAULT_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_BANDWIDTH: &str = "100M";
pub const DEFAULT_OUTPUT_DIR: &str = "/data";
pub const DEFAULT_TOPIC: &str = "speedtest";
pub const DEFAULT_IPERF3_PATH: &str = "iperf3";
pub const DEFAULT_PUBLISH_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("MODE must be 'client' or 'server', got: {0}")]
    InvalidRole(String),

    #[error("PROTOCOL must be 'tcp' or 'udp', got: {0}")]
    InvalidProtocol(String),

    #[error("SERVER_IP is required in client mode")]
    MissingTarget,

    #[error("invalid SERVER_IP '{target}': {reason}")]
    InvalidTarget { target: String, reason: &'static str },

    #[error("BANDWIDTH must be a number with an optional K/M/G suffix, got: {0}")]
    InvalidBandwidth(String),

    #[error("DURATION must be at least 1 second")]
    InvalidDuration,

    #[error("CYCLES must be at least 1 when set")]
    InvalidCycles,

    #[error("NATS_TOPIC must not be empty")]
    EmptyTopic,

    #[error("failed to read config file {}: {source}", .path.display())]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", .path.display())]
    ParseFile {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Process role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl std::str::FromStr for Role {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "client" => Ok(Role::Client),
            "server" => Ok(Role::Server),
            other => Err(ConfigError::InvalidRole(other.to_string())),
        }
    }
}

/// One unvalidated configuration layer. Every field is optional so layers
/// can be merged before defaults are applied.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawConfig {
    pub mode: Option<String>,
    pub server_ip: Option<String>,
    pub port: Option<u16>,
    pub duration: Option<u32>,
    pub interval: Option<u64>,
    pub output_dir: Option<PathBuf>,
    pub protocol: Option<String>,
    pub bandwidth: Option<String>,
    pub bind_interface: Option<String>,
    pub nats_url: Option<String>,
    pub nats_topic: Option<String>,
    pub iperf3_path: Option<String>,
    pub cycles: Option<u64>,
    pub publish_timeout: Option<u64>,
}

/// Message bus settings; present only when publishing is enabled.
#[derive(Debug, Clone, PartialEq)]
pub struct BusSettings {
    pub url: String,
    pub topic: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub test: TestParams,
    pub interval: Duration,
    pub output_dir: PathBuf,
    pub iperf3_path: String,
    pub bus: Option<BusSettings>,
    /// Stop after this many cycles; run forever when `None`.
    pub max_cycles: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerSettings {
    pub port: u16,
    pub bind_interface: Option<String>,
    pub iperf3_path: String,
}

/// Validated configuration, fixed for the lifetime of the process.
#[derive(Debug, Clone, PartialEq)]
pub enum Settings {
    Client(ClientSettings),
    Server(ServerSettings),
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Targets end up as a child-process argument; keep them to host/IP characters.
fn validate_target(target: &str) -> Result<(), ConfigError> {
    let invalid = |reason| ConfigError::InvalidTarget {
        target: target.to_string(),
        reason,
    };
    if target.starts_with('-') {
        return Err(invalid("must not start with '-'"));
    }
    if target
        .chars()
        .any(|c| !c.is_alphanumeric() && c != '.' && c != '-' && c != ':')
    {
        return Err(invalid("only letters, digits, '.', '-' and ':' are allowed"));
    }
    Ok(())
}

fn validate_bandwidth(bandwidth: &str) -> Result<(), ConfigError> {
    let digits = bandwidth.trim_end_matches(['k', 'K', 'm', 'M', 'g', 'G']);
    let suffix_len = bandwidth.len() - digits.len();
    if digits.is_empty() || suffix_len > 1 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ConfigError::InvalidBandwidth(bandwidth.to_string()));
    }
    Ok(())
}

impl RawConfig {
    /// Load a TOML layer from disk.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::ParseFile {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "loaded configuration file");
        Ok(config)
    }

    /// Fill every field unset in `self` from `lower`.
    pub fn layered_over(self, lower: RawConfig) -> RawConfig {
        RawConfig {
            mode: self.mode.or(lower.mode),
            server_ip: self.server_ip.or(lower.server_ip),
            port: self.port.or(lower.port),
            duration: self.duration.or(lower.duration),
            interval: self.interval.or(lower.interval),
            output_dir: self.output_dir.or(lower.output_dir),
            protocol: self.protocol.or(lower.protocol),
            bandwidth: self.bandwidth.or(lower.bandwidth),
            bind_interface: self.bind_interface.or(lower.bind_interface),
            nats_url: self.nats_url.or(lower.nats_url),
            nats_topic: self.nats_topic.or(lower.nats_topic),
            iperf3_path: self.iperf3_path.or(lower.iperf3_path),
            cycles: self.cycles.or(lower.cycles),
            publish_timeout: self.publish_timeout.or(lower.publish_timeout),
        }
    }

    /// Apply defaults and validate.
    pub fn resolve(self) -> Result<Settings, ConfigError> {
        let role: Role = self.mode.as_deref().unwrap_or("client").parse()?;
        let port = self.port.unwrap_or(DEFAULT_PORT);
        let bind_interface = non_empty(self.bind_interface);
        let iperf3_path =
            non_empty(self.iperf3_path).unwrap_or_else(|| DEFAULT_IPERF3_PATH.to_string());

        if role == Role::Server {
            return Ok(Settings::Server(ServerSettings {
                port,
                bind_interface,
                iperf3_path,
            }));
        }

        let target = non_empty(self.server_ip)
            .map(|t| t.trim().to_string())
            .ok_or(ConfigError::MissingTarget)?;
        validate_target(&target)?;

        let protocol = match self.protocol.as_deref() {
            None => Protocol::Tcp,
            Some(p) => p.parse().map_err(ConfigError::InvalidProtocol)?,
        };

        let bandwidth = self
            .bandwidth
            .map(|b| b.trim().to_string())
            .unwrap_or_else(|| DEFAULT_BANDWIDTH.to_string());
        validate_bandwidth(&bandwidth)?;

        let duration_secs = self.duration.unwrap_or(DEFAULT_DURATION_SECS);
        if duration_secs == 0 {
            return Err(ConfigError::InvalidDuration);
        }

        if self.cycles == Some(0) {
            return Err(ConfigError::InvalidCycles);
        }

        let bus = match non_empty(self.nats_url) {
            Some(url) => {
                let topic = self.nats_topic.unwrap_or_else(|| DEFAULT_TOPIC.to_string());
                if topic.trim().is_empty() {
                    return Err(ConfigError::EmptyTopic);
                }
                Some(BusSettings {
                    url,
                    topic,
                    timeout: Duration::from_secs(
                        self.publish_timeout.unwrap_or(DEFAULT_PUBLISH_TIMEOUT_SECS),
                    ),
                })
            }
            None => None,
        };

        Ok(Settings::Client(ClientSettings {
            test: TestParams {
                target,
                port,
                duration_secs,
                protocol,
                bandwidth,
                bind_interface,
            },
            interval: Duration::from_secs(self.interval.unwrap_or(DEFAULT_INTERVAL_SECS)),
            output_dir: self
                .output_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            iperf3_path,
            bus,
            max_cycles: self.cycles,
        }))
    }
}
