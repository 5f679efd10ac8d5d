//! Throughput measurement: iperf3 invocation, report normalization, and the
//! per-cycle result model.

pub mod iperf;
pub mod report;
pub mod runner;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StorageError;

pub use runner::{Iperf3Runner, Subtest, SubtestRunner};

/// Transport protocol used for both sub-tests of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(other.to_string()),
        }
    }
}

/// Which way the measured stream flows relative to the measuring host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Data flows toward this host (iperf3 `-R`).
    Download,
    /// Data flows away from this host.
    Upload,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Download => write!(f, "download"),
            Direction::Upload => write!(f, "upload"),
        }
    }
}

/// Normalized metrics for one direction of a cycle.
///
/// The variant is fixed by the protocol: TCP results never carry jitter or
/// loss, UDP results always do.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DirectionMetrics {
    Tcp {
        throughput_mbps: f64,
    },
    Udp {
        throughput_mbps: f64,
        jitter_ms: f64,
        lost_packets: u64,
        lost_percent: f64,
    },
}

impl DirectionMetrics {
    pub fn protocol(&self) -> Protocol {
        match self {
            DirectionMetrics::Tcp { .. } => Protocol::Tcp,
            DirectionMetrics::Udp { .. } => Protocol::Udp,
        }
    }

    pub fn throughput_mbps(&self) -> f64 {
        match self {
            DirectionMetrics::Tcp { throughput_mbps } => *throughput_mbps,
            DirectionMetrics::Udp {
                throughput_mbps, ..
            } => *throughput_mbps,
        }
    }

    /// Loss percentage, `None` for TCP.
    pub fn lost_percent(&self) -> Option<f64> {
        match self {
            DirectionMetrics::Tcp { .. } => None,
            DirectionMetrics::Udp { lost_percent, .. } => Some(*lost_percent),
        }
    }
}

/// Outcome of one complete cycle (download + upload).
///
/// Built once both sub-tests have succeeded; there are no setters.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleResult {
    cycle_number: u64,
    started_at: DateTime<Utc>,
    protocol: Protocol,
    download: DirectionMetrics,
    upload: DirectionMetrics,
}

impl CycleResult {
    /// Returns `None` when either metric set does not match `protocol`.
    pub fn new(
        cycle_number: u64,
        started_at: DateTime<Utc>,
        protocol: Protocol,
        download: DirectionMetrics,
        upload: DirectionMetrics,
    ) -> Option<Self> {
        if download.protocol() != protocol || upload.protocol() != protocol {
            return None;
        }
        Some(Self {
            cycle_number,
            started_at,
            protocol,
            download,
            upload,
        })
    }

    pub fn cycle_number(&self) -> u64 {
        self.cycle_number
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn download(&self) -> &DirectionMetrics {
        &self.download
    }

    pub fn upload(&self) -> &DirectionMetrics {
        &self.upload
    }
}

/// Failures of a single sub-test. Any of these abandons the whole cycle;
/// `Storage` additionally stops the process.
#[derive(Debug, Error)]
pub enum SubtestError {
    #[error("{direction} sub-test: iperf3 invocation failed: {reason}")]
    ToolInvocation { direction: Direction, reason: String },

    #[error("{direction} sub-test: malformed iperf3 report: {reason}")]
    MalformedReport { direction: Direction, reason: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SubtestError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SubtestError::Storage(_))
    }
}
