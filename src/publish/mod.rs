//! Best-effort publishing of cycle results to a message bus.
//!
//! Publishing never fails from the caller's point of view: every error is
//! logged as a warning and dropped. The CSV log is the durable record.

pub mod nats;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::storage::RawArtifact;
use crate::throughput::{CycleResult, DirectionMetrics, Protocol};

pub use nats::NatsPublisher;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("failed to publish to topic '{topic}': {reason}")]
    Publish { topic: String, reason: String },

    #[error("failed to flush connection: {0}")]
    Flush(String),

    #[error("publish timed out after {0:?}")]
    TimedOut(std::time::Duration),
}

/// Download/upload metrics pair as it appears on the bus.
#[derive(Debug, Clone, Serialize)]
pub struct ResultPair {
    pub download: DirectionMetrics,
    pub upload: DirectionMetrics,
}

/// JSON message published once per completed cycle.
#[derive(Debug, Clone, Serialize)]
pub struct BusMessage {
    pub timestamp: String,
    pub test_number: u64,
    pub protocol: Protocol,
    pub results: ResultPair,
    pub raw_download: serde_json::Value,
    pub raw_upload: serde_json::Value,
}

impl BusMessage {
    pub fn new(result: &CycleResult, raw_download: &RawArtifact, raw_upload: &RawArtifact) -> Self {
        Self {
            timestamp: result.started_at().to_rfc3339(),
            test_number: result.cycle_number(),
            protocol: result.protocol(),
            results: ResultPair {
                download: result.download().clone(),
                upload: result.upload().clone(),
            },
            raw_download: raw_download.to_json_value(),
            raw_upload: raw_upload.to_json_value(),
        }
    }
}

/// Fire-and-forget sink for cycle results.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish one message. Must not block longer than its own bounded
    /// timeout and must not surface errors.
    async fn publish(&self, message: &BusMessage);
}
