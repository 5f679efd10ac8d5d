//! Raw iperf3 reports kept on disk for audit and replay.

use std::path::PathBuf;

use tracing::{debug, warn};

use super::StorageError;
use crate::throughput::Direction;

/// Unparsed stdout of one sub-test.
#[derive(Debug, Clone, PartialEq)]
pub struct RawArtifact {
    pub cycle: u64,
    pub direction: Direction,
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

impl RawArtifact {
    /// The report as JSON, or as a plain string if it does not parse.
    pub fn to_json_value(&self) -> serde_json::Value {
        serde_json::from_slice(&self.bytes).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&self.bytes).into_owned())
        })
    }
}

/// Writes `raw_<direction>_<cycle:03>.json` files into the output directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, cycle: u64, direction: Direction) -> PathBuf {
        self.dir.join(format!("raw_{direction}_{cycle:03}.json"))
    }

    /// Persist the captured output exactly as received.
    pub async fn write(
        &self,
        cycle: u64,
        direction: Direction,
        bytes: &[u8],
    ) -> Result<RawArtifact, StorageError> {
        let path = self.path_for(cycle, direction);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            // Cycle numbering restarts with the process.
            warn!(path = %path.display(), "overwriting raw report from an earlier run");
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|source| StorageError::Artifact {
                path: path.clone(),
                source,
            })?;
        debug!(cycle, %direction, path = %path.display(), bytes = bytes.len(), "saved raw report");
        Ok(RawArtifact {
            cycle,
            direction,
            path,
            bytes: bytes.to_vec(),
        })
    }
}
