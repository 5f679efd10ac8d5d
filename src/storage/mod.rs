//! Durable storage -- the append-only CSV results log and raw iperf3 reports.

pub mod artifact;
pub mod csv_log;
pub mod schema;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone};
use thiserror::Error;

use crate::throughput::{CycleResult, Protocol};

pub use artifact::{ArtifactStore, RawArtifact};
pub use csv_log::CsvRecorder;

/// Storage failures. Always fatal: measuring without durable output is
/// pointless.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to create output directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write raw report {}: {source}", .path.display())]
    Artifact {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to append to results log {}: {source}", .path.display())]
    Append {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to encode results row: {0}")]
    Encode(#[from] csv::Error),

    #[error("results log {} holds {expected} rows, got a {found} result", .path.display())]
    SchemaMismatch {
        path: PathBuf,
        expected: Protocol,
        found: Protocol,
    },
}

/// Sink for completed cycles.
#[async_trait]
pub trait Recorder: Send {
    /// Append one cycle. Either the whole row lands or an error is returned.
    async fn append(&mut self, result: &CycleResult) -> Result<(), StorageError>;
}

/// `results_<protocol>_<YYYYmmdd_HHMMSS>.csv`
pub fn log_file_name<Tz>(protocol: Protocol, created: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!("results_{}_{}.csv", protocol, created.format("%Y%m%d_%H%M%S"))
}

/// Create the output directory (and parents) if needed.
pub async fn ensure_output_dir(dir: &Path) -> Result<(), StorageError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| StorageError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })
}
