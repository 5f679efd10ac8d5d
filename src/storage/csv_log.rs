//! Append-only CSV results log.
//!
//! One file per process lifetime. The schema is picked from the protocol
//! when the recorder is created, and the header row is written together
//! with the first row if the file did not exist yet. Each append goes out
//! as a single buffered write followed by `sync_data`, so a crash never
//! leaves half a row behind from this process.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::{schema, Recorder, StorageError};
use crate::throughput::report::format_summary;
use crate::throughput::{CycleResult, Protocol};

/// CSV-backed [`Recorder`].
pub struct CsvRecorder {
    path: PathBuf,
    protocol: Protocol,
    file: Option<File>,
}

impl CsvRecorder {
    /// Recorder for `path`. Nothing is touched on disk until the first append.
    pub fn new(path: impl Into<PathBuf>, protocol: Protocol) -> Self {
        Self {
            path: path.into(),
            protocol,
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode(&self, result: &CycleResult, with_header: bool) -> Result<Vec<u8>, StorageError> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        if with_header {
            writer.write_record(schema::header(self.protocol))?;
        }
        writer.write_record(schema::row(result))?;
        writer.into_inner().map_err(|e| StorageError::Append {
            path: self.path.clone(),
            source: e.into_error(),
        })
    }

    fn append_error(&self, source: std::io::Error) -> StorageError {
        StorageError::Append {
            path: self.path.clone(),
            source,
        }
    }

    async fn open(&self) -> Result<File, StorageError> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.append_error(e))
    }
}

#[async_trait]
impl Recorder for CsvRecorder {
    async fn append(&mut self, result: &CycleResult) -> Result<(), StorageError> {
        if result.protocol() != self.protocol {
            return Err(StorageError::SchemaMismatch {
                path: self.path.clone(),
                expected: self.protocol,
                found: result.protocol(),
            });
        }

        let with_header = match self.file {
            Some(_) => false,
            None => !tokio::fs::try_exists(&self.path)
                .await
                .map_err(|e| self.append_error(e))?,
        };
        let buf = self.encode(result, with_header)?;

        let mut file = match self.file.take() {
            Some(file) => file,
            None => self.open().await?,
        };
        let written: std::io::Result<()> = async {
            file.write_all(&buf).await?;
            file.flush().await?;
            file.sync_data().await
        }
        .await;
        self.file = Some(file);
        written.map_err(|e| self.append_error(e))?;

        if with_header {
            info!(path = %self.path.display(), protocol = %self.protocol, "created results log");
        }
        debug!(cycle = result.cycle_number(), bytes = buf.len(), "appended results row");
        println!("{}", format_summary(result));
        Ok(())
    }
}
