//! Sub-test runner: one iperf3 client invocation per direction.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::iperf::{self, TestParams};
use super::{Direction, DirectionMetrics, SubtestError};
use crate::storage::{ArtifactStore, RawArtifact};

/// A successfully normalized sub-test together with its raw report.
#[derive(Debug, Clone)]
pub struct Subtest {
    pub metrics: DirectionMetrics,
    pub artifact: RawArtifact,
}

/// Runs a single sub-test for one direction of a cycle.
#[async_trait]
pub trait SubtestRunner: Send + Sync {
    async fn run_direction(
        &self,
        cycle: u64,
        direction: Direction,
    ) -> Result<Subtest, SubtestError>;
}

/// [`SubtestRunner`] backed by the real `iperf3` binary.
pub struct Iperf3Runner {
    iperf3_path: String,
    params: TestParams,
    artifacts: ArtifactStore,
}

impl Iperf3Runner {
    pub fn new(
        iperf3_path: impl Into<String>,
        params: TestParams,
        artifacts: ArtifactStore,
    ) -> Self {
        Self {
            iperf3_path: iperf3_path.into(),
            params,
            artifacts,
        }
    }
}

fn stderr_excerpt(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        "no stderr output".to_string()
    } else {
        trimmed.lines().last().unwrap_or(trimmed).to_string()
    }
}

#[async_trait]
impl SubtestRunner for Iperf3Runner {
    async fn run_direction(
        &self,
        cycle: u64,
        direction: Direction,
    ) -> Result<Subtest, SubtestError> {
        let args = iperf::client_args(&self.params, direction);
        info!(cycle, %direction, server = %self.params.target, "running {} test", direction);
        debug!(iperf3 = %self.iperf3_path, ?args, "spawning iperf3");

        let output = Command::new(&self.iperf3_path)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SubtestError::ToolInvocation {
                direction,
                reason: format!("failed to start '{}': {}", self.iperf3_path, e),
            })?;

        // Capture first so a bad report still leaves evidence on disk.
        let artifact = self
            .artifacts
            .write(cycle, direction, &output.stdout)
            .await?;

        let text = String::from_utf8_lossy(&artifact.bytes);
        let report = match iperf::parse_report(&text) {
            Ok(report) => report,
            Err(e) if !output.status.success() => {
                return Err(SubtestError::ToolInvocation {
                    direction,
                    reason: format!(
                        "iperf3 {} without a usable report ({}): {}",
                        output.status,
                        e,
                        stderr_excerpt(&output.stderr)
                    ),
                });
            }
            Err(e) => {
                return Err(SubtestError::MalformedReport {
                    direction,
                    reason: e.to_string(),
                });
            }
        };

        if let Some(message) = report.error.as_deref() {
            return Err(SubtestError::ToolInvocation {
                direction,
                reason: format!("iperf3 reported: {message}"),
            });
        }

        let metrics = iperf::normalize(direction, self.params.protocol, &report)?;
        debug!(cycle, %direction, mbps = metrics.throughput_mbps(), "sub-test normalized");
        Ok(Subtest { metrics, artifact })
    }
}
