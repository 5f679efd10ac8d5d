//! Measurement cycle state machine.
//!
//! ```text
//! Idle -> RunningDownload -> Settling -> RunningUpload -> Recording
//!      -> Publishing -> Sleeping -> RunningDownload ...
//! ```
//!
//! A failed or unparseable sub-test abandons the cycle and jumps straight to
//! `Sleeping`; the next cycle is the retry. Storage failures end the loop.
//! The interval is measured from cycle start, so a slow cycle shortens the
//! following sleep instead of shifting the whole cadence.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::clock::Clock;
use crate::publish::{BusMessage, Publisher};
use crate::storage::{Recorder, StorageError};
use crate::throughput::{CycleResult, Direction, Protocol, Subtest, SubtestError, SubtestRunner};

/// Pause between the download and upload sub-tests.
pub const SETTLE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    RunningDownload,
    Settling,
    RunningUpload,
    Recording,
    Publishing,
    Sleeping,
}

/// What happened to a single cycle.
#[derive(Debug)]
pub enum CycleOutcome {
    Completed(CycleResult),
    /// A sub-test failed; nothing was recorded for this cycle.
    Abandoned { cycle: u64, error: SubtestError },
}

/// Drives cycles back to back on a fixed cadence.
pub struct Orchestrator {
    protocol: Protocol,
    interval: Duration,
    runner: Box<dyn SubtestRunner>,
    recorder: Box<dyn Recorder>,
    publisher: Option<Box<dyn Publisher>>,
    clock: Arc<dyn Clock>,
    cycle: u64,
    cycle_started: Option<Instant>,
    phase: Phase,
}

impl Orchestrator {
    pub fn new(
        protocol: Protocol,
        interval: Duration,
        runner: Box<dyn SubtestRunner>,
        recorder: Box<dyn Recorder>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            protocol,
            interval,
            runner,
            recorder,
            publisher: None,
            clock,
            cycle: 0,
            cycle_started: None,
            phase: Phase::Idle,
        }
    }

    pub fn with_publisher(mut self, publisher: Box<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Number of the most recently started cycle (0 before the first).
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    fn enter(&mut self, phase: Phase) {
        debug!(cycle = self.cycle, from = ?self.phase, to = ?phase, "phase transition");
        self.phase = phase;
    }

    /// Classify a sub-test failure: storage is fatal, everything else
    /// abandons the cycle.
    fn abandon(&mut self, error: SubtestError) -> Result<CycleOutcome, StorageError> {
        let cycle = self.cycle;
        match error {
            SubtestError::Storage(e) => {
                error!(cycle, error = %e, "cannot persist raw report; stopping");
                Err(e)
            }
            error => {
                warn!(cycle, error = %error, "cycle abandoned; retrying next cycle");
                self.enter(Phase::Sleeping);
                Ok(CycleOutcome::Abandoned { cycle, error })
            }
        }
    }

    async fn run_subtest(&mut self, direction: Direction) -> Result<Subtest, SubtestError> {
        self.enter(match direction {
            Direction::Download => Phase::RunningDownload,
            Direction::Upload => Phase::RunningUpload,
        });
        self.runner.run_direction(self.cycle, direction).await
    }

    /// Run one full cycle. Only storage failures are returned as errors.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, StorageError> {
        self.cycle += 1;
        let cycle = self.cycle;
        let started_at = self.clock.now();
        self.cycle_started = Some(self.clock.instant());
        info!(cycle, protocol = %self.protocol, "starting measurement cycle");

        let download = match self.run_subtest(Direction::Download).await {
            Ok(subtest) => subtest,
            Err(e) => return self.abandon(e),
        };

        self.enter(Phase::Settling);
        self.clock.sleep(SETTLE_DELAY).await;

        let upload = match self.run_subtest(Direction::Upload).await {
            Ok(subtest) => subtest,
            Err(e) => return self.abandon(e),
        };

        let Some(result) = CycleResult::new(
            cycle,
            started_at,
            self.protocol,
            download.metrics.clone(),
            upload.metrics.clone(),
        ) else {
            return self.abandon(SubtestError::MalformedReport {
                direction: Direction::Upload,
                reason: format!("sub-test results do not match protocol {}", self.protocol),
            });
        };

        self.enter(Phase::Recording);
        if let Err(e) = self.recorder.append(&result).await {
            error!(cycle, error = %e, "failed to record cycle; stopping");
            return Err(e);
        }

        self.enter(Phase::Publishing);
        if let Some(publisher) = &self.publisher {
            let message = BusMessage::new(&result, &download.artifact, &upload.artifact);
            publisher.publish(&message).await;
        }

        self.enter(Phase::Sleeping);
        Ok(CycleOutcome::Completed(result))
    }

    /// Wait out the rest of the interval, counted from the cycle start.
    async fn sleep_until_next_cycle(&self) {
        let elapsed = self
            .cycle_started
            .map(|start| self.clock.instant().saturating_duration_since(start))
            .unwrap_or(Duration::ZERO);

        match self.interval.checked_sub(elapsed) {
            Some(remaining) if !remaining.is_zero() => {
                debug!(cycle = self.cycle, ?remaining, "sleeping until next cycle");
                self.clock.sleep(remaining).await;
            }
            _ => {
                if !self.interval.is_zero() {
                    warn!(
                        cycle = self.cycle,
                        ?elapsed,
                        interval = ?self.interval,
                        "cycle overran interval; starting next cycle immediately"
                    );
                }
            }
        }
    }

    /// Run cycles until `limit` cycles have run (forever with `None`).
    ///
    /// Returns only on a storage failure or when the limit is reached.
    pub async fn run(&mut self, limit: Option<u64>) -> Result<(), StorageError> {
        loop {
            match self.run_cycle().await? {
                CycleOutcome::Completed(result) => {
                    debug!(cycle = result.cycle_number(), "cycle completed");
                }
                CycleOutcome::Abandoned { cycle, error } => {
                    debug!(cycle, error = %error, "cycle produced no row");
                }
            }

            if limit.is_some_and(|max| self.cycle >= max) {
                info!(cycles = self.cycle, "cycle limit reached");
                self.enter(Phase::Idle);
                return Ok(());
            }

            self.sleep_until_next_cycle().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::clock::ManualClock;
    use crate::storage::RawArtifact;
    use crate::throughput::DirectionMetrics;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Mutex;

    type Scripted = Result<DirectionMetrics, &'static str>;

    /// Runner that replays scripted outcomes and spends virtual time.
    struct ScriptedRunner {
        clock: Arc<ManualClock>,
        cost: Duration,
        wall_step: chrono::Duration,
        script: Mutex<VecDeque<Scripted>>,
        calls: Arc<Mutex<Vec<(u64, Direction)>>>,
    }

    #[async_trait]
    impl SubtestRunner for ScriptedRunner {
        async fn run_direction(
            &self,
            cycle: u64,
            direction: Direction,
        ) -> Result<Subtest, SubtestError> {
            self.calls.lock().unwrap().push((cycle, direction));
            self.clock.advance(self.cost);
            self.clock.step_wall(self.wall_step);
            let next = self.script.lock().unwrap().pop_front().expect("script exhausted");
            match next {
                Ok(metrics) => Ok(Subtest {
                    metrics,
                    artifact: RawArtifact {
                        cycle,
                        direction,
                        path: PathBuf::from("/tmp/unused"),
                        bytes: b"{}".to_vec(),
                    },
                }),
                Err("invoke") => Err(SubtestError::ToolInvocation {
                    direction,
                    reason: "exit status 1".to_string(),
                }),
                Err("storage") => Err(SubtestError::Storage(StorageError::Artifact {
                    path: PathBuf::from("/full/disk"),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "no space left"),
                })),
                Err(_) => Err(SubtestError::MalformedReport {
                    direction,
                    reason: "EOF while parsing".to_string(),
                }),
            }
        }
    }

    #[derive(Default)]
    struct MemoryRecorder {
        rows: Arc<Mutex<Vec<CycleResult>>>,
        fail: bool,
    }

    #[async_trait]
    impl Recorder for MemoryRecorder {
        async fn append(&mut self, result: &CycleResult) -> Result<(), StorageError> {
            if self.fail {
                return Err(StorageError::Append {
                    path: PathBuf::from("/full/disk/results.csv"),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "no space left"),
                });
            }
            self.rows.lock().unwrap().push(result.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryPublisher {
        sent: Arc<Mutex<Vec<u64>>>,
    }

    #[async_trait]
    impl Publisher for MemoryPublisher {
        async fn publish(&self, message: &BusMessage) {
            self.sent.lock().unwrap().push(message.test_number);
        }
    }

    fn tcp(mbps: f64) -> Scripted {
        Ok(DirectionMetrics::Tcp {
            throughput_mbps: mbps,
        })
    }

    struct Harness {
        clock: Arc<ManualClock>,
        rows: Arc<Mutex<Vec<CycleResult>>>,
        sent: Arc<Mutex<Vec<u64>>>,
        calls: Arc<Mutex<Vec<(u64, Direction)>>>,
        orchestrator: Orchestrator,
    }

    fn harness(
        script: Vec<Scripted>,
        cost: Duration,
        interval: Duration,
        fail_storage: bool,
    ) -> Harness {
        harness_with_wall_step(script, cost, interval, fail_storage, chrono::Duration::zero())
    }

    fn harness_with_wall_step(
        script: Vec<Scripted>,
        cost: Duration,
        interval: Duration,
        fail_storage: bool,
        wall_step: chrono::Duration,
    ) -> Harness {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let runner = ScriptedRunner {
            clock: clock.clone(),
            cost,
            wall_step,
            script: Mutex::new(script.into()),
            calls: calls.clone(),
        };
        let recorder = MemoryRecorder {
            fail: fail_storage,
            ..Default::default()
        };
        let rows = recorder.rows.clone();
        let publisher = MemoryPublisher::default();
        let sent = publisher.sent.clone();
        let orchestrator = Orchestrator::new(
            Protocol::Tcp,
            interval,
            Box::new(runner),
            Box::new(recorder),
            clock.clone(),
        )
        .with_publisher(Box::new(publisher));
        Harness {
            clock,
            rows,
            sent,
            calls,
            orchestrator,
        }
    }

    #[tokio::test]
    async fn test_completed_cycle_records_and_publishes() {
        let mut h = harness(
            vec![tcp(500.0), tcp(250.0)],
            Duration::ZERO,
            Duration::from_secs(10),
            false,
        );
        assert_eq!(h.orchestrator.phase(), Phase::Idle);

        let outcome = h.orchestrator.run_cycle().await.unwrap();
        let CycleOutcome::Completed(result) = outcome else {
            panic!("expected completed cycle");
        };
        assert_eq!(result.cycle_number(), 1);
        assert_eq!(result.download().throughput_mbps(), 500.0);
        assert_eq!(result.upload().throughput_mbps(), 250.0);
        assert_eq!(h.rows.lock().unwrap().len(), 1);
        assert_eq!(*h.sent.lock().unwrap(), vec![1]);
        assert_eq!(
            *h.calls.lock().unwrap(),
            vec![(1, Direction::Download), (1, Direction::Upload)]
        );
        // Only the settle delay so far.
        assert_eq!(h.clock.sleeps(), vec![SETTLE_DELAY]);
        assert_eq!(h.orchestrator.phase(), Phase::Sleeping);
    }

    #[tokio::test]
    async fn test_failed_download_abandons_without_upload_or_row() {
        let mut h = harness(
            vec![Err("invoke")],
            Duration::ZERO,
            Duration::from_secs(10),
            false,
        );

        let outcome = h.orchestrator.run_cycle().await.unwrap();
        assert!(matches!(
            outcome,
            CycleOutcome::Abandoned {
                cycle: 1,
                error: SubtestError::ToolInvocation { .. }
            }
        ));
        assert!(h.rows.lock().unwrap().is_empty());
        assert!(h.sent.lock().unwrap().is_empty());
        assert_eq!(*h.calls.lock().unwrap(), vec![(1, Direction::Download)]);
        assert!(h.clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_upload_abandons_cycle() {
        let mut h = harness(
            vec![tcp(10.0), Err("malformed")],
            Duration::ZERO,
            Duration::from_secs(10),
            false,
        );

        let outcome = h.orchestrator.run_cycle().await.unwrap();
        assert!(matches!(
            outcome,
            CycleOutcome::Abandoned {
                error: SubtestError::MalformedReport {
                    direction: Direction::Upload,
                    ..
                },
                ..
            }
        ));
        assert!(h.rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_cycle_is_retried_next_tick() {
        let mut h = harness(
            vec![Err("invoke"), tcp(1.0), tcp(2.0)],
            Duration::ZERO,
            Duration::from_secs(10),
            false,
        );

        h.orchestrator.run(Some(2)).await.unwrap();

        let rows = h.rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].cycle_number(), 2);
        // Full interval after the abandoned cycle, then the settle delay.
        assert_eq!(h.clock.sleeps(), vec![Duration::from_secs(10), SETTLE_DELAY]);
    }

    #[tokio::test]
    async fn test_interval_measured_from_cycle_start() {
        // Each sub-test takes 2s, plus the 1s settle delay: 5s per cycle.
        let mut h = harness(
            vec![tcp(1.0), tcp(1.0), tcp(1.0), tcp(1.0), tcp(1.0), tcp(1.0)],
            Duration::from_secs(2),
            Duration::from_secs(10),
            false,
        );
        let start = h.clock.now();

        h.orchestrator.run(Some(3)).await.unwrap();

        let rows = h.rows.lock().unwrap();
        let starts: Vec<i64> = rows
            .iter()
            .map(|r| (r.started_at() - start).num_seconds())
            .collect();
        assert_eq!(starts, vec![0, 10, 20]);
        assert_eq!(
            h.clock.sleeps(),
            vec![
                SETTLE_DELAY,
                Duration::from_secs(5),
                SETTLE_DELAY,
                Duration::from_secs(5),
                SETTLE_DELAY,
            ]
        );
    }

    #[tokio::test]
    async fn test_wall_clock_step_does_not_skip_sleep() {
        // Every sub-test takes 2s while the wall clock jumps an hour ahead.
        let mut h = harness_with_wall_step(
            vec![tcp(1.0), tcp(1.0), tcp(1.0), tcp(1.0)],
            Duration::from_secs(2),
            Duration::from_secs(10),
            false,
            chrono::Duration::hours(1),
        );

        h.orchestrator.run(Some(2)).await.unwrap();

        assert_eq!(
            h.clock.sleeps(),
            vec![SETTLE_DELAY, Duration::from_secs(5), SETTLE_DELAY]
        );
    }

    #[tokio::test]
    async fn test_wall_clock_step_back_does_not_stretch_sleep() {
        let mut h = harness_with_wall_step(
            vec![tcp(1.0), tcp(1.0), tcp(1.0), tcp(1.0)],
            Duration::from_secs(2),
            Duration::from_secs(10),
            false,
            chrono::Duration::hours(-1),
        );

        h.orchestrator.run(Some(2)).await.unwrap();

        assert_eq!(
            h.clock.sleeps(),
            vec![SETTLE_DELAY, Duration::from_secs(5), SETTLE_DELAY]
        );
    }

    #[tokio::test]
    async fn test_overrunning_cycle_starts_next_immediately() {
        // 2 x 8s + 1s settle = 17s, longer than the 10s interval.
        let mut h = harness(
            vec![tcp(1.0), tcp(1.0), tcp(1.0), tcp(1.0)],
            Duration::from_secs(8),
            Duration::from_secs(10),
            false,
        );
        let start = h.clock.now();

        h.orchestrator.run(Some(2)).await.unwrap();

        let rows = h.rows.lock().unwrap();
        assert_eq!((rows[1].started_at() - start).num_seconds(), 17);
        assert_eq!(h.clock.sleeps(), vec![SETTLE_DELAY, SETTLE_DELAY]);
    }

    #[tokio::test]
    async fn test_cycle_numbers_increase_monotonically() {
        let mut h = harness(
            vec![tcp(1.0), tcp(1.0), Err("malformed"), tcp(1.0), tcp(1.0)],
            Duration::ZERO,
            Duration::ZERO,
            false,
        );

        h.orchestrator.run(Some(3)).await.unwrap();

        let numbers: Vec<u64> = h
            .rows
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.cycle_number())
            .collect();
        assert_eq!(numbers, vec![1, 3]);
        assert_eq!(h.orchestrator.cycle(), 3);
        assert_eq!(h.orchestrator.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_recorder_failure_stops_the_loop() {
        let mut h = harness(
            vec![tcp(1.0), tcp(1.0), tcp(1.0), tcp(1.0)],
            Duration::ZERO,
            Duration::from_secs(10),
            true,
        );

        let err = h.orchestrator.run(None).await.unwrap_err();
        assert!(matches!(err, StorageError::Append { .. }));
        assert_eq!(h.orchestrator.cycle(), 1);
        assert!(h.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_artifact_storage_failure_is_fatal() {
        let mut h = harness(
            vec![Err("storage")],
            Duration::ZERO,
            Duration::from_secs(10),
            false,
        );

        let err = h.orchestrator.run(None).await.unwrap_err();
        assert!(matches!(err, StorageError::Artifact { .. }));
        assert_eq!(h.orchestrator.cycle(), 1);
    }

    #[tokio::test]
    async fn test_runs_without_publisher() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let recorder = MemoryRecorder::default();
        let rows = recorder.rows.clone();
        let runner = ScriptedRunner {
            clock: clock.clone(),
            cost: Duration::ZERO,
            wall_step: chrono::Duration::zero(),
            script: Mutex::new(vec![tcp(3.0), tcp(4.0)].into()),
            calls: Arc::new(Mutex::new(Vec::new())),
        };
        let mut orchestrator = Orchestrator::new(
            Protocol::Tcp,
            Duration::from_secs(1),
            Box::new(runner),
            Box::new(recorder),
            clock,
        );

        orchestrator.run(Some(1)).await.unwrap();
        assert_eq!(rows.lock().unwrap().len(), 1);
    }
}
