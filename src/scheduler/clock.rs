//! Time source for the cycle loop.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Wall clock plus sleep, injectable so cadence can be tested without
/// real delays.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Wall-clock time, used to label results.
    fn now(&self) -> DateTime<Utc>;
    /// Monotonic reading, used to measure elapsed time. Unaffected by
    /// wall-clock steps.
    fn instant(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

/// Real time: `Utc::now`, `Instant::now` and `tokio::time::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock. Time only moves through [`ManualClock::advance`] or
/// [`Clock::sleep`], which returns immediately and records the request.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<ManualState>,
}

#[derive(Debug)]
struct ManualState {
    now: DateTime<Utc>,
    origin: Instant,
    elapsed: Duration,
    sleeps: Vec<Duration>,
}

impl ManualState {
    fn pass(&mut self, by: Duration) {
        shift(&mut self.now, by);
        self.elapsed = self.elapsed.saturating_add(by);
    }
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(ManualState {
                now: start,
                origin: Instant::now(),
                elapsed: Duration::ZERO,
                sleeps: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move time forward without recording a sleep (e.g. work being done).
    pub fn advance(&self, by: Duration) {
        self.lock().pass(by);
    }

    /// Step the wall clock alone, as an NTP correction would.
    pub fn step_wall(&self, delta: chrono::Duration) {
        let mut state = self.lock();
        if let Some(stepped) = state.now.checked_add_signed(delta) {
            state.now = stepped;
        }
    }

    /// Every sleep requested so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.lock().sleeps.clone()
    }
}

fn shift(now: &mut DateTime<Utc>, by: Duration) {
    if let Some(later) = chrono::Duration::from_std(by)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
    {
        *now = later;
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.lock().now
    }

    fn instant(&self) -> Instant {
        let state = self.lock();
        state.origin.checked_add(state.elapsed).unwrap_or(state.origin)
    }

    async fn sleep(&self, duration: Duration) {
        let mut state = self.lock();
        state.sleeps.push(duration);
        state.pass(duration);
    }
}
