//! Cycle scheduling: the orchestrator state machine and its clock.

pub mod clock;
pub mod engine;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::engine::{CycleOutcome, Orchestrator, Phase, SETTLE_DELAY};
