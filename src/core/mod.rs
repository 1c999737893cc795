//! Core daemon logic.
//!
//! This module contains:
//! - Clock: injectable time source
//! - Throttle: minimum-interval gate and the evaluation-window claim
//! - Context: tick bookkeeping and the single write per tick
//! - Partitions / Runs: the side effects an evaluation may request
//! - Evaluator: one tick end to end
//! - Daemon: the polling loop that drives every instigator

pub mod clock;
pub mod context;
pub mod crash;
pub mod daemon;
pub mod evaluator;
pub mod heartbeat;
pub mod partitions;
pub mod runs;
pub mod throttle;

use thiserror::Error;

use crate::store::StoreError;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{Services, TickContext};
pub use crash::{CrashPoint, DebugCrashFlags};
pub use daemon::{is_paused, set_paused, spawn_daemon, SensorDaemon, SENSOR_DAEMON_PAUSED_KEY};
pub use evaluator::TickEngine;
pub use heartbeat::{Heartbeat, Progress, TickStep};
pub use partitions::apply_partitions_request;
pub use runs::{build_new_run, fetch_existing_runs, RunOutcome, RunSubmitter};
pub use throttle::{is_under_min_interval, try_claim, Claim, StateLock};

/// Errors that escape a tick or the daemon loop
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Evaluation was deliberately stopped; not a failure
    #[error("Evaluation interrupted")]
    Interrupted,

    #[error("Simulated crash at {0}")]
    SimulatedCrash(CrashPoint),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
