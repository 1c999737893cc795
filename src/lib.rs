//! sensord - Sensor tick daemon
//!
//! Periodically evaluates user-defined sensors and turns what they return
//! into persisted runs, exactly once per run key.
//!
//! # Architecture
//!
//! Every evaluation is recorded as a tick:
//! - A tick is created STARTED before the sensor is evaluated
//! - Dynamic partitions are mutated before any run is created
//! - Runs are deduplicated by run key, so a crashed tick can be retried
//!   without creating duplicate runs
//! - The sensor's cursor only advances once the tick finishes
//!
//! # Modules
//!
//! - `adapters`: Sensor evaluation and run execution backends
//! - `core`: Throttling, the tick engine, and the daemon loop
//! - `domain`: Data structures (Instigator, Tick, Run)
//! - `store`: Persistence traits with in-memory and JSONL implementations
//! - `workspace`: Where sensor definitions come from
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Start a sensor and run the daemon
//! sensord start new_files
//! sensord run
//!
//! # Inspect what happened
//! sensord ticks new_files
//! sensord runs --sensor new_files
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod store;
pub mod workspace;

// Re-export main types at crate root for convenience
pub use core::{EngineError, SensorDaemon, TickEngine};
pub use domain::{Instigator, InstigatorState, Run, RunRequest, SensorExecutionData, Tick, TickStatus};
pub use store::{FileStorage, MemoryStorage, Storage};
pub use workspace::{StaticWorkspace, WorkspaceSnapshot, WorkspaceSource, YamlWorkspace};
