//! Domain types for the sensor daemon.
//!
//! This module contains the core data structures:
//! - Instigator: a sensor definition and its persisted state
//! - Tick: one evaluation attempt
//! - Run: persisted work, and the requests that create it
//! - Partitions: dynamic partition mutations
//! - Evaluation: what a sensor evaluation receives and returns

pub mod evaluation;
pub mod instigator;
pub mod partitions;
pub mod run;
pub mod tick;

// Re-export commonly used types
pub use evaluation::{EvaluationContext, RunReaction, SensorExecutionData};
pub use instigator::{
    hash_name, DefaultSensorStatus, Instigator, InstigatorOrigin, InstigatorState,
    InstigatorStatus, SensorData,
};
pub use partitions::{DynamicPartitionsRequest, DynamicPartitionsRequestResult};
pub use run::{NewRun, Run, RunEvent, RunRequest, RunStatus, RUN_KEY_TAG, SENSOR_NAME_TAG};
pub use tick::{ErrorInfo, Tick, TickStatus};
