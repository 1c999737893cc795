//! Adapter interfaces for external systems.
//!
//! The daemon reaches trigger logic and the execution backend only through
//! these traits:
//! - `SensorEvaluator`: decides what a sensor wants this tick
//! - `ExecutionBackend`: creates and launches runs

pub mod command;
pub mod coordinator;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::{EvaluationContext, Instigator, NewRun, Run, SensorExecutionData};

pub use command::CommandEvaluator;
pub use coordinator::QueuedRunCoordinator;

/// Trait for sensor evaluation backends
#[async_trait]
pub trait SensorEvaluator: Send + Sync {
    /// Human-readable evaluator name
    fn name(&self) -> &str;

    /// Evaluate one instigator.
    ///
    /// Returning `EngineError::Interrupted` (wrapped in the `anyhow::Error`)
    /// stops the tick without marking it failed.
    async fn evaluate(
        &self,
        instigator: &Instigator,
        context: &EvaluationContext,
    ) -> Result<SensorExecutionData>;
}

/// Trait for run creation and launch
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Persist a NOT_STARTED run
    async fn create_run(&self, new_run: NewRun) -> Result<Run>;

    /// Hand a created run to the executor
    async fn submit_run(&self, run_id: Uuid) -> Result<()>;
}
