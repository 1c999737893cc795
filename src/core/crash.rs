//! Debug crash points.
//!
//! Lets tests abort a tick at a named point, leaving storage exactly as a real
//! process crash would, so recovery on the next tick can be exercised.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::EngineError;

/// Where in a tick a simulated crash can fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CrashPoint {
    /// Right after the STARTED tick is persisted
    TickCreated,
    /// After the tick is created, before evaluation
    TickHeld,
    /// After a run is created, before it is submitted
    RunCreated,
    /// After a run is submitted
    RunLaunched,
}

impl std::fmt::Display for CrashPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::TickCreated => "TICK_CREATED",
            Self::TickHeld => "TICK_HELD",
            Self::RunCreated => "RUN_CREATED",
            Self::RunLaunched => "RUN_LAUNCHED",
        };
        f.write_str(name)
    }
}

/// Crash points armed per instigator name
#[derive(Debug, Clone, Default)]
pub struct DebugCrashFlags {
    armed: HashMap<String, HashSet<CrashPoint>>,
}

impl DebugCrashFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, instigator_name: impl Into<String>, point: CrashPoint) -> Self {
        self.armed
            .entry(instigator_name.into())
            .or_default()
            .insert(point);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    /// Fail with `SimulatedCrash` if `point` is armed for the instigator
    pub fn check(&self, instigator_name: &str, point: CrashPoint) -> Result<(), EngineError> {
        match self.armed.get(instigator_name) {
            Some(points) if points.contains(&point) => Err(EngineError::SimulatedCrash(point)),
            _ => Ok(()),
        }
    }
}
