//! Instigators (sensors) and their persisted state.
//!
//! An instigator is supplied by the workspace and is immutable for one
//! evaluation cycle. Its `InstigatorState` is owned by the daemon and is only
//! mutated under the state lock.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Where an instigator was loaded from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstigatorOrigin {
    /// Workspace location (one loadable unit of definitions)
    pub location_name: String,

    /// Repository inside the location
    pub repository_name: String,
}

impl InstigatorOrigin {
    pub fn new(location_name: impl Into<String>, repository_name: impl Into<String>) -> Self {
        Self {
            location_name: location_name.into(),
            repository_name: repository_name.into(),
        }
    }

    /// Stable id of the repository, shared by every instigator and run in it
    pub fn repository_selector_id(&self) -> String {
        hash_parts(&[&self.location_name, &self.repository_name])
    }
}

/// Status an instigator starts with before anyone toggles it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultSensorStatus {
    Running,
    #[default]
    Stopped,
}

/// An independently scheduled trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instigator {
    /// Sensor name (unique within its repository)
    pub name: String,

    pub origin: InstigatorOrigin,

    /// Minimum spacing between evaluation attempts
    #[serde(default)]
    pub min_interval_seconds: Option<u64>,

    #[serde(default)]
    pub default_status: DefaultSensorStatus,

    /// Job targeted by run requests that don't name one
    #[serde(default)]
    pub job_name: Option<String>,

    /// Tags applied to every run this instigator creates
    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    /// Opaque evaluator parameters (the command evaluator runs this argv)
    #[serde(default)]
    pub command: Vec<String>,
}

impl Instigator {
    /// Create an instigator with no interval, stopped by default
    pub fn new(name: impl Into<String>, origin: InstigatorOrigin) -> Self {
        Self {
            name: name.into(),
            origin,
            min_interval_seconds: None,
            default_status: DefaultSensorStatus::Stopped,
            job_name: None,
            tags: BTreeMap::new(),
            command: Vec::new(),
        }
    }

    pub fn with_min_interval(mut self, seconds: u64) -> Self {
        self.min_interval_seconds = Some(seconds);
        self
    }

    pub fn with_default_status(mut self, status: DefaultSensorStatus) -> Self {
        self.default_status = status;
        self
    }

    pub fn with_job_name(mut self, job_name: impl Into<String>) -> Self {
        self.job_name = Some(job_name.into());
        self
    }

    /// Id of the instigator's origin (location + repository + name)
    pub fn origin_id(&self) -> String {
        hash_parts(&[
            "origin",
            &self.origin.location_name,
            &self.origin.repository_name,
            &self.name,
        ])
    }

    /// Id used to key persisted state and ticks
    pub fn selector_id(&self) -> String {
        hash_parts(&[
            &self.origin.location_name,
            &self.origin.repository_name,
            &self.name,
        ])
    }

    /// Resolve the effective state, falling back to the declared default
    pub fn current_status(&self, stored: Option<&InstigatorState>) -> InstigatorStatus {
        match stored {
            Some(state) => state.status,
            None => match self.default_status {
                DefaultSensorStatus::Running => InstigatorStatus::AutomaticallyRunning,
                DefaultSensorStatus::Stopped => InstigatorStatus::Stopped,
            },
        }
    }

    /// Fresh state for an instigator that is running by default
    pub fn initial_state(&self) -> InstigatorState {
        InstigatorState {
            origin: self.origin.clone(),
            name: self.name.clone(),
            selector_id: self.selector_id(),
            status: InstigatorStatus::AutomaticallyRunning,
            data: Some(SensorData {
                min_interval_seconds: self.min_interval_seconds,
                ..Default::default()
            }),
        }
    }
}

/// Whether the daemon should evaluate an instigator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstigatorStatus {
    Running,
    Stopped,
    AutomaticallyRunning,
}

impl InstigatorStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running | Self::AutomaticallyRunning)
    }
}

/// Persisted bookkeeping for one instigator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstigatorState {
    pub origin: InstigatorOrigin,

    /// Instigator name
    pub name: String,

    pub selector_id: String,

    pub status: InstigatorStatus,

    #[serde(default)]
    pub data: Option<SensorData>,
}

impl InstigatorState {
    /// Replace the sensor data, keeping identity and status
    pub fn with_data(mut self, data: SensorData) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_status(mut self, status: InstigatorStatus) -> Self {
        self.status = status;
        self
    }

    pub fn cursor(&self) -> Option<&str> {
        self.data.as_ref().and_then(|d| d.cursor.as_deref())
    }

    pub fn last_run_key(&self) -> Option<&str> {
        self.data.as_ref().and_then(|d| d.last_run_key.as_deref())
    }
}

/// Cursor and timing data owned by the tick evaluator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorData {
    /// Start of the last finished tick
    #[serde(default)]
    pub last_tick_timestamp: Option<DateTime<Utc>>,

    /// Start of the last claimed evaluation window
    #[serde(default)]
    pub last_tick_start_timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub last_run_key: Option<String>,

    /// Opaque progress marker owned by the trigger logic
    #[serde(default)]
    pub cursor: Option<String>,

    #[serde(default)]
    pub min_interval_seconds: Option<u64>,
}

/// Hash a list of identity parts into a 40-char hex id
fn hash_parts(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..20])
}

/// Short hash of a name, used where the name itself must not leave the process
pub fn hash_name(name: &str) -> String {
    hash_parts(&[name])[..16].to_string()
}
