//! Runs and the requests that create them.
//!
//! A Run is a persisted unit of submitted work. A RunRequest is the ephemeral
//! candidate a sensor evaluation produces; the daemon turns it into at most one
//! Run per (instigator, run key).

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::instigator::InstigatorOrigin;

/// Tag carrying the idempotency key of a sensor-created run
pub const RUN_KEY_TAG: &str = "sensord/run_key";

/// Tag naming the sensor that created a run
pub const SENSOR_NAME_TAG: &str = "sensord/sensor_name";

/// A persisted execution record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,

    pub job_name: String,

    #[serde(default)]
    pub run_config: serde_json::Value,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    pub status: RunStatus,

    /// Repository the run was launched from (absent on legacy runs)
    #[serde(default)]
    pub origin: Option<InstigatorOrigin>,

    #[serde(default)]
    pub asset_selection: Option<BTreeSet<String>>,

    pub created_at: DateTime<Utc>,
}

impl Run {
    /// Materialize creation parameters into a NOT_STARTED run
    pub fn from_new_run(new_run: NewRun) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            job_name: new_run.job_name,
            run_config: new_run.run_config,
            tags: new_run.tags,
            status: RunStatus::NotStarted,
            origin: new_run.origin,
            asset_selection: new_run.asset_selection,
            created_at: Utc::now(),
        }
    }

    pub fn run_key(&self) -> Option<&str> {
        self.tags.get(RUN_KEY_TAG).map(String::as_str)
    }

    pub fn sensor_name(&self) -> Option<&str> {
        self.tags.get(SENSOR_NAME_TAG).map(String::as_str)
    }
}

/// Engine event attached to an existing run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Lifecycle of a run as far as the daemon cares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created but never handed to the backend
    NotStarted,
    Queued,
    Starting,
    Started,
    Success,
    Failure,
    Canceling,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Queued => "QUEUED",
            Self::Starting => "STARTING",
            Self::Started => "STARTED",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Canceling => "CANCELING",
            Self::Canceled => "CANCELED",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Creation parameters handed to the execution backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRun {
    pub job_name: String,
    pub run_config: serde_json::Value,
    pub tags: BTreeMap<String, String>,
    pub origin: Option<InstigatorOrigin>,
    pub asset_selection: Option<BTreeSet<String>>,
}

/// A candidate unit of work produced by a sensor evaluation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Idempotency token, scoped to the requesting instigator
    #[serde(default)]
    pub run_key: Option<String>,

    #[serde(default)]
    pub run_config: serde_json::Value,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    #[serde(default)]
    pub asset_selection: Option<BTreeSet<String>>,

    /// Target job (falls back to the instigator's job)
    #[serde(default)]
    pub job_name: Option<String>,
}

impl RunRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_run_key(mut self, run_key: impl Into<String>) -> Self {
        self.run_key = Some(run_key.into());
        self
    }

    pub fn with_job_name(mut self, job_name: impl Into<String>) -> Self {
        self.job_name = Some(job_name.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_asset_selection<I, S>(mut self, assets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.asset_selection = Some(assets.into_iter().map(Into::into).collect());
        self
    }
}
