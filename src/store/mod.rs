//! Storage interfaces consumed by the daemon.
//!
//! The engine never owns persistence; it reads and writes through these
//! traits. Two implementations ship with the crate:
//! - `MemoryStorage`: process-local, used for embedding and tests
//! - `FileStorage`: append-only JSONL logs under the sensord home

pub mod file;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{InstigatorState, Run, RunEvent, RunStatus, Tick, TickStatus};

pub use file::FileStorage;
pub use memory::MemoryStorage;

/// Errors raised by storage implementations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Instigator state not found: {0}")]
    StateNotFound(String),

    #[error("Tick not found: {0}")]
    TickNotFound(Uuid),

    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error on {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Tag-based run filter: a run matches when, for every tag key, its value is
/// one of the listed values
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunsFilter {
    pub tags: BTreeMap<String, Vec<String>>,
}

impl RunsFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tag_values<I, S>(mut self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .insert(key.into(), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn matches(&self, run: &Run) -> bool {
        self.tags.iter().all(|(key, values)| {
            run.tags
                .get(key)
                .map(|value| values.iter().any(|v| v == value))
                .unwrap_or(false)
        })
    }
}

/// Persisted per-instigator state
#[async_trait]
pub trait InstigatorStore: Send + Sync {
    async fn all_instigator_states(&self) -> Result<Vec<InstigatorState>, StoreError>;

    async fn get_instigator_state(
        &self,
        selector_id: &str,
    ) -> Result<Option<InstigatorState>, StoreError>;

    async fn add_instigator_state(
        &self,
        state: InstigatorState,
    ) -> Result<InstigatorState, StoreError>;

    /// Replace an existing state; fails if none is stored
    async fn update_instigator_state(
        &self,
        state: InstigatorState,
    ) -> Result<InstigatorState, StoreError>;
}

/// Tick records
#[async_trait]
pub trait TickStore: Send + Sync {
    async fn create_tick(&self, tick: Tick) -> Result<Tick, StoreError>;

    async fn update_tick(&self, tick: &Tick) -> Result<(), StoreError>;

    /// Ticks of one instigator, newest first
    async fn get_ticks(
        &self,
        selector_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Tick>, StoreError>;

    /// Delete ticks older than `before` with one of `statuses`; returns the count
    async fn purge_ticks(
        &self,
        selector_id: &str,
        before: DateTime<Utc>,
        statuses: &[TickStatus],
    ) -> Result<usize, StoreError>;
}

/// Run records
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn add_run(&self, run: Run) -> Result<Run, StoreError>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, StoreError>;

    /// Runs matching `filter`, in creation order
    async fn get_runs(&self, filter: &RunsFilter) -> Result<Vec<Run>, StoreError>;

    async fn update_run_status(&self, run_id: Uuid, status: RunStatus)
        -> Result<Run, StoreError>;

    async fn report_run_event(&self, run_id: Uuid, message: &str) -> Result<(), StoreError>;

    async fn get_run_events(&self, run_id: Uuid) -> Result<Vec<RunEvent>, StoreError>;
}

/// Dynamic partition registry
#[async_trait]
pub trait PartitionStore: Send + Sync {
    async fn has_dynamic_partition(
        &self,
        partitions_def_name: &str,
        partition_key: &str,
    ) -> Result<bool, StoreError>;

    async fn get_dynamic_partitions(
        &self,
        partitions_def_name: &str,
    ) -> Result<Vec<String>, StoreError>;

    /// Insert keys; keys already present are left alone
    async fn add_dynamic_partitions(
        &self,
        partitions_def_name: &str,
        partition_keys: &[String],
    ) -> Result<(), StoreError>;

    async fn delete_dynamic_partition(
        &self,
        partitions_def_name: &str,
        partition_key: &str,
    ) -> Result<(), StoreError>;
}

/// Small key/value store for daemon-wide flags
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn get_cursor_value(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_cursor_value(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// Everything the daemon needs from storage
pub trait Storage: InstigatorStore + TickStore + RunStore + PartitionStore + CursorStore {}

impl<T> Storage for T where T: InstigatorStore + TickStore + RunStore + PartitionStore + CursorStore
{}
