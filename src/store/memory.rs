//! In-process storage backed by `tokio::sync::RwLock` maps.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    CursorStore, InstigatorStore, PartitionStore, RunStore, RunsFilter, StoreError, TickStore,
};
use crate::domain::{InstigatorState, Run, RunEvent, RunStatus, Tick, TickStatus};

#[derive(Debug, Default)]
struct Inner {
    states: HashMap<String, InstigatorState>,
    /// Insertion order is tick creation order
    ticks: Vec<Tick>,
    runs: Vec<Run>,
    run_events: Vec<RunEvent>,
    partitions: HashMap<String, Vec<String>>,
    cursors: HashMap<String, String>,
}

/// Storage that lives as long as the process
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstigatorStore for MemoryStorage {
    async fn all_instigator_states(&self) -> Result<Vec<InstigatorState>, StoreError> {
        let inner = self.inner.read().await;
        let mut states: Vec<InstigatorState> = inner.states.values().cloned().collect();
        states.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(states)
    }

    async fn get_instigator_state(
        &self,
        selector_id: &str,
    ) -> Result<Option<InstigatorState>, StoreError> {
        Ok(self.inner.read().await.states.get(selector_id).cloned())
    }

    async fn add_instigator_state(
        &self,
        state: InstigatorState,
    ) -> Result<InstigatorState, StoreError> {
        self.inner
            .write()
            .await
            .states
            .insert(state.selector_id.clone(), state.clone());
        Ok(state)
    }

    async fn update_instigator_state(
        &self,
        state: InstigatorState,
    ) -> Result<InstigatorState, StoreError> {
        let mut inner = self.inner.write().await;
        match inner.states.get_mut(&state.selector_id) {
            Some(existing) => {
                *existing = state.clone();
                Ok(state)
            }
            None => Err(StoreError::StateNotFound(state.selector_id)),
        }
    }
}

#[async_trait]
impl TickStore for MemoryStorage {
    async fn create_tick(&self, tick: Tick) -> Result<Tick, StoreError> {
        self.inner.write().await.ticks.push(tick.clone());
        Ok(tick)
    }

    async fn update_tick(&self, tick: &Tick) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let existing = inner
            .ticks
            .iter_mut()
            .find(|t| t.tick_id == tick.tick_id)
            .ok_or(StoreError::TickNotFound(tick.tick_id))?;
        *existing = tick.clone();
        Ok(())
    }

    async fn get_ticks(
        &self,
        selector_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Tick>, StoreError> {
        let inner = self.inner.read().await;
        let ticks = inner
            .ticks
            .iter()
            .rev()
            .filter(|t| t.selector_id == selector_id)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(ticks)
    }

    async fn purge_ticks(
        &self,
        selector_id: &str,
        before: DateTime<Utc>,
        statuses: &[TickStatus],
    ) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        let before_len = inner.ticks.len();
        inner.ticks.retain(|t| {
            !(t.selector_id == selector_id && t.timestamp < before && statuses.contains(&t.status))
        });
        Ok(before_len - inner.ticks.len())
    }
}

#[async_trait]
impl RunStore for MemoryStorage {
    async fn add_run(&self, run: Run) -> Result<Run, StoreError> {
        self.inner.write().await.runs.push(run.clone());
        Ok(run)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.runs.iter().find(|r| r.run_id == run_id).cloned())
    }

    async fn get_runs(&self, filter: &RunsFilter) -> Result<Vec<Run>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .runs
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
    ) -> Result<Run, StoreError> {
        let mut inner = self.inner.write().await;
        let run = inner
            .runs
            .iter_mut()
            .find(|r| r.run_id == run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;
        run.status = status;
        Ok(run.clone())
    }

    async fn report_run_event(&self, run_id: Uuid, message: &str) -> Result<(), StoreError> {
        self.inner.write().await.run_events.push(RunEvent {
            run_id,
            timestamp: Utc::now(),
            message: message.to_string(),
        });
        Ok(())
    }

    async fn get_run_events(&self, run_id: Uuid) -> Result<Vec<RunEvent>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .run_events
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PartitionStore for MemoryStorage {
    async fn has_dynamic_partition(
        &self,
        partitions_def_name: &str,
        partition_key: &str,
    ) -> Result<bool, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .partitions
            .get(partitions_def_name)
            .map(|keys| keys.iter().any(|k| k == partition_key))
            .unwrap_or(false))
    }

    async fn get_dynamic_partitions(
        &self,
        partitions_def_name: &str,
    ) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .partitions
            .get(partitions_def_name)
            .cloned()
            .unwrap_or_default())
    }

    async fn add_dynamic_partitions(
        &self,
        partitions_def_name: &str,
        partition_keys: &[String],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let keys = inner
            .partitions
            .entry(partitions_def_name.to_string())
            .or_default();
        let mut present: BTreeSet<String> = keys.iter().cloned().collect();
        for key in partition_keys {
            if present.insert(key.clone()) {
                keys.push(key.clone());
            }
        }
        Ok(())
    }

    async fn delete_dynamic_partition(
        &self,
        partitions_def_name: &str,
        partition_key: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(keys) = inner.partitions.get_mut(partitions_def_name) {
            keys.retain(|k| k != partition_key);
        }
        Ok(())
    }
}

#[async_trait]
impl CursorStore for MemoryStorage {
    async fn get_cursor_value(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.read().await.cursors.get(key).cloned())
    }

    async fn set_cursor_value(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .cursors
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
